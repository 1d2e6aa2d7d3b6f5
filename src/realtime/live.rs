//! The in-memory live event list fed by the realtime socket.

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::intensity::INVESTIGATING;
use crate::telegram::fields::{self, first_text};
use crate::telegram::{Depth, EarthquakeInfo, ReportKind, SourceReport};

/// Per-event disclosure state.  Ordered: `Confirmed` never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Confirmation {
    Unconfirmed,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LiveIntensity {
    Investigating,
    Observed(String),
}

impl fmt::Display for LiveIntensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Investigating => f.write_str(INVESTIGATING),
            Self::Observed(label) => f.write_str(label),
        }
    }
}

/// What one telegram says about its event.
#[derive(Debug, Clone, PartialEq)]
pub struct Disclosure {
    pub info: EarthquakeInfo,
    pub confirmation: Confirmation,
    pub intensity: LiveIntensity,
    pub test: bool,
}

const COMBINED_MARKERS: &[&str] = &["震源・震度"];
const FINAL_MARKERS: &[&str] = &["確定", "最終"];

/// Classify one decoded telegram.  `None` when no event id can be derived.
pub fn disclose(report: &SourceReport) -> Option<Disclosure> {
    let info = report.extract()?;
    let item = &report.item;
    let info_kind = first_text(&report.tree, fields::INFO_KIND).or_else(|| item.head.info_kind.clone());
    let title = info.title.clone().unwrap_or_default();
    let kind_text = info_kind.unwrap_or_default();
    let subtype = info.info_subtype.clone().unwrap_or_default();

    let combined = COMBINED_MARKERS
        .iter()
        .any(|m| title.contains(m) || kind_text.contains(m));
    let final_revision = FINAL_MARKERS
        .iter()
        .any(|m| kind_text.contains(m) || subtype.contains(m) || title.contains(m));
    let confirmation = if item.kind == ReportKind::Detailed || combined || final_revision {
        Confirmation::Confirmed
    } else {
        Confirmation::Unconfirmed
    };

    let intensity = match (&item.kind, &info.max_intensity) {
        (ReportKind::Hypocenter, _) | (_, None) => LiveIntensity::Investigating,
        (_, Some(label)) => LiveIntensity::Observed(label.clone()),
    };

    Some(Disclosure {
        info,
        confirmation,
        intensity,
        test: item.test,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEvent {
    pub event_id: String,
    pub confirmation: Confirmation,
    pub max_intensity: LiveIntensity,
    pub title: Option<String>,
    pub epicenter: Option<String>,
    pub magnitude: Option<f64>,
    pub depth: Option<Depth>,
    pub occurred_at: Option<DateTime<FixedOffset>>,
    pub test: bool,
    pub updated_at: DateTime<Utc>,
    /// Highest serial seen per report kind; serials restart per kind.
    #[serde(skip)]
    serials: HashMap<ReportKind, i64>,
}

impl LiveEvent {
    fn new(d: &Disclosure, now: DateTime<Utc>) -> Self {
        let mut event = Self {
            event_id: d.info.event_id.clone(),
            confirmation: d.confirmation,
            max_intensity: d.intensity.clone(),
            title: None,
            epicenter: None,
            magnitude: None,
            depth: None,
            occurred_at: None,
            test: d.test,
            updated_at: now,
            serials: HashMap::new(),
        };
        event.merge(d, now);
        event
    }

    fn merge(&mut self, d: &Disclosure, now: DateTime<Utc>) {
        let info = &d.info;
        self.confirmation = self.confirmation.max(d.confirmation);
        if let LiveIntensity::Observed(_) = d.intensity {
            self.max_intensity = d.intensity.clone();
        }
        if info.title.is_some() {
            self.title = info.title.clone();
        }
        if info.epicenter.is_some() {
            self.epicenter = info.epicenter.clone();
        }
        if info.magnitude.is_some() {
            self.magnitude = info.magnitude;
        }
        if info.depth.is_some() {
            self.depth = info.depth.clone();
        }
        if info.occurred_at.is_some() {
            self.occurred_at = info.occurred_at;
        }
        self.test = d.test;
        self.updated_at = now;
        self.serials.insert(info.report_kind, info.serial_no);
    }
}

impl fmt::Display for LiveEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}{}] {} 震度{} {} M{} {}",
            match self.confirmation {
                Confirmation::Confirmed => "確定",
                Confirmation::Unconfirmed => "速報",
            },
            if self.test { "/TEST" } else { "" },
            self.event_id,
            self.max_intensity,
            self.epicenter.as_deref().unwrap_or("震源調査中"),
            self.magnitude
                .map(|m| format!("{m:.1}"))
                .unwrap_or_else(|| "-".into()),
            self.depth.as_ref().map(|d| d.to_string()).unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Inserted,
    Updated,
    /// Older serial than one already applied; ignored.
    Stale,
}

/// Live list, newest first, bounded.
#[derive(Debug, Clone)]
pub struct LiveEvents {
    cap: usize,
    events: Vec<LiveEvent>,
}

impl LiveEvents {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            events: Vec::new(),
        }
    }

    pub fn apply(&mut self, d: &Disclosure, now: DateTime<Utc>) -> Change {
        let info = &d.info;
        let Some(pos) = self.events.iter().position(|e| e.event_id == info.event_id) else {
            self.events.insert(0, LiveEvent::new(d, now));
            self.events.truncate(self.cap);
            return Change::Inserted;
        };

        let seen = self.events[pos].serials.get(&info.report_kind).copied();
        if seen.is_some_and(|s| info.serial_no < s) {
            return Change::Stale;
        }
        let mut event = self.events.remove(pos);
        event.merge(d, now);
        self.events.insert(0, event);
        Change::Updated
    }

    pub fn get(&self, event_id: &str) -> Option<&LiveEvent> {
        self.events.iter().find(|e| e.event_id == event_id)
    }

    pub fn events(&self) -> &[LiveEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
