//! Field-resolution rules over a parsed report tree.
//!
//! Every logical field has an ordered list of paths; the first path that
//! yields a usable value wins and `None` means the field is absent.  JMA-XML
//! paths (as produced by [`super::xml_tree`]) come first, the provider's
//! JSON-schema paths after.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use super::{Depth, PrefectureObservation, RawTelegramItem};
use crate::intensity;

// ───────────────────────────── Path rules ────────────────────────────────

pub const EVENT_ID: &[&str] = &["Report.Head.EventID", "eventId"];
pub const SERIAL: &[&str] = &["Report.Head.Serial", "serialNo"];
pub const TITLE: &[&str] = &["Report.Head.Title", "Report.Control.Title", "title"];
pub const INFO_TYPE: &[&str] = &["Report.Head.InfoType", "infoType"];
pub const INFO_KIND: &[&str] = &["Report.Head.InfoKind", "infoKind"];
pub const REPORT_TIME: &[&str] = &["Report.Head.ReportDateTime", "reportDateTime"];
pub const OCCURRED_TIME: &[&str] = &[
    "Report.Body.Earthquake.OriginTime",
    "body.earthquake.originTime",
    "Report.Body.Earthquake.ArrivalTime",
    "body.earthquake.arrivalTime",
    "Report.Head.TargetDateTime",
    "targetDateTime",
];
pub const HYPOCENTER: &[&str] = &["Report.Body.Earthquake.Hypocenter", "body.earthquake.hypocenter"];
pub const MAGNITUDE: &[&str] = &["Report.Body.Earthquake.Magnitude", "body.earthquake.magnitude"];
pub const OBSERVATION: &[&str] = &["Report.Body.Intensity.Observation", "body.intensity"];
pub const HEADLINE_INFORMATION: &[&str] = &["Report.Head.Headline.Information"];

const EPICENTER_NAME: &[&str] = &["Area.Name", "name"];
const COORDINATE: &[&str] = &["Area.Coordinate", "coordinate"];
const MAX_INT: &[&str] = &["MaxInt", "maxInt"];
const PREFS: &[&str] = &["Pref", "prefectures"];
const NAME: &[&str] = &["Name", "name"];

/// Qualitative depth phrases the provider writes instead of a number.
const DEPTH_CONDITIONS: &[&str] = &["ごく浅い", "７００ｋｍ以上", "700km以上", "不明"];

// ───────────────────────────── Tree access ───────────────────────────────

/// Walk a dotted path.  Arrays met on the way resolve to their first element.
pub fn at<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(tree, |node, seg| {
        let node = match node {
            Value::Array(items) => items.first()?,
            other => other,
        };
        node.get(seg)
    })
}

/// Text content of a node: trimmed, non-empty.
pub fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("#text").and_then(text),
        Value::Array(items) => items.first().and_then(text),
        _ => None,
    }
}

pub fn first_node<'a>(tree: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths.iter().find_map(|p| at(tree, p)).filter(|v| !v.is_null())
}

pub fn first_text(tree: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|p| at(tree, p).and_then(text))
}

/// A node that may be a single element or a list of them.
pub fn items(v: Option<&Value>) -> Vec<&Value> {
    match v {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(list)) => list.iter().collect(),
        Some(other) => vec![other],
    }
}

pub fn parse_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw.trim()).ok()
}

// ───────────────────────────── Resolvers ─────────────────────────────────

/// Envelope head event id, then report head event id, then envelope id.
pub fn resolve_event_id(item: &RawTelegramItem, tree: &Value) -> Option<String> {
    item.head
        .event_id
        .clone()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| first_text(tree, EVENT_ID))
        .or_else(|| Some(item.id.trim().to_string()).filter(|s| !s.is_empty()))
}

/// Report serial, then envelope serial; `1` when neither parses.
pub fn resolve_serial(item: &RawTelegramItem, tree: &Value) -> i64 {
    [first_text(tree, SERIAL), item.head.serial.clone()]
        .into_iter()
        .flatten()
        .find_map(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(1)
}

pub fn resolve_time(tree: &Value, paths: &[&str]) -> Option<DateTime<FixedOffset>> {
    paths
        .iter()
        .find_map(|p| at(tree, p).and_then(text).and_then(|s| parse_time(&s)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hypocenter {
    pub epicenter: Option<String>,
    pub magnitude: Option<f64>,
    pub depth: Option<Depth>,
}

/// Present only when the report carries a hypocenter block.
pub fn resolve_hypocenter(tree: &Value) -> Option<Hypocenter> {
    let hypo = first_node(tree, HYPOCENTER)?;
    Some(Hypocenter {
        epicenter: first_text(hypo, EPICENTER_NAME),
        magnitude: resolve_magnitude(tree),
        depth: resolve_depth(hypo),
    })
}

/// Magnitude as a finite float; `NaN` placeholders and labels are absent.
pub fn resolve_magnitude(tree: &Value) -> Option<f64> {
    let node = first_node(tree, MAGNITUDE)?;
    let raw = text(node).or_else(|| node.get("value").and_then(text))?;
    raw.parse::<f64>().ok().filter(|m| m.is_finite())
}

/// Depth from a hypocenter block: a condition label when the provider gives
/// one, otherwise metres (XML coordinate) or kilometres (JSON) as whole km.
pub fn resolve_depth(hypo: &Value) -> Option<Depth> {
    if let Some(depth) = at(hypo, "coordinate.depth") {
        if let Some(condition) = depth.get("condition").and_then(text) {
            return Some(Depth::Condition(condition));
        }
        let value: f64 = depth.get("value").and_then(text)?.parse().ok()?;
        let unit = depth.get("unit").and_then(text).unwrap_or_default();
        let km = if unit.eq_ignore_ascii_case("km") {
            value
        } else {
            value / 1000.0
        };
        return Some(Depth::Km(km.abs().round() as i64));
    }

    let coord = first_node(hypo, COORDINATE)?;
    if let Some(condition) = coord.get("@condition").and_then(text) {
        return Some(Depth::Condition(condition));
    }
    if let Some(desc) = coord.get("@description").and_then(text) {
        if let Some(label) = DEPTH_CONDITIONS.iter().find(|l| desc.contains(*l)) {
            return Some(Depth::Condition((*label).to_string()));
        }
    }
    let meters = coordinate_depth_meters(&text(coord)?)?;
    Some(Depth::Km((meters.abs() / 1000.0).round() as i64))
}

/// Third component of an ISO 6709 string such as `+37.5+137.3-10000/`.
fn coordinate_depth_meters(raw: &str) -> Option<f64> {
    let body = raw.trim().trim_end_matches('/');
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in body.chars() {
        if (c == '+' || c == '-') && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts.get(2)?.parse().ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub max_intensity: Option<String>,
    pub prefectures: Vec<PrefectureObservation>,
}

/// Intensity observation block.  Prefecture entries missing a name or an
/// intensity are dropped.
pub fn resolve_observation(tree: &Value) -> Option<Observation> {
    let obs = first_node(tree, OBSERVATION)?;
    let prefectures: Vec<PrefectureObservation> = items(first_node(obs, PREFS))
        .into_iter()
        .filter_map(|pref| {
            let name = first_text(pref, NAME)?;
            let max = first_text(pref, MAX_INT)?;
            Some(PrefectureObservation {
                name,
                max_intensity: intensity::normalize(&max),
            })
        })
        .collect();
    let max_intensity = first_text(obs, MAX_INT)
        .map(|m| intensity::normalize(&m))
        .or_else(|| strongest(prefectures.iter().map(|p| p.max_intensity.as_str())));
    Some(Observation {
        max_intensity,
        prefectures,
    })
}

/// One area line of a quick-intensity headline.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaIntensity {
    pub area: String,
    pub intensity: String,
}

/// Area entries of the headline `Information` block, in document order.
pub fn resolve_headline_areas(tree: &Value) -> Vec<AreaIntensity> {
    let mut out = Vec::new();
    for info in items(first_node(tree, HEADLINE_INFORMATION)) {
        if let Some(kind) = info.get("@type").and_then(text) {
            if !kind.contains("震度") {
                continue;
            }
        }
        for entry in items(info.get("Item")) {
            let Some(level) = at(entry, "Kind.Name").and_then(text) else {
                continue;
            };
            let level = intensity::normalize(&level);
            for area in items(at(entry, "Areas.Area")) {
                if let Some(name) = area.get("Name").and_then(text) {
                    out.push(AreaIntensity {
                        area: name,
                        intensity: level.clone(),
                    });
                }
            }
        }
    }
    out
}

/// Fold area lines into per-prefecture maxima plus the overall maximum.
/// Ties keep the first-seen value; prefectures keep first-seen order.
pub fn summarize_areas(areas: &[AreaIntensity]) -> (Vec<PrefectureObservation>, Option<String>) {
    let mut prefectures: Vec<PrefectureObservation> = Vec::new();
    for a in areas {
        let pref = prefecture_of_area(&a.area);
        match prefectures.iter_mut().find(|p| p.name == pref) {
            Some(existing) => {
                if intensity::to_ordinal(&a.intensity) > intensity::to_ordinal(&existing.max_intensity)
                {
                    existing.max_intensity = a.intensity.clone();
                }
            }
            None => prefectures.push(PrefectureObservation {
                name: pref,
                max_intensity: a.intensity.clone(),
            }),
        }
    }
    let max = strongest(areas.iter().map(|a| a.intensity.as_str()));
    (prefectures, max)
}

/// Strongest label by ordinal; first seen wins ties.
pub fn strongest<'a>(labels: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut best: Option<&str> = None;
    for label in labels {
        match best {
            Some(b) if intensity::to_ordinal(label) <= intensity::to_ordinal(b) => {}
            _ => best = Some(label),
        }
    }
    best.map(str::to_string)
}

/// `石川県能登` → `石川県`, `東京都２３区` → `東京都`, `北海道道央` →
/// `北海道`.  Names without a prefecture suffix are returned unchanged.
pub fn prefecture_of_area(area: &str) -> String {
    let area = area.trim();
    if area.starts_with("北海道") {
        return "北海道".into();
    }
    // 県 before 府 before 都: "京都府" must not stop at its 都.
    for suffix in ['県', '府', '都'] {
        if let Some(idx) = area.find(suffix) {
            return area[..idx + suffix.len_utf8()].to_string();
        }
    }
    area.to_string()
}
