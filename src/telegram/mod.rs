//! Telegram envelopes, the normalized earthquake record, and the source
//! bundle a record is derived from.

pub mod extract;
pub mod fields;
pub mod reconcile;
pub mod xml_tree;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

pub use extract::extract;
pub use reconcile::{Report, reconcile_reports};

// ───────────────────────────── Report kinds ──────────────────────────────

/// Report subtypes this crate understands.  The poller only ever asks for
/// [`ReportKind::QuickIntensity`] and [`ReportKind::Detailed`]; the realtime
/// feed also carries hypocenter-only bulletins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    /// 震度速報 (VXSE51): felt intensity only.
    QuickIntensity,
    /// 震源に関する情報 (VXSE52): hypocenter only, intensity pending.
    Hypocenter,
    /// 震源・震度に関する情報 (VXSE53): hypocenter and intensity.
    Detailed,
}

impl ReportKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuickIntensity => "VXSE51",
            Self::Hypocenter => "VXSE52",
            Self::Detailed => "VXSE53",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "VXSE51" => Some(Self::QuickIntensity),
            "VXSE52" => Some(Self::Hypocenter),
            "VXSE53" => Some(Self::Detailed),
            _ => None,
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ───────────────────────────── Envelope ──────────────────────────────────

/// Report-head metadata the provider copies into the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHead {
    pub event_id: Option<String>,
    pub serial: Option<String>,
    pub title: Option<String>,
    pub info_type: Option<String>,
    pub info_kind: Option<String>,
}

/// One provider-issued telegram as listed by the REST API or pushed over
/// the socket.  Lives only for the duration of a fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTelegramItem {
    pub id: String,
    pub kind: ReportKind,
    pub author: Option<String>,
    pub issued_at: DateTime<FixedOffset>,
    pub url: Option<String>,
    /// Inline body exactly as delivered (see `encoding`/`compression`).
    pub body: Option<String>,
    pub format: Option<String>,
    pub compression: Option<String>,
    pub encoding: Option<String>,
    pub test: bool,
    pub head: EnvelopeHead,
    /// The envelope as received; its bytes feed the dedup fingerprint.
    pub raw: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    id: String,
    head: WireHead,
    xml_report: Option<WireXmlReport>,
    url: Option<String>,
    body: Option<String>,
    format: Option<String>,
    compression: Option<String>,
    encoding: Option<String>,
}

#[derive(Deserialize)]
struct WireHead {
    #[serde(rename = "type")]
    kind: String,
    author: Option<String>,
    time: String,
    #[serde(default)]
    test: bool,
}

#[derive(Deserialize)]
struct WireXmlReport {
    head: Option<WireReportHead>,
    control: Option<WireControl>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReportHead {
    title: Option<String>,
    event_id: Option<String>,
    serial: Option<String>,
    info_type: Option<String>,
    info_kind: Option<String>,
}

#[derive(Deserialize)]
struct WireControl {
    title: Option<String>,
}

impl RawTelegramItem {
    /// Build from a provider envelope.  Fails for unknown report kinds or an
    /// unparseable issue time; everything else is optional.
    pub fn from_envelope(raw: Value) -> Result<Self> {
        let wire: WireEnvelope =
            serde_json::from_value(raw.clone()).context("invalid telegram envelope")?;
        let kind = ReportKind::from_code(&wire.head.kind)
            .ok_or_else(|| anyhow!("unsupported report kind {}", wire.head.kind))?;
        let issued_at = DateTime::parse_from_rfc3339(&wire.head.time)
            .with_context(|| format!("invalid issue time {}", wire.head.time))?;

        let (report_head, control) = match wire.xml_report {
            Some(r) => (r.head, r.control),
            None => (None, None),
        };
        let head = match report_head {
            Some(h) => EnvelopeHead {
                event_id: h.event_id.filter(|s| !s.trim().is_empty()),
                serial: h.serial,
                title: h.title.or_else(|| control.and_then(|c| c.title)),
                info_type: h.info_type,
                info_kind: h.info_kind,
            },
            None => EnvelopeHead {
                title: control.and_then(|c| c.title),
                ..EnvelopeHead::default()
            },
        };

        Ok(Self {
            id: wire.id,
            kind,
            author: wire.head.author,
            issued_at,
            url: wire.url,
            body: wire.body,
            format: wire.format,
            compression: wire.compression,
            encoding: wire.encoding,
            test: wire.head.test,
            head,
            raw,
        })
    }
}

// ─────────────────────────── Normalized record ───────────────────────────

/// Hypocenter depth: either a qualitative label supplied by the provider
/// (`ごく浅い`, `不明`) or whole kilometres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Depth {
    Condition(String),
    Km(i64),
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Condition(label) => f.write_str(label),
            Self::Km(km) => write!(f, "{km}km"),
        }
    }
}

impl Depth {
    /// Storage form: `km:10` or the condition label itself.
    pub fn to_column(&self) -> String {
        match self {
            Self::Condition(label) => label.clone(),
            Self::Km(km) => format!("km:{km}"),
        }
    }

    pub fn from_column(raw: &str) -> Self {
        match raw.strip_prefix("km:").and_then(|v| v.parse().ok()) {
            Some(km) => Self::Km(km),
            None => Self::Condition(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefectureObservation {
    pub name: String,
    pub max_intensity: String,
}

/// Normalized view of one telegram (or one reconciled pair).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarthquakeInfo {
    pub event_id: String,
    pub report_kind: ReportKind,
    pub info_subtype: Option<String>,
    pub title: Option<String>,
    pub epicenter: Option<String>,
    pub magnitude: Option<f64>,
    pub depth: Option<Depth>,
    pub max_intensity: Option<String>,
    pub occurred_at: Option<DateTime<FixedOffset>>,
    pub reported_at: Option<DateTime<FixedOffset>>,
    pub serial_no: i64,
    pub prefectures: Vec<PrefectureObservation>,
}

// ──────────────────────────── Source bundle ──────────────────────────────

/// A telegram together with its parsed report body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub item: RawTelegramItem,
    pub tree: Value,
}

impl SourceReport {
    pub fn extract(&self) -> Option<EarthquakeInfo> {
        extract(&self.item, &self.tree)
    }
}

/// Everything a persisted record is derived from: the quick-intensity
/// telegram and, when pairing found one, its detailed counterpart.  Stored
/// verbatim so dispatch can re-derive the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBundle {
    pub quick: SourceReport,
    pub detailed: Option<SourceReport>,
}

impl SourceBundle {
    /// Extract both halves, tag them by role and reconcile them.
    /// `None` when the primary half yields nothing or is hypocenter-only.
    pub fn extract(&self) -> Option<EarthquakeInfo> {
        let primary = Report::from_info(self.quick.extract()?)?;
        let partner = self
            .detailed
            .as_ref()
            .and_then(SourceReport::extract)
            .and_then(Report::from_info);
        Some(reconcile_reports(primary, partner))
    }

    /// SHA-256 over the serialized raw envelopes, in bundle order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&self.quick.item.raw).unwrap_or_default());
        if let Some(detailed) = &self.detailed {
            hasher.update(b"\n");
            hasher.update(serde_json::to_vec(&detailed.item.raw).unwrap_or_default());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize source bundle")
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).context("stored payload is not a source bundle")
    }
}

/// Parse a detail body: XML when it looks like markup, JSON otherwise.
pub fn parse_report_body(body: &str) -> Result<Value> {
    let trimmed = body.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with('<') {
        xml_tree::parse(trimmed)
    } else {
        serde_json::from_str(trimmed).context("report body is neither XML nor JSON")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use serde_json::json;

    pub const QUICK_XML: &str = include_str!("fixtures/vxse51.xml");
    pub const DETAILED_XML: &str = include_str!("fixtures/vxse53.xml");
    pub const SHALLOW_XML: &str = include_str!("fixtures/vxse53_shallow.xml");

    pub fn envelope(id: &str, code: &str, time: &str, event_id: Option<&str>) -> Value {
        json!({
            "id": id,
            "classification": "telegram.earthquake",
            "head": { "type": code, "author": "気象庁", "time": time, "test": false, "xml": true },
            "xmlReport": {
                "control": { "title": "震度速報" },
                "head": { "eventId": event_id, "serial": "1", "infoType": "発表" }
            },
            "format": "xml",
            "url": format!("https://data.example/telegram/{id}"),
        })
    }

    pub fn item(id: &str, code: &str, time: &str, event_id: Option<&str>) -> RawTelegramItem {
        RawTelegramItem::from_envelope(envelope(id, code, time, event_id)).unwrap()
    }

    pub fn report(item: RawTelegramItem, xml: &str) -> SourceReport {
        SourceReport {
            item,
            tree: parse_report_body(xml).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn envelope_parses_provider_shape() {
        let item = item("abc", "VXSE51", "2024-01-01T07:10:48Z", Some("20240101161010"));
        assert_eq!(item.kind, ReportKind::QuickIntensity);
        assert_eq!(item.head.event_id.as_deref(), Some("20240101161010"));
        assert_eq!(item.head.title.as_deref(), Some("震度速報"));
        assert!(item.url.is_some());
    }

    #[test]
    fn envelope_rejects_unknown_kind() {
        let raw = envelope("x", "VTSE41", "2024-01-01T07:10:48Z", None);
        assert!(RawTelegramItem::from_envelope(raw).is_err());
    }

    #[test]
    fn fingerprint_tracks_partner() {
        let quick = report(
            item("q", "VXSE51", "2024-01-01T07:10:48Z", None),
            QUICK_XML,
        );
        let detailed = report(
            item("d", "VXSE53", "2024-01-01T07:12:18Z", None),
            DETAILED_XML,
        );
        let alone = SourceBundle {
            quick: quick.clone(),
            detailed: None,
        };
        let paired = SourceBundle {
            quick: quick.clone(),
            detailed: Some(detailed),
        };
        assert_eq!(alone.fingerprint(), alone.clone().fingerprint());
        assert_ne!(alone.fingerprint(), paired.fingerprint());
        assert_eq!(alone.fingerprint().len(), 64);
    }

    #[test]
    fn payload_round_trips_through_storage() {
        let bundle = SourceBundle {
            quick: report(item("q", "VXSE51", "2024-01-01T07:10:48Z", None), QUICK_XML),
            detailed: None,
        };
        let restored = SourceBundle::from_payload(&bundle.to_payload().unwrap()).unwrap();
        assert_eq!(restored.extract(), bundle.extract());
    }

    #[test]
    fn depth_column_form() {
        assert_eq!(Depth::from_column(&Depth::Km(10).to_column()), Depth::Km(10));
        assert_eq!(
            Depth::from_column("ごく浅い"),
            Depth::Condition("ごく浅い".into())
        );
        assert_eq!(Depth::Km(40).to_string(), "40km");
    }
}
