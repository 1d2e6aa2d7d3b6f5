//! Telegram → [`EarthquakeInfo`].

use serde_json::Value;
use tracing::{debug, warn};

use super::fields::{self, Hypocenter, Observation};
use super::{EarthquakeInfo, RawTelegramItem, ReportKind};

/// Normalize one telegram.  Returns `None` only when no event id can be
/// derived; every other field degrades to absent.
pub fn extract(item: &RawTelegramItem, tree: &Value) -> Option<EarthquakeInfo> {
    let Some(event_id) = fields::resolve_event_id(item, tree) else {
        warn!(telegram = %item.id, kind = %item.kind, "no event id in telegram; rejected");
        return None;
    };

    let Hypocenter {
        epicenter,
        magnitude,
        depth,
    } = fields::resolve_hypocenter(tree).unwrap_or(Hypocenter {
        epicenter: None,
        magnitude: None,
        depth: None,
    });

    let Observation {
        max_intensity,
        prefectures,
    } = match fields::resolve_observation(tree) {
        Some(obs) => obs,
        None if item.kind == ReportKind::QuickIntensity => {
            let areas = fields::resolve_headline_areas(tree);
            debug!(telegram = %item.id, areas = areas.len(), "intensity from headline areas");
            let (prefectures, max_intensity) = fields::summarize_areas(&areas);
            Observation {
                max_intensity,
                prefectures,
            }
        }
        None => Observation {
            max_intensity: None,
            prefectures: Vec::new(),
        },
    };

    Some(EarthquakeInfo {
        event_id,
        report_kind: item.kind,
        info_subtype: fields::first_text(tree, fields::INFO_TYPE)
            .or_else(|| item.head.info_type.clone()),
        title: fields::first_text(tree, fields::TITLE).or_else(|| item.head.title.clone()),
        epicenter,
        magnitude,
        depth,
        max_intensity,
        occurred_at: fields::resolve_time(tree, fields::OCCURRED_TIME),
        reported_at: fields::resolve_time(tree, fields::REPORT_TIME).or(Some(item.issued_at)),
        serial_no: fields::resolve_serial(item, tree),
        prefectures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::test_support::*;
    use crate::telegram::{Depth, parse_report_body};
    use serde_json::json;

    #[test]
    fn quick_intensity_report() {
        let item = item("q1", "VXSE51", "2024-01-01T07:10:48Z", None);
        let info = extract(&item, &parse_report_body(QUICK_XML).unwrap()).unwrap();
        assert_eq!(info.event_id, "20240101161010");
        assert_eq!(info.report_kind, ReportKind::QuickIntensity);
        assert_eq!(info.max_intensity.as_deref(), Some("7"));
        assert_eq!(info.epicenter, None);
        assert_eq!(info.magnitude, None);
        assert_eq!(info.serial_no, 1);
        assert_eq!(info.info_subtype.as_deref(), Some("発表"));
        assert_eq!(info.title.as_deref(), Some("震度速報"));
        assert_eq!(
            info.occurred_at.map(|t| t.to_rfc3339()),
            Some("2024-01-01T16:10:00+09:00".into())
        );
        assert_eq!(info.prefectures.len(), 4);
    }

    #[test]
    fn detailed_report() {
        let item = item("d1", "VXSE53", "2024-01-01T07:12:18Z", None);
        let info = extract(&item, &parse_report_body(DETAILED_XML).unwrap()).unwrap();
        assert_eq!(info.epicenter.as_deref(), Some("石川県能登地方"));
        assert_eq!(info.magnitude, Some(7.4));
        assert_eq!(info.depth, Some(Depth::Km(10)));
        assert_eq!(info.max_intensity.as_deref(), Some("6強"));
        assert_eq!(info.prefectures[0].name, "石川県");
        assert_eq!(info.prefectures[3].max_intensity, "5弱");
    }

    #[test]
    fn partial_report_still_extracts() {
        let item = item("p1", "VXSE53", "2024-01-01T07:12:18Z", Some("EVT"));
        let info = extract(&item, &json!({ "Report": { "Head": { "Title": "震源・震度情報" } } }))
            .unwrap();
        assert_eq!(info.event_id, "EVT");
        assert_eq!(info.max_intensity, None);
        assert!(info.prefectures.is_empty());
        assert_eq!(info.reported_at, Some(item.issued_at));
    }

    #[test]
    fn missing_event_id_is_rejected() {
        let mut item = item("", "VXSE53", "2024-01-01T07:12:18Z", None);
        item.id = "  ".into();
        assert!(extract(&item, &json!({})).is_none());
    }
}
