//! Merging a quick-intensity report with its detailed counterpart.

use super::{EarthquakeInfo, ReportKind};

#[derive(Debug, Clone, PartialEq)]
pub struct QuickIntensityReport(pub EarthquakeInfo);

#[derive(Debug, Clone, PartialEq)]
pub struct DetailedReport(pub EarthquakeInfo);

/// An extracted telegram, tagged by the role it plays in pairing.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    QuickIntensity(QuickIntensityReport),
    Detailed(DetailedReport),
}

impl Report {
    /// Hypocenter-only bulletins play no part in pairing.
    pub fn from_info(info: EarthquakeInfo) -> Option<Self> {
        match info.report_kind {
            ReportKind::QuickIntensity => Some(Self::QuickIntensity(QuickIntensityReport(info))),
            ReportKind::Detailed => Some(Self::Detailed(DetailedReport(info))),
            ReportKind::Hypocenter => None,
        }
    }
}

/// Reconcile a bundle's primary report with its partner.  A detailed report
/// standing as the primary keeps its own fields; a partner that is not a
/// detailed report is ignored.
pub fn reconcile_reports(primary: Report, partner: Option<Report>) -> EarthquakeInfo {
    let detailed = match partner {
        Some(Report::Detailed(d)) => Some(d),
        _ => None,
    };
    match primary {
        Report::QuickIntensity(quick) => reconcile(quick, detailed),
        Report::Detailed(DetailedReport(info)) => info,
    }
}

/// The quick report owns identity, intensity and timing; the detailed report
/// supplies location fields (and its prefecture list) whenever it has them.
pub fn reconcile(quick: QuickIntensityReport, detailed: Option<DetailedReport>) -> EarthquakeInfo {
    let QuickIntensityReport(mut merged) = quick;
    let Some(DetailedReport(detail)) = detailed else {
        return merged;
    };

    if detail.epicenter.is_some() {
        merged.epicenter = detail.epicenter;
    }
    if detail.magnitude.is_some() {
        merged.magnitude = detail.magnitude;
    }
    if detail.depth.is_some() {
        merged.depth = detail.depth;
    }
    if !detail.prefectures.is_empty() {
        merged.prefectures = detail.prefectures;
    }
    if merged.occurred_at.is_none() {
        merged.occurred_at = detail.occurred_at;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::Depth;
    use crate::telegram::test_support::*;

    fn quick() -> QuickIntensityReport {
        let r = report(item("q", "VXSE51", "2024-01-01T07:10:48Z", None), QUICK_XML);
        QuickIntensityReport(r.extract().unwrap())
    }

    fn detailed() -> DetailedReport {
        let r = report(item("d", "VXSE53", "2024-01-01T07:12:18Z", None), DETAILED_XML);
        DetailedReport(r.extract().unwrap())
    }

    #[test]
    fn quick_alone_is_unchanged() {
        let q = quick();
        assert_eq!(reconcile(q.clone(), None), q.0);
    }

    #[test]
    fn location_from_detailed_intensity_from_quick() {
        let merged = reconcile(quick(), Some(detailed()));
        assert_eq!(merged.epicenter.as_deref(), Some("石川県能登地方"));
        assert_eq!(merged.magnitude, Some(7.4));
        assert_eq!(merged.depth, Some(Depth::Km(10)));
        assert_eq!(merged.max_intensity.as_deref(), Some("7"));
        assert_eq!(merged.report_kind, ReportKind::QuickIntensity);
        assert_eq!(merged.title.as_deref(), Some("震度速報"));
        assert_eq!(merged.prefectures.len(), 5);
    }

    #[test]
    fn absent_detail_fields_do_not_erase() {
        let mut d = detailed();
        d.0.epicenter = None;
        d.0.prefectures.clear();
        let merged = reconcile(quick(), Some(d));
        assert_eq!(merged.epicenter, None);
        assert_eq!(merged.prefectures.len(), 4);
        assert_eq!(merged.magnitude, Some(7.4));
    }

    #[test]
    fn tags_follow_report_kind() {
        assert!(matches!(
            Report::from_info(quick().0),
            Some(Report::QuickIntensity(_))
        ));
        assert!(matches!(Report::from_info(detailed().0), Some(Report::Detailed(_))));
        let mut hypo = detailed().0;
        hypo.report_kind = ReportKind::Hypocenter;
        assert_eq!(Report::from_info(hypo), None);
    }

    #[test]
    fn tagged_pair_reconciles_by_role() {
        let q = Report::from_info(quick().0).unwrap();
        let d = Report::from_info(detailed().0).unwrap();
        let merged = reconcile_reports(q.clone(), Some(d.clone()));
        assert_eq!(merged.max_intensity.as_deref(), Some("7"));
        assert_eq!(merged.epicenter.as_deref(), Some("石川県能登地方"));

        // a quick report offered as partner contributes nothing
        let alone = reconcile_reports(q.clone(), Some(q));
        assert_eq!(alone, quick().0);
        assert_eq!(reconcile_reports(d, None), detailed().0);
    }
}
