// ─────────────────────────────── Tests ───────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::crypto::{encrypt, test_key};
    use crate::fetcher::*;
    use crate::store::workspaces::fixtures;
    use crate::store::{open_memory, records};
    use crate::telegram::test_support::*;
    use crate::upstream::fake::FakeSource;

    const EVENT: &str = "20240101161010";

    const WEAK_XML: &str = "<Report><Head><Title>震度速報</Title><EventID>20240102090000</EventID>\
        <Serial>1</Serial><InfoType>発表</InfoType></Head>\
        <Body><Intensity><Observation><MaxInt>2</MaxInt></Observation></Intensity></Body></Report>";

    fn setup() -> (SharedDb, PrefectureMaster) {
        let db = open_memory();
        let master = PrefectureMaster::load(&db).unwrap();
        (db, master)
    }

    fn quick_item() -> RawTelegramItem {
        item("q1", "VXSE51", "2024-01-01T07:10:48Z", Some(EVENT))
    }

    fn detailed_item(id: &str, time: &str, event: Option<&str>) -> RawTelegramItem {
        item(id, "VXSE53", time, event)
    }

    // ── Pairing ──

    #[test]
    fn partner_within_window_is_closest() {
        let quick = quick_item();
        let candidates = vec![
            detailed_item("far", "2024-01-01T07:14:48Z", Some(EVENT)),
            detailed_item("near", "2024-01-01T07:12:18Z", Some(EVENT)),
            detailed_item("outside", "2024-01-01T07:20:00Z", Some(EVENT)),
        ];
        let chosen = find_partner(&quick, &candidates, Duration::seconds(300)).unwrap();
        assert_eq!(chosen.id, "near");
    }

    #[test]
    fn partner_outside_window_or_other_event_is_rejected() {
        let quick = quick_item();
        let candidates = vec![
            detailed_item("other", "2024-01-01T07:11:00Z", Some("20231231000000")),
            detailed_item("late", "2024-01-01T07:16:00Z", Some(EVENT)),
        ];
        assert!(find_partner(&quick, &candidates, Duration::seconds(300)).is_none());
    }

    #[test]
    fn partner_tie_goes_to_list_order() {
        let quick = quick_item();
        let candidates = vec![
            detailed_item("after", "2024-01-01T07:11:48Z", None),
            detailed_item("before", "2024-01-01T07:09:48Z", None),
        ];
        let chosen = find_partner(&quick, &candidates, Duration::seconds(300)).unwrap();
        assert_eq!(chosen.id, "after");
    }

    // ── Cycle ──

    #[tokio::test]
    async fn paired_record_takes_location_from_detailed() {
        let (db, master) = setup();
        let quick = quick_item();
        let detailed = detailed_item("d1", "2024-01-01T07:12:18Z", Some(EVENT));
        let source = FakeSource {
            quick: vec![quick.clone()],
            detailed: vec![detailed.clone()],
            ..FakeSource::default()
        }
        .with_body(&quick, QUICK_XML)
        .with_body(&detailed, DETAILED_XML);

        let report = run_cycle(&db, &source, &FetchCfg::default(), &master).await.unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.paired, 1);

        let stored = records::load(&db, report.created[0]).unwrap().unwrap();
        assert_eq!(stored.epicenter.as_deref(), Some("石川県能登地方"));
        assert_eq!(stored.magnitude, Some(7.4));
        assert_eq!(stored.max_intensity.as_deref(), Some("7"));
        assert_eq!(stored.prefectures.len(), 5);
    }

    #[tokio::test]
    async fn sub_threshold_quick_report_creates_nothing() {
        let (db, master) = setup();
        let weak = item("w1", "VXSE51", "2024-01-02T00:00:30Z", None);
        let detailed = detailed_item("d9", "2024-01-02T00:01:30Z", None);
        let source = FakeSource {
            quick: vec![weak.clone()],
            detailed: vec![detailed.clone()],
            ..FakeSource::default()
        }
        .with_body(&weak, WEAK_XML)
        .with_body(&detailed, DETAILED_XML);

        let report = run_cycle(&db, &source, &FetchCfg::default(), &master).await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.below_threshold, 1);
        assert_eq!(records::count_for_event(&db, "20240102090000").unwrap(), 0);
        // the partner is never fetched for a discarded item
        assert_eq!(source.detail_calls(), vec!["w1"]);
    }

    #[tokio::test]
    async fn redelivery_yields_one_record() {
        let (db, master) = setup();
        let quick = quick_item();
        let source = FakeSource {
            quick: vec![quick.clone()],
            ..FakeSource::default()
        }
        .with_body(&quick, QUICK_XML);

        let cfg = FetchCfg::default();
        let first = run_cycle(&db, &source, &cfg, &master).await.unwrap();
        let second = run_cycle(&db, &source, &cfg, &master).await.unwrap();
        assert_eq!(first.created.len(), 1);
        assert!(second.created.is_empty());
        assert_eq!(second.duplicates, 1);
        assert_eq!(records::count_for_event(&db, EVENT).unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_partner_body_persists_unpaired() {
        let (db, master) = setup();
        let quick = quick_item();
        let detailed = detailed_item("d1", "2024-01-01T07:12:18Z", Some(EVENT));
        let source = FakeSource {
            quick: vec![quick.clone()],
            detailed: vec![detailed],
            ..FakeSource::default()
        }
        .with_body(&quick, QUICK_XML);

        let report = run_cycle(&db, &source, &FetchCfg::default(), &master).await.unwrap();
        assert_eq!(report.paired, 0);
        let stored = records::load(&db, report.created[0]).unwrap().unwrap();
        assert_eq!(stored.epicenter, None);
        assert_eq!(stored.max_intensity.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn one_bad_item_does_not_sink_the_cycle() {
        let (db, master) = setup();
        let broken = item("broken", "VXSE51", "2024-01-01T07:10:40Z", None);
        let quick = quick_item();
        let source = FakeSource {
            quick: vec![broken.clone(), quick.clone()],
            ..FakeSource::default()
        }
        .with_body(&broken, "<Report><Head>")
        .with_body(&quick, QUICK_XML);

        let report = run_cycle(&db, &source, &FetchCfg::default(), &master).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.created.len(), 1);
    }

    #[tokio::test]
    async fn list_failure_fails_the_cycle() {
        let (db, master) = setup();
        let source = FakeSource {
            fail_list: true,
            ..FakeSource::default()
        };
        assert!(run_cycle(&db, &source, &FetchCfg::default(), &master).await.is_err());
    }

    // ── API key ──

    #[test]
    fn stored_key_wins_over_env() {
        let db = open_memory();
        let secret = test_key(5);
        fixtures::api_credential(&db, "dmdata", &encrypt(&secret, "db-key").unwrap());
        assert_eq!(choose_api_key(&db, Some(&secret), Some("env-key")).unwrap(), "db-key");
    }

    #[test]
    fn env_key_is_the_fallback() {
        let db = open_memory();
        assert_eq!(choose_api_key(&db, None, Some(" env-key ")).unwrap(), "env-key");

        // a stored key sealed under another secret falls through to env
        fixtures::api_credential(&db, "dmdata", &encrypt(&test_key(1), "db-key").unwrap());
        assert_eq!(choose_api_key(&db, Some(&test_key(2)), Some("env-key")).unwrap(), "env-key");
        assert_eq!(choose_api_key(&db, None, Some("env-key")).unwrap(), "env-key");
    }

    #[test]
    fn no_key_anywhere_fails() {
        let db = open_memory();
        assert!(choose_api_key(&db, None, None).is_err());
        assert!(choose_api_key(&db, Some(&test_key(1)), Some("  ")).is_err());
    }
}
