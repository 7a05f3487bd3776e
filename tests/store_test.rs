//! JSON-file taxpayer store and result-stream sync.

use chrono::NaiveDate;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use gst_scout::core::channel::SafeChannel;
use gst_scout::features::{JsonFileStore, ReturnStatusSync, Taxpayer, TaxpayerStore};
use gst_scout::returns::StatusCalculator;
use gst_scout::{
    FailureReason, FilingRecord, GstDetail, GstProfile, Gstin, ReturnStatus, ReturnType,
    ScrapeResult,
};

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn store() -> JsonFileStore {
    let dir = std::env::temp_dir().join(format!("gst-scout-store-{}", uuid::Uuid::new_v4()));
    JsonFileStore::new(dir.join("taxpayers.json"))
}

fn g(s: &str) -> Gstin {
    Gstin::parse(s).unwrap()
}

fn profile(gstin: &str) -> GstProfile {
    GstProfile {
        gstin: gstin.to_string(),
        name: "ACME TRADERS".to_string(),
        status: "Active".to_string(),
        ..Default::default()
    }
}

fn filed(rt: &str, dof: &str, prd: &str) -> FilingRecord {
    FilingRecord {
        return_type: rt.to_string(),
        filed_on: dof.to_string(),
        tax_period: prd.to_string(),
        arn: format!("ARN-{}-{}", rt, prd),
        status: "Filed".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn due_for_refresh_skips_locked_and_settled_taxpayers() {
    init_logger();
    let s = store();

    let fresh = Taxpayer::new(g("33AAACR5055K1Z5"));
    let mut locked = Taxpayer::new(g("27AAPFU0939F1ZV"));
    locked.locked = true;
    let settled = Taxpayer::new(g("29AAGCB7383J1Z4"));

    for t in [fresh.clone(), locked, settled.clone()] {
        assert_ok!(s.upsert(t).await);
    }
    let calc = StatusCalculator::default();
    let statuses = calc.compute(
        &settled.gstin,
        &[filed("GSTR1", "11-04-2024", "032024")],
        NaiveDate::from_ymd_opt(2024, 4, 20).unwrap(),
        &settled.entry_kind(),
    );
    assert_eq!(statuses[0].status, Some(ReturnStatus::CallForInvoice));
    assert_ok!(
        s.apply_scrape(&settled.gstin, profile(settled.gstin.as_str()), statuses)
            .await
    );

    let due = assert_ok!(s.due_for_refresh().await);
    let ids: Vec<_> = due.into_iter().map(|t| t.gstin).collect();
    assert_eq!(ids, vec![fresh.gstin]);
}

#[tokio::test]
async fn apply_scrape_keeps_contacts_and_clears_new_flag() {
    let s = store();
    let gstin = g("33AAACR5055K1Z5");
    let mut t = Taxpayer::new(gstin.clone());
    t.mobile = Some("9876543210".to_string());
    t.email = Some("accounts@acme.example".to_string());
    t.last_error = Some(FailureReason::notify("old failure"));
    assert_ok!(s.upsert(t).await);

    assert_ok!(s.apply_scrape(&gstin, profile(gstin.as_str()), Vec::new()).await);

    let stored = assert_ok!(s.get(&gstin).await).unwrap();
    assert_eq!(stored.mobile.as_deref(), Some("9876543210"));
    assert_eq!(stored.email.as_deref(), Some("accounts@acme.example"));
    assert!(!stored.is_new_entry);
    assert!(stored.last_error.is_none());
    assert!(stored.last_synced.is_some());
    assert_eq!(stored.profile.unwrap().name, "ACME TRADERS");
}

#[tokio::test]
async fn unknown_taxpayer_changes_nothing() {
    let s = store();
    let known = Taxpayer::new(g("33AAACR5055K1Z5"));
    assert_ok!(s.upsert(known.clone()).await);

    assert_err!(
        s.apply_scrape(&g("27AAPFU0939F1ZV"), profile("27AAPFU0939F1ZV"), Vec::new())
            .await
    );
    assert_eq!(assert_ok!(s.list().await), vec![known]);
}

#[tokio::test]
async fn sync_drains_mixed_results() {
    init_logger();
    let s = Arc::new(store());
    let ok = g("33AAACR5055K1Z5");
    let bad = g("27AAPFU0939F1ZV");
    let ghost = g("29AAGCB7383J1Z4");
    for id in [&ok, &bad] {
        assert_ok!(s.upsert(Taxpayer::new(id.clone())).await);
    }

    let (tx, rx) = SafeChannel::with_capacity(4);
    assert!(
        tx.send(ScrapeResult::Success {
            gstin: ok.clone(),
            detail: GstDetail {
                profile: profile(ok.as_str()),
                filings: vec![
                    filed("GSTR1", "11-04-2024", "032024"),
                    filed("GSTR3B", "20-02-2024", "012024"),
                ],
            },
        })
        .await
    );
    assert!(
        tx.send(ScrapeResult::Failure {
            gstin: bad.clone(),
            reason: FailureReason::notify("GST username or password is invalid."),
        })
        .await
    );
    assert!(
        tx.send(ScrapeResult::Failure {
            gstin: ghost.clone(),
            reason: FailureReason::log_only("timeout"),
        })
        .await
    );
    tx.close();

    let sync = ReturnStatusSync::new(s.clone(), StatusCalculator::default());
    let report = sync
        .drain(rx, NaiveDate::from_ymd_opt(2024, 4, 30).unwrap())
        .await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(report.persisted_errors.len(), 1);
    assert_eq!(report.persisted_errors[0].0, ghost);

    let stored = assert_ok!(s.get(&ok).await).unwrap();
    let gstr3b = stored
        .statuses
        .iter()
        .find(|st| st.return_type == ReturnType::Gstr3b)
        .unwrap();
    assert_eq!(gstr3b.status, Some(ReturnStatus::TaxPayable));
    assert_eq!(gstr3b.pending_periods, vec!["022024", "032024", "042024"]);

    let failed = assert_ok!(s.get(&bad).await).unwrap();
    assert!(failed.last_error.unwrap().notify);
    assert!(failed.is_new_entry);
}
