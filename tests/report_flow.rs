#[path = "support/mod.rs"]
mod support;

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use support::mocks::SelectiveReportHandler;
use vtn::app_state::Collaborators;
use vtn::domain::ReportTarget;
use vtn::protocol::{
    CreatedReport, PollResponse, RegistrationInfo, ReportData, ReportDescription, ReportInterval,
    ReportOffer, ReportPayload, ReportPayloadEntry, UpdateReport,
};
use vtn::registry::MemoryBackupStore;
use vtn::report::ReportItemSpec;

fn registration(name: &str) -> RegistrationInfo {
    RegistrationInfo {
        ven_name: name.to_string(),
        transport_address: None,
    }
}

fn description(r_id: &str, resource_id: &str, measurement: &str, min_secs: u64) -> ReportDescription {
    ReportDescription {
        r_id: r_id.to_string(),
        resource_id: Some(resource_id.to_string()),
        measurement: measurement.to_string(),
        unit: Some("W".to_string()),
        scale: Some("k".to_string()),
        min_period: Duration::from_secs(min_secs),
        max_period: Duration::from_secs(min_secs * 6),
        reading_type: "Direct Read".to_string(),
    }
}

fn entry(r_id: &str, value: f64) -> ReportPayloadEntry {
    ReportPayloadEntry {
        r_id: r_id.to_string(),
        value,
    }
}

#[tokio::test]
async fn house_001_report_value_lands_in_its_series() {
    let state = support::poll_state().await;

    let outcome = state
        .on_create_party_registration(&registration("HOUSE_001"))
        .await
        .expect("registration succeeds");
    assert_eq!(outcome.ven_id, "VEN_ID_HOUSE_001");

    let (callback, interval) = state
        .pipeline
        .register_report(
            &outcome.ven_id,
            ReportItemSpec {
                resource_id: "R1",
                measurement: "REAL_POWER",
                unit: Some("W"),
                scale: Some("k"),
                min_interval: Duration::from_secs(5),
                max_interval: Duration::from_secs(30),
            },
        )
        .await
        .expect("report registration succeeds");
    assert_eq!(interval, Duration::from_secs(5));
    assert_eq!(
        callback.target,
        ReportTarget::new("VEN_ID_HOUSE_001", "R1", "REAL_POWER")
    );
    assert!(state.pipeline.install("rr-house", "r1-power", callback.clone()));

    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid timestamp");
    let summary = state
        .on_update_report(&UpdateReport {
            ven_id: Some(outcome.ven_id.clone()),
            reports: vec![ReportData {
                report_request_id: "rr-house".to_string(),
                intervals: vec![ReportInterval {
                    dtstart: t0,
                    report_payload: ReportPayload::Single(entry("r1-power", 3.2)),
                }],
            }],
        })
        .await;
    assert_eq!(summary.routed, 1);

    let series = state.sink.ensure_series("VEN_ID_HOUSE_001", "R1", "REAL_POWER");
    assert!(series.same_series(&callback.series));
    assert_eq!(series.latest(), Some(3.2));
    let name = state
        .sink
        .report_series_name(&ReportTarget::new("VEN_ID_HOUSE_001", "R1", "REAL_POWER"));
    assert_eq!(state.sink.latest(&name).await, Some(3.2));
}

#[tokio::test]
async fn repeated_report_registration_reuses_callback_and_resource_entry() {
    let state = support::poll_state().await;
    let outcome = state
        .on_create_party_registration(&registration("HOUSE_001"))
        .await
        .expect("registration succeeds");

    let spec = || ReportItemSpec {
        resource_id: "R1",
        measurement: "REAL_POWER",
        unit: None,
        scale: None,
        min_interval: Duration::from_secs(5),
        max_interval: Duration::from_secs(5),
    };
    let (first, _) = state
        .pipeline
        .register_report(&outcome.ven_id, spec())
        .await
        .expect("first registration");
    let (second, _) = state
        .pipeline
        .register_report(&outcome.ven_id, spec())
        .await
        .expect("second registration");

    assert!(first.series.same_series(&second.series));
    let record = state.registry.lookup(&outcome.ven_id).expect("record");
    assert_eq!(record.resource_ids.iter().collect::<Vec<_>>(), vec!["R1"]);
    assert_eq!(state.sink.event_targets(&outcome.ven_id).len(), 1);
}

#[tokio::test]
async fn multi_payload_interval_routes_each_item_once() {
    let handler = SelectiveReportHandler::default();
    let state = support::poll_state_with(
        Arc::new(MemoryBackupStore::new()),
        Collaborators {
            report_handler: Some(Arc::new(handler.clone())),
            ..Collaborators::default()
        },
    )
    .await;
    let outcome = state
        .on_create_party_registration(&registration("HOUSE_001"))
        .await
        .expect("registration succeeds");

    let request = state
        .on_register_report(&ReportOffer {
            ven_id: outcome.ven_id.clone(),
            report_specifier_id: "METER".to_string(),
            report_descriptions: vec![
                description("itemA", "RA", "REAL_POWER", 10),
                description("itemB", "RB", "REAL_POWER", 5),
            ],
        })
        .await
        .expect("offer accepted");
    assert_eq!(request.granularity, Duration::from_secs(5));
    assert_eq!(request.items.len(), 2);

    let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid timestamp");
    let summary = state
        .pipeline
        .ingest(
            &request.report_request_id,
            &[ReportInterval {
                dtstart: t,
                report_payload: ReportPayload::Multiple(vec![
                    entry("itemA", 1.0),
                    entry("itemB", 2.0),
                    entry("itemC", 9.9),
                ]),
            }],
        )
        .await;

    assert_eq!(summary.routed, 2);
    assert_eq!(summary.unroutable, 1, "unrequested item is dropped and counted");

    let mut seen = handler.seen();
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        seen,
        vec![
            ("RA".to_string(), vec![1.0]),
            ("RB".to_string(), vec![2.0]),
        ]
    );
}

#[tokio::test]
async fn failing_handler_does_not_abort_sibling_groups() {
    let handler = SelectiveReportHandler::failing_for("RA");
    let state = support::poll_state_with(
        Arc::new(MemoryBackupStore::new()),
        Collaborators {
            report_handler: Some(Arc::new(handler.clone())),
            ..Collaborators::default()
        },
    )
    .await;
    let outcome = state
        .on_create_party_registration(&registration("HOUSE_001"))
        .await
        .expect("registration succeeds");
    let request = state
        .on_register_report(&ReportOffer {
            ven_id: outcome.ven_id.clone(),
            report_specifier_id: "METER".to_string(),
            report_descriptions: vec![
                description("itemA", "RA", "REAL_POWER", 5),
                description("itemB", "RB", "REAL_POWER", 5),
            ],
        })
        .await
        .expect("offer accepted");

    let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid timestamp");
    let intervals: Vec<ReportInterval> = (0..3)
        .map(|step| ReportInterval {
            dtstart: t + chrono::Duration::seconds(5 * step),
            report_payload: ReportPayload::Multiple(vec![
                entry("itemA", step as f64),
                entry("itemB", 10.0 + step as f64),
            ]),
        })
        .collect();
    let summary = state
        .pipeline
        .ingest(&request.report_request_id, &intervals)
        .await;

    assert_eq!(summary.failed_groups, 1);
    assert_eq!(summary.routed, 3);
    assert_eq!(
        handler.seen(),
        vec![("RB".to_string(), vec![10.0, 11.0, 12.0])],
        "timestamp order within a group is preserved"
    );
}

#[tokio::test]
async fn created_report_routes_survive_a_restart() {
    let store = Arc::new(MemoryBackupStore::new());
    let request_id = {
        let state = support::poll_state_with(store.clone(), Collaborators::default()).await;
        let outcome = state
            .on_create_party_registration(&registration("HOUSE_001"))
            .await
            .expect("registration succeeds");
        let request = state
            .on_register_report(&ReportOffer {
                ven_id: outcome.ven_id.clone(),
                report_specifier_id: "METER".to_string(),
                report_descriptions: vec![description("r1-power", "R1", "REAL_POWER", 5)],
            })
            .await
            .expect("offer accepted");

        match state.on_poll(&outcome.ven_id).expect("poll succeeds") {
            PollResponse::CreateReport { report_requests } => {
                assert_eq!(report_requests, vec![request.clone()]);
            }
            other => panic!("expected report request, got {other:?}"),
        }

        let written = state
            .on_created_report(&CreatedReport {
                ven_id: outcome.ven_id.clone(),
                report_request_ids: vec![request.report_request_id.clone()],
            })
            .await
            .expect("created report recorded");
        assert_eq!(written, 1);
        request.report_request_id
    };

    let restarted = support::poll_state_with(store, Collaborators::default()).await;
    assert_eq!(restarted.pipeline.route_count(), 0, "routes return on re-registration");
    restarted
        .on_create_party_registration(&registration("HOUSE_001"))
        .await
        .expect("re-registration succeeds");
    assert!(restarted.pipeline.route(&request_id, "r1-power").is_some());

    let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid timestamp");
    let summary = restarted
        .pipeline
        .ingest(
            &request_id,
            &[ReportInterval {
                dtstart: t,
                report_payload: ReportPayload::Single(entry("r1-power", 4.5)),
            }],
        )
        .await;
    assert_eq!(summary.routed, 1);
    assert_eq!(
        restarted
            .sink
            .ensure_series("VEN_ID_HOUSE_001", "R1", "REAL_POWER")
            .latest(),
        Some(4.5)
    );
}

#[tokio::test]
async fn report_calls_from_unregistered_vens_are_refused() {
    let state = support::poll_state().await;

    let err = state
        .on_register_report(&ReportOffer {
            ven_id: "VEN_ID_GHOST".to_string(),
            report_specifier_id: "METER".to_string(),
            report_descriptions: vec![description("r1", "R1", "REAL_POWER", 5)],
        })
        .await
        .expect_err("unknown VEN is refused");
    assert!(matches!(err, vtn::error::Error::UnknownVen { .. }));

    let err = state
        .on_register_report(&ReportOffer {
            ven_id: "VEN_ID_GHOST".to_string(),
            report_specifier_id: "METER".to_string(),
            report_descriptions: Vec::new(),
        })
        .await
        .expect_err("unknown VEN is refused before the offer is inspected");
    assert!(matches!(err, vtn::error::Error::UnknownVen { .. }));
}

#[tokio::test]
async fn re_offering_a_specifier_replaces_its_request_and_routes() {
    let state = support::poll_state().await;
    let outcome = state
        .on_create_party_registration(&registration("HOUSE_001"))
        .await
        .expect("registration succeeds");
    let offer = ReportOffer {
        ven_id: outcome.ven_id.clone(),
        report_specifier_id: "METER".to_string(),
        report_descriptions: vec![description("r1-power", "R1", "REAL_POWER", 5)],
    };

    let confirmed = state.on_register_report(&offer).await.expect("first offer");
    state
        .on_created_report(&CreatedReport {
            ven_id: outcome.ven_id.clone(),
            report_request_ids: vec![confirmed.report_request_id.clone()],
        })
        .await
        .expect("created report recorded");

    for _ in 0..9 {
        state.on_register_report(&offer).await.expect("re-offer");
    }
    let latest = state.on_register_report(&offer).await.expect("latest re-offer");

    let pending = state.multiplexer.report_requests(&outcome.ven_id);
    assert_eq!(pending, vec![latest.clone()]);
    assert_eq!(
        state.pipeline.route_count(),
        2,
        "the confirmed request and the latest offer stay routable"
    );
    assert!(state.pipeline.route(&confirmed.report_request_id, "r1-power").is_some());
    assert!(state.pipeline.route(&latest.report_request_id, "r1-power").is_some());
}
