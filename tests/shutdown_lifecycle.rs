#[path = "support/mod.rs"]
mod support;

use std::sync::Arc;
use std::time::Duration;
use support::mocks::RecordingChannel;
use tokio_util::sync::CancellationToken;
use vtn::app_state::Collaborators;
use vtn::config::ManagementConfig;
use vtn::connectors::ManagementServer;
use vtn::protocol::RegistrationInfo;
use vtn::registry::MemoryBackupStore;
use vtn::report::ReportItemSpec;
use vtn::transport::ProtocolServer;

#[tokio::test(flavor = "multi_thread")]
async fn listeners_stop_when_the_shutdown_token_fires() {
    let state = support::poll_state().await;
    let shutdown = CancellationToken::new();

    let protocol = ProtocolServer::new("127.0.0.1:0".parse().expect("loopback address"));
    let management = ManagementServer::build(&ManagementConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ManagementConfig::default()
    })
    .expect("management server builds");

    let protocol_task = tokio::spawn(protocol.serve(Arc::clone(&state), shutdown.clone()));
    let management_task = tokio::spawn(management.serve(Arc::clone(&state), shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(5), protocol_task)
        .await
        .expect("protocol adapter stops in time")
        .expect("protocol task joins")
        .expect("protocol adapter exits cleanly");
    tokio::time::timeout(Duration::from_secs(5), management_task)
        .await
        .expect("management server stops in time")
        .expect("management task joins")
        .expect("management server exits cleanly");
}

#[tokio::test(flavor = "multi_thread")]
async fn state_shutdown_stops_periodic_tasks_mid_wait() {
    let channel = RecordingChannel::new();
    let state = support::poll_state_with(
        Arc::new(MemoryBackupStore::new()),
        Collaborators {
            channel: Some(Arc::new(channel.clone())),
            ..Collaborators::default()
        },
    )
    .await;
    let outcome = state
        .on_create_party_registration(&RegistrationInfo {
            ven_name: "HOUSE_001".to_string(),
            transport_address: None,
        })
        .await
        .expect("registration");
    state
        .pipeline
        .register_report(
            &outcome.ven_id,
            ReportItemSpec {
                resource_id: "R1",
                measurement: "REAL_POWER",
                unit: None,
                scale: None,
                min_interval: Duration::from_secs(5),
                max_interval: Duration::from_secs(5),
            },
        )
        .await
        .expect("report registration");

    state
        .create_event(&outcome.ven_id, Some(Duration::from_secs(3600)), Some(1.0))
        .expect("task scheduled");
    assert!(support::wait_until(Duration::from_secs(3), || channel.calls() == 1).await);

    let stopped = tokio::time::timeout(Duration::from_secs(2), state.shutdown())
        .await
        .expect("shutdown does not wait out the period");
    assert_eq!(stopped, 1);
    assert!(state.list_tasks().is_empty());
    assert_eq!(channel.calls(), 1);
}
