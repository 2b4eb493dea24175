#![allow(dead_code)]

pub mod mocks;

use std::sync::Arc;
use std::time::Duration;
use vtn::app_state::{Collaborators, VtnState};
use vtn::config::VtnConfig;
use vtn::registry::{BackupStore, MemoryBackupStore};

pub const POLL_CONFIG: &str = r#"
vtn_id: VTN_TEST
mode: poll
poll_responder: event_first
backup:
  kind: memory
events:
  initial_delay: 0
  fallback_min: 0.0
  fallback_max: 10.0
  seed: 7
"#;

pub const PUSH_CONFIG: &str = r#"
vtn_id: VTN_TEST
mode: push
backup:
  kind: memory
events:
  initial_delay: 0
preregistration:
  HOUSE_001:
    ven_id: VEN_HOUSE_001
    registration_id: REG_HOUSE_001
    transport_address: http://house-001.local/events
    reports:
      - report_request_id: RR_HOUSE_001
        report_specifier_id: METER_HOUSE_001
        report_id: R1
"#;

pub fn poll_config() -> VtnConfig {
    VtnConfig::from_yaml_str(POLL_CONFIG).expect("poll fixture config parses")
}

pub fn push_config() -> VtnConfig {
    VtnConfig::from_yaml_str(PUSH_CONFIG).expect("push fixture config parses")
}

pub async fn poll_state() -> Arc<VtnState> {
    poll_state_with(Arc::new(MemoryBackupStore::new()), Collaborators::default()).await
}

pub async fn poll_state_with(
    store: Arc<dyn BackupStore>,
    collaborators: Collaborators,
) -> Arc<VtnState> {
    Arc::new(
        VtnState::initialise(&poll_config(), store, collaborators)
            .await
            .expect("poll state initialises"),
    )
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
