#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use vtn::domain::EventSignal;
use vtn::error::{DeliveryError, PersistenceError, Result};
use vtn::protocol::EventPusher;
use vtn::registry::{BackupStore, MemoryBackupStore, VenSnapshot};
use vtn::report::{ReportCallback, ReportHandler, ReportSample};
use vtn::scheduler::EventChannel;

/// Event channel that records every delivery and fails the calls listed in its script.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    delivered: Arc<Mutex<Vec<EventSignal>>>,
    calls: Arc<AtomicUsize>,
    /// 1-based call numbers that fail.
    failing_calls: Arc<Mutex<BTreeSet<usize>>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(calls: impl IntoIterator<Item = usize>) -> Self {
        let channel = Self::default();
        channel
            .failing_calls
            .lock()
            .expect("mock channel script")
            .extend(calls);
        channel
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<EventSignal> {
        self.delivered.lock().expect("mock channel deliveries").clone()
    }

    pub fn delivered_values(&self) -> Vec<f64> {
        self.delivered()
            .iter()
            .filter_map(EventSignal::value)
            .collect()
    }
}

#[async_trait]
impl EventChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, signal: EventSignal) -> std::result::Result<String, DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .failing_calls
            .lock()
            .expect("mock channel script")
            .contains(&call)
        {
            return Err(DeliveryError::Transport {
                ven_id: signal.target.ven_id.clone(),
                reason: format!("scripted failure on call {call}"),
            });
        }
        let delivery_id = format!("delivery-{call}");
        self.delivered
            .lock()
            .expect("mock channel deliveries")
            .push(signal);
        Ok(delivery_id)
    }
}

/// In-memory backup whose writes can be switched to fail.
#[derive(Clone, Default)]
pub struct FlakyBackupStore {
    inner: Arc<MemoryBackupStore>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl FlakyBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn raw(&self) -> Option<String> {
        self.inner.raw()
    }
}

#[async_trait]
impl BackupStore for FlakyBackupStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn load(&self) -> std::result::Result<Option<VenSnapshot>, PersistenceError> {
        self.inner.load().await
    }

    async fn store(&self, snapshot: &VenSnapshot) -> std::result::Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable {
                store: "flaky",
                reason: "scripted write failure".to_string(),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.store(snapshot).await
    }
}

/// Push client that records `(transport_address, signal)` pairs and can reject every push.
#[derive(Clone, Default)]
pub struct ScriptedPusher {
    pushed: Arc<Mutex<Vec<(String, EventSignal)>>>,
    reject: Arc<AtomicBool>,
}

impl ScriptedPusher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        let pusher = Self::default();
        pusher.reject.store(true, Ordering::SeqCst);
        pusher
    }

    pub fn pushed(&self) -> Vec<(String, EventSignal)> {
        self.pushed.lock().expect("mock pusher log").clone()
    }
}

#[async_trait]
impl EventPusher for ScriptedPusher {
    async fn push_event(
        &self,
        transport_address: &str,
        signal: &EventSignal,
    ) -> std::result::Result<String, DeliveryError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected {
                ven_id: signal.target.ven_id.clone(),
                reason: "scripted rejection".to_string(),
            });
        }
        self.pushed
            .lock()
            .expect("mock pusher log")
            .push((transport_address.to_string(), signal.clone()));
        Ok(format!("push-{}", signal.event_id))
    }
}

/// Report handler that fails for one resource and records what it saw for the others.
#[derive(Clone, Default)]
pub struct SelectiveReportHandler {
    failing_resource: Option<String>,
    seen: Arc<Mutex<Vec<(String, Vec<f64>)>>>,
}

impl SelectiveReportHandler {
    pub fn failing_for(resource_id: impl Into<String>) -> Self {
        Self {
            failing_resource: Some(resource_id.into()),
            seen: Arc::default(),
        }
    }

    /// `(resource_id, values)` per successful call, in call order.
    pub fn seen(&self) -> Vec<(String, Vec<f64>)> {
        self.seen.lock().expect("mock handler log").clone()
    }
}

#[async_trait]
impl ReportHandler for SelectiveReportHandler {
    async fn handle(&self, callback: &ReportCallback, samples: &[ReportSample]) -> Result<()> {
        let resource_id = &callback.target.resource_id;
        if self.failing_resource.as_deref() == Some(resource_id.as_str()) {
            return Err(vtn::err!("scripted handler failure for {resource_id}"));
        }
        self.seen.lock().expect("mock handler log").push((
            resource_id.clone(),
            samples.iter().map(|sample| sample.value).collect(),
        ));
        Ok(())
    }
}
