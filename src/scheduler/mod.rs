#![forbid(unsafe_code)]

//! One-shot and periodic event dispatch with cooperative cancellation.

pub mod dispatch;
pub mod resolve;

pub use dispatch::{EventChannel, PollQueueChannel, PushChannel, SignalTemplate};
pub use resolve::{ResolvedValue, ValueResolver, ValueSource};

use crate::error::{Error, Result};
use crate::registry::VenRegistry;
use crate::sink::MetricSink;
use crate::telemetry::{runtime_counters, CancelReason};
use crate::ven_event;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Public view of one live task.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventTaskInfo {
    pub task_id: String,
    pub ven_id: String,
    pub resource_ids: Vec<String>,
    pub value: Option<f64>,
    #[serde(with = "crate::scheduler::optional_secs")]
    pub period: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

struct TaskEntry {
    info: EventTaskInfo,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Result of one dispatch round that delivered to every target.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoundOutcome {
    pub delivered: Vec<(String, f64)>,
    /// Set when cancellation stopped the round before every target was reached.
    pub interrupted: bool,
}

#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub template: SignalTemplate,
    /// Delay before the first round of a scheduled task.
    pub initial_delay: Duration,
}

struct SchedulerInner {
    registry: Arc<VenRegistry>,
    sink: Arc<MetricSink>,
    resolver: ValueResolver,
    channel: Arc<dyn EventChannel>,
    settings: SchedulerSettings,
    tasks: Mutex<BTreeMap<String, TaskEntry>>,
}

/// Owns the live task set. Each task holds its own cancellation token and checks it before every
/// round and between targets.
#[derive(Clone)]
pub struct EventScheduler {
    inner: Arc<SchedulerInner>,
}

impl EventScheduler {
    pub fn new(
        registry: Arc<VenRegistry>,
        sink: Arc<MetricSink>,
        resolver: ValueResolver,
        channel: Arc<dyn EventChannel>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                sink,
                resolver,
                channel,
                settings,
                tasks: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn channel_name(&self) -> &'static str {
        self.inner.channel.name()
    }

    /// Schedules a single round for the VEN.
    pub fn schedule_once(&self, ven_id: &str, value: Option<f64>) -> Result<String> {
        self.spawn_task(ven_id, None, value)
    }

    /// Schedules a round every `period`. A zero period behaves like [`schedule_once`].
    ///
    /// [`schedule_once`]: EventScheduler::schedule_once
    pub fn schedule_periodic(
        &self,
        ven_id: &str,
        period: Duration,
        value: Option<f64>,
    ) -> Result<String> {
        let period = (!period.is_zero()).then_some(period);
        self.spawn_task(ven_id, period, value)
    }

    /// Runs one untracked round right away. Failures are returned to the caller.
    pub async fn dispatch_now(&self, ven_id: &str, value: Option<f64>) -> Result<RoundOutcome> {
        self.ensure_known(ven_id)?;
        self.inner.run_round(ven_id, value, None).await
    }

    /// Stops the task from starting any further round.
    pub fn cancel(&self, task_id: &str) -> Result<EventTaskInfo> {
        self.inner
            .cancel_task(task_id, CancelReason::Operator)
            .ok_or_else(|| Error::UnknownTask {
                task_id: task_id.to_string(),
            })
    }

    /// Cancels every live task and waits for in-flight rounds to wind down.
    pub async fn stop_all(&self) -> usize {
        let entries: Vec<TaskEntry> = {
            let mut tasks = self.inner.tasks.lock().expect("task registry poisoned");
            std::mem::take(&mut *tasks).into_values().collect()
        };

        let stopped = entries.len();
        let counters = runtime_counters();
        let mut handles = Vec::with_capacity(stopped);
        for entry in entries {
            entry.token.cancel();
            counters.record_cancellation(CancelReason::Shutdown);
            if let Some(handle) = entry.handle {
                handles.push(handle);
            }
        }
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(target: "vtn::scheduler", error = %err, "event task ended abnormally");
            }
        }

        if stopped > 0 {
            tracing::info!(target: "vtn::scheduler", stopped, "stopped all event tasks");
        }
        stopped
    }

    pub fn list(&self) -> Vec<EventTaskInfo> {
        self.inner
            .tasks
            .lock()
            .expect("task registry poisoned")
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn is_live(&self, task_id: &str) -> bool {
        self.inner
            .tasks
            .lock()
            .expect("task registry poisoned")
            .contains_key(task_id)
    }

    /// Only VENs that registered during this process lifetime can be scheduled; a record restored
    /// from the backup has no event targets until the VEN registers again.
    fn ensure_known(&self, ven_id: &str) -> Result<()> {
        if !self.inner.registry.is_registered(ven_id) {
            return Err(Error::UnknownVen {
                ven_id: ven_id.to_string(),
            });
        }
        Ok(())
    }

    fn spawn_task(&self, ven_id: &str, period: Option<Duration>, value: Option<f64>) -> Result<String> {
        self.ensure_known(ven_id)?;

        let task_id = new_task_id(ven_id);
        let token = CancellationToken::new();
        let info = EventTaskInfo {
            task_id: task_id.clone(),
            ven_id: ven_id.to_string(),
            resource_ids: self
                .inner
                .sink
                .event_targets(ven_id)
                .into_iter()
                .map(|(resource, _)| resource)
                .collect(),
            value,
            period,
            created_at: Utc::now(),
        };

        self.inner
            .tasks
            .lock()
            .expect("task registry poisoned")
            .insert(
                task_id.clone(),
                TaskEntry {
                    info,
                    token: token.clone(),
                    handle: None,
                },
            );

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_task(
            inner,
            task_id.clone(),
            ven_id.to_string(),
            period,
            value,
            token,
        ));

        if let Some(entry) = self
            .inner
            .tasks
            .lock()
            .expect("task registry poisoned")
            .get_mut(&task_id)
        {
            entry.handle = Some(handle);
        }

        ven_event!(
            info,
            "vtn::scheduler",
            "event_task_scheduled",
            ven = ven_id,
            task_id = task_id,
            period = period
                .map(|p| humantime::format_duration(p).to_string())
                .unwrap_or_else(|| "once".to_string())
        );
        Ok(task_id)
    }
}

fn new_task_id(ven_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{ven_id}_{}", &suffix[..8])
}

/// Waits out `delay` unless the task is cancelled first. Returns `true` on cancellation.
async fn wait_or_cancelled(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn run_task(
    inner: Arc<SchedulerInner>,
    task_id: String,
    ven_id: String,
    period: Option<Duration>,
    value: Option<f64>,
    token: CancellationToken,
) {
    if wait_or_cancelled(inner.settings.initial_delay, &token).await {
        return;
    }

    loop {
        if token.is_cancelled() {
            return;
        }

        if let Err(err) = inner.run_round(&ven_id, value, Some(&token)).await {
            ven_event!(
                error,
                "vtn::scheduler",
                "event_task_failed",
                ven = ven_id,
                task_id = task_id,
                error = err
            );
            inner.cancel_task(&task_id, CancelReason::DeliveryFailure);
            return;
        }

        let Some(period) = period else {
            inner.finish_task(&task_id);
            return;
        };
        if wait_or_cancelled(period, &token).await {
            return;
        }
    }
}

impl SchedulerInner {
    async fn run_round(
        &self,
        ven_id: &str,
        explicit: Option<f64>,
        token: Option<&CancellationToken>,
    ) -> Result<RoundOutcome> {
        let targets = self.sink.event_targets(ven_id);
        if targets.is_empty() {
            ven_event!(warn, "vtn::scheduler", "no_event_targets", ven = ven_id);
        }

        let counters = runtime_counters();
        let mut outcome = RoundOutcome::default();
        for (resource_id, series) in targets {
            if token.is_some_and(CancellationToken::is_cancelled) {
                outcome.interrupted = true;
                break;
            }

            let resolved = self.resolver.resolve(ven_id, &resource_id, explicit).await;
            let signal = self
                .settings
                .template
                .build(ven_id, &resource_id, resolved.value);
            let event_id = signal.event_id.clone();

            match self.channel.deliver(signal).await {
                Ok(delivery_id) => {
                    series.record(resolved.value);
                    counters.inc_events_delivered();
                    ven_event!(
                        info,
                        "vtn::scheduler",
                        "event_delivered",
                        ven = ven_id,
                        resource = resource_id,
                        event_id = event_id,
                        delivery_id = delivery_id,
                        value = resolved.value,
                        source = resolved.source.as_str()
                    );
                    outcome.delivered.push((resource_id, resolved.value));
                }
                Err(err) => {
                    counters.inc_event_delivery_failures();
                    ven_event!(
                        warn,
                        "vtn::scheduler",
                        "event_delivery_failed",
                        ven = ven_id,
                        resource = resource_id,
                        event_id = event_id,
                        error = err
                    );
                    return Err(Error::DeliveryFailure(err));
                }
            }
        }
        Ok(outcome)
    }

    fn cancel_task(&self, task_id: &str, reason: CancelReason) -> Option<EventTaskInfo> {
        let entry = self
            .tasks
            .lock()
            .expect("task registry poisoned")
            .remove(task_id)?;
        entry.token.cancel();
        runtime_counters().record_cancellation(reason);
        ven_event!(
            info,
            "vtn::scheduler",
            "event_task_cancelled",
            ven = entry.info.ven_id,
            task_id = task_id,
            reason = reason.as_str()
        );
        Some(entry.info)
    }

    fn finish_task(&self, task_id: &str) {
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .remove(task_id);
    }
}

pub(crate) mod optional_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }
}
