use crate::error::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::OnceLock;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "vtn=info,info";

/// Installs the process-wide subscriber. INFO and below go to stdout, WARN and above to stderr.
pub fn init_tracing() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stdout = std::io::stdout;
    let stderr = std::io::stderr;

    let writer = stdout
        .with_max_level(tracing::Level::INFO)
        .or_else(stderr.with_min_level(tracing::Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PollOutcome {
    DistributeEvent,
    CreateReport,
    Empty,
}

impl PollOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PollOutcome::DistributeEvent => "distribute_event",
            PollOutcome::CreateReport => "create_report",
            PollOutcome::Empty => "empty",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelReason {
    Operator,
    DeliveryFailure,
    Shutdown,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Operator => "operator",
            CancelReason::DeliveryFailure => "delivery_failure",
            CancelReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Default)]
pub struct RuntimeCounters {
    events_delivered: AtomicU64,
    event_delivery_failures: AtomicU64,
    report_values_ingested: AtomicU64,
    report_values_unroutable: AtomicU64,
    report_callback_failures: AtomicU64,
    backup_writes: AtomicU64,
    backup_write_failures: AtomicU64,
    polls: Mutex<BTreeMap<PollOutcome, u64>>,
    cancellations: Mutex<BTreeMap<CancelReason, u64>>,
    event_responses: Mutex<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeCountersSnapshot {
    pub events_delivered: u64,
    pub event_delivery_failures: u64,
    pub report_values_ingested: u64,
    pub report_values_unroutable: u64,
    pub report_callback_failures: u64,
    pub backup_writes: u64,
    pub backup_write_failures: u64,
    pub polls: Vec<(&'static str, u64)>,
    pub cancellations: Vec<(&'static str, u64)>,
    pub event_responses: Vec<(String, u64)>,
}

static RUNTIME_COUNTERS: OnceLock<RuntimeCounters> = OnceLock::new();

pub fn runtime_counters() -> &'static RuntimeCounters {
    RUNTIME_COUNTERS.get_or_init(RuntimeCounters::default)
}

impl RuntimeCounters {
    pub fn inc_events_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_event_delivery_failures(&self) {
        self.event_delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_report_values_ingested(&self, count: u64) {
        self.report_values_ingested
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_report_values_unroutable(&self, count: u64) {
        self.report_values_unroutable
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_report_callback_failures(&self) {
        self.report_callback_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backup_writes(&self) {
        self.backup_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backup_write_failures(&self) {
        self.backup_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll(&self, outcome: PollOutcome) {
        let mut guard = self.polls.lock().expect("poll counters poisoned");
        *guard.entry(outcome).or_insert(0) += 1;
    }

    pub fn record_cancellation(&self, reason: CancelReason) {
        let mut guard = self
            .cancellations
            .lock()
            .expect("cancellation counters poisoned");
        *guard.entry(reason).or_insert(0) += 1;
    }

    pub fn record_event_response(&self, opt_type: &str) {
        let mut guard = self
            .event_responses
            .lock()
            .expect("event response counters poisoned");
        *guard.entry(opt_type.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        let polls = self
            .polls
            .lock()
            .expect("poll counters poisoned")
            .iter()
            .map(|(outcome, total)| (outcome.as_str(), *total))
            .collect();
        let cancellations = self
            .cancellations
            .lock()
            .expect("cancellation counters poisoned")
            .iter()
            .map(|(reason, total)| (reason.as_str(), *total))
            .collect();
        let event_responses = self
            .event_responses
            .lock()
            .expect("event response counters poisoned")
            .iter()
            .map(|(opt, total)| (opt.clone(), *total))
            .collect();

        RuntimeCountersSnapshot {
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            event_delivery_failures: self.event_delivery_failures.load(Ordering::Relaxed),
            report_values_ingested: self.report_values_ingested.load(Ordering::Relaxed),
            report_values_unroutable: self.report_values_unroutable.load(Ordering::Relaxed),
            report_callback_failures: self.report_callback_failures.load(Ordering::Relaxed),
            backup_writes: self.backup_writes.load(Ordering::Relaxed),
            backup_write_failures: self.backup_write_failures.load(Ordering::Relaxed),
            polls,
            cancellations,
            event_responses,
        }
    }
}
