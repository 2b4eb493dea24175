#![forbid(unsafe_code)]

//! Named gauges for report and event values, plus read-back of the latest sample.

pub mod forecast;

pub use forecast::{ForecastReader, PrometheusForecastReader};

use crate::domain::ReportTarget;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeriesKind {
    Report,
    Event,
    Forecast,
}

struct Series {
    name: String,
    help: String,
    kind: SeriesKind,
    bits: AtomicU64,
    sampled: AtomicBool,
}

/// Cheap handle to one series; clones point at the same gauge.
#[derive(Clone)]
pub struct SeriesHandle {
    inner: Arc<Series>,
}

impl std::fmt::Debug for SeriesHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesHandle")
            .field("name", &self.inner.name)
            .field("latest", &self.latest())
            .finish()
    }
}

impl SeriesHandle {
    fn new(name: String, help: String, kind: SeriesKind) -> Self {
        Self {
            inner: Arc::new(Series {
                name,
                help,
                kind,
                bits: AtomicU64::new(0f64.to_bits()),
                sampled: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn help(&self) -> &str {
        &self.inner.help
    }

    pub fn kind(&self) -> SeriesKind {
        self.inner.kind
    }

    pub fn record(&self, value: f64) {
        self.inner.bits.store(value.to_bits(), Ordering::Release);
        self.inner.sampled.store(true, Ordering::Release);
    }

    /// `None` until the first sample is recorded.
    pub fn latest(&self) -> Option<f64> {
        self.inner
            .sampled
            .load(Ordering::Acquire)
            .then(|| f64::from_bits(self.inner.bits.load(Ordering::Acquire)))
    }

    pub fn same_series(&self, other: &SeriesHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SeriesSnapshot {
    pub name: String,
    pub help: String,
    pub kind: SeriesKind,
    pub value: Option<f64>,
}

/// Restricts a series name to `[a-zA-Z0-9_:]`. A leading digit is prefixed with `_`; any other
/// character outside the set is dropped.
pub fn sanitize_series_name(raw: &str) -> String {
    let mut sanitized = String::with_capacity(raw.len() + 1);
    for ch in raw.chars() {
        let allowed = ch.is_ascii_alphanumeric() || ch == '_' || ch == ':';
        if !allowed {
            continue;
        }
        if sanitized.is_empty() && ch.is_ascii_digit() {
            sanitized.push('_');
        }
        sanitized.push(ch);
    }
    if sanitized.is_empty() {
        sanitized.push('_');
    }
    sanitized
}

pub struct MetricSink {
    vtn_id: String,
    event_type: String,
    series: RwLock<BTreeMap<String, SeriesHandle>>,
    reports: Mutex<HashMap<ReportTarget, SeriesHandle>>,
    /// `ven_id -> resource_id -> event series`
    event_targets: RwLock<BTreeMap<String, BTreeMap<String, SeriesHandle>>>,
    forecast: Option<Arc<dyn ForecastReader>>,
}

impl MetricSink {
    pub fn new(vtn_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            vtn_id: vtn_id.into(),
            event_type: event_type.into(),
            series: RwLock::new(BTreeMap::new()),
            reports: Mutex::new(HashMap::new()),
            event_targets: RwLock::new(BTreeMap::new()),
            forecast: None,
        }
    }

    pub fn with_forecast_reader(mut self, reader: Arc<dyn ForecastReader>) -> Self {
        self.forecast = Some(reader);
        self
    }

    pub fn report_series_name(&self, target: &ReportTarget) -> String {
        sanitize_series_name(&format!(
            "{}:REPORT:{}:{}:{}",
            self.vtn_id, target.ven_id, target.resource_id, target.measurement
        ))
    }

    pub fn event_series_name(&self, ven_id: &str, resource_id: &str) -> String {
        sanitize_series_name(&format!(
            "{}:EVENT:{}:{}:{}",
            self.vtn_id, ven_id, resource_id, self.event_type
        ))
    }

    /// Name of the externally supplied flexibility forecast for a VEN resource.
    pub fn flex_series_name(&self, ven_id: &str, resource_id: &str) -> String {
        sanitize_series_name(&format!("{}:FLEX:{}:{}", self.vtn_id, ven_id, resource_id))
    }

    /// Makes sure the VEN has an (initially empty) event target table.
    pub fn init_ven(&self, ven_id: &str) {
        self.event_targets
            .write()
            .expect("event target table poisoned")
            .entry(ven_id.to_string())
            .or_default();
    }

    /// Returns the report series for `(ven_id, resource_id, measurement)`, creating it and the
    /// resource's event series on first use.
    pub fn ensure_series(&self, ven_id: &str, resource_id: &str, measurement: &str) -> SeriesHandle {
        let target = ReportTarget::new(ven_id, resource_id, measurement);
        let mut reports = self.reports.lock().expect("report series table poisoned");
        if let Some(handle) = reports.get(&target) {
            return handle.clone();
        }

        let report = self.named_series(
            &self.report_series_name(&target),
            measurement,
            SeriesKind::Report,
        );
        reports.insert(target, report.clone());
        drop(reports);

        self.ensure_event_series(ven_id, resource_id);
        report
    }

    pub fn ensure_event_series(&self, ven_id: &str, resource_id: &str) -> SeriesHandle {
        let mut targets = self
            .event_targets
            .write()
            .expect("event target table poisoned");
        let resources = targets.entry(ven_id.to_string()).or_default();
        if let Some(handle) = resources.get(resource_id) {
            return handle.clone();
        }
        let handle = self.named_series(
            &self.event_series_name(ven_id, resource_id),
            &self.event_type,
            SeriesKind::Event,
        );
        resources.insert(resource_id.to_string(), handle.clone());
        handle
    }

    /// Get-or-create a series by (unsanitized) name.
    pub fn named_series(&self, name: &str, help: &str, kind: SeriesKind) -> SeriesHandle {
        let name = sanitize_series_name(name);
        let mut series = self.series.write().expect("series table poisoned");
        series
            .entry(name.clone())
            .or_insert_with(|| SeriesHandle::new(name, help.to_string(), kind))
            .clone()
    }

    pub fn record(&self, handle: &SeriesHandle, value: f64) {
        handle.record(value);
    }

    /// Latest sample of a series: the local gauge when it holds a sample, otherwise the remote
    /// forecast store. Lookup failures read as "no sample".
    pub async fn latest(&self, series_name: &str) -> Option<f64> {
        let name = sanitize_series_name(series_name);
        let local = self
            .series
            .read()
            .expect("series table poisoned")
            .get(&name)
            .and_then(SeriesHandle::latest);
        if local.is_some() {
            return local;
        }

        let reader = self.forecast.as_ref()?;
        match reader.latest(&name).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    target: "vtn::sink",
                    series = %name,
                    error = %err,
                    "forecast lookup failed"
                );
                None
            }
        }
    }

    /// Resources with an event series for the VEN, in resource-id order.
    pub fn event_targets(&self, ven_id: &str) -> Vec<(String, SeriesHandle)> {
        self.event_targets
            .read()
            .expect("event target table poisoned")
            .get(ven_id)
            .map(|resources| {
                resources
                    .iter()
                    .map(|(resource, handle)| (resource.clone(), handle.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<SeriesSnapshot> {
        self.series
            .read()
            .expect("series table poisoned")
            .values()
            .map(|handle| SeriesSnapshot {
                name: handle.name().to_string(),
                help: handle.help().to_string(),
                kind: handle.kind(),
                value: handle.latest(),
            })
            .collect()
    }
}
