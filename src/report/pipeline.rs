#![forbid(unsafe_code)]

use super::normalize::{normalize, ReportSample};
use crate::domain::{
    PendingReportRequest, ReportTarget, SpecifierPayload, VenRecord, DEFAULT_RESOURCE_ID,
};
use crate::error::{Error, Result};
use crate::poll::PollMultiplexer;
use crate::protocol::{ReportInterval, ReportOffer};
use crate::registry::{ReportRegistration, VenRegistry};
use crate::sink::{MetricSink, SeriesHandle};
use crate::telemetry::runtime_counters;
use crate::ven_event;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Routing entry for one report item: where values go and the series that stores them.
#[derive(Clone, Debug)]
pub struct ReportCallback {
    pub target: ReportTarget,
    pub series: SeriesHandle,
}

/// Consumer of routed report values.
#[async_trait]
pub trait ReportHandler: Send + Sync {
    async fn handle(&self, callback: &ReportCallback, samples: &[ReportSample]) -> Result<()>;
}

/// Writes every sample into the callback's metric series.
#[derive(Default)]
pub struct SinkRecorder;

#[async_trait]
impl ReportHandler for SinkRecorder {
    async fn handle(&self, callback: &ReportCallback, samples: &[ReportSample]) -> Result<()> {
        for sample in samples {
            callback.series.record(sample.value);
            ven_event!(
                debug,
                "vtn::report",
                "report_value",
                ven = callback.target.ven_id,
                resource = callback.target.resource_id,
                measurement = callback.target.measurement,
                dtstart = sample.dtstart,
                value = sample.value
            );
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub routed: u64,
    pub unroutable: u64,
    pub failed_groups: u64,
}

/// Parameters of one offered report item.
#[derive(Clone, Debug)]
pub struct ReportItemSpec<'a> {
    pub resource_id: &'a str,
    pub measurement: &'a str,
    pub unit: Option<&'a str>,
    pub scale: Option<&'a str>,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

type RouteKey = (String, String);

/// Report registration, routing table and ingestion.
pub struct ReportPipeline {
    registry: Arc<VenRegistry>,
    sink: Arc<MetricSink>,
    multiplexer: Arc<PollMultiplexer>,
    handler: Arc<dyn ReportHandler>,
    /// `(report_request_id, item_id) -> callback`
    routes: RwLock<HashMap<RouteKey, ReportCallback>>,
    callbacks: Mutex<HashMap<ReportTarget, ReportCallback>>,
}

impl ReportPipeline {
    pub fn new(
        registry: Arc<VenRegistry>,
        sink: Arc<MetricSink>,
        multiplexer: Arc<PollMultiplexer>,
    ) -> Self {
        Self {
            registry,
            sink,
            multiplexer,
            handler: Arc::new(SinkRecorder),
            routes: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ReportHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Accepts one report item. The chosen sampling interval is always the VEN's minimum.
    /// Registering the same `(ven, resource, measurement)` again returns the existing callback.
    pub async fn register_report(
        &self,
        ven_id: &str,
        item: ReportItemSpec<'_>,
    ) -> Result<(ReportCallback, Duration)> {
        if self.registry.lookup(ven_id).is_none() {
            return Err(Error::UnknownVen {
                ven_id: ven_id.to_string(),
            });
        }

        let callback = self.callback_for(ReportTarget::new(ven_id, item.resource_id, item.measurement));
        self.registry.record_resource(ven_id, item.resource_id).await?;

        ven_event!(
            info,
            "vtn::report",
            "report_registered",
            ven = ven_id,
            resource = item.resource_id,
            measurement = item.measurement,
            unit = item.unit.unwrap_or("-"),
            scale = item.scale.unwrap_or("-"),
            min_interval = humantime::format_duration(item.min_interval),
            max_interval = humantime::format_duration(item.max_interval)
        );
        Ok((callback, item.min_interval))
    }

    /// Routes `(report_request_id, item_id)` to the callback. Existing routes are kept.
    pub fn install(&self, report_request_id: &str, item_id: &str, callback: ReportCallback) -> bool {
        let mut routes = self.routes.write().expect("report routes poisoned");
        let key = (report_request_id.to_string(), item_id.to_string());
        if routes.contains_key(&key) {
            return false;
        }
        routes.insert(key, callback);
        true
    }

    pub fn route(&self, report_request_id: &str, item_id: &str) -> Option<ReportCallback> {
        self.routes
            .read()
            .expect("report routes poisoned")
            .get(&(report_request_id.to_string(), item_id.to_string()))
            .cloned()
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().expect("report routes poisoned").len()
    }

    /// Handles a whole report offering: one request id, one route per description, and a
    /// pending report request raised for the VEN's next poll.
    pub async fn register_offer(&self, offer: &ReportOffer) -> Result<PendingReportRequest> {
        if offer.report_descriptions.is_empty() {
            crate::bail_err!(
                "report offering `{}` from `{}` has no descriptions",
                offer.report_specifier_id,
                offer.ven_id
            );
        }

        let report_request_id = Uuid::new_v4().to_string();
        let mut items = Vec::with_capacity(offer.report_descriptions.len());
        let mut granularity: Option<Duration> = None;

        for description in &offer.report_descriptions {
            let resource_id = description
                .resource_id
                .as_deref()
                .unwrap_or(DEFAULT_RESOURCE_ID);
            let (callback, chosen) = self
                .register_report(
                    &offer.ven_id,
                    ReportItemSpec {
                        resource_id,
                        measurement: &description.measurement,
                        unit: description.unit.as_deref(),
                        scale: description.scale.as_deref(),
                        min_interval: description.min_period,
                        max_interval: description.max_period,
                    },
                )
                .await?;
            self.install(&report_request_id, &description.r_id, callback);
            items.push(SpecifierPayload {
                item_id: description.r_id.clone(),
                reading_type: description.reading_type.clone(),
            });
            granularity = Some(granularity.map_or(chosen, |current| current.min(chosen)));
        }

        let granularity = granularity.unwrap_or_default();
        let request = PendingReportRequest {
            report_request_id,
            report_specifier_id: offer.report_specifier_id.clone(),
            granularity,
            report_back_duration: granularity,
            items,
        };
        if let Some(superseded) = self
            .multiplexer
            .add_report_request(&offer.ven_id, request.clone())
        {
            self.drop_unconfirmed_routes(&offer.ven_id, &superseded);
        }

        ven_event!(
            info,
            "vtn::report",
            "report_request_queued",
            ven = offer.ven_id,
            report_request_id = request.report_request_id,
            items = request.items.len()
        );
        Ok(request)
    }

    /// Removes the routes of a replaced request unless the VEN already confirmed it; confirmed
    /// requests stay routable until the VEN confirms the replacement.
    fn drop_unconfirmed_routes(&self, ven_id: &str, report_request_id: &str) {
        let confirmed = self
            .registry
            .lookup(ven_id)
            .is_some_and(|record| record.report_callbacks.contains_key(report_request_id));
        if confirmed {
            return;
        }
        let mut routes = self.routes.write().expect("report routes poisoned");
        let before = routes.len();
        routes.retain(|(request_id, _), _| request_id != report_request_id);
        tracing::debug!(
            target: "vtn::report",
            ven = %ven_id,
            report_request_id,
            routes = before - routes.len(),
            "dropped routes of superseded report request"
        );
    }

    /// Persists the routes of the confirmed report requests into the VEN's record, with a
    /// single backup write. Returns how many routing entries were written.
    pub async fn record_created(&self, ven_id: &str, report_request_ids: &[String]) -> Result<usize> {
        let wanted: BTreeSet<&str> = report_request_ids.iter().map(String::as_str).collect();
        let mut registrations: Vec<ReportRegistration> = self
            .routes
            .read()
            .expect("report routes poisoned")
            .iter()
            .filter(|((request_id, _), callback)| {
                wanted.contains(request_id.as_str()) && callback.target.ven_id == ven_id
            })
            .map(|((request_id, item_id), callback)| ReportRegistration {
                report_request_id: request_id.clone(),
                item_id: item_id.clone(),
                target: callback.target.clone(),
            })
            .collect();
        registrations.sort_by(|a, b| {
            (&a.report_request_id, &a.item_id).cmp(&(&b.report_request_id, &b.item_id))
        });

        if registrations.is_empty() {
            ven_event!(
                debug,
                "vtn::report",
                "created_report_unmatched",
                ven = ven_id,
                requests = wanted.len()
            );
            return Ok(0);
        }

        self.registry
            .record_report_registrations(ven_id, &registrations)
            .await?;
        ven_event!(
            info,
            "vtn::report",
            "report_created",
            ven = ven_id,
            routes = registrations.len()
        );
        Ok(registrations.len())
    }

    /// Re-installs every persisted route of a VEN record. Returns how many routes were added.
    pub fn restore(&self, record: &VenRecord) -> usize {
        self.sink.init_ven(&record.ven_id);
        let mut restored = 0;
        for (request_id, item_id, target) in record.report_targets() {
            let callback = self.callback_for(target);
            if self.install(request_id, item_id, callback) {
                restored += 1;
            }
        }
        if restored > 0 {
            ven_event!(
                info,
                "vtn::report",
                "report_callbacks_restored",
                ven = record.ven_id,
                routes = restored
            );
        }
        restored
    }

    /// Routes report data. Unregistered items are dropped and counted; a failing handler does
    /// not stop the remaining groups.
    pub async fn ingest(
        &self,
        report_request_id: &str,
        intervals: &[ReportInterval],
    ) -> IngestSummary {
        let counters = runtime_counters();
        let mut summary = IngestSummary::default();

        for (item_id, samples) in normalize(intervals) {
            let count = samples.len() as u64;
            let Some(callback) = self.route(report_request_id, &item_id) else {
                summary.unroutable += count;
                counters.add_report_values_unroutable(count);
                tracing::debug!(
                    target: "vtn::report",
                    report_request_id,
                    item_id = %item_id,
                    values = count,
                    "dropping unroutable report data"
                );
                continue;
            };

            match self.handler.handle(&callback, &samples).await {
                Ok(()) => {
                    summary.routed += count;
                    counters.add_report_values_ingested(count);
                }
                Err(err) => {
                    summary.failed_groups += 1;
                    counters.inc_report_callback_failures();
                    ven_event!(
                        warn,
                        "vtn::report",
                        "report_callback_failed",
                        ven = callback.target.ven_id,
                        resource = callback.target.resource_id,
                        item_id = item_id,
                        error = err
                    );
                }
            }
        }
        summary
    }

    fn callback_for(&self, target: ReportTarget) -> ReportCallback {
        let mut callbacks = self.callbacks.lock().expect("report callbacks poisoned");
        callbacks
            .entry(target.clone())
            .or_insert_with(|| ReportCallback {
                series: self
                    .sink
                    .ensure_series(&target.ven_id, &target.resource_id, &target.measurement),
                target,
            })
            .clone()
    }
}
