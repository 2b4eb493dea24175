use crate::config::{VtnConfig, VtnMode};
use crate::domain::{PendingReportRequest, DEFAULT_RESOURCE_ID};
use crate::error::{Context, Error, Result};
use crate::metrics::metrics;
use crate::poll::PollMultiplexer;
use crate::protocol::{
    CreatedReport, EventPusher, EventResponse, PollResponse, RegistrationInfo,
    RegistrationOutcome, ReportOffer, UpdateReport,
};
use crate::registry::{BackupStore, ReportRegistration, VenRegistry};
use crate::report::{IngestSummary, ReportHandler, ReportItemSpec, ReportPipeline};
use crate::scheduler::{
    EventChannel, EventScheduler, EventTaskInfo, PollQueueChannel, PushChannel, SchedulerSettings,
    SignalTemplate, ValueResolver,
};
use crate::sink::{ForecastReader, MetricSink};
use crate::ven_event;
use std::sync::Arc;
use std::time::Duration;

/// Optional collaborators wired into the state at start-up.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub forecast: Option<Arc<dyn ForecastReader>>,
    /// Required in push mode unless `channel` is given.
    pub pusher: Option<Arc<dyn EventPusher>>,
    /// Replaces the event channel implied by the mode.
    pub channel: Option<Arc<dyn EventChannel>>,
    pub report_handler: Option<Arc<dyn ReportHandler>>,
}

/// Everything a protocol or operator handler needs, created at start-up and shared by reference.
pub struct VtnState {
    pub vtn_id: String,
    pub mode: VtnMode,
    pub registry: Arc<VenRegistry>,
    pub sink: Arc<MetricSink>,
    pub multiplexer: Arc<PollMultiplexer>,
    pub pipeline: Arc<ReportPipeline>,
    pub scheduler: EventScheduler,
}

impl VtnState {
    pub async fn initialise(
        config: &VtnConfig,
        store: Arc<dyn BackupStore>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let registry = Arc::new(
            VenRegistry::load(store, config.registration_policy())
                .await
                .context("failed to load VEN registry from backup")?,
        );

        let mut sink = MetricSink::new(&config.vtn_id, &config.events.signal_name);
        if let Some(reader) = collaborators.forecast {
            sink = sink.with_forecast_reader(reader);
        }
        let sink = Arc::new(sink);

        let multiplexer = Arc::new(PollMultiplexer::new(config.poll_responder));

        let mut pipeline = ReportPipeline::new(registry.clone(), sink.clone(), multiplexer.clone());
        if let Some(handler) = collaborators.report_handler {
            pipeline = pipeline.with_handler(handler);
        }
        let pipeline = Arc::new(pipeline);

        let channel: Arc<dyn EventChannel> = match (collaborators.channel, config.mode) {
            (Some(channel), _) => channel,
            (None, VtnMode::Poll) => Arc::new(PollQueueChannel::new(multiplexer.clone())),
            (None, VtnMode::Push) => {
                let pusher = collaborators
                    .pusher
                    .ok_or_else(|| Error::msg("push mode requires an event push client"))?;
                Arc::new(PushChannel::new(pusher, registry.clone(), sink.clone()))
            }
        };

        let resolver = ValueResolver::new(
            sink.clone(),
            config.events.fallback_min,
            config.events.fallback_max,
            config.events.seed,
        );
        let scheduler = EventScheduler::new(
            registry.clone(),
            sink.clone(),
            resolver,
            channel,
            SchedulerSettings {
                template: SignalTemplate {
                    signal_name: config.events.signal_name.clone(),
                    signal_type: config.signal_type(),
                    market_context: config.events.market_context.clone(),
                    start_offset: config.events.start_offset,
                    duration: config.events.duration,
                },
                initial_delay: config.events.initial_delay,
            },
        );

        let state = Self {
            vtn_id: config.vtn_id.clone(),
            mode: config.mode,
            registry,
            sink,
            multiplexer,
            pipeline,
            scheduler,
        };

        if config.mode == VtnMode::Push {
            state.preregister_vens(config).await?;
        }

        tracing::info!(
            target: "vtn::state",
            vtn_id = %state.vtn_id,
            mode = ?state.mode,
            channel = state.scheduler.channel_name(),
            vens = state.registry.len(),
            "VTN state initialised"
        );
        Ok(state)
    }

    /// `oadrCreatePartyRegistration`: resolves the identity and re-installs persisted report
    /// routes for the VEN.
    pub async fn on_create_party_registration(
        &self,
        info: &RegistrationInfo,
    ) -> Result<RegistrationOutcome> {
        let outcome = match self.registry.resolve_or_create(&info.ven_name).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    target: "vtn::state",
                    ven_name = %info.ven_name,
                    error = %err,
                    "registration refused"
                );
                return Err(err);
            }
        };

        self.sink.init_ven(&outcome.ven_id);
        if let Some(record) = self.registry.lookup(&outcome.ven_id) {
            self.pipeline.restore(&record);
        }
        Ok(outcome)
    }

    /// Lookup used by the protocol layer to authenticate a `ven_id`.
    pub fn ven_lookup(&self, ven_id: &str) -> Option<String> {
        self.registry.registration_for(ven_id)
    }

    /// `oadrRegisterReport`
    pub async fn on_register_report(&self, offer: &ReportOffer) -> Result<PendingReportRequest> {
        self.ensure_registered(&offer.ven_id)?;
        self.pipeline.register_offer(offer).await
    }

    /// `oadrCreatedReport`
    pub async fn on_created_report(&self, created: &CreatedReport) -> Result<usize> {
        self.ensure_registered(&created.ven_id)?;
        self.pipeline
            .record_created(&created.ven_id, &created.report_request_ids)
            .await
    }

    /// `oadrUpdateReport`
    pub async fn on_update_report(&self, update: &UpdateReport) -> IngestSummary {
        let mut total = IngestSummary::default();
        for report in &update.reports {
            let summary = self
                .pipeline
                .ingest(&report.report_request_id, &report.intervals)
                .await;
            total.routed += summary.routed;
            total.unroutable += summary.unroutable;
            total.failed_groups += summary.failed_groups;
        }
        total
    }

    /// `oadrPoll`
    pub fn on_poll(&self, ven_id: &str) -> Result<PollResponse> {
        self.ensure_registered(ven_id)?;
        Ok(self.multiplexer.poll(ven_id))
    }

    /// `oadrCreatedEvent`
    pub fn on_event_response(&self, response: &EventResponse) {
        metrics().record_event_response(response.opt_type.as_str());
        ven_event!(
            info,
            "vtn::state",
            "event_response",
            ven = response.ven_id,
            event_id = response.event_id,
            opt_type = response.opt_type.as_str()
        );
    }

    /// Operator command: one-shot when `period` is absent or zero, periodic otherwise.
    pub fn create_event(
        &self,
        ven_id: &str,
        period: Option<Duration>,
        value: Option<f64>,
    ) -> Result<String> {
        match period {
            Some(period) => self.scheduler.schedule_periodic(ven_id, period, value),
            None => self.scheduler.schedule_once(ven_id, value),
        }
    }

    pub fn list_tasks(&self) -> Vec<EventTaskInfo> {
        self.scheduler.list()
    }

    pub fn cancel_task(&self, task_id: &str) -> Result<EventTaskInfo> {
        self.scheduler.cancel(task_id)
    }

    pub async fn shutdown(&self) -> usize {
        self.scheduler.stop_all().await
    }

    fn ensure_registered(&self, ven_id: &str) -> Result<()> {
        if self.registry.registration_for(ven_id).is_none() {
            return Err(Error::UnknownVen {
                ven_id: ven_id.to_string(),
            });
        }
        Ok(())
    }

    /// Registers every preregistered VEN and installs its configured reports.
    async fn preregister_vens(&self, config: &VtnConfig) -> Result<()> {
        let defaults = &config.report_defaults;
        for (ven_name, entry) in &config.preregistration {
            let outcome = self
                .on_create_party_registration(&RegistrationInfo {
                    ven_name: ven_name.clone(),
                    transport_address: entry.transport_address.clone(),
                })
                .await
                .with_context(|| format!("failed to preregister VEN `{ven_name}`"))?;

            let mut registrations = Vec::with_capacity(entry.reports.len());
            for report in &entry.reports {
                let resource_id = if report.report_id.trim().is_empty() {
                    DEFAULT_RESOURCE_ID
                } else {
                    report.report_id.as_str()
                };
                let (callback, _) = self
                    .pipeline
                    .register_report(
                        &outcome.ven_id,
                        ReportItemSpec {
                            resource_id,
                            measurement: &defaults.measurement,
                            unit: Some(defaults.unit.as_str()),
                            scale: Some(defaults.scale.as_str()),
                            min_interval: defaults.sampling_interval,
                            max_interval: defaults.sampling_interval,
                        },
                    )
                    .await?;
                registrations.push(ReportRegistration {
                    report_request_id: report.report_request_id.clone(),
                    item_id: report.report_id.clone(),
                    target: callback.target.clone(),
                });
                self.pipeline
                    .install(&report.report_request_id, &report.report_id, callback);
            }

            if !registrations.is_empty() {
                self.registry
                    .record_report_registrations(&outcome.ven_id, &registrations)
                    .await?;
            }
            ven_event!(
                info,
                "vtn::state",
                "ven_preregistered",
                ven = outcome.ven_id,
                reports = registrations.len()
            );
        }
        Ok(())
    }
}
