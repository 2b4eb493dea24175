use crate::domain::duration_secs;
use crate::error::{Error, Result};
use crate::poll::PollResponder;
use crate::registry::{PreregisteredVen, RegistrationPolicy};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct VtnConfig {
    #[serde(default = "default_vtn_id")]
    pub vtn_id: String,
    #[serde(default)]
    pub mode: VtnMode,
    #[serde(default)]
    pub poll_responder: PollResponder,
    #[serde(default = "ListenerConfig::protocol_default")]
    pub protocol: ListenerConfig,
    #[serde(default)]
    pub management: ManagementConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub preregistration: BTreeMap<String, PreregistrationEntry>,
    #[serde(default)]
    pub report_defaults: ReportDefaults,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VtnMode {
    /// VENs fetch events by polling.
    #[default]
    Poll,
    /// Events are sent straight to preregistered VENs.
    Push,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_protocol_port")]
    pub port: u16,
}

impl ListenerConfig {
    fn protocol_default() -> Self {
        Self {
            host: default_host(),
            port: default_protocol_port(),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagementConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_management_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_management_port(),
            metrics_path: default_metrics_path(),
        }
    }
}

impl ManagementConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub kind: BackupKind,
    #[serde(default = "default_backup_url")]
    pub url: String,
    #[serde(default = "default_backup_key")]
    pub key: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            kind: BackupKind::default(),
            url: default_backup_url(),
            key: default_backup_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    /// Base URL of the Prometheus HTTP API holding flex forecasts.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_forecast_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: default_forecast_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_signal_name")]
    pub signal_name: String,
    /// Defaults to `setpoint` in poll mode and `delta` in push mode.
    #[serde(default)]
    pub signal_type: Option<String>,
    #[serde(default = "default_market_context")]
    pub market_context: String,
    #[serde(default = "default_start_offset", with = "duration_secs")]
    pub start_offset: Duration,
    #[serde(default = "default_event_duration", with = "duration_secs")]
    pub duration: Duration,
    #[serde(default = "default_initial_delay", with = "duration_secs")]
    pub initial_delay: Duration,
    #[serde(default)]
    pub fallback_min: f64,
    #[serde(default = "default_fallback_max")]
    pub fallback_max: f64,
    #[serde(default)]
    pub seed: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            signal_name: default_signal_name(),
            signal_type: None,
            market_context: default_market_context(),
            start_offset: default_start_offset(),
            duration: default_event_duration(),
            initial_delay: default_initial_delay(),
            fallback_min: 0.0,
            fallback_max: default_fallback_max(),
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreregistrationEntry {
    pub ven_id: String,
    pub registration_id: String,
    #[serde(default)]
    pub transport_address: Option<String>,
    #[serde(default)]
    pub reports: Vec<PreregisteredReport>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreregisteredReport {
    pub report_request_id: String,
    pub report_specifier_id: String,
    /// Item id inside the report; also used as the resource id.
    pub report_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportDefaults {
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_scale")]
    pub scale: String,
    #[serde(default = "default_sampling_interval", with = "duration_secs")]
    pub sampling_interval: Duration,
}

impl Default for ReportDefaults {
    fn default() -> Self {
        Self {
            measurement: default_measurement(),
            unit: default_unit(),
            scale: default_scale(),
            sampling_interval: default_sampling_interval(),
        }
    }
}

impl Default for VtnConfig {
    fn default() -> Self {
        Self {
            vtn_id: default_vtn_id(),
            mode: VtnMode::default(),
            poll_responder: PollResponder::default(),
            protocol: ListenerConfig::protocol_default(),
            management: ManagementConfig::default(),
            backup: BackupConfig::default(),
            forecast: ForecastConfig::default(),
            events: EventsConfig::default(),
            preregistration: BTreeMap::new(),
            report_defaults: ReportDefaults::default(),
        }
    }
}

fn default_vtn_id() -> String {
    "VTN_AIT".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_protocol_port() -> u16 {
    8082
}

const fn default_management_port() -> u16 {
    5001
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_backup_url() -> String {
    "redis://redis:6379".to_string()
}

fn default_backup_key() -> String {
    crate::registry::backup::DEFAULT_BACKUP_KEY.to_string()
}

const fn default_forecast_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_signal_name() -> String {
    "LOAD_DISPATCH".to_string()
}

fn default_market_context() -> String {
    "oadr://my_market".to_string()
}

const fn default_start_offset() -> Duration {
    Duration::from_secs(5 * 60)
}

const fn default_event_duration() -> Duration {
    Duration::from_secs(10 * 60)
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_fallback_max() -> f64 {
    10.0
}

fn default_measurement() -> String {
    "REAL_POWER".to_string()
}

fn default_unit() -> String {
    "W".to_string()
}

fn default_scale() -> String {
    "k".to_string()
}

const fn default_sampling_interval() -> Duration {
    Duration::from_secs(2)
}

impl VtnConfig {
    /// Layers `config/vtn.*` (optional) and `VTN__*` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_with(File::with_name("config/vtn").required(false))
    }

    /// Same as [`VtnConfig::load`] with an explicit, required config file.
    pub fn load_from(path: &str) -> Result<Self> {
        Self::load_with(File::with_name(path).required(true))
    }

    fn load_with<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: VtnConfig = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix("VTN").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: VtnConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vtn_id.trim().is_empty() {
            return Err(Error::msg("vtn_id must not be empty"));
        }
        if !self.events.fallback_min.is_finite() || !self.events.fallback_max.is_finite() {
            return Err(Error::msg("events fallback range must be finite"));
        }
        if self.events.fallback_min > self.events.fallback_max {
            return Err(crate::err!(
                "events.fallback_min ({}) exceeds events.fallback_max ({})",
                self.events.fallback_min,
                self.events.fallback_max
            ));
        }
        if self.mode == VtnMode::Push && self.preregistration.is_empty() {
            return Err(Error::msg(
                "push mode requires at least one preregistered VEN",
            ));
        }
        if !self.management.metrics_path.starts_with('/') {
            return Err(crate::err!(
                "management.metrics_path `{}` must start with `/`",
                self.management.metrics_path
            ));
        }
        Ok(())
    }

    pub fn signal_type(&self) -> String {
        self.events.signal_type.clone().unwrap_or_else(|| {
            match self.mode {
                VtnMode::Poll => "setpoint",
                VtnMode::Push => "delta",
            }
            .to_string()
        })
    }

    /// Push mode only admits preregistered names.
    pub fn registration_policy(&self) -> RegistrationPolicy {
        match self.mode {
            VtnMode::Poll => RegistrationPolicy::Open,
            VtnMode::Push => RegistrationPolicy::Preregistered(
                self.preregistration
                    .iter()
                    .map(|(name, entry)| {
                        (
                            name.clone(),
                            PreregisteredVen {
                                ven_id: entry.ven_id.clone(),
                                registration_id: entry.registration_id.clone(),
                                transport_address: entry.transport_address.clone(),
                            },
                        )
                    })
                    .collect(),
            ),
        }
    }
}
