#![forbid(unsafe_code)]

//! Value types shared by the registry, report pipeline, poll multiplexer and scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Resource id used when a report description carries no data source.
pub const DEFAULT_RESOURCE_ID: &str = "DEFAULT";

pub const VEN_ID_PREFIX: &str = "VEN_ID_";
pub const REGISTRATION_ID_PREFIX: &str = "REG_ID_";

/// Where a single report item is routed: the VEN, the resource it describes and what it measures.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReportTarget {
    pub ven_id: String,
    pub resource_id: String,
    pub measurement: String,
}

impl ReportTarget {
    pub fn new(
        ven_id: impl Into<String>,
        resource_id: impl Into<String>,
        measurement: impl Into<String>,
    ) -> Self {
        Self {
            ven_id: ven_id.into(),
            resource_id: resource_id.into(),
            measurement: measurement.into(),
        }
    }
}

impl Display for ReportTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.ven_id, self.resource_id, self.measurement)
    }
}

/// Persisted half of a report routing entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCallbackInfo {
    pub resource_id: String,
    pub measurement: String,
}

/// Durable metadata for one registered VEN.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenRecord {
    pub ven_id: String,
    pub ven_name: String,
    pub registration_id: String,
    #[serde(default)]
    pub resource_ids: BTreeSet<String>,
    /// `report_request_id -> report item id -> routing info`
    #[serde(default)]
    pub report_callbacks: BTreeMap<String, BTreeMap<String, ReportCallbackInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_address: Option<String>,
}

impl VenRecord {
    pub fn new(
        ven_id: impl Into<String>,
        ven_name: impl Into<String>,
        registration_id: impl Into<String>,
    ) -> Self {
        Self {
            ven_id: ven_id.into(),
            ven_name: ven_name.into(),
            registration_id: registration_id.into(),
            resource_ids: BTreeSet::new(),
            report_callbacks: BTreeMap::new(),
            transport_address: None,
        }
    }

    /// Records a routing entry. Returns `true` when the record changed.
    pub fn add_report_callback(
        &mut self,
        report_request_id: &str,
        item_id: &str,
        resource_id: &str,
        measurement: &str,
    ) -> bool {
        let items = self
            .report_callbacks
            .entry(report_request_id.to_string())
            .or_default();
        let mut changed = false;
        if !items.contains_key(item_id) {
            items.insert(
                item_id.to_string(),
                ReportCallbackInfo {
                    resource_id: resource_id.to_string(),
                    measurement: measurement.to_string(),
                },
            );
            changed = true;
        }
        changed | self.resource_ids.insert(resource_id.to_string())
    }

    /// Every persisted routing entry as `(report_request_id, item_id, target)`.
    pub fn report_targets(&self) -> impl Iterator<Item = (&str, &str, ReportTarget)> + '_ {
        self.report_callbacks
            .iter()
            .flat_map(move |(request_id, items)| {
                items.iter().map(move |(item_id, info)| {
                    (
                        request_id.as_str(),
                        item_id.as_str(),
                        ReportTarget::new(&self.ven_id, &info.resource_id, &info.measurement),
                    )
                })
            })
    }
}

pub fn default_ven_id(ven_name: &str) -> String {
    format!("{VEN_ID_PREFIX}{ven_name}")
}

pub fn default_registration_id(ven_name: &str) -> String {
    format!("{REGISTRATION_ID_PREFIX}{ven_name}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecifierPayload {
    pub item_id: String,
    pub reading_type: String,
}

/// Outgoing "start reporting" request queued until the VEN polls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReportRequest {
    pub report_request_id: String,
    pub report_specifier_id: String,
    #[serde(with = "duration_secs")]
    pub granularity: Duration,
    #[serde(with = "duration_secs")]
    pub report_back_duration: Duration,
    pub items: Vec<SpecifierPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTarget {
    pub ven_id: String,
    pub resource_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventInterval {
    pub dtstart: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub signal_payload: f64,
}

/// A control signal for one VEN resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSignal {
    pub event_id: String,
    pub target: EventTarget,
    pub signal_name: String,
    pub signal_type: String,
    pub market_context: String,
    pub priority: u32,
    pub intervals: Vec<EventInterval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<f64>,
}

impl EventSignal {
    pub fn value(&self) -> Option<f64> {
        self.intervals.first().map(|interval| interval.signal_payload)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptType {
    #[serde(rename = "optIn")]
    OptIn,
    #[serde(rename = "optOut")]
    OptOut,
}

impl OptType {
    pub fn as_str(self) -> &'static str {
        match self {
            OptType::OptIn => "optIn",
            OptType::OptOut => "optOut",
        }
    }
}

/// Durations travel as (fractional) seconds; humantime strings such as `"5s"` are accepted on input.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) if secs.is_finite() && secs >= 0.0 => {
                Ok(Duration::from_secs_f64(secs))
            }
            RawDuration::Seconds(secs) => Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {secs}"
            ))),
            RawDuration::Text(text) => {
                humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_callback_bookkeeping_is_idempotent() {
        let mut record = VenRecord::new("VEN_ID_HOUSE_001", "HOUSE_001", "REG_ID_HOUSE_001");

        assert!(record.add_report_callback("rr-1", "r-1", "R1", "REAL_POWER"));
        assert!(!record.add_report_callback("rr-1", "r-1", "R1", "REAL_POWER"));
        assert!(record.add_report_callback("rr-1", "r-2", "R1", "VOLTAGE"));

        assert_eq!(record.resource_ids.len(), 1);
        assert_eq!(record.report_callbacks["rr-1"].len(), 2);
    }

    #[test]
    fn record_round_trips_through_json_layout() {
        let raw = r#"{
            "ven_id": "VEN_ID_HOUSE_001",
            "ven_name": "HOUSE_001",
            "registration_id": "REG_ID_HOUSE_001",
            "resource_ids": ["R1"],
            "report_callbacks": {"rr-1": {"r-1": {"resource_id": "R1", "measurement": "REAL_POWER"}}}
        }"#;

        let record: VenRecord = serde_json::from_str(raw).expect("record parses");
        let targets: Vec<_> = record.report_targets().collect();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "rr-1");
        assert_eq!(targets[0].2, ReportTarget::new("VEN_ID_HOUSE_001", "R1", "REAL_POWER"));
    }

    #[test]
    fn durations_accept_seconds_and_humantime() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(with = "duration_secs")]
            value: Duration,
        }

        let numeric: Probe = serde_json::from_str(r#"{"value": 2.5}"#).expect("numeric");
        assert_eq!(numeric.value, Duration::from_millis(2500));

        let text: Probe = serde_json::from_str(r#"{"value": "5s"}"#).expect("text");
        assert_eq!(text.value, Duration::from_secs(5));

        assert!(serde_json::from_str::<Probe>(r#"{"value": -1}"#).is_err());
    }
}
