#![forbid(unsafe_code)]

//! Decoded OpenADR message payloads exchanged with the protocol collaborator, and the
//! outbound push capability. The XML codec itself lives outside this crate.

use crate::domain::{duration_secs, EventSignal, OptType, PendingReportRequest};
use crate::error::DeliveryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `oadrCreatePartyRegistration`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegistrationInfo {
    pub ven_name: String,
    #[serde(default)]
    pub transport_address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RegistrationOutcome {
    pub ven_id: String,
    pub registration_id: String,
}

/// One item of a report offering.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReportDescription {
    pub r_id: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    pub measurement: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub scale: Option<String>,
    #[serde(with = "duration_secs")]
    pub min_period: Duration,
    #[serde(with = "duration_secs")]
    pub max_period: Duration,
    #[serde(default = "default_reading_type")]
    pub reading_type: String,
}

fn default_reading_type() -> String {
    "Direct Read".to_string()
}

/// `oadrRegisterReport`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReportOffer {
    pub ven_id: String,
    pub report_specifier_id: String,
    pub report_descriptions: Vec<ReportDescription>,
}

/// `oadrCreatedReport`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreatedReport {
    pub ven_id: String,
    #[serde(default)]
    pub report_request_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ReportPayloadEntry {
    pub r_id: String,
    pub value: f64,
}

/// An interval carries either one payload or a list of them.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ReportPayload {
    Single(ReportPayloadEntry),
    Multiple(Vec<ReportPayloadEntry>),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ReportInterval {
    pub dtstart: DateTime<Utc>,
    pub report_payload: ReportPayload,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReportData {
    pub report_request_id: String,
    #[serde(default)]
    pub intervals: Vec<ReportInterval>,
}

/// `oadrUpdateReport`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UpdateReport {
    #[serde(default)]
    pub ven_id: Option<String>,
    pub reports: Vec<ReportData>,
}

/// `oadrPoll`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PollRequest {
    pub ven_id: String,
}

/// `oadrCreatedEvent`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventResponse {
    pub ven_id: String,
    pub event_id: String,
    pub opt_type: OptType,
}

/// What the VTN answers to a poll.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "response_type", content = "payload")]
pub enum PollResponse {
    #[serde(rename = "oadrDistributeEvent")]
    DistributeEvent { events: Vec<EventSignal> },
    #[serde(rename = "oadrCreateReport")]
    CreateReport {
        report_requests: Vec<PendingReportRequest>,
    },
    #[serde(rename = "oadrResponse")]
    Empty,
}

impl PollResponse {
    pub fn is_empty(&self) -> bool {
        matches!(self, PollResponse::Empty)
    }
}

/// Outbound half of the protocol collaborator used by push-mode servers.
#[async_trait]
pub trait EventPusher: Send + Sync {
    /// Hands one event to the VEN at `transport_address`; returns the delivery id.
    async fn push_event(
        &self,
        transport_address: &str,
        signal: &EventSignal,
    ) -> Result<String, DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_payload_accepts_single_and_list() {
        let raw = r#"{
            "report_request_id": "rr-1",
            "intervals": [
                {"dtstart": "2024-01-01T00:00:00Z", "report_payload": {"r_id": "a", "value": 1.0}},
                {"dtstart": "2024-01-01T00:00:05Z", "report_payload": [
                    {"r_id": "a", "value": 2.0},
                    {"r_id": "b", "value": 3.0}
                ]}
            ]
        }"#;

        let data: ReportData = serde_json::from_str(raw).expect("report data parses");
        assert!(matches!(data.intervals[0].report_payload, ReportPayload::Single(_)));
        match &data.intervals[1].report_payload {
            ReportPayload::Multiple(entries) => assert_eq!(entries.len(), 2),
            other => panic!("expected list payload, got {other:?}"),
        }
    }

    #[test]
    fn empty_poll_response_is_tagged() {
        let json = serde_json::to_value(PollResponse::Empty).expect("serialise");
        assert_eq!(json["response_type"], "oadrResponse");
    }
}
