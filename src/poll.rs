#![forbid(unsafe_code)]

//! Per-VEN pending-work flags and the decision of what a poll returns.

use crate::domain::{EventSignal, PendingReportRequest};
use crate::protocol::PollResponse;
use crate::telemetry::{runtime_counters, PollOutcome};
use crate::ven_event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Which pending work a poll answers with when both kinds are waiting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollResponder {
    #[default]
    EventFirst,
    ReportRequestFirst,
    /// Report requests are never answered through polls.
    EventOnly,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollFlags {
    pub events_pending: bool,
    pub report_request_pending: bool,
}

#[derive(Default)]
struct VenPollState {
    queued_events: Vec<EventSignal>,
    report_request_pending: bool,
    report_requests: Vec<PendingReportRequest>,
}

impl VenPollState {
    fn take_events(&mut self) -> Option<PollResponse> {
        if self.queued_events.is_empty() {
            return None;
        }
        Some(PollResponse::DistributeEvent {
            events: std::mem::take(&mut self.queued_events),
        })
    }

    fn take_report_requests(&mut self) -> Option<PollResponse> {
        if !self.report_request_pending {
            return None;
        }
        self.report_request_pending = false;
        Some(PollResponse::CreateReport {
            report_requests: self.report_requests.clone(),
        })
    }
}

/// Flag transitions and poll answers for one VEN happen under a single lock, so a mark that
/// races a poll is either part of that answer or still pending afterwards.
pub struct PollMultiplexer {
    responder: PollResponder,
    states: Mutex<HashMap<String, VenPollState>>,
}

impl PollMultiplexer {
    pub fn new(responder: PollResponder) -> Self {
        Self {
            responder,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn responder(&self) -> PollResponder {
        self.responder
    }

    /// Queues an event for the VEN's next poll.
    pub fn mark_event_pending(&self, ven_id: &str, signal: EventSignal) {
        let mut states = self.states.lock().expect("poll state poisoned");
        let state = states.entry(ven_id.to_string()).or_default();
        state.queued_events.push(signal);
        ven_event!(
            debug,
            "vtn::poll",
            "event_queued",
            ven = ven_id,
            queued = state.queued_events.len()
        );
    }

    /// Records a report request for the VEN and raises its report flag. A request with the same
    /// id or the same report specifier replaces the earlier one in place; the superseded id is
    /// returned when it differs from the new one.
    pub fn add_report_request(&self, ven_id: &str, request: PendingReportRequest) -> Option<String> {
        let mut states = self.states.lock().expect("poll state poisoned");
        let state = states.entry(ven_id.to_string()).or_default();
        state.report_request_pending = true;
        match state.report_requests.iter_mut().find(|existing| {
            existing.report_request_id == request.report_request_id
                || existing.report_specifier_id == request.report_specifier_id
        }) {
            Some(existing) => {
                let previous = std::mem::replace(existing, request);
                (previous.report_request_id != existing.report_request_id)
                    .then_some(previous.report_request_id)
            }
            None => {
                state.report_requests.push(request);
                None
            }
        }
    }

    pub fn flags(&self, ven_id: &str) -> PollFlags {
        let states = self.states.lock().expect("poll state poisoned");
        states
            .get(ven_id)
            .map(|state| PollFlags {
                events_pending: !state.queued_events.is_empty(),
                report_request_pending: state.report_request_pending,
            })
            .unwrap_or_default()
    }

    pub fn report_requests(&self, ven_id: &str) -> Vec<PendingReportRequest> {
        let states = self.states.lock().expect("poll state poisoned");
        states
            .get(ven_id)
            .map(|state| state.report_requests.clone())
            .unwrap_or_default()
    }

    /// Answers one poll and clears exactly the flag that was delivered.
    pub fn poll(&self, ven_id: &str) -> PollResponse {
        let response = {
            let mut states = self.states.lock().expect("poll state poisoned");
            match states.get_mut(ven_id) {
                None => None,
                Some(state) => match self.responder {
                    PollResponder::EventFirst => state
                        .take_events()
                        .or_else(|| state.take_report_requests()),
                    PollResponder::ReportRequestFirst => state
                        .take_report_requests()
                        .or_else(|| state.take_events()),
                    PollResponder::EventOnly => state.take_events(),
                },
            }
        }
        .unwrap_or(PollResponse::Empty);

        let outcome = match &response {
            PollResponse::DistributeEvent { events } => {
                ven_event!(info, "vtn::poll", "events_distributed", ven = ven_id, count = events.len());
                PollOutcome::DistributeEvent
            }
            PollResponse::CreateReport { report_requests } => {
                ven_event!(
                    info,
                    "vtn::poll",
                    "report_requests_sent",
                    ven = ven_id,
                    count = report_requests.len()
                );
                PollOutcome::CreateReport
            }
            PollResponse::Empty => PollOutcome::Empty,
        };
        runtime_counters().record_poll(outcome);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventInterval, EventTarget};
    use chrono::Utc;
    use std::time::Duration;

    fn signal(ven_id: &str, resource_id: &str, value: f64) -> EventSignal {
        EventSignal {
            event_id: format!("{ven_id}-{resource_id}"),
            target: EventTarget {
                ven_id: ven_id.to_string(),
                resource_id: resource_id.to_string(),
            },
            signal_name: "LOAD_DISPATCH".to_string(),
            signal_type: "setpoint".to_string(),
            market_context: "oadr://my_market".to_string(),
            priority: 1,
            intervals: vec![EventInterval {
                dtstart: Utc::now(),
                duration: Duration::from_secs(600),
                signal_payload: value,
            }],
            current_value: None,
        }
    }

    fn request(id: &str) -> PendingReportRequest {
        request_for(id, "METER")
    }

    fn request_for(id: &str, specifier: &str) -> PendingReportRequest {
        PendingReportRequest {
            report_request_id: id.to_string(),
            report_specifier_id: specifier.to_string(),
            granularity: Duration::from_secs(5),
            report_back_duration: Duration::from_secs(5),
            items: Vec::new(),
        }
    }

    #[test]
    fn event_first_delivers_event_then_report_request() {
        let mux = PollMultiplexer::new(PollResponder::EventFirst);
        mux.add_report_request("V", request("rr-1"));
        mux.mark_event_pending("V", signal("V", "R1", 1.0));

        assert!(matches!(mux.poll("V"), PollResponse::DistributeEvent { .. }));
        assert_eq!(
            mux.flags("V"),
            PollFlags {
                events_pending: false,
                report_request_pending: true
            }
        );

        match mux.poll("V") {
            PollResponse::CreateReport { report_requests } => {
                assert_eq!(report_requests.len(), 1);
            }
            other => panic!("expected report request, got {other:?}"),
        }
        assert!(mux.poll("V").is_empty());
    }

    #[test]
    fn report_request_first_inverts_priority() {
        let mux = PollMultiplexer::new(PollResponder::ReportRequestFirst);
        mux.add_report_request("V", request("rr-1"));
        mux.mark_event_pending("V", signal("V", "R1", 1.0));

        assert!(matches!(mux.poll("V"), PollResponse::CreateReport { .. }));
        assert!(mux.flags("V").events_pending);
    }

    #[test]
    fn event_only_never_answers_with_report_requests() {
        let mux = PollMultiplexer::new(PollResponder::EventOnly);
        mux.add_report_request("V", request("rr-1"));

        assert!(mux.poll("V").is_empty());
        assert!(mux.flags("V").report_request_pending);
    }

    #[test]
    fn recorded_report_requests_are_resent_as_a_set() {
        let mux = PollMultiplexer::new(PollResponder::EventFirst);
        mux.add_report_request("V", request_for("rr-1", "METER"));
        let _ = mux.poll("V");
        mux.add_report_request("V", request_for("rr-2", "TELEMETRY_STATUS"));

        match mux.poll("V") {
            PollResponse::CreateReport { report_requests } => {
                let ids: Vec<_> = report_requests
                    .iter()
                    .map(|r| r.report_request_id.as_str())
                    .collect();
                assert_eq!(ids, vec!["rr-1", "rr-2"]);
            }
            other => panic!("expected report request, got {other:?}"),
        }
    }

    #[test]
    fn re_offered_specifier_replaces_its_request() {
        let mux = PollMultiplexer::new(PollResponder::EventFirst);
        assert_eq!(mux.add_report_request("V", request_for("rr-1", "METER")), None);
        mux.add_report_request("V", request_for("rr-2", "TELEMETRY_STATUS"));

        for round in 0..5 {
            let superseded = mux.add_report_request("V", request_for(&format!("rr-m{round}"), "METER"));
            let expected = if round == 0 { "rr-1".to_string() } else { format!("rr-m{}", round - 1) };
            assert_eq!(superseded, Some(expected));
        }
        assert_eq!(
            mux.add_report_request("V", request_for("rr-m4", "METER")),
            None,
            "same id is a plain refresh"
        );

        let ids: Vec<_> = mux
            .report_requests("V")
            .into_iter()
            .map(|r| r.report_request_id)
            .collect();
        assert_eq!(ids, vec!["rr-m4", "rr-2"]);
    }

    #[test]
    fn unknown_ven_gets_empty_response() {
        let mux = PollMultiplexer::new(PollResponder::EventFirst);
        assert!(mux.poll("nobody").is_empty());
        assert_eq!(mux.flags("nobody"), PollFlags::default());
    }
}
