#![forbid(unsafe_code)]

use crate::domain::{EventInterval, EventSignal, EventTarget};
use crate::error::DeliveryError;
use crate::poll::PollMultiplexer;
use crate::protocol::EventPusher;
use crate::registry::VenRegistry;
use crate::sink::MetricSink;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Static part of every dispatched event.
#[derive(Clone, Debug)]
pub struct SignalTemplate {
    pub signal_name: String,
    pub signal_type: String,
    pub market_context: String,
    pub start_offset: Duration,
    pub duration: Duration,
}

impl SignalTemplate {
    pub fn build(&self, ven_id: &str, resource_id: &str, value: f64) -> EventSignal {
        let offset = chrono::Duration::from_std(self.start_offset).unwrap_or_else(|_| chrono::Duration::zero());
        EventSignal {
            event_id: Uuid::new_v4().to_string(),
            target: EventTarget {
                ven_id: ven_id.to_string(),
                resource_id: resource_id.to_string(),
            },
            signal_name: self.signal_name.clone(),
            signal_type: self.signal_type.clone(),
            market_context: self.market_context.clone(),
            priority: 1,
            intervals: vec![EventInterval {
                dtstart: Utc::now() + offset,
                duration: self.duration,
                signal_payload: value,
            }],
            current_value: None,
        }
    }
}

/// How an event reaches its VEN.
#[async_trait]
pub trait EventChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the delivery id on success.
    async fn deliver(&self, signal: EventSignal) -> Result<String, DeliveryError>;
}

/// Poll mode: events wait in the multiplexer until the VEN polls.
pub struct PollQueueChannel {
    multiplexer: Arc<PollMultiplexer>,
}

impl PollQueueChannel {
    pub fn new(multiplexer: Arc<PollMultiplexer>) -> Self {
        Self { multiplexer }
    }
}

#[async_trait]
impl EventChannel for PollQueueChannel {
    fn name(&self) -> &'static str {
        "poll"
    }

    async fn deliver(&self, signal: EventSignal) -> Result<String, DeliveryError> {
        let event_id = signal.event_id.clone();
        let ven_id = signal.target.ven_id.clone();
        self.multiplexer.mark_event_pending(&ven_id, signal);
        Ok(event_id)
    }
}

/// Push mode: events go straight to the VEN's transport address.
pub struct PushChannel {
    pusher: Arc<dyn EventPusher>,
    registry: Arc<VenRegistry>,
    sink: Arc<MetricSink>,
}

impl PushChannel {
    pub fn new(pusher: Arc<dyn EventPusher>, registry: Arc<VenRegistry>, sink: Arc<MetricSink>) -> Self {
        Self {
            pusher,
            registry,
            sink,
        }
    }
}

#[async_trait]
impl EventChannel for PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn deliver(&self, mut signal: EventSignal) -> Result<String, DeliveryError> {
        let ven_id = signal.target.ven_id.clone();
        let address = self
            .registry
            .lookup(&ven_id)
            .and_then(|record| record.transport_address)
            .ok_or_else(|| DeliveryError::NoTransport {
                ven_id: ven_id.clone(),
            })?;

        let series = self
            .sink
            .event_series_name(&ven_id, &signal.target.resource_id);
        signal.current_value = self.sink.latest(&series).await;

        self.pusher.push_event(&address, &signal).await
    }
}
