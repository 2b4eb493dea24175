#![forbid(unsafe_code)]

use crate::domain::EventSignal;
use crate::error::{Context, DeliveryError, Result};
use crate::protocol::EventPusher;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Posts each event as JSON to the VEN's transport address.
pub struct HttpEventPusher {
    client: reqwest::Client,
}

#[derive(Debug, Default, Deserialize)]
struct PushAck {
    #[serde(default)]
    delivery_id: Option<String>,
}

impl HttpEventPusher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build event push client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventPusher for HttpEventPusher {
    async fn push_event(
        &self,
        transport_address: &str,
        signal: &EventSignal,
    ) -> std::result::Result<String, DeliveryError> {
        let ven_id = &signal.target.ven_id;
        let response = self
            .client
            .post(transport_address)
            .json(signal)
            .send()
            .await
            .map_err(|err| DeliveryError::Transport {
                ven_id: ven_id.clone(),
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                ven_id: ven_id.clone(),
                reason: format!("HTTP {status}"),
            });
        }

        // VENs that answer without a body acknowledge with the event id.
        let ack = response.json::<PushAck>().await.unwrap_or_default();
        Ok(ack
            .delivery_id
            .unwrap_or_else(|| signal.event_id.clone()))
    }
}
