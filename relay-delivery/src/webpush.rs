use anyhow::{anyhow, Result};
use relay_core::{
    DeliveryAttempt, DeliveryOutcome, NotificationPayload, PayloadError, PushConfig, Subscription,
};
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use std::time::Duration;
use tracing;

use crate::vapid::{decode_base64url, endpoint_origin, VapidError, VapidSigner};

/// A payload that already passed validation and fits in one push record.
#[derive(Debug, Clone)]
pub struct PushMessage {
    plaintext: Vec<u8>,
}

impl PushMessage {
    pub fn new(payload: &NotificationPayload) -> Result<Self, PayloadError> {
        Ok(Self {
            plaintext: payload.encode()?,
        })
    }

    pub fn len(&self) -> usize {
        self.plaintext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plaintext.is_empty()
    }
}

/// Sends one encrypted message to one push-service endpoint.
///
/// Non-2xx answers are classified into a [`DeliveryOutcome`], never returned
/// as errors. The only error is a VAPID failure, which the caller treats as
/// fatal for the whole batch. There are no retries here; push services do
/// their own re-delivery within the TTL.
#[derive(Clone)]
pub struct WebPushDispatcher {
    client: reqwest::Client,
    ttl_seconds: u32,
    timeout: Duration,
}

impl WebPushDispatcher {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("relay-push")
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            ttl_seconds: config.ttl_seconds,
            timeout,
        })
    }

    pub async fn deliver(
        &self,
        subscription: &Subscription,
        message: &PushMessage,
        signer: &VapidSigner,
    ) -> Result<DeliveryAttempt, VapidError> {
        let outcome = match self.prepare(subscription, message, signer)? {
            Ok((authorization, body)) => self.post(&subscription.endpoint, authorization, body).await,
            Err(reason) => {
                tracing::warn!(
                    "Malformed subscription {} ({}): {}",
                    subscription.id,
                    subscription.endpoint,
                    reason
                );
                DeliveryOutcome::Malformed { reason }
            }
        };

        Ok(DeliveryAttempt {
            subscription_id: subscription.id,
            endpoint: subscription.endpoint.clone(),
            outcome,
        })
    }

    /// Builds the Authorization header and encrypted body. The outer error is
    /// a signing failure; the inner one a problem with this subscription only.
    fn prepare(
        &self,
        subscription: &Subscription,
        message: &PushMessage,
        signer: &VapidSigner,
    ) -> Result<Result<(String, Vec<u8>), String>, VapidError> {
        let origin = match endpoint_origin(&subscription.endpoint) {
            Some(origin) => origin,
            None => return Ok(Err(format!("invalid endpoint URL: {}", subscription.endpoint))),
        };

        let authorization = signer.authorization(&origin)?;

        let p256dh = match decode_base64url(&subscription.p256dh) {
            Ok(key) => key,
            Err(e) => return Ok(Err(format!("invalid p256dh key: {}", e))),
        };
        let auth = match decode_base64url(&subscription.auth) {
            Ok(secret) => secret,
            Err(e) => return Ok(Err(format!("invalid auth secret: {}", e))),
        };

        match ece::encrypt(&p256dh, &auth, &message.plaintext) {
            Ok(body) => Ok(Ok((authorization, body))),
            Err(e) => Ok(Err(format!("encryption failed: {}", e))),
        }
    }

    async fn post(&self, endpoint: &str, authorization: String, body: Vec<u8>) -> DeliveryOutcome {
        let response = self
            .client
            .post(endpoint)
            .header(AUTHORIZATION, authorization)
            .header(CONTENT_ENCODING, "aes128gcm")
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("TTL", self.ttl_seconds.to_string())
            .header("Urgency", "normal")
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                tracing::warn!("Push to {} timed out after {:?}", endpoint, self.timeout);
                return DeliveryOutcome::Transient {
                    status: None,
                    reason: format!("timed out after {:?}", self.timeout),
                };
            }
            Err(e) => {
                tracing::warn!("Push to {} failed: {}", endpoint, e);
                return DeliveryOutcome::Transient {
                    status: None,
                    reason: e.to_string(),
                };
            }
        };

        let status = response.status().as_u16();
        let body = if response.status().is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        let outcome = DeliveryOutcome::from_status(status, &body);
        match &outcome {
            DeliveryOutcome::Delivered { .. } => {
                tracing::debug!("Push delivered to {} (HTTP {})", endpoint, status);
            }
            DeliveryOutcome::Expired { .. } => {
                tracing::info!("Push endpoint {} is gone (HTTP {})", endpoint, status);
            }
            _ => {
                tracing::warn!("Push to {} rejected with HTTP {}: {}", endpoint, status, body);
            }
        }
        outcome
    }
}
