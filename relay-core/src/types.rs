use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::schema::push_subscriptions;

/// Largest plaintext that fits a single 4096-byte aes128gcm record
/// (86-byte header, 16-byte tag, 1 delimiter byte).
pub const MAX_PLAINTEXT_BYTES: usize = 3993;

/// One browser/device registration for one user.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = push_subscriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registration as posted by a client; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubscription {
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl NewSubscription {
    pub fn into_subscription(self) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            endpoint: self.endpoint,
            p256dh: self.p256dh,
            auth: self.auth,
            user_agent: self.user_agent,
            created_at: Utc::now(),
        }
    }
}

/// Which subscriptions a notification fans out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User(String),
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// The logical message delivered to every targeted device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<NotificationAction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_interaction: Option<bool>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Missing payload title or body")]
    MissingContent,

    #[error("Payload is {size} bytes, the push service limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("Payload serialization failed: {0}")]
    Serialize(String),
}

impl NotificationPayload {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        NotificationPayload {
            title: title.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.title.trim().is_empty() || self.body.trim().is_empty() {
            return Err(PayloadError::MissingContent);
        }
        Ok(())
    }

    /// Serialize to the JSON bytes that get encrypted, enforcing the record size limit.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        self.validate()?;
        let bytes = serde_json::to_vec(self).map_err(|e| PayloadError::Serialize(e.to_string()))?;
        if bytes.len() > MAX_PLAINTEXT_BYTES {
            return Err(PayloadError::TooLarge {
                size: bytes.len(),
                limit: MAX_PLAINTEXT_BYTES,
            });
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    None,
    Expired,
    Transient,
    Malformed,
}

/// How the push service (or local encoding) answered a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    /// 404/410: the endpoint is gone and its row must be pruned.
    Expired { status: u16 },
    /// Any other non-2xx, timeout, or connection failure.
    Transient { status: Option<u16>, reason: String },
    /// Local failure before anything was sent (bad keys, encryption).
    Malformed { reason: String },
}

impl DeliveryOutcome {
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            200..=299 => DeliveryOutcome::Delivered { status },
            404 | 410 => DeliveryOutcome::Expired { status },
            _ => DeliveryOutcome::Transient {
                status: Some(status),
                reason: format!("HTTP {}: {}", status, body),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn error_class(&self) -> ErrorClass {
        match self {
            DeliveryOutcome::Delivered { .. } => ErrorClass::None,
            DeliveryOutcome::Expired { .. } => ErrorClass::Expired,
            DeliveryOutcome::Transient { .. } => ErrorClass::Transient,
            DeliveryOutcome::Malformed { .. } => ErrorClass::Malformed,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryOutcome::Delivered { status } | DeliveryOutcome::Expired { status } => Some(*status),
            DeliveryOutcome::Transient { status, .. } => *status,
            DeliveryOutcome::Malformed { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            DeliveryOutcome::Delivered { .. } => None,
            DeliveryOutcome::Expired { status } => Some(format!("subscription expired (HTTP {})", status)),
            DeliveryOutcome::Transient { reason, .. } | DeliveryOutcome::Malformed { reason } => {
                Some(reason.clone())
            }
        }
    }
}

/// Result of one delivery; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub subscription_id: Uuid,
    pub endpoint: String,
    pub outcome: DeliveryOutcome,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryAttemptWire<'a> {
    subscription_id: &'a Uuid,
    success: bool,
    error_class: ErrorClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Serialize for DeliveryAttempt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DeliveryAttemptWire {
            subscription_id: &self.subscription_id,
            success: self.outcome.is_success(),
            error_class: self.outcome.error_class(),
            status: self.outcome.status(),
            error: self.outcome.error_message(),
        }
        .serialize(serializer)
    }
}
