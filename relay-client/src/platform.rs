use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

const BASE64_URL_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Result of the browser's notification permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Granted,
    /// Sticky; the page cannot prompt again.
    Denied,
    /// Prompt dismissed without a choice.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// A push registration as the browser reports it (`PushSubscription.toJSON()`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscriptionInfo {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

/// Page-side browser capabilities needed to manage a push registration.
#[async_trait]
pub trait PushPlatform: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Current permission without prompting.
    fn permission(&self) -> Permission;

    async fn request_permission(&self) -> Permission;

    async fn register_worker(&self, script: &str, scope: &str) -> Result<(), ClientError>;

    async fn worker_ready(&self) -> Result<(), ClientError>;

    /// Read-only; must never create a registration.
    async fn current_subscription(&self) -> Result<Option<PushSubscriptionInfo>, ClientError>;

    async fn subscribe(&self, application_server_key: &[u8]) -> Result<PushSubscriptionInfo, ClientError>;

    async fn unsubscribe(&self, endpoint: &str) -> Result<(), ClientError>;

    fn user_agent(&self) -> String;
}

/// Raw bytes of the base64url VAPID public key, as `applicationServerKey` expects.
pub fn application_server_key(public_key: &str) -> Result<Vec<u8>, String> {
    let normalized = public_key.trim().replace('+', "-").replace('/', "_");
    let bytes = BASE64_URL_LENIENT
        .decode(normalized.as_bytes())
        .map_err(|e| e.to_string())?;

    if bytes.len() != 65 || bytes[0] != 0x04 {
        return Err(format!("expected a 65-byte P-256 public key, got {} bytes", bytes.len()));
    }
    Ok(bytes)
}
