//! Service worker event handling.
//!
//! [`ServiceWorker::handle`] is the only entry point. Each call resolves once
//! the platform work for that event (showing, focusing, opening, reporting)
//! has finished, so callers hold the event open until then.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::WorkerError;
use crate::platform::{application_server_key, PushSubscriptionInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// Fields every displayed notification falls back to.
#[derive(Debug, Clone)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub url: String,
    pub vibrate: Vec<u32>,
    pub actions: Vec<NotificationAction>,
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        NotificationDefaults {
            title: "LunaMed".to_string(),
            body: "You have a new notification".to_string(),
            icon: "/pwa-192x192.png".to_string(),
            badge: "/pwa-192x192.png".to_string(),
            tag: "lunamed-notification".to_string(),
            url: "/".to_string(),
            vibrate: vec![100, 50, 100],
            actions: vec![
                NotificationAction {
                    action: "open".to_string(),
                    title: "Open App".to_string(),
                },
                NotificationAction {
                    action: "dismiss".to_string(),
                    title: "Dismiss".to_string(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Origin of the app, e.g. `https://app.lunamed.example`.
    pub origin: String,
    pub vapid_public_key: String,
    pub resubscribe_path: String,
    pub defaults: NotificationDefaults,
}

impl WorkerConfig {
    pub fn new(origin: &str, vapid_public_key: &str) -> Self {
        WorkerConfig {
            origin: origin.trim_end_matches('/').to_string(),
            vapid_public_key: vapid_public_key.to_string(),
            resubscribe_path: "/api/push/resubscribe".to_string(),
            defaults: NotificationDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub data: Map<String, Value>,
    pub vibrate: Vec<u32>,
    pub actions: Vec<NotificationAction>,
    pub require_interaction: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClient {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Push {
        data: Option<Vec<u8>>,
    },
    NotificationClick {
        action: Option<String>,
        tag: String,
        data: Map<String, Value>,
    },
    NotificationClose {
        tag: String,
    },
    SubscriptionChange {
        old_endpoint: Option<String>,
    },
}

/// What the worker's global scope provides.
#[async_trait]
pub trait WorkerPlatform: Send + Sync {
    async fn show_notification(&self, title: &str, options: &NotificationOptions) -> Result<(), WorkerError>;

    async fn close_notification(&self, tag: &str) -> Result<(), WorkerError>;

    /// Window clients, including uncontrolled ones.
    async fn window_clients(&self) -> Result<Vec<WindowClient>, WorkerError>;

    async fn navigate(&self, client_id: &str, url: &str) -> Result<(), WorkerError>;

    async fn focus(&self, client_id: &str) -> Result<(), WorkerError>;

    async fn open_window(&self, url: &str) -> Result<(), WorkerError>;

    async fn subscribe(&self, application_server_key: &[u8]) -> Result<PushSubscriptionInfo, WorkerError>;
}

pub struct ServiceWorker {
    config: WorkerConfig,
    platform: Arc<dyn WorkerPlatform>,
    http: reqwest::Client,
}

impl ServiceWorker {
    pub fn new(config: WorkerConfig, platform: Arc<dyn WorkerPlatform>) -> Self {
        ServiceWorker {
            config,
            platform,
            http: reqwest::Client::new(),
        }
    }

    pub async fn handle(&self, event: WorkerEvent) -> Result<(), WorkerError> {
        match event {
            WorkerEvent::Push { data } => {
                tracing::debug!("Push received ({} bytes)", data.as_ref().map_or(0, Vec::len));
                let (title, options) = self.build_notification(data.as_deref());
                self.platform.show_notification(&title, &options).await
            }
            WorkerEvent::NotificationClick { action, tag, data } => {
                self.on_click(action.as_deref(), &tag, &data).await
            }
            WorkerEvent::NotificationClose { tag } => {
                tracing::debug!("Notification closed: {}", tag);
                Ok(())
            }
            WorkerEvent::SubscriptionChange { old_endpoint } => {
                tracing::info!("Push subscription changed");
                self.on_subscription_change(old_endpoint).await
            }
        }
    }

    /// Merges a push payload over the defaults. Anything that is not a JSON
    /// object is shown as plain text so the notification is never dropped.
    pub fn build_notification(&self, data: Option<&[u8]>) -> (String, NotificationOptions) {
        let defaults = &self.config.defaults;
        let mut title = defaults.title.clone();
        let mut options = NotificationOptions {
            body: defaults.body.clone(),
            icon: defaults.icon.clone(),
            badge: defaults.badge.clone(),
            tag: defaults.tag.clone(),
            data: default_data(defaults),
            vibrate: defaults.vibrate.clone(),
            actions: defaults.actions.clone(),
            require_interaction: false,
        };

        let data = match data {
            Some(data) if !data.is_empty() => data,
            _ => return (title, options),
        };

        let payload = match serde_json::from_slice::<Value>(data) {
            Ok(Value::Object(payload)) => payload,
            Ok(_) | Err(_) => {
                tracing::warn!("Push payload is not a JSON object, showing it as text");
                options.body = String::from_utf8_lossy(data).into_owned();
                return (title, options);
            }
        };

        if let Some(value) = non_empty_str(&payload, "title") {
            title = value;
        }
        if let Some(value) = non_empty_str(&payload, "body") {
            options.body = value;
        }
        if let Some(value) = non_empty_str(&payload, "icon") {
            options.icon = value;
        }
        if let Some(value) = non_empty_str(&payload, "badge") {
            options.badge = value;
        }
        if let Some(value) = non_empty_str(&payload, "tag") {
            options.tag = value;
        }
        if let Some(Value::Object(data)) = payload.get("data") {
            options.data = data.clone();
        }
        if let Some(actions) = payload
            .get("actions")
            .and_then(|a| serde_json::from_value::<Vec<NotificationAction>>(a.clone()).ok())
        {
            options.actions = actions;
        }
        if let Some(Value::Bool(require)) = payload.get("requireInteraction") {
            options.require_interaction = *require;
        }

        (title, options)
    }

    async fn on_click(&self, action: Option<&str>, tag: &str, data: &Map<String, Value>) -> Result<(), WorkerError> {
        self.platform.close_notification(tag).await?;

        if action == Some("dismiss") {
            return Ok(());
        }

        let url = data
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .unwrap_or(self.config.defaults.url.as_str());

        let clients = self.platform.window_clients().await?;
        match clients.iter().find(|c| same_origin(&c.url, &self.config.origin)) {
            Some(client) => {
                self.platform.navigate(&client.id, url).await?;
                self.platform.focus(&client.id).await
            }
            None => self.platform.open_window(url).await,
        }
    }

    async fn on_subscription_change(&self, old_endpoint: Option<String>) -> Result<(), WorkerError> {
        let key = application_server_key(&self.config.vapid_public_key).map_err(WorkerError::Configuration)?;
        let subscription = self.platform.subscribe(&key).await?;

        let response = self
            .http
            .post(format!("{}{}", self.config.origin, self.config.resubscribe_path))
            .json(&serde_json::json!({
                "oldEndpoint": old_endpoint,
                "newSubscription": subscription,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!("Resubscribe rejected with HTTP {}", status);
            return Err(WorkerError::Resubscribe(format!("HTTP {}", status.as_u16())));
        }

        Ok(())
    }
}

fn same_origin(url: &str, origin: &str) -> bool {
    match (reqwest::Url::parse(url), reqwest::Url::parse(origin)) {
        (Ok(url), Ok(origin)) => url.origin() == origin.origin(),
        _ => false,
    }
}

fn default_data(defaults: &NotificationDefaults) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("url".to_string(), Value::String(defaults.url.clone()));
    data
}

fn non_empty_str(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
