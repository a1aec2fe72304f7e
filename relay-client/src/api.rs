use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;

use crate::error::ClientError;

/// The signed-in user as far as push registration is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
}

/// Row posted to the subscription store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub user_agent: String,
}

#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    /// Upsert keyed by endpoint.
    async fn save(&self, session: &Session, record: &SubscriptionRecord) -> Result<(), ClientError>;

    /// Deleting a row that does not exist succeeds.
    async fn remove(&self, session: &Session, endpoint: &str) -> Result<(), ClientError>;
}

/// [`SubscriptionApi`] over the store's REST interface.
pub struct RestSubscriptionApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestSubscriptionApi {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        RestSubscriptionApi {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/push_subscriptions", self.base_url)
    }
}

#[async_trait]
impl SubscriptionApi for RestSubscriptionApi {
    async fn save(&self, session: &Session, record: &SubscriptionRecord) -> Result<(), ClientError> {
        let response = self
            .client
            .post(self.table_url())
            .header("apikey", &self.api_key)
            .header(AUTHORIZATION, format!("Bearer {}", session.access_token))
            .header("Prefer", "resolution=merge-duplicates")
            .json(record)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Error saving push subscription ({}): {}", status, body);
            return Err(ClientError::StoreWrite(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        Ok(())
    }

    async fn remove(&self, session: &Session, endpoint: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .delete(self.table_url())
            .query(&[("endpoint", format!("eq.{}", endpoint))])
            .header("apikey", &self.api_key)
            .header(AUTHORIZATION, format!("Bearer {}", session.access_token))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ClientError::StoreWrite(format!("HTTP {} removing subscription", status.as_u16())));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session() -> Session {
        Session {
            user_id: "user-1".to_string(),
            access_token: "token-abc".to_string(),
        }
    }

    fn record() -> SubscriptionRecord {
        SubscriptionRecord {
            user_id: "user-1".to_string(),
            endpoint: "https://push.example.com/device-1".to_string(),
            p256dh: "BCdP3er8".to_string(),
            auth: "1S9zpj08".to_string(),
            user_agent: "Mozilla/5.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_posts_upsert_with_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/push_subscriptions"))
            .and(header("apikey", "anon-key"))
            .and(header("Authorization", "Bearer token-abc"))
            .and(header("Prefer", "resolution=merge-duplicates"))
            .and(body_partial_json(serde_json::json!({
                "user_id": "user-1",
                "endpoint": "https://push.example.com/device-1"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let api = RestSubscriptionApi::new(&server.uri(), "anon-key");
        api.save(&session(), &record()).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_failure_is_store_write_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let api = RestSubscriptionApi::new(&server.uri(), "anon-key");
        let err = api.save(&session(), &record()).await.unwrap_err();
        assert!(matches!(err, ClientError::StoreWrite(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_remove_filters_by_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/push_subscriptions"))
            .and(query_param("endpoint", "eq.https://push.example.com/device-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = RestSubscriptionApi::new(&format!("{}/", server.uri()), "anon-key");
        api.remove(&session(), "https://push.example.com/device-1").await.unwrap();
    }
}
