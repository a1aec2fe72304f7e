use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::SubscriptionStore;
use crate::types::{NewSubscription, Subscription, Target};

/// Subscription store held in process memory, keyed by endpoint.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<String, Subscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn upsert(&self, subscription: NewSubscription) -> Result<Subscription, StoreError> {
        let mut rows = self.rows.write().await;

        let stored = match rows.get(&subscription.endpoint) {
            Some(existing) => Subscription {
                id: existing.id,
                created_at: existing.created_at,
                ..subscription.into_subscription()
            },
            None => subscription.into_subscription(),
        };

        rows.insert(stored.endpoint.clone(), stored.clone());
        Ok(stored)
    }

    async fn find_by_endpoint(&self, endpoint: &str) -> Result<Option<Subscription>, StoreError> {
        Ok(self.rows.read().await.get(endpoint).cloned())
    }

    async fn list(&self, target: &Target) -> Result<Vec<Subscription>, StoreError> {
        let rows = self.rows.read().await;

        let mut selected: Vec<Subscription> = rows
            .values()
            .filter(|s| match target {
                Target::User(user_id) => &s.user_id == user_id,
                Target::All => true,
            })
            .cloned()
            .collect();
        selected.sort_by_key(|s| s.created_at);

        Ok(selected)
    }

    async fn delete_by_endpoint(&self, endpoint: &str) -> Result<bool, StoreError> {
        Ok(self.rows.write().await.remove(endpoint).is_some())
    }

    async fn delete_owned(&self, endpoint: &str, user_id: &str) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().await;

        match rows.get(endpoint) {
            Some(row) if row.user_id == user_id => {
                rows.remove(endpoint);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_for_user(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, s| s.user_id != user_id);
        Ok(before - rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(user_id: &str, endpoint: &str) -> NewSubscription {
        NewSubscription {
            user_id: user_id.to_string(),
            endpoint: endpoint.to_string(),
            p256dh: "p256dh".to_string(),
            auth: "auth".to_string(),
            user_agent: Some("test-agent".to_string()),
        }
    }

    #[tokio::test]
    async fn test_upsert_by_endpoint_keeps_one_row() {
        let store = MemoryStore::new();

        let first = store.upsert(registration("user-1", "https://push.example/a")).await.unwrap();
        let mut again = registration("user-1", "https://push.example/a");
        again.auth = "rotated".to_string();
        let second = store.upsert(again).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(first.id, second.id);
        assert_eq!(second.auth, "rotated");
    }

    #[tokio::test]
    async fn test_user_may_have_many_devices() {
        let store = MemoryStore::new();
        store.upsert(registration("user-1", "https://push.example/a")).await.unwrap();
        store.upsert(registration("user-1", "https://push.example/b")).await.unwrap();
        store.upsert(registration("user-2", "https://push.example/c")).await.unwrap();

        let mine = store.list(&Target::User("user-1".to_string())).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(store.list(&Target::All).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_of_missing_row_is_noop() {
        let store = MemoryStore::new();
        store.upsert(registration("user-1", "https://push.example/a")).await.unwrap();

        assert!(store.delete_by_endpoint("https://push.example/a").await.unwrap());
        assert!(!store.delete_by_endpoint("https://push.example/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_owned_ignores_other_users_rows() {
        let store = MemoryStore::new();
        store.upsert(registration("user-1", "https://push.example/a")).await.unwrap();

        assert!(!store.delete_owned("https://push.example/a", "user-2").await.unwrap());
        assert!(store.delete_owned("https://push.example/a", "user-1").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_for_user() {
        let store = MemoryStore::new();
        store.upsert(registration("user-1", "https://push.example/a")).await.unwrap();
        store.upsert(registration("user-1", "https://push.example/b")).await.unwrap();
        store.upsert(registration("user-2", "https://push.example/c")).await.unwrap();

        assert_eq!(store.delete_for_user("user-1").await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
    }
}
