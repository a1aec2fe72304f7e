use async_trait::async_trait;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::RunQueryDsl;
use std::sync::Arc;

use crate::db::{DbConnection, DbPool};
use crate::error::StoreError;
use crate::schema::push_subscriptions;
use crate::types::{NewSubscription, Subscription, Target};

/// Persistent subscriptions keyed by endpoint.
///
/// Writes are keyed by `endpoint`, so two devices of one user never collide,
/// and deleting a row that is already gone is a no-op rather than an error.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert, or replace the row registered under the same endpoint.
    async fn upsert(&self, subscription: NewSubscription) -> Result<Subscription, StoreError>;

    async fn find_by_endpoint(&self, endpoint: &str) -> Result<Option<Subscription>, StoreError>;

    async fn list(&self, target: &Target) -> Result<Vec<Subscription>, StoreError>;

    /// Returns whether a row was removed.
    async fn delete_by_endpoint(&self, endpoint: &str) -> Result<bool, StoreError>;

    /// Like `delete_by_endpoint`, but only removes a row owned by `user_id`.
    async fn delete_owned(&self, endpoint: &str, user_id: &str) -> Result<bool, StoreError>;

    async fn delete_for_user(&self, user_id: &str) -> Result<usize, StoreError>;
}

pub type SharedStore = Arc<dyn SubscriptionStore>;

pub struct PgSubscriptionStore {
    pool: Arc<DbPool>,
}

impl PgSubscriptionStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<DbConnection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn upsert(&self, subscription: NewSubscription) -> Result<Subscription, StoreError> {
        let row = subscription.into_subscription();
        let mut conn = self.conn().await?;

        let stored = diesel::insert_into(push_subscriptions::table)
            .values(&row)
            .on_conflict(push_subscriptions::endpoint)
            .do_update()
            .set((
                push_subscriptions::user_id.eq(excluded(push_subscriptions::user_id)),
                push_subscriptions::p256dh.eq(excluded(push_subscriptions::p256dh)),
                push_subscriptions::auth.eq(excluded(push_subscriptions::auth)),
                push_subscriptions::user_agent.eq(excluded(push_subscriptions::user_agent)),
            ))
            .returning(Subscription::as_returning())
            .get_result(&mut conn)
            .await?;

        Ok(stored)
    }

    async fn find_by_endpoint(&self, endpoint: &str) -> Result<Option<Subscription>, StoreError> {
        let mut conn = self.conn().await?;

        let found = push_subscriptions::table
            .filter(push_subscriptions::endpoint.eq(endpoint))
            .select(Subscription::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(found)
    }

    async fn list(&self, target: &Target) -> Result<Vec<Subscription>, StoreError> {
        let mut conn = self.conn().await?;

        let mut query = push_subscriptions::table
            .select(Subscription::as_select())
            .order(push_subscriptions::created_at.asc())
            .into_boxed();

        if let Target::User(user_id) = target {
            query = query.filter(push_subscriptions::user_id.eq(user_id.clone()));
        }

        let rows = query.load(&mut conn).await?;

        Ok(rows)
    }

    async fn delete_by_endpoint(&self, endpoint: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;

        let deleted = diesel::delete(
            push_subscriptions::table.filter(push_subscriptions::endpoint.eq(endpoint)),
        )
        .execute(&mut conn)
        .await?;

        Ok(deleted > 0)
    }

    async fn delete_owned(&self, endpoint: &str, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;

        let deleted = diesel::delete(
            push_subscriptions::table
                .filter(push_subscriptions::endpoint.eq(endpoint))
                .filter(push_subscriptions::user_id.eq(user_id)),
        )
        .execute(&mut conn)
        .await?;

        Ok(deleted > 0)
    }

    async fn delete_for_user(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;

        let deleted = diesel::delete(
            push_subscriptions::table.filter(push_subscriptions::user_id.eq(user_id)),
        )
        .execute(&mut conn)
        .await?;

        Ok(deleted)
    }
}
