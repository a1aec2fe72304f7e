use axum::{
    extract::{rejection::JsonRejection, Extension, Query},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::Json,
};
use relay_core::{NewSubscription, NotificationPayload, RelayContext, Target};
use relay_notify::NotificationService;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "relay-api"
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPushRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub payload: Option<NotificationPayload>,
    #[serde(default)]
    pub send_to_all: bool,
}

/// Dispatch trigger. Partial delivery failure is still a 200.
pub async fn send_push(
    Extension(service): Extension<Arc<NotificationService>>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<SendPushRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let payload = req
        .payload
        .ok_or_else(|| ApiError::BadRequest("Missing payload title or body".to_string()))?;

    let target = if req.send_to_all {
        if !user.is_service_role() {
            tracing::warn!("User {} attempted a broadcast without the service role", user.user_id);
            return Err(ApiError::Forbidden("Broadcast requires the service role".to_string()));
        }
        Target::All
    } else {
        Target::User(req.user_id.unwrap_or_else(|| user.user_id.clone()))
    };

    let report = service.notify(&target, &payload).await?;

    serde_json::to_value(&report)
        .map(Json)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Register (or refresh) a device; upsert keyed by endpoint.
pub async fn register_subscription(
    Extension(ctx): Extension<RelayContext>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<NewSubscription>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let Json(subscription) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    if subscription.endpoint.is_empty() || subscription.p256dh.is_empty() || subscription.auth.is_empty() {
        return Err(ApiError::BadRequest("Missing endpoint or keys".to_string()));
    }
    if !user.may_act_for(&subscription.user_id) {
        return Err(ApiError::Forbidden("Cannot register a subscription for another user".to_string()));
    }

    let stored = ctx.store.upsert(subscription).await?;
    tracing::info!("Registered push subscription {} for user {}", stored.id, stored.user_id);

    let row = serde_json::to_value(&stored).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(row)))
}

#[derive(Deserialize)]
pub struct EndpointFilter {
    pub endpoint: String,
}

/// `?endpoint=eq.<value>`; a missing row is not an error.
pub async fn delete_subscription(
    Extension(ctx): Extension<RelayContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(filter): Query<EndpointFilter>,
) -> Result<StatusCode, ApiError> {
    let endpoint = filter.endpoint.strip_prefix("eq.").unwrap_or(&filter.endpoint);

    let removed = if user.is_service_role() {
        ctx.store.delete_by_endpoint(endpoint).await?
    } else {
        ctx.store.delete_owned(endpoint, &user.user_id).await?
    };

    if removed {
        tracing::info!("Removed push subscription for user {}", user.user_id);
    } else {
        tracing::debug!("No push subscription to remove for user {}", user.user_id);
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Deserialize)]
pub struct PushSubscriptionJson {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResubscribeRequest {
    #[serde(default)]
    pub old_endpoint: Option<String>,
    pub new_subscription: PushSubscriptionJson,
}

/// Called by the service worker after the push service rotated its
/// subscription. The worker has no session, so the owner comes from the
/// bearer token when one is sent and from the old row otherwise.
pub async fn resubscribe(
    Extension(ctx): Extension<RelayContext>,
    user: Option<Extension<AuthenticatedUser>>,
    headers: HeaderMap,
    body: Result<Json<ResubscribeRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let keys = &req.new_subscription.keys;
    if req.new_subscription.endpoint.is_empty() || keys.p256dh.is_empty() || keys.auth.is_empty() {
        return Err(ApiError::BadRequest("Missing endpoint or keys".to_string()));
    }

    let previous = match req.old_endpoint.as_deref().filter(|e| !e.is_empty()) {
        Some(endpoint) => ctx.store.find_by_endpoint(endpoint).await?,
        None => None,
    };

    let owner = match (&user, &previous) {
        (Some(Extension(user)), _) => user.user_id.clone(),
        (None, Some(row)) => row.user_id.clone(),
        (None, None) => {
            tracing::warn!("Resubscribe with no token and unknown old endpoint");
            return Err(ApiError::NotFound("Unknown subscription".to_string()));
        }
    };

    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| previous.as_ref().and_then(|row| row.user_agent.clone()));

    let new_endpoint = req.new_subscription.endpoint;
    let stored = ctx
        .store
        .upsert(NewSubscription {
            user_id: owner,
            endpoint: new_endpoint.clone(),
            p256dh: req.new_subscription.keys.p256dh,
            auth: req.new_subscription.keys.auth,
            user_agent,
        })
        .await?;

    if let Some(old) = previous.filter(|row| row.endpoint != new_endpoint && row.user_id == stored.user_id) {
        ctx.store.delete_by_endpoint(&old.endpoint).await?;
    }

    tracing::info!("Rotated push subscription for user {}", stored.user_id);
    Ok(Json(serde_json::json!({
        "status": "ok",
        "endpoint": stored.endpoint,
    })))
}

/// Push-side cleanup of account deletion.
pub async fn delete_account_subscriptions(
    Extension(ctx): Extension<RelayContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = ctx.store.delete_for_user(&user.user_id).await?;
    tracing::info!("Deleted {} push subscriptions for user {}", deleted, user.user_id);

    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
