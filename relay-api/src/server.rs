use anyhow::{Context, Result};
use axum::{
    extract::Extension,
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{delete, get, post},
    Router,
};
use relay_core::RelayContext;
use relay_notify::NotificationService;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing;

use crate::auth;
use crate::handlers;

fn cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static("apikey"),
                    HeaderName::from_static("prefer"),
                ])
                .allow_credentials(true)
        }
        None => {
            // Default to permissive for development, but log warning
            tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
            CorsLayer::permissive()
        }
    }
}

pub fn build_router(ctx: RelayContext) -> Result<Router> {
    let service = Arc::new(NotificationService::new(&ctx)?);
    let cors = cors_layer(ctx.config.server.cors_origins.as_deref());

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/functions/v1/send-push", post(handlers::send_push))
        .route(
            "/rest/v1/push_subscriptions",
            post(handlers::register_subscription).delete(handlers::delete_subscription),
        )
        .route("/api/push/resubscribe", post(handlers::resubscribe))
        .route(
            "/api/v1/account/push-subscriptions",
            delete(handlers::delete_account_subscriptions),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Outside auth so preflight requests are answered without a token.
                .layer(cors)
                .layer(Extension(ctx))
                .layer(Extension(service))
                .layer(middleware::from_fn(auth::auth_middleware)),
        );

    Ok(app)
}

pub async fn run(ctx: RelayContext) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.server.host, ctx.config.server.api_port)
        .parse()
        .context("Invalid SERVER_HOST/API_PORT")?;

    if ctx.config.push.vapid_keys().is_none() {
        tracing::warn!("VAPID keys not configured; send-push requests will fail");
    }

    let app = build_router(ctx)?;

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
