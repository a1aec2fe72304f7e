use anyhow::Result;
use relay_core::{
    DeliveryAttempt, DeliveryOutcome, NotificationPayload, PayloadError, PushConfig, RelayContext,
    SharedStore, StoreError, Subscription, Target,
};
use relay_delivery::{PushMessage, VapidError, VapidSigner, WebPushDispatcher};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tracing;

#[derive(Error, Debug)]
pub enum NotifyError {
    /// Rejected before any I/O.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// Missing or unusable VAPID keys; fatal for the whole batch.
    #[error(transparent)]
    Vapid(#[from] VapidError),

    #[error("Failed to fetch subscriptions: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
pub struct NotifyReport {
    pub message: String,
    pub sent: usize,
    pub failed: usize,
    pub results: Vec<DeliveryAttempt>,
}

impl NotifyReport {
    fn empty() -> Self {
        NotifyReport {
            message: "No subscriptions found".to_string(),
            sent: 0,
            failed: 0,
            results: Vec::new(),
        }
    }

    fn from_results(results: Vec<DeliveryAttempt>) -> Self {
        let sent = results.iter().filter(|r| r.outcome.is_success()).count();
        let failed = results.len() - sent;

        NotifyReport {
            message: format!("Sent {} notifications, {} failed", sent, failed),
            sent,
            failed,
            results,
        }
    }
}

/// Fans one notification out to every subscription of a target.
pub struct NotificationService {
    store: SharedStore,
    dispatcher: WebPushDispatcher,
    config: PushConfig,
}

impl NotificationService {
    pub fn new(ctx: &RelayContext) -> Result<Self> {
        Self::with_store(ctx.store.clone(), ctx.config.push.clone())
    }

    pub fn with_store(store: SharedStore, config: PushConfig) -> Result<Self> {
        let dispatcher = WebPushDispatcher::new(&config)?;
        Ok(Self {
            store,
            dispatcher,
            config,
        })
    }

    pub async fn notify(
        &self,
        target: &Target,
        payload: &NotificationPayload,
    ) -> Result<NotifyReport, NotifyError> {
        let message = PushMessage::new(payload)?;
        let signer = VapidSigner::from_config(&self.config).map_err(|e| {
            tracing::error!("Push dispatch aborted: {}", e);
            e
        })?;

        let subscriptions = self.store.list(target).await?;
        if subscriptions.is_empty() {
            tracing::info!("No subscriptions found for {:?}", target);
            return Ok(NotifyReport::empty());
        }

        tracing::debug!(
            "Dispatching push to {} subscriptions for {:?}",
            subscriptions.len(),
            target
        );

        let results = self.dispatch_all(subscriptions, message, signer).await?;
        let report = NotifyReport::from_results(results);

        tracing::info!("{} for {:?}", report.message, target);
        Ok(report)
    }

    /// Deliveries run as independent tasks, at most `max_in_flight` at a time.
    /// Anything still running at the batch deadline is reported as a transient
    /// failure and left to finish on its own.
    async fn dispatch_all(
        &self,
        subscriptions: Vec<Subscription>,
        message: PushMessage,
        signer: VapidSigner,
    ) -> Result<Vec<DeliveryAttempt>, NotifyError> {
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let message = Arc::new(message);
        let signer = Arc::new(signer);
        let mut tasks = JoinSet::new();
        let mut task_index: HashMap<Id, usize> = HashMap::with_capacity(subscriptions.len());

        for (index, subscription) in subscriptions.iter().cloned().enumerate() {
            let permits = permits.clone();
            let dispatcher = self.dispatcher.clone();
            let store = self.store.clone();
            let message = message.clone();
            let signer = signer.clone();

            let handle = tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::error!("Push dispatch semaphore closed");
                        return (index, Ok(None));
                    }
                };

                let attempt = dispatcher.deliver(&subscription, &message, &signer).await;
                if let Ok(attempt) = &attempt {
                    if matches!(attempt.outcome, DeliveryOutcome::Expired { .. }) {
                        prune_expired(&store, &subscription).await;
                    }
                }
                (index, attempt.map(Some))
            });
            task_index.insert(handle.id(), index);
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.batch_deadline_secs);
        let mut slots: Vec<Option<DeliveryAttempt>> = vec![None; subscriptions.len()];
        let mut failed_tasks: HashMap<usize, String> = HashMap::new();

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, Ok(attempt))))) => slots[index] = attempt,
                Ok(Some(Ok((_, Err(e))))) => {
                    tracing::error!("Push dispatch aborted: {}", e);
                    tasks.abort_all();
                    return Err(e.into());
                }
                Ok(Some(Err(e))) => {
                    tracing::error!("Push delivery task failed: {}", e);
                    if let Some(index) = task_index.get(&e.id()) {
                        failed_tasks.insert(*index, task_failure_reason(&e));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Batch deadline reached with {} deliveries still in flight",
                        tasks.len()
                    );
                    tasks.detach_all();
                    break;
                }
            }
        }

        Ok(slots
            .into_iter()
            .zip(subscriptions)
            .enumerate()
            .map(|(index, (slot, subscription))| {
                slot.unwrap_or_else(|| DeliveryAttempt {
                    subscription_id: subscription.id,
                    endpoint: subscription.endpoint,
                    outcome: DeliveryOutcome::Transient {
                        status: None,
                        reason: failed_tasks
                            .remove(&index)
                            .unwrap_or_else(|| "no result before batch deadline".to_string()),
                    },
                })
            })
            .collect())
    }
}

fn task_failure_reason(e: &JoinError) -> String {
    if e.is_panic() {
        "delivery task panicked".to_string()
    } else {
        "delivery task cancelled".to_string()
    }
}

/// Best effort: a failed delete is logged, never escalated.
async fn prune_expired(store: &SharedStore, subscription: &Subscription) {
    match store.delete_by_endpoint(&subscription.endpoint).await {
        Ok(true) => {
            tracing::info!(
                "Removed expired subscription {} for user {}",
                subscription.id,
                subscription.user_id
            );
        }
        Ok(false) => {
            tracing::debug!("Expired subscription {} was already removed", subscription.id);
        }
        Err(e) => {
            tracing::warn!(
                "Failed to remove expired subscription {}: {}",
                subscription.id,
                e
            );
        }
    }
}
