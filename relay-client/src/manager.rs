use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

use crate::api::{Session, SubscriptionApi, SubscriptionRecord};
use crate::error::ClientError;
use crate::notice::Notice;
use crate::platform::{application_server_key, Permission, PushPlatform, PushSubscriptionInfo};

/// Confirmed subscription state. Never reports `Subscribed` before the store
/// write has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsupported,
    Unknown,
    Subscribed,
    Unsubscribed,
    PermissionDenied,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub vapid_public_key: Option<String>,
    pub worker_script: String,
    pub worker_scope: String,
}

impl ManagerConfig {
    pub fn new(vapid_public_key: Option<String>) -> Self {
        ManagerConfig {
            vapid_public_key,
            worker_script: "/sw-push.js".to_string(),
            worker_scope: "/".to_string(),
        }
    }
}

pub struct SubscriptionManager {
    config: ManagerConfig,
    platform: Arc<dyn PushPlatform>,
    api: Arc<dyn SubscriptionApi>,
    state: watch::Sender<SubscriptionState>,
    in_flight: Mutex<()>,
    notices: Option<mpsc::UnboundedSender<Notice>>,
}

impl SubscriptionManager {
    pub fn new(config: ManagerConfig, platform: Arc<dyn PushPlatform>, api: Arc<dyn SubscriptionApi>) -> Self {
        let initial = if platform.is_supported() {
            SubscriptionState::Unknown
        } else {
            SubscriptionState::Unsupported
        };
        let (state, _) = watch::channel(initial);

        SubscriptionManager {
            config,
            platform,
            api,
            state,
            in_flight: Mutex::new(()),
            notices: None,
        }
    }

    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<Notice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Resolves `Unknown` from what the platform already has. Read-only.
    pub async fn refresh(&self) -> Result<SubscriptionState, ClientError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ClientError::Busy)?;

        if !self.platform.is_supported() {
            return Ok(self.set_state(SubscriptionState::Unsupported));
        }
        if self.platform.permission() == Permission::Denied {
            return Ok(self.set_state(SubscriptionState::PermissionDenied));
        }

        match self.platform.current_subscription().await {
            Ok(Some(_)) => Ok(self.set_state(SubscriptionState::Subscribed)),
            Ok(None) => Ok(self.set_state(SubscriptionState::Unsubscribed)),
            Err(e) => {
                tracing::error!("Error checking push subscription: {}", e);
                Err(e)
            }
        }
    }

    pub async fn subscribe(&self, session: Option<&Session>) -> Result<SubscriptionState, ClientError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ClientError::Busy)?;

        match self.state() {
            SubscriptionState::Unsupported => return Err(ClientError::Unsupported),
            SubscriptionState::Subscribed => return Ok(SubscriptionState::Subscribed),
            SubscriptionState::PermissionDenied => {
                self.emit(Notice::permission_denied());
                return Err(ClientError::PermissionDenied);
            }
            SubscriptionState::Unknown | SubscriptionState::Unsubscribed => {}
        }

        let session = match session {
            Some(session) => session,
            None => {
                self.emit(Notice::sign_in_required());
                return Err(ClientError::NotSignedIn);
            }
        };

        let key = match self.server_key() {
            Ok(key) => key,
            Err(e) => {
                tracing::error!("{}", e);
                self.emit(Notice::configuration_error());
                return Err(e);
            }
        };

        match self.platform.request_permission().await {
            Permission::Granted => {}
            Permission::Denied => {
                self.set_state(SubscriptionState::PermissionDenied);
                self.emit(Notice::permission_denied());
                return Err(ClientError::PermissionDenied);
            }
            Permission::Default => {
                self.emit(Notice::permission_denied());
                return Err(ClientError::PermissionDismissed);
            }
        }

        match self.register_and_save(session, &key).await {
            Ok(()) => {
                self.emit(Notice::enabled());
                Ok(self.set_state(SubscriptionState::Subscribed))
            }
            Err(e) => {
                tracing::error!("Error subscribing to push: {}", e);
                self.set_state(SubscriptionState::Unsubscribed);
                self.emit(Notice::subscription_failed());
                Err(e)
            }
        }
    }

    /// Cancels the platform registration first; the store row is removed
    /// best effort since the coordinator prunes rows whose endpoint is gone.
    pub async fn unsubscribe(&self, session: Option<&Session>) -> Result<SubscriptionState, ClientError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ClientError::Busy)?;

        if self.state() == SubscriptionState::Unsupported {
            return Err(ClientError::Unsupported);
        }

        let current = match self.platform.current_subscription().await {
            Ok(current) => current,
            Err(e) => return Err(self.unsubscribe_failed(e)),
        };

        if let Some(subscription) = current {
            if let Err(e) = self.platform.unsubscribe(&subscription.endpoint).await {
                return Err(self.unsubscribe_failed(e));
            }

            if let Some(session) = session {
                if let Err(e) = self.api.remove(session, &subscription.endpoint).await {
                    tracing::warn!(
                        "Unsubscribed locally but could not remove {} from the store: {}",
                        subscription.endpoint,
                        e
                    );
                }
            }
        }

        self.emit(Notice::disabled());
        Ok(self.set_state(SubscriptionState::Unsubscribed))
    }

    pub async fn toggle(&self, session: Option<&Session>) -> Result<SubscriptionState, ClientError> {
        if self.state() == SubscriptionState::Subscribed {
            self.unsubscribe(session).await
        } else {
            self.subscribe(session).await
        }
    }

    /// Replaces a registration the push service rotated. Needs no prompt.
    pub async fn resubscribe(&self, session: &Session, old_endpoint: Option<&str>) -> Result<SubscriptionState, ClientError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ClientError::Busy)?;

        if self.platform.permission() != Permission::Granted {
            return Err(ClientError::PermissionDenied);
        }

        let key = self.server_key()?;
        let saved = match self.platform.subscribe(&key).await {
            Ok(subscription) => self.save_or_roll_back(session, subscription).await,
            Err(e) => Err(e),
        };
        let subscription = match saved {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!("Error rotating push subscription: {}", e);
                self.set_state(SubscriptionState::Unsubscribed);
                self.emit(Notice::subscription_failed());
                return Err(e);
            }
        };

        if let Some(old) = old_endpoint.filter(|old| *old != subscription.endpoint) {
            if let Err(e) = self.api.remove(session, old).await {
                tracing::warn!("Could not remove rotated endpoint {}: {}", old, e);
            }
        }

        tracing::info!("Push subscription rotated for user {}", session.user_id);
        Ok(self.set_state(SubscriptionState::Subscribed))
    }

    async fn register_and_save(&self, session: &Session, key: &[u8]) -> Result<(), ClientError> {
        self.platform
            .register_worker(&self.config.worker_script, &self.config.worker_scope)
            .await?;
        self.platform.worker_ready().await?;

        let subscription = self.platform.subscribe(key).await?;
        self.save_or_roll_back(session, subscription).await?;

        Ok(())
    }

    /// Stores a fresh registration, cancelling it on the platform if the
    /// store write fails.
    async fn save_or_roll_back(
        &self,
        session: &Session,
        subscription: PushSubscriptionInfo,
    ) -> Result<PushSubscriptionInfo, ClientError> {
        if let Err(e) = self.api.save(session, &self.record(session, &subscription)).await {
            if let Err(rollback) = self.platform.unsubscribe(&subscription.endpoint).await {
                tracing::error!("Rollback of push registration failed: {}", rollback);
            }
            return Err(match e {
                ClientError::StoreWrite(_) => e,
                other => ClientError::StoreWrite(other.to_string()),
            });
        }

        Ok(subscription)
    }

    fn record(&self, session: &Session, subscription: &PushSubscriptionInfo) -> SubscriptionRecord {
        SubscriptionRecord {
            user_id: session.user_id.clone(),
            endpoint: subscription.endpoint.clone(),
            p256dh: subscription.keys.p256dh.clone(),
            auth: subscription.keys.auth.clone(),
            user_agent: self.platform.user_agent(),
        }
    }

    fn server_key(&self) -> Result<Vec<u8>, ClientError> {
        let public_key = self
            .config
            .vapid_public_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ClientError::NotConfigured("VAPID public key not configured".to_string()))?;

        application_server_key(public_key).map_err(ClientError::NotConfigured)
    }

    fn unsubscribe_failed(&self, e: ClientError) -> ClientError {
        tracing::error!("Error unsubscribing from push: {}", e);
        self.emit(Notice::error());
        e
    }

    fn set_state(&self, state: SubscriptionState) -> SubscriptionState {
        self.state.send_replace(state);
        state
    }

    fn emit(&self, notice: Notice) {
        if let Some(notices) = &self.notices {
            let _ = notices.send(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::Severity;
    use crate::platform::SubscriptionKeys;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    const PUBLIC_KEY: &str = "BNK103KUtxk3rva6q9wGAh4jOHKb6OOtq7Ss6HgmjtgBvFPLGfAtFMvIgIhjGF9GsShp3dyd7RFZpwBKGJyxAjo";

    struct FakePlatform {
        supported: bool,
        permission: StdMutex<Permission>,
        answer: Permission,
        prompts: AtomicUsize,
        registered: StdMutex<Option<PushSubscriptionInfo>>,
        endpoints_issued: AtomicUsize,
        unsubscribe_fails: bool,
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl FakePlatform {
        fn new(answer: Permission) -> Self {
            FakePlatform {
                supported: true,
                permission: StdMutex::new(Permission::Default),
                answer,
                prompts: AtomicUsize::new(0),
                registered: StdMutex::new(None),
                endpoints_issued: AtomicUsize::new(0),
                unsubscribe_fails: false,
                gate: None,
            }
        }

        fn registered(&self) -> Option<PushSubscriptionInfo> {
            self.registered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PushPlatform for FakePlatform {
        fn is_supported(&self) -> bool {
            self.supported
        }

        fn permission(&self) -> Permission {
            *self.permission.lock().unwrap()
        }

        async fn request_permission(&self) -> Permission {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            *self.permission.lock().unwrap() = self.answer;
            self.answer
        }

        async fn register_worker(&self, script: &str, scope: &str) -> Result<(), ClientError> {
            assert_eq!(script, "/sw-push.js");
            assert_eq!(scope, "/");
            Ok(())
        }

        async fn worker_ready(&self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn current_subscription(&self) -> Result<Option<PushSubscriptionInfo>, ClientError> {
            Ok(self.registered())
        }

        async fn subscribe(&self, application_server_key: &[u8]) -> Result<PushSubscriptionInfo, ClientError> {
            assert_eq!(application_server_key.len(), 65);
            let n = self.endpoints_issued.fetch_add(1, Ordering::SeqCst);
            let info = PushSubscriptionInfo {
                endpoint: format!("https://push.example.com/device-{}", n),
                keys: SubscriptionKeys {
                    p256dh: "p256dh".to_string(),
                    auth: "auth".to_string(),
                },
            };
            *self.registered.lock().unwrap() = Some(info.clone());
            Ok(info)
        }

        async fn unsubscribe(&self, _endpoint: &str) -> Result<(), ClientError> {
            if self.unsubscribe_fails {
                return Err(ClientError::Platform("unsubscribe failed".to_string()));
            }
            *self.registered.lock().unwrap() = None;
            Ok(())
        }

        fn user_agent(&self) -> String {
            "FakeBrowser/1.0".to_string()
        }
    }

    #[derive(Default)]
    struct FakeApi {
        rows: StdMutex<HashMap<String, SubscriptionRecord>>,
        fail_save: bool,
        fail_remove: bool,
    }

    impl FakeApi {
        fn len(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SubscriptionApi for FakeApi {
        async fn save(&self, _session: &Session, record: &SubscriptionRecord) -> Result<(), ClientError> {
            if self.fail_save {
                return Err(ClientError::StoreWrite("network error".to_string()));
            }
            self.rows.lock().unwrap().insert(record.endpoint.clone(), record.clone());
            Ok(())
        }

        async fn remove(&self, _session: &Session, endpoint: &str) -> Result<(), ClientError> {
            if self.fail_remove {
                return Err(ClientError::StoreWrite("network error".to_string()));
            }
            self.rows.lock().unwrap().remove(endpoint);
            Ok(())
        }
    }

    fn session() -> Session {
        Session {
            user_id: "user-1".to_string(),
            access_token: "token".to_string(),
        }
    }

    fn manager(platform: Arc<FakePlatform>, api: Arc<FakeApi>) -> SubscriptionManager {
        SubscriptionManager::new(ManagerConfig::new(Some(PUBLIC_KEY.to_string())), platform, api)
    }

    #[tokio::test]
    async fn test_subscribe_twice_keeps_one_row_and_prompts_once() {
        let platform = Arc::new(FakePlatform::new(Permission::Granted));
        let api = Arc::new(FakeApi::default());
        let manager = manager(platform.clone(), api.clone());

        assert_eq!(manager.subscribe(Some(&session())).await.unwrap(), SubscriptionState::Subscribed);
        assert_eq!(manager.subscribe(Some(&session())).await.unwrap(), SubscriptionState::Subscribed);

        assert_eq!(api.len(), 1);
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 1);
        let row = api.rows.lock().unwrap().values().next().cloned().unwrap();
        assert_eq!(row.user_id, "user-1");
        assert_eq!(row.user_agent, "FakeBrowser/1.0");
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_platform_registration() {
        let platform = Arc::new(FakePlatform::new(Permission::Granted));
        let api = Arc::new(FakeApi {
            fail_save: true,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = manager(platform.clone(), api.clone()).with_notices(tx);

        let err = manager.subscribe(Some(&session())).await.unwrap_err();

        assert!(matches!(err, ClientError::StoreWrite(_)));
        assert_eq!(manager.state(), SubscriptionState::Unsubscribed);
        assert!(platform.registered().is_none(), "registration must be rolled back");
        assert_eq!(rx.recv().await.unwrap(), Notice::subscription_failed());
    }

    #[tokio::test]
    async fn test_denied_permission_is_sticky() {
        let platform = Arc::new(FakePlatform::new(Permission::Denied));
        let api = Arc::new(FakeApi::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = manager(platform.clone(), api.clone()).with_notices(tx);

        let err = manager.subscribe(Some(&session())).await.unwrap_err();
        assert!(matches!(err, ClientError::PermissionDenied));
        assert_eq!(manager.state(), SubscriptionState::PermissionDenied);

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.title, "Permission denied");
        assert_eq!(notice.severity, Severity::Destructive);

        assert!(manager.subscribe(Some(&session())).await.is_err());
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 1);
        assert_eq!(api.len(), 0);
    }

    #[tokio::test]
    async fn test_dismissed_prompt_stays_unsubscribed() {
        let platform = Arc::new(FakePlatform::new(Permission::Default));
        let manager = manager(platform, Arc::new(FakeApi::default()));
        manager.refresh().await.unwrap();

        let err = manager.subscribe(Some(&session())).await.unwrap_err();
        assert!(matches!(err, ClientError::PermissionDismissed));
        assert_eq!(manager.state(), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_subscribe_requires_session_and_key() {
        let platform = Arc::new(FakePlatform::new(Permission::Granted));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = manager(platform.clone(), Arc::new(FakeApi::default())).with_notices(tx);

        assert!(matches!(manager.subscribe(None).await, Err(ClientError::NotSignedIn)));
        assert_eq!(rx.recv().await.unwrap(), Notice::sign_in_required());

        let unconfigured = SubscriptionManager::new(ManagerConfig::new(None), platform.clone(), Arc::new(FakeApi::default()));
        assert!(matches!(
            unconfigured.subscribe(Some(&session())).await,
            Err(ClientError::NotConfigured(_))
        ));
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_platform_does_nothing() {
        let mut platform = FakePlatform::new(Permission::Granted);
        platform.supported = false;
        let platform = Arc::new(platform);
        let manager = manager(platform.clone(), Arc::new(FakeApi::default()));

        assert_eq!(manager.state(), SubscriptionState::Unsupported);
        assert!(matches!(manager.subscribe(Some(&session())).await, Err(ClientError::Unsupported)));
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_is_read_only() {
        let platform = Arc::new(FakePlatform::new(Permission::Granted));
        let manager = manager(platform.clone(), Arc::new(FakeApi::default()));
        let mut watch = manager.watch();

        assert_eq!(manager.refresh().await.unwrap(), SubscriptionState::Unsubscribed);
        assert!(platform.registered().is_none());
        assert_eq!(platform.endpoints_issued.load(Ordering::SeqCst), 0);
        assert!(watch.has_changed().unwrap());
        assert_eq!(*watch.borrow_and_update(), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_refresh_reports_denied_permission() {
        let platform = Arc::new(FakePlatform::new(Permission::Granted));
        *platform.permission.lock().unwrap() = Permission::Denied;
        let manager = manager(platform, Arc::new(FakeApi::default()));

        assert_eq!(manager.refresh().await.unwrap(), SubscriptionState::PermissionDenied);
    }

    #[tokio::test]
    async fn test_overlapping_operation_is_busy() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut platform = FakePlatform::new(Permission::Granted);
        platform.gate = Some((entered.clone(), release.clone()));
        let api = Arc::new(FakeApi::default());
        let manager = Arc::new(manager(Arc::new(platform), api.clone()));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.subscribe(Some(&session())).await })
        };
        entered.notified().await;

        assert!(matches!(manager.subscribe(Some(&session())).await, Err(ClientError::Busy)));
        assert!(matches!(manager.unsubscribe(Some(&session())).await, Err(ClientError::Busy)));

        release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), SubscriptionState::Subscribed);
        assert_eq!(api.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_honors_intent_when_store_delete_fails() {
        let platform = Arc::new(FakePlatform::new(Permission::Granted));
        let api = Arc::new(FakeApi {
            fail_remove: true,
            ..Default::default()
        });
        let manager = manager(platform.clone(), api.clone());
        manager.subscribe(Some(&session())).await.unwrap();

        assert_eq!(manager.unsubscribe(Some(&session())).await.unwrap(), SubscriptionState::Unsubscribed);
        assert!(platform.registered().is_none());
        assert_eq!(api.len(), 1, "orphaned row is left for expiry pruning");
    }

    #[tokio::test]
    async fn test_unsubscribe_platform_failure_keeps_subscribed() {
        let mut platform = FakePlatform::new(Permission::Granted);
        platform.unsubscribe_fails = true;
        let platform = Arc::new(platform);
        let api = Arc::new(FakeApi::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = manager(platform, api.clone()).with_notices(tx);
        manager.subscribe(Some(&session())).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Notice::enabled());

        assert!(manager.unsubscribe(Some(&session())).await.is_err());
        assert_eq!(manager.state(), SubscriptionState::Subscribed);
        assert_eq!(rx.recv().await.unwrap(), Notice::error());
        assert_eq!(api.len(), 1);
    }

    #[tokio::test]
    async fn test_toggle_flips_state() {
        let platform = Arc::new(FakePlatform::new(Permission::Granted));
        let api = Arc::new(FakeApi::default());
        let manager = manager(platform, api.clone());

        assert_eq!(manager.toggle(Some(&session())).await.unwrap(), SubscriptionState::Subscribed);
        assert_eq!(manager.toggle(Some(&session())).await.unwrap(), SubscriptionState::Unsubscribed);
        assert_eq!(api.len(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_rotated_endpoint() {
        let platform = Arc::new(FakePlatform::new(Permission::Granted));
        let api = Arc::new(FakeApi::default());
        let manager = manager(platform.clone(), api.clone());
        manager.subscribe(Some(&session())).await.unwrap();
        let old = platform.registered().unwrap().endpoint;

        let state = manager.resubscribe(&session(), Some(&old)).await.unwrap();

        assert_eq!(state, SubscriptionState::Subscribed);
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 1);
        let rows = api.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows.contains_key(&old));
    }

    #[tokio::test]
    async fn test_resubscribe_store_failure_rolls_back() {
        let platform = Arc::new(FakePlatform::new(Permission::Granted));
        let saving = Arc::new(FakeApi::default());
        manager(platform.clone(), saving).subscribe(Some(&session())).await.unwrap();
        let old = platform.registered().unwrap().endpoint;

        let api = Arc::new(FakeApi {
            fail_save: true,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = manager(platform.clone(), api.clone()).with_notices(tx);
        manager.refresh().await.unwrap();
        assert_eq!(manager.state(), SubscriptionState::Subscribed);

        let err = manager.resubscribe(&session(), Some(&old)).await.unwrap_err();

        assert!(matches!(err, ClientError::StoreWrite(_)));
        assert_eq!(manager.state(), SubscriptionState::Unsubscribed);
        assert!(platform.registered().is_none(), "rotated registration must be rolled back");
        assert_eq!(rx.recv().await.unwrap(), Notice::subscription_failed());
        assert_eq!(api.len(), 0);
    }
}
