//! Browser-side half of the push pipeline: the subscription state machine
//! and the service worker's event handling, with the browser reached only
//! through the [`PushPlatform`] and [`WorkerPlatform`] traits.

pub mod api;
pub mod error;
pub mod manager;
pub mod notice;
pub mod platform;
pub mod worker;

pub use api::{RestSubscriptionApi, Session, SubscriptionApi, SubscriptionRecord};
pub use error::{ClientError, WorkerError};
pub use manager::{ManagerConfig, SubscriptionManager, SubscriptionState};
pub use notice::{Notice, Severity};
pub use platform::{Permission, PushPlatform, PushSubscriptionInfo, SubscriptionKeys};
pub use worker::{
    NotificationDefaults, NotificationOptions, ServiceWorker, WindowClient, WorkerConfig,
    WorkerEvent, WorkerPlatform,
};
