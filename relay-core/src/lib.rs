pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod memory;
pub mod schema;
pub mod store;
pub mod types;

pub use config::{Config, PushConfig};
pub use context::RelayContext;
pub use db::DbPool;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use store::{PgSubscriptionStore, SharedStore, SubscriptionStore};
pub use types::{
    DeliveryAttempt, DeliveryOutcome, ErrorClass, NewSubscription, NotificationAction,
    NotificationPayload, PayloadError, Subscription, Target,
};
