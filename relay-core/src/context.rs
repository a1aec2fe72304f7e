use std::sync::Arc;

use crate::config::{Config, StoreBackend};
use crate::db::{create_pool, run_migrations};
use crate::memory::MemoryStore;
use crate::store::{PgSubscriptionStore, SharedStore};

#[derive(Clone)]
pub struct RelayContext {
    pub config: Arc<Config>,
    pub store: SharedStore,
}

impl RelayContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: SharedStore = match config.database.backend {
            StoreBackend::Postgres => {
                let pool = create_pool(&config.database).await?;
                run_migrations(&config.database).await?;
                Arc::new(PgSubscriptionStore::new(pool))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory subscription store; subscriptions are lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: SharedStore) -> Self {
        RelayContext {
            config: Arc::new(config),
            store,
        }
    }
}
