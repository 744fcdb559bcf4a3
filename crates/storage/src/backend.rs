// Storage backend abstraction
// Decision: Use enum dispatch for selecting the backend, trait objects for handing stores out
//
// StorageBackend is either PostgreSQL (production) or the core in-memory
// store (dev mode). Both implement AgentStore, RunStore and ScheduleStore.

use std::sync::Arc;

use runloop_core::{AgentStore, InMemoryStore, RunStore, ScheduleStore};

use crate::postgres::PgStore;

/// Storage backend that can be either PostgreSQL or in-memory
#[derive(Clone)]
pub enum StorageBackend {
    /// PostgreSQL database (production)
    Postgres(PgStore),
    /// In-memory store (dev mode, lost on restart)
    InMemory(Arc<InMemoryStore>),
}

impl StorageBackend {
    /// Connect to PostgreSQL and apply migrations
    pub async fn postgres(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let store = PgStore::connect(database_url, max_connections).await?;
        store.migrate().await?;
        Ok(Self::Postgres(store))
    }

    pub fn in_memory() -> Self {
        Self::InMemory(InMemoryStore::shared())
    }

    /// Check if this is dev mode (in-memory)
    pub fn is_dev_mode(&self) -> bool {
        matches!(self, Self::InMemory(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::InMemory(_) => "memory",
        }
    }

    pub fn agents(&self) -> Arc<dyn AgentStore> {
        match self {
            Self::Postgres(store) => Arc::new(store.clone()),
            Self::InMemory(store) => store.clone(),
        }
    }

    pub fn runs(&self) -> Arc<dyn RunStore> {
        match self {
            Self::Postgres(store) => Arc::new(store.clone()),
            Self::InMemory(store) => store.clone(),
        }
    }

    pub fn schedules(&self) -> Arc<dyn ScheduleStore> {
        match self {
            Self::Postgres(store) => Arc::new(store.clone()),
            Self::InMemory(store) => store.clone(),
        }
    }
}

impl std::fmt::Debug for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StorageBackend").field(&self.name()).finish()
    }
}
