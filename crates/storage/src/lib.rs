// Postgres storage layer with sqlx
//
// This crate provides database implementations for core traits:
// - PgStore: implements AgentStore, RunStore and ScheduleStore
// - StorageBackend: chooses PgStore or the core InMemoryStore at startup

pub mod backend;
pub mod postgres;
mod rows;

pub use backend::StorageBackend;
pub use postgres::PgStore;
