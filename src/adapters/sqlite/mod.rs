//! SQLite adapters for the store ports.

pub mod agent_store;
pub mod connection;
pub mod event_store;
pub mod migrations;
pub mod task_store;

pub use agent_store::SqliteAgentStore;
pub use connection::{create_pool, create_test_pool, ConnectionError, PoolConfig};
pub use event_store::{SqliteEventStore, SqliteGroupStore};
pub use migrations::{Migration, MigrationError, Migrator};
pub use task_store::{SqliteTaskStore, UPSTREAM_CANCELLED, UPSTREAM_FAILURE};
