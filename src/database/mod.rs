//! SQLite Persistence
//!
//! Append-only action store, reputation repository and the schema migrations
//! they share.

pub mod actions;
pub mod pool;
pub(crate) mod reader;
pub mod reputation;
pub mod schema;

pub use actions::{ActionStore, StoreEvent, StoreStatistics};
pub use pool::DatabasePool;
pub use reputation::ReputationRepository;
pub use schema::SCHEMA_VERSION;
