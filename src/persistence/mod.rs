//! Persistence layer modules.

pub mod container_registry;
pub mod db;
pub mod retention;
pub mod schema;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
