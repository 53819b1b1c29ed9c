//! Database module for PostgreSQL connection and the audit tables

pub mod audit_repo;
pub mod connection;

pub use audit_repo::PgAuditStore;
pub use connection::{init_pool, DbPool};
