//! Execution of validated SQL.

pub mod engine;
pub mod postgres;

pub use engine::*;
pub use postgres::PgStore;
