//! Persistence layer — libSQL-backed storage for registrations and the
//! permanent entities finalization creates.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, FinalizedIds};
