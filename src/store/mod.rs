//! Persistence layer — libSQL-backed storage for orders, the sync ledger,
//! eSIM records, and upload OTPs.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
