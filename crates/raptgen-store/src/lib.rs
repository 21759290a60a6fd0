//! Durable job records on SQLite.
//!
//! Parent jobs own work-units; work-units own an append-only progress log,
//! two checkpoint slots and the latent embeddings of their best state.
//! BIC-sweep jobs own one trial record per component count and an
//! append-only score log.

pub mod schema;
pub mod sqlite;
pub mod types;

pub use sqlite::SqliteStore;
pub use types::*;
