//! Durable task store for graft.
//!
//! Owns the relational model (workflows, tasks, dependency edges,
//! experiences) and every multi-row transition the engine relies on:
//! claim/report, reaping, evaluation recording, and DAG surgery. Each
//! public operation is a single transaction.

pub mod dag;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;

pub use error::StoreError;
pub use pool::DbConfig;
