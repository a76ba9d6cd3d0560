//! Database module: SQLite-backed queue, run and step-history storage.
//!
//! - `model`: row types returned by repositories.
//! - `repo`: SQL-only functions that map rows into those types.
//!
//! Callers import from `crate::db` directly; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{NewStepEvent, OutboxMessage, RunRow, StepEvent};
