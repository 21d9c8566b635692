//! Database Backend Abstractions
//!
//! The engine talks to the database through the traits in `core`. PostgreSQL
//! is the production backend; `memory` is a process-local stand-in used by
//! tests.

pub mod core;
pub mod memory;
pub mod postgres;

// Re-export core traits and types
pub use core::*;
pub use memory::{MemoryDatabase, MemoryStats};
pub use postgres::PostgresBackend;
