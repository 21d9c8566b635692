//! Migration System
//!
//! Change-set discovery, the application ledger, and the engine that applies
//! and reverts change-sets against them.

pub mod definitions;
pub mod engine;
pub mod ledger;
pub mod lock;
pub mod observer;
pub mod repository;
pub mod scaffold;

pub use definitions::*;
pub use engine::MigrationEngine;
pub use ledger::ApplicationLedger;
pub use lock::{lock_key, MigrationLock, LOCKED_RUN_CONNECTIONS};
pub use observer::{MigrationObserver, ObserverRegistry, SkipReason, TracingObserver};
pub use repository::{ChangeSetRepository, DirectoryRepository};
pub use scaffold::{create_change_set, create_change_set_at, ScaffoldedChangeSet};
