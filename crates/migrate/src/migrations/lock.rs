//! Migration Lock - Session-level advisory lock serialising runs
//!
//! Two processes migrating the same database would otherwise both see a
//! change-set as pending and both execute it. The lock is taken on a
//! dedicated connection and lives as long as that session, so a crashed
//! process releases it when its connection drops.

use crate::backends::{DatabaseConnection, DatabasePool, DatabaseRowExt, DatabaseValue};
use crate::error::{MigrationError, MigrationResult};

/// Connections a locked run holds at once: the lock session plus the
/// connection serving ledger reads or the current transaction
pub const LOCKED_RUN_CONNECTIONS: u32 = 2;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Advisory lock key for a ledger table.
///
/// FNV-1a over the table name: stable across processes, builds and
/// platforms, unlike `std`'s randomly seeded hasher.
pub fn lock_key(ledger_table: &str) -> i64 {
    let hash = ledger_table.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    hash as i64
}

/// A held advisory lock. Call `release` when the run is over.
pub struct MigrationLock {
    conn: Box<dyn DatabaseConnection>,
    key: i64,
}

impl MigrationLock {
    /// Block until the lock for `key` is held by a fresh session. There is
    /// no time limit; drop the future to give up.
    pub async fn acquire(pool: &dyn DatabasePool, key: i64) -> MigrationResult<Self> {
        let mut conn = pool.acquire().await.map_err(MigrationError::Lock)?;

        tracing::debug!(key, "Waiting for migration lock");
        conn.execute("SELECT pg_advisory_lock($1)", &[DatabaseValue::Int64(key)])
            .await
            .map_err(MigrationError::Lock)?;
        tracing::debug!(key, "Migration lock acquired");

        Ok(Self { conn, key })
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Release the lock. Failures are logged: the lock goes away with the
    /// session regardless, and the run's own outcome is what matters.
    pub async fn release(mut self) {
        let released = self
            .conn
            .fetch_optional("SELECT pg_advisory_unlock($1)", &[DatabaseValue::Int64(self.key)])
            .await;

        match released {
            Ok(Some(row)) => match row.get_bool("pg_advisory_unlock") {
                Ok(true) => tracing::debug!(key = self.key, "Migration lock released"),
                Ok(false) => {
                    tracing::warn!(key = self.key, "Migration lock was not held at release")
                }
                Err(e) => {
                    tracing::warn!(key = self.key, error = %e, "Unexpected unlock result")
                }
            },
            Ok(None) => tracing::warn!(key = self.key, "Unlock returned no row"),
            Err(e) => {
                tracing::warn!(key = self.key, error = %e, "Failed to release migration lock")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryDatabase;
    use std::time::Duration;

    #[test]
    fn test_lock_key_is_stable() {
        // FNV-1a reference values
        assert_eq!(lock_key(""), 0xcbf2_9ce4_8422_2325_u64 as i64);
        assert_eq!(lock_key("a"), 0xaf63_dc4c_8601_ec8c_u64 as i64);
        assert_eq!(lock_key("migrations"), lock_key("migrations"));
        assert_ne!(lock_key("migrations"), lock_key("ops.migrations"));
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let db = MemoryDatabase::new();
        let key = lock_key("migrations");

        let lock = MigrationLock::acquire(&db, key).await.unwrap();
        assert_eq!(lock.key(), key);
        assert_eq!(db.held_locks().await, vec![key]);

        // A second session waits while the first holds it
        assert!(
            tokio::time::timeout(Duration::from_millis(50), MigrationLock::acquire(&db, key))
                .await
                .is_err()
        );

        lock.release().await;
        assert!(db.held_locks().await.is_empty());

        let stats = db.stats().await;
        assert_eq!(stats.locks_acquired, 1);
        assert_eq!(stats.locks_released, 1);

        MigrationLock::acquire(&db, key).await.unwrap().release().await;
    }
}
