//! Application Ledger - Durable record of applied and reverted change-sets
//!
//! The ledger is an append-only event log: applying a change-set inserts a
//! row, reverting it stamps `reverted_at` on the most recent active row. A
//! change-set is active iff it has a row with `reverted_at` null. Every write
//! happens inside the caller's transaction, next to the schema change it
//! describes.

use chrono::Utc;
use std::sync::Arc;

use super::definitions::LedgerEntry;
use crate::backends::{DatabasePool, DatabaseRow, DatabaseRowExt, DatabaseTransaction, DatabaseValue};
use crate::error::{DatabaseError, MigrationError, MigrationResult};

/// Ledger table accessor
#[derive(Clone)]
pub struct ApplicationLedger {
    pool: Arc<dyn DatabasePool>,
    table: String,
}

impl ApplicationLedger {
    pub fn new(pool: Arc<dyn DatabasePool>, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Name of the backing table
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the backing table and its index if absent.
    ///
    /// Safe to race: when another session creates the objects between our
    /// existence check and our insert into the catalog, Postgres reports a
    /// duplicate error that is treated as success.
    pub async fn ensure_schema(&self) -> MigrationResult<()> {
        for sql in [self.create_table_sql(), self.create_index_sql()] {
            match self.pool.execute(&sql, &[]).await {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {
                    tracing::debug!(
                        table = %self.table,
                        code = e.code().unwrap_or_default(),
                        "Ledger object created concurrently by another session"
                    );
                }
                Err(e) => return Err(MigrationError::Ledger(e)),
            }
        }
        Ok(())
    }

    /// Whether `name` has an entry that has not been reverted
    pub async fn is_active(&self, name: &str) -> MigrationResult<bool> {
        let (sql, params) = self.is_active_sql(name);
        let row = self
            .pool
            .fetch_optional(&sql, &params)
            .await
            .map_err(MigrationError::Ledger)?;
        decode_active(row)
    }

    /// Same as `is_active`, evaluated inside an open transaction
    pub async fn is_active_in(
        &self,
        tx: &mut dyn DatabaseTransaction,
        name: &str,
    ) -> MigrationResult<bool> {
        let (sql, params) = self.is_active_sql(name);
        let row = tx
            .fetch_optional(&sql, &params)
            .await
            .map_err(MigrationError::Ledger)?;
        decode_active(row)
    }

    /// Append an active entry for `name` in the caller's transaction
    pub async fn record_applied(
        &self,
        tx: &mut dyn DatabaseTransaction,
        name: &str,
    ) -> MigrationResult<()> {
        let (sql, params) = self.record_applied_sql(name);
        tx.execute(&sql, &params)
            .await
            .map_err(MigrationError::Ledger)?;
        Ok(())
    }

    /// Close the most recent active entry for `name` in the caller's transaction
    pub async fn record_reverted(
        &self,
        tx: &mut dyn DatabaseTransaction,
        name: &str,
    ) -> MigrationResult<()> {
        let (sql, params) = self.record_reverted_sql(name);
        let affected = tx
            .execute(&sql, &params)
            .await
            .map_err(MigrationError::Ledger)?;

        if affected == 0 {
            return Err(MigrationError::NoActiveEntry {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Full history, oldest first
    pub async fn entries(&self) -> MigrationResult<Vec<LedgerEntry>> {
        let rows = self
            .pool
            .fetch_all(&self.entries_sql(), &[])
            .await
            .map_err(MigrationError::Ledger)?;

        rows.iter()
            .map(|row| decode_entry(row.as_ref()).map_err(MigrationError::Ledger))
            .collect()
    }

    fn quoted_table(&self) -> String {
        self.table
            .split('.')
            .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn index_name(&self) -> String {
        let base = self.table.rsplit('.').next().unwrap_or(&self.table);
        format!("\"{}_active_idx\"", base.replace('"', "\"\""))
    }

    /// SQL to create the ledger table
    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id BIGSERIAL PRIMARY KEY,\n    \
                name VARCHAR(255) NOT NULL,\n    \
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n    \
                reverted_at TIMESTAMPTZ DEFAULT NULL\n\
            )",
            self.quoted_table()
        )
    }

    /// SQL to index the "currently active" lookup
    fn create_index_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (name) WHERE reverted_at IS NULL",
            self.index_name(),
            self.quoted_table()
        )
    }

    fn is_active_sql(&self, name: &str) -> (String, Vec<DatabaseValue>) {
        (
            format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE name = $1 AND reverted_at IS NULL) AS active",
                self.quoted_table()
            ),
            vec![name.into()],
        )
    }

    fn record_applied_sql(&self, name: &str) -> (String, Vec<DatabaseValue>) {
        (
            format!(
                "INSERT INTO {} (name, applied_at) VALUES ($1, $2)",
                self.quoted_table()
            ),
            vec![name.into(), Utc::now().into()],
        )
    }

    fn record_reverted_sql(&self, name: &str) -> (String, Vec<DatabaseValue>) {
        let table = self.quoted_table();
        (
            format!(
                "UPDATE {table} SET reverted_at = $2 \
                 WHERE id = (\
                    SELECT id FROM {table} \
                    WHERE name = $1 AND reverted_at IS NULL \
                    ORDER BY applied_at DESC, id DESC \
                    LIMIT 1\
                 )",
                table = table
            ),
            vec![name.into(), Utc::now().into()],
        )
    }

    fn entries_sql(&self) -> String {
        format!(
            "SELECT id, name, applied_at, reverted_at FROM {} ORDER BY id",
            self.quoted_table()
        )
    }
}

fn decode_active(row: Option<Box<dyn DatabaseRow>>) -> MigrationResult<bool> {
    let row = row.ok_or_else(|| {
        MigrationError::Ledger(DatabaseError::Decode(
            "Active check returned no row".to_string(),
        ))
    })?;
    row.get_bool("active").map_err(MigrationError::Ledger)
}

fn decode_entry(row: &dyn DatabaseRow) -> Result<LedgerEntry, DatabaseError> {
    Ok(LedgerEntry {
        id: row.get_i64("id")?,
        name: row.get_string("name")?,
        applied_at: row.get_datetime("applied_at")?,
        reverted_at: row.get_optional_datetime("reverted_at")?,
    })
}
