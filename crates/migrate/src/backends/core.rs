//! Core Database Backend Traits
//!
//! This module defines the traits the migration engine uses to talk to a
//! database. They abstract the driver away so the engine, the ledger and the
//! advisory lock can run against PostgreSQL in production and against the
//! in-memory backend in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{DatabaseError, DbResult};

/// A single connection checked out of a pool
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    /// Execute a parameterised statement and return the affected rows count
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DbResult<u64>;

    /// Execute a statement and return the first result row
    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DbResult<Option<Box<dyn DatabaseRow>>>;
}

/// An open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait DatabaseTransaction: Send + Sync {
    /// Execute a parameterised statement within the transaction
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DbResult<u64>;

    /// Execute a raw, possibly multi-statement script within the transaction
    async fn execute_script(&mut self, sql: &str) -> DbResult<()>;

    /// Execute a statement and return the first result row within the transaction
    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DbResult<Option<Box<dyn DatabaseRow>>>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> DbResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> DbResult<()>;
}

/// Connection pool the engine borrows connections and transactions from
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Acquire a dedicated connection from the pool
    async fn acquire(&self) -> DbResult<Box<dyn DatabaseConnection>>;

    /// Begin a transaction on a pooled connection
    async fn begin_transaction(&self) -> DbResult<Box<dyn DatabaseTransaction>>;

    /// Execute a statement directly on the pool
    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> DbResult<u64>;

    /// Execute a statement and return all result rows directly on the pool
    async fn fetch_all(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DbResult<Vec<Box<dyn DatabaseRow>>>;

    /// Execute a statement and return the first result row directly on the pool
    async fn fetch_optional(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DbResult<Option<Box<dyn DatabaseRow>>>;

    /// Close the pool
    async fn close(&self) -> DbResult<()>;
}

/// A result row
pub trait DatabaseRow: Send + Sync {
    /// Get a column value by index
    fn get_by_index(&self, index: usize) -> DbResult<DatabaseValue>;

    /// Get a column value by name
    fn get_by_name(&self, name: &str) -> DbResult<DatabaseValue>;

    /// Get column count
    fn column_count(&self) -> usize;
}

/// Typed accessors on top of `DatabaseRow`
pub trait DatabaseRowExt {
    fn get_bool(&self, column: &str) -> DbResult<bool>;
    fn get_i64(&self, column: &str) -> DbResult<i64>;
    fn get_string(&self, column: &str) -> DbResult<String>;
    fn get_datetime(&self, column: &str) -> DbResult<DateTime<Utc>>;
    fn get_optional_datetime(&self, column: &str) -> DbResult<Option<DateTime<Utc>>>;
}

impl<R: DatabaseRow + ?Sized> DatabaseRowExt for R {
    fn get_bool(&self, column: &str) -> DbResult<bool> {
        match self.get_by_name(column)? {
            DatabaseValue::Bool(b) => Ok(b),
            other => Err(unexpected(column, "bool", &other)),
        }
    }

    fn get_i64(&self, column: &str) -> DbResult<i64> {
        match self.get_by_name(column)? {
            DatabaseValue::Int32(i) => Ok(i as i64),
            DatabaseValue::Int64(i) => Ok(i),
            other => Err(unexpected(column, "integer", &other)),
        }
    }

    fn get_string(&self, column: &str) -> DbResult<String> {
        match self.get_by_name(column)? {
            DatabaseValue::String(s) => Ok(s),
            other => Err(unexpected(column, "string", &other)),
        }
    }

    fn get_datetime(&self, column: &str) -> DbResult<DateTime<Utc>> {
        match self.get_by_name(column)? {
            DatabaseValue::DateTime(dt) => Ok(dt),
            other => Err(unexpected(column, "timestamp", &other)),
        }
    }

    fn get_optional_datetime(&self, column: &str) -> DbResult<Option<DateTime<Utc>>> {
        match self.get_by_name(column)? {
            DatabaseValue::Null => Ok(None),
            DatabaseValue::DateTime(dt) => Ok(Some(dt)),
            other => Err(unexpected(column, "nullable timestamp", &other)),
        }
    }
}

fn unexpected(column: &str, expected: &str, found: &DatabaseValue) -> DatabaseError {
    DatabaseError::Decode(format!(
        "Column '{}' expected {}, found {:?}",
        column, expected, found
    ))
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Borrow the value as a string slice, if it is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(value: DateTime<Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct DatabasePoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: Option<u64>,
    pub max_lifetime_seconds: Option<u64>,
    pub test_before_acquire: bool,
}

impl Default for DatabasePoolConfig {
    fn default() -> Self {
        // A run needs one connection for the advisory lock and one for the
        // current change-set transaction.
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_seconds: 30,
            idle_timeout_seconds: Some(600),
            max_lifetime_seconds: Some(1800),
            test_before_acquire: true,
        }
    }
}
