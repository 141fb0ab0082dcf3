// ABOUTME: Connection trait seams between the core engine and database drivers
// ABOUTME: Source side yields typed rows with borrowed LOB readers; sink side executes cached DML

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use std::io::Read;

use crate::error::Result;
use crate::value::BindValue;

/// One row produced by a source-side query.
///
/// Accessors are positional and typed; every accessor returns `None`
/// for SQL NULL. The LOB readers borrow from the row: they must be
/// drained before the row is dropped, which is exactly the window in
/// which the backing stream is valid.
pub trait SourceRow: Send {
    fn get_i8(&self, idx: usize) -> Result<Option<i8>>;
    fn get_i16(&self, idx: usize) -> Result<Option<i16>>;
    fn get_i32(&self, idx: usize) -> Result<Option<i32>>;
    fn get_i64(&self, idx: usize) -> Result<Option<i64>>;
    fn get_f32(&self, idx: usize) -> Result<Option<f32>>;
    fn get_f64(&self, idx: usize) -> Result<Option<f64>>;
    fn get_decimal(&self, idx: usize) -> Result<Option<Decimal>>;
    fn get_date(&self, idx: usize) -> Result<Option<NaiveDate>>;
    fn get_timestamp(&self, idx: usize) -> Result<Option<NaiveDateTime>>;
    fn get_string(&self, idx: usize) -> Result<Option<String>>;
    fn get_bytes(&self, idx: usize) -> Result<Option<Vec<u8>>>;
    /// Backing stream of a large binary object, if the value is present.
    fn binary_stream(&self, idx: usize) -> Result<Option<Box<dyn Read + '_>>>;
    /// Backing stream of a large character object, if the value is present.
    fn character_stream(&self, idx: usize) -> Result<Option<Box<dyn Read + '_>>>;
}

/// Source-side connection used by one poll cycle.
///
/// A cycle calls `begin`, runs its log read and row lookups, flushes
/// log deletions through `execute`, and `commit`s, all on this one
/// connection so the deletions are consistent with what was read.
/// Read-committed isolation is sufficient.
#[async_trait]
pub trait SourceConnection: Send {
    /// Open a transaction scope for one poll cycle.
    async fn begin(&mut self) -> Result<()>;

    /// Run a query, returning at most `max_rows` rows when a ceiling is
    /// given. The ceiling is a hard stop: rows past it are not read.
    async fn fetch(
        &mut self,
        sql: &str,
        params: &[BindValue],
        max_rows: Option<usize>,
    ) -> Result<Vec<Box<dyn SourceRow>>>;

    /// Execute a statement, returning the number of rows affected.
    async fn execute(&mut self, sql: &str, params: &[BindValue]) -> Result<u64>;

    /// Close the cycle's transaction scope.
    async fn commit(&mut self) -> Result<()>;

    /// Abandon the cycle's transaction scope after a failure.
    ///
    /// A failed statement leaves the transaction aborted; rolling back
    /// returns the connection to a usable state for the next table's
    /// cycle.
    async fn rollback(&mut self) -> Result<()>;
}

/// Sink-side connection used by the applier.
///
/// Implementations prepare each distinct statement text on first use
/// and reuse the handle for subsequent executions; `close_statements`
/// releases everything prepared so far.
#[async_trait]
pub trait SinkConnection: Send {
    /// Execute a DML statement, returning the number of rows affected.
    async fn execute(&mut self, sql: &str, params: &[BindValue]) -> Result<u64>;

    /// Execute a DDL statement (no parameters, no row count).
    async fn execute_ddl(&mut self, sql: &str) -> Result<()>;

    /// Probe whether a table exists in the destination.
    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Release every cached prepared statement.
    async fn close_statements(&mut self) -> Result<()>;
}
