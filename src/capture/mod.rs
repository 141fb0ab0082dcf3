// ABOUTME: Change capture poller - drives the poll-resolve-deliver-delete cycle per table
// ABOUTME: Events within one table are produced in non-decreasing sequence order

pub mod delivery;
pub mod event;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::catalog::{Catalog, MetadataProvider};
use crate::conn::{SourceConnection, SourceRow};
use crate::error::{ReplicationError, Result};
use crate::sql::capture as capture_sql;
use crate::value::{bind, extract, BindValue, Value};

use delivery::EventDelivery;
use event::{ChangeEvent, ChangeOp, RowImage};

/// One source table with its change log and cached SQL texts.
///
/// Built once at startup; read-only thereafter. The three texts are
/// generated from the catalog exactly once and reused verbatim for the
/// life of the table.
#[derive(Debug)]
pub struct SourceTable {
    catalog: Catalog,
    log_name: String,
    log_select: String,
    row_lookup: String,
    log_delete: String,
}

impl SourceTable {
    pub fn new(catalog: Catalog, log_name: impl Into<String>) -> Self {
        let log_name = log_name.into();
        let log_select = capture_sql::log_select(&catalog, &log_name);
        let row_lookup = capture_sql::row_lookup(&catalog);
        let log_delete = capture_sql::log_delete(&catalog, &log_name);
        Self {
            catalog,
            log_name,
            log_select,
            row_lookup,
            log_delete,
        }
    }

    /// Build the table from an external metadata lookup.
    pub async fn from_metadata(
        provider: &mut dyn MetadataProvider,
        owner: &str,
        table: &str,
        log_name: &str,
    ) -> Result<Self> {
        let specs = provider.columns(owner, table).await?;
        let catalog = Catalog::from_specs(owner, table, specs)?;
        Ok(Self::new(catalog, log_name))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    pub fn log_select_sql(&self) -> &str {
        &self.log_select
    }

    pub fn row_lookup_sql(&self) -> &str {
        &self.row_lookup
    }

    pub fn log_delete_sql(&self) -> &str {
        &self.log_delete
    }

    /// Render primary-key values for log messages.
    pub fn describe_key(&self, key_values: &[Value]) -> String {
        self.catalog
            .key_columns()
            .iter()
            .zip(key_values.iter())
            .map(|(col, v)| format!("{}={}", col.name(), v.render()))
            .collect::<Vec<_>>()
            .join(" and ")
    }

    /// Parse one change-log row into a `LogEntry`.
    ///
    /// Log row layout matches `sql::capture::log_select`: key columns in
    /// key scan order, then sequence, operation tag, row version,
    /// capture timestamp, locator.
    fn parse_log_row(&self, row: &dyn SourceRow) -> Result<LogEntry> {
        let key_count = self.catalog.key_columns().len();
        let mut key_values = Vec::with_capacity(key_count);
        for (i, col) in self.catalog.key_columns().iter().enumerate() {
            key_values.push(extract(row, i, col)?);
        }
        let sequence = row
            .get_i64(key_count)?
            .ok_or_else(|| ReplicationError::sql_msg("log row missing sequence number"))?;
        let op_code = row
            .get_string(key_count + 1)?
            .ok_or_else(|| ReplicationError::sql_msg("log row missing operation tag"))?;
        let op = ChangeOp::from_code(&op_code).ok_or_else(|| {
            ReplicationError::sql_msg(format!("unknown operation tag {op_code:?} in change log"))
        })?;
        let row_version = row
            .get_i64(key_count + 2)?
            .ok_or_else(|| ReplicationError::sql_msg("log row missing row version"))?;
        let ts_ms = row
            .get_i64(key_count + 3)?
            .ok_or_else(|| ReplicationError::sql_msg("log row missing capture timestamp"))?;
        let locator = row
            .get_string(key_count + 4)?
            .ok_or_else(|| ReplicationError::sql_msg("log row missing row locator"))?;
        Ok(LogEntry {
            key_values,
            sequence,
            op,
            row_version,
            ts_ms,
            locator,
        })
    }
}

/// One row read from the change log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Primary-key values in key scan order.
    pub key_values: Vec<Value>,
    pub sequence: i64,
    pub op: ChangeOp,
    pub row_version: i64,
    pub ts_ms: i64,
    /// Opaque locator used only to delete this entry after processing.
    pub locator: String,
}

/// Statistics from one poll cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub rows_read: usize,
    pub events_delivered: usize,
    pub gaps_skipped: usize,
    pub log_rows_deleted: usize,
}

/// Source-side poller for one table.
///
/// Owns its table and delivery; one instance per table, never shared
/// across threads. Each call to `poll_cycle` is one complete pass over
/// the change log up to the batch ceiling.
pub struct CapturePoller<D: EventDelivery> {
    table: Arc<SourceTable>,
    batch_size: usize,
    delivery: D,
}

impl<D: EventDelivery> CapturePoller<D> {
    pub fn new(table: Arc<SourceTable>, batch_size: usize, delivery: D) -> Self {
        Self {
            table,
            batch_size,
            delivery,
        }
    }

    pub fn table(&self) -> &SourceTable {
        &self.table
    }

    /// Access the delivery, e.g. to drain a pull-mode batch.
    pub fn delivery_mut(&mut self) -> &mut D {
        &mut self.delivery
    }

    /// Run one poll cycle on the given connection.
    ///
    /// Reads at most `batch_size` log rows in sequence order, resolves
    /// each into a change event, delivers it, then deletes every read
    /// log row by locator — one statement execution per row, in read
    /// order, after the whole batch was delivered. A missing lookup row
    /// is logged and skipped; any other failure aborts the cycle, and
    /// the read-but-undeleted log rows are re-read next cycle.
    ///
    /// Log read, lookups and deletions share this connection's
    /// transaction scope; delivery happens outside it, which is why the
    /// pipeline is at-least-once. Cursors and statements are scoped
    /// values, released on every exit path.
    pub async fn poll_cycle(&mut self, conn: &mut dyn SourceConnection) -> Result<CycleStats> {
        conn.begin().await?;
        match self.drive_cycle(conn).await {
            Ok(stats) => {
                conn.commit().await?;
                Ok(stats)
            }
            Err(e) => {
                // The transaction is aborted; roll it back so the shared
                // connection can serve the next table's cycle.
                if let Err(rollback_err) = conn.rollback().await {
                    warn!("rollback after aborted cycle failed: {rollback_err}");
                }
                Err(e)
            }
        }
    }

    /// The body of one cycle, inside an already-open transaction.
    async fn drive_cycle(&mut self, conn: &mut dyn SourceConnection) -> Result<CycleStats> {
        let mut stats = CycleStats::default();
        let log_rows = conn
            .fetch(self.table.log_select_sql(), &[], Some(self.batch_size))
            .await?;
        stats.rows_read = log_rows.len();

        let mut locators: Vec<String> = Vec::with_capacity(log_rows.len());
        for row in &log_rows {
            let entry = self.table.parse_log_row(row.as_ref())?;
            debug!(
                sequence = entry.sequence,
                op = entry.op.code(),
                "processing change-log row for {}",
                self.table.catalog().qualified_name()
            );
            // Read rows are deleted regardless of delivery outcome.
            locators.push(entry.locator.clone());

            let event = match entry.op {
                ChangeOp::Delete => self.delete_event(entry),
                ChangeOp::Create | ChangeOp::Update => {
                    match self.resolve_image(conn, &entry).await {
                        Ok(event) => event,
                        Err(gap @ ReplicationError::LookupGap { .. }) => {
                            warn!("{gap}; while executing {}", self.table.row_lookup_sql());
                            stats.gaps_skipped += 1;
                            continue;
                        }
                        Err(other) => return Err(other),
                    }
                }
            };
            self.delivery.deliver(event).await?;
            stats.events_delivered += 1;
        }

        for locator in &locators {
            conn.execute(
                self.table.log_delete_sql(),
                &[BindValue::Text(locator.clone())],
            )
            .await?;
            stats.log_rows_deleted += 1;
        }

        Ok(stats)
    }

    /// Delete: the before-image is the key projection from the log row
    /// itself — the row no longer exists in the source table.
    fn delete_event(&self, entry: LogEntry) -> ChangeEvent {
        let catalog = self.table.catalog();
        let mut before = RowImage::with_capacity(entry.key_values.len());
        for (col, value) in catalog.key_columns().iter().zip(entry.key_values) {
            before.push(col.name(), value);
        }
        ChangeEvent {
            owner: catalog.owner.clone(),
            table: catalog.table.clone(),
            op: ChangeOp::Delete,
            before: Some(before),
            after: None,
            row_version: entry.row_version,
            ts_ms: entry.ts_ms,
            sequence: entry.sequence,
        }
    }

    /// Create/update: look up the current row image by primary key.
    ///
    /// Timestamp and row version come from the looked-up row, not the
    /// log row. A missing row is a `LookupGap`.
    async fn resolve_image(
        &self,
        conn: &mut dyn SourceConnection,
        entry: &LogEntry,
    ) -> Result<ChangeEvent> {
        let catalog = self.table.catalog();
        let mut binds = Vec::with_capacity(entry.key_values.len());
        for (col, value) in catalog.key_columns().iter().zip(entry.key_values.iter()) {
            binds.push(bind(col, value)?);
        }

        let rows = conn
            .fetch(self.table.row_lookup_sql(), &binds, Some(1))
            .await?;
        let row = rows.first().ok_or_else(|| ReplicationError::LookupGap {
            owner: catalog.owner.clone(),
            table: catalog.table.clone(),
            key: self.table.describe_key(&entry.key_values),
        })?;

        let column_count = catalog.columns().len();
        let mut after = RowImage::with_capacity(column_count);
        for (i, col) in catalog.columns().iter().enumerate() {
            after.push(col.name(), extract(row.as_ref(), i, col)?);
        }
        let row_version = row
            .get_i64(column_count)?
            .ok_or_else(|| ReplicationError::sql_msg("lookup row missing row version"))?;
        let ts_ms = row
            .get_i64(column_count + 1)?
            .ok_or_else(|| ReplicationError::sql_msg("lookup row missing capture timestamp"))?;

        Ok(ChangeEvent {
            owner: catalog.owner.clone(),
            table: catalog.table.clone(),
            op: entry.op,
            before: None,
            after: Some(after),
            row_version,
            ts_ms,
            sequence: entry.sequence,
        })
    }
}
