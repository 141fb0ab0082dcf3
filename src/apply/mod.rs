// ABOUTME: Sink-side applier - provisions the target table and replays change events onto it
// ABOUTME: Update falls back to insert on zero rows; delete tolerates an absent row

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capture::event::{ChangeEvent, ChangeOp, RowImage};
use crate::catalog::{Catalog, Column};
use crate::conn::SinkConnection;
use crate::envelope::StructuredRecord;
use crate::error::{ReplicationError, Result};
use crate::sql::sink as sink_sql;
use crate::sql::Dialect;
use crate::value::{bind, BindValue, Value};

/// One sink table with its cached DML texts.
///
/// Texts are generated from the catalog once at construction, for the
/// configured dialect, and reused for every applied event.
pub struct SinkTable {
    name: String,
    key_columns: Vec<Column>,
    non_key_columns: Vec<Column>,
    create_sql: String,
    insert_sql: String,
    update_sql: String,
    delete_sql: String,
    /// Set once provisioning has confirmed the table exists.
    ready: bool,
}

impl SinkTable {
    pub fn new(catalog: &Catalog, dialect: Dialect) -> Self {
        let key_columns: Vec<Column> = catalog.key_columns().iter().cloned().collect();
        let non_key_columns: Vec<Column> = catalog.non_key_columns().cloned().collect();
        let table = catalog.table.as_str();
        Self {
            name: table.to_string(),
            create_sql: sink_sql::create_table(dialect, table, &key_columns, &non_key_columns),
            insert_sql: sink_sql::insert(dialect, table, &key_columns, &non_key_columns),
            update_sql: sink_sql::update(dialect, table, &key_columns, &non_key_columns),
            delete_sql: sink_sql::delete(dialect, table, &key_columns),
            key_columns,
            non_key_columns,
            ready: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_sql(&self) -> &str {
        &self.create_sql
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Confirm the table exists, creating it when permitted.
    ///
    /// With `auto_create` off a missing table is a provisioning error;
    /// the table stays not-ready and every later apply fails fast with
    /// the same error until the operator intervenes.
    pub async fn ensure_ready(
        &mut self,
        conn: &mut dyn SinkConnection,
        auto_create: bool,
    ) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        if conn.table_exists(&self.name).await? {
            self.ready = true;
            return Ok(());
        }
        if !auto_create {
            return Err(ReplicationError::Provisioning {
                table: self.name.clone(),
                reason: "table does not exist and auto-create is disabled".into(),
            });
        }
        info!("creating sink table {}", self.name);
        debug!("{}", self.create_sql);
        conn.execute_ddl(&self.create_sql).await?;
        self.ready = true;
        Ok(())
    }

    /// Apply one change event to the sink.
    pub async fn apply(&mut self, conn: &mut dyn SinkConnection, event: &ChangeEvent) -> Result<()> {
        let image = event.image().ok_or_else(|| {
            ReplicationError::sql_msg(format!(
                "event {} carries no row image",
                event.message_key()
            ))
        })?;
        self.apply_change(conn, event.op, image).await
    }

    /// Apply one change by operation and image.
    ///
    /// Create inserts; update updates and falls back to insert when no
    /// row matched; delete is a no-op when the row is already gone. The
    /// image is the full row for create/update and the key projection
    /// for delete.
    pub async fn apply_change(
        &mut self,
        conn: &mut dyn SinkConnection,
        op: ChangeOp,
        image: &RowImage,
    ) -> Result<()> {
        if !self.ready {
            return Err(ReplicationError::Provisioning {
                table: self.name.clone(),
                reason: "apply attempted before provisioning".into(),
            });
        }
        match op {
            ChangeOp::Create => {
                let binds = self.full_row_binds(image)?;
                conn.execute(&self.insert_sql, &binds).await?;
            }
            ChangeOp::Update => {
                let binds = self.update_binds(image)?;
                let updated = conn.execute(&self.update_sql, &binds).await?;
                if updated == 0 {
                    warn!(
                        "update matched no rows in {}, falling back to insert",
                        self.name
                    );
                    let binds = self.full_row_binds(image)?;
                    conn.execute(&self.insert_sql, &binds).await?;
                }
            }
            ChangeOp::Delete => {
                let binds = self.key_binds(image)?;
                let deleted = conn.execute(&self.delete_sql, &binds).await?;
                if deleted == 0 {
                    debug!("delete matched no rows in {}", self.name);
                }
            }
        }
        Ok(())
    }

    /// Release any statement handles the connection caches for this table.
    pub async fn close(&mut self, conn: &mut dyn SinkConnection) -> Result<()> {
        conn.close_statements().await
    }

    /// Insert bind order: key columns then non-key columns.
    fn full_row_binds(&self, image: &RowImage) -> Result<Vec<BindValue>> {
        let mut binds = Vec::with_capacity(self.key_columns.len() + self.non_key_columns.len());
        for col in self.key_columns.iter().chain(self.non_key_columns.iter()) {
            binds.push(self.bind_column(col, image)?);
        }
        Ok(binds)
    }

    /// Update bind order: non-key columns for the set list, then key
    /// columns for the predicate.
    fn update_binds(&self, image: &RowImage) -> Result<Vec<BindValue>> {
        let mut binds = Vec::with_capacity(self.non_key_columns.len() + self.key_columns.len());
        for col in self.non_key_columns.iter().chain(self.key_columns.iter()) {
            binds.push(self.bind_column(col, image)?);
        }
        Ok(binds)
    }

    fn key_binds(&self, image: &RowImage) -> Result<Vec<BindValue>> {
        self.key_columns
            .iter()
            .map(|col| self.bind_column(col, image))
            .collect()
    }

    fn bind_column(&self, col: &Column, image: &RowImage) -> Result<BindValue> {
        let value = image.get(col.name()).unwrap_or(&Value::Null);
        bind(col, value)
    }
}

/// Statistics from one applied batch.
#[derive(Debug, Clone, Default)]
pub struct ApplyStats {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl ApplyStats {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    fn count(&mut self, op: ChangeOp) {
        match op {
            ChangeOp::Create => self.creates += 1,
            ChangeOp::Update => self.updates += 1,
            ChangeOp::Delete => self.deletes += 1,
        }
    }
}

/// Replay one table's events onto the sink in order.
pub struct Applier {
    table: SinkTable,
    auto_create: bool,
}

impl Applier {
    pub fn new(table: SinkTable, auto_create: bool) -> Self {
        Self { table, auto_create }
    }

    pub fn table(&self) -> &SinkTable {
        &self.table
    }

    /// Apply a batch of events in the order given.
    pub async fn apply_batch(
        &mut self,
        conn: &mut dyn SinkConnection,
        events: &[ChangeEvent],
    ) -> Result<ApplyStats> {
        let mut stats = ApplyStats::default();
        if events.is_empty() {
            return Ok(stats);
        }
        self.table.ensure_ready(conn, self.auto_create).await?;
        for event in events {
            self.table.apply(conn, event).await?;
            stats.count(event.op);
        }
        Ok(stats)
    }

    /// Apply a batch of pull-mode records in the order given.
    ///
    /// The record's value image drives create/update; its key image
    /// drives delete.
    pub async fn apply_records(
        &mut self,
        conn: &mut dyn SinkConnection,
        records: &[StructuredRecord],
    ) -> Result<ApplyStats> {
        let mut stats = ApplyStats::default();
        if records.is_empty() {
            return Ok(stats);
        }
        self.table.ensure_ready(conn, self.auto_create).await?;
        for record in records {
            let image = match record.op {
                ChangeOp::Delete => &record.key,
                ChangeOp::Create | ChangeOp::Update => record.value.as_ref().ok_or_else(|| {
                    ReplicationError::sql_msg(format!(
                        "record {}.{}-{} carries no row image",
                        record.owner, record.table, record.sequence
                    ))
                })?,
            };
            self.table.apply_change(conn, record.op, image).await?;
            stats.count(record.op);
        }
        Ok(stats)
    }

    pub async fn close(&mut self, conn: &mut dyn SinkConnection) -> Result<()> {
        self.table.close(conn).await
    }
}

/// Build an applier from a source table description.
pub fn applier_for(
    table: &Arc<crate::capture::SourceTable>,
    dialect: Dialect,
    auto_create: bool,
) -> Applier {
    Applier::new(SinkTable::new(table.catalog(), dialect), auto_create)
}
