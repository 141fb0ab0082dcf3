// ABOUTME: PostgreSQL adapter - source connection, sink connection and metadata provider
// ABOUTME: Implements the engine's connection traits on top of tokio-postgres

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use futures::{pin_mut, TryStreamExt};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row, Statement};
use tracing::error;

use crate::catalog::{ColType, ColumnSpec, MetadataProvider};
use crate::conn::{SinkConnection, SourceConnection, SourceRow};
use crate::error::{ReplicationError, Result};
use crate::value::BindValue;

/// Connect and spawn the connection driver task.
pub async fn connect(url: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .map_err(|e| ReplicationError::sql("connecting to postgres", e))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("postgres connection error: {e}");
        }
    });
    Ok(client)
}

/// Convert bind values into boxed postgres parameters.
///
/// Nulls are typed via the column tag so the server can infer a
/// parameter type even for an all-null bind.
fn to_sql_params(params: &[BindValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|p| -> Box<dyn ToSql + Sync + Send> {
            match p {
                BindValue::Null(t) => match t {
                    ColType::TinyInt | ColType::SmallInt => Box::new(None::<i16>),
                    ColType::Integer => Box::new(None::<i32>),
                    ColType::BigInt => Box::new(None::<i64>),
                    ColType::Float => Box::new(None::<f32>),
                    ColType::Double => Box::new(None::<f64>),
                    ColType::Decimal => Box::new(None::<Decimal>),
                    ColType::Date => Box::new(None::<NaiveDate>),
                    ColType::Timestamp | ColType::DateAsTimestamp => {
                        Box::new(None::<NaiveDateTime>)
                    }
                    ColType::Binary | ColType::Varbinary | ColType::Blob => {
                        Box::new(None::<Vec<u8>>)
                    }
                    _ => Box::new(None::<String>),
                },
                // Postgres has no 1-byte integer; widen to smallint.
                BindValue::TinyInt(v) => Box::new(*v as i16),
                BindValue::SmallInt(v) => Box::new(*v),
                BindValue::Int(v) => Box::new(*v),
                BindValue::BigInt(v) => Box::new(*v),
                BindValue::Float(v) => Box::new(*v),
                BindValue::Double(v) => Box::new(*v),
                BindValue::Decimal(d) => Box::new(*d),
                BindValue::Date(d) => Box::new(*d),
                BindValue::Timestamp(ts) => Box::new(*ts),
                BindValue::Text(s) => Box::new(s.clone()),
                BindValue::Bytes(b) => Box::new(b.clone()),
            }
        })
        .collect()
}

/// One materialized postgres row behind the `SourceRow` seam.
///
/// bytea and text values arrive fully materialized from the driver, so
/// the LOB readers are cursors over the already-fetched buffer.
pub struct PgRow {
    row: Row,
}

impl PgRow {
    fn get<'a, T>(&'a self, idx: usize) -> Result<Option<T>>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        self.row
            .try_get::<_, Option<T>>(idx)
            .map_err(|e| ReplicationError::sql(format!("reading column {idx}"), e))
    }
}

impl SourceRow for PgRow {
    fn get_i8(&self, idx: usize) -> Result<Option<i8>> {
        match self.get::<i16>(idx)? {
            None => Ok(None),
            Some(v) => i8::try_from(v).map(Some).map_err(|_| {
                ReplicationError::sql_msg(format!("column {idx} value {v} overflows tinyint"))
            }),
        }
    }

    fn get_i16(&self, idx: usize) -> Result<Option<i16>> {
        self.get(idx)
    }

    fn get_i32(&self, idx: usize) -> Result<Option<i32>> {
        self.get(idx)
    }

    fn get_i64(&self, idx: usize) -> Result<Option<i64>> {
        self.get(idx)
    }

    fn get_f32(&self, idx: usize) -> Result<Option<f32>> {
        self.get(idx)
    }

    fn get_f64(&self, idx: usize) -> Result<Option<f64>> {
        self.get(idx)
    }

    fn get_decimal(&self, idx: usize) -> Result<Option<Decimal>> {
        self.get(idx)
    }

    fn get_date(&self, idx: usize) -> Result<Option<NaiveDate>> {
        self.get(idx)
    }

    fn get_timestamp(&self, idx: usize) -> Result<Option<NaiveDateTime>> {
        self.get(idx)
    }

    fn get_string(&self, idx: usize) -> Result<Option<String>> {
        self.get(idx)
    }

    fn get_bytes(&self, idx: usize) -> Result<Option<Vec<u8>>> {
        self.get(idx)
    }

    fn binary_stream(&self, idx: usize) -> Result<Option<Box<dyn Read + '_>>> {
        Ok(self
            .get::<Vec<u8>>(idx)?
            .map(|b| Box::new(Cursor::new(b)) as Box<dyn Read>))
    }

    fn character_stream(&self, idx: usize) -> Result<Option<Box<dyn Read + '_>>> {
        Ok(self
            .get::<String>(idx)?
            .map(|s| Box::new(Cursor::new(s.into_bytes())) as Box<dyn Read>))
    }
}

/// Source-side postgres connection.
///
/// Transaction scope is driven with plain `begin`/`commit` statements;
/// everything a poll cycle reads and deletes happens on this one
/// session.
pub struct PgSourceConnection {
    client: Client,
}

impl PgSourceConnection {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceConnection for PgSourceConnection {
    async fn begin(&mut self) -> Result<()> {
        self.client
            .batch_execute("begin")
            .await
            .map_err(|e| ReplicationError::sql("opening source transaction", e))
    }

    async fn fetch(
        &mut self,
        sql: &str,
        params: &[BindValue],
        max_rows: Option<usize>,
    ) -> Result<Vec<Box<dyn SourceRow>>> {
        let boxed = to_sql_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
        let stream = self
            .client
            .query_raw(sql, refs)
            .await
            .map_err(|e| ReplicationError::sql(format!("executing query: {sql}"), e))?;
        pin_mut!(stream);

        // The ceiling is physical: rows past it are never pulled off the wire.
        let mut rows: Vec<Box<dyn SourceRow>> = Vec::new();
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| ReplicationError::sql("reading query results", e))?
        {
            rows.push(Box::new(PgRow { row }));
            if max_rows.is_some_and(|cap| rows.len() >= cap) {
                break;
            }
        }
        Ok(rows)
    }

    async fn execute(&mut self, sql: &str, params: &[BindValue]) -> Result<u64> {
        let boxed = to_sql_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(sql, &refs)
            .await
            .map_err(|e| ReplicationError::sql(format!("executing statement: {sql}"), e))
    }

    async fn commit(&mut self) -> Result<()> {
        self.client
            .batch_execute("commit")
            .await
            .map_err(|e| ReplicationError::sql("committing source transaction", e))
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client
            .batch_execute("rollback")
            .await
            .map_err(|e| ReplicationError::sql("rolling back source transaction", e))
    }
}

/// Sink-side postgres connection with a prepared-statement cache.
///
/// Each distinct DML text is prepared once and reused; the applier's
/// cached texts make the cache effective for the life of the table.
pub struct PgSinkConnection {
    client: Client,
    statements: HashMap<String, Statement>,
}

impl PgSinkConnection {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            statements: HashMap::new(),
        }
    }

    async fn prepared(&mut self, sql: &str) -> Result<Statement> {
        if let Some(stmt) = self.statements.get(sql) {
            return Ok(stmt.clone());
        }
        let stmt = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| ReplicationError::sql(format!("preparing statement: {sql}"), e))?;
        self.statements.insert(sql.to_string(), stmt.clone());
        Ok(stmt)
    }
}

#[async_trait]
impl SinkConnection for PgSinkConnection {
    async fn execute(&mut self, sql: &str, params: &[BindValue]) -> Result<u64> {
        let stmt = self.prepared(sql).await?;
        let boxed = to_sql_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(&stmt, &refs)
            .await
            .map_err(|e| ReplicationError::sql(format!("executing statement: {sql}"), e))
    }

    async fn execute_ddl(&mut self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| ReplicationError::sql(format!("executing ddl: {sql}"), e))
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = current_schema() AND table_name = $1
                 )",
                &[&table],
            )
            .await
            .map_err(|e| ReplicationError::sql(format!("probing for table {table}"), e))?;
        Ok(row.get(0))
    }

    async fn close_statements(&mut self) -> Result<()> {
        // Dropping a Statement deallocates it server-side.
        self.statements.clear();
        Ok(())
    }
}

/// Column metadata from the postgres catalog.
pub struct PgMetadataProvider {
    client: Client,
}

impl PgMetadataProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Give the connection back once table discovery is done.
    pub fn into_client(self) -> Client {
        self.client
    }

    /// Primary-key column names, in index order.
    async fn primary_key(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&schema, &table],
            )
            .await
            .map_err(|e| {
                ReplicationError::sql(format!("reading primary key of {schema}.{table}"), e)
            })?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Fallback key when no primary-key constraint exists: the smallest
    /// unique index whose columns are all non-null. Ties break on the
    /// first index found.
    async fn unique_index_key(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT i.indexrelid::text, a.attname, a.attnotnull
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisunique
                   AND NOT i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2
                 ORDER BY i.indexrelid, array_position(i.indkey, a.attnum)",
                &[&schema, &table],
            )
            .await
            .map_err(|e| {
                ReplicationError::sql(format!("reading unique indexes of {schema}.{table}"), e)
            })?;

        let mut indexes: Vec<(String, Vec<String>, bool)> = Vec::new();
        for row in &rows {
            let index: String = row.get(0);
            let column: String = row.get(1);
            let not_null: bool = row.get(2);
            match indexes.last_mut() {
                Some((id, cols, all_not_null)) if *id == index => {
                    cols.push(column);
                    *all_not_null &= not_null;
                }
                _ => indexes.push((index, vec![column], not_null)),
            }
        }
        Ok(indexes
            .into_iter()
            .filter(|(_, _, all_not_null)| *all_not_null)
            .min_by_key(|(_, cols, _)| cols.len())
            .map(|(_, cols, _)| cols)
            .unwrap_or_default())
    }
}

/// Map a postgres catalog type name onto the generic type tag.
fn col_type_for(data_type: &str) -> ColType {
    match data_type {
        "smallint" => ColType::SmallInt,
        "integer" => ColType::Integer,
        "bigint" => ColType::BigInt,
        "real" => ColType::Float,
        "double precision" => ColType::Double,
        "numeric" | "decimal" => ColType::Decimal,
        "date" => ColType::Date,
        "timestamp without time zone" | "timestamp with time zone" => ColType::Timestamp,
        "character" => ColType::Char,
        "character varying" => ColType::Varchar,
        "text" => ColType::Clob,
        "bytea" => ColType::Blob,
        _ => ColType::Other,
    }
}

#[async_trait]
impl MetadataProvider for PgMetadataProvider {
    async fn columns(&mut self, owner: &str, table: &str) -> Result<Vec<ColumnSpec>> {
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type, character_maximum_length,
                        numeric_precision, numeric_scale, is_nullable
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&owner, &table],
            )
            .await
            .map_err(|e| ReplicationError::Catalog {
                owner: owner.to_string(),
                table: table.to_string(),
                reason: e.to_string(),
            })?;

        let mut key = self.primary_key(owner, table).await?;
        if key.is_empty() {
            key = self.unique_index_key(owner, table).await?;
        }

        let mut specs = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.get(0);
            let data_type: String = row.get(1);
            let length: Option<i32> = row.get(2);
            let precision: Option<i32> = row.get(3);
            let scale: Option<i32> = row.get(4);
            let nullable = row.get::<_, String>(5) == "YES";
            let primary_key = key.contains(&name);
            specs.push(ColumnSpec {
                col_type: col_type_for(&data_type),
                length: length.map(|v| v as u32),
                precision: precision.map(|v| v as u32),
                scale: scale.map(|v| v as u32),
                nullable: nullable && !primary_key,
                primary_key,
                name,
            });
        }
        Ok(specs)
    }
}
