// ABOUTME: MySQL sink adapter - implements the sink connection trait on top of mysql_async
// ABOUTME: Decimals travel as strings so the declared scale is preserved verbatim

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, Params};

use crate::conn::SinkConnection;
use crate::error::{ReplicationError, Result};
use crate::value::BindValue;

pub async fn connect(url: &str) -> Result<Conn> {
    let opts =
        Opts::from_url(url).map_err(|e| ReplicationError::sql("parsing mysql url", e))?;
    Conn::new(opts)
        .await
        .map_err(|e| ReplicationError::sql("connecting to mysql", e))
}

/// Convert a bind value into a mysql wire value.
///
/// MySQL placeholders are untyped, so nulls need no type tag here.
fn to_mysql_value(value: &BindValue) -> mysql_async::Value {
    match value {
        BindValue::Null(_) => mysql_async::Value::NULL,
        BindValue::TinyInt(v) => mysql_async::Value::from(*v),
        BindValue::SmallInt(v) => mysql_async::Value::from(*v),
        BindValue::Int(v) => mysql_async::Value::from(*v),
        BindValue::BigInt(v) => mysql_async::Value::from(*v),
        BindValue::Float(v) => mysql_async::Value::from(*v),
        BindValue::Double(v) => mysql_async::Value::from(*v),
        // DECIMAL binds as its string rendering, scale intact.
        BindValue::Decimal(d) => mysql_async::Value::from(d.to_string()),
        BindValue::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        BindValue::Timestamp(ts) => {
            let (date, time) = (ts.date(), ts.time());
            mysql_async::Value::Date(
                date.year() as u16,
                date.month() as u8,
                date.day() as u8,
                time.hour() as u8,
                time.minute() as u8,
                time.second() as u8,
                time.nanosecond() / 1000,
            )
        }
        BindValue::Text(s) => mysql_async::Value::from(s.clone()),
        BindValue::Bytes(b) => mysql_async::Value::from(b.clone()),
    }
}

/// Sink-side MySQL connection.
///
/// mysql_async keeps a per-connection statement cache keyed by text, so
/// the applier's cached DML texts are prepared once and reused.
pub struct MySqlSinkConnection {
    conn: Conn,
}

impl MySqlSinkConnection {
    pub fn new(conn: Conn) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SinkConnection for MySqlSinkConnection {
    async fn execute(&mut self, sql: &str, params: &[BindValue]) -> Result<u64> {
        let values: Vec<mysql_async::Value> = params.iter().map(to_mysql_value).collect();
        self.conn
            .exec_drop(sql, Params::Positional(values))
            .await
            .map_err(|e| ReplicationError::sql(format!("executing statement: {sql}"), e))?;
        Ok(self.conn.affected_rows())
    }

    async fn execute_ddl(&mut self, sql: &str) -> Result<()> {
        self.conn
            .query_drop(sql)
            .await
            .map_err(|e| ReplicationError::sql(format!("executing ddl: {sql}"), e))
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let count: Option<u64> = self
            .conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.tables
                 WHERE table_schema = database() AND table_name = ?",
                (table,),
            )
            .await
            .map_err(|e| ReplicationError::sql(format!("probing for table {table}"), e))?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn close_statements(&mut self) -> Result<()> {
        // reset() reports whether COM_RESET_CONNECTION was available;
        // either way the statement cache is gone.
        self.conn
            .reset()
            .await
            .map(|_| ())
            .map_err(|e| ReplicationError::sql("resetting mysql session", e))
    }
}
