// ABOUTME: Sink-side SQL generation - create-table DDL and insert/update/delete DML
// ABOUTME: Per-dialect type map and placeholder style for PostgreSQL and MySQL destinations

use serde::Deserialize;

use crate::catalog::{ColType, Column};

/// Destination SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    MySql,
}

impl Dialect {
    pub fn quote(self, ident: &str) -> String {
        match self {
            Self::Postgres => format!("\"{ident}\""),
            Self::MySql => format!("`{ident}`"),
        }
    }

    /// Positional placeholder for the 1-based parameter `n`.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${n}"),
            Self::MySql => "?".to_string(),
        }
    }

    /// Native type name for a column's generic type tag.
    pub fn type_name(self, col: &Column) -> String {
        let len = |default: u32| col.length().unwrap_or(default);
        let decimal = |kw: &str| match (col.precision(), col.scale()) {
            (Some(p), s) => format!("{kw}({p},{s})"),
            (None, _) => kw.to_string(),
        };
        match self {
            Self::Postgres => match col.col_type() {
                ColType::TinyInt | ColType::SmallInt => "smallint".into(),
                ColType::Integer => "integer".into(),
                ColType::BigInt => "bigint".into(),
                ColType::Float => "real".into(),
                ColType::Double => "double precision".into(),
                ColType::Decimal => decimal("numeric"),
                ColType::Date => "date".into(),
                ColType::Timestamp | ColType::DateAsTimestamp => "timestamp".into(),
                ColType::Char | ColType::NChar => format!("char({})", len(1)),
                ColType::Varchar | ColType::NVarchar => format!("varchar({})", len(4000)),
                ColType::Binary | ColType::Varbinary | ColType::Blob => "bytea".into(),
                ColType::Clob | ColType::Other => "text".into(),
            },
            Self::MySql => match col.col_type() {
                ColType::TinyInt => "tinyint".into(),
                ColType::SmallInt => "smallint".into(),
                ColType::Integer => "int".into(),
                ColType::BigInt => "bigint".into(),
                ColType::Float => "float".into(),
                ColType::Double => "double".into(),
                ColType::Decimal => decimal("decimal"),
                ColType::Date => "date".into(),
                ColType::Timestamp | ColType::DateAsTimestamp => "datetime(6)".into(),
                ColType::Char => format!("char({})", len(1)),
                ColType::Varchar => format!("varchar({})", len(4000)),
                ColType::NChar => format!("nchar({})", len(1)),
                ColType::NVarchar => format!("nvarchar({})", len(2000)),
                ColType::Binary => format!("binary({})", len(1)),
                ColType::Varbinary => format!("varbinary({})", len(8000)),
                ColType::Clob => "longtext".into(),
                ColType::Blob => "longblob".into(),
                ColType::Other => "text".into(),
            },
        }
    }
}

/// Create-table statement with a primary-key constraint.
///
/// Key columns first (always `not null`), then non-key columns in
/// declared order, then `constraint <table>_pk primary key(...)`.
pub fn create_table(dialect: Dialect, table: &str, key: &[Column], non_key: &[Column]) -> String {
    let mut body: Vec<String> = Vec::with_capacity(key.len() + non_key.len() + 1);
    for col in key {
        body.push(format!(
            "  {} {} not null",
            dialect.quote(col.name()),
            dialect.type_name(col)
        ));
    }
    for col in non_key {
        let null_clause = if col.nullable() { "" } else { " not null" };
        body.push(format!(
            "  {} {}{null_clause}",
            dialect.quote(col.name()),
            dialect.type_name(col)
        ));
    }
    let key_list = key
        .iter()
        .map(|c| dialect.quote(c.name()))
        .collect::<Vec<_>>()
        .join(", ");
    body.push(format!(
        "  constraint {} primary key({key_list})",
        dialect.quote(&format!("{table}_pk"))
    ));
    format!(
        "create table {}(\n{}\n)",
        dialect.quote(table),
        body.join(",\n")
    )
}

/// Insert statement: key columns then non-key columns, positional
/// placeholders in that fixed order.
pub fn insert(dialect: Dialect, table: &str, key: &[Column], non_key: &[Column]) -> String {
    let columns = key
        .iter()
        .chain(non_key.iter())
        .map(|c| dialect.quote(c.name()))
        .collect::<Vec<_>>()
        .join(", ");
    let values = (1..=key.len() + non_key.len())
        .map(|n| dialect.placeholder(n))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "insert into {}({columns}) values({values})",
        dialect.quote(table)
    )
}

/// Update statement: set non-key columns, where-clause of key equality.
pub fn update(dialect: Dialect, table: &str, key: &[Column], non_key: &[Column]) -> String {
    let set = non_key
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", dialect.quote(c.name()), dialect.placeholder(i + 1)))
        .collect::<Vec<_>>()
        .join(", ");
    let filter = key_filter(dialect, key, non_key.len());
    format!("update {} set {set} where {filter}", dialect.quote(table))
}

/// Delete statement: where-clause of key equality.
pub fn delete(dialect: Dialect, table: &str, key: &[Column]) -> String {
    let filter = key_filter(dialect, key, 0);
    format!("delete from {} where {filter}", dialect.quote(table))
}

fn key_filter(dialect: Dialect, key: &[Column], offset: usize) -> String {
    key.iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{} = {}",
                dialect.quote(c.name()),
                dialect.placeholder(offset + i + 1)
            )
        })
        .collect::<Vec<_>>()
        .join(" and ")
}
