// ABOUTME: Column catalog - immutable description of a table's columns and primary key
// ABOUTME: Preserves catalog scan order, which drives generated SQL and positional binds

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{ReplicationError, Result};

/// Generic column type tag.
///
/// A closed set: everything a source column can be is mapped onto one of
/// these before any SQL is generated or any value is marshalled. Types
/// outside the set arrive as `Other` and are marshalled as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColType {
    /// 1-byte signed integer
    TinyInt,
    /// 2-byte signed integer
    SmallInt,
    /// 4-byte signed integer
    Integer,
    /// 8-byte signed integer
    BigInt,
    /// single-precision floating point
    Float,
    /// double-precision floating point
    Double,
    /// fixed-point decimal with declared precision/scale
    Decimal,
    /// calendar date without time of day
    Date,
    /// date and time without timezone
    Timestamp,
    /// legacy date-typed column promoted to a zero-fraction timestamp on extraction
    DateAsTimestamp,
    /// fixed-length character string
    Char,
    /// varying-length character string
    Varchar,
    /// fixed-length national character string
    NChar,
    /// varying-length national character string
    NVarchar,
    /// fixed-length binary
    Binary,
    /// varying-length binary
    Varbinary,
    /// large character object, drained from a backing stream
    Clob,
    /// large binary object, drained from a backing stream
    Blob,
    /// anything outside the supported set; marshalled as string
    Other,
}

impl ColType {
    /// Whether values of this type are materialized by draining a stream.
    pub fn is_large_object(self) -> bool {
        matches!(self, Self::Clob | Self::Blob)
    }

    /// Whether this type carries a declared decimal scale.
    pub fn is_decimal(self) -> bool {
        matches!(self, Self::Decimal)
    }
}

/// Raw column descriptor as returned by a metadata lookup.
///
/// One per column, in catalog scan order. This is the only input the
/// catalog accepts; how the descriptors were discovered (catalog query,
/// config file, test fixture) is not the catalog's concern.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub col_type: ColType,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnSpec {
    /// Shorthand for a non-key, nullable column with no size info.
    pub fn new(name: impl Into<String>, col_type: ColType) -> Self {
        Self {
            name: name.into(),
            col_type,
            length: None,
            precision: None,
            scale: None,
            nullable: true,
            primary_key: false,
        }
    }

    /// Mark this column as part of the primary key (keys are non-null).
    pub fn key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Set decimal precision and scale.
    pub fn with_scale(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// Set the declared length for string/binary types.
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }
}

/// Immutable description of one table column.
#[derive(Debug, Clone)]
pub struct Column {
    name: String,
    col_type: ColType,
    length: Option<u32>,
    precision: Option<u32>,
    scale: Option<u32>,
    nullable: bool,
    primary_key: bool,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn col_type(&self) -> ColType {
        self.col_type
    }

    pub fn length(&self) -> Option<u32> {
        self.length
    }

    pub fn precision(&self) -> Option<u32> {
        self.precision
    }

    /// Declared decimal scale; zero when none was declared.
    pub fn scale(&self) -> u32 {
        self.scale.unwrap_or(0)
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }
}

impl From<ColumnSpec> for Column {
    fn from(spec: ColumnSpec) -> Self {
        Self {
            name: spec.name,
            col_type: spec.col_type,
            length: spec.length,
            precision: spec.precision,
            scale: spec.scale,
            nullable: spec.nullable,
            primary_key: spec.primary_key,
        }
    }
}

/// An ordered set of columns with a name index.
///
/// Iteration order is the catalog scan order and is a stated contract:
/// it drives generated SQL text and positional binds, and must never be
/// re-sorted.
#[derive(Debug, Clone, Default)]
pub struct ColumnSet {
    columns: Vec<Column>,
    by_name: HashMap<String, usize>,
}

impl ColumnSet {
    pub fn new(columns: Vec<Column>) -> Self {
        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name().to_string(), i))
            .collect();
        Self { columns, by_name }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    pub fn by_name(&self, name: &str) -> Option<&Column> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name()).collect()
    }
}

/// Ordered column list plus primary-key subset for one source table.
///
/// Built once from metadata descriptors; read-only thereafter.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub owner: String,
    pub table: String,
    columns: ColumnSet,
    key_columns: ColumnSet,
}

impl Catalog {
    /// Build a catalog from raw descriptors in scan order.
    ///
    /// Fails with `CatalogError` when the descriptor list is empty (the
    /// lookup found nothing) and with `SchemaError` when no column is
    /// marked as part of the primary key — tables without a key cannot
    /// be replicated.
    pub fn from_specs(
        owner: impl Into<String>,
        table: impl Into<String>,
        specs: Vec<ColumnSpec>,
    ) -> Result<Self> {
        let owner = owner.into();
        let table = table.into();

        if specs.is_empty() {
            return Err(ReplicationError::Catalog {
                owner,
                table,
                reason: "metadata lookup returned no columns".into(),
            });
        }

        let columns: Vec<Column> = specs.into_iter().map(Column::from).collect();
        // Key subset keeps the scan order of the full list, not any
        // constraint ordinal: positional binds reuse it verbatim.
        let key_columns: Vec<Column> = columns
            .iter()
            .filter(|c| c.is_primary_key())
            .cloned()
            .collect();

        if key_columns.is_empty() {
            return Err(ReplicationError::Schema {
                table: format!("{owner}.{table}"),
                reason: "no primary key columns".into(),
            });
        }

        Ok(Self {
            owner,
            table,
            columns: ColumnSet::new(columns),
            key_columns: ColumnSet::new(key_columns),
        })
    }

    /// All columns, in scan order.
    pub fn columns(&self) -> &ColumnSet {
        &self.columns
    }

    /// Primary-key columns, in scan order (a subset of `columns`).
    pub fn key_columns(&self) -> &ColumnSet {
        &self.key_columns
    }

    /// Non-key columns, in scan order.
    pub fn non_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.is_primary_key())
    }

    /// `owner.table`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner, self.table)
    }
}

/// External metadata lookup.
///
/// Implementations query a database catalog (or anything else) and
/// return descriptors in a defined scan order. When a table declares no
/// primary-key constraint, implementations fall back to the smallest
/// unique index over non-null columns (fewest columns, first found).
#[async_trait]
pub trait MetadataProvider: Send {
    /// Ordered column descriptors for `owner.table`.
    async fn columns(&mut self, owner: &str, table: &str) -> Result<Vec<ColumnSpec>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_specs() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("ID", ColType::BigInt).key(),
            ColumnSpec::new("REGION", ColType::Varchar).key(),
            ColumnSpec::new("AMOUNT", ColType::Decimal).with_scale(12, 2),
            ColumnSpec::new("NOTE", ColType::Clob),
        ]
    }

    #[test]
    fn test_catalog_preserves_scan_order() {
        let cat = Catalog::from_specs("public", "orders", order_specs()).unwrap();
        assert_eq!(cat.columns().names(), vec!["ID", "REGION", "AMOUNT", "NOTE"]);
        assert_eq!(cat.key_columns().names(), vec!["ID", "REGION"]);
        assert_eq!(
            cat.non_key_columns().map(|c| c.name()).collect::<Vec<_>>(),
            vec!["AMOUNT", "NOTE"]
        );
    }

    #[test]
    fn test_empty_lookup_is_catalog_error() {
        let err = Catalog::from_specs("public", "orders", vec![]).unwrap_err();
        assert!(matches!(err, ReplicationError::Catalog { .. }));
    }

    #[test]
    fn test_missing_key_is_schema_error() {
        let specs = vec![
            ColumnSpec::new("A", ColType::Integer),
            ColumnSpec::new("B", ColType::Varchar),
        ];
        let err = Catalog::from_specs("public", "orders", specs).unwrap_err();
        assert!(matches!(err, ReplicationError::Schema { .. }));
    }

    #[test]
    fn test_name_index_matches_positions() {
        let cat = Catalog::from_specs("public", "orders", order_specs()).unwrap();
        let amount = cat.columns().by_name("AMOUNT").unwrap();
        assert_eq!(amount.col_type(), ColType::Decimal);
        assert_eq!(amount.scale(), 2);
        assert!(cat.key_columns().by_name("AMOUNT").is_none());
    }
}
