// ABOUTME: The two wire shapes events are rendered into before leaving the core
// ABOUTME: Variant A is a self-describing JSON envelope; Variant B a structured key/value record

use serde_json::{json, Value as JsonValue};

use crate::capture::event::{ChangeEvent, ChangeOp, RowImage};
use crate::catalog::{Catalog, ColType, Column};

/// Wire type name used in the self-describing schema block.
fn wire_type(t: ColType) -> &'static str {
    match t {
        ColType::TinyInt => "int8",
        ColType::SmallInt => "int16",
        ColType::Integer => "int32",
        ColType::BigInt => "int64",
        ColType::Float => "float",
        ColType::Double => "double",
        ColType::Decimal => "decimal",
        // Temporal values travel as epoch milliseconds.
        ColType::Date | ColType::Timestamp | ColType::DateAsTimestamp => "int64",
        ColType::Char | ColType::Varchar | ColType::NChar | ColType::NVarchar | ColType::Clob => {
            "string"
        }
        ColType::Binary | ColType::Varbinary | ColType::Blob => "bytes",
        ColType::Other => "string",
    }
}

fn field(col: &Column) -> JsonValue {
    json!({
        "field": col.name(),
        "type": wire_type(col.col_type()),
        "optional": col.nullable(),
    })
}

/// Self-describing envelope schema for one table, built once.
pub fn envelope_schema(catalog: &Catalog) -> JsonValue {
    let before: Vec<JsonValue> = catalog.key_columns().iter().map(field).collect();
    let after: Vec<JsonValue> = catalog.columns().iter().map(field).collect();
    json!({
        "type": "struct",
        "name": format!("{}.Envelope", catalog.qualified_name()),
        "fields": [
            {"field": "before", "type": "struct", "optional": true, "fields": before},
            {"field": "after", "type": "struct", "optional": true, "fields": after},
            {"field": "source", "type": "struct", "optional": false, "fields": [
                {"field": "owner", "type": "string", "optional": false},
                {"field": "table", "type": "string", "optional": false},
                {"field": "ts_ms", "type": "int64", "optional": false},
                {"field": "scn", "type": "int64", "optional": false},
            ]},
            {"field": "op", "type": "string", "optional": false},
            {"field": "ts_ms", "type": "int64", "optional": false},
        ],
    })
}

/// Render a change event into the Variant A envelope.
///
/// `schema` is the table's prebuilt `envelope_schema`; `emitted_ms` is
/// the envelope-level timestamp stamped at render time.
pub fn envelope(schema: &JsonValue, event: &ChangeEvent, emitted_ms: i64) -> JsonValue {
    json!({
        "schema": schema,
        "payload": {
            "before": event.before.as_ref().map(RowImage::to_json),
            "after": event.after.as_ref().map(RowImage::to_json),
            "source": {
                "owner": event.owner,
                "table": event.table,
                "ts_ms": event.ts_ms,
                "scn": event.row_version,
            },
            "op": event.op.code(),
            "ts_ms": emitted_ms,
        },
    })
}

/// Variant B: structured key/value record for a polling framework.
///
/// The key is the primary-key projection; the value is the full row for
/// create/update and absent for delete.
#[derive(Debug, Clone)]
pub struct StructuredRecord {
    pub owner: String,
    pub table: String,
    pub sequence: i64,
    pub op: ChangeOp,
    pub key: RowImage,
    pub value: Option<RowImage>,
}

impl StructuredRecord {
    /// Project a change event into key/value form using the table catalog.
    pub fn from_event(catalog: &Catalog, event: ChangeEvent) -> Self {
        let key = match event.op {
            ChangeOp::Delete => event.before.clone().unwrap_or_default(),
            ChangeOp::Create | ChangeOp::Update => {
                let mut key = RowImage::with_capacity(catalog.key_columns().len());
                if let Some(after) = event.after.as_ref() {
                    for col in catalog.key_columns().iter() {
                        if let Some(v) = after.get(col.name()) {
                            key.push(col.name(), v.clone());
                        }
                    }
                }
                key
            }
        };
        let value = match event.op {
            ChangeOp::Delete => None,
            ChangeOp::Create | ChangeOp::Update => event.after,
        };
        Self {
            owner: event.owner,
            table: event.table,
            sequence: event.sequence,
            op: event.op,
            key,
            value,
        }
    }
}
