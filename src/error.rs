// ABOUTME: Error taxonomy for the capture-and-apply engine
// ABOUTME: Distinguishes fatal construction errors from per-row degradable conditions

use thiserror::Error;

/// Result type for replication core operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors raised by the replication core.
///
/// Construction-time variants (`Catalog`, `Schema`) prevent a partially
/// built table object from ever being used. `LookupGap` and `Io` degrade
/// gracefully inside a poll cycle; `SqlExecution` aborts the cycle and
/// leaves read-but-undeleted log rows for the next one; `Provisioning`
/// makes every subsequent apply fail fast until corrected externally.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Column metadata lookup returned nothing or failed outright.
    #[error("catalog lookup failed for {owner}.{table}: {reason}")]
    Catalog {
        owner: String,
        table: String,
        reason: String,
    },

    /// A table definition that cannot be replicated (no columns, no key).
    #[error("unusable schema for {table}: {reason}")]
    Schema { table: String, reason: String },

    /// A change-log row whose current image vanished before the lookup.
    ///
    /// Transient read-after-write gap: the row was modified and then
    /// modified again (or removed) before this cycle resolved it. Logged
    /// and skipped, never fatal.
    #[error("key {key} not found in {owner}.{table}")]
    LookupGap {
        owner: String,
        table: String,
        key: String,
    },

    /// Any other statement preparation or execution failure.
    #[error("sql execution failed: {context}")]
    SqlExecution {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A large-object stream could not be drained.
    #[error("large object drain failed for column {column}")]
    Io {
        column: String,
        #[source]
        source: std::io::Error,
    },

    /// The sink table is absent and cannot (or may not) be created.
    #[error("sink table {table} is not provisioned: {reason}")]
    Provisioning { table: String, reason: String },

    /// A push-mode publish was rejected downstream.
    ///
    /// The core does not retry; the cycle aborts before its log
    /// deletions are flushed, so the rows are re-read next cycle.
    #[error("event delivery failed for key {key}")]
    Delivery {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ReplicationError {
    /// Build a `SqlExecution` error from a driver error with context.
    pub fn sql<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::SqlExecution {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build a `SqlExecution` error with no underlying driver error.
    pub fn sql_msg(context: impl Into<String>) -> Self {
        Self::SqlExecution {
            context: context.into(),
            source: None,
        }
    }

    /// Whether the error is a per-row condition the cycle survives.
    pub fn is_row_local(&self) -> bool {
        matches!(self, Self::LookupGap { .. } | Self::Io { .. })
    }
}
