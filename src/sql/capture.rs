// ABOUTME: Source-side SQL generation - change-log read, current row lookup, log-row delete
// ABOUTME: The ORDER BY on the log-select is the poller's only ordering guarantee

use crate::catalog::Catalog;
use crate::sql::quote_pg;

/// Sequence-number column maintained in the change log.
pub const SEQ_COLUMN: &str = "cdc_seq";
/// Raw operation marker column in the change log ('I', 'U', anything else = delete).
pub const OP_COLUMN: &str = "cdc_op";
/// Alias for the row-version token selected alongside data columns.
pub const VERSION_ALIAS: &str = "cdc_version";
/// Alias for the capture-timestamp expression (epoch milliseconds).
pub const TS_ALIAS: &str = "cdc_ts_ms";
/// Alias for the opaque row locator of a change-log row.
pub const LOCATOR_ALIAS: &str = "cdc_rowid";

const VERSION_EXPR: &str = "xmin::text::bigint";
const TS_EXPR: &str = "(extract(epoch from clock_timestamp()) * 1000)::bigint";

/// Select the current row image by primary key.
///
/// Every column in declared order, then the row-version token and the
/// capture-timestamp expression, filtered by an AND-conjunction of
/// key-equality placeholders in key scan order.
pub fn row_lookup(catalog: &Catalog) -> String {
    let columns = catalog
        .columns()
        .iter()
        .map(|c| quote_pg(c.name()))
        .collect::<Vec<_>>()
        .join(", ");
    let filter = catalog
        .key_columns()
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_pg(c.name()), i + 1))
        .collect::<Vec<_>>()
        .join(" and ");
    format!(
        "select {columns}, {VERSION_EXPR} as {vers}, {TS_EXPR} as {ts} from {owner}.{table} where {filter}",
        vers = quote_pg(VERSION_ALIAS),
        ts = quote_pg(TS_ALIAS),
        owner = quote_pg(&catalog.owner),
        table = quote_pg(&catalog.table),
    )
}

/// Read the change log in sequence order.
///
/// Selects the primary-key columns, the sequence number, the operation
/// tag derived from the raw marker ('I' → c, 'U' → u, everything else →
/// d), the row-version token, the capture timestamp, and the row
/// locator. Ordered by sequence ascending — load-bearing: it is the
/// sole ordering guarantee the poller offers.
pub fn log_select(catalog: &Catalog, log_name: &str) -> String {
    let keys = catalog
        .key_columns()
        .iter()
        .map(|c| quote_pg(c.name()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "select {keys}, {seq}, case {op} when 'I' then 'c' when 'U' then 'u' else 'd' end as {op}, \
         {VERSION_EXPR} as {vers}, {TS_EXPR} as {ts}, ctid::text as {loc} \
         from {owner}.{log} order by {seq}",
        seq = quote_pg(SEQ_COLUMN),
        op = quote_pg(OP_COLUMN),
        vers = quote_pg(VERSION_ALIAS),
        ts = quote_pg(TS_ALIAS),
        loc = quote_pg(LOCATOR_ALIAS),
        owner = quote_pg(&catalog.owner),
        log = quote_pg(log_name),
    )
}

/// Delete one change-log row by its opaque locator.
pub fn log_delete(catalog: &Catalog, log_name: &str) -> String {
    format!(
        "delete from {owner}.{log} where ctid = $1::tid",
        owner = quote_pg(&catalog.owner),
        log = quote_pg(log_name),
    )
}
