// ABOUTME: SQL text generation for both sides of the pipeline
// ABOUTME: All text is synthesized once per table and cached verbatim, never per event

pub mod capture;
pub mod sink;

pub use sink::Dialect;

/// Quote an identifier with double quotes (source side is PostgreSQL).
pub(crate) fn quote_pg(ident: &str) -> String {
    format!("\"{ident}\"")
}
