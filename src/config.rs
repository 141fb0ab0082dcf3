// ABOUTME: Replication configuration - TOML file with connection URLs and per-table entries
// ABOUTME: Defaults favor a local postgres-to-postgres setup with auto-created sink tables

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::sql::Dialect;

fn default_batch_size() -> usize {
    1000
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_auto_create() -> bool {
    true
}

fn default_owner() -> String {
    "public".to_string()
}

/// Top-level replication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Source database connection URL.
    pub source_url: String,
    /// Sink database connection URL.
    pub sink_url: String,
    /// Maximum change-log rows processed per poll cycle and table.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between poll cycles in daemon mode.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Create missing sink tables from the source schema.
    #[serde(default = "default_auto_create")]
    pub auto_create: bool,
    /// SQL dialect of the sink ("postgres" or "mysql").
    #[serde(default)]
    pub dialect: Dialect,
    /// Tables to replicate.
    #[serde(default, rename = "table")]
    pub tables: Vec<TableConfig>,
}

/// One replicated table and its change log.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    #[serde(default = "default_owner")]
    pub owner: String,
    pub name: String,
    /// Change-log table name; defaults to `<name>_log`.
    pub log: Option<String>,
}

impl TableConfig {
    pub fn log_name(&self) -> String {
        self.log
            .clone()
            .unwrap_or_else(|| format!("{}_log", self.name))
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            bail!("Config must list at least one [[table]]");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        for table in &self.tables {
            if table.name.is_empty() {
                bail!("Table entries must have a non-empty name");
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            source_url = "postgres://localhost/src"
            sink_url = "postgres://localhost/dst"

            [[table]]
            name = "orders"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert!(config.auto_create);
        assert_eq!(config.dialect, Dialect::Postgres);
        assert_eq!(config.tables[0].owner, "public");
        assert_eq!(config.tables[0].log_name(), "orders_log");
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            source_url = "postgres://localhost/src"
            sink_url = "mysql://localhost/dst"
            batch_size = 250
            poll_interval_secs = 30
            auto_create = false
            dialect = "mysql"

            [[table]]
            owner = "sales"
            name = "orders"
            log = "orders_changes"
            "#,
        )
        .unwrap();
        assert_eq!(config.dialect, Dialect::MySql);
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.tables[0].log_name(), "orders_changes");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replicator.toml");
        std::fs::write(
            &path,
            r#"
            source_url = "postgres://localhost/src"
            sink_url = "postgres://localhost/dst"

            [[table]]
            name = "orders"
            "#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.tables.len(), 1);

        let err = Config::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_empty_tables_rejected() {
        let config: Config = toml::from_str(
            r#"
            source_url = "postgres://localhost/src"
            sink_url = "postgres://localhost/dst"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
