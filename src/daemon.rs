// ABOUTME: ReplicationDaemon - orchestrates poll cycles for all configured tables
// ABOUTME: Connects and discovers once at startup, then runs cycles at a fixed interval

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::apply::{applier_for, Applier, ApplyStats};
use crate::capture::delivery::BatchDelivery;
use crate::capture::{CapturePoller, CycleStats, SourceTable};
use crate::config::Config;
use crate::conn::{SinkConnection, SourceConnection};
use crate::postgres::{self, PgMetadataProvider, PgSinkConnection, PgSourceConnection};
use crate::sql::Dialect;

/// Statistics from one daemon cycle across all tables.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub tables: usize,
    pub rows_read: usize,
    pub events_delivered: usize,
    pub gaps_skipped: usize,
    pub rows_applied: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl CycleSummary {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One table's poller and applier, built once and reused every cycle.
///
/// The poller keeps the table's cached SQL texts; the applier keeps its
/// cached DML texts and provisioning state, so the sink table is probed
/// (and created, if permitted) at most once per daemon run.
pub struct TablePipeline {
    name: String,
    poller: CapturePoller<BatchDelivery>,
    applier: Applier,
}

impl TablePipeline {
    pub fn new(
        table: Arc<SourceTable>,
        batch_size: usize,
        dialect: Dialect,
        auto_create: bool,
    ) -> Self {
        let name = table.catalog().qualified_name();
        let poller = CapturePoller::new(table.clone(), batch_size, BatchDelivery::new(table.clone()));
        let applier = applier_for(&table, dialect, auto_create);
        Self {
            name,
            poller,
            applier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One poll-and-apply pass for this table.
    pub async fn run_once(
        &mut self,
        source: &mut dyn SourceConnection,
        sink: &mut dyn SinkConnection,
    ) -> crate::error::Result<(CycleStats, ApplyStats)> {
        let stats = self.poller.poll_cycle(source).await?;
        let records = self.poller.delivery_mut().drain();
        let applied = self.applier.apply_records(sink, &records).await?;
        debug!(
            "{}: read {} log rows, applied {} changes ({} gaps skipped)",
            self.name,
            stats.rows_read,
            applied.total(),
            stats.gaps_skipped
        );
        Ok((stats, applied))
    }

    /// Release the sink statements this pipeline's applier cached.
    pub async fn close(&mut self, sink: &mut dyn SinkConnection) -> crate::error::Result<()> {
        self.applier.close(sink).await
    }
}

/// Run every pipeline once, sequentially, on the shared connections.
///
/// A failure in one table is recorded in the summary and does not stop
/// the others; the poller rolls its transaction back, so the shared
/// source connection stays usable.
pub async fn replicate_all(
    pipelines: &mut [TablePipeline],
    source: &mut dyn SourceConnection,
    sink: &mut dyn SinkConnection,
) -> CycleSummary {
    let start = std::time::Instant::now();
    let mut summary = CycleSummary::default();

    for pipeline in pipelines.iter_mut() {
        match pipeline.run_once(source, sink).await {
            Ok((stats, applied)) => {
                summary.tables += 1;
                summary.rows_read += stats.rows_read;
                summary.events_delivered += stats.events_delivered;
                summary.gaps_skipped += stats.gaps_skipped;
                summary.rows_applied += applied.total();
            }
            Err(e) => {
                error!("Failed to replicate {}: {e:?}", pipeline.name());
                summary
                    .errors
                    .push(format!("Failed to replicate {}: {e}", pipeline.name()));
            }
        }
    }

    summary.duration_ms = start.elapsed().as_millis() as u64;
    summary
}

/// Orchestrates continuous change-log replication.
///
/// Connections, table metadata and per-table pipelines are built once
/// at startup; every poll cycle reuses them.
pub struct ReplicationDaemon {
    config: Config,
}

impl ReplicationDaemon {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Connect to both databases and build one pipeline per table.
    ///
    /// Tables that fail discovery are reported in the returned error
    /// list and excluded; the metadata connection is reused as the poll
    /// connection afterwards.
    async fn build(
        &self,
    ) -> Result<(
        PgSourceConnection,
        Box<dyn SinkConnection>,
        Vec<TablePipeline>,
        Vec<String>,
    )> {
        let mut provider = PgMetadataProvider::new(
            postgres::connect(&self.config.source_url)
                .await
                .context("Failed to connect to source database")?,
        );
        let sink = self
            .connect_sink()
            .await
            .context("Failed to connect to sink database")?;

        let mut pipelines = Vec::with_capacity(self.config.tables.len());
        let mut errors = Vec::new();
        for table_config in &self.config.tables {
            match SourceTable::from_metadata(
                &mut provider,
                &table_config.owner,
                &table_config.name,
                &table_config.log_name(),
            )
            .await
            {
                Ok(table) => pipelines.push(TablePipeline::new(
                    Arc::new(table),
                    self.config.batch_size,
                    self.config.dialect,
                    self.config.auto_create,
                )),
                Err(e) => {
                    error!(
                        "Failed to describe {}.{}: {e:?}",
                        table_config.owner, table_config.name
                    );
                    errors.push(format!(
                        "Failed to describe {}.{}: {e}",
                        table_config.owner, table_config.name
                    ));
                }
            }
        }

        let source = PgSourceConnection::new(provider.into_client());
        Ok((source, sink, pipelines, errors))
    }

    /// Run one replication cycle over every configured table.
    ///
    /// Connects, discovers, replicates once and releases the sink
    /// statements. The continuous path in `run` builds its state once
    /// instead.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let (mut source, mut sink, mut pipelines, discovery_errors) = self.build().await?;
        let mut summary = replicate_all(&mut pipelines, &mut source, sink.as_mut()).await;
        for pipeline in &mut pipelines {
            if let Err(e) = pipeline.close(sink.as_mut()).await {
                warn!("Failed to close statements for {}: {e}", pipeline.name());
            }
        }
        summary.errors.extend(discovery_errors);
        Ok(summary)
    }

    /// Run the daemon until the shutdown signal fires.
    ///
    /// Setup happens once: connect, discover every table, build the
    /// pipelines. The interval loop only polls and applies.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let (mut source, mut sink, mut pipelines, discovery_errors) = self.build().await?;
        for e in &discovery_errors {
            warn!("{e}; table excluded from this run");
        }
        if pipelines.is_empty() {
            bail!("No configured table could be described");
        }

        let mut poll_interval = interval(self.config.poll_interval());
        let mut cycles = 0u64;

        info!(
            "Starting replication daemon: {} tables, poll interval {:?}, batch size {}",
            pipelines.len(),
            self.config.poll_interval(),
            self.config.batch_size
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping daemon");
                    break;
                }
                _ = poll_interval.tick() => {
                    cycles += 1;
                    debug!("Starting replication cycle {cycles}");
                    let summary = replicate_all(&mut pipelines, &mut source, sink.as_mut()).await;
                    if summary.rows_read > 0 || !summary.is_success() {
                        info!(
                            "Cycle {cycles}: {} tables, {} log rows, {} events, {} applied in {}ms",
                            summary.tables,
                            summary.rows_read,
                            summary.events_delivered,
                            summary.rows_applied,
                            summary.duration_ms
                        );
                    }
                    if !summary.is_success() {
                        warn!("Cycle {cycles} had {} errors", summary.errors.len());
                    }
                }
            }
        }

        for pipeline in &mut pipelines {
            if let Err(e) = pipeline.close(sink.as_mut()).await {
                warn!("Failed to close statements for {}: {e}", pipeline.name());
            }
        }
        Ok(())
    }

    /// Pick the sink adapter from the URL scheme and configured dialect.
    async fn connect_sink(&self) -> Result<Box<dyn SinkConnection>> {
        let url = url::Url::parse(&self.config.sink_url).context("Invalid sink URL")?;
        match (url.scheme(), self.config.dialect) {
            ("postgres" | "postgresql", Dialect::Postgres) => Ok(Box::new(
                PgSinkConnection::new(postgres::connect(&self.config.sink_url).await?),
            )),
            ("mysql", Dialect::MySql) => Ok(Box::new(crate::mysql::MySqlSinkConnection::new(
                crate::mysql::connect(&self.config.sink_url).await?,
            ))),
            (scheme, dialect) => {
                bail!("Sink URL scheme {scheme} does not match dialect {dialect:?}")
            }
        }
    }
}
