// ABOUTME: Capture poller tests against an in-memory source connection
// ABOUTME: Covers ordering, lookup gaps, the batch ceiling and log-row deletion

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use changelog_replicator::capture::delivery::EventDelivery;
use changelog_replicator::capture::event::{ChangeEvent, ChangeOp};
use changelog_replicator::capture::{CapturePoller, SourceTable};
use changelog_replicator::catalog::{Catalog, ColType, ColumnSpec};
use changelog_replicator::conn::{SourceConnection, SourceRow};
use changelog_replicator::error::{ReplicationError, Result};
use changelog_replicator::value::BindValue;

fn orders_table() -> Arc<SourceTable> {
    let catalog = Catalog::from_specs(
        "public",
        "orders",
        vec![
            ColumnSpec::new("ID", ColType::BigInt).key(),
            ColumnSpec::new("NOTE", ColType::Varchar),
        ],
    )
    .unwrap();
    Arc::new(SourceTable::new(catalog, "orders_log"))
}

#[derive(Clone)]
enum Cell {
    Null,
    I64(i64),
    Text(String),
}

struct FakeRow {
    cells: Vec<Cell>,
}

impl SourceRow for FakeRow {
    fn get_i8(&self, _: usize) -> Result<Option<i8>> {
        Ok(None)
    }
    fn get_i16(&self, _: usize) -> Result<Option<i16>> {
        Ok(None)
    }
    fn get_i32(&self, _: usize) -> Result<Option<i32>> {
        Ok(None)
    }
    fn get_i64(&self, idx: usize) -> Result<Option<i64>> {
        match self.cells.get(idx) {
            Some(Cell::I64(v)) => Ok(Some(*v)),
            Some(Cell::Null) | None => Ok(None),
            Some(Cell::Text(_)) => Err(ReplicationError::sql_msg("not an integer cell")),
        }
    }
    fn get_f32(&self, _: usize) -> Result<Option<f32>> {
        Ok(None)
    }
    fn get_f64(&self, _: usize) -> Result<Option<f64>> {
        Ok(None)
    }
    fn get_decimal(&self, _: usize) -> Result<Option<Decimal>> {
        Ok(None)
    }
    fn get_date(&self, _: usize) -> Result<Option<NaiveDate>> {
        Ok(None)
    }
    fn get_timestamp(&self, _: usize) -> Result<Option<NaiveDateTime>> {
        Ok(None)
    }
    fn get_string(&self, idx: usize) -> Result<Option<String>> {
        match self.cells.get(idx) {
            Some(Cell::Text(s)) => Ok(Some(s.clone())),
            Some(Cell::Null) | None => Ok(None),
            Some(Cell::I64(v)) => Ok(Some(v.to_string())),
        }
    }
    fn get_bytes(&self, _: usize) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    fn binary_stream(&self, _: usize) -> Result<Option<Box<dyn Read + '_>>> {
        Ok(None)
    }
    fn character_stream(&self, _: usize) -> Result<Option<Box<dyn Read + '_>>> {
        Ok(None)
    }
}

#[derive(Clone)]
struct LogRow {
    id: i64,
    seq: i64,
    op: &'static str,
    locator: String,
}

/// In-memory source: a change log plus the master table it points at.
struct FakeSource {
    log: Vec<LogRow>,
    master: HashMap<i64, String>,
    deleted: Vec<String>,
    begun: usize,
    committed: usize,
    rolled_back: usize,
}

impl FakeSource {
    fn new(log: Vec<LogRow>, master: &[(i64, &str)]) -> Self {
        Self {
            log,
            master: master
                .iter()
                .map(|(id, note)| (*id, note.to_string()))
                .collect(),
            deleted: Vec::new(),
            begun: 0,
            committed: 0,
            rolled_back: 0,
        }
    }

    fn log_version(id: i64) -> i64 {
        100 + id
    }

    fn master_version(id: i64) -> i64 {
        500 + id
    }
}

#[async_trait]
impl SourceConnection for FakeSource {
    async fn begin(&mut self) -> Result<()> {
        self.begun += 1;
        Ok(())
    }

    async fn fetch(
        &mut self,
        sql: &str,
        params: &[BindValue],
        max_rows: Option<usize>,
    ) -> Result<Vec<Box<dyn SourceRow>>> {
        if sql.contains("orders_log") {
            // Log-select layout: key, seq, op, version, ts, locator.
            let cap = max_rows.unwrap_or(self.log.len());
            return Ok(self
                .log
                .iter()
                .take(cap)
                .map(|row| {
                    Box::new(FakeRow {
                        cells: vec![
                            Cell::I64(row.id),
                            Cell::I64(row.seq),
                            Cell::Text(row.op.to_string()),
                            Cell::I64(Self::log_version(row.id)),
                            Cell::I64(1_700_000_000_000 + row.seq),
                            Cell::Text(row.locator.clone()),
                        ],
                    }) as Box<dyn SourceRow>
                })
                .collect());
        }

        // Row lookup: all columns, then version and timestamp.
        let id = match params.first() {
            Some(BindValue::BigInt(id)) => *id,
            other => {
                return Err(ReplicationError::sql_msg(format!(
                    "unexpected lookup bind {other:?}"
                )))
            }
        };
        Ok(self
            .master
            .get(&id)
            .map(|note| {
                vec![Box::new(FakeRow {
                    cells: vec![
                        Cell::I64(id),
                        Cell::Text(note.clone()),
                        Cell::I64(Self::master_version(id)),
                        Cell::I64(1_700_000_100_000 + id),
                    ],
                }) as Box<dyn SourceRow>]
            })
            .unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str, params: &[BindValue]) -> Result<u64> {
        assert!(sql.starts_with("delete from"), "unexpected statement: {sql}");
        let locator = match params.first() {
            Some(BindValue::Text(loc)) => loc.clone(),
            other => {
                return Err(ReplicationError::sql_msg(format!(
                    "unexpected delete bind {other:?}"
                )))
            }
        };
        let before = self.log.len();
        self.log.retain(|row| row.locator != locator);
        let removed = (before - self.log.len()) as u64;
        self.deleted.push(locator);
        Ok(removed)
    }

    async fn commit(&mut self) -> Result<()> {
        self.committed += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.rolled_back += 1;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingDelivery {
    events: Vec<ChangeEvent>,
}

#[async_trait]
impl EventDelivery for RecordingDelivery {
    async fn deliver(&mut self, event: ChangeEvent) -> Result<()> {
        self.events.push(event);
        Ok(())
    }
}

/// Rejects every event, like a publisher whose downstream is gone.
struct RejectingDelivery;

#[async_trait]
impl EventDelivery for RejectingDelivery {
    async fn deliver(&mut self, event: ChangeEvent) -> Result<()> {
        Err(ReplicationError::Delivery {
            key: event.message_key(),
            source: "broker unavailable".into(),
        })
    }
}

fn log_row(id: i64, seq: i64, op: &'static str) -> LogRow {
    LogRow {
        id,
        seq,
        op,
        locator: format!("(0,{seq})"),
    }
}

#[tokio::test]
async fn test_cycle_emits_events_in_sequence_order() {
    let mut source = FakeSource::new(
        vec![log_row(1, 1, "c"), log_row(2, 2, "u"), log_row(3, 3, "d")],
        &[(1, "first"), (2, "second")],
    );
    let mut poller = CapturePoller::new(orders_table(), 100, RecordingDelivery::default());

    let stats = poller.poll_cycle(&mut source).await.unwrap();
    assert_eq!(stats.rows_read, 3);
    assert_eq!(stats.events_delivered, 3);
    assert_eq!(stats.gaps_skipped, 0);
    assert_eq!(stats.log_rows_deleted, 3);

    let events = &poller.delivery_mut().events;
    let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    let ops: Vec<&str> = events.iter().map(|e| e.op.code()).collect();
    assert_eq!(ops, vec!["c", "u", "d"]);

    // Create/update carry the full looked-up image and its version.
    let create = &events[0];
    assert!(create.before.is_none());
    let after = create.after.as_ref().unwrap();
    assert_eq!(after.names(), vec!["ID", "NOTE"]);
    assert_eq!(create.row_version, FakeSource::master_version(1));

    // Delete carries a key-only before-image straight from the log row.
    let delete = &events[2];
    assert!(delete.after.is_none());
    let before = delete.before.as_ref().unwrap();
    assert_eq!(before.names(), vec!["ID"]);
    assert_eq!(delete.row_version, FakeSource::log_version(3));

    assert_eq!(source.begun, 1);
    assert_eq!(source.committed, 1);
    assert_eq!(source.rolled_back, 0);
    assert!(source.log.is_empty());
}

#[tokio::test]
async fn test_missing_lookup_row_is_skipped_but_log_row_still_deleted() {
    let mut source = FakeSource::new(
        vec![log_row(9, 1, "u"), log_row(1, 2, "c")],
        &[(1, "present")],
    );
    let mut poller = CapturePoller::new(orders_table(), 100, RecordingDelivery::default());

    let stats = poller.poll_cycle(&mut source).await.unwrap();
    assert_eq!(stats.rows_read, 2);
    assert_eq!(stats.events_delivered, 1);
    assert_eq!(stats.gaps_skipped, 1);
    assert_eq!(stats.log_rows_deleted, 2);

    assert_eq!(poller.delivery_mut().events[0].sequence, 2);
    assert!(source.log.is_empty());
}

#[tokio::test]
async fn test_batch_ceiling_is_a_hard_stop() {
    let log: Vec<LogRow> = (1..=5).map(|seq| log_row(seq, seq, "c")).collect();
    let master: Vec<(i64, &str)> = (1..=5).map(|id| (id, "note")).collect();
    let mut source = FakeSource::new(log, &master);
    let mut poller = CapturePoller::new(orders_table(), 2, RecordingDelivery::default());

    let stats = poller.poll_cycle(&mut source).await.unwrap();
    assert_eq!(stats.rows_read, 2);
    assert_eq!(stats.events_delivered, 2);
    assert_eq!(stats.log_rows_deleted, 2);

    // Rows past the ceiling stay for the next cycle.
    assert_eq!(source.log.len(), 3);
    let remaining: Vec<i64> = source.log.iter().map(|r| r.seq).collect();
    assert_eq!(remaining, vec![3, 4, 5]);
}

#[tokio::test]
async fn test_log_rows_deleted_in_read_order_after_delivery() {
    let mut source = FakeSource::new(
        vec![log_row(1, 10, "c"), log_row(2, 11, "c"), log_row(3, 12, "c")],
        &[(1, "a"), (2, "b"), (3, "c")],
    );
    let mut poller = CapturePoller::new(orders_table(), 100, RecordingDelivery::default());

    poller.poll_cycle(&mut source).await.unwrap();
    assert_eq!(
        source.deleted,
        vec!["(0,10)".to_string(), "(0,11)".to_string(), "(0,12)".to_string()]
    );
}

#[tokio::test]
async fn test_delete_event_needs_no_master_row() {
    // The row is gone from the master table, which is exactly the delete case.
    let mut source = FakeSource::new(vec![log_row(42, 7, "d")], &[]);
    let mut poller = CapturePoller::new(orders_table(), 100, RecordingDelivery::default());

    let stats = poller.poll_cycle(&mut source).await.unwrap();
    assert_eq!(stats.events_delivered, 1);
    assert_eq!(stats.gaps_skipped, 0);
    assert_eq!(poller.delivery_mut().events[0].op, ChangeOp::Delete);
}

#[tokio::test]
async fn test_rejected_delivery_aborts_before_deletion_flush() {
    let mut source = FakeSource::new(vec![log_row(1, 1, "c")], &[(1, "note")]);
    let mut poller = CapturePoller::new(orders_table(), 100, RejectingDelivery);

    let err = poller.poll_cycle(&mut source).await.unwrap_err();
    assert!(matches!(err, ReplicationError::Delivery { .. }));

    // Nothing was flushed, so the log row is re-read next cycle.
    assert!(source.deleted.is_empty());
    assert_eq!(source.log.len(), 1);
    assert_eq!(source.committed, 0);
    assert_eq!(source.rolled_back, 1);
}

#[tokio::test]
async fn test_failed_cycle_rolls_back_and_connection_stays_usable() {
    // Two tables share one source connection within a daemon cycle; a
    // failure in the first must not leave an open transaction that
    // poisons the second.
    let mut source = FakeSource::new(
        vec![log_row(1, 1, "c"), log_row(2, 2, "c")],
        &[(1, "a"), (2, "b")],
    );

    let mut failing = CapturePoller::new(orders_table(), 100, RejectingDelivery);
    failing.poll_cycle(&mut source).await.unwrap_err();
    assert_eq!(source.begun, 1);
    assert_eq!(source.rolled_back, 1);
    assert_eq!(source.committed, 0);

    let mut poller = CapturePoller::new(orders_table(), 100, RecordingDelivery::default());
    let stats = poller.poll_cycle(&mut source).await.unwrap();
    assert_eq!(stats.events_delivered, 2);
    assert_eq!(source.committed, 1);
    assert!(source.log.is_empty());
}
