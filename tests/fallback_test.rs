// ABOUTME: Applier tests against an in-memory sink connection
// ABOUTME: Covers update-to-insert fallback, tolerant delete and sink provisioning

use async_trait::async_trait;
use std::collections::HashMap;

use changelog_replicator::apply::{Applier, SinkTable};
use changelog_replicator::capture::event::{ChangeEvent, ChangeOp, RowImage};
use changelog_replicator::catalog::{Catalog, ColType, ColumnSpec};
use changelog_replicator::conn::SinkConnection;
use changelog_replicator::error::{ReplicationError, Result};
use changelog_replicator::sql::Dialect;
use changelog_replicator::value::{BindValue, Value};

fn orders_catalog() -> Catalog {
    Catalog::from_specs(
        "public",
        "orders",
        vec![
            ColumnSpec::new("ID", ColType::BigInt).key(),
            ColumnSpec::new("NOTE", ColType::Varchar),
        ],
    )
    .unwrap()
}

fn applier(auto_create: bool) -> Applier {
    Applier::new(SinkTable::new(&orders_catalog(), Dialect::Postgres), auto_create)
}

/// In-memory sink: rows keyed by the single key bind.
#[derive(Default)]
struct FakeSink {
    exists: bool,
    rows: HashMap<String, Vec<BindValue>>,
    executed: Vec<(String, Vec<BindValue>)>,
    ddl: Vec<String>,
    closed: usize,
}

fn render(bind: &BindValue) -> String {
    format!("{bind:?}")
}

#[async_trait]
impl SinkConnection for FakeSink {
    async fn execute(&mut self, sql: &str, params: &[BindValue]) -> Result<u64> {
        self.executed.push((sql.to_string(), params.to_vec()));
        if sql.starts_with("insert into") {
            let key = render(&params[0]);
            if self.rows.contains_key(&key) {
                return Err(ReplicationError::sql_msg("duplicate key"));
            }
            self.rows.insert(key, params.to_vec());
            Ok(1)
        } else if sql.starts_with("update ") {
            // Key binds come last in update statements.
            let key = render(params.last().unwrap());
            match self.rows.get_mut(&key) {
                Some(row) => {
                    *row = params.to_vec();
                    Ok(1)
                }
                None => Ok(0),
            }
        } else if sql.starts_with("delete from") {
            let key = render(&params[0]);
            Ok(self.rows.remove(&key).map(|_| 1).unwrap_or(0))
        } else {
            Err(ReplicationError::sql_msg(format!("unexpected statement: {sql}")))
        }
    }

    async fn execute_ddl(&mut self, sql: &str) -> Result<()> {
        self.ddl.push(sql.to_string());
        self.exists = true;
        Ok(())
    }

    async fn table_exists(&mut self, _table: &str) -> Result<bool> {
        Ok(self.exists)
    }

    async fn close_statements(&mut self) -> Result<()> {
        self.closed += 1;
        Ok(())
    }
}

fn image(id: i64, note: &str) -> RowImage {
    let mut image = RowImage::default();
    image.push("ID", Value::BigInt(id));
    image.push("NOTE", Value::Text(note.to_string()));
    image
}

fn event(op: ChangeOp, id: i64, note: &str, sequence: i64) -> ChangeEvent {
    let (before, after) = match op {
        ChangeOp::Delete => {
            let mut key = RowImage::default();
            key.push("ID", Value::BigInt(id));
            (Some(key), None)
        }
        ChangeOp::Create | ChangeOp::Update => (None, Some(image(id, note))),
    };
    ChangeEvent {
        owner: "public".into(),
        table: "orders".into(),
        op,
        before,
        after,
        row_version: 100 + sequence,
        ts_ms: 1_700_000_000_000 + sequence,
        sequence,
    }
}

#[tokio::test]
async fn test_update_falls_back_to_insert_when_row_missing() {
    let mut sink = FakeSink { exists: true, ..Default::default() };
    let mut applier = applier(false);

    let stats = applier
        .apply_batch(&mut sink, &[event(ChangeOp::Update, 1, "late arrival", 1)])
        .await
        .unwrap();
    assert_eq!(stats.updates, 1);

    // Update matched nothing, then the insert fallback fired.
    let statements: Vec<&str> = sink.executed.iter().map(|(sql, _)| sql.as_str()).collect();
    assert_eq!(statements.len(), 2);
    assert!(statements[0].starts_with("update "));
    assert!(statements[1].starts_with("insert into"));
    assert_eq!(sink.rows.len(), 1);
}

#[tokio::test]
async fn test_update_of_existing_row_does_not_insert() {
    let mut sink = FakeSink { exists: true, ..Default::default() };
    let mut applier = applier(false);

    applier
        .apply_batch(&mut sink, &[event(ChangeOp::Create, 1, "v1", 1)])
        .await
        .unwrap();
    applier
        .apply_batch(&mut sink, &[event(ChangeOp::Update, 1, "v2", 2)])
        .await
        .unwrap();

    let statements: Vec<&str> = sink.executed.iter().map(|(sql, _)| sql.as_str()).collect();
    assert_eq!(statements.len(), 2);
    assert!(statements[1].starts_with("update "));
    assert_eq!(sink.rows.len(), 1);
}

#[tokio::test]
async fn test_update_binds_non_key_columns_before_key() {
    let mut sink = FakeSink { exists: true, ..Default::default() };
    let mut applier = applier(false);

    applier
        .apply_batch(&mut sink, &[event(ChangeOp::Create, 7, "x", 1)])
        .await
        .unwrap();
    applier
        .apply_batch(&mut sink, &[event(ChangeOp::Update, 7, "y", 2)])
        .await
        .unwrap();

    let (_, update_binds) = &sink.executed[1];
    assert_eq!(
        update_binds,
        &vec![BindValue::Text("y".into()), BindValue::BigInt(7)]
    );
}

#[tokio::test]
async fn test_delete_of_absent_row_is_tolerated() {
    let mut sink = FakeSink { exists: true, ..Default::default() };
    let mut applier = applier(false);

    let stats = applier
        .apply_batch(&mut sink, &[event(ChangeOp::Delete, 99, "", 1)])
        .await
        .unwrap();
    assert_eq!(stats.deletes, 1);
    assert!(sink.rows.is_empty());
}

#[tokio::test]
async fn test_replayed_history_converges_to_empty_table() {
    let mut sink = FakeSink { exists: true, ..Default::default() };
    let mut applier = applier(false);

    let history = vec![
        event(ChangeOp::Create, 1, "born", 1),
        event(ChangeOp::Update, 1, "changed", 2),
        event(ChangeOp::Delete, 1, "", 3),
    ];
    let stats = applier.apply_batch(&mut sink, &history).await.unwrap();
    assert_eq!(stats.total(), 3);
    assert!(sink.rows.is_empty());

    // Replaying the tail after the delete still succeeds: the update
    // falls back to insert and the delete removes it again.
    let stats = applier.apply_batch(&mut sink, &history[1..]).await.unwrap();
    assert_eq!(stats.total(), 2);
    assert!(sink.rows.is_empty());
}

#[tokio::test]
async fn test_auto_create_provisions_the_table_once() {
    let mut sink = FakeSink::default();
    let mut applier = applier(true);

    applier
        .apply_batch(&mut sink, &[event(ChangeOp::Create, 1, "a", 1)])
        .await
        .unwrap();
    applier
        .apply_batch(&mut sink, &[event(ChangeOp::Create, 2, "b", 2)])
        .await
        .unwrap();

    assert_eq!(sink.ddl.len(), 1);
    assert!(sink.ddl[0].starts_with("create table \"orders\""));
    assert!(sink.ddl[0].contains("constraint \"orders_pk\" primary key(\"ID\")"));
    assert_eq!(sink.rows.len(), 2);
}

#[tokio::test]
async fn test_missing_table_fails_fast_without_auto_create() {
    let mut sink = FakeSink::default();
    let mut applier = applier(false);
    let batch = [event(ChangeOp::Create, 1, "a", 1)];

    let err = applier.apply_batch(&mut sink, &batch).await.unwrap_err();
    assert!(matches!(err, ReplicationError::Provisioning { .. }));

    // Still failing on the next batch; nothing was created or written.
    let err = applier.apply_batch(&mut sink, &batch).await.unwrap_err();
    assert!(matches!(err, ReplicationError::Provisioning { .. }));
    assert!(sink.ddl.is_empty());
    assert!(sink.rows.is_empty());
}

#[tokio::test]
async fn test_close_releases_sink_statements() {
    let mut sink = FakeSink { exists: true, ..Default::default() };
    let mut applier = applier(false);
    applier.close(&mut sink).await.unwrap();
    assert_eq!(sink.closed, 1);
}
