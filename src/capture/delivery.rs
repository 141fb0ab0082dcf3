// ABOUTME: Delivery capability - how built events leave the capture loop
// ABOUTME: Push renders envelopes to a publisher; pull accumulates structured records per cycle

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::capture::event::ChangeEvent;
use crate::capture::SourceTable;
use crate::envelope::{envelope, envelope_schema, StructuredRecord};
use crate::error::{ReplicationError, Result};

/// Where one table's events go.
///
/// Chosen once at poller construction; the capture loop itself contains
/// no mode branching.
#[async_trait]
pub trait EventDelivery: Send {
    async fn deliver(&mut self, event: ChangeEvent) -> Result<()>;
}

/// Message-bus collaborator for push mode.
///
/// Receives `(key, envelope)` pairs; a failure is surfaced to the
/// caller, never retried by the core.
#[async_trait]
pub trait Publisher: Send {
    async fn publish(
        &mut self,
        key: &str,
        payload: &JsonValue,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Push mode: render the Variant A envelope and hand it to a publisher.
pub struct PushDelivery<P: Publisher> {
    publisher: P,
    schema: JsonValue,
}

impl<P: Publisher> PushDelivery<P> {
    /// The envelope schema is built once here, not per event.
    pub fn new(table: &SourceTable, publisher: P) -> Self {
        Self {
            publisher,
            schema: envelope_schema(table.catalog()),
        }
    }
}

#[async_trait]
impl<P: Publisher> EventDelivery for PushDelivery<P> {
    async fn deliver(&mut self, event: ChangeEvent) -> Result<()> {
        let key = event.message_key();
        let emitted_ms = chrono::Utc::now().timestamp_millis();
        let payload = envelope(&self.schema, &event, emitted_ms);
        self.publisher
            .publish(&key, &payload)
            .await
            .map_err(|source| ReplicationError::Delivery { key, source })
    }
}

/// Pull mode: accumulate structured records for an external polling
/// framework to drain after the cycle.
pub struct BatchDelivery {
    table: Arc<SourceTable>,
    batch: Vec<StructuredRecord>,
}

impl BatchDelivery {
    pub fn new(table: Arc<SourceTable>) -> Self {
        Self {
            table,
            batch: Vec::new(),
        }
    }

    /// Take the records accumulated by the last cycle, in sequence order.
    pub fn drain(&mut self) -> Vec<StructuredRecord> {
        std::mem::take(&mut self.batch)
    }
}

#[async_trait]
impl EventDelivery for BatchDelivery {
    async fn deliver(&mut self, event: ChangeEvent) -> Result<()> {
        self.batch
            .push(StructuredRecord::from_event(self.table.catalog(), event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::event::{ChangeOp, RowImage};
    use crate::catalog::{Catalog, ColType, ColumnSpec};
    use crate::value::Value;

    fn table() -> Arc<SourceTable> {
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

    fn create_event() -> ChangeEvent {
        let mut after = RowImage::default();
        after.push("ID", Value::BigInt(1));
        after.push("NOTE", Value::Text("hi".into()));
        ChangeEvent {
            owner: "public".into(),
            table: "orders".into(),
            op: ChangeOp::Create,
            before: None,
            after: Some(after),
            row_version: 7,
            ts_ms: 1000,
            sequence: 42,
        }
    }

    #[derive(Default)]
    struct CapturingPublisher {
        published: Vec<(String, JsonValue)>,
    }

    #[async_trait]
    impl Publisher for CapturingPublisher {
        async fn publish(
            &mut self,
            key: &str,
            payload: &JsonValue,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.published.push((key.to_string(), payload.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_push_delivery_renders_envelope_with_message_key() {
        let table = table();
        let mut delivery = PushDelivery::new(&table, CapturingPublisher::default());
        delivery.deliver(create_event()).await.unwrap();

        let (key, payload) = &delivery.publisher.published[0];
        assert_eq!(key, "public.orders-42");
        assert_eq!(payload["payload"]["op"], "c");
        assert_eq!(payload["payload"]["after"]["NOTE"], "hi");
        assert_eq!(payload["payload"]["source"]["scn"], 7);
        assert_eq!(payload["schema"]["fields"][0]["field"], "before");
    }

    #[tokio::test]
    async fn test_batch_delivery_drains_in_order_and_resets() {
        let table = table();
        let mut delivery = BatchDelivery::new(table);
        delivery.deliver(create_event()).await.unwrap();
        let mut second = create_event();
        second.sequence = 43;
        delivery.deliver(second).await.unwrap();

        let records = delivery.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 42);
        assert_eq!(records[1].sequence, 43);
        assert!(delivery.drain().is_empty());
    }
}
