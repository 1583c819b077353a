//! RabbitMQ-backed work queue.
//!
//! The main queue is declared with a dead-letter route into the poison
//! queue, so messages the broker gives up on land where the poison
//! processor sweeps. Deliveries are acknowledged manually after
//! processing, giving at-least-once semantics end to end.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::warn;

use bifrost_core::storage::{QueueDelivery, StorageError, WorkQueue};
use bifrost_workflow::ExecutionMessage;

use crate::error::DbError;

fn backend_err(e: lapin::Error) -> StorageError {
    StorageError::Backend(format!("Broker error: {e}"))
}

/// Work queue over one AMQP channel.
pub struct LapinWorkQueue {
    channel: Channel,
    queue: String,
    consumer: Mutex<Option<lapin::Consumer>>,
}

impl LapinWorkQueue {
    /// Connect and declare `queue` (durable), dead-lettering into
    /// `poison_queue`.
    pub async fn connect(url: &str, queue: &str, poison_queue: &str) -> Result<Self, DbError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        // One message in flight per consumer slot.
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        channel
            .queue_declare(poison_queue, durable, FieldTable::default())
            .await?;

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(poison_queue.into()),
        );
        channel.queue_declare(queue, durable, args).await?;

        Ok(Self {
            channel,
            queue: queue.to_string(),
            consumer: Mutex::new(None),
        })
    }

    /// Open the already-declared poison queue for the sweep processor.
    pub async fn connect_poison(url: &str, poison_queue: &str) -> Result<Self, DbError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        channel
            .queue_declare(poison_queue, durable, FieldTable::default())
            .await?;
        Ok(Self {
            channel,
            queue: poison_queue.to_string(),
            consumer: Mutex::new(None),
        })
    }

    fn dequeue_count(properties: &BasicProperties, redelivered: bool) -> u32 {
        // x-death carries the broker's delivery accounting once a message
        // has bounced; before that, the redelivered flag is all we get.
        let death_count = properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get("x-death"))
            .and_then(|value| match value {
                AMQPValue::FieldArray(entries) => entries.as_slice().first().cloned(),
                _ => None,
            })
            .and_then(|entry| match entry {
                AMQPValue::FieldTable(table) => table.inner().get("count").cloned(),
                _ => None,
            })
            .and_then(|count| match count {
                AMQPValue::LongLongInt(n) => Some(n as u32),
                AMQPValue::LongInt(n) => Some(n as u32),
                _ => None,
            });

        death_count.unwrap_or(if redelivered { 2 } else { 1 })
    }

    fn decode(data: &[u8]) -> Result<ExecutionMessage, StorageError> {
        serde_json::from_slice(data).map_err(StorageError::Serde)
    }
}

#[async_trait]
impl WorkQueue for LapinWorkQueue {
    async fn publish(&self, message: &ExecutionMessage) -> Result<(), StorageError> {
        let payload = serde_json::to_vec(message)?;
        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(backend_err)?
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<QueueDelivery>, StorageError> {
        let mut guard = self.consumer.lock().await;
        if guard.is_none() {
            let consumer = self
                .channel
                .basic_consume(
                    &self.queue,
                    "bifrost-consumer",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(backend_err)?;
            *guard = Some(consumer);
        }
        let consumer = guard.as_mut().expect("consumer installed above");

        loop {
            match consumer.next().await {
                Some(Ok(delivery)) => {
                    let dequeue_count =
                        Self::dequeue_count(&delivery.properties, delivery.redelivered);
                    match Self::decode(&delivery.data) {
                        Ok(message) => {
                            return Ok(Some(QueueDelivery {
                                message,
                                dequeue_count,
                                tag: delivery.delivery_tag,
                            }));
                        }
                        Err(e) => {
                            // Unparseable payloads are acked away rather
                            // than redelivered forever.
                            warn!(error = %e, "Dropping malformed queue message");
                            self.channel
                                .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
                                .await
                                .map_err(backend_err)?;
                        }
                    }
                }
                Some(Err(e)) => return Err(backend_err(e)),
                None => return Ok(None),
            }
        }
    }

    async fn receive_batch(&self, max: usize) -> Result<Vec<QueueDelivery>, StorageError> {
        let mut deliveries = Vec::new();
        for _ in 0..max {
            let Some(fetched) = self
                .channel
                .basic_get(&self.queue, BasicGetOptions::default())
                .await
                .map_err(backend_err)?
            else {
                break;
            };
            let delivery = fetched.delivery;
            let dequeue_count =
                Self::dequeue_count(&delivery.properties, delivery.redelivered);
            match Self::decode(&delivery.data) {
                Ok(decoded) => deliveries.push(QueueDelivery {
                    message: decoded,
                    dequeue_count,
                    tag: delivery.delivery_tag,
                }),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed poison message");
                    self.channel
                        .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
                        .await
                        .map_err(backend_err)?;
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &QueueDelivery) -> Result<(), StorageError> {
        self.channel
            .basic_ack(delivery.tag, BasicAckOptions::default())
            .await
            .map_err(backend_err)
    }
}
