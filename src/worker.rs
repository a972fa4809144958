//! lapin-backed callbacks used by the `mqlink` binary
//!
//! Declares the configured queues, starts one consumer per queue and logs and
//! acknowledges every delivery. Applications embedding the library supply
//! their own [`QueueDeclarer`], [`ConsumerFactory`] and [`EventHandler`].

use crate::broker::amqp::AmqpBroker;
use crate::broker::{BoxError, BrokerLink, QueueDeclarer, QueueSet};
use crate::config::QueueSpec;
use crate::coordinator::{ConsumerFactory, ConsumerSet, EventHandler};
use async_trait::async_trait;
use futures::future::{BoxFuture, select_all};
use futures::{FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer, Queue};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Declares the queues listed in the configuration
#[derive(Debug, Clone)]
pub struct ConfiguredQueues {
    queues: Vec<QueueSpec>,
}

impl ConfiguredQueues {
    pub fn new(queues: Vec<QueueSpec>) -> Self {
        Self { queues }
    }
}

/// Map a configured queue onto `queue.declare` options (pure function)
pub fn declare_options(spec: &QueueSpec) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: spec.durable,
        exclusive: spec.exclusive,
        auto_delete: spec.auto_delete,
        ..QueueDeclareOptions::default()
    }
}

#[async_trait]
impl QueueDeclarer<AmqpBroker> for ConfiguredQueues {
    async fn declare_queues(&self, session: &Channel) -> Result<QueueSet<Queue>, BoxError> {
        let mut declared = QueueSet::new();
        for spec in &self.queues {
            let queue = session
                .queue_declare(&spec.name, declare_options(spec), FieldTable::default())
                .await?;
            debug!(
                queue = %spec.name,
                messages = queue.message_count(),
                consumers = queue.consumer_count(),
                "Queue declared"
            );
            declared.insert(spec.name.clone(), queue);
        }
        Ok(declared)
    }
}

/// Unique consumer tag for `queue`
pub fn consumer_tag(queue: &str) -> String {
    format!("mqlink-{}-{}", queue, Uuid::new_v4())
}

/// Starts one consumer per declared queue
#[derive(Debug, Clone, Default)]
pub struct QueueConsumers;

#[async_trait]
impl ConsumerFactory<AmqpBroker, Consumer> for QueueConsumers {
    async fn create_consumers(
        &self,
        link: &BrokerLink<AmqpBroker>,
    ) -> Result<ConsumerSet<Consumer>, BoxError> {
        let mut consumers = ConsumerSet::new();
        for queue in link.queue_names() {
            let consumer = link
                .session
                .basic_consume(
                    queue,
                    &consumer_tag(queue),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            consumers.insert(queue.to_string(), consumer);
        }
        Ok(consumers)
    }
}

type NextDelivery<'a> = BoxFuture<'a, (String, Option<Result<Delivery, lapin::Error>>)>;

/// Logs and acknowledges deliveries from whichever consumer is ready first
#[derive(Debug, Clone)]
pub struct DeliveryLogger {
    poll_interval: Duration,
}

impl Default for DeliveryLogger {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl DeliveryLogger {
    /// `poll_interval` bounds how long one call waits for a delivery
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    async fn process(&self, queue: &str, delivery: Delivery) {
        info!(
            queue,
            delivery_tag = delivery.delivery_tag,
            routing_key = delivery.routing_key.as_str(),
            redelivered = delivery.redelivered,
            bytes = delivery.data.len(),
            "Delivery received"
        );

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            warn!(queue, "Failed to acknowledge delivery: {}", e);
        }
    }
}

#[async_trait]
impl EventHandler<Consumer> for DeliveryLogger {
    async fn handle_events(&mut self, consumers: &mut ConsumerSet<Consumer>) {
        if consumers.is_empty() {
            tokio::time::sleep(self.poll_interval).await;
            return;
        }

        let pending: Vec<NextDelivery<'_>> = consumers
            .iter_mut()
            .map(|(queue, consumer)| {
                async move { (queue.clone(), consumer.next().await) }.boxed()
            })
            .collect();

        let ready = tokio::time::timeout(self.poll_interval, select_all(pending)).await;
        let ((queue, next), _, _) = match ready {
            Ok(ready) => ready,
            Err(_) => return,
        };

        match next {
            Some(Ok(delivery)) => self.process(&queue, delivery).await,
            Some(Err(e)) => warn!(queue = %queue, "Consumer error: {}", e),
            None => {
                debug!(queue = %queue, "Consumer stream ended");
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}
