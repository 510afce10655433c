//! NATS JetStream Queue Consumer
//!
//! Provides a JetStream pull-consumer based adapter for NATS. Mirrors the
//! receipt-handle tracking idiom used by the ActiveMQ adapter: each delivered
//! message is kept alive (not yet acked) in a side table keyed by a handle we
//! hand back to the caller, since JetStream acks are performed against the
//! message itself rather than a numeric tag.

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind, Context};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{QueueConsumer, QueueError, QueueMetrics, Result};
use fc_common::{Message, QueuedMessage};

/// Configuration for the NATS JetStream consumer
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,
    /// JetStream stream name
    pub stream_name: String,
    /// Durable consumer name
    pub consumer_name: String,
    /// Subject the stream captures
    pub subject: String,
    /// Ack wait before JetStream considers a delivery abandoned and redelivers
    pub ack_wait_seconds: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "flowcatalyst".to_string(),
            consumer_name: "flowcatalyst-router".to_string(),
            subject: "flowcatalyst.messages".to_string(),
            ack_wait_seconds: 120,
        }
    }
}

/// NATS JetStream queue consumer (pull-based, durable)
pub struct NatsConsumer {
    config: NatsConfig,
    consumer: PullConsumer,
    running: AtomicBool,
    /// Unacked deliveries, keyed by the receipt handle we generated for them.
    pending: Arc<RwLock<std::collections::HashMap<String, jetstream::Message>>>,
}

impl NatsConsumer {
    /// Connect and bind (creating if necessary) a durable pull consumer.
    pub async fn new(config: NatsConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Database(format!("NATS connection failed: {}", e)))?;

        let jetstream: Context = jetstream::new(client);

        let stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![config.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Database(format!("Failed to get/create stream: {}", e)))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &config.consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(config.consumer_name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(config.ack_wait_seconds),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Database(format!("Failed to get/create consumer: {}", e)))?;

        info!(
            stream = %config.stream_name,
            consumer = %config.consumer_name,
            "Connected to NATS JetStream"
        );

        Ok(Self {
            config,
            consumer,
            running: AtomicBool::new(true),
            pending: Arc::new(RwLock::new(std::collections::HashMap::new())),
        })
    }

    fn generate_receipt_handle(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl QueueConsumer for NatsConsumer {
    fn identifier(&self) -> &str {
        &self.config.stream_name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_messages as usize)
            .expires(Duration::from_millis(500))
            .messages()
            .await
            .map_err(|e| QueueError::Database(format!("Fetch failed: {}", e)))?;

        let mut messages = Vec::with_capacity(max_messages as usize);

        use futures::StreamExt;
        while let Some(next) = batch.next().await {
            let delivered = match next {
                Ok(m) => m,
                Err(e) => {
                    error!(stream = %self.config.stream_name, error = %e, "Error receiving JetStream message");
                    break;
                }
            };

            match serde_json::from_slice::<Message>(&delivered.payload) {
                Ok(message) => {
                    let broker_message_id = delivered
                        .info()
                        .ok()
                        .map(|info| info.stream_sequence.to_string());
                    let receipt_handle = self.generate_receipt_handle();
                    self.pending
                        .write()
                        .await
                        .insert(receipt_handle.clone(), delivered);

                    messages.push(QueuedMessage {
                        message,
                        receipt_handle,
                        broker_message_id,
                        queue_identifier: self.config.stream_name.clone(),
                    });
                }
                Err(e) => {
                    error!(
                        stream = %self.config.stream_name,
                        error = %e,
                        "Failed to parse JetStream message, terminating redelivery"
                    );
                    let _ = delivered.ack_with(AckKind::Term).await;
                }
            }
        }

        if !messages.is_empty() {
            debug!(
                stream = %self.config.stream_name,
                count = messages.len(),
                "Polled messages from JetStream"
            );
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let delivered = self
            .pending
            .write()
            .await
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        delivered
            .ack()
            .await
            .map_err(|e| QueueError::Database(format!("ACK failed: {}", e)))?;

        debug!(receipt_handle = %receipt_handle, "Message acknowledged in JetStream");
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let delivered = self
            .pending
            .write()
            .await
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        let delay = delay_seconds.map(|d| Duration::from_secs(d as u64));

        delivered
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| QueueError::Database(format!("NACK failed: {}", e)))?;

        debug!(
            receipt_handle = %receipt_handle,
            delay_seconds = ?delay_seconds,
            "Message NAKed in JetStream"
        );
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, _seconds: u32) -> Result<()> {
        let pending = self.pending.read().await;
        let delivered = pending
            .get(receipt_handle)
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        delivered
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| QueueError::Database(format!("Progress ack failed: {}", e)))?;

        debug!(receipt_handle = %receipt_handle, "Extended ack wait via JetStream in-progress ack");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(stream = %self.config.stream_name, "NATS JetStream consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        let pending_count = self.pending.read().await.len() as u64;
        Ok(Some(QueueMetrics {
            pending_messages: 0,
            in_flight_messages: pending_count,
            queue_identifier: self.config.stream_name.clone(),
            total_polled: 0,
            total_acked: 0,
            total_nacked: 0,
            total_deferred: 0,
        }))
    }
}

/// NATS JetStream publisher
pub struct NatsPublisher {
    config: NatsConfig,
    jetstream: Context,
}

impl NatsPublisher {
    pub async fn new(config: NatsConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Database(format!("NATS connection failed: {}", e)))?;
        let jetstream = jetstream::new(client);

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![config.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Database(format!("Failed to get/create stream: {}", e)))?;

        Ok(Self { config, jetstream })
    }

    pub async fn publish(&self, message: &Message) -> Result<String> {
        let body = serde_json::to_vec(message)?;
        let ack = self
            .jetstream
            .publish(self.config.subject.clone(), body.into())
            .await
            .map_err(|e| QueueError::Database(format!("Publish failed: {}", e)))?;

        ack.await
            .map_err(|e| QueueError::Database(format!("Publish ack failed: {}", e)))?;

        debug!(message_id = %message.id, subject = %self.config.subject, "Message published to JetStream");
        Ok(message.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.stream_name, "flowcatalyst");
        assert_eq!(config.ack_wait_seconds, 120);
    }
}
