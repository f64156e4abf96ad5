//! Kafka consumer-group source.

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{AckToken, EventSource, RawMessage, StreamError};
use crate::config::StreamConfig;

/// Reads the auth topic with auto-commit disabled; positions are committed
/// explicitly once a message was handled.
pub struct KafkaEventSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaEventSource {
    pub fn connect(config: &StreamConfig) -> Result<Self, StreamError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("client.id", config.resolved_consumer_name())
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        info!(
            topic = %config.topic,
            group = %config.group_id,
            bootstrap_servers = %config.bootstrap_servers,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
        })
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn recv(&mut self) -> Result<Option<RawMessage>, StreamError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| StreamError::Read(e.to_string()))?;

        let ack = AckToken::Offset {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };
        let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
        Ok(Some(RawMessage::new(ack, payload)))
    }

    async fn commit(&mut self, message: &RawMessage) -> Result<(), StreamError> {
        let AckToken::Offset {
            topic,
            partition,
            offset,
        } = &message.ack
        else {
            return Err(StreamError::Commit(format!(
                "unexpected ack token {:?}",
                message.ack
            )));
        };

        // The committed offset is the next one to read.
        let mut positions = TopicPartitionList::new();
        positions
            .add_partition_offset(topic, *partition, Offset::Offset(offset + 1))
            .map_err(|e| StreamError::Commit(e.to_string()))?;

        self.consumer
            .commit(&positions, CommitMode::Async)
            .map_err(|e| StreamError::Commit(e.to_string()))
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        debug!(topic = %self.topic, "Kafka consumer unsubscribed");
    }

    fn backend(&self) -> &'static str {
        "kafka"
    }
}
