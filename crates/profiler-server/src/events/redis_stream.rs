//! Redis Streams consumer-group source.
//!
//! The stream key is the configured topic and the consumer group gives the
//! durable position. On start the source reads in three phases:
//!
//! 1. entries this consumer received but never acknowledged (its own pending
//!    entries list),
//! 2. entries other consumers left pending for longer than `claim_idle_ms`,
//!    taken over with `XAUTOCLAIM`,
//! 3. new entries.
//!
//! A read interrupted by shutdown leaves its entries pending. They come back
//! on the next start under the same consumer name, or through phase 2 when
//! the name changed.

use std::collections::VecDeque;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use tracing::{debug, info};

use super::{AckToken, EventSource, RawMessage, StreamError};
use crate::config::StreamConfig;

/// Entry field holding the JSON payload.
pub const VALUE_FIELD: &str = "value";

/// Start position for a new group: the beginning of the stream.
const EARLIEST: &str = "0";
const NEW_ENTRIES: &str = ">";
/// `XAUTOCLAIM` cursor for the start of the pending list; also returned when
/// the scan is complete.
const CLAIM_START: &str = "0-0";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadPhase {
    OwnPending,
    Claiming { cursor: String },
    New,
}

pub struct RedisStreamSource {
    connection: Option<MultiplexedConnection>,
    stream_key: String,
    group: String,
    consumer: String,
    batch_size: usize,
    block_ms: usize,
    claim_idle_ms: u64,
    buffer: VecDeque<RawMessage>,
    phase: ReadPhase,
}

impl RedisStreamSource {
    /// Connects on a dedicated connection and creates the consumer group if
    /// it does not exist yet.
    ///
    /// Blocking reads would stall every other command on a shared
    /// connection, so this never borrows from the session store pool.
    pub async fn connect(redis_url: &str, config: &StreamConfig) -> Result<Self, StreamError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StreamError::Connection(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        let mut source = Self {
            connection: Some(connection),
            stream_key: config.topic.clone(),
            group: config.group_id.clone(),
            consumer: config.resolved_consumer_name(),
            batch_size: config.batch_size,
            block_ms: usize::try_from(config.block_ms).unwrap_or(usize::MAX),
            claim_idle_ms: config.claim_idle_ms,
            buffer: VecDeque::new(),
            phase: ReadPhase::OwnPending,
        };
        source.ensure_group().await?;

        info!(
            stream = %source.stream_key,
            group = %source.group,
            consumer = %source.consumer,
            "Joined Redis stream consumer group"
        );
        Ok(source)
    }

    /// Consumer name inside the group.
    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    fn connection(&mut self) -> Result<&mut MultiplexedConnection, StreamError> {
        self.connection.as_mut().ok_or(StreamError::Ended)
    }

    async fn ensure_group(&mut self) -> Result<(), StreamError> {
        let key = self.stream_key.clone();
        let group = self.group.clone();
        let created: redis::RedisResult<()> = self
            .connection()?
            .xgroup_create_mkstream(&key, &group, EARLIEST)
            .await;

        match created {
            Ok(()) => {
                info!(stream = %key, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(StreamError::Connection(e.to_string())),
        }
    }

    /// Reads the next batch into the buffer. May read nothing.
    async fn fill(&mut self) -> Result<(), StreamError> {
        match self.phase.clone() {
            ReadPhase::OwnPending => {
                let entries = self.read_group(EARLIEST).await?;
                if entries.is_empty() {
                    debug!(stream = %self.stream_key, "Own pending entries replayed");
                    self.phase = ReadPhase::Claiming {
                        cursor: CLAIM_START.to_string(),
                    };
                } else {
                    info!(
                        stream = %self.stream_key,
                        count = entries.len(),
                        "Replaying pending entries"
                    );
                }
                self.buffer.extend(entries.into_iter().map(into_raw_message));
            }
            ReadPhase::Claiming { cursor } => {
                let reply = self.claim_idle(&cursor).await?;
                if !reply.claimed.is_empty() {
                    info!(
                        stream = %self.stream_key,
                        count = reply.claimed.len(),
                        "Claimed entries left pending by other consumers"
                    );
                }
                self.phase = next_claim_phase(&reply.next_stream_id);
                if self.phase == ReadPhase::New {
                    debug!(stream = %self.stream_key, "Reading new entries");
                }
                self.buffer
                    .extend(reply.claimed.into_iter().map(into_raw_message));
            }
            ReadPhase::New => {
                let entries = self.read_group(NEW_ENTRIES).await?;
                self.buffer.extend(entries.into_iter().map(into_raw_message));
            }
        }
        Ok(())
    }

    /// `XREADGROUP` from `id`; only reads of new entries block.
    async fn read_group(&mut self, id: &str) -> Result<Vec<StreamId>, StreamError> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.batch_size);
        if id == NEW_ENTRIES {
            options = options.block(self.block_ms);
        }
        let key = self.stream_key.clone();

        let reply: Option<StreamReadReply> = self
            .connection()?
            .xread_options(&[&key], &[id], &options)
            .await
            .map_err(|e| StreamError::Read(e.to_string()))?;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|stream| stream.ids)
            .collect())
    }

    /// Moves up to one batch of entries idle for `claim_idle_ms` into this
    /// consumer's pending list.
    async fn claim_idle(&mut self, cursor: &str) -> Result<StreamAutoClaimReply, StreamError> {
        let key = self.stream_key.clone();
        let group = self.group.clone();
        let consumer = self.consumer.clone();
        let idle = self.claim_idle_ms;
        let options = StreamAutoClaimOptions::default().count(self.batch_size);

        self.connection()?
            .xautoclaim_options(&key, &group, &consumer, idle, cursor, options)
            .await
            .map_err(|e| StreamError::Read(e.to_string()))
    }
}

/// The claim scan is over once the server hands back the start cursor.
fn next_claim_phase(next_cursor: &str) -> ReadPhase {
    if next_cursor.is_empty() || next_cursor == CLAIM_START {
        ReadPhase::New
    } else {
        ReadPhase::Claiming {
            cursor: next_cursor.to_string(),
        }
    }
}

/// Converts a stream entry, leaving the payload empty when the value field
/// is missing so the consumer drops it as malformed.
fn into_raw_message(entry: StreamId) -> RawMessage {
    let payload: Vec<u8> = entry.get(VALUE_FIELD).unwrap_or_default();
    RawMessage::new(AckToken::StreamEntry(entry.id), payload)
}

#[async_trait]
impl EventSource for RedisStreamSource {
    async fn recv(&mut self) -> Result<Option<RawMessage>, StreamError> {
        loop {
            if let Some(message) = self.buffer.pop_front() {
                return Ok(Some(message));
            }
            self.fill().await?;
        }
    }

    async fn commit(&mut self, message: &RawMessage) -> Result<(), StreamError> {
        let AckToken::StreamEntry(id) = &message.ack else {
            return Err(StreamError::Commit(format!(
                "unexpected ack token {:?}",
                message.ack
            )));
        };
        let key = self.stream_key.clone();
        let group = self.group.clone();

        let _: i64 = self
            .connection()?
            .xack(&key, &group, &[id])
            .await
            .map_err(|e| StreamError::Commit(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) {
        self.buffer.clear();
        if self.connection.take().is_some() {
            debug!(
                stream = %self.stream_key,
                consumer = %self.consumer,
                "Redis stream connection released"
            );
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
