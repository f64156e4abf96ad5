//! Transport abstraction for the auth event stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// Backend-specific position used to acknowledge a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckToken {
    /// Redis Streams entry id, e.g. `1700000000000-0`.
    StreamEntry(String),
    /// Kafka partition offset of the message itself.
    Offset {
        topic: String,
        partition: i32,
        offset: i64,
    },
    /// Position in an in-process channel.
    Sequence(u64),
}

/// A message as delivered by the transport, before decoding.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub ack: AckToken,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(ack: AckToken, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            ack,
            payload: payload.into(),
        }
    }
}

/// Transport-level failures. Any of these ends the consumer loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("stream connection error: {0}")]
    Connection(String),

    #[error("stream read error: {0}")]
    Read(String),

    #[error("commit error: {0}")]
    Commit(String),

    #[error("stream ended")]
    Ended,
}

/// A durable, ordered source of raw auth event messages.
///
/// `recv` must be cancel-safe: the consumer races it against the shutdown
/// signal, and a dropped read must not lose a message that was already
/// handed out.
#[async_trait]
pub trait EventSource: Send {
    /// Next message. `Ok(None)` means the stream ended.
    async fn recv(&mut self) -> Result<Option<RawMessage>, StreamError>;

    /// Records `message` as processed for the consumer group.
    async fn commit(&mut self, message: &RawMessage) -> Result<(), StreamError>;

    /// Releases the connection. Called once, when the consumer stops.
    async fn close(&mut self);

    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

// =============================================================================
// In-process channel source
// =============================================================================

type ChannelItem = Result<Vec<u8>, StreamError>;

/// [`EventSource`] fed through a `tokio::sync::mpsc` channel.
///
/// The stream ends when every [`ChannelSourceHandle`] has ended or been
/// dropped.
pub struct ChannelEventSource {
    receiver: mpsc::Receiver<ChannelItem>,
    next_sequence: u64,
    commits: watch::Sender<u64>,
    closed: Arc<AtomicBool>,
}

/// Producer side of a [`ChannelEventSource`].
#[derive(Clone)]
pub struct ChannelSourceHandle {
    sender: Option<mpsc::Sender<ChannelItem>>,
    commits: watch::Receiver<u64>,
    closed: Arc<AtomicBool>,
}

impl ChannelEventSource {
    pub fn new(capacity: usize) -> (Self, ChannelSourceHandle) {
        let (sender, receiver) = mpsc::channel(capacity);
        let (commits_tx, commits_rx) = watch::channel(0);
        let closed = Arc::new(AtomicBool::new(false));

        let source = Self {
            receiver,
            next_sequence: 0,
            commits: commits_tx,
            closed: Arc::clone(&closed),
        };
        let handle = ChannelSourceHandle {
            sender: Some(sender),
            commits: commits_rx,
            closed,
        };
        (source, handle)
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn recv(&mut self) -> Result<Option<RawMessage>, StreamError> {
        match self.receiver.recv().await {
            Some(Ok(payload)) => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                Ok(Some(RawMessage::new(AckToken::Sequence(sequence), payload)))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn commit(&mut self, _message: &RawMessage) -> Result<(), StreamError> {
        self.commits.send_modify(|count| *count += 1);
        Ok(())
    }

    async fn close(&mut self) {
        self.receiver.close();
        self.closed.store(true, Ordering::SeqCst);
    }

    fn backend(&self) -> &'static str {
        "channel"
    }
}

impl ChannelSourceHandle {
    /// Queues a raw payload.
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), StreamError> {
        self.push(Ok(payload.into())).await
    }

    /// Queues a JSON value as a payload.
    pub async fn send_json(&self, value: &serde_json::Value) -> Result<(), StreamError> {
        self.send(value.to_string()).await
    }

    /// Queues a transport failure.
    pub async fn fail(&self, error: StreamError) -> Result<(), StreamError> {
        self.push(Err(error)).await
    }

    /// Drops this handle's sender. The stream ends once all clones did so.
    pub fn end(&mut self) {
        self.sender = None;
    }

    /// Number of messages committed so far.
    pub fn committed(&self) -> u64 {
        *self.commits.borrow()
    }

    /// Waits until at least `count` messages have been committed.
    pub async fn wait_for_commits(&mut self, count: u64) {
        let _ = self.commits.wait_for(|committed| *committed >= count).await;
    }

    /// Returns `true` once the consumer closed the source.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn push(&self, item: ChannelItem) -> Result<(), StreamError> {
        let sender = self.sender.as_ref().ok_or(StreamError::Ended)?;
        sender.send(item).await.map_err(|_| StreamError::Ended)
    }
}
