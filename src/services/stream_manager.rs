//! Per-operation progress topics with bounded replay.
//!
//! # Ordering
//!
//! A topic accepts exactly `last + 1` and nothing after a completion message,
//! so the backlog is always a gapless run of sequences.
//!
//! # Backpressure
//!
//! Publishing never waits on subscribers. Each subscription is a forwarder
//! task reading the backlog from its own cursor into the connection's bounded
//! queue; when that queue is full the forwarder waits, not the producer. If
//! the cursor falls behind the start of the backlog (count or age eviction),
//! the subscriber gets `resyncRequired` and the subscription ends.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::ServerConfig,
    models::progress::{ProgressMessage, ProtocolError, ServerFrame},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub replay_buffer_messages: usize,
    pub replay_window: Duration,
    /// Capacity of each connection's outbound queue.
    pub connection_queue: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            replay_buffer_messages: 1_024,
            replay_window: Duration::from_secs(300),
            connection_queue: 256,
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

impl From<&ServerConfig> for StreamSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            replay_buffer_messages: config.replay_buffer_messages,
            replay_window: config.replay_window,
            connection_queue: config.connection_queue,
            heartbeat_interval: config.heartbeat_interval,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Result of reading a topic from a cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum Backlog {
    /// Messages after the cursor, possibly empty.
    Messages(Vec<ProgressMessage>),
    /// The message after the cursor was evicted; `earliest` is the oldest retained.
    Evicted { earliest: u64 },
    /// The cursor is past anything published; `last` is the newest sequence.
    Ahead { last: u64 },
    Unknown,
}

struct Topic {
    backlog: VecDeque<(Instant, ProgressMessage)>,
    last_sequence: u64,
    completed_at: Option<Instant>,
    tx: watch::Sender<u64>,
}

impl Topic {
    fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            backlog: VecDeque::new(),
            last_sequence: 0,
            completed_at: None,
            tx,
        }
    }

    fn earliest(&self) -> u64 {
        self.backlog
            .front()
            .map_or(self.last_sequence.saturating_add(1), |(_, message)| message.sequence)
    }

    fn evict(&mut self, max_messages: usize, window: Duration, now: Instant) {
        while self.backlog.len() > max_messages {
            self.backlog.pop_front();
        }
        while self
            .backlog
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > window)
        {
            self.backlog.pop_front();
        }
    }
}

pub struct StreamManager {
    settings: StreamSettings,
    topics: Mutex<HashMap<Uuid, Topic>>,
}

impl StreamManager {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings,
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<Uuid, Topic>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the topic ahead of the first message so early subscribers can wait on it.
    pub fn register(&self, operation_id: Uuid) {
        self.topics().entry(operation_id).or_insert_with(Topic::new);
    }

    /// Append a message to its operation's topic and wake subscribers.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::SequenceGap`] unless `sequence == last + 1`
    /// - [`ProtocolError::AlreadyCompleted`] after a completion message
    pub fn publish(&self, message: ProgressMessage) -> Result<(), ProtocolError> {
        let now = Instant::now();
        let mut topics = self.topics();
        let topic = topics.entry(message.operation_id).or_insert_with(Topic::new);

        if topic.completed_at.is_some() {
            return Err(ProtocolError::AlreadyCompleted(message.operation_id));
        }
        let expected = topic.last_sequence.saturating_add(1);
        if message.sequence != expected {
            return Err(ProtocolError::SequenceGap {
                operation_id: message.operation_id,
                expected,
                got: message.sequence,
            });
        }

        let sequence = message.sequence;
        if message.is_completion() {
            topic.completed_at = Some(now);
        }
        topic.backlog.push_back((now, message));
        topic.last_sequence = sequence;
        topic.evict(self.settings.replay_buffer_messages, self.settings.replay_window, now);
        topic.tx.send_replace(sequence);
        Ok(())
    }

    /// Everything after `after` that is still retained.
    ///
    /// `after` comes from clients and is never trusted: a cursor beyond the
    /// last published sequence yields [`Backlog::Ahead`].
    pub fn read_from(&self, operation_id: Uuid, after: u64) -> Backlog {
        let topics = self.topics();
        let Some(topic) = topics.get(&operation_id) else {
            return Backlog::Unknown;
        };

        if after > topic.last_sequence {
            return Backlog::Ahead {
                last: topic.last_sequence,
            };
        }
        let next = after.saturating_add(1);
        let earliest = topic.earliest();
        if next < earliest {
            return Backlog::Evicted { earliest };
        }
        let skip = usize::try_from(next - earliest).unwrap_or(usize::MAX);
        Backlog::Messages(
            topic
                .backlog
                .iter()
                .skip(skip)
                .map(|(_, message)| message.clone())
                .collect(),
        )
    }

    pub fn last_sequence(&self, operation_id: Uuid) -> Option<u64> {
        self.topics().get(&operation_id).map(|t| t.last_sequence)
    }

    fn watch(&self, operation_id: Uuid) -> Option<watch::Receiver<u64>> {
        self.topics().get(&operation_id).map(|t| t.tx.subscribe())
    }

    /// Start forwarding `operation_id` from `after + 1` into `out`.
    ///
    /// The first frame sent is `subscribed`, `resyncRequired` or `error`. The
    /// task ends after the completion message, on eviction, or when `out` closes.
    pub fn subscribe(
        self: &Arc<Self>,
        operation_id: Uuid,
        after: u64,
        out: mpsc::Sender<ServerFrame>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.forward(operation_id, after, out).await })
    }

    async fn forward(&self, operation_id: Uuid, mut cursor: u64, out: mpsc::Sender<ServerFrame>) {
        let Some(mut changes) = self.watch(operation_id) else {
            let _ = out
                .send(ServerFrame::Error {
                    message: format!("unknown operation {operation_id}"),
                })
                .await;
            return;
        };
        let mut announced = false;

        loop {
            changes.mark_unchanged();

            let messages = match self.read_from(operation_id, cursor) {
                Backlog::Messages(messages) => messages,
                Backlog::Evicted { earliest } => {
                    debug!(%operation_id, cursor, earliest, "subscriber fell behind backlog");
                    let _ = out
                        .send(ServerFrame::ResyncRequired {
                            operation_id,
                            earliest_sequence: earliest,
                        })
                        .await;
                    return;
                }
                Backlog::Ahead { last } => {
                    let _ = out
                        .send(ServerFrame::Error {
                            message: format!(
                                "afterSequence {cursor} is past the last sequence {last} of operation {operation_id}"
                            ),
                        })
                        .await;
                    return;
                }
                Backlog::Unknown => return,
            };

            if !announced {
                announced = true;
                let frame = ServerFrame::Subscribed {
                    operation_id,
                    next_sequence: cursor.saturating_add(1),
                };
                if out.send(frame).await.is_err() {
                    return;
                }
            }

            for message in messages {
                let done = message.is_completion();
                cursor = message.sequence;
                if out.send(ServerFrame::Progress(message)).await.is_err() {
                    return;
                }
                if done {
                    return;
                }
            }

            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    /// Evict aged backlog and drop topics whose completion is older than the
    /// replay window. Returns the number of topics dropped.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let window = self.settings.replay_window;
        let mut topics = self.topics();
        let before = topics.len();

        topics.retain(|_, topic| {
            topic.evict(self.settings.replay_buffer_messages, window, now);
            topic
                .completed_at
                .is_none_or(|at| now.duration_since(at) < window)
        });
        let dropped = before - topics.len();
        if dropped > 0 {
            debug!(dropped, "expired progress topics");
        }
        dropped
    }

    pub fn topic_count(&self) -> usize {
        self.topics().len()
    }
}

/// Publish, logging instead of failing. Used by producers that must not stop
/// on a protocol violation.
pub fn publish_or_warn(manager: &StreamManager, message: ProgressMessage) {
    let operation_id = message.operation_id;
    if let Err(err) = manager.publish(message) {
        warn!(%operation_id, error = %err, "progress message rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        operation::OperationStatus,
        progress::{CompletionPayload, MessageKind},
    };
    use serde_json::json;

    fn settings(buffer: usize) -> StreamSettings {
        StreamSettings {
            replay_buffer_messages: buffer,
            replay_window: Duration::from_secs(60),
            connection_queue: 16,
            heartbeat_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(15),
        }
    }

    fn info(id: Uuid, sequence: u64) -> ProgressMessage {
        ProgressMessage::new(id, sequence, MessageKind::Info, json!({ "n": sequence }))
    }

    fn completion(id: Uuid, sequence: u64) -> ProgressMessage {
        ProgressMessage::new(
            id,
            sequence,
            MessageKind::Completion,
            CompletionPayload {
                status: OperationStatus::Succeeded,
                result: None,
                error: None,
            }
            .into_payload(),
        )
    }

    async fn next_sequences(rx: &mut mpsc::Receiver<ServerFrame>, n: usize) -> Vec<u64> {
        let mut out = Vec::new();
        while out.len() < n {
            match rx.recv().await.unwrap() {
                ServerFrame::Progress(message) => out.push(message.sequence),
                ServerFrame::Subscribed { .. } => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }
        out
    }

    #[test]
    fn rejects_gaps_and_publishes_after_completion() {
        let streams = StreamManager::new(settings(10));
        let id = Uuid::new_v4();
        streams.publish(info(id, 1)).unwrap();

        assert!(matches!(
            streams.publish(info(id, 3)),
            Err(ProtocolError::SequenceGap { expected: 2, got: 3, .. })
        ));
        streams.publish(completion(id, 2)).unwrap();
        assert!(matches!(
            streams.publish(info(id, 3)),
            Err(ProtocolError::AlreadyCompleted(_))
        ));
    }

    #[test]
    fn backlog_is_bounded_by_count() {
        let streams = StreamManager::new(settings(3));
        let id = Uuid::new_v4();
        for seq in 1..=5 {
            streams.publish(info(id, seq)).unwrap();
        }

        assert_eq!(streams.read_from(id, 1), Backlog::Evicted { earliest: 3 });
        let Backlog::Messages(rest) = streams.read_from(id, 3) else {
            panic!("expected messages");
        };
        assert_eq!(rest.iter().map(|m| m.sequence).collect::<Vec<_>>(), [4, 5]);
        assert_eq!(streams.read_from(Uuid::new_v4(), 0), Backlog::Unknown);
    }

    #[tokio::test]
    async fn reconnect_replays_backlog_then_live() {
        let streams = Arc::new(StreamManager::new(settings(100)));
        let id = Uuid::new_v4();
        streams.register(id);

        let (tx, mut rx) = mpsc::channel(16);
        let first = streams.subscribe(id, 0, tx);
        streams.publish(info(id, 1)).unwrap();
        streams.publish(info(id, 2)).unwrap();
        assert_eq!(next_sequences(&mut rx, 2).await, [1, 2]);

        // Client drops the connection after seeing 2.
        first.abort();
        drop(rx);
        streams.publish(info(id, 3)).unwrap();
        streams.publish(info(id, 4)).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let _second = streams.subscribe(id, 2, tx);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerFrame::Subscribed { next_sequence: 3, .. }
        ));
        streams.publish(completion(id, 5)).unwrap();
        assert_eq!(next_sequences(&mut rx, 3).await, [3, 4, 5]);
        assert!(rx.recv().await.is_none(), "forwarder ends after completion");
    }

    #[tokio::test]
    async fn cursor_past_the_topic_is_an_error() {
        let streams = Arc::new(StreamManager::new(settings(10)));
        let id = Uuid::new_v4();
        streams.publish(info(id, 1)).unwrap();

        assert_eq!(streams.read_from(id, u64::MAX), Backlog::Ahead { last: 1 });
        assert_eq!(streams.read_from(id, 2), Backlog::Ahead { last: 1 });

        let (tx, mut rx) = mpsc::channel(4);
        let forwarder = streams.subscribe(id, u64::MAX, tx);
        assert!(matches!(rx.recv().await.unwrap(), ServerFrame::Error { .. }));
        assert!(rx.recv().await.is_none());
        forwarder.await.expect("forwarder must not panic");
    }

    #[tokio::test]
    async fn evicted_position_requires_resync() {
        let streams = Arc::new(StreamManager::new(settings(2)));
        let id = Uuid::new_v4();
        for seq in 1..=4 {
            streams.publish(info(id, seq)).unwrap();
        }

        let (tx, mut rx) = mpsc::channel(4);
        streams.subscribe(id, 0, tx);
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerFrame::ResyncRequired {
                operation_id: id,
                earliest_sequence: 3
            }
        );
    }

    #[tokio::test]
    async fn slow_subscriber_never_blocks_the_producer() {
        let streams = Arc::new(StreamManager::new(settings(4)));
        let id = Uuid::new_v4();
        streams.register(id);

        let (tx, mut rx) = mpsc::channel(1);
        streams.subscribe(id, 0, tx);
        for seq in 1..=20 {
            streams.publish(info(id, seq)).unwrap();
        }

        let mut saw_resync = false;
        while let Some(frame) = rx.recv().await {
            if let ServerFrame::ResyncRequired { earliest_sequence, .. } = frame {
                assert!(earliest_sequence > 1);
                saw_resync = true;
            }
        }
        assert!(saw_resync);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_topics_expire_after_window() {
        let streams = StreamManager::new(settings(10));
        let id = Uuid::new_v4();
        streams.publish(completion(id, 1)).unwrap();

        assert_eq!(streams.gc(), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(streams.gc(), 1);
        assert_eq!(streams.topic_count(), 0);
    }
}
