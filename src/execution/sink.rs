//! Handler-side progress emitter.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::models::progress::{CompletionPayload, MessageKind, ProgressMessage};

struct SinkState {
    next_sequence: u64,
    tx: Option<mpsc::Sender<ProgressMessage>>,
    completed: bool,
}

/// Assigns gapless sequence numbers and feeds a bounded channel.
///
/// Clones share one counter, so a handler can hand copies to sub-tasks and
/// the consumer still sees `1, 2, 3, …`. Sending waits while the channel is
/// full. If the consumer has gone away, messages are discarded and sequences
/// keep advancing.
#[derive(Clone)]
pub struct ProgressSink {
    operation_id: Uuid,
    state: Arc<Mutex<SinkState>>,
}

impl ProgressSink {
    /// Sink plus the receiving end of its channel.
    pub fn channel(operation_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<ProgressMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            operation_id,
            state: Arc::new(Mutex::new(SinkState {
                next_sequence: 1,
                tx: Some(tx),
                completed: false,
            })),
        };
        (sink, rx)
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    /// Emit one message. Returns its sequence, or `None` after completion.
    pub async fn emit(&self, kind: MessageKind, payload: Value) -> Option<u64> {
        let mut state = self.state.lock().await;
        if state.completed {
            return None;
        }
        if kind == MessageKind::Completion {
            state.completed = true;
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let message = ProgressMessage::new(self.operation_id, sequence, kind, payload);

        // The lock is held across the send so sequences hit the channel in order.
        let receiver_gone = match &state.tx {
            Some(tx) => tx.send(message).await.is_err(),
            None => false,
        };
        if receiver_gone {
            state.tx = None;
        }
        Some(sequence)
    }

    pub async fn info(&self, message: impl Into<String>) -> Option<u64> {
        self.emit(MessageKind::Info, json!({ "message": message.into() }))
            .await
    }

    pub async fn warning(&self, message: impl Into<String>) -> Option<u64> {
        self.emit(MessageKind::Warning, json!({ "message": message.into() }))
            .await
    }

    pub async fn error(&self, message: impl Into<String>) -> Option<u64> {
        self.emit(MessageKind::Error, json!({ "message": message.into() }))
            .await
    }

    /// Percent update, clamped to 100.
    pub async fn progress(&self, percent: u8, message: impl Into<String>) -> Option<u64> {
        self.emit(
            MessageKind::Progress,
            json!({ "percent": percent.min(100), "message": message.into() }),
        )
        .await
    }

    /// Emit the terminal message. Later emits are ignored.
    pub async fn complete(&self, outcome: CompletionPayload) -> Option<u64> {
        self.emit(MessageKind::Completion, outcome.into_payload()).await
    }

    /// Sequence of the most recent message, 0 if none.
    pub async fn last_sequence(&self) -> u64 {
        self.state.lock().await.next_sequence - 1
    }
}
