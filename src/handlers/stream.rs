//! `GET /api/v1/stream`: progress over WebSocket.
//!
//! One connection can follow several operations. Every outbound frame goes
//! through a single bounded queue drained by one writer task, which also
//! sends heartbeat pings. Any inbound frame counts as liveness; a connection
//! silent for longer than the idle timeout is closed.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    models::progress::{ClientFrame, ServerFrame},
    server::AppState,
    services::stream_manager::StreamManager,
};

pub async fn stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let streams = Arc::clone(state.runner.streams());
    ws.on_upgrade(move |socket| serve_connection(socket, streams))
}

async fn serve_connection(socket: WebSocket, streams: Arc<StreamManager>) {
    let settings = *streams.settings();
    let (sink, source) = socket.split();
    let (tx, rx) = mpsc::channel(settings.connection_queue.max(1));
    let mut writer = tokio::spawn(write_frames(sink, rx, settings.heartbeat_interval));

    let subscriptions = read_frames(source, &streams, &tx, settings.idle_timeout).await;

    for (_, forwarder) in subscriptions {
        forwarder.abort();
    }
    drop(tx);
    // Let the writer flush what is queued, but not forever.
    if tokio::time::timeout(settings.heartbeat_interval, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    debug!("stream connection closed");
}

async fn read_frames(
    mut source: SplitStream<WebSocket>,
    streams: &Arc<StreamManager>,
    tx: &mpsc::Sender<ServerFrame>,
    idle_timeout: Duration,
) -> HashMap<Uuid, JoinHandle<()>> {
    let mut subscriptions: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    loop {
        let message = match tokio::time::timeout(idle_timeout, source.next()).await {
            Err(_) => {
                info!(?idle_timeout, "closing idle stream connection");
                break;
            }
            Ok(None | Some(Err(_))) => break,
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => match ClientFrame::decode(&text) {
                Ok(ClientFrame::Subscribe {
                    operation_id,
                    after_sequence,
                }) => {
                    debug!(%operation_id, ?after_sequence, "subscribe");
                    let forwarder =
                        streams.subscribe(operation_id, after_sequence.unwrap_or(0), tx.clone());
                    if let Some(previous) = subscriptions.insert(operation_id, forwarder) {
                        previous.abort();
                    }
                }
                Ok(ClientFrame::Unsubscribe { operation_id }) => {
                    if let Some(forwarder) = subscriptions.remove(&operation_id) {
                        forwarder.abort();
                    }
                }
                Err(err) => {
                    let frame = ServerFrame::Error {
                        message: format!("invalid frame: {err}"),
                    };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            },
            Message::Close(_) => break,
            // Pings, pongs and binary frames only refresh liveness.
            _ => {}
        }

        subscriptions.retain(|_, forwarder| !forwarder.is_finished());
    }

    subscriptions
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerFrame>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.encode().into())).await.is_err() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    return;
                }
            }
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
