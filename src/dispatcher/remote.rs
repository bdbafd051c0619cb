//! Remote execution over the API server's HTTP and WebSocket endpoints.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::{StatusCode, header::RETRY_AFTER};
use serde::Deserialize;
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::{ClientConfig, ConfigError, Secret},
    error::AppError,
    execution::CancellationFlag,
    models::{
        command::{AcceptedResponse, CommandRequest, CommandResult, ValidationErrors},
        operation::{CommandKind, Operation},
        progress::{ClientFrame, ProgressMessage, ServerFrame},
    },
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    details: Option<ValidationErrors>,
}

/// How one stream session ended.
enum Relay {
    Completed(CommandResult),
    /// The server evicted our position; resume from `earliest`.
    Resync { earliest: u64 },
    /// The server refused the subscription.
    Refused(String),
    Disconnected,
}

/// Client for one API server.
#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base: Url,
    api_key: Secret<String>,
    request_timeout: Duration,
    read_timeout: Duration,
    idle_timeout: Duration,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
}

impl RemoteClient {
    /// # Errors
    ///
    /// [`AppError::Config`] when the server URL or API key is missing or invalid.
    pub fn new(config: &ClientConfig) -> Result<Self, AppError> {
        let url = config
            .server_url
            .as_deref()
            .ok_or(ConfigError::Missing("server_url"))?;
        let base = Url::parse(url).map_err(|e| ConfigError::InvalidUri {
            field: "server_url",
            reason: e.to_string(),
        })?;
        let api_key = config
            .api_key
            .clone()
            .ok_or(ConfigError::Missing("api_key"))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(anyhow::Error::from)?;

        Ok(Self {
            http,
            base,
            api_key,
            request_timeout: config.request_timeout,
            read_timeout: config.read_timeout,
            idle_timeout: config.idle_timeout,
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base
            .join(path)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("bad endpoint {path}: {e}")))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key.expose())
    }

    /// `POST /api/v1/<kind>`; returns the accepted operation id.
    ///
    /// # Errors
    ///
    /// The server's error mapped back onto [`AppError`], or a transport error.
    pub async fn submit(&self, kind: CommandKind, request: &CommandRequest) -> Result<Uuid, AppError> {
        let url = self.endpoint(&format!("api/v1/{kind}"))?;
        let response = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(error_from_response(response).await);
        }
        let accepted: AcceptedResponse = response.json().await.map_err(transport_error)?;
        info!(operation_id = %accepted.operation_id, %kind, "remote command accepted");
        Ok(accepted.operation_id)
    }

    /// `GET /api/v1/operations/{id}`
    ///
    /// # Errors
    ///
    /// As [`RemoteClient::submit`].
    pub async fn status(&self, id: Uuid) -> Result<Operation, AppError> {
        let url = self.endpoint(&format!("api/v1/operations/{id}"))?;
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response.json().await.map_err(transport_error)
    }

    /// `POST /api/v1/operations/{id}/cancel`
    ///
    /// # Errors
    ///
    /// As [`RemoteClient::submit`]; 409 maps to [`AppError::Remote`].
    pub async fn cancel(&self, id: Uuid) -> Result<Operation, AppError> {
        let url = self.endpoint(&format!("api/v1/operations/{id}/cancel"))?;
        let response = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response.json().await.map_err(transport_error)
    }

    fn stream_url(&self) -> Result<Url, AppError> {
        let mut url = self.endpoint("api/v1/stream")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| AppError::Internal(anyhow::anyhow!("cannot derive stream URL from {url}")))?;
        Ok(url)
    }

    async fn connect(&self) -> Result<Socket, AppError> {
        let mut request = self
            .stream_url()?
            .as_str()
            .into_client_request()
            .map_err(|e| AppError::Internal(e.into()))?;
        let header = HeaderValue::from_str(&self.bearer())
            .map_err(|e| AppError::Internal(e.into()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        match tokio::time::timeout(self.request_timeout, connect_async(request)).await {
            Ok(Ok((socket, _))) => Ok(socket),
            Ok(Err(err)) => Err(AppError::Remote {
                status: 502,
                code: "stream_unavailable".into(),
                message: err.to_string(),
            }),
            Err(_) => Err(AppError::Timeout("stream connect".into())),
        }
    }

    /// Relay an operation's progress into `progress` until it completes.
    ///
    /// Reconnects after a dropped stream with the last sequence seen, so the
    /// relayed sequence stays gapless. Duplicates and out-of-order messages are
    /// discarded. When the flag is set, the server is asked to cancel and the
    /// stream is followed to the resulting terminal state.
    ///
    /// # Errors
    ///
    /// [`AppError::Timeout`] when the stream cannot be re-established within
    /// the reconnect budget and the operation has not finished.
    pub async fn follow(
        &self,
        id: Uuid,
        kind: CommandKind,
        progress: mpsc::Sender<ProgressMessage>,
        cancel: CancellationFlag,
    ) -> Result<CommandResult, AppError> {
        let mut last_seen = 0u64;
        let mut failures = 0u32;
        let mut cancel_sent = false;

        loop {
            let outcome = match self.connect().await {
                Ok(socket) => {
                    let before = last_seen;
                    let outcome = self
                        .relay(socket, id, kind, &mut last_seen, &progress, &cancel, &mut cancel_sent)
                        .await;
                    if last_seen > before {
                        failures = 0;
                    }
                    outcome
                }
                Err(err) => {
                    debug!(operation_id = %id, error = %err, "stream connect failed");
                    Relay::Disconnected
                }
            };

            match outcome {
                Relay::Completed(result) => return Ok(result),
                Relay::Resync { earliest } => {
                    warn!(operation_id = %id, last_seen, earliest, "progress backlog evicted, resyncing");
                    let operation = self.status(id).await?;
                    if operation.status.is_terminal() {
                        return Ok(CommandResult::from(&operation));
                    }
                    last_seen = earliest.saturating_sub(1).max(last_seen);
                    // Repeated evictions share the reconnect budget and delay.
                    failures += 1;
                }
                Relay::Refused(message) => {
                    let operation = self.status(id).await?;
                    if operation.status.is_terminal() {
                        return Ok(CommandResult::from(&operation));
                    }
                    debug!(operation_id = %id, %message, "subscription refused");
                    failures += 1;
                }
                Relay::Disconnected => failures += 1,
            }

            if failures > self.reconnect_attempts {
                let operation = self.status(id).await?;
                if operation.status.is_terminal() {
                    return Ok(CommandResult::from(&operation));
                }
                return Err(AppError::Timeout(format!(
                    "progress stream for {id} lost after {failures} attempts"
                )));
            }
            if failures > 0 {
                info!(operation_id = %id, attempt = failures, last_seen, "reconnecting progress stream");
                tokio::time::sleep(self.reconnect_delay).await;
            }
        }
    }

    async fn relay(
        &self,
        mut socket: Socket,
        id: Uuid,
        kind: CommandKind,
        last_seen: &mut u64,
        progress: &mpsc::Sender<ProgressMessage>,
        cancel: &CancellationFlag,
        cancel_sent: &mut bool,
    ) -> Relay {
        let subscribe = ClientFrame::Subscribe {
            operation_id: id,
            after_sequence: (*last_seen > 0).then_some(*last_seen),
        };
        if socket.send(Message::Text(subscribe.encode())).await.is_err() {
            return Relay::Disconnected;
        }

        let mut last_frame = Instant::now();
        loop {
            if cancel.is_cancelled() && !*cancel_sent {
                *cancel_sent = true;
                match self.cancel(id).await {
                    Ok(op) => info!(operation_id = %id, status = %op.status, "remote cancellation requested"),
                    Err(err) => warn!(operation_id = %id, error = %err, "remote cancellation refused"),
                }
            }

            let frame = match tokio::time::timeout(self.read_timeout, socket.next()).await {
                Err(_) => {
                    if last_frame.elapsed() > self.idle_timeout {
                        debug!(operation_id = %id, "progress stream idle");
                        return Relay::Disconnected;
                    }
                    continue;
                }
                Ok(None | Some(Err(_))) => return Relay::Disconnected,
                Ok(Some(Ok(frame))) => frame,
            };
            last_frame = Instant::now();

            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => return Relay::Disconnected,
                _ => continue,
            };
            let frame = match ServerFrame::decode(&text) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(operation_id = %id, error = %err, "undecodable stream frame");
                    continue;
                }
            };

            match frame {
                ServerFrame::Progress(message) => {
                    if message.operation_id != id || message.sequence <= *last_seen {
                        continue;
                    }
                    if message.sequence != *last_seen + 1 {
                        warn!(
                            operation_id = %id,
                            expected = *last_seen + 1,
                            got = message.sequence,
                            "discarding out-of-order progress"
                        );
                        continue;
                    }
                    *last_seen = message.sequence;

                    let completion = message.completion();
                    let is_completion = message.is_completion();
                    // A consumer that dropped its stream still gets the outcome.
                    let _ = progress.send(message).await;

                    if is_completion {
                        let _ = socket.close(None).await;
                        return match completion {
                            Some(done) => Relay::Completed(CommandResult {
                                operation_id: id,
                                kind,
                                status: done.status,
                                result: done.result,
                                error: done.error,
                            }),
                            None => Relay::Refused("malformed completion payload".into()),
                        };
                    }
                }
                ServerFrame::Subscribed { next_sequence, .. } => {
                    debug!(operation_id = %id, next_sequence, "subscribed");
                }
                ServerFrame::ResyncRequired {
                    earliest_sequence, ..
                } => {
                    return Relay::Resync {
                        earliest: earliest_sequence,
                    };
                }
                ServerFrame::Error { message } => return Relay::Refused(message),
            }
        }
    }
}

fn transport_error(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::Timeout(err.to_string())
    } else {
        AppError::Remote {
            status: err.status().map_or(502, |s| s.as_u16()),
            code: "transport_error".into(),
            message: err.to_string(),
        }
    }
}

async fn error_from_response(response: reqwest::Response) -> AppError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let text = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(ErrorEnvelope { error }) => {
            AppError::from_remote(status, &error.code, error.message, retry_after, error.details)
        }
        Err(_) => AppError::Remote {
            status,
            code: "http_error".into(),
            message: text,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Profile,
        models::{command::ExecutionMode, operation::OperationStatus},
    };
    use axum::{
        Json, Router,
        extract::{
            State,
            ws::{Message as WsMessage, WebSocketUpgrade},
        },
        response::Response,
        routing::get,
    };
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::net::TcpListener;

    async fn always_evict(State(subscriptions): State<Arc<AtomicUsize>>, ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(move |mut socket| async move {
            if let Some(Ok(WsMessage::Text(text))) = socket.recv().await {
                if let Ok(ClientFrame::Subscribe { operation_id, .. }) = ClientFrame::decode(&text) {
                    subscriptions.fetch_add(1, Ordering::SeqCst);
                    let frame = ServerFrame::ResyncRequired {
                        operation_id,
                        earliest_sequence: 1,
                    };
                    let _ = socket.send(WsMessage::Text(frame.encode().into())).await;
                }
            }
        })
    }

    /// Server whose stream evicts every subscriber while the operation keeps running.
    async fn evicting_server(operation: Operation, subscriptions: Arc<AtomicUsize>) -> String {
        let app = Router::new()
            .route(
                "/api/v1/operations/{id}",
                get(move || {
                    let operation = operation.clone();
                    async move { Json(operation) }
                }),
            )
            .route("/api/v1/stream", get(always_evict))
            .with_state(subscriptions);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn repeated_resync_is_bounded_by_reconnect_attempts() {
        let mut operation = Operation::new(CommandKind::Scan, "acme");
        operation.transition(OperationStatus::Running).unwrap();
        let id = operation.id;
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let url = evicting_server(operation, Arc::clone(&subscriptions)).await;

        let mut config = ClientConfig::defaults(Profile::Dev);
        config.mode = ExecutionMode::Remote;
        config.server_url = Some(url);
        config.api_key = Some(Secret::new("sr_dev_token".into()));
        config.reconnect_attempts = 2;
        config.reconnect_delay = Duration::from_millis(10);
        let client = RemoteClient::new(&config).unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            client.follow(id, CommandKind::Scan, tx, CancellationFlag::new()),
        )
        .await
        .expect("follow must give up on its own");

        assert!(matches!(outcome, Err(AppError::Timeout(_))), "{outcome:?}");
        assert_eq!(subscriptions.load(Ordering::SeqCst), 3);
    }
}
