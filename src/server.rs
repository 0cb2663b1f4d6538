use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response as HttpResponse},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpListener, sync::mpsc::channel};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::rpc::dispatch::{Handler, HandlerTable};
use crate::rpc::jsonrpc::{is_valid_id, Request, Response, RpcError, INTERNAL_ERROR, PARSE_ERROR};
use crate::rpc::session::{handle_for, ConnectionHandle, ConnectionId, SessionRegistry};

/// Subprotocol every client must request during the WebSocket handshake.
pub const WEBSOCKET_PROTOCOL: &str = "streamdeck-obs";

/// Candidate listening ports, tried in order (cycling) until one binds.
pub const WEBSOCKET_PORTS: [u16; 7] = [28186, 39726, 34247, 42206, 38535, 40829, 40624];

const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);
const BIND_LOG_EVERY: u64 = 100;
const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Ports to try binding, in order. Port 0 asks the OS for an ephemeral
    /// port, which is mainly useful in tests.
    pub ports: Vec<u16>,
    /// Wall-clock budget for the whole bind-retry loop.
    pub bind_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ports: WEBSOCKET_PORTS.to_vec(),
            bind_timeout: Duration::from_secs(30),
        }
    }
}

/// WebSocket JSON-RPC server: accepts loopback connections, routes inbound
/// calls through the handler table, and delivers replies and notifications
/// for collaborators.
///
/// Lifecycle: construct, register handlers, wrap in an `Arc`, `start`, and
/// eventually `shutdown`. Registration borrows `&mut self`, so the handler
/// table is immutable by construction once the server is shared.
pub struct RemoteServer {
    config: ServerConfig,
    table: HandlerTable,
    sessions: Arc<SessionRegistry>,
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
    local_addr: OnceLock<SocketAddr>,
}

impl Default for RemoteServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl RemoteServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            table: HandlerTable::new(),
            sessions: Arc::new(SessionRegistry::new()),
            cancellation_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: OnceLock::new(),
        }
    }

    /// Register a fire-and-forget handler: it may return a fully-formed
    /// response, or `None` to send nothing.
    pub fn handle<F>(&mut self, method: &str, callback: F) -> Result<()>
    where
        F: Fn(&Request) -> Result<Option<Response>, RpcError> + Send + Sync + 'static,
    {
        self.table.register(method, Handler::FireAndForget(Box::new(callback)))
    }

    /// Register a synchronous handler: it fills in a response whose id is
    /// already copied from the request, and the reply is sent immediately.
    pub fn handle_sync<F>(&mut self, method: &str, callback: F) -> Result<()>
    where
        F: Fn(&Request, &mut Response) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.table.register(method, Handler::Sync(Box::new(callback)))
    }

    /// Register an asynchronous handler: it receives a weak connection
    /// handle and the request, and owns delivering the reply later via
    /// [`RemoteServer::reply`], from whatever thread it ends up on.
    pub fn handle_async<F>(&mut self, method: &str, callback: F) -> Result<()>
    where
        F: Fn(ConnectionHandle, Request) + Send + Sync + 'static,
    {
        self.table.register(method, Handler::Async(Box::new(callback)))
    }

    /// Bind a listener and start accepting connections. Returns the bound
    /// address, or `None` when no candidate port could be bound within the
    /// budget. The server simply isn't listening in that case; nothing
    /// panics and no error is returned to the caller.
    pub async fn start(self: &Arc<Self>) -> Option<SocketAddr> {
        let listener = self.bind_with_retry().await?;
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "could not read listener address");
                return None;
            }
        };
        let _ = self.local_addr.set(addr);
        info!(%addr, "listening for remote-control connections");

        let app = Router::new()
            .route("/", get(handle_socket_upgrade))
            .with_state(self.clone());
        let token = self.cancellation_token.clone();
        self.tracker.spawn(async move {
            let serve = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    token.cancelled().await;
                    debug!("listener stopping: shutdown requested");
                });
            if let Err(e) = serve.await {
                error!(error = %e, "websocket listener terminated abnormally");
            }
        });

        Some(addr)
    }

    async fn bind_with_retry(&self) -> Option<TcpListener> {
        if self.config.ports.is_empty() {
            error!("no candidate ports configured");
            return None;
        }

        let deadline = tokio::time::Instant::now() + self.config.bind_timeout;
        let mut attempts: u64 = 0;
        let mut index = 0;
        loop {
            let port = self.config.ports[index];
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => return Some(listener),
                Err(e) => {
                    attempts += 1;
                    if attempts == 1 || attempts % BIND_LOG_EVERY == 0 {
                        warn!(attempt = attempts, port, error = %e, "failed to bind candidate port");
                    }
                }
            }
            index = (index + 1) % self.config.ports.len();

            if tokio::time::Instant::now() + BIND_RETRY_DELAY >= deadline {
                error!(
                    attempts,
                    "giving up on listening after {:?}; remote control is unavailable",
                    self.config.bind_timeout
                );
                return None;
            }
            tokio::select! {
                _ = tokio::time::sleep(BIND_RETRY_DELAY) => {}
                _ = self.cancellation_token.cancelled() => {
                    debug!("bind retry abandoned: shutdown requested");
                    return None;
                }
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        self.local_addr.get().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Aggregate of the versions connected peers reported via the
    /// `version` handshake.
    pub fn remote_version_string(&self) -> String {
        self.sessions.remote_version_string()
    }

    /// Broadcast a notification (a request with no id) to every live
    /// connection. Serialized once; connections that close mid-broadcast
    /// are skipped. Safe to call from any thread, including with zero
    /// connections.
    pub fn notify(&self, method: &str, params: Option<Value>) {
        let mut request = Request::new(method);
        if let Some(params) = params {
            request.set_params(params);
        }
        let text = request.to_value().to_string();
        let delivered = self.sessions.broadcast_text(&text);
        debug!(method, delivered, "notify");
    }

    /// Deliver a deferred reply to the connection behind `handle`. If that
    /// connection has closed in the meantime the reply is dropped
    /// silently, which is the expected outcome for a peer that
    /// disconnected while an asynchronous handler was still working.
    pub fn reply(&self, handle: &ConnectionHandle, response: Response) {
        let doc = self.compile_or_internal_error(response);
        if !handle.send_text(doc.to_string()) {
            debug!(id = ?handle.id(), "reply dropped, connection is gone");
        }
    }

    /// Stop accepting, close every open connection with a "going away"
    /// status, and wait for all connection tasks to finish. No handler
    /// callback runs after this returns.
    pub async fn shutdown(&self) {
        debug!("shutting down websocket handler");
        self.cancellation_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut recv_stream) = socket.split();
        let (send, mut recv) = channel::<Message>(OUTBOUND_QUEUE_DEPTH);
        let id = self.sessions.insert(send.clone());
        debug!(?id, "client connected");

        let writer = tokio::spawn(async move {
            while let Some(msg) = recv.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                msg = recv_stream.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(other)) => {
                            warn!(?id, frame = ?other, "ignoring non-text frame");
                            continue;
                        }
                        Some(Err(_)) => {
                            // The stream will complain about things like
                            // connections being lost without handshake.
                            continue;
                        }
                    };
                    if let Some(output) = self.handle_frame(id, &text) {
                        if send.send(Message::Text(output)).await.is_err() {
                            break;
                        }
                    }
                }
                _ = self.cancellation_token.cancelled() => {
                    let _ = send
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "Shutting down.".into(),
                        })))
                        .await;
                    break;
                }
            }
        }

        self.sessions.remove(id);
        drop(send);
        let _ = writer.await;
        debug!(?id, "client disconnected");
    }

    pub(crate) fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Process one inbound text frame and produce the outbound frame, if
    /// any. A JSON array is a batch: every element is dispatched
    /// independently and the replies (in input order) are answered as one
    /// array; a batch that yields no replies sends nothing.
    pub(crate) fn handle_frame(&self, id: ConnectionId, text: &str) -> Option<String> {
        let doc: Value = match serde_json::from_str(text) {
            Ok(doc) => doc,
            Err(e) => {
                debug!(?id, error = %e, "frame is not valid JSON");
                let mut response = Response::new();
                response.set_id(Value::Null);
                response.set_error(PARSE_ERROR, format!("invalid JSON: {}", e));
                return response.compile().ok().map(|doc| doc.to_string());
            }
        };

        match doc {
            Value::Array(entries) => {
                let replies: Vec<Value> = entries
                    .iter()
                    .filter_map(|entry| self.handle_call(id, entry))
                    .collect();
                if replies.is_empty() {
                    None
                } else {
                    Some(Value::Array(replies).to_string())
                }
            }
            doc => self.handle_call(id, &doc).map(|doc| doc.to_string()),
        }
    }

    /// Dispatch a single call document. Returns the compiled response, or
    /// `None` when no reply is owed: notifications, fire-and-forget
    /// silence, and calls an asynchronous handler took ownership of.
    fn handle_call(&self, id: ConnectionId, doc: &Value) -> Option<Value> {
        // Objects without an id key are notifications and are never
        // answered, not even on failure. Anything else is answered with a
        // null id when no usable id exists, including an id whose type the
        // protocol rejects: an undeterminable id must be answered as null,
        // never echoed.
        let call_id = match doc {
            Value::Object(obj) => obj.get("id").cloned().map(|id| {
                if is_valid_id(&id) {
                    id
                } else {
                    Value::Null
                }
            }),
            _ => Some(Value::Null),
        };

        let handle = handle_for(&self.sessions, id);
        let outcome = Request::from_value(doc)
            .map(|request| request.with_client(handle.clone()))
            .and_then(|request| self.table.dispatch(handle, &request));

        let mut response = match outcome {
            Ok(Some(response)) => response,
            Ok(None) => return None,
            Err(e) => {
                let mut response = Response::new();
                response.set_rpc_error(&e);
                response
            }
        };

        let call_id = call_id?;
        if !response.has_id() {
            response.set_id(call_id);
        }
        Some(self.compile_or_internal_error(response))
    }

    /// Final validation pass before anything goes on the wire. A response
    /// that fails it is replaced wholesale with a generic internal error
    /// rather than leaving a malformed frame on the wire.
    fn compile_or_internal_error(&self, response: Response) -> Value {
        match response.compile() {
            Ok(doc) => doc,
            Err(e) => {
                error!(error = %e, "constructed response failed validation");
                let mut fallback = Response::new();
                fallback.set_id(
                    response
                        .id()
                        .cloned()
                        .filter(|id| is_valid_id(id))
                        .unwrap_or(Value::Null),
                );
                fallback.set_error(INTERNAL_ERROR, e.message());
                fallback.compile().unwrap_or(Value::Null)
            }
        }
    }
}

async fn handle_socket_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(server): State<Arc<RemoteServer>>,
) -> HttpResponse {
    if !requests_subprotocol(&headers, WEBSOCKET_PROTOCOL) {
        warn!("rejecting connection that did not request the '{}' subprotocol", WEBSOCKET_PROTOCOL);
        return (
            StatusCode::BAD_REQUEST,
            format!("subprotocol '{}' is required", WEBSOCKET_PROTOCOL),
        )
            .into_response();
    }

    ws.protocols([WEBSOCKET_PROTOCOL])
        .on_upgrade(move |socket| server.handle_socket(socket))
        .into_response()
}

fn requests_subprotocol(headers: &HeaderMap, required: &str) -> bool {
    headers
        .get_all("sec-websocket-protocol")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == required)
}
