//! Client <-> backend WebSocket bridging

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, RawQuery, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::BalancerState;
use crate::rooms::RoutingToken;
use crate::ws::protocol::ServerMsg;

use super::pool::{BackendLease, BackendPool, PoolError};

/// Default limit on opening the upstream leg
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// First try plus one retry on another backend
const MAX_ATTEMPTS: usize = 2;

type Upstream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Backend {url} did not answer within {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("Backend {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },
}

impl ProxyError {
    /// Wire code for the error frame sent to the client
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Pool(PoolError::Saturated) => "servers_busy",
            ProxyError::Pool(_) => "no_backend",
            ProxyError::Timeout { .. } | ProxyError::Unreachable { .. } => "backend_unavailable",
        }
    }

    fn client_message(&self) -> String {
        match self {
            ProxyError::Pool(PoolError::Saturated) => "All servers busy, try again shortly".to_string(),
            ProxyError::Pool(_) => "No game server available".to_string(),
            _ => "Game server unavailable".to_string(),
        }
    }
}

/// Query the front door looks at; everything else is passed through untouched
#[derive(Debug, Default, Deserialize)]
pub struct FrontDoorQuery {
    pub action: Option<String>,
    pub room: Option<String>,
}

impl FrontDoorQuery {
    /// Routing token for this connection and the query to forward upstream.
    ///
    /// A create without a room gets its token minted here, so the room is born on
    /// the backend that token hashes to and friends joining by it land there too.
    pub fn route(self, raw: Option<String>) -> (Option<String>, Option<String>) {
        if let Some(room) = self.room.filter(|r| !r.is_empty()) {
            return (Some(room), raw);
        }
        if self.action.as_deref() != Some("create") {
            return (None, raw);
        }

        let token = RoutingToken::generate().to_string();
        let forwarded = match raw.filter(|q| !q.is_empty()) {
            Some(query) => format!("{query}&room={token}"),
            None => format!("room={token}"),
        };
        (Some(token), Some(forwarded))
    }
}

/// WebSocket upgrade handler for the balancer's `/ws`
pub async fn ws_proxy_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<FrontDoorQuery>,
    RawQuery(raw): RawQuery,
    State(state): State<BalancerState>,
) -> Response {
    let (token, raw) = query.route(raw);
    let session = ProxySession::new(
        state.pool.clone(),
        token,
        raw,
        state.config.connect_timeout,
    );
    ws.on_upgrade(move |socket| session.run(socket))
}

/// Build the backend URL for a session: `<base>/ws?<client query>`
pub fn upstream_url(base: &str, raw_query: Option<&str>) -> String {
    let mut url = format!("{}/ws", base.trim_end_matches('/'));
    if let Some(query) = raw_query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// One client connection bridged to one backend connection
pub struct ProxySession {
    id: Uuid,
    pool: Arc<BackendPool>,
    token: Option<String>,
    raw_query: Option<String>,
    connect_timeout: Duration,
}

impl ProxySession {
    pub fn new(
        pool: Arc<BackendPool>,
        token: Option<String>,
        raw_query: Option<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pool,
            token,
            raw_query,
            connect_timeout,
        }
    }

    /// Connect upstream (retrying once elsewhere) and relay until either side ends
    pub async fn run(self, mut client: WebSocket) {
        info!(session = %self.id, room = ?self.token, "Proxy session opened");

        match self.open_upstream().await {
            Ok((lease, upstream)) => {
                let reason = self.relay(client, upstream, lease).await;
                info!(session = %self.id, reason, "Proxy session closed");
            }
            Err(e) => {
                warn!(session = %self.id, code = e.code(), "Proxy session failed: {}", e);
                let frame = ServerMsg::error(e.code(), e.client_message());
                if let Ok(json) = serde_json::to_string(&frame) {
                    let _ = client.send(Message::Text(json)).await;
                }
                let _ = client.send(Message::Close(None)).await;
            }
        }
    }

    async fn open_upstream(&self) -> Result<(BackendLease, Upstream), ProxyError> {
        let mut tried = Vec::with_capacity(MAX_ATTEMPTS);
        let mut last_error = None;

        for _ in 0..MAX_ATTEMPTS {
            let mut lease = match self.pool.pick_excluding(self.token.as_deref(), &tried) {
                Ok(lease) => lease,
                // A failed attempt explains the outcome better than "nothing left"
                Err(e) => return Err(last_error.unwrap_or(ProxyError::Pool(e))),
            };

            match self.connect(lease.url()).await {
                Ok(upstream) => {
                    self.pool.on_success(&mut lease);
                    debug!(session = %self.id, backend = %lease.url(), "Upstream connected");
                    return Ok((lease, upstream));
                }
                Err(e) => {
                    warn!(session = %self.id, backend = %lease.url(), "Upstream connect failed: {}", e);
                    self.pool.on_failure(&mut lease);
                    tried.push(lease.id());
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(ProxyError::Pool(PoolError::NoHealthyBackend)))
    }

    async fn connect(&self, base: &str) -> Result<Upstream, ProxyError> {
        let url = upstream_url(base, self.raw_query.as_deref());
        match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((upstream, _response))) => Ok(upstream),
            Ok(Err(e)) => Err(ProxyError::Unreachable {
                url,
                reason: e.to_string(),
            }),
            Err(_) => Err(ProxyError::Timeout {
                url,
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Pump frames both ways. Returns why the session ended.
    async fn relay(&self, client: WebSocket, upstream: Upstream, mut lease: BackendLease) -> &'static str {
        let (mut client_tx, mut client_rx) = client.split();
        let (mut upstream_tx, mut upstream_rx) = upstream.split();

        let reason = {
            let inbound = async {
                while let Some(frame) = client_rx.next().await {
                    let Ok(frame) = frame else {
                        return "client error";
                    };
                    match from_client(frame) {
                        Relay::Forward(msg) => {
                            if upstream_tx.send(msg).await.is_err() {
                                return "upstream write failed";
                            }
                        }
                        Relay::Skip => {}
                        Relay::Close => return "client closed",
                    }
                }
                "client closed"
            };

            let outbound = async {
                while let Some(frame) = upstream_rx.next().await {
                    let Ok(frame) = frame else {
                        return "upstream error";
                    };
                    match from_upstream(frame) {
                        Relay::Forward(msg) => {
                            if client_tx.send(msg).await.is_err() {
                                return "client write failed";
                            }
                        }
                        Relay::Skip => {}
                        Relay::Close => return "upstream closed",
                    }
                }
                "upstream closed"
            };

            tokio::select! {
                reason = inbound => reason,
                reason = outbound => reason,
                _ = lease.retired() => "backend retired",
            }
        };

        let _ = upstream_tx.close().await;
        let _ = client_tx.close().await;
        drop(lease);
        reason
    }
}

enum Relay<T> {
    Forward(T),
    Skip,
    Close,
}

/// Data frames cross over; control frames are handled by each leg itself
fn from_client(frame: Message) -> Relay<UpstreamMessage> {
    match frame {
        Message::Text(text) => Relay::Forward(UpstreamMessage::Text(text)),
        Message::Binary(data) => Relay::Forward(UpstreamMessage::Binary(data)),
        Message::Ping(_) | Message::Pong(_) => Relay::Skip,
        Message::Close(_) => Relay::Close,
    }
}

fn from_upstream(frame: UpstreamMessage) -> Relay<Message> {
    match frame {
        UpstreamMessage::Text(text) => Relay::Forward(Message::Text(text)),
        UpstreamMessage::Binary(data) => Relay::Forward(Message::Binary(data)),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => {
            Relay::Skip
        }
        UpstreamMessage::Close(_) => Relay::Close,
    }
}
