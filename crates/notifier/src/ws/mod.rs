use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use chrono::Utc;
use pylon_common::protocol::ws::{WsMessage, CLOSE_IDLE_TIMEOUT, CLOSE_REPLACED};
use serde::Deserialize;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    auth::jwt::JwtAccessTokenService,
    error::{request_id_from_headers_or_generate, with_request_id_scope},
    metrics,
    presence::{LeaseRefresh, PresenceDirectory, PresenceRecord},
    registry::{ConnectionHandle, ConnectionRegistry, Outbound},
};

pub const HEARTBEAT_INTERVAL_MS: u32 = 30_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_FRAME_BYTES: u32 = 65_536;

/// A connection with no client frames for this long is closed with
/// `CLOSE_IDLE_TIMEOUT` and must reconnect.
const IDLE_CEILING_SECS: u64 = 60 * 60;

/// Heartbeat and idle timings for the socket loop. Production uses the
/// defaults; tests shrink them to drive the timeout paths.
#[derive(Debug, Clone, Copy)]
pub struct WsTimings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub idle_ceiling: Duration,
}

impl Default for WsTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(u64::from(HEARTBEAT_INTERVAL_MS)),
            heartbeat_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            idle_ceiling: Duration::from_secs(IDLE_CEILING_SECS),
        }
    }
}

#[derive(Clone)]
pub struct WsState {
    pub jwt_service: Arc<JwtAccessTokenService>,
    pub registry: ConnectionRegistry,
    pub presence: PresenceDirectory,
    pub instance_id: Uuid,
    pub fanout_channel: String,
    pub timings: WsTimings,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

/// Credentials ride in the query string because browser WebSocket clients
/// cannot set an Authorization header on the upgrade request. The token is
/// checked before the upgrade completes; a bad token still gets a proper
/// close frame (policy violation) rather than a rejected HTTP response, so
/// clients can distinguish auth failure from network failure.
async fn ws_upgrade(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let request_id = request_id_from_headers_or_generate(&headers);
    let authenticated = query
        .token
        .as_deref()
        .and_then(|token| state.jwt_service.validate_token(token).ok());

    ws.max_frame_size(MAX_FRAME_BYTES as usize).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, async move {
            match authenticated {
                Some(user_id) => handle_socket(state, user_id, socket).await,
                None => close_unauthorized(socket).await,
            }
        })
        .await;
    })
}

async fn close_unauthorized(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "invalid or missing token".into(),
        })))
        .await;
}

async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), axum::Error> {
    let encoded = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(encoded.into())).await
}

async fn handle_socket(state: WsState, user_id: Uuid, mut socket: WebSocket) {
    let connection_id = Uuid::new_v4();
    metrics::increment_ws_connected();
    metrics::connection_opened();

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Outbound>();
    if let Some(displaced) =
        state.registry.register(user_id, ConnectionHandle::new(connection_id, outbound_sender))
    {
        metrics::increment_ws_replaced();
        debug!(%user_id, displaced = %displaced.connection_id, "displacing previous socket");
        let _ = displaced.outbound.send(Outbound::Close {
            code: CLOSE_REPLACED,
            reason: "replaced by a newer connection".to_owned(),
        });
    }

    // A failed claim leaves the user reachable only through the offline
    // store for now; the heartbeat tick re-claims a missing lease while the
    // socket stays up.
    let record =
        PresenceRecord { instance_id: state.instance_id, channel: state.fanout_channel.clone() };
    if let Err(error) = state.presence.claim(user_id, &record).await {
        warn!(%user_id, %error, "failed to claim presence on connect");
    }

    let welcome = WsMessage::Welcome {
        user_id,
        server_time: Utc::now().to_rfc3339(),
        heartbeat_interval_ms: state.timings.heartbeat_interval.as_millis() as u32,
    };
    if send_ws_message(&mut socket, &welcome).await.is_err() {
        cleanup(&state, user_id, connection_id).await;
        return;
    }

    // Heartbeat: server pings every heartbeat_interval and disconnects if no
    // pong arrives within heartbeat_timeout of the ping.
    let mut heartbeat_interval = tokio::time::interval(state.timings.heartbeat_interval);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut pong_deadline: Option<Instant> = None;
    let mut last_activity = Instant::now();

    loop {
        let pong_wait = pong_deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_activity.elapsed() >= state.timings.idle_ceiling {
                    debug!(%user_id, "idle ceiling reached, closing");
                    let _ = socket.send(Message::Close(Some(CloseFrame {
                        code: CLOSE_IDLE_TIMEOUT,
                        reason: "idle timeout".into(),
                    }))).await;
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + state.timings.heartbeat_timeout);
                }
                match state.presence.refresh(user_id, state.instance_id).await {
                    Ok(LeaseRefresh::Extended | LeaseRefresh::NotOwner) => {}
                    Ok(LeaseRefresh::Missing) => {
                        // Lease expired (or the connect-time claim failed)
                        // while the socket is still live.
                        if let Err(error) = state.presence.claim(user_id, &record).await {
                            warn!(%user_id, %error, "failed to re-claim presence lease");
                        }
                    }
                    Err(error) => {
                        warn!(%user_id, %error, "failed to refresh presence lease");
                    }
                }
            }
            _ = tokio::time::sleep_until(pong_wait), if pong_deadline.is_some() => {
                warn!(%user_id, "heartbeat timeout, disconnecting");
                break;
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(Outbound::Frame(message)) => {
                        if send_ws_message(&mut socket, &message).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = socket.send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        }))).await;
                        break;
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(_) | Message::Binary(_) | Message::Ping(_)) => {
                        last_activity = Instant::now();
                    }
                    Ok(Message::Pong(_)) => {
                        pong_deadline = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                }
            }
        }
    }

    cleanup(&state, user_id, connection_id).await;
}

/// Presence is released only when this connection still owns the registry
/// entry. A displaced socket must leave the replacement's claim alone.
async fn cleanup(state: &WsState, user_id: Uuid, connection_id: Uuid) {
    metrics::connection_closed();
    let was_registered = state.registry.unregister(user_id, connection_id);
    if was_registered {
        if let Err(error) = state.presence.release(user_id, state.instance_id).await {
            warn!(%user_id, %error, "failed to release presence on disconnect");
        }
    }
}
