//! Live reading feed at `/api/ws`.
//!
//! Every reading change pushes the full current result set for the caller
//! (admins: the pending queue; tenants: their flat's readings). Settings
//! changes push the new settings.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Response,
};
use billing_core::{
    EventSubscriber, ReadingRepository, SettingsStore,
    domain::{
        events::{BillingEvent, READINGS_TOPIC, SETTINGS_TOPIC, flat_topic},
        reading::{Reading, ReadingFilter, ReadingStatus},
        settings::GlobalSettings,
    },
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::broadcast::{Receiver, error::RecvError},
    time::interval,
};
use tracing::{debug, error, info, warn};

use super::ApplicationError;
use super::middleware::{AuthenticatedUser, authenticate, bearer_token};
use crate::AppState;

const HEARTBEAT_SECONDS: u64 = 30;

/// Browsers cannot set headers on a WebSocket handshake, so the session
/// token may also travel as `/api/ws?token=...`.
#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

#[derive(Serialize)]
struct SnapshotFrame<'a> {
    r#type: &'static str,
    trigger: &'a str,
    readings: Vec<Reading>,
}

#[derive(Serialize)]
struct SettingsFrame {
    r#type: &'static str,
    settings: GlobalSettings,
}

#[derive(Serialize)]
struct HeartbeatFrame {
    r#type: &'static str,
    ts: String,
}

#[derive(Serialize)]
struct ErrorFrame {
    r#type: &'static str,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct PongFrame {
    r#type: &'static str,
    id: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Inbound {
    Ping { id: Option<String> },
    Refresh,
    #[serde(other)]
    Unknown,
}

/// Result set a connection is kept in sync with.
pub(crate) fn snapshot_filter(ctx: &AuthenticatedUser) -> ReadingFilter {
    if ctx.is_admin() {
        ReadingFilter {
            status: Some(ReadingStatus::Pending),
            ..ReadingFilter::default()
        }
    } else {
        ReadingFilter {
            flat_id: ctx.flat_id.clone(),
            ..ReadingFilter::default()
        }
    }
}

fn readings_topic(ctx: &AuthenticatedUser) -> Option<String> {
    if ctx.is_admin() {
        Some(READINGS_TOPIC.to_string())
    } else {
        ctx.flat_id.as_deref().map(flat_topic)
    }
}

// GET /api/ws
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApplicationError> {
    let token = bearer_token(&headers)
        .or(q.token)
        .ok_or_else(|| ApplicationError::Unauthorized("Missing session token".into()))?;
    let ctx = authenticate(&state, &token).await?;
    let topic = readings_topic(&ctx).ok_or_else(|| {
        ApplicationError::Forbidden("No flat is linked to this account".into())
    })?;

    // Subscribe before the upgrade so no change between handshake and first
    // snapshot is lost.
    let readings_rx = state.event_subscriber.subscribe(&topic);
    let settings_rx = state.event_subscriber.subscribe(SETTINGS_TOPIC);

    Ok(ws.on_upgrade(move |socket| {
        websocket_connection(socket, state, ctx, readings_rx, settings_rx)
    }))
}

async fn websocket_connection(
    socket: WebSocket,
    state: AppState,
    ctx: AuthenticatedUser,
    mut readings_rx: Receiver<BillingEvent>,
    mut settings_rx: Receiver<BillingEvent>,
) {
    let conn_id = uuid::Uuid::new_v4();
    info!(%conn_id, user_id = %ctx.user_id, role = %ctx.role, "WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    let filter = snapshot_filter(&ctx);

    if !send_snapshot(&mut sender, &state, &filter, "connected").await
        || !send_settings(&mut sender, &state).await
    {
        info!(%conn_id, "WebSocket closed before initial snapshot");
        return;
    }

    let mut heartbeat = interval(Duration::from_secs(HEARTBEAT_SECONDS));
    heartbeat.tick().await;

    loop {
        let delivered = tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(txt))) => match serde_json::from_str::<Inbound>(txt.as_str()) {
                    Ok(Inbound::Ping { id }) => {
                        send_frame(&mut sender, &PongFrame { r#type: "pong", id }).await
                    }
                    Ok(Inbound::Refresh) => {
                        send_snapshot(&mut sender, &state, &filter, "refresh").await
                    }
                    Ok(Inbound::Unknown) | Err(_) => {
                        send_error(&mut sender, "invalid_message", "Unrecognized message").await
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    send_error(&mut sender, "invalid_message", "Binary frames not supported").await
                }
                Some(Ok(Message::Ping(data))) => sender.send(Message::Pong(data)).await.is_ok(),
                Some(Ok(Message::Pong(_))) => true,
                Some(Ok(Message::Close(_))) | None => {
                    info!(%conn_id, "Client closed connection");
                    false
                }
                Some(Err(e)) => {
                    debug!(%conn_id, "WebSocket receive error: {}", e);
                    false
                }
            },
            event = readings_rx.recv() => match event {
                Ok(event) => send_snapshot(&mut sender, &state, &filter, event.event_type()).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%conn_id, skipped, "Reading feed lagged; resending snapshot");
                    send_snapshot(&mut sender, &state, &filter, "resync").await
                }
                Err(RecvError::Closed) => false,
            },
            event = settings_rx.recv() => match event {
                Ok(_) | Err(RecvError::Lagged(_)) => send_settings(&mut sender, &state).await,
                Err(RecvError::Closed) => false,
            },
            _ = heartbeat.tick() => {
                let frame = HeartbeatFrame {
                    r#type: "heartbeat",
                    ts: chrono::Utc::now().to_rfc3339(),
                };
                send_frame(&mut sender, &frame).await
            }
        };

        if !delivered {
            break;
        }
    }

    info!(%conn_id, "WebSocket connection terminated");
}

/// Returns false once the socket can no longer be written to.
async fn send_frame<T: Serialize>(sender: &mut SplitSink<WebSocket, Message>, frame: &T) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize WebSocket frame: {}", e);
            true
        }
    }
}

async fn send_error(
    sender: &mut SplitSink<WebSocket, Message>,
    code: &'static str,
    message: &str,
) -> bool {
    let frame = ErrorFrame {
        r#type: "error",
        code,
        message: message.to_string(),
    };
    send_frame(sender, &frame).await
}

async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    filter: &ReadingFilter,
    trigger: &str,
) -> bool {
    match state.readings.list_readings(filter).await {
        Ok(readings) => {
            let frame = SnapshotFrame {
                r#type: "snapshot",
                trigger,
                readings,
            };
            send_frame(sender, &frame).await
        }
        Err(e) => {
            error!("Failed to load readings for snapshot: {}", e);
            send_error(sender, "unavailable", "Readings are temporarily unavailable").await
        }
    }
}

async fn send_settings(sender: &mut SplitSink<WebSocket, Message>, state: &AppState) -> bool {
    match state.settings.current_settings().await {
        Ok(settings) => {
            let frame = SettingsFrame {
                r#type: "settings",
                settings,
            };
            send_frame(sender, &frame).await
        }
        Err(e) => {
            error!("Failed to load settings for WebSocket: {}", e);
            true
        }
    }
}
