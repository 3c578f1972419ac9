//! Socket.IO transport server: answers the polling handshake, accepts the
//! duplex upgrade on `GET /socket.io/`, and runs one reader task plus one
//! heartbeat task per accepted connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{codes, ChatError};
use crate::handlers::{AppState, CLIENT_ID_KEY};
use crate::ids;
use crate::model::{Envelope, Message};
use crate::protocol::{
    self, EnginePacket, SocketPacket, PING_INTERVAL_MS, PING_TIMEOUT_MS,
};
use crate::registry::{ClientWriter, Outbound};

/// Application close code for an upgrade without a client identity.
pub const CLOSE_MISSING_CID: u16 = 4001;
/// Close code for a heartbeat timeout (going-away equivalent).
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 1001;

#[derive(Debug, Deserialize)]
pub struct SocketIoQuery {
    #[serde(rename = "EIO")]
    pub eio: Option<String>,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(rename = "cland-cid", default)]
    pub cland_cid: Option<String>,
}

/// `GET /socket.io/` — polling handshake or duplex upgrade.
pub async fn socketio_handler(
    State(state): State<AppState>,
    Query(query): Query<SocketIoQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if query.eio.as_deref() != Some("4") {
        return (StatusCode::BAD_REQUEST, "unsupported EIO version").into_response();
    }

    if query.transport.as_deref() == Some("polling") {
        // Handshake only; polling delivery is not supported.
        let body = protocol::encode_polling_handshake(ids::generate_transport_sid());
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
            body,
        )
            .into_response();
    }

    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "websocket upgrade required").into_response();
    };
    let client_id = query.cland_cid.clone().filter(|cid| !cid.is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, client_id, state))
}

async fn handle_socket(socket: WebSocket, client_id: Option<String>, state: AppState) {
    let (mut sink, stream) = socket.split();

    // No identity, no session: application close 4001 before anything is
    // registered.
    let Some(client_id) = client_id else {
        warn!("rejecting upgrade without {CLIENT_ID_KEY}");
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_MISSING_CID,
                reason: format!("missing {CLIENT_ID_KEY}").into(),
            })))
            .await;
        return;
    };

    let (writer, rx) = ClientWriter::channel();
    let write_task = tokio::spawn(run_writer(sink, rx));

    // First frame: the OPEN payload wrapped in an Engine.IO MESSAGE.
    let sid = ids::generate_transport_sid();
    if writer.send_frame(protocol::encode_duplex_open(sid.clone())).is_err() {
        write_task.abort();
        return;
    }

    if let Err(err) = state.registry.add(&client_id, writer.clone()) {
        error!(%client_id, %err, "failed to register connection");
        writer.close(CLOSE_MISSING_CID, "invalid client id");
        let _ = write_task.await;
        return;
    }
    info!(%client_id, %sid, "socket connected");

    let cancel = state.shutdown.child_token();
    let last_pong = Arc::new(RwLock::new(Instant::now()));
    let heartbeat_task = tokio::spawn(run_heartbeat(
        writer.clone(),
        last_pong.clone(),
        cancel.clone(),
    ));

    run_read_loop(stream, &client_id, &sid, &writer, &last_pong, &state, &cancel).await;

    // Cancel aborts in-flight persistence tied to this connection and stops
    // the heartbeat; removal is a no-op if a newer connection displaced us.
    cancel.cancel();
    state.registry.remove_if_current(&client_id, &writer);
    let _ = heartbeat_task.await;
    drop(writer);
    let _ = write_task.await;
    info!(%client_id, "socket disconnected");
}

/// Writer task: the single owner of the sink half. Frames queued by any
/// sender are written in order; a close request ends the task.
async fn run_writer(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                if sink.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Heartbeat task: PING every interval; a missing PONG by the next tick
/// (the 20 s deadline has long passed by then) closes the connection.
async fn run_heartbeat(
    writer: ClientWriter,
    last_pong: Arc<RwLock<Instant>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(PING_INTERVAL_MS));
    interval.tick().await;
    let mut last_ping: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        if let Some(ping_sent) = last_ping {
            let pong_seen = *last_pong.read().await;
            if pong_seen < ping_sent
                && ping_sent.elapsed() >= Duration::from_millis(PING_TIMEOUT_MS)
            {
                warn!("heartbeat timeout, closing connection");
                writer.close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
                cancel.cancel();
                return;
            }
        }

        if writer
            .send_frame(EnginePacket::Ping(String::new()).encode())
            .is_err()
        {
            return;
        }
        last_ping = Some(Instant::now());
    }
}

async fn run_read_loop(
    mut stream: SplitStream<WebSocket>,
    client_id: &str,
    sid: &str,
    writer: &ClientWriter,
    last_pong: &Arc<RwLock<Instant>>,
    state: &AppState,
    cancel: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = stream.next() => frame,
        };

        match frame {
            None => {
                info!(client_id, "socket closed by peer");
                return;
            }
            Some(Err(err)) => {
                error!(client_id, %err, "unexpected socket close");
                return;
            }
            Some(Ok(WsMessage::Text(text))) => {
                if handle_frame(&text, client_id, sid, writer, last_pong, state, cancel)
                    .await
                    .is_break()
                {
                    return;
                }
            }
            Some(Ok(WsMessage::Close(_))) => {
                info!(client_id, "close frame received");
                return;
            }
            Some(Ok(other)) => {
                debug!(client_id, "ignoring non-text frame: {other:?}");
            }
        }
    }
}

async fn handle_frame(
    text: &str,
    client_id: &str,
    sid: &str,
    writer: &ClientWriter,
    last_pong: &Arc<RwLock<Instant>>,
    state: &AppState,
    cancel: &CancellationToken,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    let packet = match EnginePacket::parse(text) {
        Ok(packet) => packet,
        Err(err) => {
            warn!(client_id, %err, "malformed engine.io frame");
            push_error(writer, &err);
            return ControlFlow::Continue(());
        }
    };

    match packet {
        EnginePacket::Ping(_) => {
            let _ = writer.send_frame(EnginePacket::Pong(String::new()).encode());
        }
        EnginePacket::Pong(_) => {
            *last_pong.write().await = Instant::now();
        }
        EnginePacket::Close(_) => {
            return ControlFlow::Break(());
        }
        EnginePacket::Message(payload) => {
            handle_socket_packet(&payload, client_id, sid, writer, state, cancel).await;
        }
        other => {
            debug!(client_id, "ignoring engine.io packet: {other:?}");
        }
    }
    ControlFlow::Continue(())
}

async fn handle_socket_packet(
    payload: &str,
    client_id: &str,
    sid: &str,
    writer: &ClientWriter,
    state: &AppState,
    cancel: &CancellationToken,
) {
    let packet = match SocketPacket::parse(payload) {
        Ok(packet) => packet,
        Err(err) => {
            warn!(client_id, %err, "bad socket.io sub-packet");
            push_error(writer, &err);
            return;
        }
    };

    match packet {
        SocketPacket::Connect { .. } => {
            debug!(client_id, "namespace connect");
            let _ = writer.send_frame(protocol::encode_connect_ack(sid));
        }
        SocketPacket::Event { event, mut args, .. } if event == crate::dispatch::EVENT_MESSAGE => {
            if args.is_empty() {
                push_error(
                    writer,
                    &ChatError::InvalidParameter("message event has no payload".into()),
                );
                return;
            }
            let message = match decode_message_arg(args.remove(0)) {
                Ok(message) => message,
                Err(err) => {
                    warn!(client_id, %err, "undecodable message payload");
                    push_error(writer, &err);
                    return;
                }
            };
            if let Err(err) = state.dispatcher.send(cancel, message).await {
                warn!(client_id, %err, "dispatch failed");
                push_error(writer, &err);
            }
        }
        other => {
            debug!(client_id, "ignoring socket.io packet: {other:?}");
        }
    }
}

/// The `"message"` event argument may be the Message object itself or a JSON
/// string containing it.
fn decode_message_arg(arg: serde_json::Value) -> Result<Message, ChatError> {
    let result = match arg {
        serde_json::Value::String(raw) => serde_json::from_str(&raw),
        other => serde_json::from_value(other),
    };
    result.map_err(|e| ChatError::BadSocketIoSubpacket(e.to_string()))
}

/// Protocol and dispatch errors are pushed as an `"error"` event; the
/// connection stays open.
fn push_error(writer: &ClientWriter, err: &ChatError) {
    let envelope = Envelope::error(error_code(err), err.to_string());
    let frame = protocol::encode_event("error", json!(envelope));
    let _ = writer.send_frame(frame);
}

fn error_code(err: &ChatError) -> i64 {
    match err {
        ChatError::Persistence(_) | ChatError::Cancelled => codes::SYSTEM_ERROR,
        _ => codes::CLIENT_ERROR,
    }
}
