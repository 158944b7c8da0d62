// src/relay/ws.rs - persistent-socket handling on the relay
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role as WsRole};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{Frame, PROTOCOL_VERSION};
use crate::relay::state::{get_or_create_session, SocketHandle, SocketOut};
use crate::relay::util::{boxed_body, calculate_websocket_accept_key, ResponseBody};
use crate::relay::RelayContext;
use crate::BoxError;

/// Ping cadence per live socket; a socket silent for a full further interval
/// is terminated.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<TokioIo<Upgraded>>, WsMessage>;

/// Answer the upgrade handshake and hand the raw socket to the session loop.
pub async fn handle_socket_upgrade(
    req: Request<Incoming>,
    context: RelayContext,
) -> Result<Response<ResponseBody>, BoxError> {
    let ws_key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    if ws_key.is_empty() {
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(boxed_body("Missing Sec-WebSocket-Key"))?);
    }

    let accept_key = calculate_websocket_accept_key(ws_key);
    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Accept", accept_key)
        .body(boxed_body(""))?;

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = handle_connection(upgraded, context).await {
                    debug!(error = %e, "Relay socket connection ended with error.");
                }
            }
            Err(e) => {
                warn!(error = %e, "WebSocket upgrade failed.");
            }
        }
    });

    Ok(response)
}

async fn handle_connection(upgraded: Upgraded, context: RelayContext) -> Result<(), BoxError> {
    let ws_stream =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), WsRole::Server, None).await;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // The first frame must be a valid hello.
    let (role, session_name) = loop {
        match ws_receiver.next().await {
            Some(Ok(WsMessage::Text(text))) => match Frame::from_json(text.as_str()) {
                Ok(Frame::Hello { role, session, protocol_version }) => {
                    if let Some(version) = protocol_version {
                        if version != PROTOCOL_VERSION {
                            let message = format!(
                                "protocol version mismatch: client {version}, server {PROTOCOL_VERSION}"
                            );
                            return reject(&mut ws_sender, message).await;
                        }
                    }
                    break (role, session);
                }
                Ok(_) => return reject(&mut ws_sender, "expected hello".to_string()).await,
                Err(e) => return reject(&mut ws_sender, format!("malformed hello: {e}")).await,
            },
            Some(Ok(WsMessage::Ping(payload))) => {
                let _ = ws_sender.send(WsMessage::Pong(payload)).await;
            }
            Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    };

    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<SocketOut>();

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let result = match out {
                SocketOut::Frame(frame) => match frame.to_json() {
                    Ok(json) => ws_sender.send(WsMessage::Text(json.into())).await,
                    Err(e) => {
                        error!(error = %e, "Failed to serialize frame.");
                        continue;
                    }
                },
                SocketOut::Ping => ws_sender.send(WsMessage::Ping(Vec::new().into())).await,
                SocketOut::Pong(payload) => ws_sender.send(WsMessage::Pong(payload.into())).await,
                SocketOut::Close { reason } => {
                    let close = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(WsMessage::Close(Some(close))).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let session = get_or_create_session(&context.sessions, &session_name).await;
    {
        let mut state = session.lock().await;
        state.install_socket(role, SocketHandle { conn_id, tx: tx.clone() });
        let _ = tx.send(SocketOut::Frame(Frame::HelloAck {
            role,
            session: session_name.clone(),
            protocol_version: PROTOCOL_VERSION,
        }));
        state.drain_queue_to_socket(role);
    }
    info!(session = %session_name, %role, "Client registered.");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut alive = true;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if !alive {
                    warn!(session = %session_name, %role, "Heartbeat missed; terminating socket.");
                    let _ = tx.send(SocketOut::Close { reason: "heartbeat timeout".to_string() });
                    break;
                }
                alive = false;
                if tx.send(SocketOut::Ping).is_err() {
                    break;
                }
            }
            message = ws_receiver.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    alive = true;
                    match Frame::from_json(text.as_str()) {
                        Ok(Frame::Hello { .. }) => {
                            let _ = tx.send(SocketOut::Frame(Frame::Error {
                                message: "already registered".to_string(),
                            }));
                        }
                        Ok(frame) => {
                            let reply = session.lock().await.route_from(role, frame);
                            if let Some(error) = reply {
                                let _ = tx.send(SocketOut::Frame(error));
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(SocketOut::Frame(Frame::Error {
                                message: format!("malformed frame: {e}"),
                            }));
                        }
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    alive = true;
                    let _ = tx.send(SocketOut::Pong(payload.to_vec()));
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    alive = true;
                }
                Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %session_name, %role, error = %e, "Socket receive error.");
                    break;
                }
                None => break,
            }
        }
    }

    session.lock().await.socket_disconnected(role, conn_id);
    info!(session = %session_name, %role, "Client disconnected.");
    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Refuse a connection before it joins a session: one error frame, then close.
async fn reject(sender: &mut WsSink, message: String) -> Result<(), BoxError> {
    warn!(%message, "Rejecting socket during handshake.");
    if let Ok(json) = (Frame::Error { message }).to_json() {
        let _ = sender.send(WsMessage::Text(json.into())).await;
    }
    let _ = sender.close().await;
    Ok(())
}
