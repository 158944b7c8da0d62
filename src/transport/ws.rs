// src/transport/ws.rs - persistent socket transport
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{Connector, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dial::{client_tls_config, connect_via_proxy};
use crate::protocol::{Frame, PROTOCOL_VERSION};
use crate::transport::{TransportConfig, TransportEvent, RETRY_DELAY};
use crate::BoxError;

pub enum WsEnd {
    /// The session never reached open (no `hello-ack` ever arrived); `auto`
    /// switches transports, carrying frames that were taken off the outbox
    /// but not delivered.
    NeverOpened { backlog: VecDeque<Frame> },
    Shutdown,
}

enum PumpEnd {
    Dropped,
    Shutdown,
}

pub async fn run(
    config: &TransportConfig,
    outbox: &mut mpsc::UnboundedReceiver<Frame>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    connected: &Arc<AtomicBool>,
    shutdown: &CancellationToken,
    fallback_on_initial_failure: bool,
) -> WsEnd {
    let url = ws_url_with_session(config);
    // Open means registered: a connection that dies before its hello-ack
    // does not count, no matter how far the upgrade got.
    let mut opened_once = false;
    // Frames that failed mid-send are retried after the next reconnect, ahead
    // of anything newer in the outbox.
    let mut backlog: VecDeque<Frame> = VecDeque::new();

    loop {
        if shutdown.is_cancelled() {
            return WsEnd::Shutdown;
        }

        let end = if let Some(proxy) = &config.proxy_url {
            match connect_proxied(config, &url, proxy).await {
                Ok(ws) => Some(
                    established(
                        ws,
                        config,
                        outbox,
                        events,
                        connected,
                        shutdown,
                        &mut backlog,
                        &mut opened_once,
                    )
                    .await,
                ),
                Err(e) => {
                    warn!(url = %url, error = %e, "Socket connect through proxy failed.");
                    None
                }
            }
        } else {
            match connect_direct(config, &url).await {
                Ok(ws) => Some(
                    established(
                        ws,
                        config,
                        outbox,
                        events,
                        connected,
                        shutdown,
                        &mut backlog,
                        &mut opened_once,
                    )
                    .await,
                ),
                Err(e) => {
                    warn!(url = %url, error = %e, "Socket connect failed.");
                    None
                }
            }
        };

        match end {
            Some(PumpEnd::Shutdown) => return WsEnd::Shutdown,
            Some(PumpEnd::Dropped) | None => {
                if !opened_once && fallback_on_initial_failure {
                    return WsEnd::NeverOpened {
                        backlog: std::mem::take(&mut backlog),
                    };
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return WsEnd::Shutdown,
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }
    }
}

async fn connect_direct(
    config: &TransportConfig,
    url: &str,
) -> Result<WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, BoxError> {
    if config.insecure && url.starts_with("wss://") {
        let connector = Connector::Rustls(Arc::new(client_tls_config(true)));
        let (ws, _) =
            tokio_tungstenite::connect_async_tls_with_config(url, None, false, Some(connector))
                .await?;
        Ok(ws)
    } else {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        Ok(ws)
    }
}

async fn connect_proxied(
    config: &TransportConfig,
    url: &str,
    proxy: &str,
) -> Result<WebSocketStream<tokio_tungstenite::MaybeTlsStream<crate::dial::ProxyStream>>, BoxError> {
    let (host, port) = server_host_port(&config.server_url)?;
    let stream = connect_via_proxy(proxy, &host, port, config.insecure).await?;
    let connector = Connector::Rustls(Arc::new(client_tls_config(config.insecure)));
    let (ws, _) =
        tokio_tungstenite::client_async_tls_with_config(url, stream, None, Some(connector)).await?;
    Ok(ws)
}

#[allow(clippy::too_many_arguments)]
async fn established<S>(
    ws: WebSocketStream<S>,
    config: &TransportConfig,
    outbox: &mut mpsc::UnboundedReceiver<Frame>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    connected: &Arc<AtomicBool>,
    shutdown: &CancellationToken,
    backlog: &mut VecDeque<Frame>,
    opened: &mut bool,
) -> PumpEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let hello = Frame::Hello {
        role: config.role,
        session: config.session.clone(),
        protocol_version: Some(PROTOCOL_VERSION),
    };
    if send_frame(&mut sink, &hello).await.is_err() {
        let _ = events.send(TransportEvent::Disconnected);
        return PumpEnd::Dropped;
    }

    connected.store(true, Ordering::Relaxed);
    let _ = events.send(TransportEvent::Connected);
    info!(session = %config.session, role = %config.role, "Connected to relay.");

    let end = 'pump: loop {
        // flush retried frames before consuming new ones
        while let Some(frame) = backlog.front() {
            if send_frame(&mut sink, frame).await.is_err() {
                break 'pump PumpEnd::Dropped;
            }
            backlog.pop_front();
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.close().await;
                break 'pump PumpEnd::Shutdown;
            }
            maybe_frame = outbox.recv() => match maybe_frame {
                Some(frame) => {
                    if send_frame(&mut sink, &frame).await.is_err() {
                        backlog.push_back(frame);
                        break 'pump PumpEnd::Dropped;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break 'pump PumpEnd::Shutdown;
                }
            },
            message = stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => match Frame::from_json(text.as_str()) {
                    Ok(frame) => {
                        if matches!(frame, Frame::HelloAck { .. }) {
                            *opened = true;
                        }
                        let _ = events.send(TransportEvent::Frame(frame));
                    }
                    Err(e) => warn!(error = %e, "Malformed frame from relay."),
                },
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = sink.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(reason = ?frame, "Relay closed the socket.");
                    break 'pump PumpEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Socket receive error.");
                    break 'pump PumpEnd::Dropped;
                }
                None => break 'pump PumpEnd::Dropped,
            }
        }
    };

    connected.store(false, Ordering::Relaxed);
    if matches!(end, PumpEnd::Dropped) {
        warn!(session = %config.session, role = %config.role, "Relay connection lost.");
        let _ = events.send(TransportEvent::Disconnected);
    }
    end
}

async fn send_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    frame: &Frame,
) -> Result<(), BoxError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let json = frame.to_json()?;
    sink.send(WsMessage::Text(json.into())).await?;
    Ok(())
}

fn ws_url_with_session(config: &TransportConfig) -> String {
    let session = utf8_percent_encode(&config.session, NON_ALPHANUMERIC);
    format!("{}/{}", config.server_url.trim_end_matches('/'), session)
}

/// Host and port of the relay, for CONNECT dialing through a proxy.
fn server_host_port(server_url: &str) -> Result<(String, u16), BoxError> {
    let (tls, rest) = if let Some(rest) = server_url.strip_prefix("wss://") {
        (true, rest)
    } else if let Some(rest) = server_url.strip_prefix("ws://") {
        (false, rest)
    } else {
        return Err(format!("unsupported server URL '{server_url}'").into());
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| format!("invalid port in server URL '{server_url}'"))?,
        )),
        None => Ok((authority.to_string(), if tls { 443 } else { 80 })),
    }
}
