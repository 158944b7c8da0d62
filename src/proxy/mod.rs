// src/proxy/mod.rs - the local proxy engine
pub mod http;
pub mod tunnel;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::protocol::{decode_base64, Frame, Role};
use crate::transport::{self, TransportConfig, TransportEvent, TransportHandle};
use crate::BoxError;

use tunnel::TunnelMsg;

pub type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Frame>>>>;
pub type TunnelMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<TunnelMsg>>>>;

/// Shared state handed to every browser connection.
#[derive(Clone)]
pub struct ProxyContext {
    pub transport: TransportHandle,
    pub pending: PendingMap,
    pub tunnels: TunnelMap,
}

pub struct LocalProxy {
    config: ProxyConfig,
    listener: TcpListener,
}

impl LocalProxy {
    pub async fn bind(config: ProxyConfig) -> Result<Self, BoxError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, session = %config.proxy.session, "Local proxy listening.");
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BoxError> {
        let settings = &self.config.proxy;
        let (transport, events) = transport::spawn(
            TransportConfig {
                server_url: settings.server_url.clone(),
                session: settings.session.clone(),
                role: Role::Proxy,
                mode: settings.transport,
                proxy_url: settings.proxy_url.clone(),
                insecure: settings.insecure,
            },
            shutdown.clone(),
        );

        let ctx = ProxyContext {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            tunnels: Arc::new(Mutex::new(HashMap::new())),
        };

        let dispatch_ctx = ctx.clone();
        let dispatch = tokio::spawn(dispatch_loop(events, dispatch_ctx));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Local proxy shutting down.");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(peer = %peer, "Browser connection accepted.");
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = http::handle_connection(stream, ctx).await {
                            debug!(error = %e, "Browser connection error.");
                        }
                    });
                }
            }
        }

        dispatch.abort();
        Ok(())
    }
}

/// Route transport events into the pending-request and tunnel tables.
async fn dispatch_loop(mut events: mpsc::UnboundedReceiver<TransportEvent>, ctx: ProxyContext) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {
                debug!("Transport connected.");
            }
            TransportEvent::Disconnected => {
                fail_all(&ctx).await;
            }
            TransportEvent::Frame(frame) => dispatch_frame(frame, &ctx).await,
        }
    }
}

async fn dispatch_frame(frame: Frame, ctx: &ProxyContext) {
    match frame {
        Frame::HelloAck { session, .. } => {
            info!(session, "Registered with relay.");
        }
        frame @ Frame::HttpResponse { .. } => {
            let id = frame.id().unwrap_or_default().to_string();
            match ctx.pending.lock().await.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                // late responses (after the 30s timeout fired) land here
                None => debug!(id, "Discarded response with no pending request."),
            }
        }
        Frame::ConnectAck { id } => {
            send_tunnel(ctx, &id, TunnelMsg::Ack, false).await;
        }
        Frame::ConnectData { id, data_base64 } => match decode_base64(&data_base64) {
            Ok(bytes) => send_tunnel(ctx, &id, TunnelMsg::Data(bytes), false).await,
            Err(e) => warn!(id, error = %e, "Undecodable tunnel data."),
        },
        Frame::ConnectEnd { id } => {
            send_tunnel(ctx, &id, TunnelMsg::End, true).await;
        }
        Frame::ConnectError { id, message } => {
            send_tunnel(ctx, &id, TunnelMsg::Error(message), true).await;
        }
        Frame::Error { message } => {
            warn!(message, "Relay reported an error.");
        }
        other => {
            debug!(frame = ?other, "Ignoring unexpected frame.");
        }
    }
}

async fn send_tunnel(ctx: &ProxyContext, id: &str, message: TunnelMsg, terminal: bool) {
    let mut guard = ctx.tunnels.lock().await;
    match guard.get(id) {
        Some(tx) => {
            let _ = tx.send(message);
            if terminal {
                guard.remove(id);
            }
        }
        None => debug!(id, "Dropped message for unknown tunnel."),
    }
}

/// Transport loss: every pending request fails with a 502 and every tunnel
/// is torn down.
async fn fail_all(ctx: &ProxyContext) {
    let pending: Vec<_> = ctx.pending.lock().await.drain().collect();
    if !pending.is_empty() {
        warn!(count = pending.len(), "Failing pending requests: transport lost.");
    }
    // dropping the senders resolves each waiter into its 502
    drop(pending);

    let tunnels: Vec<_> = ctx.tunnels.lock().await.drain().collect();
    if !tunnels.is_empty() {
        warn!(count = tunnels.len(), "Ending tunnels: transport lost.");
    }
    for (_, tx) in tunnels {
        let _ = tx.send(TunnelMsg::Error("Server connection closed".to_string()));
    }
}
