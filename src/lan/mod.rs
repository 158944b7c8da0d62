// src/lan/mod.rs - the LAN agent engine
pub mod http_exec;
pub mod tunnel;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LanConfig;
use crate::protocol::{decode_base64, Frame, Role};
use crate::transport::{self, TransportConfig, TransportEvent, TransportHandle};
use crate::BoxError;

use http_exec::Executor;
use tunnel::TunnelMap;

pub struct LanAgent {
    config: LanConfig,
}

impl LanAgent {
    pub fn new(config: LanConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BoxError> {
        let settings = &self.config.lan;
        info!(
            session = %settings.session,
            server = %settings.server_url,
            transport = ?settings.transport,
            tunnel_proxy = ?settings.tunnel_proxy,
            "LAN agent starting."
        );

        let (transport, mut events) = transport::spawn(
            TransportConfig {
                server_url: settings.server_url.clone(),
                session: settings.session.clone(),
                role: Role::Lan,
                mode: settings.transport,
                proxy_url: settings.proxy_url.clone(),
                insecure: settings.insecure,
            },
            shutdown.clone(),
        );

        let executor = Executor::new(settings.insecure)?;
        let tunnels = tunnel::new_tunnel_map();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("LAN agent shutting down.");
                    break;
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Frame(frame)) => {
                        self.handle_frame(frame, &transport, &executor, &tunnels).await;
                    }
                    Some(TransportEvent::Connected) => {
                        debug!("Transport connected.");
                    }
                    Some(TransportEvent::Disconnected) => {
                        // outstanding tunnels die with the transport; the relay
                        // already told the proxy side
                        tunnel::close_all(&tunnels).await;
                    }
                    None => break,
                }
            }
        }

        tunnel::close_all(&tunnels).await;
        Ok(())
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        transport: &TransportHandle,
        executor: &Executor,
        tunnels: &TunnelMap,
    ) {
        match frame {
            Frame::HelloAck { session, .. } => {
                info!(session, "Registered with relay.");
            }
            Frame::HttpRequest { id, request } => {
                let executor = executor.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    let response = executor.execute(id, request).await;
                    transport.send(response);
                });
            }
            Frame::ConnectStart { id, host, port } => {
                tunnel::open(
                    id,
                    host,
                    port,
                    transport.clone(),
                    tunnels.clone(),
                    self.config.lan.tunnel_proxy.clone(),
                    self.config.lan.insecure,
                );
            }
            Frame::ConnectData { id, data_base64 } => match decode_base64(&data_base64) {
                Ok(bytes) => tunnel::write(tunnels, &id, bytes).await,
                Err(e) => warn!(id, error = %e, "Undecodable tunnel data."),
            },
            Frame::ConnectEnd { id } => {
                tunnel::half_close(tunnels, &id).await;
            }
            Frame::Error { message } => {
                warn!(message, "Relay reported an error.");
            }
            other => {
                debug!(frame = ?other, "Ignoring unexpected frame.");
            }
        }
    }
}
