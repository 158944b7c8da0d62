// src/relay/mod.rs - the session multiplexer
pub mod api;
pub mod service;
pub mod state;
pub mod util;
pub mod ws;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::BoxError;
pub use service::RelayService;
pub use state::{new_session_map, SessionMap};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct RelayContext {
    pub sessions: SessionMap,
    pub config: ServerConfig,
}

pub struct RelayServer {
    listener: TcpListener,
    context: RelayContext,
}

impl RelayServer {
    pub async fn bind(config: ServerConfig) -> Result<Self, BoxError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, "Relay server listening.");
        Ok(Self {
            listener,
            context: RelayContext {
                sessions: new_session_map(),
                config,
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Relay server shutting down.");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(peer = %peer, "Connection accepted.");
                    let io = TokioIo::new(stream);
                    let service = RelayService::new(self.context.clone());
                    tokio::spawn(async move {
                        if let Err(e) = Builder::new(TokioExecutor::new())
                            .serve_connection_with_upgrades(io, TowerToHyperService::new(service))
                            .await
                        {
                            debug!(error = %e, "HTTP connection ended with error.");
                        }
                    });
                }
            }
        }
    }
}
