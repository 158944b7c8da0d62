// src/transport/mod.rs - how a client role reaches the relay
pub mod http;
pub mod ws;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::TransportMode;
use crate::protocol::{Frame, Role};

/// Fixed backoff for reconnects and failed long-poll requests.
pub const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

/// What the engines observe from the transport.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Frame(Frame),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Normalized `ws(s)://` server URL, no session path.
    pub server_url: String,
    pub session: String,
    pub role: Role,
    pub mode: TransportMode,
    /// Server-reach proxy for both transports.
    pub proxy_url: Option<String>,
    pub insecure: bool,
}

/// Cheap clonable sender half. Frames sent while disconnected sit in the
/// outbox (the unbounded channel itself) and flush FIFO on (re)connect.
#[derive(Clone)]
pub struct TransportHandle {
    outbox: mpsc::UnboundedSender<Frame>,
    connected: Arc<AtomicBool>,
}

impl TransportHandle {
    pub fn send(&self, frame: Frame) {
        let _ = self.outbox.send(frame);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Spawn the transport task for one client role. Incoming frames and
/// connectivity changes arrive on the returned receiver.
pub fn spawn(
    config: TransportConfig,
    shutdown: CancellationToken,
) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));

    let handle = TransportHandle {
        outbox: outbox_tx,
        connected: connected.clone(),
    };
    tokio::spawn(run(config, outbox_rx, event_tx, connected, shutdown));
    (handle, event_rx)
}

async fn run(
    config: TransportConfig,
    mut outbox: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    match config.mode {
        TransportMode::Ws => {
            ws::run(&config, &mut outbox, &events, &connected, &shutdown, false).await;
        }
        TransportMode::Http => {
            http::run(
                &config,
                &mut outbox,
                &events,
                &connected,
                &shutdown,
                std::collections::VecDeque::new(),
            )
            .await;
        }
        TransportMode::Auto => {
            // One shot at the persistent socket; if the session never reaches
            // open (no hello-ack), switch to the stream transport for good,
            // keeping whatever the socket attempt failed to deliver.
            match ws::run(&config, &mut outbox, &events, &connected, &shutdown, true).await {
                ws::WsEnd::NeverOpened { backlog } => {
                    info!("Persistent socket unavailable; switching to stream transport.");
                    http::run(&config, &mut outbox, &events, &connected, &shutdown, backlog).await;
                }
                ws::WsEnd::Shutdown => {}
            }
        }
    }
}
