// src/lan/tunnel.rs - target-side TCP tunnels
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dial::connect_via_proxy;
use crate::protocol::{encode_base64, Frame};
use crate::transport::TransportHandle;

const READ_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub enum TunnelWrite {
    Data(Vec<u8>),
    End,
}

/// Inbound frames write through `tx`; `cancel` tears the whole tunnel down,
/// releasing both halves of the target socket.
#[derive(Debug)]
pub struct TunnelHandle {
    tx: mpsc::UnboundedSender<TunnelWrite>,
    cancel: CancellationToken,
}

pub type TunnelMap = Arc<Mutex<HashMap<String, TunnelHandle>>>;

pub fn new_tunnel_map() -> TunnelMap {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Dial `host:port` (directly, or with a CONNECT through the tunnel proxy)
/// and run the tunnel. Exactly one of `connect-ack` or `connect-error` goes
/// out before any `connect-data` for this id.
pub fn open(
    id: String,
    host: String,
    port: u16,
    transport: TransportHandle,
    tunnels: TunnelMap,
    tunnel_proxy: Option<String>,
    insecure: bool,
) {
    tokio::spawn(async move {
        match tunnel_proxy {
            Some(proxy) => match connect_via_proxy(&proxy, &host, port, insecure).await {
                Ok(stream) => run_tunnel(id, stream, transport, tunnels).await,
                Err(e) => {
                    warn!(id, host, port, error = %e, "Tunnel dial through proxy failed.");
                    transport.send(Frame::ConnectError { id, message: e.to_string() });
                }
            },
            None => match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => run_tunnel(id, stream, transport, tunnels).await,
                Err(e) => {
                    warn!(id, host, port, error = %e, "Tunnel dial failed.");
                    transport.send(Frame::ConnectError { id, message: e.to_string() });
                }
            },
        }
    });
}

async fn run_tunnel<S>(id: String, stream: S, transport: TransportHandle, tunnels: TunnelMap)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<TunnelWrite>();
    let cancel = CancellationToken::new();
    tunnels.lock().await.insert(
        id.clone(),
        TunnelHandle {
            tx,
            cancel: cancel.clone(),
        },
    );
    transport.send(Frame::ConnectAck { id: id.clone() });
    info!(id, "Tunnel open.");

    // inbound connect-data / connect-end land here via the tunnel map
    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                TunnelWrite::Data(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                TunnelWrite::End => {
                    let _ = writer.shutdown().await;
                }
            }
        }
    });

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(id, "Tunnel cancelled; releasing target socket.");
                break;
            }
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(id, "Target closed; ending tunnel.");
                    transport.send(Frame::ConnectEnd { id: id.clone() });
                    break;
                }
                Ok(n) => {
                    transport.send(Frame::ConnectData {
                        id: id.clone(),
                        data_base64: encode_base64(&buf[..n]),
                    });
                }
                Err(e) => {
                    debug!(id, error = %e, "Target read error; aborting tunnel.");
                    transport.send(Frame::ConnectError {
                        id: id.clone(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    }

    tunnels.lock().await.remove(&id);
    // dropping the write half with the reader closes the socket outright
    writer_task.abort();
}

/// Write decoded `connect-data` bytes into the tunnel's target socket.
pub async fn write(tunnels: &TunnelMap, id: &str, bytes: Vec<u8>) {
    let guard = tunnels.lock().await;
    match guard.get(id) {
        Some(handle) => {
            let _ = handle.tx.send(TunnelWrite::Data(bytes));
        }
        None => debug!(id, "Dropped data for unknown tunnel."),
    }
}

/// `connect-end` from the proxy side half-closes the target socket; the
/// target may keep sending until its own EOF.
pub async fn half_close(tunnels: &TunnelMap, id: &str) {
    let guard = tunnels.lock().await;
    if let Some(handle) = guard.get(id) {
        let _ = handle.tx.send(TunnelWrite::End);
    }
}

/// Transport loss: cancel every tunnel so both halves of each target socket
/// are released, not just the write side.
pub async fn close_all(tunnels: &TunnelMap) {
    let mut guard = tunnels.lock().await;
    if !guard.is_empty() {
        info!(count = guard.len(), "Closing all tunnels.");
    }
    for (_, handle) in guard.drain() {
        handle.cancel.cancel();
    }
}
