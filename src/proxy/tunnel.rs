// src/proxy/tunnel.rs - CONNECT tunneling on the browser side
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{encode_base64, Frame};
use crate::proxy::{ProxyContext, TunnelMap};
use crate::transport::TransportHandle;
use crate::BoxError;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Messages the dispatch loop feeds into one tunnel's writer.
#[derive(Debug)]
pub enum TunnelMsg {
    Ack,
    Data(Vec<u8>),
    End,
    Error(String),
}

/// Client bytes that arrived before the ack wait here; the flush on ack and
/// every later read serialize on this lock, which is what keeps byte order.
struct SendState {
    acked: bool,
    pre_ack: Vec<Vec<u8>>,
}

/// `CONNECT host:port` after the request head has been consumed. Any bytes
/// already buffered past the head are early client bytes.
pub async fn handle_connect(
    reader: BufReader<TcpStream>,
    target: &str,
    ctx: ProxyContext,
) -> Result<(), BoxError> {
    let Some((host, port)) = parse_target(target) else {
        let mut stream = reader.into_inner();
        let _ = stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\nconnection: close\r\n\r\n")
            .await;
        return Ok(());
    };

    if !ctx.transport.is_connected() {
        let mut stream = reader.into_inner();
        let _ = stream
            .write_all(b"HTTP/1.1 503 Service Unavailable\r\nconnection: close\r\n\r\n")
            .await;
        return Ok(());
    }

    let id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<TunnelMsg>();
    ctx.tunnels.lock().await.insert(id.clone(), tx);

    let head = reader.buffer().to_vec();
    let (read_half, mut write_half) = reader.into_inner().into_split();

    let send_state = Arc::new(Mutex::new(SendState {
        acked: false,
        pre_ack: Vec::new(),
    }));

    info!(id, host, port, head_bytes = head.len(), "CONNECT tunnel requested.");
    ctx.transport.send(Frame::ConnectStart {
        id: id.clone(),
        host,
        port,
    });

    let reader_task = tokio::spawn(client_reader(
        read_half,
        id.clone(),
        ctx.transport.clone(),
        ctx.tunnels.clone(),
        send_state.clone(),
    ));

    let mut head = Some(head);
    let mut acked = false;
    let mut full_close = false;

    while let Some(message) = rx.recv().await {
        match message {
            TunnelMsg::Ack => {
                if write_half
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .is_err()
                {
                    full_close = true;
                    break;
                }
                // Flush under the lock so a concurrent read cannot overtake
                // the backlog: head bytes first, then the pre-ack queue.
                {
                    let mut state = send_state.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(head) = head.take() {
                        if !head.is_empty() {
                            ctx.transport.send(Frame::ConnectData {
                                id: id.clone(),
                                data_base64: encode_base64(&head),
                            });
                        }
                    }
                    for chunk in state.pre_ack.drain(..) {
                        ctx.transport.send(Frame::ConnectData {
                            id: id.clone(),
                            data_base64: encode_base64(&chunk),
                        });
                    }
                    state.acked = true;
                }
                acked = true;
                debug!(id, "Tunnel established.");
            }
            TunnelMsg::Data(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    full_close = true;
                    break;
                }
            }
            TunnelMsg::End => {
                let _ = write_half.shutdown().await;
            }
            TunnelMsg::Error(message) => {
                // One-shot status: the 502 goes out only if the 200 never did.
                if !acked {
                    let response = format!(
                        "HTTP/1.1 502 Bad Gateway\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        message.len(),
                        message
                    );
                    let _ = write_half.write_all(response.as_bytes()).await;
                } else {
                    warn!(id, message, "Tunnel aborted.");
                }
                full_close = true;
                break;
            }
        }
    }

    ctx.tunnels.lock().await.remove(&id);
    if full_close {
        // drop the write half and stop reading: the client socket dies now
        reader_task.abort();
    }
    // otherwise the reader keeps draining client bytes until the client
    // closes, which is what sends the final connect-end
    Ok(())
}

/// Pump client bytes toward the relay. Before the ack they queue; after it
/// they go straight out. Client EOF or error sends `connect-end` and drops
/// the tunnel entry.
async fn client_reader(
    mut read_half: OwnedReadHalf,
    id: String,
    transport: TransportHandle,
    tunnels: TunnelMap,
    send_state: Arc<Mutex<SendState>>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                debug!(id, "Client closed; ending tunnel.");
                transport.send(Frame::ConnectEnd { id: id.clone() });
                tunnels.lock().await.remove(&id);
                break;
            }
            Ok(n) => {
                let bytes = buf[..n].to_vec();
                let mut state = send_state.lock().unwrap_or_else(|e| e.into_inner());
                if state.acked {
                    transport.send(Frame::ConnectData {
                        id: id.clone(),
                        data_base64: encode_base64(&bytes),
                    });
                } else {
                    state.pre_ack.push(bytes);
                }
            }
        }
    }
}

/// `host:port` from a CONNECT target, tolerating bracketed IPv6 literals.
fn parse_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
