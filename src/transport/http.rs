// src/transport/http.rs - long-poll / chunked-stream fallback transport
use futures_util::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{Frame, PROTOCOL_VERSION};
use crate::transport::{TransportConfig, TransportEvent, RETRY_DELAY};
use crate::BoxError;

/// Outbound frames are coalesced for up to this long before a POST.
pub const BATCH_WINDOW: Duration = Duration::from_millis(15);
pub const MAX_BATCH_FRAMES: usize = 64;
pub const MAX_BATCH_BYTES: usize = 32 * 1024;

pub async fn run(
    config: &TransportConfig,
    outbox: &mut mpsc::UnboundedReceiver<Frame>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    connected: &Arc<AtomicBool>,
    shutdown: &CancellationToken,
    carried: VecDeque<Frame>,
) {
    let client = match build_client(config) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to build HTTP transport client.");
            return;
        }
    };

    let base = crate::config::http_base_from_ws(&config.server_url);
    let session = utf8_percent_encode(&config.session, NON_ALPHANUMERIC).to_string();
    let send_url = format!("{base}/api/send/{session}?role={}", config.role);
    let stream_url = format!("{base}/api/stream/{session}?role={}", config.role);

    // The stream transport has no single connection to lose: sends retry
    // forever, so the role counts as connected for its whole lifetime.
    connected.store(true, Ordering::Relaxed);
    let _ = events.send(TransportEvent::Connected);
    info!(session = %config.session, role = %config.role, "Using stream transport.");

    let stream_task = tokio::spawn(consume_stream(
        client.clone(),
        stream_url,
        events.clone(),
        shutdown.clone(),
    ));

    // hello goes out first, then anything a failed socket attempt left behind
    let mut backlog: VecDeque<Frame> = VecDeque::new();
    backlog.push_back(Frame::Hello {
        role: config.role,
        session: config.session.clone(),
        protocol_version: Some(PROTOCOL_VERSION),
    });
    backlog.extend(carried);

    loop {
        if backlog.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                maybe_frame = outbox.recv() => match maybe_frame {
                    Some(frame) => backlog.push_back(frame),
                    None => break,
                },
            }
        }

        // coalesce whatever else shows up inside the batch window
        let deadline = tokio::time::Instant::now() + BATCH_WINDOW;
        while backlog.len() < MAX_BATCH_FRAMES {
            match tokio::time::timeout_at(deadline, outbox.recv()).await {
                Ok(Some(frame)) => backlog.push_back(frame),
                Ok(None) | Err(_) => break,
            }
        }

        let batch = take_batch(&mut backlog);
        let body = serde_json::json!({ "role": config.role, "message": &batch });
        match client.post(&send_url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                trace!(frames = batch.len(), "Batch posted.");
            }
            Ok(response) => {
                warn!(status = %response.status(), "Send endpoint refused batch; retrying.");
                unshift(&mut backlog, batch);
                if !sleep_or_shutdown(shutdown).await {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Batch POST failed; retrying.");
                unshift(&mut backlog, batch);
                if !sleep_or_shutdown(shutdown).await {
                    break;
                }
            }
        }
    }

    stream_task.abort();
    connected.store(false, Ordering::Relaxed);
}

/// Pop up to 64 frames / 32 KiB (serialized) off the front of the backlog.
fn take_batch(backlog: &mut VecDeque<Frame>) -> Vec<Frame> {
    let mut batch = Vec::new();
    let mut bytes = 0usize;
    while batch.len() < MAX_BATCH_FRAMES {
        let len = match backlog.front() {
            Some(frame) => serde_json::to_string(frame).map(|s| s.len()).unwrap_or(0),
            None => break,
        };
        if !batch.is_empty() && bytes + len > MAX_BATCH_BYTES {
            break;
        }
        bytes += len;
        if let Some(frame) = backlog.pop_front() {
            batch.push(frame);
        }
    }
    batch
}

/// Put a failed batch back ahead of everything newer.
fn unshift(backlog: &mut VecDeque<Frame>, batch: Vec<Frame>) {
    for frame in batch.into_iter().rev() {
        backlog.push_front(frame);
    }
}

/// `true` to keep going, `false` on shutdown.
async fn sleep_or_shutdown(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(RETRY_DELAY) => true,
    }
}

/// Read the NDJSON stream, one frame per line, reopening after errors.
async fn consume_stream(
    client: reqwest::Client,
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let attempt = async {
            let response = client.get(&url).send().await?;
            if !response.status().is_success() {
                return Err::<(), BoxError>(format!("stream status {}", response.status()).into());
            }
            debug!(url = %url, "Stream opened.");

            let mut stream = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                buf.extend_from_slice(&chunk?);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<Frame>(line) {
                        Ok(frame) => {
                            let _ = events.send(TransportEvent::Frame(frame));
                        }
                        Err(e) => warn!(error = %e, "Malformed stream line."),
                    }
                }
            }
            Ok(())
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = attempt => {
                if let Err(e) = result {
                    debug!(error = %e, "Stream transport error; reopening.");
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }
    }
}

fn build_client(config: &TransportConfig) -> Result<reqwest::Client, BoxError> {
    // env proxies were already folded into config.proxy_url during config
    // resolution; don't let reqwest apply them a second time
    let mut builder = reqwest::Client::builder().no_proxy();
    if let Some(proxy) = &config.proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
    }
    if config.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end_frame(id: &str) -> Frame {
        Frame::ConnectEnd { id: id.to_string() }
    }

    #[test]
    fn batch_respects_frame_cap() {
        let mut backlog: VecDeque<Frame> = (0..100).map(|i| end_frame(&i.to_string())).collect();
        let batch = take_batch(&mut backlog);
        assert_eq!(batch.len(), MAX_BATCH_FRAMES);
        assert_eq!(backlog.len(), 100 - MAX_BATCH_FRAMES);
    }

    #[test]
    fn batch_respects_byte_cap_but_always_moves() {
        let big = Frame::ConnectData {
            id: "x".to_string(),
            data_base64: "A".repeat(MAX_BATCH_BYTES),
        };
        let mut backlog: VecDeque<Frame> = VecDeque::from(vec![big.clone(), big]);
        let batch = take_batch(&mut backlog);
        // an oversized frame still goes out alone
        assert_eq!(batch.len(), 1);
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn unshift_preserves_order() {
        let mut backlog: VecDeque<Frame> = VecDeque::from(vec![end_frame("3")]);
        unshift(&mut backlog, vec![end_frame("1"), end_frame("2")]);
        let ids: Vec<&str> = backlog.iter().filter_map(Frame::id).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }
}
