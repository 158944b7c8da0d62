// src/proxy/http.rs - the HTTP/1.1 side of the local proxy
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::{
    decode_base64, encode_base64, is_hop_by_hop, sanitize_headers, Frame, HttpRequestPayload,
};
use crate::proxy::{tunnel, ProxyContext};
use crate::BoxError;

/// Per-request wait for the matching `http-response`.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One browser connection: read the request head, then dispatch to the
/// CONNECT engine or the regular request path. One exchange per connection.
pub async fn handle_connection(stream: TcpStream, ctx: ProxyContext) -> Result<(), BoxError> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let parts: Vec<&str> = request_line.trim().split_whitespace().collect();
    if parts.len() < 3 {
        write_error(reader.get_mut(), 400, "Invalid request line").await?;
        return Ok(());
    }
    let method = parts[0].to_string();
    let target = parts[1].to_string();

    let mut headers: HashMap<String, String> = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers
                .entry(name.trim().to_string())
                .or_insert_with(|| value.trim().to_string());
        }
    }

    if method == "CONNECT" {
        return tunnel::handle_connect(reader, &target, ctx).await;
    }

    handle_request(reader, method, target, headers, ctx).await
}

async fn handle_request(
    mut reader: BufReader<TcpStream>,
    method: String,
    target: String,
    headers: HashMap<String, String>,
    ctx: ProxyContext,
) -> Result<(), BoxError> {
    // Uploads must arrive fully buffered; this protocol does not stream them.
    if header_get(&headers, "transfer-encoding").is_some() {
        write_error(reader.get_mut(), 400, "Chunked request bodies are not supported").await?;
        return Ok(());
    }

    let content_length = match header_get(&headers, "content-length") {
        Some(value) => match value.parse::<usize>() {
            Ok(length) => length,
            Err(_) => {
                write_error(reader.get_mut(), 400, "Invalid Content-Length").await?;
                return Ok(());
            }
        },
        None => 0,
    };
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }

    // Some clients probe the proxy with a bare path; give those a target via
    // the Host header.
    let url = if target.starts_with("http://") || target.starts_with("https://") {
        target
    } else {
        match header_get(&headers, "host") {
            Some(host) => {
                let path = if target.starts_with('/') {
                    target
                } else {
                    format!("/{target}")
                };
                format!("http://{host}{path}")
            }
            None => {
                write_error(reader.get_mut(), 400, "Missing Host header").await?;
                return Ok(());
            }
        }
    };

    let id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    ctx.pending.lock().await.insert(id.clone(), tx);

    info!(id, method, url, body_bytes = body.len(), "Forwarding request.");
    ctx.transport.send(Frame::HttpRequest {
        id: id.clone(),
        request: HttpRequestPayload {
            method,
            url,
            headers: sanitize_headers(&headers),
            body_base64: encode_base64(&body),
        },
    });

    let stream = reader.get_mut();
    match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
        Err(_) => {
            // a response landing after this point is discarded silently
            ctx.pending.lock().await.remove(&id);
            debug!(id, "Request timed out.");
            write_error(stream, 504, "Gateway Timeout").await?;
        }
        Ok(Err(_)) => {
            write_error(stream, 502, "Server connection closed").await?;
        }
        Ok(Ok(Frame::HttpResponse { error: Some(error), .. })) => {
            write_error(stream, 502, &error).await?;
        }
        Ok(Ok(Frame::HttpResponse { status, headers, body_base64, .. })) => {
            let body = match body_base64.as_deref().map(decode_base64).transpose() {
                Ok(body) => body.unwrap_or_default(),
                Err(_) => {
                    write_error(stream, 502, "Undecodable response payload").await?;
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            };
            write_response(stream, status.unwrap_or(502), headers.unwrap_or_default(), &body)
                .await?;
        }
        Ok(Ok(_)) => {
            write_error(stream, 502, "Bad Gateway").await?;
        }
    }

    let _ = reader.get_mut().shutdown().await;
    Ok(())
}

fn header_get<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn reason_phrase(status: u16) -> &'static str {
    hyper::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}

async fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<(), BoxError> {
    let response = format!(
        "HTTP/1.1 {status} {}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{message}",
        reason_phrase(status),
        message.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Write the relayed response: sanitized multi-value headers, our own
/// content-length (the body was re-buffered crossing the relay), one exchange
/// per connection.
async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    headers: HashMap<String, Vec<String>>,
    body: &[u8],
) -> Result<(), BoxError> {
    let mut response = format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status));
    for (name, values) in &headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        for value in values {
            response.push_str(name);
            response.push_str(": ");
            response.push_str(value);
            response.push_str("\r\n");
        }
    }
    response.push_str(&format!("content-length: {}\r\nconnection: close\r\n\r\n", body.len()));
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}
