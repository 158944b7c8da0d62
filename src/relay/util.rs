// src/relay/util.rs - shared helpers for the relay's HTTP surface
use base64::Engine;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::Request;
use percent_encoding::percent_decode_str;
use sha1::{Digest, Sha1};
use std::convert::Infallible;

use crate::protocol::Role;
use crate::BoxError;

pub type ResponseBody = BoxBody<Bytes, BoxError>;

pub fn boxed_body(text: impl Into<Bytes>) -> ResponseBody {
    Full::new(text.into())
        .map_err(|e: Infallible| -> BoxError { Box::new(e) })
        .boxed()
}

/// Check if a request is a WebSocket upgrade
pub fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let connection = req
        .headers()
        .get("connection")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let upgrade = req
        .headers()
        .get("upgrade")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    connection.to_lowercase().contains("upgrade") && upgrade.eq_ignore_ascii_case("websocket")
}

const WS_MAGIC: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Calculate the Sec-WebSocket-Accept value for an upgrade handshake
pub fn calculate_websocket_accept_key(ws_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(ws_key.as_bytes());
    hasher.update(WS_MAGIC);
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// The percent-decoded session segment of `/api/{stream,send}/<session>`.
pub fn session_from_api_path(path: &str, prefix: &str) -> Option<String> {
    let rest = path.strip_prefix(prefix)?;
    let segment = rest.split('/').find(|s| !s.is_empty())?;
    Some(percent_decode_str(segment).decode_utf8_lossy().into_owned())
}

/// The `role` query parameter, if present and valid.
pub fn role_from_query(query: Option<&str>) -> Option<Role> {
    let query = query?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "role")
        .and_then(|(_, value)| Role::parse(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_sample() {
        assert_eq!(
            calculate_websocket_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn api_path_session_extraction() {
        assert_eq!(
            session_from_api_path("/api/stream/office", "/api/stream/").as_deref(),
            Some("office")
        );
        assert_eq!(
            session_from_api_path("/api/send/my%20office", "/api/send/").as_deref(),
            Some("my office")
        );
        assert_eq!(session_from_api_path("/api/stream/", "/api/stream/"), None);
        assert_eq!(session_from_api_path("/health", "/api/stream/"), None);
    }

    #[test]
    fn role_query_parsing() {
        assert_eq!(role_from_query(Some("role=lan")), Some(Role::Lan));
        assert_eq!(role_from_query(Some("a=b&role=proxy")), Some(Role::Proxy));
        assert_eq!(role_from_query(Some("role=browser")), None);
        assert_eq!(role_from_query(None), None);
    }
}
