// src/protocol.rs
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol version agreed by all three roles. A `hello` carrying a different
/// version is rejected with an `error` frame before the session is touched.
pub const PROTOCOL_VERSION: u32 = 1;

/// The two client roles a relay session pairs up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Lan,
    Proxy,
}

impl Role {
    /// The role frames from `self` are routed toward.
    pub fn counterpart(self) -> Role {
        match self {
            Role::Lan => Role::Proxy,
            Role::Proxy => Role::Lan,
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "lan" => Some(Role::Lan),
            "proxy" => Some(Role::Proxy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Lan => "lan",
            Role::Proxy => "proxy",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One buffered HTTP request as carried by an `http-request` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestPayload {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    #[serde(rename = "bodyBase64")]
    pub body_base64: String,
}

/// Frames exchanged between the relay and its two clients.
///
/// Serialized as a JSON object with a `type` tag; binary payloads travel
/// base64-encoded in `bodyBase64` / `dataBase64`. On the persistent socket a
/// frame is one text message; on the fallback stream it is one
/// newline-terminated line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// First frame from a client: registers `(session, role)`.
    Hello {
        role: Role,
        session: String,
        #[serde(rename = "protocolVersion", default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<u32>,
    },

    /// Relay's acknowledgment of a `hello`.
    HelloAck {
        role: Role,
        session: String,
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
    },

    /// proxy -> lan: perform the buffered HTTP request.
    HttpRequest { id: String, request: HttpRequestPayload },

    /// lan -> proxy: the outcome. Exactly one of `status` or `error` is set.
    /// Response headers keep their raw multi-values.
    HttpResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, Vec<String>>>,
        #[serde(rename = "bodyBase64", default, skip_serializing_if = "Option::is_none")]
        body_base64: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// proxy -> lan: open a raw TCP tunnel to `host:port`.
    ConnectStart { id: String, host: String, port: u16 },

    /// lan -> proxy: the tunnel is open.
    ConnectAck { id: String },

    /// Tunnel failed or was aborted.
    ConnectError { id: String, message: String },

    /// Raw tunnel bytes, either direction.
    ConnectData {
        id: String,
        #[serde(rename = "dataBase64")]
        data_base64: String,
    },

    /// Half-close / close of a tunnel, either direction.
    ConnectEnd { id: String },

    /// Protocol error reported to the offending party.
    Error { message: String },
}

impl Frame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The stream id this frame belongs to, if it carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Frame::HttpRequest { id, .. }
            | Frame::HttpResponse { id, .. }
            | Frame::ConnectStart { id, .. }
            | Frame::ConnectAck { id }
            | Frame::ConnectError { id, .. }
            | Frame::ConnectData { id, .. }
            | Frame::ConnectEnd { id } => Some(id),
            _ => None,
        }
    }
}

/// Body of `POST /api/send/<session>`: one frame or a batch.
#[derive(Debug, Serialize, Deserialize)]
pub struct SendEnvelope {
    pub role: Role,
    pub message: FrameBatch,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameBatch {
    One(Box<Frame>),
    Many(Vec<Frame>),
}

impl FrameBatch {
    pub fn into_frames(self) -> Vec<Frame> {
        match self {
            FrameBatch::One(frame) => vec![*frame],
            FrameBatch::Many(frames) => frames,
        }
    }
}

pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data)
}

/// Hop-by-hop headers stripped in both directions so they never cross the
/// relay (RFC 9110 §7.6.1 set plus the legacy proxy variants).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailers",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str())
}

/// Drop the hop-by-hop set from a single-valued header map, case-insensitively.
pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_wire_format() {
        let frame = Frame::Hello {
            role: Role::Proxy,
            session: "office".to_string(),
            protocol_version: Some(PROTOCOL_VERSION),
        };

        let json = frame.to_json().unwrap();
        assert!(json.contains(r#""type":"hello""#), "{json}");
        assert!(json.contains(r#""role":"proxy""#), "{json}");
        assert!(json.contains(r#""protocolVersion":1"#), "{json}");

        match Frame::from_json(&json).unwrap() {
            Frame::Hello { role, session, protocol_version } => {
                assert_eq!(role, Role::Proxy);
                assert_eq!(session, "office");
                assert_eq!(protocol_version, Some(PROTOCOL_VERSION));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn hello_without_version_parses() {
        let frame = Frame::from_json(r#"{"type":"hello","role":"lan","session":"s"}"#).unwrap();
        match frame {
            Frame::Hello { protocol_version, .. } => assert_eq!(protocol_version, None),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn kebab_case_tags() {
        let json = Frame::ConnectStart {
            id: "abc".to_string(),
            host: "example.test".to_string(),
            port: 443,
        }
        .to_json()
        .unwrap();
        assert!(json.contains(r#""type":"connect-start""#), "{json}");

        let json = Frame::HttpResponse {
            id: "abc".to_string(),
            status: Some(200),
            headers: None,
            body_base64: Some(String::new()),
            error: None,
        }
        .to_json()
        .unwrap();
        assert!(json.contains(r#""type":"http-response""#), "{json}");
        assert!(json.contains(r#""bodyBase64":"""#), "{json}");
        assert!(!json.contains("error"), "unset fields must be omitted: {json}");
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(Frame::from_json(r#"{"type":"bogus","id":"1"}"#).is_err());
    }

    #[test]
    fn base64_round_trip() {
        for payload in [&b""[..], &b"ABCDE"[..], &[0u8, 255, 128, 7][..]] {
            let encoded = encode_base64(payload);
            assert_eq!(decode_base64(&encoded).unwrap(), payload);
        }
        assert_eq!(encode_base64(b""), "");
        assert_eq!(decode_base64("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn sanitize_strips_hop_by_hop() {
        let mut headers = HashMap::new();
        headers.insert("Host".to_string(), "example.test".to_string());
        headers.insert("Connection".to_string(), "keep-alive".to_string());
        headers.insert("Proxy-Connection".to_string(), "keep-alive".to_string());
        headers.insert("Transfer-Encoding".to_string(), "chunked".to_string());
        headers.insert("TE".to_string(), "trailers".to_string());
        headers.insert("content-type".to_string(), "text/plain".to_string());

        let sanitized = sanitize_headers(&headers);
        assert_eq!(sanitized.len(), 2);
        assert!(sanitized.contains_key("Host"));
        assert!(sanitized.contains_key("content-type"));
    }

    #[test]
    fn send_envelope_accepts_one_or_many() {
        let one: SendEnvelope = serde_json::from_str(
            r#"{"role":"proxy","message":{"type":"connect-end","id":"x"}}"#,
        )
        .unwrap();
        assert_eq!(one.message.into_frames().len(), 1);

        let many: SendEnvelope = serde_json::from_str(
            r#"{"role":"lan","message":[{"type":"connect-end","id":"x"},{"type":"connect-ack","id":"y"}]}"#,
        )
        .unwrap();
        assert_eq!(many.message.into_frames().len(), 2);
    }
}
