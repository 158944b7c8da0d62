// src/relay/api.rs - long-poll / chunked-stream fallback endpoints
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::protocol::{Frame, SendEnvelope, PROTOCOL_VERSION};
use crate::relay::state::get_or_create_session;
use crate::relay::util::{boxed_body, role_from_query, session_from_api_path, ResponseBody};
use crate::relay::RelayContext;
use crate::BoxError;

/// `GET /api/stream/<session>?role=`: attach a chunked NDJSON stream to the
/// role's channel. Queued frames drain into it before anything new arrives.
pub async fn handle_stream(
    req: Request<Incoming>,
    context: RelayContext,
) -> Result<Response<ResponseBody>, BoxError> {
    let Some(session_name) = session_from_api_path(req.uri().path(), "/api/stream/") else {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(boxed_body("Not found"))?);
    };
    let Some(role) = role_from_query(req.uri().query()) else {
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(boxed_body("Invalid role"))?);
    };

    let (tx, rx) = mpsc::unbounded_channel::<Frame>();
    let session = get_or_create_session(&context.sessions, &session_name).await;
    session.lock().await.attach_stream(role, tx);
    info!(session = %session_name, %role, "Stream attached.");

    let body_stream = async_stream::stream! {
        let mut rx = rx;
        while let Some(frame) = rx.recv().await {
            match frame.to_json() {
                Ok(json) => {
                    yield Ok::<_, BoxError>(hyper::body::Frame::data(Bytes::from(format!("{json}\n"))));
                }
                Err(e) => error!(error = %e, "Failed to serialize frame for stream."),
            }
        }
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .header("cache-control", "no-cache")
        .body(BoxBody::new(StreamBody::new(body_stream)))?)
}

/// `POST /api/send/<session>?role=`: route one frame or a batch on behalf of
/// the role. Best effort: the response is `200 {}` whenever the envelope was
/// readable; per-frame problems travel back as `error` frames.
pub async fn handle_send(
    req: Request<Incoming>,
    context: RelayContext,
) -> Result<Response<ResponseBody>, BoxError> {
    let Some(session_name) = session_from_api_path(req.uri().path(), "/api/send/") else {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(boxed_body("Not found"))?);
    };
    let Some(role) = role_from_query(req.uri().query()) else {
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(boxed_body("Invalid role"))?);
    };

    let body = req.into_body().collect().await?.to_bytes();
    let envelope: SendEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(boxed_body(format!("Invalid body: {e}")))?);
        }
    };

    let session = get_or_create_session(&context.sessions, &session_name).await;
    let mut state = session.lock().await;
    for frame in envelope.message.into_frames() {
        match frame {
            Frame::Hello { role: hello_role, session: hello_session, protocol_version } => {
                if let Some(version) = protocol_version {
                    if version != PROTOCOL_VERSION {
                        state.respond(
                            role,
                            Frame::Error {
                                message: format!(
                                    "protocol version mismatch: client {version}, server {PROTOCOL_VERSION}"
                                ),
                            },
                        );
                        continue;
                    }
                }
                info!(session = %session_name, %role, "Client registered over stream transport.");
                state.respond(
                    role,
                    Frame::HelloAck {
                        role: hello_role,
                        session: hello_session,
                        protocol_version: PROTOCOL_VERSION,
                    },
                );
            }
            frame => {
                if let Some(error) = state.route_from(role, frame) {
                    state.respond(role, error);
                }
            }
        }
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(boxed_body("{}"))?)
}
