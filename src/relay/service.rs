// src/relay/service.rs - unified HTTP routing for the relay
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::Service;
use tracing::debug;

use crate::relay::util::{boxed_body, is_websocket_upgrade, ResponseBody};
use crate::relay::{api, ws, RelayContext};
use crate::BoxError;

#[derive(Clone)]
pub struct RelayService {
    context: RelayContext,
}

impl RelayService {
    pub fn new(context: RelayContext) -> Self {
        Self { context }
    }
}

impl Service<Request<Incoming>> for RelayService {
    type Response = Response<ResponseBody>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let context = self.context.clone();
        Box::pin(async move { route_request(req, context).await })
    }
}

async fn route_request(
    req: Request<Incoming>,
    context: RelayContext,
) -> Result<Response<ResponseBody>, BoxError> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    debug!(%method, path, websocket = is_websocket_upgrade(&req), "Incoming request.");

    // Persistent-socket upgrades share the port with everything else; the
    // session and role arrive in the hello frame, not the path.
    if is_websocket_upgrade(&req) {
        return ws::handle_socket_upgrade(req, context).await;
    }

    if path == "/health" && method == Method::GET {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(boxed_body("ok"))?);
    }

    if path.starts_with("/api/") {
        return if path.starts_with("/api/stream/") && method == Method::GET {
            api::handle_stream(req, context).await
        } else if path.starts_with("/api/send/") && method == Method::POST {
            api::handle_send(req, context).await
        } else {
            Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(boxed_body("Not found"))?)
        };
    }

    match &context.config.server.homepage {
        Some(homepage) => Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header("Location", homepage.clone())
            .body(boxed_body("Redirecting"))?),
        None => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(boxed_body("Not found"))?),
    }
}
