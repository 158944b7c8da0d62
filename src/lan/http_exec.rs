// src/lan/http_exec.rs - executes http-request frames against their targets
use std::collections::HashMap;
use tracing::{debug, error};

use crate::protocol::{decode_base64, encode_base64, sanitize_headers, Frame, HttpRequestPayload};
use crate::BoxError;

#[derive(Clone)]
pub struct Executor {
    client: reqwest::Client,
}

impl Executor {
    pub fn new(insecure: bool) -> Result<Self, BoxError> {
        // Targets live on this side of the relay; the operator's proxy
        // environment must not apply to them. Redirects go back verbatim so
        // the browser chases them itself.
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy();
        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Perform one request. Always yields a terminal `http-response`: status
    /// plus raw headers and body on success, `error` on any failure.
    pub async fn execute(&self, id: String, request: HttpRequestPayload) -> Frame {
        debug!(id, method = %request.method, url = %request.url, "Executing request.");
        match self.perform(&request).await {
            Ok((status, headers, body)) => Frame::HttpResponse {
                id,
                status: Some(status),
                headers: Some(headers),
                body_base64: Some(encode_base64(&body)),
                error: None,
            },
            Err(e) => {
                error!(id, url = %request.url, error = %e, "Request failed.");
                Frame::HttpResponse {
                    id,
                    status: None,
                    headers: None,
                    body_base64: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn perform(
        &self,
        request: &HttpRequestPayload,
    ) -> Result<(u16, HashMap<String, Vec<String>>, Vec<u8>), BoxError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())?;
        let body = decode_base64(&request.body_base64)?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in sanitize_headers(&request.headers) {
            // reqwest derives these from the URL and body
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(&name, &value);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();

        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let bytes = response.bytes().await?;
        Ok((status, headers, bytes.to_vec()))
    }
}
