// src/dial.rs - outbound CONNECT dialing through an HTTP proxy
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::insecure_cert::InsecureCertVerifier;
use crate::BoxError;

/// Client-side TLS configuration: native roots, or the accept-anything
/// verifier when `insecure` is set.
pub fn client_tls_config(insecure: bool) -> rustls::ClientConfig {
    if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// A connection established through an HTTP proxy. Bytes the proxy delivered
/// past the end of its CONNECT response are replayed before the socket is
/// read again.
pub struct ProxyStream {
    inner: ProxyStreamInner,
    leftover: Vec<u8>,
    pos: usize,
}

enum ProxyStreamInner {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.leftover.len() {
            let n = std::cmp::min(buf.remaining(), this.leftover.len() - this.pos);
            buf.put_slice(&this.leftover[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        match &mut this.inner {
            ProxyStreamInner::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ProxyStreamInner::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.get_mut().inner {
            ProxyStreamInner::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ProxyStreamInner::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().inner {
            ProxyStreamInner::Plain(s) => Pin::new(s).poll_flush(cx),
            ProxyStreamInner::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().inner {
            ProxyStreamInner::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ProxyStreamInner::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open a tunnel to `host:port` by issuing a `CONNECT` through `proxy_url`.
/// TLS is spoken to the proxy itself when its URL is `https`. Only a `200`
/// first response line is accepted; anything else becomes an error carrying
/// that status line.
pub async fn connect_via_proxy(
    proxy_url: &str,
    host: &str,
    port: u16,
    insecure: bool,
) -> Result<ProxyStream, BoxError> {
    let (proxy_tls, proxy_host, proxy_port) = parse_proxy_url(proxy_url)?;
    debug!(proxy = %proxy_url, target = %format!("{host}:{port}"), "Dialing through proxy.");

    let tcp = TcpStream::connect((proxy_host.as_str(), proxy_port)).await?;
    let inner = if proxy_tls {
        let connector = TlsConnector::from(Arc::new(client_tls_config(insecure)));
        let server_name = ServerName::try_from(proxy_host.clone())?;
        ProxyStreamInner::Tls(Box::new(connector.connect(server_name, tcp).await?))
    } else {
        ProxyStreamInner::Plain(tcp)
    };

    let mut stream = ProxyStream { inner, leftover: Vec::new(), pos: 0 };
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    stream.leftover = read_connect_response(&mut stream).await?;
    stream.pos = 0;
    Ok(stream)
}

/// Buffer proxy output until the blank line, accept only a `200` status, and
/// return any bytes that arrived past the headers.
async fn read_connect_response<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, BoxError> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_header_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..end]);
            let status_line = head.lines().next().unwrap_or("").to_string();
            if !connect_status_ok(&status_line) {
                return Err(format!("proxy CONNECT failed: {status_line}").into());
            }
            return Ok(buf.split_off(end + 4));
        }
        if buf.len() > 16 * 1024 {
            return Err("oversized proxy CONNECT response".into());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err("proxy closed connection before CONNECT response".into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn connect_status_ok(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    parts.next().map(|v| v.starts_with("HTTP/")).unwrap_or(false) && parts.next() == Some("200")
}

/// `(is_tls, host, port)` from a proxy URL. A bare `host:port` is treated as
/// plain HTTP.
fn parse_proxy_url(url: &str) -> Result<(bool, String, u16), BoxError> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        (false, url)
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    // strip userinfo if present; proxy auth is not supported
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| format!("invalid proxy port in '{url}'"))?,
        ),
        None => (authority.to_string(), if tls { 443 } else { 80 }),
    };
    if host.is_empty() {
        return Err(format!("invalid proxy URL '{url}'").into());
    }
    Ok((tls, host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn proxy_url_forms() {
        assert_eq!(parse_proxy_url("http://p:3128").unwrap(), (false, "p".to_string(), 3128));
        assert_eq!(parse_proxy_url("https://p").unwrap(), (true, "p".to_string(), 443));
        assert_eq!(parse_proxy_url("p:8080").unwrap(), (false, "p".to_string(), 8080));
        assert!(parse_proxy_url("http://p:notaport").is_err());
    }

    #[test]
    fn status_line_checks() {
        assert!(connect_status_ok("HTTP/1.1 200 Connection Established"));
        assert!(connect_status_ok("HTTP/1.0 200 OK"));
        assert!(!connect_status_ok("HTTP/1.1 407 Proxy Authentication Required"));
        assert!(!connect_status_ok(""));
    }

    #[tokio::test]
    async fn connect_response_accepts_200_and_keeps_leftover() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(b"HTTP/1.1 200 Connection Established\r\nVia: test\r\n\r\nEARLY")
            .await
            .unwrap();
        let leftover = read_connect_response(&mut b).await.unwrap();
        assert_eq!(leftover, b"EARLY");
    }

    #[tokio::test]
    async fn connect_response_rejects_non_200_with_status() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();
        let err = read_connect_response(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("407"), "{err}");
    }

    #[tokio::test]
    async fn connect_response_rejects_early_close() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        assert!(read_connect_response(&mut b).await.is_err());
    }
}
