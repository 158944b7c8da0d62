//! End-to-end exercises over loopback sockets: relay, LAN agent and local
//! proxy wired together, with real browser-side TCP clients.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use rwp::config::{LanConfig, ProxyConfig, ServerConfig, TransportMode};
use rwp::lan::LanAgent;
use rwp::proxy::LocalProxy;
use rwp::relay::RelayServer;

async fn start_relay() -> (SocketAddr, CancellationToken) {
    let mut config = ServerConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    let server = RelayServer::bind(config).await.expect("bind relay");
    let addr = server.local_addr().expect("relay addr");
    let token = CancellationToken::new();
    let run_token = token.clone();
    tokio::spawn(async move {
        let _ = server.run(run_token).await;
    });
    (addr, token)
}

fn start_lan(relay: SocketAddr, session: &str, mode: TransportMode) -> CancellationToken {
    let mut config = LanConfig::default();
    config.lan.server_url = format!("ws://{relay}");
    config.lan.session = session.to_string();
    config.lan.transport = mode;
    let token = CancellationToken::new();
    let run_token = token.clone();
    tokio::spawn(async move {
        let _ = LanAgent::new(config).run(run_token).await;
    });
    token
}

async fn start_proxy(
    relay: SocketAddr,
    session: &str,
    mode: TransportMode,
) -> (SocketAddr, CancellationToken) {
    let mut config = ProxyConfig::default();
    config.proxy.server_url = format!("ws://{relay}");
    config.proxy.session = session.to_string();
    config.proxy.listen_host = "127.0.0.1".to_string();
    config.proxy.listen_port = 0;
    config.proxy.transport = mode;
    let proxy = LocalProxy::bind(config).await.expect("bind proxy");
    let addr = proxy.local_addr().expect("proxy addr");
    let token = CancellationToken::new();
    let run_token = token.clone();
    tokio::spawn(async move {
        let _ = proxy.run(run_token).await;
    });
    (addr, token)
}

/// Minimal HTTP target: answers every request with `200`, body `hi`, and a
/// hop-by-hop header that must not survive the relay.
async fn start_http_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind target");
    let addr = listener.local_addr().expect("target addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut head = Vec::new();
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            head.extend_from_slice(&buf[..n]);
                            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let response = b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\nkeep-alive: timeout=5\r\ncontent-length: 2\r\n\r\nhi";
                let _ = stream.write_all(response).await;
            });
        }
    });
    addr
}

/// TCP echo target for CONNECT tunnels.
async fn start_echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Target that accepts connections but never answers, keeping requests
/// in-flight on the LAN side.
async fn start_stalling_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stall");
    let addr = listener.local_addr().expect("stall addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            held.push(stream);
        }
    });
    addr
}

async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}

#[tokio::test(flavor = "multi_thread")]
async fn health_endpoint_answers_ok() {
    let (relay, _token) = start_relay().await;
    let body = reqwest::get(format!("http://{relay}/health"))
        .await
        .expect("health request")
        .text()
        .await
        .expect("health body");
    assert_eq!(body, "ok");
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_get_round_trips_over_socket_transport() {
    let (relay, _relay_token) = start_relay().await;
    let target = start_http_target().await;
    let _lan = start_lan(relay, "e2e-get", TransportMode::Ws);
    let (proxy, _proxy_token) = start_proxy(relay, "e2e-get", TransportMode::Ws).await;

    let mut browser = TcpStream::connect(proxy).await.expect("connect proxy");
    let request = format!(
        "GET http://{target}/x HTTP/1.1\r\nHost: {target}\r\nConnection: keep-alive\r\n\r\n"
    );
    browser.write_all(request.as_bytes()).await.expect("send request");

    let response = String::from_utf8_lossy(&read_to_end(&mut browser).await).into_owned();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("hi"), "{response}");
    let head = response.to_ascii_lowercase();
    assert!(!head.contains("keep-alive:"), "hop-by-hop header leaked: {response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_tunnel_preserves_early_bytes_in_order() {
    let (relay, _relay_token) = start_relay().await;
    let echo = start_echo_target().await;
    let _lan = start_lan(relay, "e2e-connect", TransportMode::Ws);
    let (proxy, _proxy_token) = start_proxy(relay, "e2e-connect", TransportMode::Ws).await;

    // the proxy refuses CONNECT with 503 until its transport is up
    let (mut browser, mut echoed) = loop {
        let mut candidate = TcpStream::connect(proxy).await.expect("connect proxy");
        let connect = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\nABCDE");
        candidate.write_all(connect.as_bytes()).await.expect("send connect");

        let mut head = Vec::new();
        let mut buf = vec![0u8; 1024];
        let established = loop {
            let n = tokio::time::timeout(Duration::from_secs(5), candidate.read(&mut buf))
                .await
                .expect("read timeout")
                .expect("read connect response");
            if n == 0 {
                break false;
            }
            head.extend_from_slice(&buf[..n]);
            if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
                let status = String::from_utf8_lossy(&head[..pos]).into_owned();
                if status.contains("200") {
                    // anything past the header block is already echo data
                    head.drain(..pos + 4);
                    break true;
                }
                assert!(status.contains("503"), "unexpected CONNECT status: {status}");
                break false;
            }
        };
        if established {
            break (candidate, head);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    browser.write_all(b"FGHIJKL").await.expect("send late bytes");

    let mut buf = vec![0u8; 1024];
    while echoed.len() < 12 {
        let n = tokio::time::timeout(Duration::from_secs(5), browser.read(&mut buf))
            .await
            .expect("echo timeout")
            .expect("echo read");
        assert_ne!(n, 0, "tunnel closed early");
        echoed.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&echoed[..12], b"ABCDEFGHIJKL");
}

#[tokio::test(flavor = "multi_thread")]
async fn lan_disconnect_fails_inflight_request_with_502() {
    let (relay, _relay_token) = start_relay().await;
    let stall = start_stalling_target().await;
    let lan_token = start_lan(relay, "e2e-drop", TransportMode::Ws);
    let (proxy, _proxy_token) = start_proxy(relay, "e2e-drop", TransportMode::Ws).await;

    let mut browser = TcpStream::connect(proxy).await.expect("connect proxy");
    let request = format!("GET http://{stall}/slow HTTP/1.1\r\nHost: {stall}\r\n\r\n");
    browser.write_all(request.as_bytes()).await.expect("send request");

    // let the request reach the LAN agent, then kill the agent
    tokio::time::sleep(Duration::from_millis(500)).await;
    lan_token.cancel();

    let response = String::from_utf8_lossy(&read_to_end(&mut browser).await).into_owned();
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    assert!(response.contains("LAN disconnected"), "{response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_get_round_trips_over_stream_transport() {
    let (relay, _relay_token) = start_relay().await;
    let target = start_http_target().await;
    let _lan = start_lan(relay, "e2e-poll", TransportMode::Http);
    let (proxy, _proxy_token) = start_proxy(relay, "e2e-poll", TransportMode::Http).await;

    let mut browser = TcpStream::connect(proxy).await.expect("connect proxy");
    let request = format!("GET http://{target}/x HTTP/1.1\r\nHost: {target}\r\n\r\n");
    browser.write_all(request.as_bytes()).await.expect("send request");

    let response = String::from_utf8_lossy(&read_to_end(&mut browser).await).into_owned();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("hi"), "{response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_host_on_path_form_request_is_400() {
    let (relay, _relay_token) = start_relay().await;
    let _lan = start_lan(relay, "e2e-host", TransportMode::Ws);
    let (proxy, _proxy_token) = start_proxy(relay, "e2e-host", TransportMode::Ws).await;

    let mut browser = TcpStream::connect(proxy).await.expect("connect proxy");
    browser
        .write_all(b"GET /probe HTTP/1.1\r\n\r\n")
        .await
        .expect("send request");

    let response = String::from_utf8_lossy(&read_to_end(&mut browser).await).into_owned();
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains("Missing Host header"), "{response}");
}
