// src/config.rs
use clap::{Args, Parser, Subcommand, ValueEnum};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::BoxError;

#[derive(Parser, Debug)]
#[command(name = "rwp")]
#[command(about = "Relay web proxy: reach a remote private network through a public relay")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the public relay server
    Server(ServerArgs),
    /// Run the LAN agent inside the private network
    Lan(LanArgs),
    /// Run the local HTTP proxy a browser points at
    Proxy(ProxyArgs),
}

/// Transport used to reach the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Try the persistent socket, fall back to long-polling if it never opens
    Auto,
    /// Persistent socket only
    Ws,
    /// Long-poll / chunked-stream only
    Http,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, default_value = "server.toml")]
    pub config: PathBuf,
    #[arg(long, env = "RWP_PORT")]
    pub port: Option<u16>,
    #[arg(long, env = "RWP_HOST")]
    pub host: Option<String>,
    /// Redirect non-API requests here instead of returning 404
    #[arg(long, env = "RWP_HOMEPAGE")]
    pub homepage: Option<String>,
    #[arg(long)]
    pub generate_config: bool,
    #[arg(long, env = "RWP_DEBUG")]
    pub debug: bool,
}

#[derive(Args, Debug)]
pub struct LanArgs {
    /// Session name, or a server URL carrying the session as its last path segment
    pub session_or_url: String,
    /// Relay server URL (ws://, wss://, http:// or https://)
    pub server_url: Option<String>,
    #[arg(long, default_value = "lan.toml")]
    pub config: PathBuf,
    /// Proxy used to reach the relay server (falls back to HTTPS_PROXY / HTTP_PROXY)
    #[arg(long, env = "RWP_PROXY")]
    pub proxy: Option<String>,
    /// Proxy used to reach connect-start targets; "true" reuses --proxy
    #[arg(long, env = "RWP_TUNNEL_PROXY")]
    pub tunnel_proxy: Option<String>,
    #[arg(long, value_enum, env = "RWP_TRANSPORT")]
    pub transport: Option<TransportMode>,
    /// Skip TLS certificate verification on all outbound connections
    #[arg(long, env = "RWP_INSECURE")]
    pub insecure: bool,
    #[arg(long)]
    pub generate_config: bool,
    #[arg(long, env = "RWP_DEBUG")]
    pub debug: bool,
}

#[derive(Args, Debug)]
pub struct ProxyArgs {
    /// Session name, or a server URL carrying the session as its last path segment
    pub session_or_url: String,
    /// Relay server URL (ws://, wss://, http:// or https://)
    pub server_url: Option<String>,
    /// Local port to listen on
    pub port: Option<u16>,
    #[arg(long, default_value = "proxy.toml")]
    pub config: PathBuf,
    #[arg(long, env = "RWP_PROXY_HOST")]
    pub host: Option<String>,
    /// Proxy used to reach the relay server (falls back to HTTPS_PROXY / HTTP_PROXY)
    #[arg(long, env = "RWP_PROXY")]
    pub proxy: Option<String>,
    #[arg(long, value_enum, env = "RWP_TRANSPORT")]
    pub transport: Option<TransportMode>,
    /// Skip TLS certificate verification on all outbound connections
    #[arg(long, env = "RWP_INSECURE")]
    pub insecure: bool,
    #[arg(long)]
    pub generate_config: bool,
    #[arg(long, env = "RWP_DEBUG")]
    pub debug: bool,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub homepage: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 8080,
                homepage: None,
            },
        }
    }
}

impl ServerConfig {
    pub fn load(args: &ServerArgs) -> Result<Self, BoxError> {
        let mut config = load_or_default::<Self>(&args.config)?;
        if let Some(host) = &args.host {
            config.server.host = host.clone();
        }
        if let Some(port) = args.port {
            config.server.port = port;
        }
        if let Some(homepage) = &args.homepage {
            config.server.homepage = Some(homepage.clone());
        }
        Ok(config)
    }

    pub fn generate_default_file(path: &PathBuf) -> Result<(), BoxError> {
        generate_default_file::<Self>(path)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// LAN agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanConfig {
    pub lan: LanSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanSettings {
    pub server_url: String,
    pub session: String,
    pub proxy_url: Option<String>,
    pub tunnel_proxy: Option<String>,
    pub transport: TransportMode,
    pub insecure: bool,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            lan: LanSettings {
                server_url: "ws://localhost:8080".to_string(),
                session: "default".to_string(),
                proxy_url: None,
                tunnel_proxy: None,
                transport: TransportMode::Auto,
                insecure: false,
            },
        }
    }
}

impl LanConfig {
    pub fn load(args: &LanArgs) -> Result<Self, BoxError> {
        let mut config = load_or_default::<Self>(&args.config)?;

        let (server, session) = resolve_server_and_session(
            &args.session_or_url,
            args.server_url.as_deref(),
        )?;
        if let Some(server) = server {
            config.lan.server_url = server;
        }
        config.lan.session = session;

        if let Some(proxy) = &args.proxy {
            config.lan.proxy_url = Some(proxy.clone());
        } else if config.lan.proxy_url.is_none() {
            config.lan.proxy_url = env_proxy_default();
        }
        if let Some(tunnel_proxy) = &args.tunnel_proxy {
            config.lan.tunnel_proxy = Some(tunnel_proxy.clone());
        }
        if let Some(transport) = args.transport {
            config.lan.transport = transport;
        }
        if args.insecure {
            config.lan.insecure = true;
        }

        // "true" means reuse the server-reach proxy
        if config.lan.tunnel_proxy.as_deref() == Some("true") {
            match &config.lan.proxy_url {
                Some(proxy) => config.lan.tunnel_proxy = Some(proxy.clone()),
                None => return Err("--tunnel-proxy true requires --proxy (or HTTPS_PROXY/HTTP_PROXY)".into()),
            }
        }

        config.lan.server_url = normalize_ws_url(&config.lan.server_url);
        Ok(config)
    }

    pub fn generate_default_file(path: &PathBuf) -> Result<(), BoxError> {
        generate_default_file::<Self>(path)
    }
}

/// Local proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    pub server_url: String,
    pub session: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub proxy_url: Option<String>,
    pub transport: TransportMode,
    pub insecure: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy: ProxySettings {
                server_url: "ws://localhost:8080".to_string(),
                session: "default".to_string(),
                listen_host: "127.0.0.1".to_string(),
                listen_port: 8888,
                proxy_url: None,
                transport: TransportMode::Auto,
                insecure: false,
            },
        }
    }
}

impl ProxyConfig {
    pub fn load(args: &ProxyArgs) -> Result<Self, BoxError> {
        let mut config = load_or_default::<Self>(&args.config)?;

        let (server, session) = resolve_server_and_session(
            &args.session_or_url,
            args.server_url.as_deref(),
        )?;
        if let Some(server) = server {
            config.proxy.server_url = server;
        }
        config.proxy.session = session;

        if let Some(port) = args.port {
            config.proxy.listen_port = port;
        }
        if let Some(host) = &args.host {
            config.proxy.listen_host = host.clone();
        }
        if let Some(proxy) = &args.proxy {
            config.proxy.proxy_url = Some(proxy.clone());
        } else if config.proxy.proxy_url.is_none() {
            config.proxy.proxy_url = env_proxy_default();
        }
        if let Some(transport) = args.transport {
            config.proxy.transport = transport;
        }
        if args.insecure {
            config.proxy.insecure = true;
        }

        config.proxy.server_url = normalize_ws_url(&config.proxy.server_url);
        Ok(config)
    }

    pub fn generate_default_file(path: &PathBuf) -> Result<(), BoxError> {
        generate_default_file::<Self>(path)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.listen_host, self.proxy.listen_port)
    }
}

fn load_or_default<T: Default + serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T, BoxError> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    } else {
        Ok(T::default())
    }
}

fn generate_default_file<T: Default + Serialize>(path: &PathBuf) -> Result<(), BoxError> {
    let content = toml::to_string_pretty(&T::default())?;
    fs::write(path, content)?;
    tracing::info!(path = ?path, "Generated default config file.");
    Ok(())
}

/// Default server-reach proxy from the conventional environment variables.
/// `RWP_PROXY` wins over these (it is wired through clap's `env`).
pub fn env_proxy_default() -> Option<String> {
    for key in ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"] {
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Resolve the `<session-or-url> [server-url]` positional pair.
///
/// A URL argument contributes both the server base and (from its last
/// non-empty path segment, percent-decoded) the session name. A bare argument
/// is the session; the server comes from the second positional or the config
/// default.
pub fn resolve_server_and_session(
    session_or_url: &str,
    server_url: Option<&str>,
) -> Result<(Option<String>, String), BoxError> {
    if has_url_scheme(session_or_url) {
        let (base, session) = split_server_and_session(session_or_url);
        let session = session
            .ok_or_else(|| format!("no session name in URL '{session_or_url}'"))?;
        return Ok((Some(base), session));
    }

    let session = session_or_url.to_string();
    match server_url {
        Some(url) => {
            let (base, _) = split_server_and_session(url);
            Ok((Some(base), session))
        }
        None => Ok((None, session)),
    }
}

/// Split a server URL into its base (scheme + authority) and the session name
/// taken from the last non-empty path segment, percent-decoded.
pub fn split_server_and_session(url: &str) -> (String, Option<String>) {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("ws", url),
    };
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, path),
        None => (rest, ""),
    };
    let session = path
        .split('?')
        .next()
        .unwrap_or("")
        .split('/')
        .filter(|s| !s.is_empty())
        .last()
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned());
    (format!("{scheme}://{authority}"), session)
}

fn has_url_scheme(s: &str) -> bool {
    ["ws://", "wss://", "http://", "https://"]
        .iter()
        .any(|scheme| s.starts_with(scheme))
}

/// `http(s)://` is equivalent to `ws(s)://` for the server URL.
pub fn normalize_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("ws://{url}")
    }
}

/// The HTTP base the long-poll transport targets, from a ws(s) server URL.
pub fn http_base_from_ws(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_session_as_last_segment() {
        let (server, session) = resolve_server_and_session("wss://relay.example/office", None).unwrap();
        assert_eq!(server.as_deref(), Some("wss://relay.example"));
        assert_eq!(session, "office");

        let (server, session) =
            resolve_server_and_session("https://relay.example:9000/a/b/office/", None).unwrap();
        assert_eq!(server.as_deref(), Some("https://relay.example:9000"));
        assert_eq!(session, "office");
    }

    #[test]
    fn bare_session_with_explicit_server() {
        let (server, session) =
            resolve_server_and_session("office", Some("ws://relay.example:8080")).unwrap();
        assert_eq!(server.as_deref(), Some("ws://relay.example:8080"));
        assert_eq!(session, "office");
    }

    #[test]
    fn bare_session_alone_keeps_config_server() {
        let (server, session) = resolve_server_and_session("office", None).unwrap();
        assert_eq!(server, None);
        assert_eq!(session, "office");
    }

    #[test]
    fn url_without_session_is_a_usage_error() {
        assert!(resolve_server_and_session("wss://relay.example", None).is_err());
        assert!(resolve_server_and_session("wss://relay.example/", None).is_err());
    }

    #[test]
    fn session_segments_are_percent_decoded() {
        let (_, session) = split_server_and_session("ws://relay/my%20office");
        assert_eq!(session.as_deref(), Some("my office"));
    }

    #[test]
    fn scheme_normalization() {
        assert_eq!(normalize_ws_url("http://h:1"), "ws://h:1");
        assert_eq!(normalize_ws_url("https://h"), "wss://h");
        assert_eq!(normalize_ws_url("wss://h"), "wss://h");
        assert_eq!(normalize_ws_url("h:8080"), "ws://h:8080");
        assert_eq!(http_base_from_ws("ws://h:1"), "http://h:1");
        assert_eq!(http_base_from_ws("wss://h"), "https://h");
    }
}
