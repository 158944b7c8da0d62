// src/relay/state.rs - per-session routing state
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{Frame, Role};

pub type SessionMap = Arc<RwLock<HashMap<String, Arc<Mutex<SessionState>>>>>;

pub fn new_session_map() -> SessionMap {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Sessions are created lazily on first `hello` or first frame naming them,
/// and never deleted: the surviving side may reconnect at any time.
pub async fn get_or_create_session(sessions: &SessionMap, name: &str) -> Arc<Mutex<SessionState>> {
    {
        let map = sessions.read().await;
        if let Some(session) = map.get(name) {
            return session.clone();
        }
    }
    let mut map = sessions.write().await;
    map.entry(name.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(name))))
        .clone()
}

/// Commands for a live socket's writer task.
#[derive(Debug)]
pub enum SocketOut {
    Frame(Frame),
    Ping,
    Pong(Vec<u8>),
    Close { reason: String },
}

/// Handle to the writer task of one connected socket. `conn_id` lets a
/// replaced connection's teardown recognize it no longer owns the channel.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    pub conn_id: Uuid,
    pub tx: mpsc::UnboundedSender<SocketOut>,
}

/// One role's mailbox: the live socket (if any), frames waiting for the role
/// to (re)connect, and attached long-poll streams.
#[derive(Debug, Default)]
pub struct ChannelState {
    socket: Option<SocketHandle>,
    queue: VecDeque<Frame>,
    streams: Vec<mpsc::UnboundedSender<Frame>>,
}

#[derive(Debug)]
pub struct SessionState {
    pub name: String,
    lan: ChannelState,
    proxy: ChannelState,
    /// Outstanding `http-request` ids mapped to their originator role.
    requests: HashMap<String, Role>,
    /// Active CONNECT tunnel ids mapped to their originator role.
    tunnels: HashMap<String, Role>,
}

impl SessionState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lan: ChannelState::default(),
            proxy: ChannelState::default(),
            requests: HashMap::new(),
            tunnels: HashMap::new(),
        }
    }

    fn channel_mut(&mut self, role: Role) -> &mut ChannelState {
        match role {
            Role::Lan => &mut self.lan,
            Role::Proxy => &mut self.proxy,
        }
    }

    pub fn has_socket(&self, role: Role) -> bool {
        match role {
            Role::Lan => self.lan.socket.is_some(),
            Role::Proxy => self.proxy.socket.is_some(),
        }
    }

    /// Deliver a frame to a role: live socket first, then the first attached
    /// long-poll stream, else the queue.
    pub fn respond(&mut self, role: Role, frame: Frame) {
        let channel = self.channel_mut(role);
        let mut frame = frame;

        if let Some(handle) = &channel.socket {
            match handle.tx.send(SocketOut::Frame(frame)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(out)) => {
                    // The writer is gone but the handle stays installed: the
                    // owning read loop must still find its conn_id here so
                    // socket_disconnected runs the role cleanup. The frame
                    // falls through to the streams / queue path.
                    frame = match out {
                        SocketOut::Frame(frame) => frame,
                        _ => return,
                    };
                }
            }
        }

        channel.streams.retain(|stream| !stream.is_closed());
        if let Some(stream) = channel.streams.first() {
            match stream.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(recovered)) => frame = recovered,
            }
        }

        channel.queue.push_back(frame);
    }

    /// Install a new live socket for `(session, role)`. A prior socket is
    /// told to close with a "replaced" reason; its teardown must not disturb
    /// the session (see [`SessionState::socket_disconnected`]).
    pub fn install_socket(&mut self, role: Role, handle: SocketHandle) {
        let channel = self.channel_mut(role);
        if let Some(old) = channel.socket.replace(handle) {
            warn!(session = %self.name, %role, "Live socket replaced by a new hello.");
            let _ = old.tx.send(SocketOut::Close { reason: "replaced".to_string() });
        }
    }

    /// Flush queued frames to the role's live socket, oldest first. Called
    /// right after `hello-ack`, before any new input is processed.
    pub fn drain_queue_to_socket(&mut self, role: Role) {
        let channel = self.channel_mut(role);
        let Some(handle) = channel.socket.clone() else {
            return;
        };
        while let Some(frame) = channel.queue.pop_front() {
            if let Err(mpsc::error::SendError(SocketOut::Frame(frame))) =
                handle.tx.send(SocketOut::Frame(frame))
            {
                // dead writer: keep the frame queued and the handle installed
                // so the owning read loop's teardown still runs cleanup
                channel.queue.push_front(frame);
                break;
            }
        }
    }

    /// Attach a long-poll stream: the queue drains into it in FIFO order
    /// before it can receive anything newly arriving.
    pub fn attach_stream(&mut self, role: Role, tx: mpsc::UnboundedSender<Frame>) {
        let channel = self.channel_mut(role);
        while let Some(frame) = channel.queue.pop_front() {
            if let Err(mpsc::error::SendError(frame)) = tx.send(frame) {
                channel.queue.push_front(frame);
                return;
            }
        }
        channel.streams.push(tx);
    }

    /// Route one frame arriving from `from`. Returns an `error` frame to hand
    /// back to the sender when the frame is not acceptable from that role.
    pub fn route_from(&mut self, from: Role, frame: Frame) -> Option<Frame> {
        match (from, frame) {
            (Role::Proxy, frame @ Frame::HttpRequest { .. }) => {
                if let Some(id) = frame.id() {
                    self.requests.insert(id.to_string(), Role::Proxy);
                }
                self.respond(Role::Lan, frame);
                None
            }
            (Role::Proxy, frame @ Frame::ConnectStart { .. }) => {
                if let Some(id) = frame.id() {
                    self.tunnels.insert(id.to_string(), Role::Proxy);
                }
                self.respond(Role::Lan, frame);
                None
            }
            (Role::Proxy, frame @ (Frame::ConnectData { .. } | Frame::ConnectEnd { .. })) => {
                self.respond(Role::Lan, frame);
                None
            }
            (Role::Lan, frame @ Frame::HttpResponse { .. }) => {
                let id = frame.id().unwrap_or_default().to_string();
                match self.requests.remove(&id) {
                    Some(Role::Proxy) => self.respond(Role::Proxy, frame),
                    _ => debug!(session = %self.name, id, "Dropped http-response with no outstanding request."),
                }
                None
            }
            (Role::Lan, frame @ (Frame::ConnectAck { .. } | Frame::ConnectData { .. })) => {
                let id = frame.id().unwrap_or_default().to_string();
                match self.tunnels.get(&id) {
                    Some(&origin) => self.respond(origin, frame),
                    None => debug!(session = %self.name, id, "Dropped tunnel frame with no active tunnel."),
                }
                None
            }
            (Role::Lan, frame @ (Frame::ConnectError { .. } | Frame::ConnectEnd { .. })) => {
                let id = frame.id().unwrap_or_default().to_string();
                match self.tunnels.remove(&id) {
                    Some(origin) => self.respond(origin, frame),
                    None => debug!(session = %self.name, id, "Dropped tunnel close with no active tunnel."),
                }
                None
            }
            (from, frame) => {
                let tag = serde_json::to_value(&frame)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str().map(String::from)))
                    .unwrap_or_else(|| "unknown".to_string());
                Some(Frame::Error {
                    message: format!("unexpected frame '{tag}' from role '{from}'"),
                })
            }
        }
    }

    /// Teardown after a live socket drops. Only the connection that still
    /// owns the channel runs cleanup; a replaced socket's teardown is a no-op.
    pub fn socket_disconnected(&mut self, role: Role, conn_id: Uuid) {
        let channel = self.channel_mut(role);
        match &channel.socket {
            Some(handle) if handle.conn_id == conn_id => channel.socket = None,
            _ => return,
        }
        match role {
            Role::Lan => self.lan_disconnected(),
            Role::Proxy => self.proxy_disconnected(),
        }
    }

    /// Every proxy-originated request gets a terminal `http-response{error}`,
    /// every proxy-originated tunnel a `connect-error`, and both maps clear.
    fn lan_disconnected(&mut self) {
        for (id, origin) in std::mem::take(&mut self.requests) {
            if origin == Role::Proxy {
                self.respond(
                    Role::Proxy,
                    Frame::HttpResponse {
                        id,
                        status: None,
                        headers: None,
                        body_base64: None,
                        error: Some("LAN disconnected".to_string()),
                    },
                );
            }
        }
        for (id, origin) in std::mem::take(&mut self.tunnels) {
            if origin == Role::Proxy {
                self.respond(
                    Role::Proxy,
                    Frame::ConnectError {
                        id,
                        message: "LAN disconnected".to_string(),
                    },
                );
            }
        }
    }

    /// Drop the proxy's outstanding requests and tell the LAN agent to close
    /// the target socket of every tunnel the proxy owned.
    fn proxy_disconnected(&mut self) {
        self.requests.retain(|_, origin| *origin != Role::Proxy);
        let owned: Vec<String> = self
            .tunnels
            .iter()
            .filter(|(_, origin)| **origin == Role::Proxy)
            .map(|(id, _)| id.clone())
            .collect();
        for id in owned {
            self.tunnels.remove(&id);
            self.respond(Role::Lan, Frame::ConnectEnd { id });
        }
    }

    #[cfg(test)]
    pub fn outstanding_requests(&self) -> usize {
        self.requests.len()
    }

    #[cfg(test)]
    pub fn active_tunnels(&self) -> usize {
        self.tunnels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HttpRequestPayload;
    use std::collections::HashMap as StdHashMap;

    fn http_request(id: &str) -> Frame {
        Frame::HttpRequest {
            id: id.to_string(),
            request: HttpRequestPayload {
                method: "GET".to_string(),
                url: "http://example.test/".to_string(),
                headers: StdHashMap::new(),
                body_base64: String::new(),
            },
        }
    }

    fn socket(conn_id: Uuid) -> (SocketHandle, mpsc::UnboundedReceiver<SocketOut>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SocketHandle { conn_id, tx }, rx)
    }

    #[test]
    fn frames_queue_without_a_socket_and_drain_in_order() {
        let mut session = SessionState::new("s");
        session.respond(Role::Lan, Frame::ConnectEnd { id: "1".to_string() });
        session.respond(Role::Lan, Frame::ConnectEnd { id: "2".to_string() });

        let conn_id = Uuid::new_v4();
        let (handle, mut rx) = socket(conn_id);
        session.install_socket(Role::Lan, handle);
        session.drain_queue_to_socket(Role::Lan);

        let ids: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|out| match out {
                SocketOut::Frame(frame) => frame.id().map(str::to_string),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn new_hello_replaces_and_closes_old_socket() {
        let mut session = SessionState::new("s");
        let (old, mut old_rx) = socket(Uuid::new_v4());
        let old_id = old.conn_id;
        session.install_socket(Role::Proxy, old);
        let (new, _new_rx) = socket(Uuid::new_v4());
        session.install_socket(Role::Proxy, new);

        match old_rx.try_recv().unwrap() {
            SocketOut::Close { reason } => assert_eq!(reason, "replaced"),
            other => panic!("expected close, got {other:?}"),
        }

        // the replaced connection's teardown must not clear the new socket
        session.socket_disconnected(Role::Proxy, old_id);
        assert!(session.has_socket(Role::Proxy));
    }

    #[test]
    fn lan_disconnect_synthesizes_terminal_frames() {
        let mut session = SessionState::new("s");
        assert!(session.route_from(Role::Proxy, http_request("r1")).is_none());
        assert!(session
            .route_from(
                Role::Proxy,
                Frame::ConnectStart {
                    id: "t1".to_string(),
                    host: "h".to_string(),
                    port: 443,
                },
            )
            .is_none());

        let (proxy_handle, mut proxy_rx) = socket(Uuid::new_v4());
        session.install_socket(Role::Proxy, proxy_handle);

        let (lan_handle, _lan_rx) = socket(Uuid::new_v4());
        let lan_id = lan_handle.conn_id;
        session.install_socket(Role::Lan, lan_handle);
        session.socket_disconnected(Role::Lan, lan_id);

        assert_eq!(session.outstanding_requests(), 0);
        assert_eq!(session.active_tunnels(), 0);

        let mut saw_response = false;
        let mut saw_tunnel_error = false;
        while let Ok(out) = proxy_rx.try_recv() {
            match out {
                SocketOut::Frame(Frame::HttpResponse { id, error, .. }) => {
                    assert_eq!(id, "r1");
                    assert_eq!(error.as_deref(), Some("LAN disconnected"));
                    saw_response = true;
                }
                SocketOut::Frame(Frame::ConnectError { id, message }) => {
                    assert_eq!(id, "t1");
                    assert_eq!(message, "LAN disconnected");
                    saw_tunnel_error = true;
                }
                _ => {}
            }
        }
        assert!(saw_response && saw_tunnel_error);
    }

    #[test]
    fn proxy_disconnect_ends_owned_tunnels_toward_lan() {
        let mut session = SessionState::new("s");
        session.route_from(Role::Proxy, http_request("r1"));
        session.route_from(
            Role::Proxy,
            Frame::ConnectStart {
                id: "t1".to_string(),
                host: "h".to_string(),
                port: 22,
            },
        );

        let (proxy_handle, _rx) = socket(Uuid::new_v4());
        let proxy_id = proxy_handle.conn_id;
        session.install_socket(Role::Proxy, proxy_handle);
        session.socket_disconnected(Role::Proxy, proxy_id);

        assert_eq!(session.outstanding_requests(), 0);
        assert_eq!(session.active_tunnels(), 0);

        // the connect-start queued for the absent LAN plus the synthesized end
        let (lan_handle, mut lan_rx) = socket(Uuid::new_v4());
        session.install_socket(Role::Lan, lan_handle);
        session.drain_queue_to_socket(Role::Lan);
        let mut tags = Vec::new();
        while let Ok(SocketOut::Frame(frame)) = lan_rx.try_recv() {
            tags.push(match frame {
                Frame::HttpRequest { .. } => "http-request",
                Frame::ConnectStart { .. } => "connect-start",
                Frame::ConnectEnd { .. } => "connect-end",
                _ => "other",
            });
        }
        assert_eq!(tags, vec!["http-request", "connect-start", "connect-end"]);
    }

    #[test]
    fn cleanup_survives_send_failure_before_disconnect() {
        let mut session = SessionState::new("s");
        session.route_from(Role::Proxy, http_request("r1"));

        let (proxy_handle, mut proxy_rx) = socket(Uuid::new_v4());
        session.install_socket(Role::Proxy, proxy_handle);

        // a LAN socket whose writer task has already died
        let (lan_handle, lan_rx) = socket(Uuid::new_v4());
        let lan_id = lan_handle.conn_id;
        session.install_socket(Role::Lan, lan_handle);
        drop(lan_rx);

        // routing discovers the dead writer; the channel must still be owned
        // by that connection so its teardown runs the LAN cleanup
        session.route_from(Role::Proxy, http_request("r2"));
        assert!(session.has_socket(Role::Lan));

        session.socket_disconnected(Role::Lan, lan_id);
        assert_eq!(session.outstanding_requests(), 0);

        let mut failed = Vec::new();
        while let Ok(out) = proxy_rx.try_recv() {
            if let SocketOut::Frame(Frame::HttpResponse { id, error, .. }) = out {
                assert_eq!(error.as_deref(), Some("LAN disconnected"));
                failed.push(id);
            }
        }
        failed.sort();
        assert_eq!(failed, vec!["r1", "r2"]);
    }

    #[test]
    fn http_response_routes_once_then_entry_is_gone() {
        let mut session = SessionState::new("s");
        session.route_from(Role::Proxy, http_request("r1"));

        let response = Frame::HttpResponse {
            id: "r1".to_string(),
            status: Some(200),
            headers: None,
            body_base64: Some(String::new()),
            error: None,
        };
        assert!(session.route_from(Role::Lan, response.clone()).is_none());
        assert_eq!(session.outstanding_requests(), 0);

        // a late duplicate is dropped silently
        assert!(session.route_from(Role::Lan, response).is_none());
    }

    #[test]
    fn unexpected_frames_bounce_an_error() {
        let mut session = SessionState::new("s");
        let reply = session.route_from(
            Role::Proxy,
            Frame::HttpResponse {
                id: "x".to_string(),
                status: Some(200),
                headers: None,
                body_base64: None,
                error: None,
            },
        );
        match reply {
            Some(Frame::Error { message }) => assert!(message.contains("http-response"), "{message}"),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn attached_stream_drains_queue_fifo() {
        let mut session = SessionState::new("s");
        session.respond(Role::Proxy, Frame::ConnectEnd { id: "1".to_string() });
        session.respond(Role::Proxy, Frame::ConnectEnd { id: "2".to_string() });

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach_stream(Role::Proxy, tx);
        session.respond(Role::Proxy, Frame::ConnectEnd { id: "3".to_string() });

        let ids: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|frame| frame.id().map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }
}
