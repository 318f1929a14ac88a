//! Non-blocking HTTP listener shared by the mode subsystems.
//!
//! Uses `tiny_http` which works on both host and ESP32 (via std::net). The
//! listener is bound in a subsystem's `begin()`, polled with `try_recv` from
//! its `tick()` and dropped in `end()`, so the socket never outlives the
//! mode that owns it.
//!
//! Dropping a `tiny_http::Server` only signals its accept thread, which
//! closes the socket some time later. [`HttpListener::close`] waits for the
//! port to become bindable again so the next mode can reuse it.

use super::SubsystemError;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use std::net::{IpAddr, TcpListener};
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Response, Server};

/// Requests handled per tick so a busy client cannot starve the loop.
pub const MAX_REQUESTS_PER_TICK: usize = 4;

/// Request bodies beyond this are truncated.
pub const MAX_BODY_LEN: u64 = 4096;

/// A client that sent nothing for this long no longer counts toward the limit.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on waiting for a closed listener to release its port.
pub const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

const PORT_RELEASE_POLL: Duration = Duration::from_millis(5);

/// Parsed request handed to a subsystem's router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub body: String,
    pub peer: Option<IpAddr>,
}

impl HttpRequest {
    pub fn new(method: Method, url: &str, body: impl Into<String>) -> Self {
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (url.to_string(), None),
        };
        Self {
            method,
            path,
            query,
            body: body.into(),
            peer: None,
        }
    }

    /// Body fields from either a JSON object or a url-encoded form.
    pub fn fields(&self) -> HashMap<String, String> {
        let body = self.body.trim();
        if body.starts_with('{') {
            if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(body) {
                return map
                    .into_iter()
                    .map(|(k, v)| {
                        let v = match v {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        (k, v)
                    })
                    .collect();
            }
        }
        url::form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect()
    }

    /// Query string parameters.
    pub fn query_params(&self) -> HashMap<String, String> {
        self.query
            .as_deref()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default()
    }
}

/// Response produced by a router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    pub fn json(status: u16, value: &impl Serialize) -> Self {
        let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: body.into(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    /// `{"success":false,"message":...}` with the given status.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(
            status,
            &serde_json::json!({ "success": false, "message": message.into() }),
        )
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not Found")
    }

    pub fn method_not_allowed() -> Self {
        Self::text(405, "Method Not Allowed")
    }

    pub fn busy() -> Self {
        Self::text(503, "Server busy, try again later")
    }
}

/// Tracks distinct peers and enforces a concurrent-client cap.
#[derive(Debug)]
pub struct ClientTracker {
    max_clients: usize,
    last_seen: HashMap<IpAddr, Instant>,
}

impl ClientTracker {
    pub fn new(max_clients: usize) -> Self {
        Self {
            max_clients,
            last_seen: HashMap::new(),
        }
    }

    /// Record a request from `peer`. Returns `false` if it must be refused.
    pub fn admit(&mut self, peer: IpAddr, now: Instant) -> bool {
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < CLIENT_IDLE_TIMEOUT);

        if !self.last_seen.contains_key(&peer) && self.last_seen.len() >= self.max_clients {
            return false;
        }
        self.last_seen.insert(peer, now);
        true
    }

    pub fn active(&self) -> usize {
        self.last_seen.len()
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}

/// A `tiny_http` server polled from the controller loop.
pub struct HttpListener {
    name: &'static str,
    port: u16,
    server: Option<Server>,
    clients: ClientTracker,
}

impl HttpListener {
    pub fn new(name: &'static str, port: u16, max_clients: usize) -> Self {
        Self {
            name,
            port,
            server: None,
            clients: ClientTracker::new(max_clients),
        }
    }

    /// Bind `0.0.0.0:<port>`. Port 0 picks a free port.
    pub fn bind(&mut self) -> Result<(), SubsystemError> {
        if self.server.is_some() {
            return Ok(());
        }
        let addr = format!("0.0.0.0:{}", self.port);
        let server = Server::http(&addr).map_err(|e| SubsystemError::Bind {
            port: self.port,
            reason: e.to_string(),
        })?;
        info!("{} listening on http://{}", self.name, addr);
        self.server = Some(server);
        Ok(())
    }

    /// Drop the socket and wait until its port can be bound again. Safe to
    /// call repeatedly.
    pub fn close(&mut self) {
        if let Some(server) = self.server.take() {
            let port = server.server_addr().to_ip().map(|addr| addr.port());
            drop(server);
            if let Some(port) = port {
                self.wait_port_released(port);
            }
            info!("{} listener closed", self.name);
        }
        self.clients.clear();
    }

    /// Poll-bind `port` until the accept thread has let go of it.
    fn wait_port_released(&self, port: u16) {
        let started = Instant::now();
        loop {
            match TcpListener::bind(("0.0.0.0", port)) {
                Ok(_) => {
                    debug!(
                        "{} port {} released after {}ms",
                        self.name,
                        port,
                        started.elapsed().as_millis()
                    );
                    return;
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::AddrInUse
                        && started.elapsed() < PORT_RELEASE_TIMEOUT =>
                {
                    std::thread::sleep(PORT_RELEASE_POLL);
                }
                Err(e) => {
                    warn!("{} port {} still busy after close: {}", self.name, port, e);
                    return;
                }
            }
        }
    }

    pub fn is_bound(&self) -> bool {
        self.server.is_some()
    }

    /// Port actually bound (differs from the configured one for port 0).
    pub fn local_port(&self) -> Option<u16> {
        self.server
            .as_ref()
            .and_then(|s| s.server_addr().to_ip())
            .map(|addr| addr.port())
    }

    pub fn active_clients(&self) -> usize {
        self.clients.active()
    }

    /// Serve up to [`MAX_REQUESTS_PER_TICK`] pending requests without blocking.
    pub fn poll(&mut self, now: Instant, mut route: impl FnMut(&HttpRequest) -> Reply) {
        let Some(server) = self.server.as_ref() else {
            return;
        };

        for _ in 0..MAX_REQUESTS_PER_TICK {
            let mut request = match server.try_recv() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!("{} receive error: {}", self.name, e);
                    break;
                }
            };

            let peer = request.remote_addr().map(|addr| addr.ip());
            let reply = match peer {
                Some(ip) if !self.clients.admit(ip, now) => {
                    warn!("{} refusing {}: client limit reached", self.name, ip);
                    Reply::busy()
                }
                _ => {
                    let mut body = String::new();
                    if let Err(e) = request
                        .as_reader()
                        .take(MAX_BODY_LEN)
                        .read_to_string(&mut body)
                    {
                        debug!("{} unreadable body: {}", self.name, e);
                    }
                    let mut parsed = HttpRequest::new(request.method().clone(), request.url(), body);
                    parsed.peer = peer;
                    route(&parsed)
                }
            };

            let content_type = Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes())
                .expect("static header");
            let response = Response::from_string(reply.body)
                .with_status_code(reply.status)
                .with_header(content_type);
            if let Err(e) = request.respond(response) {
                warn!("{} failed to send response: {}", self.name, e);
            }
        }
    }
}

impl Drop for HttpListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::free_tcp_port;
    use std::io::Write;
    use std::net::TcpStream;

    // ==================== Request Parsing Tests ====================

    #[test]
    fn test_split_query() {
        let req = HttpRequest::new(Method::Post, "/relays/3/on?duration=30", "");
        assert_eq!(req.path, "/relays/3/on");
        assert_eq!(req.query_params().get("duration").map(String::as_str), Some("30"));
    }

    #[test]
    fn test_form_fields() {
        let req = HttpRequest::new(
            Method::Post,
            "/api/connect-wifi",
            "ssid=Home+Net&password=secret%21123",
        );
        let fields = req.fields();
        assert_eq!(fields["ssid"], "Home Net");
        assert_eq!(fields["password"], "secret!123");
    }

    #[test]
    fn test_json_fields() {
        let req = HttpRequest::new(
            Method::Post,
            "/api/connect-wifi",
            r#"{"ssid":"HomeNet","password":"secret123","channel":6}"#,
        );
        let fields = req.fields();
        assert_eq!(fields["ssid"], "HomeNet");
        assert_eq!(fields["channel"], "6");
    }

    // ==================== ClientTracker Tests ====================

    #[test]
    fn test_client_limit() {
        let now = Instant::now();
        let mut tracker = ClientTracker::new(2);
        let a: IpAddr = "192.168.4.2".parse().unwrap();
        let b: IpAddr = "192.168.4.3".parse().unwrap();
        let c: IpAddr = "192.168.4.4".parse().unwrap();

        assert!(tracker.admit(a, now));
        assert!(tracker.admit(b, now));
        assert!(!tracker.admit(c, now));
        // Known clients keep access
        assert!(tracker.admit(a, now));
        assert_eq!(tracker.active(), 2);
    }

    #[test]
    fn test_idle_clients_expire() {
        let now = Instant::now();
        let mut tracker = ClientTracker::new(1);
        let a: IpAddr = "192.168.4.2".parse().unwrap();
        let b: IpAddr = "192.168.4.3".parse().unwrap();

        assert!(tracker.admit(a, now));
        assert!(!tracker.admit(b, now + Duration::from_secs(10)));
        assert!(tracker.admit(b, now + CLIENT_IDLE_TIMEOUT + Duration::from_secs(1)));
    }

    // ==================== Listener Tests ====================

    #[test]
    fn test_bind_close_idempotent() {
        let mut listener = HttpListener::new("test", 0, 2);
        listener.bind().unwrap();
        assert!(listener.is_bound());
        assert!(listener.local_port().is_some());
        listener.close();
        listener.close();
        assert!(!listener.is_bound());
        assert_eq!(listener.local_port(), None);
    }

    #[test]
    fn test_port_rebindable_right_after_close() {
        let port = free_tcp_port().unwrap();
        let mut listener = HttpListener::new("test", port, 2);
        for round in 0..50 {
            listener
                .bind()
                .unwrap_or_else(|e| panic!("rebind {} failed: {}", round, e));
            assert_eq!(listener.local_port(), Some(port));
            listener.close();
        }
    }

    #[test]
    fn test_other_listener_can_take_port_after_close() {
        let port = free_tcp_port().unwrap();
        let mut portal = HttpListener::new("portal", port, 2);
        let mut stats = HttpListener::new("stats", port, 2);
        for _ in 0..20 {
            portal.bind().unwrap();
            portal.close();
            stats.bind().unwrap();
            stats.close();
        }
    }

    #[test]
    fn test_poll_without_bind_is_noop() {
        let mut listener = HttpListener::new("test", 0, 2);
        listener.poll(Instant::now(), |_| panic!("no requests expected"));
    }

    #[test]
    fn test_serves_request() {
        let mut listener = HttpListener::new("test", 0, 2);
        listener.bind().unwrap();
        let port = listener.local_port().unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut served = false;
        for _ in 0..200 {
            listener.poll(Instant::now(), |req| {
                served = true;
                assert_eq!(req.path, "/ping");
                Reply::text(200, "pong")
            });
            if served {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(served, "request was not received");

        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("pong"));
    }
}
