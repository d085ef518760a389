//! Local proxy entry point and exit-side bridging
//!
//! The entry side accepts plain TCP from a local HTTP client, reassembles
//! the request header (which may span several reads), rewrites it for
//! tunneling, and bridges the connection onto a stream over the node's own
//! circuit. `CONNECT` requests are answered locally with `200 Connection
//! Established` and become opaque byte tunnels; other requests get their
//! keep-alive stripped and their version downgraded to HTTP/1.0 so the
//! response ends with the connection.
//!
//! The exit side is the mirror image: a Begin arriving at the end of a
//! circuit resolves the destination, opens a real TCP connection, and
//! bridges bytes back as Data cells. Response headers get the same
//! keep-alive/version rewrite on their way back to the client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::protocol::{
    decode_begin_body, CircuitBuilder, RouteEndpoint, StreamEndpoint, StreamId, StreamKey,
    StreamMultiplexer,
};

enum EdgeMsg {
    Data(Vec<u8>),
    End,
}

/// Bridges local TCP connections to circuit streams, on both ends of the
/// path.
pub struct ProxyFront {
    mux: Arc<StreamMultiplexer>,
    builder: Arc<CircuitBuilder>,
    idle: Duration,
    edges: Mutex<HashMap<StreamKey, mpsc::UnboundedSender<EdgeMsg>>>,
    self_ref: Weak<Self>,
}

impl ProxyFront {
    pub fn new(
        mux: Arc<StreamMultiplexer>,
        builder: Arc<CircuitBuilder>,
        idle: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            mux,
            builder,
            idle,
            edges: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Accept local clients until the listener is closed.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            log::info!("proxy listening on {}", addr);
        }
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    log::debug!("proxy connection from {}", peer);
                    let this = Arc::clone(&self);
                    tokio::spawn(this.handle_client(socket));
                }
                Err(e) => {
                    log::warn!("proxy accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_client(self: Arc<Self>, socket: TcpStream) {
        let (mut read_half, mut write_half) = socket.into_split();

        // Reassemble the request header; clients may dribble it across
        // packets.
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let (header_len, body_start) = loop {
            let n = match tokio::time::timeout(self.idle, read_half.read(&mut chunk)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return,
                Ok(Ok(n)) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            if let Some(positions) = find_header_end(&buf) {
                break positions;
            }
        };

        let header = String::from_utf8_lossy(&buf[..header_len]).into_owned();
        let Some(request) = parse_request_header(&header) else {
            log::debug!("unparseable request header, dropping client");
            return;
        };
        log::info!("{} {}", request.method, strip_query(&request.target));

        let Some(own) = self.builder.own_circuit() else {
            log::warn!("proxy request before own circuit is up");
            return;
        };

        let address = resolve_host(&request.host).await;
        let stream = match self
            .mux
            .begin(own.conn, own.circuit, &address, request.port)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                log::info!("begin to {}:{} failed: {}", request.host, request.port, e);
                if request.connect {
                    let _ = write_half
                        .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                        .await;
                }
                return;
            }
        };

        let key = StreamKey::new(own.conn, own.circuit, stream);
        // Tunnels pass response bytes through untouched; plain requests get
        // the response header rewritten on the way back.
        let edge = self.bind_edge(key, write_half, request.connect);

        if request.connect {
            let _ = edge.send(EdgeMsg::Data(
                b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec(),
            ));
        } else {
            let mut first = request.header.into_bytes();
            first.extend_from_slice(&buf[body_start..]);
            if self.mux.send(key, &first).await.is_err() {
                self.end_connection(key).await;
                return;
            }
        }

        self.relay_reads(key, read_half).await;
        self.end_connection(key).await;
    }

    /// Pump bytes from a TCP read half into Data cells until close, error
    /// or idle timeout.
    async fn relay_reads(&self, key: StreamKey, mut read_half: OwnedReadHalf) {
        let mut chunk = [0u8; 8192];
        loop {
            let n = match tokio::time::timeout(self.idle, read_half.read(&mut chunk)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return,
                Ok(Ok(n)) => n,
            };
            if self.mux.send(key, &chunk[..n]).await.is_err() {
                return;
            }
        }
    }

    /// Register the stream-to-socket binding and spawn the writer task.
    fn bind_edge(
        &self,
        key: StreamKey,
        mut write_half: OwnedWriteHalf,
        passthrough: bool,
    ) -> mpsc::UnboundedSender<EdgeMsg> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.edges
            .lock()
            .expect("poisoned lock")
            .insert(key, tx.clone());

        tokio::spawn(async move {
            let mut rewriter = ResponseRewriter::new(passthrough);
            while let Some(msg) = rx.recv().await {
                match msg {
                    EdgeMsg::Data(bytes) => {
                        if let Some(out) = rewriter.push(bytes) {
                            if write_half.write_all(&out).await.is_err() {
                                break;
                            }
                        }
                    }
                    EdgeMsg::End => break,
                }
            }
            let _ = write_half.shutdown().await;
        });

        tx
    }

    /// Tear down one stream/socket pair. Idempotent; the echoing End is
    /// only sent the first time.
    async fn end_connection(&self, key: StreamKey) {
        let edge = self.edges.lock().expect("poisoned lock").remove(&key);
        if let Some(edge) = edge {
            let _ = edge.send(EdgeMsg::End);
            let _ = self.mux.end(key).await;
        }
    }

    /// Exit side: service a Begin by connecting out to the destination.
    async fn handle_begin(self: Arc<Self>, key: StreamKey, body: Vec<u8>) {
        let (host, port) = match decode_begin_body(&body) {
            Ok(target) => target,
            Err(e) => {
                log::debug!("malformed begin body: {}", e);
                let _ = self.mux.begin_failed(key).await;
                return;
            }
        };

        match TcpStream::connect((host.as_str(), port)).await {
            Ok(socket) => {
                log::info!("exit connected to {}:{}", host, port);
                let (read_half, write_half) = socket.into_split();
                self.bind_edge(key, write_half, true);
                if self.mux.connected(key).await.is_err() {
                    self.end_connection(key).await;
                    return;
                }
                self.relay_reads(key, read_half).await;
                self.end_connection(key).await;
            }
            Err(e) => {
                log::info!("exit connect to {}:{} failed: {}", host, port, e);
                let _ = self.mux.begin_failed(key).await;
            }
        }
    }

    /// Close every bound socket and forget all streams. Used on restart.
    pub fn shutdown(&self) {
        let edges: Vec<_> = {
            let mut map = self.edges.lock().expect("poisoned lock");
            map.drain().collect()
        };
        for (_, edge) in edges {
            let _ = edge.send(EdgeMsg::End);
        }
    }
}

impl StreamEndpoint for ProxyFront {
    fn on_begin(&self, from: RouteEndpoint, stream: StreamId, body: Vec<u8>) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let key = StreamKey::new(from.conn, from.circuit, stream);
        tokio::spawn(this.handle_begin(key, body));
    }

    fn on_data(&self, from: RouteEndpoint, stream: StreamId, body: Vec<u8>) {
        let key = StreamKey::new(from.conn, from.circuit, stream);
        let edges = self.edges.lock().expect("poisoned lock");
        match edges.get(&key) {
            Some(edge) => {
                let _ = edge.send(EdgeMsg::Data(body));
            }
            None => log::debug!("data for unbound stream {:?}", key),
        }
    }

    fn on_end(&self, from: RouteEndpoint, stream: StreamId) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let key = StreamKey::new(from.conn, from.circuit, stream);
        tokio::spawn(async move { this.end_connection(key).await });
    }
}

/// Rewrites the first response header passing through, then goes
/// transparent. Tunnels start transparent.
struct ResponseRewriter {
    done: bool,
    buf: Vec<u8>,
}

impl ResponseRewriter {
    fn new(passthrough: bool) -> Self {
        Self {
            done: passthrough,
            buf: Vec::new(),
        }
    }

    fn push(&mut self, bytes: Vec<u8>) -> Option<Vec<u8>> {
        if self.done {
            return Some(bytes);
        }
        self.buf.extend_from_slice(&bytes);
        let (header_len, body_start) = find_header_end(&self.buf)?;
        let header = String::from_utf8_lossy(&self.buf[..header_len]).into_owned();
        let mut out = rewrite_response_header(&header).into_bytes();
        out.extend_from_slice(&self.buf[body_start..]);
        self.done = true;
        self.buf.clear();
        Some(out)
    }
}

/// Locate the end of an HTTP header, tolerating CRLF and bare LF line
/// endings. Returns (header length, body offset) — the header includes its
/// final line break but not the blank line.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != b'\n' {
            i += 1;
            continue;
        }
        // One line break consumed; a second (optionally \r-prefixed) ends
        // the header.
        let mut j = i + 1;
        if j < buf.len() && buf[j] == b'\r' {
            j += 1;
        }
        if j < buf.len() && buf[j] == b'\n' {
            return Some((i + 1, j + 1));
        }
        i += 1;
    }
    None
}

struct ParsedRequest {
    method: String,
    target: String,
    connect: bool,
    host: String,
    port: u16,
    /// Rewritten header, CRLF joined, ready to forward.
    header: String,
}

/// Parse and rewrite a request header: extract the destination from the
/// Host header (falling back to the request target), neutralize
/// keep-alive, downgrade to HTTP/1.0.
fn parse_request_header(header: &str) -> Option<ParsedRequest> {
    let mut lines: Vec<String> = header
        .split(['\n'])
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }

    let mut first = lines.first()?.split_whitespace();
    let method = first.next()?.to_string();
    let target = first.next()?.to_string();
    let connect = method == "CONNECT";

    let mut host = None;
    let mut port = None;
    for line in lines.iter_mut().skip(1) {
        if let Some(closed) = neutralize_keep_alive(line) {
            *line = closed;
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("host:") {
            let value = value.trim();
            match value.rsplit_once(':') {
                Some((name, p)) if p.parse::<u16>().is_ok() => {
                    host = Some(name.to_string());
                    port = p.parse().ok();
                }
                _ => host = Some(value.to_string()),
            }
        }
    }

    // No explicit port on the Host header: take it from the target, or
    // infer it from the scheme.
    let port = port.unwrap_or_else(|| target_port(&target));

    let host = host.or_else(|| {
        // CONNECT targets carry host:port directly.
        target
            .rsplit_once(':')
            .filter(|(_, p)| p.parse::<u16>().is_ok())
            .map(|(name, _)| name.to_string())
    })?;

    lines[0] = format!("{} {} HTTP/1.0", method, target);
    let mut rewritten = lines.join("\r\n");
    rewritten.push_str("\r\n\r\n");

    Some(ParsedRequest {
        method,
        target,
        connect,
        host,
        port,
        header: rewritten,
    })
}

fn target_port(target: &str) -> u16 {
    if let Some((_, p)) = target.rsplit_once(':') {
        if let Ok(port) = p.parse::<u16>() {
            return port;
        }
    }
    if target.to_ascii_lowercase().starts_with("https") {
        443
    } else {
        80
    }
}

/// Rewrite a `Connection: keep-alive` line to `close`, whatever letter
/// case the peer used.
fn neutralize_keep_alive(line: &str) -> Option<String> {
    let lower = line.to_ascii_lowercase();
    if !lower.contains("onnection: keep-alive") {
        return None;
    }
    let idx = lower.find("keep-alive")?;
    let mut out = String::with_capacity(line.len());
    out.push_str(&line[..idx]);
    out.push_str("close");
    out.push_str(&line[idx + "keep-alive".len()..]);
    Some(out)
}

/// Keep-alive and version rewrite for response headers, header bytes only.
fn rewrite_response_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    for (i, line) in header.split_inclusive('\n').enumerate() {
        let lower = line.to_ascii_lowercase();
        if i == 0 && lower.contains("http/1.1") {
            let idx = lower.find("http/1.1").unwrap_or(0);
            out.push_str(&line[..idx]);
            out.push_str("HTTP/1.0");
            out.push_str(&line[idx + 8..]);
        } else if let Some(closed) = neutralize_keep_alive(line) {
            out.push_str(&closed);
        } else {
            out.push_str(line);
        }
    }
    out
}

fn strip_query(target: &str) -> &str {
    match target.rfind('?') {
        Some(idx) => &target[..idx],
        None => target,
    }
}

/// Best-effort resolution to an address the exit can dial. Failure keeps
/// the name; the exit resolves again on connect.
async fn resolve_host(host: &str) -> String {
    match tokio::net::lookup_host((host, 0)).await {
        Ok(mut addrs) => addrs
            .find(|addr| addr.is_ipv4())
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| host.to_string()),
        Err(_) => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_end_crlf() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody";
        let (header_len, body_start) = find_header_end(buf).unwrap();
        assert_eq!(&buf[..header_len], b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(&buf[body_start..], b"body");
    }

    #[test]
    fn test_find_header_end_lf() {
        let buf = b"GET / HTTP/1.1\nHost: x\n\nbody";
        let (header_len, body_start) = find_header_end(buf).unwrap();
        assert_eq!(&buf[..header_len], b"GET / HTTP/1.1\nHost: x\n");
        assert_eq!(&buf[body_start..], b"body");
    }

    #[test]
    fn test_find_header_end_incomplete() {
        assert!(find_header_end(b"GET / HTTP/1.1\r\nHost: x\r\n").is_none());
    }

    #[test]
    fn test_parse_request_downgrades_and_closes() {
        let header = "GET http://example.com/page?q=1 HTTP/1.1\r\n\
                      Host: example.com\r\n\
                      Connection: keep-alive\r\n\r\n";
        let req = parse_request_header(header).unwrap();
        assert_eq!(req.method, "GET");
        assert!(!req.connect);
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 80);
        assert!(req.header.starts_with("GET http://example.com/page?q=1 HTTP/1.0\r\n"));
        assert!(req.header.contains("Connection: close"));
        assert!(!req.header.contains("keep-alive"));
        assert!(req.header.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_request_host_port() {
        let header = "GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let req = parse_request_header(header).unwrap();
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 8080);
    }

    #[test]
    fn test_parse_connect_request() {
        let header = "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let req = parse_request_header(header).unwrap();
        assert!(req.connect);
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 443);
    }

    #[test]
    fn test_parse_connect_without_host_header() {
        let header = "CONNECT example.com:443 HTTP/1.1\r\n\r\n";
        let req = parse_request_header(header).unwrap();
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 443);
    }

    #[test]
    fn test_parse_request_without_host_is_rejected() {
        assert!(parse_request_header("GET / HTTP/1.1\r\n\r\n").is_none());
    }

    #[test]
    fn test_https_scheme_default_port() {
        let header = "GET https://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let req = parse_request_header(header).unwrap();
        assert_eq!(req.port, 443);
    }

    #[test]
    fn test_rewrite_response_header() {
        let header = "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 4\r\n";
        let rewritten = rewrite_response_header(header);
        assert!(rewritten.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(rewritten.contains("Connection: close"));
    }

    #[test]
    fn test_rewrite_response_header_capitalized_keep_alive() {
        let header = "HTTP/1.1 200 OK\r\nConnection: Keep-Alive\r\n";
        let rewritten = rewrite_response_header(header);
        assert_eq!(rewritten, "HTTP/1.0 200 OK\r\nConnection: close\r\n");
    }

    #[test]
    fn test_parse_request_capitalized_keep_alive() {
        let header = "GET / HTTP/1.1\r\n\
                      Host: example.com\r\n\
                      Connection: Keep-Alive\r\n\r\n";
        let req = parse_request_header(header).unwrap();
        assert!(req.header.contains("Connection: close"));
        assert!(!req.header.to_ascii_lowercase().contains("keep-alive"));
    }

    #[test]
    fn test_response_rewriter_across_chunks() {
        let mut rewriter = ResponseRewriter::new(false);
        assert!(rewriter.push(b"HTTP/1.1 200 OK\r\nConnec".to_vec()).is_none());
        let out = rewriter
            .push(b"tion: keep-alive\r\n\r\nhello".to_vec())
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("\r\n\r\nhello"));

        // Transparent afterwards.
        assert_eq!(
            rewriter.push(b"more".to_vec()).unwrap(),
            b"more".to_vec()
        );
    }

    #[test]
    fn test_tunnel_rewriter_is_transparent() {
        let mut rewriter = ResponseRewriter::new(true);
        assert_eq!(
            rewriter.push(b"\x16\x03\x01raw tls".to_vec()).unwrap(),
            b"\x16\x03\x01raw tls".to_vec()
        );
    }

    #[test]
    fn test_strip_query() {
        assert_eq!(strip_query("/page?q=1"), "/page");
        assert_eq!(strip_query("/page"), "/page");
    }
}
