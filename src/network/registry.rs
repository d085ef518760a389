//! Connection registry
//!
//! Owns every transport connection and provides identity-based addressing:
//! callers refer to "the connection to ip:port" by a stable numeric id
//! without caring whether a socket exists yet. Outbound transports open
//! lazily on first send; inbound transports are registered by the accept
//! loop. When a transport closes, every circuit bound to it is torn down
//! through a [`ConnEvent::Closed`] notification.
//!
//! Each live connection has one reader task (frames the byte stream into
//! fixed-size cells, in arrival order) and one writer task, so cells from
//! one connection are never processed concurrently with each other.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use crate::error::{NodeError, Result};
use crate::protocol::{Cell, CircuitId, ConnEvent, ConnId, CELL_LEN};

use super::{peer_agent_id, PayloadCipher};

/// Connection ids wrap at this ceiling.
const CONN_ID_CEILING: ConnId = 1 << 31;

struct Live {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    initiator: bool,
    agent: Option<u32>,
}

#[derive(Default)]
struct Inner {
    next_id: ConnId,
    by_addr: HashMap<String, ConnId>,
    addr_of: HashMap<ConnId, (String, u16)>,
    conns: HashMap<ConnId, Live>,
    links: HashMap<ConnId, HashSet<CircuitId>>,
}

/// Registry of all transport connections to peer nodes.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    cipher: Arc<dyn PayloadCipher>,
    events: mpsc::UnboundedSender<ConnEvent>,
    connector: Mutex<Option<TlsConnector>>,
}

impl ConnectionRegistry {
    pub fn new(
        cipher: Arc<dyn PayloadCipher>,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            cipher,
            events,
            connector: Mutex::new(None),
        })
    }

    /// Install the TLS connector used for lazy outbound opens.
    pub fn set_connector(&self, connector: TlsConnector) {
        *self.connector.lock().expect("poisoned lock") = Some(connector);
    }

    /// Idempotent address-to-id mapping. Allocates a new id and records the
    /// address the first time; repeated calls return the same id whether or
    /// not a transport exists.
    pub fn identify(&self, ip: &str, port: u16) -> ConnId {
        let ip = normalize_ip(ip);
        let key = format!("{}:{}", ip, port);

        let mut inner = self.inner.lock().expect("poisoned lock");
        if let Some(&id) = inner.by_addr.get(&key) {
            return id;
        }
        let id = inner.allocate_id();
        inner.by_addr.insert(key, id);
        inner.addr_of.insert(id, (ip.clone(), port));
        log::debug!("connection {} -> {}:{}", id, ip, port);
        id
    }

    /// Send a cell on a connection, lazily opening the outbound transport
    /// if none is live yet. The TCP/TLS open runs on its own task; this
    /// call only queues the frame, so cells keep their submission order
    /// and the caller never waits on a peer's handshake. An unidentified
    /// id is a programming invariant violation, not a recoverable
    /// condition.
    pub async fn send(self: &Arc<Self>, conn: ConnId, cell: &Cell) -> Result<()> {
        let mut frame = cell.encode();
        self.cipher.encrypt(conn, &mut frame)?;

        let writer = match self.writer_of(conn) {
            Some(writer) => writer,
            None => self.open_outbound(conn)?,
        };
        writer.send(frame).map_err(|_| NodeError::ConnectionClosed)
    }

    fn writer_of(&self, conn: ConnId) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .conns
            .get(&conn)
            .map(|live| live.writer.clone())
    }

    /// Install the writer channel for an outbound connection and start the
    /// dial on its own task. A failed dial surfaces as a
    /// [`ConnEvent::Closed`] for the connection, dropping whatever queued.
    fn open_outbound(self: &Arc<Self>, conn: ConnId) -> Result<mpsc::UnboundedSender<Vec<u8>>> {
        let (ip, port) = self
            .inner
            .lock()
            .expect("poisoned lock")
            .addr_of
            .get(&conn)
            .cloned()
            .ok_or_else(|| {
                NodeError::Internal(format!("send on unidentified connection {}", conn))
            })?;

        let connector = self
            .connector
            .lock()
            .expect("poisoned lock")
            .clone()
            .ok_or_else(|| NodeError::Transport("outbound TLS not configured".into()))?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        {
            let mut inner = self.inner.lock().expect("poisoned lock");
            // Lost a race with an inbound accept or another open.
            if let Some(live) = inner.conns.get(&conn) {
                return Ok(live.writer.clone());
            }
            inner.conns.insert(
                conn,
                Live {
                    writer: writer_tx.clone(),
                    initiator: true,
                    agent: None,
                },
            );
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            log::debug!("opening connection {} to {}:{}", conn, ip, port);
            if let Err(e) = registry.dial(conn, &ip, port, connector, writer_rx).await {
                log::debug!("connection {} to {}:{} failed: {}", conn, ip, port, e);
                registry.connection_closed(conn);
            }
        });
        Ok(writer_tx)
    }

    async fn dial(
        self: &Arc<Self>,
        conn: ConnId,
        ip: &str,
        port: u16,
        connector: TlsConnector,
        writer_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<()> {
        let tcp = TcpStream::connect((ip, port)).await?;
        let name = ServerName::try_from(ip.to_string())
            .map_err(|e| NodeError::Transport(format!("bad server name {}: {}", ip, e)))?;
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| NodeError::Transport(format!("TLS connect {}:{}: {}", ip, port, e)))?;

        let agent = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(peer_agent_id);
        if let Some(live) = self.inner.lock().expect("poisoned lock").conns.get_mut(&conn) {
            live.agent = agent;
        }

        self.bind_io(conn, tls, writer_rx);
        Ok(())
    }

    /// Bind a transport to a connection id and spawn its reader and writer
    /// tasks. A concurrently attached transport wins; the newcomer is
    /// dropped.
    pub fn attach<S>(self: &Arc<Self>, conn: ConnId, stream: S, initiator: bool, agent: Option<u32>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        {
            let mut inner = self.inner.lock().expect("poisoned lock");
            if inner.conns.contains_key(&conn) {
                log::debug!("connection {} already has a transport, dropping new one", conn);
                return;
            }
            inner.conns.insert(
                conn,
                Live {
                    writer: writer_tx,
                    initiator,
                    agent,
                },
            );
        }

        self.bind_io(conn, stream, writer_rx);
    }

    /// Spawn the reader and writer tasks over a transport whose writer
    /// channel is already registered.
    fn bind_io<S>(
        self: &Arc<Self>,
        conn: ConnId,
        stream: S,
        mut writer_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    log::debug!("write on connection {} failed: {}", conn, e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = [0u8; CELL_LEN];
            loop {
                if let Err(e) = read_half.read_exact(&mut buf).await {
                    log::debug!("connection {} closed: {}", conn, e);
                    break;
                }
                let mut frame = buf.to_vec();
                if let Err(e) = registry.cipher.decrypt(conn, &mut frame) {
                    log::debug!("dropping undecipherable frame on connection {}: {}", conn, e);
                    continue;
                }
                match Cell::decode(&frame) {
                    Ok(cell) => {
                        if registry.events.send(ConnEvent::Cell { conn, cell }).is_err() {
                            break;
                        }
                    }
                    // Framing integrity check failed: drop silently.
                    Err(e) => log::debug!("dropping malformed cell on connection {}: {}", conn, e),
                }
            }
            registry.connection_closed(conn);
        });
    }

    /// Register an inbound transport accepted by the listener.
    pub fn accept_inbound<S>(self: &Arc<Self>, ip: &str, port: u16, stream: S, agent: Option<u32>) -> ConnId
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn = self.identify(ip, port);
        self.attach(conn, stream, false, agent);
        conn
    }

    fn connection_closed(&self, conn: ConnId) {
        let circuits: Vec<CircuitId> = {
            let mut inner = self.inner.lock().expect("poisoned lock");
            inner.conns.remove(&conn);
            inner
                .links
                .remove(&conn)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default()
        };
        let _ = self.events.send(ConnEvent::Closed { conn, circuits });
    }

    /// Bind a circuit id to a connection so teardown can cascade when the
    /// transport closes.
    pub fn link_circuit(&self, conn: ConnId, circuit: CircuitId) {
        self.inner
            .lock()
            .expect("poisoned lock")
            .links
            .entry(conn)
            .or_default()
            .insert(circuit);
    }

    pub fn unlink_circuit(&self, conn: ConnId, circuit: CircuitId) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        if let Some(set) = inner.links.get_mut(&conn) {
            set.remove(&circuit);
            if set.is_empty() {
                inner.links.remove(&conn);
            }
        }
    }

    /// Whether this node initiated the connection. `None` while no transport
    /// is live.
    pub fn is_initiator(&self, conn: ConnId) -> Option<bool> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .conns
            .get(&conn)
            .map(|live| live.initiator)
    }

    /// Certificate-derived agent id of the peer, if a transport is live and
    /// presented one.
    pub fn agent_of(&self, conn: ConnId) -> Option<u32> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .conns
            .get(&conn)
            .and_then(|live| live.agent)
    }

    /// Drop every transport and binding. Used on restart.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.conns.clear();
        inner.links.clear();
        inner.by_addr.clear();
        inner.addr_of.clear();
    }
}

impl Inner {
    fn allocate_id(&mut self) -> ConnId {
        if self.next_id == CONN_ID_CEILING {
            self.next_id = 0;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Strip any IPv6-mapped prefix so `::ffff:10.0.0.1` and `10.0.0.1` key the
/// same connection.
fn normalize_ip(ip: &str) -> String {
    match ip.strip_prefix("::ffff:") {
        Some(mapped) => mapped.to_string(),
        None => ip.to_string(),
    }
}
