//! Circuit construction
//!
//! Builds and extends the node's own outbound path, and creates adjacent
//! circuits on behalf of peers servicing their Extend requests. Candidate
//! hops come from the directory, fetched once and refreshed only when the
//! cache runs dry; a hop that fails a handshake is dropped from the cache
//! so retries pick someone else.
//!
//! Circuit ids are drawn from disjoint odd/even counters: the connection's
//! initiator allocates odd ids, the acceptor even ones, so both sides can
//! allocate without coordination. A connection with no live transport yet
//! is about to be opened by us, so it counts as initiator.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::directory::Directory;
use crate::error::{NodeError, Result};
use crate::network::{ConnectionRegistry, KeyStore};

use super::{
    encode_extend_body, Cell, CellPayload, CircuitId, ConnId, PendingKey, PendingTable, RelayCell,
    RelayCommand, RouteEndpoint, CIRCUIT_ID_CEILING,
};

/// One relay node in a path: where to reach it and who it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub ip: String,
    pub port: u16,
    pub agent: u32,
}

struct OwnCircuit {
    conn: ConnId,
    circuit: CircuitId,
    hops: Vec<Hop>,
}

struct State {
    candidates: Vec<Hop>,
    /// Connections that have completed a Create exchange; further circuits
    /// on them skip the handshake.
    created: HashSet<ConnId>,
    own: Option<OwnCircuit>,
    odd_next: CircuitId,
    even_next: CircuitId,
}

/// Builds the node's own circuit and services Extend requests from peers.
pub struct CircuitBuilder {
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingTable>,
    directory: Arc<dyn Directory>,
    keys: Arc<KeyStore>,
    own_agent: Option<u32>,
    digest: u32,
    state: Mutex<State>,
}

impl CircuitBuilder {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pending: Arc<PendingTable>,
        directory: Arc<dyn Directory>,
        keys: Arc<KeyStore>,
        own_agent: Option<u32>,
        digest: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pending,
            directory,
            keys,
            own_agent,
            digest,
            state: Mutex::new(State {
                candidates: Vec::new(),
                created: HashSet::new(),
                own: None,
                odd_next: 1,
                even_next: 0,
            }),
        })
    }

    /// The (connection, circuit) this node's own path starts on, once built.
    pub fn own_circuit(&self) -> Option<RouteEndpoint> {
        self.state
            .lock()
            .expect("poisoned lock")
            .own
            .as_ref()
            .map(|own| RouteEndpoint::new(own.conn, own.circuit))
    }

    /// Ordered hop list of the node's own path.
    pub fn hops(&self) -> Vec<Hop> {
        self.state
            .lock()
            .expect("poisoned lock")
            .own
            .as_ref()
            .map(|own| own.hops.clone())
            .unwrap_or_default()
    }

    /// Record that a Create exchange completed on a connection (also called
    /// for inbound Creates, so later Extends over it can reuse it).
    pub fn note_created(&self, conn: ConnId) {
        self.state.lock().expect("poisoned lock").created.insert(conn);
    }

    /// Drop all path and candidate state. Counters keep running so ids stay
    /// unique across a rebuild.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("poisoned lock");
        state.own = None;
        state.candidates.clear();
        state.created.clear();
    }

    fn allocate_circuit_id(&self, conn: ConnId) -> CircuitId {
        let initiator = self.registry.is_initiator(conn).unwrap_or(true);
        let mut state = self.state.lock().expect("poisoned lock");
        let counter = if initiator {
            &mut state.odd_next
        } else {
            &mut state.even_next
        };
        let id = *counter;
        *counter += 2;
        if *counter >= CIRCUIT_ID_CEILING {
            *counter = if initiator { 1 } else { 0 };
        }
        id
    }

    async fn resolve_key(&self, agent: u32) -> Result<()> {
        if self.keys.contains(agent) {
            return Ok(());
        }
        let pem = self.directory.key(agent).await?;
        self.keys.add(agent, pem);
        Ok(())
    }

    async fn refill_candidates(&self) -> Result<()> {
        let hops = self.directory.fetch().await?;
        let mut state = self.state.lock().expect("poisoned lock");
        state.candidates.extend(
            hops.into_iter()
                .filter(|hop| Some(hop.agent) != self.own_agent),
        );
        if state.candidates.is_empty() {
            return Err(NodeError::NoCandidates);
        }
        Ok(())
    }

    /// Pick a random candidate. Hop-reuse across extends is deliberate; the
    /// same relay can appear twice in a path.
    async fn pick_candidate(&self) -> Result<Hop> {
        if self.state.lock().expect("poisoned lock").candidates.is_empty() {
            self.refill_candidates().await?;
        }
        let state = self.state.lock().expect("poisoned lock");
        if state.candidates.is_empty() {
            return Err(NodeError::NoCandidates);
        }
        let index = rand::thread_rng().gen_range(0..state.candidates.len());
        Ok(state.candidates[index].clone())
    }

    fn discard_candidate(&self, hop: &Hop) {
        self.state
            .lock()
            .expect("poisoned lock")
            .candidates
            .retain(|candidate| candidate != hop);
    }

    /// Establish the first hop of this node's own circuit. On failure the
    /// candidate is dropped and the caller retries with backoff.
    pub async fn create_own_circuit(&self) -> Result<()> {
        self.state.lock().expect("poisoned lock").own = None;

        let hop = self.pick_candidate().await?;
        if let Err(e) = self.resolve_key(hop.agent).await {
            self.discard_candidate(&hop);
            return Err(e);
        }

        let conn = self.registry.identify(&hop.ip, hop.port);
        let circuit = self.allocate_circuit_id(conn);

        match self.create_handshake(conn, circuit).await {
            Ok(()) => {
                self.registry.link_circuit(conn, circuit);
                let mut state = self.state.lock().expect("poisoned lock");
                state.created.insert(conn);
                state.own = Some(OwnCircuit {
                    conn,
                    circuit,
                    hops: vec![hop],
                });
                log::info!("own circuit {} created on connection {}", circuit, conn);
                Ok(())
            }
            Err(e) => {
                self.discard_candidate(&hop);
                Err(e)
            }
        }
    }

    /// Append one hop to the node's own circuit via an Extend through the
    /// first hop.
    pub async fn extend_own_circuit(&self) -> Result<()> {
        let own = self.own_circuit().ok_or(NodeError::CircuitClosed)?;

        let hop = self.pick_candidate().await?;
        if let Err(e) = self.resolve_key(hop.agent).await {
            self.discard_candidate(&hop);
            return Err(e);
        }

        let body = encode_extend_body(&hop.ip, hop.port, hop.agent);
        let relay = RelayCell::new(RelayCommand::Extend, 0, self.digest, body)?;

        let key = PendingKey::circuit(own.conn, own.circuit);
        let rx = self.pending.register(key);
        if let Err(e) = self
            .registry
            .send(own.conn, &Cell::relay(own.circuit, relay))
            .await
        {
            self.pending.complete(key, Err(e.clone()));
            self.discard_candidate(&hop);
            return Err(e);
        }

        match rx.await.unwrap_or(Err(NodeError::CircuitClosed)) {
            Ok(()) => {
                let mut state = self.state.lock().expect("poisoned lock");
                if let Some(own) = state.own.as_mut() {
                    log::info!(
                        "own circuit extended to {}:{} (agent {:08X})",
                        hop.ip,
                        hop.port,
                        hop.agent
                    );
                    own.hops.push(hop);
                }
                Ok(())
            }
            Err(e) => {
                self.discard_candidate(&hop);
                Err(e)
            }
        }
    }

    /// Create an adjacent circuit toward a target, on behalf of a peer's
    /// Extend. Allocates a fresh circuit id but skips the Create exchange if
    /// one already completed on that connection.
    pub async fn extend_to(&self, ip: &str, port: u16, agent: u32) -> Result<RouteEndpoint> {
        let conn = self.registry.identify(ip, port);
        self.resolve_key(agent).await?;

        let circuit = self.allocate_circuit_id(conn);
        if self
            .state
            .lock()
            .expect("poisoned lock")
            .created
            .contains(&conn)
        {
            return Ok(RouteEndpoint::new(conn, circuit));
        }

        self.create_handshake(conn, circuit).await?;
        self.note_created(conn);
        Ok(RouteEndpoint::new(conn, circuit))
    }

    async fn create_handshake(&self, conn: ConnId, circuit: CircuitId) -> Result<()> {
        let key = PendingKey::circuit(conn, circuit);
        let rx = self.pending.register(key);
        if let Err(e) = self
            .registry
            .send(conn, &Cell::new(circuit, CellPayload::Create))
            .await
        {
            // Disarm the timer; the request never left.
            self.pending.complete(key, Err(e.clone()));
            return Err(e);
        }
        rx.await.unwrap_or(Err(NodeError::CircuitClosed))
    }

    /// Build the full path: one Create then `length - 1` Extends, retrying
    /// each step with a fixed delay until it lands.
    pub async fn build(&self, length: usize, retry: Duration) {
        while let Err(e) = self.create_own_circuit().await {
            log::warn!("circuit create failed ({}), retrying", e);
            tokio::time::sleep(retry).await;
        }
        for _ in 1..length {
            while let Err(e) = self.extend_own_circuit().await {
                log::warn!("circuit extend failed ({}), retrying", e);
                tokio::time::sleep(retry).await;
            }
        }
        let path = self
            .hops()
            .iter()
            .map(|hop| format!("{:08X} @ {}:{}", hop.agent, hop.ip, hop.port))
            .collect::<Vec<_>>()
            .join(" -> ");
        log::info!("own circuit established: {}", path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::network::IdentityCipher;
    use crate::protocol::{CellDispatcher, ConnEvent, RelayTable, CELL_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    fn hop(ip: &str, port: u16, agent: u32) -> Hop {
        Hop {
            ip: ip.to_string(),
            port,
            agent,
        }
    }

    struct Fixture {
        builder: Arc<CircuitBuilder>,
        registry: Arc<ConnectionRegistry>,
        pending: Arc<PendingTable>,
        events: Option<mpsc::UnboundedReceiver<ConnEvent>>,
    }

    /// Route inbound cells into the pending table the way the node's
    /// dispatch loop does in production.
    fn spawn_dispatcher(fx: &mut Fixture) {
        let (restart_tx, _restart_rx) = mpsc::unbounded_channel();
        let dispatcher = CellDispatcher::new(
            Arc::clone(&fx.registry),
            Arc::clone(&fx.pending),
            Arc::new(RelayTable::new()),
            Arc::new(KeyStore::new()),
            Arc::new(StaticDirectory::default()),
            restart_tx,
            0xD1D1D1D1,
        );
        tokio::spawn(dispatcher.run(fx.events.take().expect("events already taken")));
    }

    fn fixture(directory: StaticDirectory) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::new(Arc::new(IdentityCipher), tx);
        let pending = PendingTable::new(Duration::from_secs(3));
        let keys = Arc::new(KeyStore::new());
        let builder = CircuitBuilder::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            Arc::new(directory),
            keys,
            None,
            0xD1D1D1D1,
        );
        Fixture {
            builder,
            registry,
            pending,
            events: Some(rx),
        }
    }

    async fn read_cell(remote: &mut DuplexStream) -> Cell {
        let mut buf = [0u8; CELL_LEN];
        remote.read_exact(&mut buf).await.unwrap();
        Cell::decode(&buf).unwrap()
    }

    #[test]
    fn test_circuit_id_parity() {
        let fx = fixture(StaticDirectory::default());
        // No transport yet: we are about to open it, so initiator parity.
        let conn = fx.registry.identify("10.0.0.1", 4000);
        assert_eq!(fx.builder.allocate_circuit_id(conn), 1);
        assert_eq!(fx.builder.allocate_circuit_id(conn), 3);
        assert_eq!(fx.builder.allocate_circuit_id(conn), 5);
    }

    #[tokio::test]
    async fn test_acceptor_allocates_even_ids() {
        let fx = fixture(StaticDirectory::default());
        let conn = fx.registry.identify("10.0.0.1", 4000);
        let (local, _remote) = tokio::io::duplex(1024);
        fx.registry.attach(conn, local, false, None);

        assert_eq!(fx.builder.allocate_circuit_id(conn), 0);
        assert_eq!(fx.builder.allocate_circuit_id(conn), 2);
    }

    #[tokio::test]
    async fn test_create_own_circuit() {
        let directory = StaticDirectory::default()
            .with_node(hop("10.0.0.2", 4000, 0xA1))
            .with_key(0xA1, "---- PEM ----".to_string());
        let mut fx = fixture(directory);
        spawn_dispatcher(&mut fx);

        // Pre-attach the transport the builder will address.
        let conn = fx.registry.identify("10.0.0.2", 4000);
        let (local, mut remote) = tokio::io::duplex(4096);
        fx.registry.attach(conn, local, true, Some(0xA1));

        let peer = tokio::spawn(async move {
            let cell = read_cell(&mut remote).await;
            assert_eq!(cell.payload, CellPayload::Create);
            remote
                .write_all(&Cell::new(cell.circuit_id, CellPayload::Created).encode())
                .await
                .unwrap();
            // Keep the transport alive past the assertion.
            remote
        });

        fx.builder.create_own_circuit().await.unwrap();
        let own = fx.builder.own_circuit().unwrap();
        assert_eq!(own.conn, conn);
        assert_eq!(own.circuit, 1);
        assert_eq!(fx.builder.hops(), vec![hop("10.0.0.2", 4000, 0xA1)]);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_create_discards_candidate() {
        let directory = StaticDirectory::default()
            .with_node(hop("10.0.0.2", 4000, 0xA1))
            .with_key(0xA1, "---- PEM ----".to_string());
        let mut fx = fixture(directory);
        spawn_dispatcher(&mut fx);

        let conn = fx.registry.identify("10.0.0.2", 4000);
        let (local, mut remote) = tokio::io::duplex(4096);
        fx.registry.attach(conn, local, true, Some(0xA1));

        tokio::spawn(async move {
            let cell = read_cell(&mut remote).await;
            remote
                .write_all(&Cell::new(cell.circuit_id, CellPayload::CreateFailed).encode())
                .await
                .unwrap();
            remote
        });

        let err = fx.builder.create_own_circuit().await.unwrap_err();
        assert_eq!(err, NodeError::CreateFailed);
        assert!(fx.builder.own_circuit().is_none());
        assert!(fx
            .builder
            .state
            .lock()
            .unwrap()
            .candidates
            .is_empty());
    }

    #[tokio::test]
    async fn test_extend_to_reuses_created_connection() {
        let directory =
            StaticDirectory::default().with_key(0xB2, "---- PEM ----".to_string());
        let fx = fixture(directory);

        let conn = fx.registry.identify("10.0.0.3", 4000);
        fx.builder.note_created(conn);

        // No transport, no handshake: the exchange is skipped outright.
        let endpoint = fx.builder.extend_to("10.0.0.3", 4000, 0xB2).await.unwrap();
        assert_eq!(endpoint.conn, conn);
        assert_eq!(endpoint.circuit, 1);
        assert!(fx.pending.is_empty());
    }

    #[tokio::test]
    async fn test_extend_to_unknown_agent_fails() {
        let fx = fixture(StaticDirectory::default());
        let err = fx.builder.extend_to("10.0.0.3", 4000, 0xB2).await.unwrap_err();
        assert!(matches!(err, NodeError::Directory(_)));
    }
}
