//! Cell dispatch
//!
//! Consumes decoded cells from every connection through a single event
//! channel and drives the Create/Destroy and Relay sub-protocols. Replies
//! that answer an in-flight request resolve the matching entry in the
//! pending table; relay cells with a route-table entry are forwarded
//! without interpretation; everything else is endpoint traffic.
//!
//! Handlers that wait for a peer reply (Create-on-behalf-of-Extend, key
//! lookups) run in their own task: the reply arrives through this same
//! event loop, so awaiting it inline would deadlock. Data and End cells are
//! handled inline to preserve per-connection arrival order.

use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;

use crate::error::NodeError;
use crate::network::{ConnectionRegistry, KeyStore};

use super::{
    decode_extend_body, Cell, CellPayload, CircuitBuilder, CircuitId, ConnId, PendingKey,
    PendingTable, RelayCell, RelayCommand, RelayTable, RouteEndpoint, StreamId,
};

/// Event stream feeding the dispatch loop, one sender per connection reader.
#[derive(Debug)]
pub enum ConnEvent {
    /// A decoded cell arrived on a connection.
    Cell { conn: ConnId, cell: Cell },
    /// A transport closed; `circuits` are the ids that were bound to it.
    Closed {
        conn: ConnId,
        circuits: Vec<CircuitId>,
    },
}

/// Why the node must rebuild its routing state from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// A peer destroyed the node's own circuit.
    CircuitDestroyed,
    /// The transport carrying the node's own circuit closed.
    CircuitLost,
}

/// Endpoint hooks for stream-level relay commands. Implemented by the proxy
/// layer; `on_begin` is the exit side, `on_data`/`on_end` serve both ends.
pub trait StreamEndpoint: Send + Sync {
    fn on_begin(&self, from: RouteEndpoint, stream: StreamId, body: Vec<u8>);
    fn on_data(&self, from: RouteEndpoint, stream: StreamId, body: Vec<u8>);
    fn on_end(&self, from: RouteEndpoint, stream: StreamId);
}

/// Interprets decoded cells and drives the relay sub-protocol.
pub struct CellDispatcher {
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingTable>,
    routes: Arc<RelayTable>,
    keys: Arc<KeyStore>,
    directory: Arc<dyn crate::directory::Directory>,
    restart: mpsc::UnboundedSender<RestartReason>,
    /// Stamped on every originated relay reply. Reserved, never verified.
    digest: u32,
    builder: OnceLock<Arc<CircuitBuilder>>,
    endpoint: OnceLock<Arc<dyn StreamEndpoint>>,
}

impl CellDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pending: Arc<PendingTable>,
        routes: Arc<RelayTable>,
        keys: Arc<KeyStore>,
        directory: Arc<dyn crate::directory::Directory>,
        restart: mpsc::UnboundedSender<RestartReason>,
        digest: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pending,
            routes,
            keys,
            directory,
            restart,
            digest,
            builder: OnceLock::new(),
            endpoint: OnceLock::new(),
        })
    }

    /// Wire the circuit builder in after construction; the builder holds no
    /// reference back.
    pub fn set_builder(&self, builder: Arc<CircuitBuilder>) {
        let _ = self.builder.set(builder);
    }

    pub fn set_endpoint(&self, endpoint: Arc<dyn StreamEndpoint>) {
        let _ = self.endpoint.set(endpoint);
    }

    /// Drive the dispatch loop until every event sender is dropped.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConnEvent::Cell { conn, cell } => self.handle_cell(conn, cell).await,
                ConnEvent::Closed { conn, circuits } => self.handle_closed(conn, circuits).await,
            }
        }
    }

    async fn handle_cell(self: &Arc<Self>, conn: ConnId, cell: Cell) {
        let circuit = cell.circuit_id;
        match cell.payload {
            CellPayload::Create => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.handle_create(conn, circuit).await });
            }
            CellPayload::Created => {
                self.pending.complete(PendingKey::circuit(conn, circuit), Ok(()));
            }
            CellPayload::CreateFailed => {
                self.pending
                    .complete(PendingKey::circuit(conn, circuit), Err(NodeError::CreateFailed));
            }
            CellPayload::Destroy => self.handle_destroy(conn, circuit).await,
            CellPayload::Relay(relay) => self.handle_relay(conn, circuit, relay).await,
        }
    }

    /// A peer asks this node to become a hop. Resolve the sender's key if it
    /// is not cached yet, bind the circuit, acknowledge.
    async fn handle_create(self: &Arc<Self>, conn: ConnId, circuit: CircuitId) {
        if let Some(agent) = self.registry.agent_of(conn) {
            if !self.keys.contains(agent) {
                match self.directory.key(agent).await {
                    Ok(pem) => self.keys.add(agent, pem),
                    Err(e) => {
                        log::warn!("key lookup for agent {:08X} failed: {}", agent, e);
                        let _ = self
                            .registry
                            .send(conn, &Cell::new(circuit, CellPayload::CreateFailed))
                            .await;
                        return;
                    }
                }
            }
        }

        if let Some(builder) = self.builder.get() {
            builder.note_created(conn);
        }
        self.registry.link_circuit(conn, circuit);
        log::debug!("circuit {} created on connection {}", circuit, conn);
        if let Err(e) = self
            .registry
            .send(conn, &Cell::new(circuit, CellPayload::Created))
            .await
        {
            log::debug!("created ack on connection {} failed: {}", conn, e);
        }
    }

    async fn handle_destroy(self: &Arc<Self>, conn: ConnId, circuit: CircuitId) {
        if self.is_own_circuit(conn, circuit) {
            log::warn!("own circuit {} destroyed by peer", circuit);
            let _ = self.restart.send(RestartReason::CircuitDestroyed);
            return;
        }

        let src = RouteEndpoint::new(conn, circuit);
        if let Some(pair) = self.routes.delete(src) {
            log::debug!(
                "destroy ({},{}) propagated to ({},{})",
                conn,
                circuit,
                pair.conn,
                pair.circuit
            );
            self.registry.unlink_circuit(pair.conn, pair.circuit);
            let _ = self
                .registry
                .send(pair.conn, &Cell::new(pair.circuit, CellPayload::Destroy))
                .await;
        }
        self.registry.unlink_circuit(conn, circuit);
    }

    async fn handle_relay(self: &Arc<Self>, conn: ConnId, circuit: CircuitId, relay: RelayCell) {
        let src = RouteEndpoint::new(conn, circuit);

        // Pass-through hop: forward to the paired endpoint, restamped with
        // this node's digest. Re-encoding re-pads the body to capacity.
        if let Some(pair) = self.routes.get(src) {
            let mut relay = relay;
            relay.digest = self.digest;
            let cell = Cell::relay(pair.circuit, relay);
            if let Err(e) = self.registry.send(pair.conn, &cell).await {
                log::debug!(
                    "forward to ({},{}) failed: {}",
                    pair.conn,
                    pair.circuit,
                    e
                );
            }
            return;
        }

        // Path endpoint: interpret the sub-command.
        match relay.command {
            RelayCommand::Extend => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.handle_extend(conn, circuit, relay.stream_id, relay.body)
                        .await
                });
            }
            RelayCommand::Extended => {
                self.pending.complete(PendingKey::circuit(conn, circuit), Ok(()));
            }
            RelayCommand::ExtendFailed => {
                self.pending
                    .complete(PendingKey::circuit(conn, circuit), Err(NodeError::ExtendFailed));
            }
            RelayCommand::Connected => {
                self.pending
                    .complete(PendingKey::stream(conn, circuit, relay.stream_id), Ok(()));
            }
            RelayCommand::BeginFailed => {
                self.pending.complete(
                    PendingKey::stream(conn, circuit, relay.stream_id),
                    Err(NodeError::BeginFailed),
                );
            }
            RelayCommand::Begin => match self.endpoint.get() {
                Some(endpoint) => endpoint.on_begin(src, relay.stream_id, relay.body),
                None => log::debug!("begin on ({},{}) with no stream endpoint", conn, circuit),
            },
            RelayCommand::Data => match self.endpoint.get() {
                Some(endpoint) => endpoint.on_data(src, relay.stream_id, relay.body),
                None => log::debug!("data on ({},{}) with no stream endpoint", conn, circuit),
            },
            RelayCommand::End => {
                if let Some(endpoint) = self.endpoint.get() {
                    endpoint.on_end(src, relay.stream_id);
                }
            }
        }
    }

    /// Service a peer's Extend: create the next hop on their behalf, pair
    /// the two legs in the route table, acknowledge with the echoed body.
    async fn handle_extend(
        self: &Arc<Self>,
        conn: ConnId,
        circuit: CircuitId,
        stream: StreamId,
        body: Vec<u8>,
    ) {
        let outcome = async {
            let (ip, port, agent) = decode_extend_body(&body)?;
            let builder = self
                .builder
                .get()
                .ok_or_else(|| NodeError::Internal("no circuit builder wired".into()))?;
            builder.extend_to(&ip, port, agent).await
        }
        .await;

        match outcome {
            Ok(next) => {
                self.routes
                    .set(RouteEndpoint::new(conn, circuit), next);
                self.registry.link_circuit(conn, circuit);
                self.registry.link_circuit(next.conn, next.circuit);
                log::info!(
                    "extended circuit: ({},{}) <-> ({},{})",
                    conn,
                    circuit,
                    next.conn,
                    next.circuit
                );
                let _ = self
                    .send_relay(conn, circuit, RelayCommand::Extended, stream, body)
                    .await;
            }
            Err(e) => {
                log::warn!("extend on ({},{}) failed: {}", conn, circuit, e);
                let _ = self
                    .send_relay(conn, circuit, RelayCommand::ExtendFailed, stream, Vec::new())
                    .await;
            }
        }
    }

    /// Send an originated relay cell, stamping the process digest.
    pub async fn send_relay(
        &self,
        conn: ConnId,
        circuit: CircuitId,
        command: RelayCommand,
        stream: StreamId,
        body: Vec<u8>,
    ) -> crate::error::Result<()> {
        let relay = RelayCell::new(command, stream, self.digest, body)?;
        self.registry.send(conn, &Cell::relay(circuit, relay)).await
    }

    /// A transport closed: tear down whatever referenced it and escalate if
    /// the node's own circuit rode on it.
    async fn handle_closed(self: &Arc<Self>, conn: ConnId, circuits: Vec<CircuitId>) {
        if !circuits.is_empty() {
            log::debug!("connection {} closed, circuits {:?} torn down", conn, circuits);
        }

        if circuits
            .iter()
            .any(|&circuit| self.is_own_circuit(conn, circuit))
        {
            log::warn!("connection carrying own circuit closed");
            let _ = self.restart.send(RestartReason::CircuitLost);
        }

        for (_, pair) in self.routes.closed(conn) {
            self.registry.unlink_circuit(pair.conn, pair.circuit);
            let _ = self
                .registry
                .send(pair.conn, &Cell::new(pair.circuit, CellPayload::Destroy))
                .await;
        }
    }

    fn is_own_circuit(&self, conn: ConnId, circuit: CircuitId) -> bool {
        self.builder
            .get()
            .and_then(|builder| builder.own_circuit())
            .map(|own| own.conn == conn && own.circuit == circuit)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::network::IdentityCipher;
    use crate::protocol::CELL_LEN;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct Fixture {
        dispatcher: Arc<CellDispatcher>,
        registry: Arc<ConnectionRegistry>,
        routes: Arc<RelayTable>,
        pending: Arc<PendingTable>,
        events: mpsc::UnboundedSender<ConnEvent>,
        restart: mpsc::UnboundedReceiver<RestartReason>,
    }

    fn fixture() -> Fixture {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::new(Arc::new(IdentityCipher), event_tx.clone());
        let pending = PendingTable::new(Duration::from_secs(3));
        let routes = Arc::new(RelayTable::new());
        let dispatcher = CellDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            Arc::clone(&routes),
            Arc::new(KeyStore::new()),
            Arc::new(StaticDirectory::default()),
            restart_tx,
            0xD1D1D1D1,
        );
        tokio::spawn(Arc::clone(&dispatcher).run(event_rx));
        Fixture {
            dispatcher,
            registry,
            routes,
            pending,
            events: event_tx,
            restart: restart_rx,
        }
    }

    async fn read_cell(remote: &mut DuplexStream) -> Cell {
        let mut buf = [0u8; CELL_LEN];
        remote.read_exact(&mut buf).await.unwrap();
        Cell::decode(&buf).unwrap()
    }

    #[tokio::test]
    async fn test_create_is_acknowledged() {
        let fx = fixture();
        let conn = fx.registry.identify("10.0.0.1", 4000);
        let (local, mut remote) = tokio::io::duplex(4096);
        fx.registry.attach(conn, local, false, None);

        remote
            .write_all(&Cell::new(8, CellPayload::Create).encode())
            .await
            .unwrap();

        let reply = read_cell(&mut remote).await;
        assert_eq!(reply, Cell::new(8, CellPayload::Created));
    }

    #[tokio::test]
    async fn test_relay_forwarded_through_route_pair() {
        let fx = fixture();
        let a = fx.registry.identify("10.0.0.1", 4000);
        let b = fx.registry.identify("10.0.0.2", 4000);
        let (local_a, mut remote_a) = tokio::io::duplex(4096);
        let (local_b, mut remote_b) = tokio::io::duplex(4096);
        fx.registry.attach(a, local_a, false, None);
        fx.registry.attach(b, local_b, true, None);
        fx.routes
            .set(RouteEndpoint::new(a, 3), RouteEndpoint::new(b, 7));

        let relay =
            RelayCell::new(RelayCommand::Data, 2, 0xABCD0123, b"payload".to_vec()).unwrap();
        remote_a
            .write_all(&Cell::relay(3, relay.clone()).encode())
            .await
            .unwrap();

        let forwarded = read_cell(&mut remote_b).await;
        // Circuit id swapped to the paired leg, digest restamped with this
        // node's own, command/stream/body intact.
        let mut expected = relay;
        expected.digest = 0xD1D1D1D1;
        assert_eq!(forwarded, Cell::relay(7, expected));
    }

    #[tokio::test]
    async fn test_destroy_propagates_and_clears_route() {
        let fx = fixture();
        let a = fx.registry.identify("10.0.0.1", 4000);
        let b = fx.registry.identify("10.0.0.2", 4000);
        let (local_a, mut remote_a) = tokio::io::duplex(4096);
        let (local_b, mut remote_b) = tokio::io::duplex(4096);
        fx.registry.attach(a, local_a, false, None);
        fx.registry.attach(b, local_b, true, None);
        fx.routes
            .set(RouteEndpoint::new(a, 3), RouteEndpoint::new(b, 7));

        remote_a
            .write_all(&Cell::new(3, CellPayload::Destroy).encode())
            .await
            .unwrap();

        let propagated = read_cell(&mut remote_b).await;
        assert_eq!(propagated, Cell::new(7, CellPayload::Destroy));
        assert!(fx.routes.is_empty());
    }

    #[tokio::test]
    async fn test_late_reply_without_pending_is_discarded() {
        let fx = fixture();
        let conn = fx.registry.identify("10.0.0.1", 4000);
        fx.events
            .send(ConnEvent::Cell {
                conn,
                cell: Cell::new(5, CellPayload::Created),
            })
            .unwrap();

        // Nothing pending: the cell is dropped without side effects.
        tokio::task::yield_now().await;
        assert!(fx.pending.is_empty());
    }

    #[tokio::test]
    async fn test_reply_resolves_pending_operation() {
        let fx = fixture();
        let conn = fx.registry.identify("10.0.0.1", 4000);
        let rx = fx.pending.register(PendingKey::circuit(conn, 9));

        fx.events
            .send(ConnEvent::Cell {
                conn,
                cell: Cell::new(9, CellPayload::Created),
            })
            .unwrap();
        assert_eq!(rx.await.unwrap(), Ok(()));

        // And a typed failure path.
        let rx = fx.pending.register(PendingKey::stream(conn, 9, 2));
        let relay = RelayCell::new(RelayCommand::BeginFailed, 2, 0, Vec::new()).unwrap();
        fx.events
            .send(ConnEvent::Cell {
                conn,
                cell: Cell::relay(9, relay),
            })
            .unwrap();
        assert_eq!(rx.await.unwrap(), Err(NodeError::BeginFailed));
    }

    #[tokio::test]
    async fn test_transport_close_destroys_paired_leg() {
        let mut fx = fixture();
        let a = fx.registry.identify("10.0.0.1", 4000);
        let b = fx.registry.identify("10.0.0.2", 4000);
        let (local_a, remote_a) = tokio::io::duplex(4096);
        let (local_b, mut remote_b) = tokio::io::duplex(4096);
        fx.registry.attach(a, local_a, false, None);
        fx.registry.attach(b, local_b, true, None);
        fx.registry.link_circuit(a, 3);
        fx.routes
            .set(RouteEndpoint::new(a, 3), RouteEndpoint::new(b, 7));

        drop(remote_a);

        let propagated = read_cell(&mut remote_b).await;
        assert_eq!(propagated, Cell::new(7, CellPayload::Destroy));
        assert!(fx.routes.is_empty());
        // No own circuit involved, so no restart is requested.
        assert!(fx.restart.try_recv().is_err());
        drop(fx.dispatcher);
    }
}
