//! Stream multiplexing
//!
//! Streams tunnel application data through a circuit. Ids are allocated
//! from a wrapping per-(connection, circuit) counter and are meaningless
//! outside that pair. Data is only emitted on streams marked open by a
//! completed Begin/Connected exchange; writes to anything else are
//! silently dropped, since the peer may have torn the stream down already.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{NodeError, Result};
use crate::network::ConnectionRegistry;

use super::{
    encode_begin_body, Cell, CircuitId, ConnId, PendingKey, PendingTable, RelayCell, RelayCommand,
    StreamId, RELAY_BODY_LEN,
};

/// Fully-qualified stream identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub conn: ConnId,
    pub circuit: CircuitId,
    pub stream: StreamId,
}

impl StreamKey {
    pub fn new(conn: ConnId, circuit: CircuitId, stream: StreamId) -> Self {
        Self {
            conn,
            circuit,
            stream,
        }
    }
}

#[derive(Default)]
struct State {
    opened: HashSet<StreamKey>,
    next_ids: HashMap<(ConnId, CircuitId), StreamId>,
}

/// Allocates stream ids and chunks application data into relay cells.
pub struct StreamMultiplexer {
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingTable>,
    digest: u32,
    state: Mutex<State>,
}

impl StreamMultiplexer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pending: Arc<PendingTable>,
        digest: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pending,
            digest,
            state: Mutex::new(State::default()),
        })
    }

    fn allocate_stream_id(&self, conn: ConnId, circuit: CircuitId) -> StreamId {
        let mut state = self.state.lock().expect("poisoned lock");
        let counter = state.next_ids.entry((conn, circuit)).or_insert(0);
        let id = *counter;
        *counter = counter.wrapping_add(1);
        id
    }

    pub fn is_open(&self, key: StreamKey) -> bool {
        self.state.lock().expect("poisoned lock").opened.contains(&key)
    }

    /// Mark a stream open without a handshake; the exit side does this when
    /// its outbound TCP connect lands.
    pub fn mark_open(&self, key: StreamKey) {
        self.state.lock().expect("poisoned lock").opened.insert(key);
    }

    async fn send_relay(
        &self,
        key: StreamKey,
        command: RelayCommand,
        body: Vec<u8>,
    ) -> Result<()> {
        let relay = RelayCell::new(command, key.stream, self.digest, body)?;
        self.registry
            .send(key.conn, &Cell::relay(key.circuit, relay))
            .await
    }

    /// Open a stream to `host:port` through the given circuit: allocate the
    /// next id, run the Begin/Connected handshake, mark the stream open.
    pub async fn begin(
        &self,
        conn: ConnId,
        circuit: CircuitId,
        host: &str,
        port: u16,
    ) -> Result<StreamId> {
        let stream = self.allocate_stream_id(conn, circuit);
        let key = StreamKey::new(conn, circuit, stream);

        let pending_key = PendingKey::stream(conn, circuit, stream);
        let rx = self.pending.register(pending_key);
        if let Err(e) = self
            .send_relay(key, RelayCommand::Begin, encode_begin_body(host, port))
            .await
        {
            self.pending.complete(pending_key, Err(e.clone()));
            return Err(e);
        }

        rx.await.unwrap_or(Err(NodeError::CircuitClosed))?;
        self.mark_open(key);
        log::debug!("stream {} open on ({},{}) to {}:{}", stream, conn, circuit, host, port);
        Ok(stream)
    }

    /// Fragment `data` into relay-body-sized Data cells, emitted in order.
    /// A stream that is not open swallows the write.
    pub async fn send(&self, key: StreamKey, data: &[u8]) -> Result<()> {
        if !self.is_open(key) {
            return Ok(());
        }
        for chunk in data.chunks(RELAY_BODY_LEN) {
            self.send_relay(key, RelayCommand::Data, chunk.to_vec())
                .await?;
        }
        Ok(())
    }

    /// Close a stream and tell the peer. Sent even if the stream was never
    /// marked open, matching the teardown race where both sides end at once.
    pub async fn end(&self, key: StreamKey) -> Result<()> {
        self.state.lock().expect("poisoned lock").opened.remove(&key);
        self.send_relay(key, RelayCommand::End, Vec::new()).await
    }

    /// Exit side: report a successful outbound connect and open the stream.
    pub async fn connected(&self, key: StreamKey) -> Result<()> {
        self.mark_open(key);
        self.send_relay(key, RelayCommand::Connected, Vec::new()).await
    }

    /// Exit side: report a failed outbound connect.
    pub async fn begin_failed(&self, key: StreamKey) -> Result<()> {
        self.send_relay(key, RelayCommand::BeginFailed, Vec::new()).await
    }

    /// Drop every stream. Used on restart.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("poisoned lock");
        state.opened.clear();
        state.next_ids.clear();
    }
}
