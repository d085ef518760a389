//! Node assembly and lifecycle
//!
//! Wires the registry, dispatcher, circuit builder, multiplexer and proxy
//! together, registers with the directory, and runs the restart loop: when
//! the node's own circuit dies (destroyed by a peer or its transport
//! closed), every table is flushed and the circuit is rebuilt from a fresh
//! candidate fetch. The listener for peer connections binds port 0 so the
//! OS picks a free port; the chosen port is what gets registered.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::NodeConfig;
use crate::directory::{Directory, RegClient};
use crate::error::Result;
use crate::network::{
    peer_agent_id, ConnectionRegistry, Credentials, IdentityCipher, KeyStore,
};
use crate::protocol::{
    CellDispatcher, CircuitBuilder, PendingTable, RelayTable, RestartReason, StreamMultiplexer,
};
use crate::proxy::ProxyFront;

/// A fully wired relay node.
pub struct Node {
    config: NodeConfig,
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingTable>,
    routes: Arc<RelayTable>,
    builder: Arc<CircuitBuilder>,
    mux: Arc<StreamMultiplexer>,
    proxy: Arc<ProxyFront>,
    directory: Arc<dyn Directory>,
    restart: mpsc::UnboundedReceiver<RestartReason>,
    service_port: u16,
}

impl Node {
    /// Construct the node: load credentials, connect to the directory,
    /// start the peer listener, register. Failures here are fatal; there is
    /// no node without a directory or credentials.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let credentials =
            Credentials::load(&config.cert_path, &config.key_path, &config.ca_path)?;
        let agent = credentials.agent_id()?;
        log::info!("🧅 node starting as agent {:08X}", agent);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();

        let registry = ConnectionRegistry::new(Arc::new(IdentityCipher), event_tx);
        registry.set_connector(credentials.connector()?);

        let pending = PendingTable::new(config.reply_timeout());
        let routes = Arc::new(RelayTable::new());
        let keys = Arc::new(KeyStore::new());

        let directory: Arc<dyn Directory> = RegClient::connect(
            &config.directory_host,
            config.directory_port,
            &credentials,
        )
        .await?;

        // Random per-process tag stamped into relay cells.
        let digest: u32 = rand::random();

        let dispatcher = CellDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            Arc::clone(&routes),
            Arc::clone(&keys),
            Arc::clone(&directory),
            restart_tx,
            digest,
        );
        tokio::spawn(Arc::clone(&dispatcher).run(event_rx));

        let builder = CircuitBuilder::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            Arc::clone(&directory),
            keys,
            Some(agent),
            digest,
        );
        dispatcher.set_builder(Arc::clone(&builder));

        let mux = StreamMultiplexer::new(Arc::clone(&registry), Arc::clone(&pending), digest);
        let proxy = ProxyFront::new(
            Arc::clone(&mux),
            Arc::clone(&builder),
            config.proxy_idle(),
        );
        dispatcher.set_endpoint(Arc::clone(&proxy) as Arc<dyn crate::protocol::StreamEndpoint>);

        // Peer listener on a free port; the port we actually got is the one
        // we publish.
        let listener = TcpListener::bind((config.listen_ip, 0)).await?;
        let service_port = listener.local_addr()?.port();
        let acceptor = credentials.acceptor()?;
        let accept_registry = Arc::clone(&registry);
        tokio::spawn(async move {
            loop {
                let (tcp, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("peer accept failed: {}", e);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let registry = Arc::clone(&accept_registry);
                tokio::spawn(async move {
                    match acceptor.accept(tcp).await {
                        Ok(tls) => {
                            let agent = tls
                                .get_ref()
                                .1
                                .peer_certificates()
                                .and_then(|certs| certs.first())
                                .and_then(peer_agent_id);
                            registry.accept_inbound(
                                &peer.ip().to_string(),
                                peer.port(),
                                tls,
                                agent,
                            );
                        }
                        Err(e) => log::debug!("TLS accept from {} failed: {}", peer, e),
                    }
                });
            }
        });
        log::info!("listening for peers on {}:{}", config.listen_ip, service_port);

        directory.register(service_port).await?;

        Ok(Self {
            config,
            registry,
            pending,
            routes,
            builder,
            mux,
            proxy,
            directory,
            restart: restart_rx,
            service_port,
        })
    }

    /// Build the circuit, open the proxy, then serve until shutdown.
    /// Restart requests flush all session state and rebuild in place.
    pub async fn run(mut self) -> Result<()> {
        self.builder
            .build(self.config.circuit_length, self.config.build_retry())
            .await;

        let proxy_listener =
            TcpListener::bind((self.config.listen_ip, self.config.proxy_port)).await?;
        tokio::spawn(Arc::clone(&self.proxy).run(proxy_listener));

        loop {
            tokio::select! {
                reason = self.restart.recv() => match reason {
                    Some(reason) => self.rebuild(reason).await,
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    log::info!("shutting down");
                    let _ = self.directory.unregister(self.service_port).await;
                    self.teardown();
                    break;
                }
            }
        }
        Ok(())
    }

    async fn rebuild(&mut self, reason: RestartReason) {
        log::warn!("restarting session state: {:?}", reason);
        self.teardown();
        // Coalesce restart requests that piled up while tearing down.
        while self.restart.try_recv().is_ok() {}
        self.builder
            .build(self.config.circuit_length, self.config.build_retry())
            .await;
    }

    fn teardown(&self) {
        self.proxy.shutdown();
        self.mux.shutdown();
        self.builder.reset();
        self.pending.clear();
        self.routes.clear();
        self.registry.shutdown();
    }
}
