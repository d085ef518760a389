//! Registration directory client
//!
//! Nodes discover each other through a central registration service. The
//! protocol is a small binary request/response exchange over one mutual-TLS
//! connection: `magic(4) | seq(1) | command(1)` followed by command fields,
//! all integers big-endian. Replies are correlated by sequence number.
//!
//! A successful registration carries a lifetime; the client re-registers
//! itself after `lifetime << 9` milliseconds, forever, until unregistered.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::{NodeError, Result};
use crate::network::Credentials;
use crate::protocol::{Hop, MAGIC};

/// How long to wait for a directory reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

const CMD_REGISTER: u8 = 0x1;
const CMD_REGISTERED: u8 = 0x2;
const CMD_FETCH_REQUEST: u8 = 0x3;
const CMD_FETCH_RESPONSE: u8 = 0x4;
const CMD_KEY_REQUEST: u8 = 0x5;
const CMD_KEY_RESPONSE: u8 = 0x6;
const CMD_UNREGISTER: u8 = 0x7;
const CMD_UNREGISTERED: u8 = 0x8;
const CMD_ERROR: u8 = 0x9;

/// Node discovery and key lookup, as consumed by the circuit builder and
/// the dispatcher.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Publish this node's service port. The client keeps the registration
    /// alive on its own.
    async fn register(&self, port: u16) -> Result<()>;

    /// List the currently registered nodes.
    async fn fetch(&self) -> Result<Vec<Hop>>;

    /// Look up an agent's public key PEM.
    async fn key(&self, agent: u32) -> Result<String>;

    /// Withdraw this node's registration.
    async fn unregister(&self, port: u16) -> Result<()>;
}

#[derive(Debug)]
enum Reply {
    Registered { lifetime: u16 },
    Fetched(Vec<Hop>),
    Key(String),
    Unregistered,
}

#[derive(Default)]
struct PendingReplies {
    map: HashMap<u8, oneshot::Sender<Result<Reply>>>,
}

/// Client for the registration service.
pub struct RegClient {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    pending: Mutex<PendingReplies>,
    next_seq: Mutex<u8>,
    rereg: Mutex<Option<AbortHandle>>,
    self_ref: std::sync::Weak<Self>,
}

impl RegClient {
    /// Connect to the registration service over mutual TLS.
    pub async fn connect(host: &str, port: u16, credentials: &Credentials) -> Result<Arc<Self>> {
        let connector = credentials.connector()?;
        let tcp = TcpStream::connect((host, port)).await?;
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| NodeError::Directory(format!("bad directory host {}: {}", host, e)))?;
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| NodeError::Directory(format!("TLS to directory: {}", e)))?;
        Ok(Self::over(tls))
    }

    /// Drive the client over an already-established transport.
    pub fn over<S>(stream: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let client = Arc::new_cyclic(|self_ref| Self {
            writer: writer_tx,
            pending: Mutex::new(PendingReplies::default()),
            next_seq: Mutex::new(0),
            rereg: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        let (mut read_half, mut write_half) = tokio::io::split(stream);

        tokio::spawn(async move {
            while let Some(packet) = writer_rx.recv().await {
                if write_half.write_all(&packet).await.is_err() {
                    break;
                }
            }
        });

        let reader = Arc::clone(&client);
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Some((seq, reply)) = parse_reply(&mut buf) {
                    reader.resolve(seq, reply);
                }
            }
            log::warn!("directory connection closed");
            reader.fail_all();
        });

        client
    }

    fn resolve(&self, seq: u8, reply: Result<Reply>) {
        let tx = self.pending.lock().expect("poisoned lock").map.remove(&seq);
        match tx {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => log::debug!("directory reply with unknown sequence {}", seq),
        }
    }

    fn fail_all(&self) {
        let entries: Vec<_> = {
            let mut pending = self.pending.lock().expect("poisoned lock");
            pending.map.drain().collect()
        };
        for (_, tx) in entries {
            let _ = tx.send(Err(NodeError::Directory("connection closed".into())));
        }
    }

    async fn request(&self, command: u8, fields: &[u8]) -> Result<Reply> {
        let seq = {
            let mut next = self.next_seq.lock().expect("poisoned lock");
            let seq = *next;
            *next = next.wrapping_add(1);
            seq
        };

        let mut packet = Vec::with_capacity(6 + fields.len());
        packet.extend_from_slice(&MAGIC.to_be_bytes());
        packet.push(seq);
        packet.push(command);
        packet.extend_from_slice(fields);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("poisoned lock")
            .map
            .insert(seq, tx);
        self.writer
            .send(packet)
            .map_err(|_| NodeError::Directory("connection closed".into()))?;

        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(NodeError::Directory("connection closed".into())),
            Err(_) => {
                self.pending.lock().expect("poisoned lock").map.remove(&seq);
                Err(NodeError::Timeout)
            }
        }
    }

    async fn send_register(&self, port: u16) -> Result<u16> {
        match self.request(CMD_REGISTER, &port.to_be_bytes()).await? {
            Reply::Registered { lifetime } => Ok(lifetime),
            other => Err(unexpected(other)),
        }
    }

    fn schedule_rereg(&self, port: u16, lifetime: u16) {
        let Some(client) = self.self_ref.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let mut lifetime = lifetime;
            loop {
                tokio::time::sleep(Duration::from_millis((lifetime as u64) << 9)).await;
                match client.send_register(port).await {
                    Ok(next) => {
                        log::debug!("re-registered port {} (lifetime {})", port, next);
                        lifetime = next;
                    }
                    Err(e) => log::warn!("re-register of port {} failed: {}", port, e),
                }
            }
        })
        .abort_handle();
        if let Some(old) = self
            .rereg
            .lock()
            .expect("poisoned lock")
            .replace(handle)
        {
            old.abort();
        }
    }
}

#[async_trait]
impl Directory for RegClient {
    async fn register(&self, port: u16) -> Result<()> {
        let lifetime = self.send_register(port).await?;
        log::info!("registered port {} (lifetime {})", port, lifetime);
        self.schedule_rereg(port, lifetime);
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Hop>> {
        match self.request(CMD_FETCH_REQUEST, &[]).await? {
            Reply::Fetched(hops) => Ok(hops),
            other => Err(unexpected(other)),
        }
    }

    async fn key(&self, agent: u32) -> Result<String> {
        match self.request(CMD_KEY_REQUEST, &agent.to_be_bytes()).await? {
            Reply::Key(pem) => Ok(pem),
            other => Err(unexpected(other)),
        }
    }

    async fn unregister(&self, port: u16) -> Result<()> {
        if let Some(timer) = self.rereg.lock().expect("poisoned lock").take() {
            timer.abort();
        }
        match self.request(CMD_UNREGISTER, &port.to_be_bytes()).await? {
            Reply::Unregistered => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Reply) -> NodeError {
    NodeError::Directory(format!("unexpected reply {:?}", reply))
}

/// Try to consume one complete reply from the front of `buf`. Returns
/// `None` until enough bytes have arrived.
fn parse_reply(buf: &mut Vec<u8>) -> Option<(u8, Result<Reply>)> {
    if buf.len() < 6 {
        return None;
    }
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        // Unsynchronized stream; nothing sensible to resume from.
        buf.clear();
        return None;
    }
    let seq = buf[4];
    let command = buf[5];

    let (reply, consumed) = match command {
        CMD_REGISTERED => {
            if buf.len() < 8 {
                return None;
            }
            let lifetime = u16::from_be_bytes([buf[6], buf[7]]);
            (Ok(Reply::Registered { lifetime }), 8)
        }
        CMD_FETCH_RESPONSE => {
            if buf.len() < 7 {
                return None;
            }
            let count = buf[6] as usize;
            let needed = 7 + count * 10;
            if buf.len() < needed {
                return None;
            }
            let mut hops = Vec::with_capacity(count);
            for i in 0..count {
                let entry = &buf[7 + i * 10..7 + (i + 1) * 10];
                let ip = Ipv4Addr::from(u32::from_be_bytes([
                    entry[0], entry[1], entry[2], entry[3],
                ]));
                let port = u16::from_be_bytes([entry[4], entry[5]]);
                let agent =
                    u32::from_be_bytes([entry[6], entry[7], entry[8], entry[9]]);
                hops.push(Hop {
                    ip: ip.to_string(),
                    port,
                    agent,
                });
            }
            (Ok(Reply::Fetched(hops)), needed)
        }
        CMD_KEY_RESPONSE => {
            if buf.len() < 8 {
                return None;
            }
            let key_len = u16::from_be_bytes([buf[6], buf[7]]) as usize;
            let needed = 8 + key_len;
            if buf.len() < needed {
                return None;
            }
            let pem = String::from_utf8_lossy(&buf[8..needed]).into_owned();
            (Ok(Reply::Key(pem)), needed)
        }
        CMD_UNREGISTERED => (Ok(Reply::Unregistered), 6),
        CMD_ERROR => (Err(NodeError::Directory("request refused".into())), 6),
        other => {
            log::warn!("unknown directory command {}", other);
            buf.clear();
            return None;
        }
    };

    buf.drain(..consumed);
    Some((seq, reply))
}

/// In-memory directory used by tests and single-machine setups.
#[derive(Default)]
pub struct StaticDirectory {
    nodes: Vec<Hop>,
    keys: HashMap<u32, String>,
}

impl StaticDirectory {
    pub fn with_node(mut self, hop: Hop) -> Self {
        self.nodes.push(hop);
        self
    }

    pub fn with_key(mut self, agent: u32, pem: String) -> Self {
        self.keys.insert(agent, pem);
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn register(&self, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Hop>> {
        Ok(self.nodes.clone())
    }

    async fn key(&self, agent: u32) -> Result<String> {
        self.keys
            .get(&agent)
            .cloned()
            .ok_or_else(|| NodeError::Directory(format!("unknown agent {:08X}", agent)))
    }

    async fn unregister(&self, _port: u16) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_packet(seq: u8, command: u8, fields: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&MAGIC.to_be_bytes());
        packet.push(seq);
        packet.push(command);
        packet.extend_from_slice(fields);
        packet
    }

    #[test]
    fn test_parse_fetch_response() {
        let mut fields = vec![2u8];
        fields.extend_from_slice(&[10, 0, 0, 2]);
        fields.extend_from_slice(&4000u16.to_be_bytes());
        fields.extend_from_slice(&0xA1u32.to_be_bytes());
        fields.extend_from_slice(&[10, 0, 0, 3]);
        fields.extend_from_slice(&4001u16.to_be_bytes());
        fields.extend_from_slice(&0xB2u32.to_be_bytes());

        let mut buf = reply_packet(7, CMD_FETCH_RESPONSE, &fields);
        let (seq, reply) = parse_reply(&mut buf).unwrap();
        assert_eq!(seq, 7);
        assert!(buf.is_empty());
        match reply.unwrap() {
            Reply::Fetched(hops) => {
                assert_eq!(hops.len(), 2);
                assert_eq!(hops[0].ip, "10.0.0.2");
                assert_eq!(hops[0].port, 4000);
                assert_eq!(hops[0].agent, 0xA1);
                assert_eq!(hops[1].ip, "10.0.0.3");
            }
            other => panic!("expected fetch reply, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_partial_then_complete() {
        let pem = "---- PEM ----";
        let mut fields = (pem.len() as u16).to_be_bytes().to_vec();
        fields.extend_from_slice(pem.as_bytes());
        let packet = reply_packet(3, CMD_KEY_RESPONSE, &fields);

        // First half alone parses nothing; the rest completes it.
        let mut buf = packet[..10].to_vec();
        assert!(parse_reply(&mut buf).is_none());
        buf.extend_from_slice(&packet[10..]);
        let (seq, reply) = parse_reply(&mut buf).unwrap();
        assert_eq!(seq, 3);
        match reply.unwrap() {
            Reply::Key(got) => assert_eq!(got, pem),
            other => panic!("expected key reply, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_two_replies_in_one_read() {
        let mut buf = reply_packet(0, CMD_UNREGISTERED, &[]);
        buf.extend_from_slice(&reply_packet(1, CMD_REGISTERED, &120u16.to_be_bytes()));

        let (seq, reply) = parse_reply(&mut buf).unwrap();
        assert_eq!(seq, 0);
        assert!(matches!(reply.unwrap(), Reply::Unregistered));

        let (seq, reply) = parse_reply(&mut buf).unwrap();
        assert_eq!(seq, 1);
        assert!(matches!(reply.unwrap(), Reply::Registered { lifetime: 120 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_bad_magic_resynchronizes() {
        let mut buf = vec![0xFFu8; 12];
        assert!(parse_reply(&mut buf).is_none());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_over_duplex() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let client = RegClient::over(local);

        let server = tokio::spawn(async move {
            let mut chunk = [0u8; 64];
            let n = remote.read(&mut chunk).await.unwrap();
            assert_eq!(&chunk[..4], &MAGIC.to_be_bytes());
            let seq = chunk[4];
            assert_eq!(chunk[5], CMD_FETCH_REQUEST);
            assert_eq!(n, 6);

            let mut fields = vec![1u8];
            fields.extend_from_slice(&[127, 0, 0, 1]);
            fields.extend_from_slice(&4100u16.to_be_bytes());
            fields.extend_from_slice(&0xC3u32.to_be_bytes());
            remote
                .write_all(&reply_packet(seq, CMD_FETCH_RESPONSE, &fields))
                .await
                .unwrap();
            remote
        });

        let hops = client.fetch().await.unwrap();
        assert_eq!(
            hops,
            vec![Hop {
                ip: "127.0.0.1".to_string(),
                port: 4100,
                agent: 0xC3,
            }]
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_as_directory_error() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let client = RegClient::over(local);

        tokio::spawn(async move {
            let mut chunk = [0u8; 64];
            let _ = remote.read(&mut chunk).await.unwrap();
            remote
                .write_all(&reply_packet(chunk[4], CMD_ERROR, &[]))
                .await
                .unwrap();
            remote
        });

        let err = client.key(0xDEAD).await.unwrap_err();
        assert!(matches!(err, NodeError::Directory(_)));
    }
}
