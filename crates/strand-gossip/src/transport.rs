//! Transport abstraction for gossip traffic.
//!
//! In-memory channels for deterministic multi-node tests, UDP for
//! deployments where gossip rides its own socket.

use crate::message::GossipMessage;
use crate::GossipError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[async_trait]
pub trait GossipTransport: Send + Sync + 'static {
    async fn send(&self, target: SocketAddr, msg: GossipMessage) -> Result<(), GossipError>;
    async fn recv(&self) -> Result<(SocketAddr, GossipMessage), GossipError>;
    fn local_addr(&self) -> SocketAddr;
}

/// In-memory transport over tokio channels.
pub struct InMemoryTransport {
    local_addr: SocketAddr,
    peers: Arc<parking_lot::RwLock<HashMap<SocketAddr, mpsc::Sender<(SocketAddr, GossipMessage)>>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(SocketAddr, GossipMessage)>>>,
}

impl InMemoryTransport {
    pub fn new(local_addr: SocketAddr) -> (Self, mpsc::Sender<(SocketAddr, GossipMessage)>) {
        let (tx, rx) = mpsc::channel(128);
        let transport = Self {
            local_addr,
            peers: Arc::new(parking_lot::RwLock::new(HashMap::new())),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        };
        (transport, tx)
    }

    pub fn add_peer(&self, addr: SocketAddr, sender: mpsc::Sender<(SocketAddr, GossipMessage)>) {
        self.peers.write().insert(addr, sender);
    }

    /// Disconnect a peer; sends to it start failing, simulating a dead
    /// or partitioned node.
    pub fn remove_peer(&self, addr: &SocketAddr) {
        self.peers.write().remove(addr);
    }
}

#[async_trait]
impl GossipTransport for InMemoryTransport {
    async fn send(&self, target: SocketAddr, msg: GossipMessage) -> Result<(), GossipError> {
        let sender = self.peers.read().get(&target).cloned();
        match sender {
            Some(tx) => tx
                .send((self.local_addr, msg))
                .await
                .map_err(|_| GossipError::Transport("peer channel closed".to_string())),
            None => Err(GossipError::Transport(format!("peer not found: {}", target))),
        }
    }

    async fn recv(&self) -> Result<(SocketAddr, GossipMessage), GossipError> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| GossipError::Transport("receive channel closed".to_string()))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Fully-connected mesh of in-memory transports.
pub fn create_transport_mesh(
    addrs: Vec<SocketAddr>,
) -> HashMap<SocketAddr, Arc<InMemoryTransport>> {
    let mut transports = HashMap::new();
    let mut senders = HashMap::new();
    for addr in &addrs {
        let (transport, sender) = InMemoryTransport::new(*addr);
        transports.insert(*addr, Arc::new(transport));
        senders.insert(*addr, sender);
    }
    for addr in &addrs {
        let transport = transports.get(addr).unwrap();
        for (peer_addr, sender) in &senders {
            if peer_addr != addr {
                transport.add_peer(*peer_addr, sender.clone());
            }
        }
    }
    transports
}

const MAX_UDP_PACKET_SIZE: usize = 65535;

/// UDP transport; messages are bincode-encoded datagrams.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, GossipError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| GossipError::Transport(format!("failed to bind UDP socket: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| GossipError::Transport(format!("failed to get local addr: {}", e)))?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }
}

#[async_trait]
impl GossipTransport for UdpTransport {
    async fn send(&self, target: SocketAddr, msg: GossipMessage) -> Result<(), GossipError> {
        let bytes = msg.encode()?;
        if bytes.len() > MAX_UDP_PACKET_SIZE {
            return Err(GossipError::Transport(format!(
                "message too large: {} bytes",
                bytes.len()
            )));
        }
        self.socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| GossipError::Transport(format!("UDP send failed: {}", e)))?;
        Ok(())
    }

    async fn recv(&self) -> Result<(SocketAddr, GossipMessage), GossipError> {
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| GossipError::Transport(format!("UDP recv failed: {}", e)))?;
        let msg = GossipMessage::decode(&buf[..len])?;
        Ok((from, msg))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn ping(from: u16) -> GossipMessage {
        GossipMessage::Ping {
            seq: 1,
            from,
            entries: vec![],
        }
    }

    #[tokio::test]
    async fn mesh_send_recv() {
        let addrs: Vec<SocketAddr> = (9001..=9003).map(test_addr).collect();
        let mesh = create_transport_mesh(addrs.clone());
        let t1 = mesh.get(&addrs[0]).unwrap();
        let t2 = mesh.get(&addrs[1]).unwrap();

        t1.send(addrs[1], ping(0)).await.unwrap();
        let (from, msg) = t2.recv().await.unwrap();
        assert_eq!(from, addrs[0]);
        assert_eq!(msg, ping(0));
    }

    #[tokio::test]
    async fn removed_peer_is_unreachable() {
        let addrs: Vec<SocketAddr> = (9001..=9002).map(test_addr).collect();
        let mesh = create_transport_mesh(addrs.clone());
        let t1 = mesh.get(&addrs[0]).unwrap();
        t1.remove_peer(&addrs[1]);
        assert!(t1.send(addrs[1], ping(0)).await.is_err());
    }

    #[tokio::test]
    async fn udp_roundtrip() {
        let t1 = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let t2 = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        t1.send(t2.local_addr(), ping(7)).await.unwrap();
        let (from, msg) = t2.recv().await.unwrap();
        assert_eq!(from, t1.local_addr());
        assert_eq!(msg, ping(7));
    }
}
