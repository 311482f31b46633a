use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::BridgeConfig;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const VIRTUAL_NET: u32 = 0xF000_0000;
const VIRTUAL_HOST_MASK: u32 = 0x0FFF_FFFF;

/// One whole protocol message and the address it came from. UDP peers use
/// their real address, bridged peers their virtual endpoint.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub addr: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSend {
    Delivered,
    /// The address has no live WebSocket behind it.
    NotBridged,
    /// The connection's outbound queue was full.
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to bind bridge listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// True for addresses in the reserved `240.0.0.0/4` block virtual endpoints
/// are drawn from.
pub fn is_virtual_range(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => u32::from(ip) & !VIRTUAL_HOST_MASK == VIRTUAL_NET,
        IpAddr::V6(_) => false,
    }
}

/// Maps connection number `n` to a unique address in `240.0.0.0/4`. Ports
/// run from `base_port` upward; the host part advances each time they wrap.
pub fn virtual_endpoint(n: u64, base_port: u16) -> SocketAddr {
    let base_port = base_port.max(1);
    let span = u64::from(u16::MAX - base_port) + 1;
    let port = base_port + (n % span) as u16;
    let host = ((n / span) as u32) & VIRTUAL_HOST_MASK;
    SocketAddr::from((Ipv4Addr::from(VIRTUAL_NET | host), port))
}

struct Peer {
    conn_id: u64,
    outbound: mpsc::Sender<Vec<u8>>,
}

struct BridgeShared {
    peers: DashMap<SocketAddr, Peer>,
    endpoints: DashMap<u64, SocketAddr>,
    next_conn: AtomicU64,
    base_port: u16,
    outbound_queue: usize,
    inbound: mpsc::Sender<Datagram>,
}

impl BridgeShared {
    fn register(&self) -> (u64, SocketAddr, mpsc::Receiver<Vec<u8>>) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let addr = virtual_endpoint(conn_id, self.base_port);
        let (outbound, outbound_rx) = mpsc::channel(self.outbound_queue.max(1));
        self.peers.insert(addr, Peer { conn_id, outbound });
        self.endpoints.insert(conn_id, addr);
        (conn_id, addr, outbound_rx)
    }

    fn unregister(&self, conn_id: u64) {
        if let Some((_, addr)) = self.endpoints.remove(&conn_id) {
            self.peers.remove_if(&addr, |_, peer| peer.conn_id == conn_id);
        }
    }
}

/// Accepts WebSocket clients and presents each one to the server as a
/// datagram peer with its own virtual address.
pub struct TransportBridge {
    local_addr: SocketAddr,
    shared: Arc<BridgeShared>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportBridge {
    /// Binds the listener and starts accepting. Frames from every bridged
    /// client are pushed into `inbound`.
    pub async fn bind(
        config: &BridgeConfig,
        inbound: mpsc::Sender<Datagram>,
    ) -> Result<Self, BridgeError> {
        let bind_error = |source| BridgeError::Bind {
            addr: config.bind_addr,
            source,
        };
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let shared = Arc::new(BridgeShared {
            peers: DashMap::new(),
            endpoints: DashMap::new(),
            next_conn: AtomicU64::new(0),
            base_port: config.virtual_base_port,
            outbound_queue: config.outbound_queue,
            inbound,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared), shutdown_rx));

        log::info!("WebSocket bridge listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shared,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_virtual(&self, addr: &SocketAddr) -> bool {
        self.shared.peers.contains_key(addr)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.peers.len()
    }

    /// Queues `bytes` for the WebSocket behind `addr` without waiting.
    pub fn send_to(&self, addr: &SocketAddr, bytes: &[u8]) -> BridgeSend {
        let Some(peer) = self.shared.peers.get(addr) else {
            return BridgeSend::NotBridged;
        };
        match peer.outbound.try_send(bytes.to_vec()) {
            Ok(()) => BridgeSend::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => BridgeSend::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => BridgeSend::NotBridged,
        }
    }

    /// Stops accepting and closes every bridged connection, waiting up to
    /// `grace` for the pumps to finish before aborting them.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let Some(mut task) = self.accept_task.lock().take() else {
            return;
        };
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            log::warn!("Bridge connections did not close in {:?}, aborting", grace);
            task.abort();
        }
    }
}

impl Drop for TransportBridge {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<BridgeShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Dropping the set aborts every pump, so aborting this task tears the
    // connections down too.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&shared),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    log::warn!("Bridge accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    drop(listener);
    log::debug!("Bridge accept loop stopped, closing {} connections", connections.len());
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<BridgeShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            log::debug!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            log::debug!("WebSocket handshake with {} timed out", peer);
            return;
        }
    };

    let (conn_id, addr, mut outbound) = shared.register();
    log::info!("WebSocket {} bridged as {}", peer, addr);
    let (mut sink, mut frames) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Flush what was queued before the signal, typically a goodbye.
                while let Ok(bytes) = outbound.try_recv() {
                    if sink.send(Message::binary(bytes)).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outgoing = outbound.recv() => match outgoing {
                Some(bytes) => {
                    if let Err(e) = sink.send(Message::binary(bytes)).await {
                        log::debug!("Write to {} failed: {}", addr, e);
                        break;
                    }
                }
                None => break,
            },
            incoming = frames.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    let datagram = Datagram {
                        addr,
                        bytes: bytes.to_vec(),
                    };
                    if shared.inbound.send(datagram).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    log::warn!("Dropping text frame from {}", addr);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Read from {} failed: {}", addr, e);
                    break;
                }
            },
        }
    }

    shared.unregister(conn_id);
    log::info!("WebSocket {} ({}) closed", peer, addr);
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_virtual_endpoints_are_unique() {
        let base = 65_000;
        let addrs: HashSet<SocketAddr> = (0..2_000).map(|n| virtual_endpoint(n, base)).collect();
        assert_eq!(addrs.len(), 2_000);
        assert!(addrs.iter().all(is_virtual_range));
    }

    #[test]
    fn test_first_endpoint_uses_base_port() {
        let addr = virtual_endpoint(0, 10_000);
        assert_eq!(addr, "240.0.0.0:10000".parse::<std::net::SocketAddr>().unwrap());
        assert_eq!(virtual_endpoint(1, 10_000).port(), 10_001);
    }

    #[test]
    fn test_real_addresses_are_not_virtual() {
        assert!(!is_virtual_range(&"127.0.0.1:9000".parse().unwrap()));
        assert!(!is_virtual_range(&"[::1]:9000".parse().unwrap()));
        assert!(is_virtual_range(&"255.1.2.3:1".parse().unwrap()));
    }
}
