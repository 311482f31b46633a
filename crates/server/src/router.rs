use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tokio::net::UdpSocket;

use crate::bridge::{BridgeSend, TransportBridge, is_virtual_range};

/// Drops a share of outbound datagrams to exercise client reconciliation.
#[derive(Debug, Clone, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        let probability = (self.loss_percent / 100.0).clamp(0.0, 1.0) as f64;
        rand::thread_rng().gen_bool(probability)
    }
}

/// Outbound path for every peer: bridged addresses go to their WebSocket,
/// everything else straight out of the UDP socket. Never waits.
#[derive(Clone)]
pub struct DatagramRouter {
    socket: Arc<UdpSocket>,
    bridge: Option<Arc<TransportBridge>>,
    loss: Option<PacketLossSimulation>,
}

impl DatagramRouter {
    pub fn new(
        socket: Arc<UdpSocket>,
        bridge: Option<Arc<TransportBridge>>,
        loss: Option<PacketLossSimulation>,
    ) -> Self {
        Self {
            socket,
            bridge,
            loss,
        }
    }

    /// Returns whether the bytes were handed to a transport.
    pub fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> bool {
        if self.loss.as_ref().is_some_and(|loss| loss.should_drop()) {
            log::trace!("Simulated loss of {} bytes to {}", bytes.len(), addr);
            return false;
        }

        if is_virtual_range(&addr) {
            let outcome = match &self.bridge {
                Some(bridge) => bridge.send_to(&addr, bytes),
                None => BridgeSend::NotBridged,
            };
            return match outcome {
                BridgeSend::Delivered => true,
                BridgeSend::NotBridged => {
                    log::debug!("No bridged connection for {}, dropping", addr);
                    false
                }
                BridgeSend::Dropped => {
                    log::warn!("Outbound queue for {} full, dropping", addr);
                    false
                }
            };
        }

        match self.socket.try_send_to(bytes, addr) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::warn!("UDP send buffer full, dropping datagram to {}", addr);
                false
            }
            Err(e) => {
                log::warn!("Failed to send to {}: {}", addr, e);
                false
            }
        }
    }
}
