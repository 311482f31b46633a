use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout_at};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use flightline::{MAX_PACKET_SIZE, PROTOCOL_VERSION, Packet, PacketError, PacketType};

const HANDSHAKE_RESEND: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("no handshake reply within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("server rejected the connection: {0}")]
    Rejected(String),
    #[error("server closed the session: {0}")]
    ServerDisconnect(String),
    #[error("connection closed")]
    Closed,
    #[error("no traffic from the server for {0:?}")]
    Idle(Duration),
    #[error("{0} consecutive undecodable packets")]
    TooManyDecodeErrors(u32),
    #[error("connection task failed: {0}")]
    TaskFailed(String),
}

/// What the server handed out in `ConnectionAccepted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub client_id: u32,
    pub entity_id: u32,
    pub server_time_ms: u64,
}

/// A bidirectional message pipe to the server. Each call carries one whole
/// protocol envelope.
pub trait Link: Send + 'static {
    fn send(&mut self, bytes: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// `Ok(None)` once the peer has closed the link.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens fresh links for every connection attempt.
pub trait Connector: Send + Sync + 'static {
    type Link: Link;

    fn open(&self) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;

    fn describe(&self) -> String;
}

pub struct UdpConnector {
    server: SocketAddr,
}

impl UdpConnector {
    pub fn new(server: SocketAddr) -> Self {
        Self { server }
    }
}

impl Connector for UdpConnector {
    type Link = UdpLink;

    async fn open(&self) -> Result<UdpLink, TransportError> {
        let local = if self.server.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.server).await?;
        log::debug!(
            "UDP socket {} connected to {}",
            socket.local_addr()?,
            self.server
        );
        Ok(UdpLink {
            socket,
            buffer: vec![0u8; MAX_PACKET_SIZE * 2],
        })
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.server)
    }
}

pub struct UdpLink {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl Link for UdpLink {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.socket.send(&bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let len = self.socket.recv(&mut self.buffer).await?;
        Ok(Some(self.buffer[..len].to_vec()))
    }

    async fn close(&mut self) {}
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    type Link = WsLink;

    async fn open(&self) -> Result<WsLink, TransportError> {
        let (stream, _response) = connect_async(self.url.as_str()).await?;
        Ok(WsLink { stream })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

pub struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Link for WsLink {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.stream.send(Message::binary(bytes)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes.to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Text(_))) => log::warn!("Dropping text frame from server"),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            log::debug!("WebSocket close failed: {}", e);
        }
    }
}

/// Sends `ConnectionRequest` until the server answers or `timeout` passes.
/// Anything other than an accept or a rejection is ignored meanwhile.
pub async fn handshake<L: Link>(
    link: &mut L,
    player_name: &str,
    timeout: Duration,
) -> Result<SessionInfo, TransportError> {
    let request = Packet::new(PacketType::ConnectionRequest {
        player_name: player_name.to_string(),
        version: PROTOCOL_VERSION,
    })
    .serialize()?;
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        link.send(request.clone()).await?;
        let resend_at = (Instant::now() + HANDSHAKE_RESEND).min(deadline);

        while let Ok(received) = timeout_at(resend_at, link.recv()).await {
            let Some(bytes) = received? else {
                return Err(TransportError::Closed);
            };
            let packet = match Packet::deserialize(&bytes) {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("Undecodable packet during handshake: {}", e);
                    continue;
                }
            };
            match packet.payload {
                PacketType::ConnectionAccepted {
                    client_id,
                    entity_id,
                    server_time_ms,
                } => {
                    return Ok(SessionInfo {
                        client_id,
                        entity_id,
                        server_time_ms,
                    });
                }
                PacketType::Disconnect { reason, .. } => {
                    return Err(TransportError::Rejected(reason));
                }
                other => log::debug!("Ignoring {} before acceptance", other.kind()),
            }
        }
    }

    Err(TransportError::HandshakeTimeout(timeout))
}
