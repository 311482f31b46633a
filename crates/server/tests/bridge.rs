use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use flightline_server::bridge::is_virtual_range;
use flightline_server::{BridgeConfig, BridgeSend, Datagram, TransportBridge};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn bridge() -> (TransportBridge, mpsc::Receiver<Datagram>) {
    let (tx, rx) = mpsc::channel(64);
    let config = BridgeConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        virtual_base_port: 20_000,
        outbound_queue: 16,
    };
    (TransportBridge::bind(&config, tx).await.unwrap(), rx)
}

async fn connect(bridge: &TransportBridge) -> Client {
    let url = format!("ws://{}", bridge.local_addr());
    connect_async(url).await.unwrap().0
}

/// Sends one frame and returns the virtual address it arrived from.
async fn announce(client: &mut Client, inbound: &mut mpsc::Receiver<Datagram>, tag: u8) -> SocketAddr {
    client.send(Message::binary(vec![tag])).await.unwrap();
    let datagram = timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(datagram.bytes, vec![tag]);
    datagram.addr
}

async fn wait_for_count(bridge: &TransportBridge, count: usize) {
    for _ in 0..200 {
        if bridge.connection_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bridge never reached {} connections", count);
}

#[tokio::test]
async fn test_each_connection_gets_its_own_virtual_endpoint() {
    let (bridge, mut inbound) = bridge().await;
    let mut first = connect(&bridge).await;
    let mut second = connect(&bridge).await;

    let a = announce(&mut first, &mut inbound, 1).await;
    let b = announce(&mut second, &mut inbound, 2).await;

    assert_ne!(a, b);
    assert!(is_virtual_range(&a) && is_virtual_range(&b));
    assert!(bridge.is_virtual(&a) && bridge.is_virtual(&b));
    assert_eq!(bridge.connection_count(), 2);
}

#[tokio::test]
async fn test_send_to_reaches_the_right_socket() {
    let (bridge, mut inbound) = bridge().await;
    let mut client = connect(&bridge).await;
    let addr = announce(&mut client, &mut inbound, 1).await;

    assert_eq!(bridge.send_to(&addr, b"pong"), BridgeSend::Delivered);
    let frame = timeout(Duration::from_secs(5), client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame.into_data().as_ref(), b"pong");

    let stranger: SocketAddr = "240.9.9.9:1".parse().unwrap();
    assert_eq!(bridge.send_to(&stranger, b"x"), BridgeSend::NotBridged);
}

#[tokio::test]
async fn test_closed_connections_are_forgotten_and_addresses_not_reused() {
    let (bridge, mut inbound) = bridge().await;
    let mut seen = HashSet::new();

    for tag in 0..5u8 {
        let mut client = connect(&bridge).await;
        let addr = announce(&mut client, &mut inbound, tag).await;
        assert!(seen.insert(addr), "address {} handed out twice", addr);

        client.close(None).await.unwrap();
        wait_for_count(&bridge, 0).await;
        assert_eq!(bridge.send_to(&addr, b"late"), BridgeSend::NotBridged);
    }
}

#[tokio::test]
async fn test_text_frames_are_dropped() {
    let (bridge, mut inbound) = bridge().await;
    let mut client = connect(&bridge).await;

    client.send(Message::text("hello")).await.unwrap();
    let addr = announce(&mut client, &mut inbound, 7).await;

    assert!(bridge.is_virtual(&addr));
    assert!(inbound.try_recv().is_err());
}

#[tokio::test]
async fn test_shutdown_waits_for_every_connection() {
    let (bridge, mut inbound) = bridge().await;
    let mut clients = Vec::new();
    for tag in 0..4u8 {
        let mut client = connect(&bridge).await;
        announce(&mut client, &mut inbound, tag).await;
        clients.push(client);
    }
    assert_eq!(bridge.connection_count(), 4);

    bridge.shutdown(Duration::from_secs(1)).await;

    // The pumps have finished by the time shutdown returns.
    assert_eq!(bridge.connection_count(), 0);
    for mut client in clients {
        let closed = timeout(Duration::from_secs(5), async {
            while let Some(Ok(message)) = client.next().await {
                if message.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    let refused = timeout(
        Duration::from_secs(2),
        connect_async(format!("ws://{}", bridge.local_addr())),
    )
    .await;
    assert!(!matches!(refused, Ok(Ok(_))));
}
