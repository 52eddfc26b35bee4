//! Network layer tests over real sockets

use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

use bllvm_harness::chain::Hash256;
use bllvm_harness::network::{
    DisconnectReason, HandshakeState, InventoryItem, NetworkScheduler, NullHandler, Outbox,
    PeerConfig, PeerHandler, ProtocolMessage, SchedulerConfig,
};
use bllvm_harness::utils::logging::init_test_logging;
use bllvm_harness::HarnessError;

mod common;

/// Forwards every application message to a channel
struct Recorder {
    tx: mpsc::UnboundedSender<ProtocolMessage>,
}

impl PeerHandler for Recorder {
    fn on_message(&mut self, _outbox: &mut Outbox, message: &ProtocolMessage) {
        if !message.is_control() {
            let _ = self.tx.send(message.clone());
        }
    }
}

async fn recording_server(
    scheduler: &NetworkScheduler,
) -> Result<(SocketAddr, mpsc::UnboundedReceiver<ProtocolMessage>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let addr = scheduler
        .listen("127.0.0.1:0".parse()?, move |_| Recorder { tx: tx.clone() })
        .await?;
    Ok((addr, rx))
}

fn inv(n: u8) -> ProtocolMessage {
    ProtocolMessage::Inv(vec![InventoryItem::tx(Hash256([n; 32]))])
}

#[tokio::test]
async fn test_messages_arrive_in_send_order() -> Result<()> {
    init_test_logging();
    let server = NetworkScheduler::new(SchedulerConfig::default());
    let (addr, mut rx) = recording_server(&server).await?;

    let client = NetworkScheduler::new(SchedulerConfig::default());
    let peer = client.connect(addr, NullHandler).await?;
    peer.wait_for_ready(Duration::from_secs(5)).await?;
    assert_eq!(
        peer.remote_version().map(|v| v.user_agent),
        Some(PeerConfig::default().user_agent)
    );

    for n in 0..50 {
        peer.send(inv(n)).await?;
    }
    for n in 0..50 {
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        assert_eq!(received, Some(inv(n)));
    }

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_connections_are_independent() -> Result<()> {
    let server = NetworkScheduler::new(SchedulerConfig::default());
    let (addr, mut rx) = recording_server(&server).await?;
    let client = NetworkScheduler::new(SchedulerConfig::default());

    // A stalled handshake on one connection must not hold up the others
    let _stalled = client.attach(common::silent_peer(), None, NullHandler)?;

    let a = client.connect(addr, NullHandler).await?;
    let b = client.connect(addr, NullHandler).await?;
    a.wait_for_ready(Duration::from_secs(5)).await?;
    b.wait_for_ready(Duration::from_secs(5)).await?;
    assert_ne!(a.id(), b.id());

    b.send(inv(2)).await?;
    a.send(inv(1)).await?;
    let mut seen = Vec::new();
    for _ in 0..2 {
        if let Some(message) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await? {
            seen.push(message);
        }
    }
    assert!(seen.contains(&inv(1)) && seen.contains(&inv(2)));
    assert_eq!(client.peers().len(), 3);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_disconnects_and_blocks_new_work() -> Result<()> {
    let server = NetworkScheduler::new(SchedulerConfig::default());
    let (addr, _rx) = recording_server(&server).await?;
    let client = NetworkScheduler::new(SchedulerConfig::default());
    let peer = client.connect(addr, NullHandler).await?;
    peer.wait_for_ready(Duration::from_secs(5)).await?;

    let token = client.shutdown_token();
    client.shutdown().await;
    client.shutdown().await;

    assert!(token.is_cancelled());
    assert_eq!(peer.state(), HandshakeState::Disconnected);
    assert_eq!(peer.disconnect_reason(), Some(DisconnectReason::Shutdown));
    assert!(matches!(
        peer.send(inv(0)).await,
        Err(HarnessError::Disconnected { .. })
    ));
    assert!(client.connect(addr, NullHandler).await.is_err());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_remote_shutdown_is_observed() -> Result<()> {
    let server = NetworkScheduler::new(SchedulerConfig::default());
    let (addr, _rx) = recording_server(&server).await?;
    let client = NetworkScheduler::new(SchedulerConfig::default());
    let peer = client.connect(addr, NullHandler).await?;
    peer.wait_for_ready(Duration::from_secs(5)).await?;

    server.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), peer.wait_closed()).await?;
    assert!(matches!(
        peer.disconnect_reason(),
        Some(DisconnectReason::RemoteClosed) | Some(DisconnectReason::Io(_))
    ));

    client.shutdown().await;
    Ok(())
}
