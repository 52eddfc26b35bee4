//! Peer connection management
//!
//! One connection is driven by one worker future that owns the socket. The
//! worker reads frames, runs the version/verack handshake, answers pings,
//! hands every inbound message to the registered [`PeerHandler`] in wire
//! order, and writes queued outbound messages. Callers talk to the worker
//! through a cloneable [`PeerHandle`].

use futures::{SinkExt, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::network::codec::{FrameResult, MessageCodec};
use crate::network::error::DecodeError;
use crate::network::protocol::{
    NetworkAddress, NetworkMagic, ProtocolMessage, VersionMessage, NODE_NETWORK, PROTOCOL_VERSION,
};
use crate::utils::time::current_timestamp;

/// Connection identifier, unique within a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Handshake state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    Connecting,
    VersionSent,
    VersionExchanged,
    Ready,
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit close through a handle
    Closed,
    /// Scheduler shutdown
    Shutdown,
    /// Remote side closed the socket
    RemoteClosed,
    /// Malformed bytes on the wire
    Decode(String),
    /// Socket error
    Io(String),
    /// Peer broke the handshake rules
    ProtocolViolation(String),
    HandshakeTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => f.write_str("closed locally"),
            DisconnectReason::Shutdown => f.write_str("scheduler shutdown"),
            DisconnectReason::RemoteClosed => f.write_str("closed by remote"),
            DisconnectReason::Decode(e) => write!(f, "decode error: {}", e),
            DisconnectReason::Io(e) => write!(f, "I/O error: {}", e),
            DisconnectReason::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            DisconnectReason::HandshakeTimeout => f.write_str("handshake timed out"),
        }
    }
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub magic: NetworkMagic,
    pub protocol_version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
    pub send_queue_capacity: usize,
    pub handshake_timeout: Duration,
    /// Drop the connection on any decode error, not only framing-fatal ones
    pub disconnect_on_decode_error: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            magic: NetworkMagic::REGTEST,
            protocol_version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            user_agent: concat!("/bllvm-harness:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            start_height: 0,
            relay: true,
            send_queue_capacity: 256,
            handshake_timeout: Duration::from_secs(30),
            disconnect_on_decode_error: true,
        }
    }
}

impl PeerConfig {
    fn version_message(&self, remote: Option<SocketAddr>) -> VersionMessage {
        VersionMessage {
            version: self.protocol_version,
            services: self.services,
            timestamp: current_timestamp() as i64,
            addr_recv: remote
                .map(|a| NetworkAddress::new(a, NODE_NETWORK))
                .unwrap_or_else(NetworkAddress::unspecified),
            addr_from: NetworkAddress::unspecified(),
            nonce: rand::random(),
            user_agent: self.user_agent.clone(),
            start_height: self.start_height,
            relay: self.relay,
        }
    }
}

/// Replies queued by a handler while it processes one message
///
/// Flushed to the socket by the worker right after the handler returns, ahead
/// of anything waiting in the send queue.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<ProtocolMessage>,
}

impl Outbox {
    pub fn push(&mut self, message: ProtocolMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<ProtocolMessage> {
        self.messages
    }

    fn take(&mut self) -> Vec<ProtocolMessage> {
        std::mem::take(&mut self.messages)
    }
}

/// Receives a connection's inbound messages
///
/// Runs on the connection's worker: calls for one connection never overlap
/// and arrive in wire order.
pub trait PeerHandler: Send + 'static {
    fn on_message(&mut self, outbox: &mut Outbox, message: &ProtocolMessage);

    fn on_disconnect(&mut self, _reason: &DisconnectReason) {}
}

/// Handler that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl PeerHandler for NullHandler {
    fn on_message(&mut self, _outbox: &mut Outbox, _message: &ProtocolMessage) {}
}

struct PeerShared {
    state: watch::Sender<HandshakeState>,
    remote_version: Mutex<Option<VersionMessage>>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
}

impl PeerShared {
    fn set_state(&self, state: HandshakeState) {
        self.state.send_replace(state);
    }

    fn state(&self) -> HandshakeState {
        *self.state.borrow()
    }
}

/// Cloneable handle to a running connection
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    addr: Option<SocketAddr>,
    shared: Arc<PeerShared>,
    tx: mpsc::Sender<ProtocolMessage>,
    close: CancellationToken,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn state(&self) -> HandshakeState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == HandshakeState::Ready
    }

    /// The peer's version message, once received
    pub fn remote_version(&self) -> Option<VersionMessage> {
        self.shared
            .remote_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared
            .disconnect_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until the handshake completes
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| matches!(s, HandshakeState::Ready | HandshakeState::Disconnected))
                .await
                .map(|s| *s)
        })
        .await;

        match waited {
            Ok(Ok(HandshakeState::Ready)) => Ok(()),
            Ok(_) => Err(self.disconnected_error()),
            Err(_) => Err(HarnessError::SyncTimeout {
                what: format!("handshake with {}", self.id),
                expected: "Ready".to_string(),
                last_observed: format!("{:?}", self.state()),
                waited: timeout,
            }),
        }
    }

    /// Queue a message, waiting for queue capacity
    pub async fn send(&self, message: ProtocolMessage) -> Result<()> {
        self.check_sendable(&message)?;
        self.tx
            .send(message)
            .await
            .map_err(|_| self.disconnected_error())
    }

    /// Queue a message without waiting
    pub fn try_send(&self, message: ProtocolMessage) -> Result<()> {
        self.check_sendable(&message)?;
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HarnessError::QueueFull(self.id),
            mpsc::error::TrySendError::Closed(_) => self.disconnected_error(),
        })
    }

    /// Close the connection; returns once the worker has released the socket
    pub async fn close(&self) {
        self.close.cancel();
        self.wait_closed().await;
    }

    /// Wait for the worker to finish without asking it to stop
    pub async fn wait_closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == HandshakeState::Disconnected).await;
    }

    fn check_sendable(&self, message: &ProtocolMessage) -> Result<()> {
        match self.state() {
            HandshakeState::Disconnected => Err(self.disconnected_error()),
            HandshakeState::Ready => Ok(()),
            _ if message.is_control() => Ok(()),
            state => Err(HarnessError::NotReady {
                peer: self.id,
                command: message.command().to_string(),
                state,
            }),
        }
    }

    fn disconnected_error(&self) -> HarnessError {
        HarnessError::Disconnected {
            peer: self.id,
            reason: self
                .disconnect_reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "connection closed".to_string()),
        }
    }
}

/// Shutdown signals a worker listens to
#[derive(Clone, Default)]
pub struct PeerSignals {
    /// Flush queued sends, then close
    pub drain: CancellationToken,
    /// Close immediately
    pub force: CancellationToken,
}

/// Create a connection over `stream` and return its handle and worker future
///
/// The worker sends our version as soon as it starts. Nothing runs until the
/// future is polled; the scheduler spawns it.
pub fn start_peer<S, H>(
    id: PeerId,
    addr: Option<SocketAddr>,
    stream: S,
    handler: H,
    config: PeerConfig,
    signals: PeerSignals,
) -> (PeerHandle, impl std::future::Future<Output = ()> + Send + 'static)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: PeerHandler,
{
    let (state_tx, _) = watch::channel(HandshakeState::Connecting);
    let shared = Arc::new(PeerShared {
        state: state_tx,
        remote_version: Mutex::new(None),
        disconnect_reason: Mutex::new(None),
    });
    let (tx, rx) = mpsc::channel(config.send_queue_capacity.max(1));
    let close = signals.force.child_token();

    let handle = PeerHandle {
        id,
        addr,
        shared: Arc::clone(&shared),
        tx,
        close: close.clone(),
    };

    let worker = PeerWorker {
        id,
        addr,
        framed: Framed::new(stream, MessageCodec::new(config.magic)),
        handler,
        rx,
        shared,
        config,
        drain: signals.drain,
        force: close,
    };
    (handle, worker.run())
}

struct PeerWorker<S, H> {
    id: PeerId,
    addr: Option<SocketAddr>,
    framed: Framed<S, MessageCodec>,
    handler: H,
    rx: mpsc::Receiver<ProtocolMessage>,
    shared: Arc<PeerShared>,
    config: PeerConfig,
    drain: CancellationToken,
    force: CancellationToken,
}

/// What to do after processing one event
enum Flow {
    Continue,
    Stop(DisconnectReason),
}

impl<S, H> PeerWorker<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: PeerHandler,
{
    async fn run(mut self) {
        let reason = self.drive().await;
        let PeerWorker {
            id,
            framed,
            mut handler,
            shared,
            ..
        } = self;

        // Release the socket before anyone observes Disconnected
        drop(framed);
        match &reason {
            DisconnectReason::Closed | DisconnectReason::Shutdown => {
                info!("{} disconnected: {}", id, reason)
            }
            _ => warn!("{} disconnected: {}", id, reason),
        }
        *shared
            .disconnect_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
        handler.on_disconnect(&reason);
        shared.set_state(HandshakeState::Disconnected);
    }

    async fn drive(&mut self) -> DisconnectReason {
        let version = self.config.version_message(self.addr);
        if let Err(reason) = self.write(ProtocolMessage::Version(version)).await {
            return reason;
        }
        self.shared.set_state(HandshakeState::VersionSent);
        debug!("{} sent version", self.id);

        let handshake_deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(handshake_deadline);
        let mut draining = false;
        let mut queue_open = true;

        loop {
            let ready = self.shared.state() == HandshakeState::Ready;
            let flow = tokio::select! {
                biased;
                _ = self.force.cancelled() => {
                    Flow::Stop(if self.drain.is_cancelled() {
                        DisconnectReason::Shutdown
                    } else {
                        DisconnectReason::Closed
                    })
                }
                _ = self.drain.cancelled(), if !draining => {
                    draining = true;
                    // Stop accepting new sends; whatever is queued still goes out.
                    self.rx.close();
                    if queue_open {
                        Flow::Continue
                    } else {
                        Flow::Stop(DisconnectReason::Shutdown)
                    }
                }
                _ = &mut handshake_deadline, if !ready => Flow::Stop(DisconnectReason::HandshakeTimeout),
                frame = self.framed.next() => self.on_frame(frame).await,
                queued = self.rx.recv(), if queue_open => match queued {
                    Some(message) => match self.write(message).await {
                        Ok(()) => Flow::Continue,
                        Err(reason) => Flow::Stop(reason),
                    },
                    None => {
                        queue_open = false;
                        if draining {
                            Flow::Stop(DisconnectReason::Shutdown)
                        } else {
                            // Every handle dropped; keep serving the peer.
                            Flow::Continue
                        }
                    }
                },
            };
            if let Flow::Stop(reason) = flow {
                return reason;
            }
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<std::result::Result<FrameResult, DecodeError>>,
    ) -> Flow {
        match frame {
            None => Flow::Stop(DisconnectReason::RemoteClosed),
            Some(Err(fatal)) => {
                warn!("{} framing error: {}", self.id, fatal);
                match fatal {
                    DecodeError::Io(e) => {
                        Flow::Stop(DisconnectReason::Io(e.to_string()))
                    }
                    other => Flow::Stop(DisconnectReason::Decode(other.to_string())),
                }
            }
            Some(Ok(Err(e))) => {
                warn!("{} sent a malformed frame: {}", self.id, e);
                if self.config.disconnect_on_decode_error {
                    Flow::Stop(DisconnectReason::Decode(e.to_string()))
                } else {
                    Flow::Continue
                }
            }
            Some(Ok(Ok(message))) => self.on_message(message).await,
        }
    }

    async fn on_message(&mut self, message: ProtocolMessage) -> Flow {
        debug!("{} received {}", self.id, message.command());
        let state = self.shared.state();

        match &message {
            ProtocolMessage::Version(version) => {
                if state != HandshakeState::VersionSent {
                    warn!("{} sent a duplicate version, ignoring", self.id);
                } else {
                    *self
                        .shared
                        .remote_version
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(version.clone());
                    debug!(
                        "{} is {} (protocol {}, height {})",
                        self.id, version.user_agent, version.version, version.start_height
                    );
                    self.shared.set_state(HandshakeState::VersionExchanged);
                    if let Err(reason) = self.write(ProtocolMessage::Verack).await {
                        return Flow::Stop(reason);
                    }
                }
            }
            ProtocolMessage::Verack => match state {
                HandshakeState::VersionExchanged => {
                    self.shared.set_state(HandshakeState::Ready);
                    info!("{} handshake complete", self.id);
                }
                HandshakeState::Ready => debug!("{} sent a duplicate verack", self.id),
                _ => {
                    return Flow::Stop(DisconnectReason::ProtocolViolation(
                        "verack before version".to_string(),
                    ))
                }
            },
            ProtocolMessage::Ping(nonce) => {
                if let Err(reason) = self.write(ProtocolMessage::Pong(*nonce)).await {
                    return Flow::Stop(reason);
                }
            }
            _ => {}
        }

        let mut outbox = Outbox::default();
        self.handler.on_message(&mut outbox, &message);
        for reply in outbox.take() {
            if !reply.is_control() && self.shared.state() != HandshakeState::Ready {
                warn!(
                    "{} handler replied with '{}' before the handshake completed, dropping",
                    self.id,
                    reply.command()
                );
                continue;
            }
            if let Err(reason) = self.write(reply).await {
                return Flow::Stop(reason);
            }
        }
        Flow::Continue
    }

    async fn write(&mut self, message: ProtocolMessage) -> std::result::Result<(), DisconnectReason> {
        let command = message.command().to_string();
        tokio::select! {
            biased;
            _ = self.force.cancelled() => Err(DisconnectReason::Closed),
            sent = self.framed.send(message) => match sent {
                Ok(()) => {
                    debug!("{} sent {}", self.id, command);
                    Ok(())
                }
                Err(DecodeError::Io(e)) => Err(DisconnectReason::Io(e.to_string())),
                Err(e) => Err(DisconnectReason::Decode(e.to_string())),
            }
        }
    }
}
