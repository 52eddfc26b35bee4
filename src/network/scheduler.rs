//! Connection scheduler
//!
//! Owns every connection worker. Each connection runs as its own task on a
//! [`TaskTracker`], so reads on one socket never wait on another. Shutdown is
//! explicit: stop accepting, let workers flush their queues, and force-close
//! whatever is still running when the grace period ends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::network::peer::{
    start_peer, HandshakeState, PeerConfig, PeerHandle, PeerHandler, PeerId, PeerSignals,
};
use crate::network::transport::TcpTransport;

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub peer: PeerConfig,
    pub connect_timeout: Duration,
    /// Time workers get to flush queued sends before being force-closed
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    transport: TcpTransport,
    tracker: TaskTracker,
    signals: PeerSignals,
    accepting: CancellationToken,
    shut_down: AtomicBool,
    next_id: AtomicU64,
    peers: Mutex<Vec<PeerHandle>>,
}

/// Runs all connections concurrently
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct NetworkScheduler {
    inner: Arc<Inner>,
}

impl NetworkScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let transport = TcpTransport::new(config.connect_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                tracker: TaskTracker::new(),
                signals: PeerSignals::default(),
                accepting: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                peers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Open an outbound connection and start its handshake
    pub async fn connect<H: PeerHandler>(&self, addr: SocketAddr, handler: H) -> Result<PeerHandle> {
        self.ensure_running("connect")?;
        let stream = self.inner.transport.connect(addr).await?;
        self.attach(stream, Some(addr), handler)
    }

    /// Run a connection over an already-open stream
    pub fn attach<S, H>(&self, stream: S, addr: Option<SocketAddr>, handler: H) -> Result<PeerHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        H: PeerHandler,
    {
        self.ensure_running("attach")?;
        let id = PeerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (handle, worker) = start_peer(
            id,
            addr,
            stream,
            handler,
            self.inner.config.peer.clone(),
            self.inner.signals.clone(),
        );
        self.inner.tracker.spawn(worker);

        let mut peers = self.inner.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers.retain(|p| p.state() != HandshakeState::Disconnected);
        peers.push(handle.clone());
        debug!("{} attached ({:?})", id, addr);
        Ok(handle)
    }

    /// Accept inbound connections on `addr`
    ///
    /// `factory` builds the handler for each accepted connection. Returns the
    /// bound address; accepting stops at shutdown.
    pub async fn listen<F, H>(&self, addr: SocketAddr, mut factory: F) -> Result<SocketAddr>
    where
        F: FnMut(SocketAddr) -> H + Send + 'static,
        H: PeerHandler,
    {
        self.ensure_running("listen")?;
        let listener = self.inner.transport.listen(addr).await?;
        let local = listener.local_addr()?;
        info!("Accepting connections on {}", local);

        let scheduler = self.clone();
        let accepting = self.inner.accepting.clone();
        self.inner.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = accepting.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let handler = factory(remote);
                            if let Err(e) = scheduler.attach(stream, Some(remote), handler) {
                                warn!("Dropping inbound connection from {}: {}", remote, e);
                            }
                        }
                        Err(e) => warn!("Accept failed on {}: {}", local, e),
                    },
                }
            }
            debug!("Stopped accepting on {}", local);
        });
        Ok(local)
    }

    /// Live connections
    pub fn peers(&self) -> Vec<PeerHandle> {
        let mut peers = self.inner.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers.retain(|p| p.state() != HandshakeState::Disconnected);
        peers.clone()
    }

    pub fn peer(&self, id: PeerId) -> Option<PeerHandle> {
        self.peers().into_iter().find(|p| p.id() == id)
    }

    /// Token cancelled as soon as shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.signals.drain.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop accepting, drain queues, close sockets and join all workers
    ///
    /// Workers still running after the grace period are force-closed.
    /// Calling this again waits for the first shutdown to finish.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            inner.tracker.wait().await;
            return;
        }

        info!("Shutting down network scheduler ({} tasks)", inner.tracker.len());
        inner.accepting.cancel();
        inner.tracker.close();
        inner.signals.drain.cancel();

        let grace = inner.config.shutdown_grace;
        if tokio::time::timeout(grace, inner.tracker.wait()).await.is_err() {
            warn!(
                "{} workers still running after {:?}, forcing close",
                inner.tracker.len(),
                grace
            );
        }
        inner.signals.force.cancel();
        inner.tracker.wait().await;
        info!("Network scheduler stopped");
    }

    fn ensure_running(&self, action: &str) -> Result<()> {
        if self.is_shut_down() {
            return Err(HarnessError::Usage(format!(
                "cannot {} after the scheduler has shut down",
                action
            )));
        }
        Ok(())
    }
}
