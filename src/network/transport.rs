//! TCP transport
//!
//! Opens and accepts the raw sockets peer connections run on. Framing is the
//! codec's job; this layer only deals with addresses, timeouts and socket
//! options.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tracing::{debug, error};

use crate::error::{HarnessError, Result};

/// TCP transport with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connect to `addr`, failing with `SyncTimeout` after the connect timeout
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HarnessError::SyncTimeout {
                what: format!("TCP connect to {}", addr),
                expected: "established connection".to_string(),
                last_observed: "no answer".to_string(),
                waited: self.connect_timeout,
            })??;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", addr);
        Ok(stream)
    }

    pub async fn listen(&self, addr: SocketAddr) -> Result<TcpListener> {
        let listener = TokioTcpListener::bind(addr).await?;
        debug!("Listening on {}", listener.local_addr()?);
        Ok(TcpListener { listener })
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// TCP listener
pub struct TcpListener {
    listener: TokioTcpListener,
}

impl TcpListener {
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        match self.listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Accepted TCP connection from {}", addr);
                stream.set_nodelay(true)?;
                Ok((stream, addr))
            }
            Err(e) => {
                error!("Failed to accept TCP connection: {}", e);
                Err(e.into())
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_accept() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(transport.connect(addr), listener.accept());
        let client = client.unwrap();
        let (_server, peer) = accepted.unwrap();
        assert_eq!(client.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::new(Duration::from_secs(2));
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = transport
            .connect(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Io(_)));
    }
}
