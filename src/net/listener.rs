//! Bounded TCP accept.
//!
//! # Responsibilities
//! - Own the listening socket of one edge listener
//! - Cap concurrent connections: a slot is taken before `accept` and held by
//!   the connection task until it ends
//! - Report bind failures with the address that failed

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("cannot bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    #[error("connection slots are no longer available")]
    LimiterClosed,
}

/// Listening socket plus its connection slots.
///
/// Once every slot is taken, `accept` stops pulling from the kernel backlog
/// until a connection finishes.
#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    slots: Arc<Semaphore>,
}

impl Listener {
    /// Bind `addr` with room for `max_connections` concurrent connections.
    /// Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(addr: SocketAddr, max_connections: usize) -> Result<Self, ListenerError> {
        let bind_error = |source| ListenerError::Bind {
            address: addr,
            source,
        };
        let socket = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;
        let slots = max_connections.max(1);

        tracing::info!(address = %local_addr, max_connections = slots, "Socket bound");

        Ok(Self {
            socket,
            local_addr,
            slots: Arc::new(Semaphore::new(slots)),
        })
    }

    /// Wait for a free slot, then for a connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::LimiterClosed)?;

        let (stream, peer) = self.socket.accept().await.map_err(ListenerError::Accept)?;
        let _ = stream.set_nodelay(true);

        tracing::trace!(
            peer_addr = %peer,
            free_slots = self.slots.available_permits(),
            "Accepted"
        );
        Ok((stream, peer, ConnectionPermit { _slot: permit }))
    }

    /// The bound address, with any requested port 0 resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn available_permits(&self) -> usize {
        self.slots.available_permits()
    }
}

/// One connection slot; released on drop, including when the task panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _slot: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_released_on_drop() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 2).await.unwrap();

        let _client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let (_stream, _peer, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 1);

        drop(permit);
        assert_eq!(listener.available_permits(), 2);
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = Listener::bind("127.0.0.1:0".parse().unwrap(), 1).await.unwrap();
        let err = Listener::bind(first.local_addr(), 1).await.unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[tokio::test]
    async fn zero_limit_still_admits_one() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 0).await.unwrap();
        assert_eq!(listener.available_permits(), 1);
    }
}
