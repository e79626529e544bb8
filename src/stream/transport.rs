//! The model connection as seen by the session
//!
//! A transport hands out connections: a sink for outbound messages and a
//! lazy stream of inbound ones. The stream ending, or yielding an error,
//! means the connection is gone. Authentication and the vendor handshake
//! are the transport's business.

use super::protocol::{ClientMessage, ServerMessage};
use crate::error::{Result, SteerError};
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Why an open connection stopped delivering messages
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("connection closed by peer: {0}")]
    Closed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<TransportError> for SteerError {
    fn from(e: TransportError) -> Self {
        SteerError::ConnectionDropped(e.to_string())
    }
}

pub type InboundStream = BoxStream<'static, std::result::Result<ServerMessage, TransportError>>;

/// One open bidirectional connection
pub struct Connection {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: InboundStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("outbound_closed", &self.outbound.is_closed())
            .finish_non_exhaustive()
    }
}

/// Opens connections to the model
pub trait Transport: Send + Sync {
    /// Connect and complete the handshake
    ///
    /// Errors are reported as `SteerError::Connect`.
    fn connect(&self) -> BoxFuture<'static, Result<Connection>>;
}

/// The far end of an in-memory connection
pub struct ConnectionPeer {
    /// Messages the session sent
    pub outbound: mpsc::Receiver<ClientMessage>,
    /// Feed messages, or an error, to the session
    pub inbound: mpsc::Sender<std::result::Result<ServerMessage, TransportError>>,
}

impl ConnectionPeer {
    /// Deliver a message; `false` once the session side is gone
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.inbound.send(Ok(message)).await.is_ok()
    }

    /// Break the connection with an error
    pub async fn fail(&self, error: TransportError) {
        let _ = self.inbound.send(Err(error)).await;
    }
}

/// A connected pair of channels standing in for a network connection
///
/// Dropping the peer's `inbound` sender ends the session's inbound stream.
pub fn in_memory(capacity: usize) -> (Connection, ConnectionPeer) {
    let capacity = capacity.max(1);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (inbound_tx, mut inbound_rx) = mpsc::channel(capacity);

    let inbound = async_stream::stream! {
        while let Some(item) = inbound_rx.recv().await {
            yield item;
        }
    }
    .boxed();

    (
        Connection {
            outbound: outbound_tx,
            inbound,
        },
        ConnectionPeer {
            outbound: outbound_rx,
            inbound: inbound_tx,
        },
    )
}

/// Transport whose connections are handed to the caller
///
/// Every successful `connect` creates an in-memory pair and delivers the peer
/// end on the receiver returned by `new`, so a host can bridge its own
/// network stack into a session.
pub struct ChannelTransport {
    peers: mpsc::UnboundedSender<ConnectionPeer>,
    capacity: usize,
    refusals: Mutex<u32>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<ConnectionPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                capacity,
                refusals: Mutex::new(0),
            },
            peers_rx,
        )
    }

    /// Refuse the next `count` connect attempts
    pub fn refuse_next(&self, count: u32) {
        *self.refusals.lock() = count;
    }
}

impl Transport for ChannelTransport {
    fn connect(&self) -> BoxFuture<'static, Result<Connection>> {
        let refused = {
            let mut refusals = self.refusals.lock();
            let refused = *refusals > 0;
            *refusals = refusals.saturating_sub(1);
            refused
        };

        let result = if refused {
            Err(SteerError::Connect("connection refused".into()))
        } else {
            let (connection, peer) = in_memory(self.capacity);
            self.peers
                .send(peer)
                .map(|_| connection)
                .map_err(|_| SteerError::Connect("nobody is accepting connections".into()))
        };
        Box::pin(async move { result })
    }
}
