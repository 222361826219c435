//! Connection registry
//!
//! Maps every live connection to the sending half of its writer task. The
//! engine loop sends through it via [`Transmit`]; reader tasks register and
//! unregister connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;

use arbor_core::{ArborError, ArborResult, ConnectionId, ConnectionRole, Message};
use arbor_runtime::Transmit;

/// A message waiting in a writer queue, stamped with its send time
#[derive(Debug)]
pub struct Queued {
    pub sent_at: Instant,
    pub message: Message,
}

/// Writer queue receiver
pub type WriterReceiver = mpsc::UnboundedReceiver<Queued>;

#[derive(Clone, Debug)]
struct ConnectionEntry {
    addr: SocketAddr,
    role: Option<ConnectionRole>,
    lag: Duration,
    tx: mpsc::UnboundedSender<Queued>,
}

/// Information about a registered connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    /// `None` until the remote announced itself
    pub role: Option<ConnectionRole>,
    pub lag: Duration,
}

/// Shared table of live connections
#[derive(Clone, Debug, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Register a connection and return its id with the writer queue
    pub fn register(
        &self,
        addr: SocketAddr,
        role: Option<ConnectionRole>,
        lag: Duration,
    ) -> (ConnectionId, WriterReceiver) {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().insert(
            id,
            ConnectionEntry {
                addr,
                role,
                lag,
                tx,
            },
        );
        (id, rx)
    }

    /// Record the role a connection announced
    pub fn set_role(&self, id: ConnectionId, role: ConnectionRole) -> ArborResult<()> {
        let mut connections = self.connections.write();
        let entry = connections
            .get_mut(&id)
            .ok_or(ArborError::UnknownConnection(id))?;
        entry.role = Some(role);
        Ok(())
    }

    /// Remove a connection. Its writer task ends once the queue drains.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections
            .write()
            .remove(&id)
            .map(|entry| Self::info(id, &entry))
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections
            .read()
            .get(&id)
            .map(|entry| Self::info(id, entry))
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Queue a message on a connection's writer
    pub fn send(&self, id: ConnectionId, message: Message) -> ArborResult<()> {
        let connections = self.connections.read();
        let entry = connections
            .get(&id)
            .ok_or(ArborError::UnknownConnection(id))?;
        entry
            .tx
            .send(Queued {
                sent_at: Instant::now(),
                message,
            })
            .map_err(|_| ArborError::ConnectionClosed(id))
    }

    fn info(id: ConnectionId, entry: &ConnectionEntry) -> ConnectionInfo {
        ConnectionInfo {
            id,
            addr: entry.addr,
            role: entry.role,
            lag: entry.lag,
        }
    }
}

impl Transmit for ConnectionRegistry {
    fn transmit(&self, connection: ConnectionId, message: Message) -> ArborResult<()> {
        self.send(connection, message)
    }
}
