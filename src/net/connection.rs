use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    os::fd::RawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use super::Socket;

/// Identity of a client connection, unique for the lifetime of one server.
pub type ConnectionId = u64;

/// Bytes read from one connection, handed from the transfer loop to the
/// process loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub connection_id: ConnectionId,
    pub data: Vec<u8>,
}

/// What the transfer loop hands to the process loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(InboundPacket),
    /// The connection was reaped; nothing further arrives for it.
    Disconnected(ConnectionId),
}

/// A live client: its socket plus the chunks waiting to be written.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    socket: Socket,
    outbound: Mutex<VecDeque<Vec<u8>>>,
    notified: AtomicBool,
}

impl Connection {
    pub fn new(id: ConnectionId, socket: Socket, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            socket,
            outbound: Mutex::new(VecDeque::new()),
            notified: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn enqueue(&self, chunk: Vec<u8>) {
        self.outbound.lock().push_back(chunk);
    }

    pub fn wants_write(&self) -> bool {
        !self.outbound.lock().is_empty()
    }

    pub fn queued_chunks(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Runs `f` on the outbound queue while holding its lock.
    pub(crate) fn with_outbound<R>(&self, f: impl FnOnce(&mut VecDeque<Vec<u8>>) -> R) -> R {
        f(&mut self.outbound.lock())
    }

    /// Closes the socket. Returns `true` only for the call that actually
    /// closed it.
    pub fn close(&self) -> bool {
        self.socket.close().is_ok()
    }

    /// Claims the right to emit the disconnect notification. Only the first
    /// caller gets `true`.
    pub(crate) fn claim_notification(&self) -> bool {
        !self.notified.swap(true, Ordering::AcqRel)
    }
}

/// Per-iteration view of one connection used to build the poll set.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub connection: Arc<Connection>,
    pub fd: RawFd,
    pub wants_write: bool,
}

/// Every live connection, keyed by identity.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly accepted socket and returns its connection.
    pub fn insert(&self, socket: Socket, peer: SocketAddr) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(id, socket, peer));
        self.connections.lock().insert(id, Arc::clone(&connection));
        connection
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    /// `true` while `id` is in the table with an open socket.
    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.get(id)
            .map(|connection| connection.socket().is_open())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Copies out every open connection with its descriptor and write
    /// interest. The table lock is released before the caller polls.
    pub fn snapshot(&self) -> Vec<Snapshot> {
        let connections = self.connections.lock();
        connections
            .values()
            .filter_map(|connection| {
                let fd = connection.socket().raw_fd()?;
                Some(Snapshot {
                    connection: Arc::clone(connection),
                    fd,
                    wants_write: connection.wants_write(),
                })
            })
            .collect()
    }

    /// Removes every connection whose socket is no longer open.
    pub fn remove_closed(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.connections.lock();
        let closed: Vec<ConnectionId> = connections
            .iter()
            .filter(|(_, c)| !c.socket().is_open())
            .map(|(id, _)| *id)
            .collect();

        closed
            .into_iter()
            .filter_map(|id| connections.remove(&id))
            .collect()
    }

    /// Empties the table, returning what was in it.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().drain().map(|(_, c)| c).collect()
    }

    /// Queues `chunk` for `id`. Returns `false` if no such connection exists
    /// or its socket is already closed.
    pub fn enqueue(&self, id: ConnectionId, chunk: Vec<u8>) -> bool {
        let Some(connection) = self.get(id) else {
            return false;
        };
        if !connection.socket().is_open() {
            return false;
        }
        connection.enqueue(chunk);
        true
    }
}
