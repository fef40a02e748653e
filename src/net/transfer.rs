use std::{
    collections::{HashMap, HashSet},
    io,
    os::fd::RawFd,
    sync::{Arc, mpsc::SyncSender},
    thread,
};

use log::{debug, info, trace, warn};
use mio::{Events, Interest, Poll, Token, unix::SourceFd};

use super::{
    Connection, ConnectionId, ConnectionTable, Inbound, InboundPacket, SocketError, StopSignal,
    TransportConfig, connection::Snapshot,
};

/// Moves bytes between client sockets and the queues on either side.
///
/// Each iteration snapshots the table, polls without holding any lock, then
/// reads, writes and reaps closed connections. It never runs callbacks:
/// bytes and disconnects both go to the process loop.
pub(crate) struct TransferLoop {
    poll: Poll,
    connections: Arc<ConnectionTable>,
    inbound: SyncSender<Inbound>,
    config: TransportConfig,
    stop: StopSignal,
    registered: HashMap<ConnectionId, RawFd>,
}

impl TransferLoop {
    pub fn new(
        connections: Arc<ConnectionTable>,
        inbound: SyncSender<Inbound>,
        config: TransportConfig,
        stop: StopSignal,
    ) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            connections,
            inbound,
            config,
            stop,
            registered: HashMap::new(),
        })
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        let mut buf = vec![0u8; self.config.read_buffer_size];

        while !self.stop.is_stopped() {
            let snapshot = self.connections.snapshot();
            self.sync_interest(&snapshot);

            if snapshot.is_empty() {
                self.reap();
                thread::sleep(self.config.idle_delay);
                continue;
            }

            if let Err(e) = self.poll.poll(&mut events, Some(self.config.poll_timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!("[transfer] poll error: {e}");
                    thread::sleep(self.config.accept_error_backoff);
                }
                continue;
            }

            let by_id: HashMap<ConnectionId, &Snapshot> = snapshot
                .iter()
                .map(|snap| (snap.connection.id(), snap))
                .collect();

            for event in events.iter() {
                let id = event.token().0 as ConnectionId;
                let Some(snap) = by_id.get(&id) else {
                    continue;
                };
                let connection = &snap.connection;
                trace!(
                    "[transfer] client {id} readable={} writable={}",
                    event.is_readable(),
                    event.is_writable()
                );

                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    self.read(connection, &mut buf);
                }
                if event.is_writable() && connection.socket().is_open() {
                    self.write(connection);
                }
            }

            self.reap();
        }

        info!("[transfer] loop exit");
    }

    /// Brings the poller's registrations in line with the snapshot: write
    /// interest only where the outbound queue is non-empty.
    fn sync_interest(&mut self, snapshot: &[Snapshot]) {
        let live: HashSet<ConnectionId> = snapshot.iter().map(|s| s.connection.id()).collect();
        let stale: Vec<ConnectionId> = self
            .registered
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in stale {
            self.deregister(id);
        }

        for snap in snapshot {
            let id = snap.connection.id();
            let token = Token(id as usize);
            let interest = if snap.wants_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            let known = self.registered.get(&id).copied();
            let registry = self.poll.registry();
            let result = match known {
                Some(fd) if fd == snap.fd => registry
                    .reregister(&mut SourceFd(&snap.fd), token, interest)
                    .or_else(|e| match e.kind() {
                        // Dropped from the poller when another client reused the descriptor.
                        io::ErrorKind::NotFound => {
                            registry.register(&mut SourceFd(&snap.fd), token, interest)
                        }
                        _ => Err(e),
                    }),
                _ => registry
                    .register(&mut SourceFd(&snap.fd), token, interest)
                    .map(|_| {
                        self.registered.insert(id, snap.fd);
                    }),
            };

            if let Err(e) = result {
                // The socket may have been closed since the snapshot.
                debug!("[transfer] could not poll client {id}: {e}");
            }
        }
    }

    fn deregister(&mut self, id: ConnectionId) {
        let Some(fd) = self.registered.remove(&id) else {
            return;
        };
        // A closed descriptor number can already belong to a newer client.
        if self.registered.values().any(|&other| other == fd) {
            return;
        }
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
    }

    fn read(&mut self, connection: &Arc<Connection>, buf: &mut [u8]) {
        match connection.socket().recv(buf) {
            Ok(n) => {
                trace!("[transfer] client {} read {n} bytes", connection.id());
                let packet = InboundPacket {
                    connection_id: connection.id(),
                    data: buf[..n].to_vec(),
                };
                if self.inbound.send(Inbound::Data(packet)).is_err() {
                    debug!("[transfer] process loop is gone, dropping inbound bytes");
                }
            }
            Err(SocketError::WouldBlock) => {}
            Err(e) => self.teardown(connection, e),
        }
    }

    /// Sends the front chunk; a partial send keeps the unsent tail at the front.
    fn write(&mut self, connection: &Arc<Connection>) {
        let result = connection.with_outbound(|queue| {
            let Some(front) = queue.front_mut() else {
                return Ok(());
            };
            match connection.socket().send(front) {
                Ok(n) if n >= front.len() => {
                    queue.pop_front();
                    Ok(())
                }
                Ok(n) => {
                    front.drain(..n);
                    Ok(())
                }
                Err(SocketError::WouldBlock) => Ok(()),
                Err(e) => Err(e),
            }
        });

        if let Err(e) = result {
            self.teardown(connection, e);
        }
    }

    /// Closes a failed connection. The notification is emitted when it is reaped.
    fn teardown(&mut self, connection: &Arc<Connection>, reason: SocketError) {
        debug!("[transfer] closing client {}: {reason}", connection.id());
        self.deregister(connection.id());
        connection.close();
    }

    /// Drops closed connections from the table and queues one disconnect
    /// event for each, behind any bytes already read from it.
    fn reap(&mut self) {
        for connection in self.connections.remove_closed() {
            let id = connection.id();
            self.deregister(id);
            if !connection.claim_notification() {
                continue;
            }

            debug!("[transfer] reaped client {id} ({})", connection.peer());
            if self.inbound.send(Inbound::Disconnected(id)).is_err() {
                debug!("[transfer] process loop is gone, dropping disconnect of client {id}");
            }
        }
    }
}
