use std::{io, sync::Arc, thread, time::Duration};

use log::{error, info, trace, warn};
use mio::{Events, Interest, Poll, Token, unix::SourceFd};

use super::{
    ConnectCallback, ConnectionTable, Socket, SocketError, SocketResult, StopSignal,
    TransportConfig,
};

pub(crate) const LISTENER: Token = Token(0);

/// Admits new clients from the listening socket into the connection table.
pub(crate) struct AcceptLoop {
    poll: Poll,
    listener: Arc<Socket>,
    connections: Arc<ConnectionTable>,
    on_connect: Option<ConnectCallback>,
    config: TransportConfig,
    stop: StopSignal,
}

impl AcceptLoop {
    /// Registers the listener with a fresh poller. Fails if the listener is
    /// not open.
    pub fn new(
        listener: Arc<Socket>,
        connections: Arc<ConnectionTable>,
        on_connect: Option<ConnectCallback>,
        config: TransportConfig,
        stop: StopSignal,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let fd = listener
            .raw_fd()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener is closed"))?;
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections,
            on_connect,
            config,
            stop,
        })
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(8);

        while !self.stop.is_stopped() {
            if let Err(e) = self.poll.poll(&mut events, Some(self.config.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("[accept] poll error: {e}");
                thread::sleep(self.config.accept_error_backoff);
                continue;
            }

            if events.is_empty() {
                continue;
            }

            self.on_ready();
        }

        info!("[accept] loop exit");
    }

    /// Handles one listener wakeup and returns how many clients it admitted.
    /// An accept error is logged and followed by a backoff; the loop keeps
    /// running.
    fn on_ready(&self) -> usize {
        let admitted = match self.accept_pending() {
            Ok(admitted) => admitted,
            Err(e) => {
                error!("[accept] accept failed: {e}");
                sleep(self.config.accept_error_backoff);
                0
            }
        };
        self.rearm();
        admitted
    }

    /// Drains the backlog until the listener reports nothing pending.
    fn accept_pending(&self) -> SocketResult<usize> {
        let mut accepted = 0usize;

        while !self.stop.is_stopped() {
            match self
                .listener
                .accept(self.config.non_blocking, self.config.no_delay)
            {
                Ok((socket, peer)) => {
                    let connection = self.connections.insert(socket, peer);
                    info!("[accept] client {} connected from {peer}", connection.id());
                    if let Some(on_connect) = &self.on_connect {
                        on_connect(connection.id(), peer);
                    }

                    accepted += 1;
                    if !self.config.non_blocking {
                        break;
                    }
                }
                Err(SocketError::WouldBlock) => {
                    if accepted == 0 {
                        trace!("[accept] spurious wakeup");
                        sleep(self.config.accept_retry_delay);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(accepted)
    }

    /// Readiness is edge-triggered; re-registering makes a listener that still
    /// has pending clients report again on the next poll.
    fn rearm(&self) {
        let Some(fd) = self.listener.raw_fd() else {
            return;
        };
        if let Err(e) =
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), LISTENER, Interest::READABLE)
        {
            warn!("[accept] failed to re-arm listener: {e}");
            sleep(self.config.accept_error_backoff);
        }
    }
}

fn sleep(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}
