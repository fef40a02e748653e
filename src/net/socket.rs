//! Non-blocking TCP endpoint.
//!
//! A [`Socket`] owns at most one OS-level endpoint over its lifetime. It moves
//! through `Unopened -> Open -> Closed` and never reopens. Every operation
//! takes `&self`; the instance lock is held only around the underlying system
//! call so a connection can be read by one loop while another queues writes.
use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    os::fd::{AsRawFd, RawFd},
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Type};
use thiserror::Error;

/// Outcome of a socket operation that did not succeed.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("operation would block")]
    WouldBlock,

    #[error("connection closed by peer")]
    Closed,

    #[error("socket is not open")]
    NotOpen,

    #[error("socket was already opened")]
    AlreadyOpen,

    #[error("socket io error: {0}")]
    Io(#[from] io::Error),
}

pub type SocketResult<T> = Result<T, SocketError>;

#[derive(Debug)]
enum State {
    Unopened,
    Open(socket2::Socket),
    Closed,
}

#[derive(Debug)]
pub struct Socket {
    state: Mutex<State>,
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Unopened),
        }
    }

    fn from_raw(socket: socket2::Socket) -> Self {
        Self {
            state: Mutex::new(State::Open(socket)),
        }
    }

    /// Allocates the endpoint with address reuse enabled.
    ///
    /// On any failure the socket ends up closed and cannot be reused.
    pub fn create(&self, non_blocking: bool, no_delay: bool) -> SocketResult<()> {
        let mut state = self.state.lock();
        if !matches!(*state, State::Unopened) {
            return Err(SocketError::AlreadyOpen);
        }

        let configure = || -> io::Result<socket2::Socket> {
            let socket = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            if no_delay {
                socket.set_nodelay(true)?;
            }
            if non_blocking {
                socket.set_nonblocking(true)?;
            }
            Ok(socket)
        };

        match configure() {
            Ok(socket) => {
                *state = State::Open(socket);
                Ok(())
            }
            Err(e) => {
                *state = State::Closed;
                Err(e.into())
            }
        }
    }

    pub fn bind(&self, address: Ipv4Addr, port: u16) -> SocketResult<()> {
        let addr = SocketAddr::V4(SocketAddrV4::new(address, port));
        self.setup(|socket| socket.bind(&addr.into()))
    }

    pub fn listen(&self, backlog: i32) -> SocketResult<()> {
        self.setup(|socket| socket.listen(backlog))
    }

    /// Runs a setup step, closing the socket if it fails.
    fn setup<F>(&self, step: F) -> SocketResult<()>
    where
        F: FnOnce(&socket2::Socket) -> io::Result<()>,
    {
        let mut state = self.state.lock();
        let State::Open(socket) = &*state else {
            return Err(SocketError::NotOpen);
        };

        if let Err(e) = step(socket) {
            *state = State::Closed;
            return Err(e.into());
        }
        Ok(())
    }

    /// Accepts one pending connection, applying the non-blocking and no-delay
    /// settings passed here to the new socket.
    pub fn accept(&self, non_blocking: bool, no_delay: bool) -> SocketResult<(Socket, SocketAddr)> {
        let (socket, addr) = {
            let state = self.state.lock();
            let State::Open(listener) = &*state else {
                return Err(SocketError::NotOpen);
            };
            listener.accept().map_err(classify)?
        };

        if no_delay {
            socket.set_nodelay(true)?;
        }
        socket.set_nonblocking(non_blocking)?;

        let peer = addr
            .as_socket()
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        Ok((Socket::from_raw(socket), peer))
    }

    /// Sends as much of `data` as the kernel accepts, which may be a prefix.
    pub fn send(&self, data: &[u8]) -> SocketResult<usize> {
        let state = self.state.lock();
        let State::Open(socket) = &*state else {
            return Err(SocketError::NotOpen);
        };

        match (&*socket).write(data) {
            Ok(0) if !data.is_empty() => Err(SocketError::Closed),
            Ok(n) => Ok(n),
            Err(e) => Err(classify(e)),
        }
    }

    /// Receives into `buf`; a zero-length read means the peer ended the stream.
    pub fn recv(&self, buf: &mut [u8]) -> SocketResult<usize> {
        let state = self.state.lock();
        let State::Open(socket) = &*state else {
            return Err(SocketError::NotOpen);
        };

        match (&*socket).read(buf) {
            Ok(0) if !buf.is_empty() => Err(SocketError::Closed),
            Ok(n) => Ok(n),
            Err(e) => Err(classify(e)),
        }
    }

    /// Closes the endpoint. Closing twice reports [`SocketError::NotOpen`].
    pub fn close(&self) -> SocketResult<()> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Closed) {
            State::Open(socket) => {
                drop(socket);
                Ok(())
            }
            _ => Err(SocketError::NotOpen),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), State::Open(_))
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        match &*self.state.lock() {
            State::Open(socket) => Some(socket.as_raw_fd()),
            _ => None,
        }
    }

    pub fn local_addr(&self) -> SocketResult<SocketAddr> {
        let state = self.state.lock();
        let State::Open(socket) = &*state else {
            return Err(SocketError::NotOpen);
        };

        socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "not an inet address").into())
    }
}

fn classify(e: io::Error) -> SocketError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => SocketError::WouldBlock,
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => SocketError::Closed,
        _ => SocketError::Io(e),
    }
}
