use std::{
    io,
    net::SocketAddr,
    sync::{Arc, mpsc},
};

use log::{info, warn};
use thiserror::Error;

use super::{
    AddressCallback, ConnectCallback, ConnectionId, ConnectionTable, DisconnectCallback,
    InboundPacket, ReceiveCallback, Socket, SocketError, StopSignal, TransportConfig, Worker,
    accept::AcceptLoop, process::ProcessLoop, transfer::TransferLoop,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("listener setup failed: {0}")]
    Socket(#[from] SocketError),

    #[error("failed to start server loops: {0}")]
    Io(#[from] io::Error),
}

/// Polling TCP transport: one accept loop, one transfer loop and one process
/// loop, sharing a [`ConnectionTable`].
pub struct TcpServer {
    config: TransportConfig,
    connections: Arc<ConnectionTable>,
    listener: Option<Arc<Socket>>,
    local_addr: Option<SocketAddr>,
    stop: StopSignal,
    workers: Vec<Worker>,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_receive: Option<ReceiveCallback>,
    on_server_address: Option<AddressCallback>,
}

impl TcpServer {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            connections: Arc::new(ConnectionTable::new()),
            listener: None,
            local_addr: None,
            stop: StopSignal::new(),
            workers: Vec::new(),
            on_connect: None,
            on_disconnect: None,
            on_receive: None,
            on_server_address: None,
        }
    }

    /// Fired by the accept loop with the new identity and peer address.
    pub fn set_connect_callback<F>(&mut self, f: F)
    where
        F: Fn(ConnectionId, SocketAddr) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(f));
    }

    /// Fired once per connection on the process loop, after the last bytes
    /// read from it have been delivered.
    pub fn set_disconnect_callback<F>(&mut self, f: F)
    where
        F: Fn(ConnectionId) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(f));
    }

    /// Fired on the process loop for every chunk of bytes read.
    pub fn set_receive_callback<F>(&mut self, f: F)
    where
        F: Fn(InboundPacket) + Send + Sync + 'static,
    {
        self.on_receive = Some(Arc::new(f));
    }

    /// Fired once on start with the address the listener is bound to.
    pub fn set_server_address_callback<F>(&mut self, f: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.on_server_address = Some(Arc::new(f));
    }

    /// Binds, listens and spawns the three loops.
    ///
    /// Callbacks must be installed before calling this; later changes are not
    /// seen by running loops.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = Socket::new();
        listener.create(self.config.non_blocking, self.config.no_delay)?;
        listener.bind(self.config.address, self.config.port)?;
        listener.listen(self.config.backlog)?;
        let listener = Arc::new(listener);

        let stop = StopSignal::new();
        let (inbound_tx, inbound_rx) = mpsc::sync_channel(self.config.inbound_queue_capacity);

        let accept = AcceptLoop::new(
            Arc::clone(&listener),
            Arc::clone(&self.connections),
            self.on_connect.clone(),
            self.config.clone(),
            stop.clone(),
        )?;
        let transfer = TransferLoop::new(
            Arc::clone(&self.connections),
            inbound_tx,
            self.config.clone(),
            stop.clone(),
        )?;
        let process = ProcessLoop::new(
            inbound_rx,
            self.on_receive.clone(),
            self.on_disconnect.clone(),
            self.config.poll_timeout,
            stop.clone(),
        );

        let spawned = Worker::spawn("accept", move || accept.run()).and_then(|accept| {
            let mut workers = vec![accept];
            workers.push(Worker::spawn("transfer", move || transfer.run())?);
            workers.push(Worker::spawn("process", move || process.run())?);
            Ok(workers)
        });
        let workers = match spawned {
            Ok(workers) => workers,
            Err(e) => {
                // Threads that did start exit on their own once signalled.
                stop.stop();
                let _ = listener.close();
                return Err(e.into());
            }
        };

        self.local_addr = match listener.local_addr() {
            Ok(addr) => {
                info!("listening at {addr}");
                if let Some(on_server_address) = &self.on_server_address {
                    on_server_address(addr);
                }
                Some(addr)
            }
            Err(e) => {
                warn!("could not determine server address: {e}");
                None
            }
        };

        self.listener = Some(listener);
        self.stop = stop;
        self.workers = workers;
        Ok(())
    }

    /// Signals every loop, waits for them, then closes every socket.
    ///
    /// Returns after at most about one poll timeout.
    pub fn stop(&mut self) {
        if self.workers.is_empty() && self.listener.is_none() {
            return;
        }

        self.stop.stop();
        for worker in self.workers.drain(..) {
            worker.join();
        }

        if let Some(listener) = self.listener.take() {
            let _ = listener.close();
        }
        for connection in self.connections.drain() {
            connection.close();
        }
        self.local_addr = None;
        info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty() && !self.stop.is_stopped()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queues `data` for transmission. Fails if `id` is unknown or closing.
    pub fn send(&self, id: ConnectionId, data: Vec<u8>) -> bool {
        self.connections.enqueue(id, data)
    }

    /// Closes the connection; the transfer loop reaps it and the process loop
    /// fires the disconnect notification.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.connections
            .get(id)
            .map(|connection| connection.close())
            .unwrap_or(false)
    }

    pub(crate) fn connections(&self) -> Arc<ConnectionTable> {
        Arc::clone(&self.connections)
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
