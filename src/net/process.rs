use std::{
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::Duration,
};

use log::{info, trace};

use super::{DisconnectCallback, Inbound, ReceiveCallback, StopSignal};

/// Hands inbound events to the application callbacks, off the polling thread.
pub(crate) struct ProcessLoop {
    inbound: Receiver<Inbound>,
    on_receive: Option<ReceiveCallback>,
    on_disconnect: Option<DisconnectCallback>,
    poll_timeout: Duration,
    stop: StopSignal,
}

impl ProcessLoop {
    pub fn new(
        inbound: Receiver<Inbound>,
        on_receive: Option<ReceiveCallback>,
        on_disconnect: Option<DisconnectCallback>,
        poll_timeout: Duration,
        stop: StopSignal,
    ) -> Self {
        Self {
            inbound,
            on_receive,
            on_disconnect,
            poll_timeout,
            stop,
        }
    }

    pub fn run(self) {
        while !self.stop.is_stopped() {
            match self.inbound.recv_timeout(self.poll_timeout) {
                Ok(event) => self.dispatch(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("[process] loop exit");
    }

    fn dispatch(&self, event: Inbound) {
        match event {
            Inbound::Data(packet) => {
                trace!(
                    "[process] client {} delivered {} bytes",
                    packet.connection_id,
                    packet.data.len()
                );
                if let Some(on_receive) = &self.on_receive {
                    on_receive(packet);
                }
            }
            Inbound::Disconnected(id) => {
                info!("client {id} disconnected");
                if let Some(on_disconnect) = &self.on_disconnect {
                    on_disconnect(id);
                }
            }
        }
    }
}
