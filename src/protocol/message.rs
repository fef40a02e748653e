use bincode::{Decode, Encode};
use log::debug;

use super::{HandlerError, MessageId, ProtocolServer};

pub const PING: MessageId = MessageId::new(1, 0);
pub const PONG: MessageId = MessageId::new(2, 0);

/// Liveness probe sent by a client.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub struct Ping {
    pub value: u32,
}

/// Reply to a [`Ping`], echoing its value.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub struct Pong {
    pub value: u32,
}

impl From<Ping> for Pong {
    fn from(ping: Ping) -> Self {
        Self { value: ping.value }
    }
}

/// Registers both message types and a handler answering every ping.
pub fn install_ping_pong(server: &ProtocolServer) {
    server.register_message::<Ping>(PING);
    server.register_message::<Pong>(PONG);

    let sender = server.sender();
    server.register_handler(PING, move |connection, ping: Ping| {
        debug!("ping {} from client {connection}", ping.value);
        if sender.send_value(connection, &Pong::from(ping)) {
            Ok(())
        } else {
            Err(HandlerError::new("failed to queue pong"))
        }
    });
}
