pub mod net;
pub mod protocol;

pub use net::{ConnectionId, TcpServer, TransportConfig};
pub use protocol::{MessageId, ProtocolServer, Sender};
