use std::{any::Any, collections::HashMap, net::SocketAddr, sync::Arc};

use bincode::{Decode, Encode};
use bytes::BytesMut;
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use super::{
    CodecError, DeserializerRegistry, Frame, FrameError, HandlerError, HandlerRegistry, MessageId,
    SerializerRegistry, codec, encode_frame,
};
use crate::net::{
    ConnectionId, ConnectionTable, DisconnectCallback, InboundPacket, ServerError, TcpServer,
    TransportConfig,
};

/// Reasons a connection's byte stream is abandoned.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("failed to deserialize {id}: {source}")]
    Deserialize { id: MessageId, source: CodecError },

    #[error("handler for {id} failed: {source}")]
    Handler { id: MessageId, source: HandlerError },
}

/// Cloneable handle for queuing framed messages, usable from inside handlers.
#[derive(Clone)]
pub struct Sender {
    connections: Arc<ConnectionTable>,
    serializers: Arc<SerializerRegistry>,
}

impl Sender {
    /// Serializes `value` with the serializer registered under `id` and queues
    /// the frame. Returns `false` without queuing anything if there is no
    /// serializer, serialization fails, the frame is too large or the
    /// connection is gone.
    pub fn send<T: Any>(&self, connection: ConnectionId, id: MessageId, value: &T) -> bool {
        let Some(serialize) = self.serializers.get(id) else {
            debug!("no serializer registered for {id}");
            return false;
        };

        match serialize(value) {
            Ok(payload) => self.send_raw(connection, id, &payload),
            Err(e) => {
                warn!("failed to serialize {id} for client {connection}: {e}");
                false
            }
        }
    }

    /// Like [`send`](Self::send), with the key looked up from `T`.
    pub fn send_value<T: Any>(&self, connection: ConnectionId, value: &T) -> bool {
        match self.serializers.key_for::<T>() {
            Some(id) => self.send(connection, id, value),
            None => {
                debug!("no serializer registered for {}", std::any::type_name::<T>());
                false
            }
        }
    }

    /// Frames an already serialized payload and queues it.
    pub fn send_raw(&self, connection: ConnectionId, id: MessageId, payload: &[u8]) -> bool {
        match encode_frame(id, payload) {
            Ok(frame) => self.connections.enqueue(connection, frame.to_vec()),
            Err(e) => {
                warn!("refusing to send {id} to client {connection}: {e}");
                false
            }
        }
    }

    /// Closes the connection; the disconnect notification follows on the
    /// process loop once the connection is reaped.
    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        self.connections
            .get(connection)
            .map(|c| c.close())
            .unwrap_or(false)
    }

    pub fn is_connected(&self, connection: ConnectionId) -> bool {
        self.connections.is_open(connection)
    }
}

/// Per-connection accumulation, frame extraction and handler dispatch.
struct Dispatcher {
    connections: Arc<ConnectionTable>,
    deserializers: DeserializerRegistry,
    handlers: HandlerRegistry,
    accumulators: Mutex<HashMap<ConnectionId, BytesMut>>,
    on_disconnect: RwLock<Option<DisconnectCallback>>,
}

impl Dispatcher {
    fn new(connections: Arc<ConnectionTable>) -> Self {
        Self {
            connections,
            deserializers: DeserializerRegistry::new(),
            handlers: HandlerRegistry::new(),
            accumulators: Mutex::new(HashMap::new()),
            on_disconnect: RwLock::new(None),
        }
    }

    /// Appends the packet to its connection's accumulator and dispatches
    /// every complete frame. A violation discards the accumulator and closes
    /// the connection.
    fn on_packet(&self, packet: InboundPacket) {
        let id = packet.connection_id;

        let violation = {
            let mut accumulators = self.accumulators.lock();
            if !self.connections.is_open(id) {
                trace!("dropping {} bytes for closed client {id}", packet.data.len());
                return;
            }

            let buf = accumulators.entry(id).or_default();
            buf.extend_from_slice(&packet.data);

            match self.parse(id, buf) {
                Ok(_) => None,
                Err(violation) => {
                    accumulators.remove(&id);
                    Some(violation)
                }
            }
        };

        if let Some(violation) = violation {
            warn!("protocol error from client {id}: {violation}. disconnecting");
            if let Some(connection) = self.connections.get(id) {
                connection.close();
            }
        }
    }

    /// Dispatches frames until the buffer holds no complete frame. Returns how
    /// many frames were consumed.
    fn parse(
        &self,
        connection: ConnectionId,
        buf: &mut BytesMut,
    ) -> Result<usize, ProtocolViolation> {
        let mut consumed = 0;
        while let Some(frame) = Frame::decode(buf)? {
            self.dispatch(connection, frame)?;
            consumed += 1;
        }
        Ok(consumed)
    }

    fn dispatch(&self, connection: ConnectionId, frame: Frame) -> Result<(), ProtocolViolation> {
        let id = frame.id;
        let Some(deserialize) = self.deserializers.get(id) else {
            warn!("unknown message type {id} from client {connection}");
            return Ok(());
        };

        let value = deserialize(&frame.payload)
            .map_err(|source| ProtocolViolation::Deserialize { id, source })?;

        match self.handlers.get(id) {
            Some(handler) => handler(connection, value)
                .map_err(|source| ProtocolViolation::Handler { id, source }),
            None => {
                debug!("no handler for {id} from client {connection}");
                Ok(())
            }
        }
    }

    fn on_disconnect(&self, connection: ConnectionId) {
        self.accumulators.lock().remove(&connection);

        let callback = self.on_disconnect.read().clone();
        if let Some(on_disconnect) = callback {
            on_disconnect(connection);
        }
    }

    fn clear(&self) {
        self.accumulators.lock().clear();
    }
}

/// Framed, typed message server on top of [`TcpServer`].
///
/// Register serializers, deserializers and handlers, then [`start`](Self::start).
/// Handlers run on the transport's process loop; to reply from one, capture a
/// [`Sender`] from [`sender`](Self::sender).
pub struct ProtocolServer {
    transport: TcpServer,
    dispatcher: Arc<Dispatcher>,
    sender: Sender,
}

impl ProtocolServer {
    pub fn new(config: TransportConfig) -> Self {
        let mut transport = TcpServer::new(config);
        let connections = transport.connections();
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&connections)));

        let receiver = Arc::clone(&dispatcher);
        transport.set_receive_callback(move |packet| receiver.on_packet(packet));
        let receiver = Arc::clone(&dispatcher);
        transport.set_disconnect_callback(move |id| receiver.on_disconnect(id));

        let sender = Sender {
            connections,
            serializers: Arc::new(SerializerRegistry::new()),
        };

        Self {
            transport,
            dispatcher,
            sender,
        }
    }

    pub fn start(&mut self) -> Result<(), ServerError> {
        self.transport.start()
    }

    /// Stops the transport and forgets every partially received message.
    pub fn stop(&mut self) {
        self.transport.stop();
        self.dispatcher.clear();
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_running()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.transport.connection_count()
    }

    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub fn send<T: Any>(&self, connection: ConnectionId, id: MessageId, value: &T) -> bool {
        self.sender.send(connection, id, value)
    }

    pub fn send_value<T: Any>(&self, connection: ConnectionId, value: &T) -> bool {
        self.sender.send_value(connection, value)
    }

    pub fn send_raw(&self, connection: ConnectionId, id: MessageId, payload: &[u8]) -> bool {
        self.sender.send_raw(connection, id, payload)
    }

    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        self.sender.disconnect(connection)
    }

    pub fn register_serializer<T, F>(&self, id: impl Into<MessageId>, serializer: F)
    where
        T: Any,
        F: Fn(&T) -> Result<Vec<u8>, CodecError> + Send + Sync + 'static,
    {
        self.sender.serializers.register(id.into(), serializer);
    }

    pub fn register_deserializer<T, F>(&self, id: impl Into<MessageId>, deserializer: F)
    where
        T: Any + Send,
        F: Fn(&[u8]) -> Result<T, CodecError> + Send + Sync + 'static,
    {
        self.dispatcher.deserializers.register(id.into(), deserializer);
    }

    pub fn register_handler<T, F>(&self, id: impl Into<MessageId>, handler: F)
    where
        T: Any + Send,
        F: Fn(ConnectionId, T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.dispatcher.handlers.register(id.into(), handler);
    }

    /// Registers a bincode serializer and deserializer for `T` under `id`.
    pub fn register_message<T>(&self, id: impl Into<MessageId>)
    where
        T: Encode + Decode<()> + Any + Send,
    {
        let id = id.into();
        self.register_serializer(id, |value: &T| codec::encode(value));
        self.register_deserializer(id, |payload: &[u8]| codec::decode::<T>(payload));
    }

    /// Must be set before [`start`](Self::start).
    pub fn set_connect_callback<F>(&mut self, f: F)
    where
        F: Fn(ConnectionId, SocketAddr) + Send + Sync + 'static,
    {
        self.transport.set_connect_callback(f);
    }

    /// Fired once per connection, after its buffered bytes are discarded.
    pub fn set_disconnect_callback<F>(&self, f: F)
    where
        F: Fn(ConnectionId) + Send + Sync + 'static,
    {
        *self.dispatcher.on_disconnect.write() = Some(Arc::new(f));
    }

    /// Must be set before [`start`](Self::start).
    pub fn set_server_address_callback<F>(&mut self, f: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.transport.set_server_address_callback(f);
    }
}

impl Drop for ProtocolServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr, TcpStream},
        thread,
        time::{Duration, Instant},
    };

    use proptest::prelude::*;

    use super::*;
    use crate::{
        net::Socket,
        protocol::{FramedStream, MAX_MESSAGE_SIZE, Ping, Pong, message},
    };

    const ECHO: MessageId = MessageId::new(1, 0);
    const FAILING: MessageId = MessageId::new(2, 0);
    const REJECTING: MessageId = MessageId::new(3, 0);

    type Calls = Arc<Mutex<Vec<(ConnectionId, Vec<u8>)>>>;

    /// Dispatcher wired to one open (unconnected) socket, with a raw-bytes
    /// handler on `ECHO`, a failing deserializer on `FAILING` and a failing
    /// handler on `REJECTING`.
    fn dispatcher() -> (Arc<Dispatcher>, ConnectionId, Calls) {
        let table = Arc::new(ConnectionTable::new());
        let socket = Socket::new();
        socket.create(true, true).unwrap();
        let connection = table.insert(socket, SocketAddr::from((Ipv4Addr::LOCALHOST, 1)));

        let dispatcher = Arc::new(Dispatcher::new(table));
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));

        dispatcher
            .deserializers
            .register(ECHO, |payload: &[u8]| Ok(payload.to_vec()));
        let sink = Arc::clone(&calls);
        dispatcher.handlers.register(ECHO, move |id, value: Vec<u8>| {
            sink.lock().push((id, value));
            Ok(())
        });

        dispatcher
            .deserializers
            .register(FAILING, |_: &[u8]| -> Result<(), CodecError> {
                Err(CodecError::Malformed("always".to_string()))
            });

        dispatcher
            .deserializers
            .register(REJECTING, |_: &[u8]| Ok(()));
        dispatcher
            .handlers
            .register(REJECTING, |_, _: ()| Err(HandlerError::new("rejected")));

        (dispatcher, connection.id(), calls)
    }

    fn packet(connection_id: ConnectionId, data: &[u8]) -> InboundPacket {
        InboundPacket {
            connection_id,
            data: data.to_vec(),
        }
    }

    fn frame(id: MessageId, payload: &[u8]) -> Vec<u8> {
        encode_frame(id, payload).unwrap().to_vec()
    }

    #[test]
    fn dispatches_single_frame() {
        let (dispatcher, id, calls) = dispatcher();

        dispatcher.on_packet(packet(id, &[0, 0, 0, 6, 0, 1, 0, 0, b'A', b'B']));

        assert_eq!(*calls.lock(), vec![(id, b"AB".to_vec())]);
        assert!(dispatcher.accumulators.lock()[&id].is_empty());
    }

    #[test]
    fn dispatches_pipelined_frames_in_order() {
        let (dispatcher, id, calls) = dispatcher();
        let mut bytes = frame(ECHO, b"first");
        bytes.extend(frame(ECHO, b"second"));

        dispatcher.on_packet(packet(id, &bytes));

        let payloads: Vec<Vec<u8>> = calls.lock().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn keeps_partial_tail() {
        let (dispatcher, id, calls) = dispatcher();
        let mut bytes = frame(ECHO, b"whole");
        let next = frame(ECHO, b"split");
        bytes.extend(&next[..3]);

        dispatcher.on_packet(packet(id, &bytes));
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(dispatcher.accumulators.lock()[&id].len(), 3);

        dispatcher.on_packet(packet(id, &next[3..]));
        assert_eq!(calls.lock().len(), 2);
        assert_eq!(calls.lock()[1].1, b"split".to_vec());
    }

    #[test]
    fn unknown_type_is_skipped() {
        let (dispatcher, id, calls) = dispatcher();
        let mut bytes = frame(MessageId::new(99, 0), b"ignored");
        bytes.extend(frame(MessageId::new(1, 7), b"wrong version"));
        bytes.extend(frame(ECHO, b"kept"));

        dispatcher.on_packet(packet(id, &bytes));

        assert_eq!(*calls.lock(), vec![(id, b"kept".to_vec())]);
        assert!(dispatcher.connections.is_open(id));
    }

    #[test]
    fn invalid_length_disconnects() {
        for length in [0u32, MAX_MESSAGE_SIZE + 1] {
            let (dispatcher, id, calls) = dispatcher();
            let mut bytes = length.to_be_bytes().to_vec();
            bytes.extend(frame(ECHO, b"never seen"));

            dispatcher.on_packet(packet(id, &bytes));

            assert!(calls.lock().is_empty());
            assert!(!dispatcher.connections.is_open(id));
            assert!(!dispatcher.accumulators.lock().contains_key(&id));

            // Bytes arriving after the violation are dropped.
            dispatcher.on_packet(packet(id, &frame(ECHO, b"late")));
            assert!(calls.lock().is_empty());
            assert!(!dispatcher.accumulators.lock().contains_key(&id));
        }
    }

    #[test]
    fn failing_deserializer_disconnects() {
        let (dispatcher, id, calls) = dispatcher();
        let mut bytes = frame(FAILING, b"bad");
        bytes.extend(frame(ECHO, b"after"));

        dispatcher.on_packet(packet(id, &bytes));

        assert!(calls.lock().is_empty());
        assert!(!dispatcher.connections.is_open(id));
    }

    #[test]
    fn failing_handler_disconnects() {
        let (dispatcher, id, calls) = dispatcher();
        let mut bytes = frame(ECHO, b"before");
        bytes.extend(frame(REJECTING, &[]));
        bytes.extend(frame(ECHO, b"after"));

        dispatcher.on_packet(packet(id, &bytes));

        assert_eq!(*calls.lock(), vec![(id, b"before".to_vec())]);
        assert!(!dispatcher.connections.is_open(id));
    }

    #[test]
    fn disconnect_discards_accumulator_and_notifies() {
        let (dispatcher, id, _) = dispatcher();
        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notified);
        *dispatcher.on_disconnect.write() = Some(Arc::new(move |id| sink.lock().push(id)));

        dispatcher.on_packet(packet(id, &frame(ECHO, b"partial")[..5]));
        assert!(dispatcher.accumulators.lock().contains_key(&id));

        dispatcher.on_disconnect(id);
        assert!(!dispatcher.accumulators.lock().contains_key(&id));
        assert_eq!(*notified.lock(), vec![id]);
    }

    #[test]
    fn send_without_serializer_queues_nothing() {
        let server = ProtocolServer::new(TransportConfig::new(0));
        let table = server.transport.connections();
        let socket = Socket::new();
        socket.create(true, true).unwrap();
        let connection = table.insert(socket, SocketAddr::from((Ipv4Addr::LOCALHOST, 1)));

        assert!(!server.send(connection.id(), MessageId::new(42, 0), &1u32));
        assert!(!server.send_value(connection.id(), &1u32));
        assert_eq!(connection.queued_chunks(), 0);
        assert!(connection.socket().is_open());
    }

    #[test]
    fn send_queues_frame() {
        let server = ProtocolServer::new(TransportConfig::new(0));
        server.register_message::<Ping>(message::PING);
        let table = server.transport.connections();
        let socket = Socket::new();
        socket.create(true, true).unwrap();
        let connection = table.insert(socket, SocketAddr::from((Ipv4Addr::LOCALHOST, 1)));

        assert!(server.send_value(connection.id(), &Ping { value: 9 }));
        assert!(!server.send_value(connection.id() + 1, &Ping { value: 9 }));

        connection.with_outbound(|queue| {
            assert_eq!(queue.len(), 1);
            assert_eq!(
                queue[0],
                vec![0, 0, 0, 8, 0, 1, 0, 0, 0, 0, 0, 9]
            );
        });
    }

    #[test]
    fn send_rejects_oversized_payload() {
        let server = ProtocolServer::new(TransportConfig::new(0));
        let table = server.transport.connections();
        let socket = Socket::new();
        socket.create(true, true).unwrap();
        let connection = table.insert(socket, SocketAddr::from((Ipv4Addr::LOCALHOST, 1)));

        let payload = vec![0u8; MAX_MESSAGE_SIZE as usize];
        assert!(!server.send_raw(connection.id(), ECHO, &payload));
        assert_eq!(connection.queued_chunks(), 0);
    }

    fn round_trip<T: Any + PartialEq + std::fmt::Debug>(
        server: &ProtocolServer,
        id: MessageId,
        value: T,
    ) {
        let serialize = server.sender.serializers.get(id).unwrap();
        let deserialize = server.dispatcher.deserializers.get(id).unwrap();

        let decoded = deserialize(&serialize(&value).unwrap()).unwrap();
        assert_eq!(*decoded.downcast::<T>().unwrap(), value);
    }

    #[test]
    fn registered_messages_round_trip() {
        let server = ProtocolServer::new(TransportConfig::new(0));
        message::install_ping_pong(&server);

        round_trip(&server, message::PING, Ping { value: 0 });
        round_trip(&server, message::PING, Ping { value: u32::MAX });
        round_trip(&server, message::PONG, Pong { value: 0xdead_beef });
    }

    proptest! {
        #[test]
        fn frame_split_anywhere_decodes_once(
            payload in prop::collection::vec(any::<u8>(), 0..256),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let (dispatcher, id, calls) = dispatcher();
            let bytes = frame(ECHO, &payload);

            let mut bounds: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len())).collect();
            bounds.push(0);
            bounds.push(bytes.len());
            bounds.sort_unstable();
            bounds.dedup();

            for window in bounds.windows(2) {
                dispatcher.on_packet(packet(id, &bytes[window[0]..window[1]]));
            }

            prop_assert_eq!(calls.lock().clone(), vec![(id, payload)]);
            prop_assert!(dispatcher.connections.is_open(id));
        }

        #[test]
        fn pipelined_frames_dispatch_in_order(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..16),
        ) {
            let (dispatcher, id, calls) = dispatcher();
            let bytes: Vec<u8> = payloads.iter().flat_map(|p| frame(ECHO, p)).collect();

            dispatcher.on_packet(packet(id, &bytes));

            let received: Vec<Vec<u8>> = calls.lock().iter().map(|(_, p)| p.clone()).collect();
            prop_assert_eq!(received, payloads);
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn running_server() -> ProtocolServer {
        let mut server = ProtocolServer::new(
            TransportConfig::new(0)
                .with_address(Ipv4Addr::LOCALHOST)
                .with_poll_timeout(Duration::from_millis(20)),
        );
        message::install_ping_pong(&server);
        server.start().unwrap();
        server
    }

    fn connect(server: &ProtocolServer) -> FramedStream<TcpStream> {
        let stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        FramedStream::new(stream)
    }

    #[test]
    fn ping_pong_over_tcp() {
        let server = running_server();
        let mut client = connect(&server);

        client.write_message(message::PING, &Ping { value: 41 }).unwrap();
        let (id, pong): (MessageId, Pong) = client.read_message().unwrap();

        assert_eq!(id, message::PONG);
        assert_eq!(pong, Pong { value: 41 });
    }

    #[test]
    fn back_to_back_frames_in_one_write() {
        let server = running_server();
        let mut client = connect(&server);

        let mut bytes = frame(message::PING, &codec::encode(&Ping { value: 1 }).unwrap());
        bytes.extend(frame(message::PING, &codec::encode(&Ping { value: 2 }).unwrap()));
        client.write_raw(&bytes).unwrap();

        let (_, first): (MessageId, Pong) = client.read_message().unwrap();
        let (_, second): (MessageId, Pong) = client.read_message().unwrap();
        assert_eq!((first.value, second.value), (1, 2));
    }

    #[test]
    fn protocol_error_fires_disconnect_once() {
        let mut server = ProtocolServer::new(
            TransportConfig::new(0)
                .with_address(Ipv4Addr::LOCALHOST)
                .with_poll_timeout(Duration::from_millis(20)),
        );
        let disconnected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&disconnected);
        server.set_disconnect_callback(move |id| sink.lock().push(id));
        server.start().unwrap();

        let mut client = connect(&server);
        client.write_raw(&[0, 0, 0, 0]).unwrap();

        assert!(wait_until(|| disconnected.lock().len() == 1));
        assert!(client.read_frame().is_err());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(disconnected.lock().len(), 1);
        assert!(wait_until(|| server.connection_count() == 0));
    }

    #[test]
    fn parallel_sends_to_distinct_connections() {
        let server = running_server();
        let sender = server.sender();
        server.register_message::<Pong>(message::PONG);

        let mut clients = Vec::new();
        for _ in 0..4 {
            clients.push(connect(&server));
        }
        assert!(wait_until(|| server.connection_count() == 4));
        let ids: Vec<ConnectionId> = server
            .transport
            .connections()
            .snapshot()
            .iter()
            .map(|s| s.connection.id())
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let sender = sender.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        assert!(sender.send_value(id, &Pong { value: id as u32 }));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = Vec::new();
        for client in clients.iter_mut() {
            let mut values = Vec::new();
            for _ in 0..50 {
                let (_, pong): (MessageId, Pong) = client.read_message().unwrap();
                values.push(pong.value);
            }
            values.dedup();
            assert_eq!(values.len(), 1);
            seen.push(values[0]);
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn slow_handler_does_not_stall_other_connections() {
        const SLOW: MessageId = MessageId::new(7, 0);

        let mut server = ProtocolServer::new(
            TransportConfig::new(0)
                .with_address(Ipv4Addr::LOCALHOST)
                .with_poll_timeout(Duration::from_millis(20)),
        );
        let connected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&connected);
        server.set_connect_callback(move |id, _| sink.lock().push(id));
        let disconnected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&disconnected);
        server.set_disconnect_callback(move |id| sink.lock().push(id));
        server.register_deserializer(SLOW, |_: &[u8]| Ok(()));
        server.register_handler(SLOW, |_, _: ()| {
            thread::sleep(Duration::from_millis(1500));
            Ok(())
        });
        server.start().unwrap();

        let mut busy = connect(&server);
        let leaving = connect(&server);
        let mut bystander = connect(&server);
        assert!(wait_until(|| connected.lock().len() == 3));
        let ids = connected.lock().clone();
        let sender = server.sender();

        busy.write_raw(&frame(SLOW, &[])).unwrap();
        thread::sleep(Duration::from_millis(100));
        drop(leaving);
        assert!(wait_until(|| !sender.is_connected(ids[1])));

        let started = Instant::now();
        assert!(sender.send_raw(ids[2], ECHO, b"hello"));
        let reply = bystander.read_frame().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(&reply.payload[..], b"hello");
        assert!(sender.is_connected(ids[2]));

        // Notified on the process loop once the handler returns.
        assert!(wait_until(|| *disconnected.lock() == vec![ids[1]]));
    }
}
