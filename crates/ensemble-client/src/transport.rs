//! QUIC client transport.
//!
//! One connection per transport. Control frames are encoded on the calling
//! thread and go out through a queue drained by a writer task, so
//! [`Transport`] calls never wait on the network. Two
//! reader tasks feed incoming frames and datagrams into a [`RoomMirror`] and
//! queue the resulting events for [`Transport::poll_events`].

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use ensemble_core::{Lobby, RoomMirror, Transport, TransportEvent};
use ensemble_proto::{
    ClientFrame, Hello, LENGTH_PREFIX_SIZE, Message, PROTOCOL_VERSION, PlayerId, PlayerInfo,
    PropertyEntry, RoomInfo, ServerFrame, Transform, TransformDatagram, Value, decode_datagram,
    decode_payload, encode_datagram, encode_frame, payload_len,
};
use parking_lot::Mutex;
use quinn::{
    Connection, Endpoint, IdleTimeout, RecvStream, SendStream, TransportConfig,
    crypto::rustls::QuicClientConfig,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use crate::{config::ClientConfig, error::ClientError, verify::client_crypto};

/// Mirror plus the events it produced, locked together so events are queued
/// in the order the mirror applied them.
#[derive(Default)]
struct State {
    mirror: RoomMirror,
    events: Vec<TransportEvent>,
    link_up: bool,
}

/// [`Transport`] and [`Lobby`] over a QUIC connection to an Ensemble server.
pub struct QuicTransport {
    state: Arc<Mutex<State>>,
    outbound: UnboundedSender<Vec<u8>>,
    connection: Connection,
    endpoint: Endpoint,
    tasks: Vec<JoinHandle<()>>,
}

impl QuicTransport {
    /// Connects and sends the handshake.
    ///
    /// The player id arrives asynchronously; [`Lobby::local_player`] returns
    /// `None` until it does. Must be called inside a Tokio runtime.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let crypto = client_crypto(&config.cert_verification)?;
        let quic_crypto = QuicClientConfig::try_from(crypto)
            .map_err(|e| ClientError::Config { reason: e.to_string() })?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));

        let idle_timeout = IdleTimeout::try_from(config.idle_timeout)
            .map_err(|e| ClientError::Config { reason: format!("idle timeout: {e}") })?;
        let mut transport = TransportConfig::default();
        transport
            .max_idle_timeout(Some(idle_timeout))
            .keep_alive_interval(Some(config.keep_alive_interval))
            .datagram_receive_buffer_size(Some(config.datagram_receive_buffer_size));
        client_config.transport_config(Arc::new(transport));

        let bind_addr: SocketAddr = if config.server_addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(bind_addr)?;
        endpoint.set_default_client_config(client_config);

        let connecting = endpoint.connect(config.server_addr, &config.server_name)?;
        let connection = tokio::time::timeout(config.connect_timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout)??;
        tracing::info!(server = %config.server_addr, "connected");

        let (mut send, recv) = connection.open_bi().await?;
        let hello = ClientFrame::Hello(Hello {
            version: PROTOCOL_VERSION,
            player_name: config.player_name.clone(),
        });
        send.write_all(&encode_frame(&hello)?).await?;

        let state = Arc::new(Mutex::new(State { link_up: true, ..State::default() }));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(write_frames(send, outbound_rx)),
            tokio::spawn(read_frames(recv, Arc::clone(&state))),
            tokio::spawn(read_datagrams(connection.clone(), Arc::clone(&state))),
        ];

        Ok(Self { state, outbound, connection, endpoint, tasks })
    }

    /// Whether the QUIC connection is still up (in a room or not).
    pub fn is_link_up(&self) -> bool {
        self.state.lock().link_up
    }

    /// Joined room name.
    pub fn room(&self) -> Option<String> {
        self.state.lock().mirror.room().map(str::to_string)
    }

    /// Server address.
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Closes the connection. Queued frames that were not yet written are
    /// lost.
    pub fn close(&self) {
        self.connection.close(0u32.into(), b"client closed");
    }

    fn send(&self, frame: &ClientFrame) {
        if let Some(bytes) = encode(frame) {
            self.queue(bytes);
        }
    }

    fn queue(&self, bytes: Vec<u8>) {
        if self.outbound.send(bytes).is_err() {
            tracing::debug!("link closed, dropping frame");
        }
    }

    /// Applies `entries` locally and queues them as one frame, both under the
    /// state lock so concurrent writers reach the wire in mirror order.
    ///
    /// A batch too large for one frame is dropped before it touches the
    /// mirror.
    fn write(&self, entries: Vec<PropertyEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if !state.mirror.is_connected() {
            return;
        }
        let seq = state.mirror.next_write_seq();
        let Some(bytes) = encode(&ClientFrame::SetProperties { seq, entries: entries.clone() })
        else {
            return;
        };
        state.mirror.apply_local(seq, &entries);
        self.queue(bytes);
    }
}

impl Transport for QuicTransport {
    fn is_connected(&self) -> bool {
        self.state.lock().mirror.is_connected()
    }

    fn set_property(&self, key: &str, value: Option<Value>) {
        self.write(vec![(key.to_string(), value)]);
    }

    fn set_properties(&self, entries: Vec<(String, Option<Value>)>) {
        self.write(entries);
    }

    fn try_get_property(&self, key: &str) -> Option<Value> {
        self.state.lock().mirror.property(key).cloned()
    }

    fn clear_properties_starting_with(&self, prefix: &str) {
        let mut state = self.state.lock();
        if !state.mirror.is_connected() {
            return;
        }
        let seq = state.mirror.next_write_seq();
        let Some(bytes) = encode(&ClientFrame::ClearProperties { seq, prefix: prefix.to_string() })
        else {
            return;
        };
        state.mirror.clear_local(seq, prefix);
        self.queue(bytes);
    }

    fn send_message(&self, message: Message) {
        if self.is_connected() {
            self.send(&ClientFrame::SendMessage(message));
        }
    }

    fn send_transform_message(&self, target: &str, transform: Transform) {
        if !self.is_connected() {
            return;
        }
        let datagram = TransformDatagram { target: target.to_string(), transform };
        match encode_datagram(&datagram) {
            Ok(bytes) => {
                if let Err(e) = self.connection.send_datagram(bytes) {
                    tracing::trace!("transform dropped: {}", e);
                }
            },
            Err(e) => tracing::warn!(key = target, "failed to encode transform: {}", e),
        }
    }

    fn poll_events(&self) -> Vec<TransportEvent> {
        std::mem::take(&mut self.state.lock().events)
    }
}

impl Lobby for QuicTransport {
    fn create_and_join_room(&self, room: &str) {
        self.send(&ClientFrame::CreateAndJoinRoom { room: room.to_string() });
    }

    fn join_room(&self, room: &str) {
        self.send(&ClientFrame::JoinRoom { room: room.to_string() });
    }

    fn leave_room(&self) {
        self.send(&ClientFrame::LeaveRoom);
    }

    fn refresh_rooms(&self) {
        self.send(&ClientFrame::ListRooms);
    }

    fn rooms(&self) -> Vec<RoomInfo> {
        self.state.lock().mirror.rooms().to_vec()
    }

    fn players(&self) -> Vec<PlayerInfo> {
        self.state.lock().mirror.players().to_vec()
    }

    fn local_player(&self) -> Option<PlayerId> {
        self.state.lock().mirror.player_id()
    }

    fn set_local_player_property(&self, key: &str, value: Option<Value>) {
        self.send(&ClientFrame::SetPlayerProperty { key: key.to_string(), value });
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.close();
        self.endpoint.close(0u32.into(), b"client closed");
    }
}

fn encode(frame: &ClientFrame) -> Option<Vec<u8>> {
    match encode_frame(frame) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(seq = frame.write_seq(), "dropping request: {}", e);
            None
        },
    }
}

async fn write_frames(mut send: SendStream, mut outbound: UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = send.write_all(&bytes).await {
            tracing::debug!("control stream write failed: {}", e);
            return;
        }
    }
    if let Err(e) = send.finish() {
        tracing::trace!("control stream already closed: {}", e);
    }
}

async fn read_frames(mut recv: RecvStream, shared: Arc<Mutex<State>>) {
    match read_loop(&mut recv, &shared).await {
        Ok(()) => tracing::info!("server closed the control stream"),
        Err(e) => tracing::warn!("connection lost: {}", e),
    }

    let mut state = shared.lock();
    state.link_up = false;
    let events = state.mirror.connection_lost();
    state.events.extend(events);
}

async fn read_loop(recv: &mut RecvStream, shared: &Mutex<State>) -> Result<(), ClientError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    loop {
        match recv.read_exact(&mut prefix).await {
            Ok(()) => {},
            Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let len = payload_len(prefix)?;
        let mut payload = vec![0u8; len];
        recv.read_exact(&mut payload).await?;

        let frame: ServerFrame = match decode_payload(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("dropping undecodable frame: {}", e);
                continue;
            },
        };

        let mut state = shared.lock();
        let events = state.mirror.apply(frame);
        state.events.extend(events);
    }
}

async fn read_datagrams(connection: Connection, shared: Arc<Mutex<State>>) {
    while let Ok(bytes) = connection.read_datagram().await {
        let datagram = match decode_datagram(&bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::debug!("dropping malformed datagram: {}", e);
                continue;
            },
        };

        let mut state = shared.lock();
        if let Some(event) = state.mirror.apply_datagram(datagram) {
            state.events.push(event);
        }
    }
}
