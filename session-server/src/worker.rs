//! The process-wide owner of the UDP socket, the room registry and the
//! connection table. Every inbound datagram passes the transport's
//! reliability layer and lands here as an event; root messages addressed
//! at a room are forwarded into that room's execution context.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};

use protocol::game::DecoderTable;
use protocol::packets::{ClientRootMessage, HelloInfo, ServerRootMessage};
use protocol::{DisconnectReason, GameCode, PacketReader};

use crate::auth::AuthApi;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::ServerError;
use crate::events::EventHub;
use crate::metrics::Metrics;
use crate::room::{Room, TICK_PERIOD};
use crate::transport::{Transport, TransportEvent};

/// Protocol revision this build speaks.
const SUPPORTED_PROTOCOL_VERSION: u8 = 1;

pub struct Worker {
    pub config: RwLock<Arc<ServerConfig>>,
    pub transport: Arc<Transport>,
    socket: Arc<UdpSocket>,
    rooms: Mutex<HashMap<i32, Arc<Room>>>,
    connections: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    pub hub: EventHub,
    metrics: Arc<dyn Metrics>,
    auth: Arc<dyn AuthApi>,
    next_client_id: AtomicU32,
    default_decoder: DecoderTable,
}

impl Worker {
    /// Binds the game socket and wires the transport. Returns the worker
    /// and the event stream `run` must be fed with.
    pub async fn bind(
        config: Arc<ServerConfig>,
        metrics: Arc<dyn Metrics>,
        auth: Arc<dyn AuthApi>,
    ) -> std::io::Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let socket = Arc::new(UdpSocket::bind(&config.bind).await?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport::new(socket.clone(), events_tx));
        let worker = Arc::new(Worker {
            config: RwLock::new(config),
            transport,
            socket,
            rooms: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            hub: EventHub::new(),
            metrics,
            auth,
            // First handed-out id is 1001.
            next_client_id: AtomicU32::new(1000),
            default_decoder: DecoderTable::default(),
        });
        Ok((worker, events_rx))
    }

    pub async fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The datagram pump plus the transport event loop. Runs forever.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        tokio::spawn(self.transport.clone().run_housekeeping());

        let recv_worker = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            loop {
                match recv_worker.socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        recv_worker
                            .transport
                            .handle_datagram(addr, &buf[..len])
                            .await;
                    }
                    Err(err) => {
                        tracing::warn!(?err, "Socket receive failed.");
                    }
                }
            }
        });

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Hello { addr, hello } => self.on_hello(addr, hello).await,
                TransportEvent::Payload { addr, payload } => {
                    self.on_payload(addr, &payload).await
                }
                TransportEvent::Disconnected { addr, reason, .. } => {
                    self.on_gone(addr, reason.unwrap_or(DisconnectReason::ExitGame))
                        .await
                }
                TransportEvent::Dead { addr } => {
                    tracing::debug!(peer = %addr, error = %ServerError::Timeout, "Peer timed out.");
                    self.on_gone(addr, DisconnectReason::Error).await
                }
            }
        }
    }

    async fn on_hello(self: &Arc<Self>, addr: SocketAddr, hello: HelloInfo) {
        if hello.protocol_version != SUPPORTED_PROTOCOL_VERSION {
            if let Some(peer) = self.transport.peer(addr) {
                peer.send_disconnect(DisconnectReason::IncorrectVersion, None).await;
            }
            return;
        }
        let mut connections = self.connections.lock().await;
        if connections.contains_key(&addr) {
            return;
        }
        let Some(peer) = self.transport.peer(addr) else {
            return;
        };
        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(Connection::new(client_id, peer, &hello));
        tracing::info!(
            peer = %addr,
            client = client_id,
            username = %hello.username,
            platform = ?hello.platform,
            "Client connected."
        );
        connections.insert(addr, connection);
    }

    async fn on_payload(self: &Arc<Self>, addr: SocketAddr, payload: &[u8]) {
        let Some(connection) = self.connection(addr).await else {
            return;
        };
        let messages = match ClientRootMessage::decode_all(&mut PacketReader::new(payload)) {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(peer = %addr, %err, "Malformed root payload.");
                if connection.note_malformed() {
                    connection
                        .disconnect(DisconnectReason::Hacking, None)
                        .await;
                    self.drop_connection(addr, DisconnectReason::Hacking).await;
                }
                return;
            }
        };
        for message in messages {
            self.handle_root(&connection, addr, message).await;
        }
    }

    async fn handle_root(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        addr: SocketAddr,
        message: ClientRootMessage,
    ) {
        match message {
            ClientRootMessage::HostGame { settings } => {
                let config = self.config.read().await.clone();
                let code = self.unused_code().await;
                let room = Room::new(
                    code,
                    settings,
                    config,
                    self.hub.clone(),
                    self.metrics.clone(),
                    self.auth.clone(),
                    self.default_decoder.clone(),
                );
                self.rooms.lock().await.insert(code.as_int(), room.clone());
                self.spawn_room_task(room);
                tracing::info!(room = %code, client = connection.client_id, "Room created.");
                connection
                    .send_reliable(&[ServerRootMessage::HostGame { code: code.as_int() }])
                    .await;
            }
            ClientRootMessage::JoinGame { code } => {
                let room = if GameCode::from_int(code).is_public_pool() {
                    self.any_public_room().await
                } else {
                    self.rooms.lock().await.get(&code).cloned()
                };
                let Some(room) = room else {
                    connection
                        .disconnect(DisconnectReason::GameNotFound, None)
                        .await;
                    return;
                };
                // Joining a new room implicitly leaves the previous one,
                // unless this is a rejoin of the same room.
                if let Some(previous) = connection.room() {
                    if previous.code != room.code {
                        let destroyed = previous
                            .leave(connection.client_id, DisconnectReason::ExitGame)
                            .await;
                        if destroyed {
                            self.remove_room(previous.code).await;
                        }
                    }
                }
                match room.join(connection.clone(), addr.ip()).await {
                    Ok(()) => {}
                    Err(reason) => {
                        connection.disconnect(reason, None).await;
                    }
                }
            }
            ClientRootMessage::StartGame { code } => {
                if let Some(room) = self.room_of(connection, code).await {
                    room.handle_start(connection.client_id).await;
                }
            }
            ClientRootMessage::EndGame { code, reason } => {
                if let Some(room) = self.room_of(connection, code).await {
                    room.handle_end(connection.client_id, reason).await;
                }
            }
            ClientRootMessage::AlterGame { code, alter_tag, value } => {
                if let Some(room) = self.room_of(connection, code).await {
                    room.handle_alter(connection.client_id, alter_tag, value).await;
                }
            }
            ClientRootMessage::KickPlayer { code, client_id, banned } => {
                if let Some(room) = self.room_of(connection, code).await {
                    let target_ip = self.address_of(client_id).await;
                    if let Err(err) = room
                        .kick_player(connection.client_id, client_id, banned, target_ip)
                        .await
                    {
                        tracing::debug!(room = %room.code, %err, "Kick refused.");
                    }
                }
            }
            ClientRootMessage::GameData { code, payload } => {
                if let Some(room) = self.room_of(connection, code).await {
                    room.handle_game_data(connection, &payload, None).await;
                }
            }
            ClientRootMessage::GameDataTo { code, target, payload } => {
                if let Some(room) = self.room_of(connection, code).await {
                    room.handle_game_data(connection, &payload, Some(target)).await;
                }
            }
        }
    }

    /// Resolves the room a message claims to address, but only if the
    /// sender actually sits in it.
    async fn room_of(&self, connection: &Arc<Connection>, code: i32) -> Option<Arc<Room>> {
        let room = connection.room()?;
        if room.code.as_int() != code {
            tracing::debug!(client = connection.client_id, "Message for foreign room dropped.");
            return None;
        }
        Some(room)
    }

    async fn address_of(&self, client_id: u32) -> Option<std::net::IpAddr> {
        let connections = self.connections.lock().await;
        connections
            .iter()
            .find(|(_, c)| c.client_id == client_id)
            .map(|(addr, _)| addr.ip())
    }

    async fn connection(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.lock().await.get(&addr).cloned()
    }

    /// A peer disappeared (graceful or timeout): run the leave flow and
    /// release the connection.
    async fn on_gone(self: &Arc<Self>, addr: SocketAddr, reason: DisconnectReason) {
        self.drop_connection(addr, reason).await;
    }

    async fn drop_connection(self: &Arc<Self>, addr: SocketAddr, reason: DisconnectReason) {
        let connection = self.connections.lock().await.remove(&addr);
        let Some(connection) = connection else {
            return;
        };
        tracing::info!(peer = %addr, client = connection.client_id, ?reason, "Client gone.");
        if let Some(room) = connection.room() {
            let destroyed = room.leave(connection.client_id, reason).await;
            if destroyed {
                self.remove_room(room.code).await;
            }
        }
    }

    async fn unused_code(&self) -> GameCode {
        let rooms = self.rooms.lock().await;
        loop {
            let code = GameCode::random(|bound| rand::thread_rng().gen_range(0..bound));
            if !rooms.contains_key(&code.as_int()) {
                return code;
            }
        }
    }

    async fn any_public_room(&self) -> Option<Arc<Room>> {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        for room in rooms {
            if room.is_joinable_public().await {
                return Some(room);
            }
        }
        None
    }

    pub async fn remove_room(&self, code: GameCode) {
        if self.rooms.lock().await.remove(&code.as_int()).is_some() {
            tracing::info!(room = %code, "Room released.");
        }
    }

    /// Flips a room's host policy at runtime, e.g. from the admin pages.
    pub async fn set_server_as_host(&self, code: GameCode, enabled: bool) -> bool {
        let room = self.rooms.lock().await.get(&code.as_int()).cloned();
        match room {
            Some(room) => {
                if enabled {
                    room.enable_server_as_host(true).await;
                } else {
                    room.disable_server_as_host().await;
                }
                true
            }
            None => false,
        }
    }

    /// Explicit destroy, e.g. from the admin pages.
    pub async fn destroy_room(&self, code: GameCode) -> bool {
        let room = self.rooms.lock().await.get(&code.as_int()).cloned();
        match room {
            Some(room) => {
                room.destroy(true).await;
                self.remove_room(code).await;
                true
            }
            None => false,
        }
    }

    /// Formatted room list for logs and the admin pages.
    pub async fn describe_rooms(&self) -> String {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        let mut lines = Vec::with_capacity(rooms.len());
        for room in rooms {
            lines.push(room.describe().await);
        }
        lines.join("\n")
    }

    /// Fallback sweep against leaked rooms; the tick tasks normally clean
    /// up after themselves.
    pub async fn cleanup_dead_rooms(&self) {
        let mut rooms = self.rooms.lock().await;
        rooms.retain(|code, room| {
            let alive = !room.is_destroyed();
            if !alive {
                tracing::info!(room = code, "Removing dead room.");
            }
            alive
        });
    }

    fn spawn_room_task(self: &Arc<Self>, room: Arc<Room>) {
        let worker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_PERIOD);
            loop {
                interval.tick().await;
                room.fixed_update().await;
                if room.is_destroyed() {
                    worker.remove_room(room.code).await;
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::net::UdpSocket as TokioUdpSocket;
    use tokio::time::timeout;

    use protocol::packets::Packet;
    use protocol::settings::GameSettings;
    use protocol::{Language, PacketWriter, Platform, SERVER_HOST_ID};

    use crate::auth::NullAuth;
    use crate::config::ServerConfig;
    use crate::metrics::LogMetrics;

    /// A scripted client on a real socket: says hello, sends root
    /// messages reliably, acks and collects whatever the server answers.
    struct TestClient {
        socket: TokioUdpSocket,
        server: SocketAddr,
        nonce: u16,
    }

    impl TestClient {
        async fn connect(server: SocketAddr) -> Self {
            let socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
            TestClient { socket, server, nonce: 0 }
        }

        async fn hello(&mut self, username: &str) {
            self.nonce += 1;
            let packet = Packet::Hello {
                nonce: self.nonce,
                hello: protocol::packets::HelloInfo {
                    protocol_version: 1,
                    client_version: 1,
                    username: username.into(),
                    language: Language::English,
                    chat_mode: 0,
                    platform: Platform::Unknown,
                    platform_name: "Test".into(),
                },
            };
            self.socket.send_to(&packet.encode(), self.server).await.unwrap();
        }

        async fn send_roots(&mut self, messages: &[ClientRootMessage]) {
            let mut writer = PacketWriter::new();
            for message in messages {
                message.encode(&mut writer);
            }
            self.nonce += 1;
            let packet = Packet::Reliable {
                nonce: self.nonce,
                payload: writer.into_bytes(),
            };
            self.socket.send_to(&packet.encode(), self.server).await.unwrap();
        }

        /// Drains inbound packets for a while, acking reliables, and
        /// returns every root message received.
        async fn collect_roots(&mut self, for_ms: u64) -> Vec<ServerRootMessage> {
            let mut roots = Vec::new();
            let mut buf = [0u8; 4096];
            let deadline = tokio::time::Instant::now() + Duration::from_millis(for_ms);
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let Ok(Ok((len, _))) = timeout(remaining, self.socket.recv_from(&mut buf)).await
                else {
                    break;
                };
                let payload = match Packet::decode(&buf[..len]) {
                    Ok(Packet::Reliable { nonce, payload }) => {
                        let ack = Packet::Ack { nonce, mask: 0 }.encode();
                        self.socket.send_to(&ack, self.server).await.unwrap();
                        payload
                    }
                    Ok(Packet::Unreliable { payload }) => payload,
                    _ => Bytes::new(),
                };
                if payload.is_empty() {
                    continue;
                }
                if let Ok(messages) =
                    ServerRootMessage::decode_all(&mut PacketReader::new(&payload))
                {
                    roots.extend(messages);
                }
            }
            roots
        }
    }

    async fn test_worker(server_as_host: bool) -> (Arc<Worker>, SocketAddr) {
        let config = ServerConfig {
            bind: "127.0.0.1:0".into(),
            server_as_host,
            ..ServerConfig::default()
        };
        let (worker, events) = Worker::bind(Arc::new(config), Arc::new(LogMetrics), Arc::new(NullAuth))
            .await
            .unwrap();
        let addr = worker.local_addr().await.unwrap();
        tokio::spawn(worker.clone().run(events));
        (worker, addr)
    }

    #[tokio::test]
    async fn host_and_join_round_trip_in_server_as_host_mode() {
        let (worker, addr) = test_worker(true).await;
        let mut client = TestClient::connect(addr).await;

        client.hello("Alice").await;
        client
            .send_roots(&[ClientRootMessage::HostGame {
                settings: GameSettings::default(),
            }])
            .await;

        let roots = client.collect_roots(300).await;
        let code = roots
            .iter()
            .find_map(|m| match m {
                ServerRootMessage::HostGame { code } => Some(*code),
                _ => None,
            })
            .expect("host game reply carries the room code");
        assert!(GameCode::from_int(code).as_int() < 0, "6 char code");

        client.send_roots(&[ClientRootMessage::JoinGame { code }]).await;
        let roots = client.collect_roots(300).await;
        let joined = roots.iter().find_map(|m| match m {
            ServerRootMessage::JoinedGame { client_id, host_id, others, .. } => {
                Some((*client_id, *host_id, others.clone()))
            }
            _ => None,
        });
        let (client_id, host_id, others) = joined.expect("joined game reply");
        assert_eq!(client_id, 1001, "first client id");
        // As the sole acting host the joiner sees itself as host.
        assert!(host_id == client_id || host_id == SERVER_HOST_ID);
        assert!(others.is_empty());

        // The room is registered and describable.
        let listing = worker.describe_rooms().await;
        assert!(listing.contains(&GameCode::from_int(code).to_string()));
    }

    #[tokio::test]
    async fn joining_a_missing_room_is_refused() {
        let (_worker, addr) = test_worker(false).await;
        let mut client = TestClient::connect(addr).await;

        client.hello("Bob").await;
        client
            .send_roots(&[ClientRootMessage::JoinGame {
                code: GameCode::parse("ABCDEF").unwrap().as_int(),
            }])
            .await;

        // The server answers with a disconnect packet carrying the
        // reason, not a join.
        let mut buf = [0u8; 256];
        let mut saw_not_found = false;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Ok(Ok((len, _))) =
                timeout(remaining, client.socket.recv_from(&mut buf)).await
            else {
                break;
            };
            if let Ok(Packet::Disconnect { reason: Some(reason), .. }) =
                Packet::decode(&buf[..len])
            {
                assert_eq!(reason, DisconnectReason::GameNotFound);
                saw_not_found = true;
                break;
            }
        }
        assert!(saw_not_found, "expected a game-not-found disconnect");
    }
}
