//! A game session: the player registry, the host policy state machine,
//! the replicated object graph and the broadcast fan-out.
//!
//! All room state sits behind one async mutex, so every mutation runs on a
//! single logical execution context; different rooms progress in parallel
//! and never read each other's state. The fixed tick drives timers, dirty
//! component serialization and the outbound stream.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::time::Instant;

use protocol::game::{DecoderTable, GameDataMessage, SpawnMessage};
use protocol::packets::ServerRootMessage;
use protocol::rpc::Rpc;
use protocol::settings::GameSettings;
use protocol::{
    DisconnectReason, GameCode, GameOverReason, PacketWriter, SpawnType, Vector2,
    ALTER_GAME_PRIVACY, OWNER_ROOM, SERVER_HOST_ID, SPAWN_FLAG_CLIENT_CHARACTER, TEMP_CLIENT_ID,
};

use crate::anticheat::{AntiCheat, Role, RpcContext, Verdict};
use crate::auth::AuthApi;
use crate::chat;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::diag::{self, PlayerDiag, RoomDiag};
use crate::error::ServerError;
use crate::events::{
    BroadcastEvent, ClientLeaveEvent, EndGameIntentEvent, EventHub, FixedUpdateEvent,
    SelectHostEvent,
};
use crate::metrics::Metrics;
use crate::object::components::{ComponentKind, PlayerInfo, TaskState, VoteArea};
use crate::object::ObjectGraph;

/// Fixed tick period (20 Hz).
pub const TICK_PERIOD: Duration = Duration::from_millis(50);
/// How long the start sequence waits for stragglers to report ready.
const START_READY_TIMEOUT: Duration = Duration::from_secs(3);
/// Vision range of the movement fan-out filter, in player units.
const MOVEMENT_VISION_RANGE: f32 = 7.0;
/// Motion below this magnitude does not count against the update rate.
const MOVEMENT_EPSILON: f32 = 0.5;
/// The skip sentinel of a cast vote.
const VOTE_SKIP: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    NotStarted,
    Started,
    Ended,
    Destroyed,
}

impl GameState {
    fn name(&self) -> &'static str {
        match self {
            GameState::NotStarted => "NotStarted",
            GameState::Started => "Started",
            GameState::Ended => "Ended",
            GameState::Destroyed => "Destroyed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostId {
    Server,
    Client(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privacy {
    Public,
    Private,
}

/// A seat in the room. The replicated cosmetic state lives in the game
/// data component; this mirrors it for fast access plus the bookkeeping
/// fields that never hit the wire.
#[derive(Debug, Clone)]
pub struct Player {
    pub client_id: u32,
    pub player_id: u8,
    pub name: String,
    pub color: u8,
    pub hat: u32,
    pub pet: u32,
    pub skin: u32,
    pub is_dead: bool,
    pub is_impostor: bool,
    pub is_ready: bool,
    pub in_scene: bool,
    pub tasks: Vec<TaskState>,
}

impl Player {
    fn new(client_id: u32, player_id: u8) -> Self {
        Player {
            client_id,
            player_id,
            name: String::new(),
            color: 0,
            hat: 0,
            pet: 0,
            skin: 0,
            is_dead: false,
            is_impostor: false,
            is_ready: false,
            in_scene: false,
            tasks: Vec::new(),
        }
    }

    fn role(&self) -> Role {
        if self.is_impostor { Role::Impostor } else { Role::Crewmate }
    }
}

/// One queued outbound game data message with its recipient filter.
struct OutboundEntry {
    message: GameDataMessage,
    /// When set, wrap in a targeted envelope for exactly these clients.
    include: Option<Vec<u32>>,
    exclude: Option<u32>,
}

struct RoomInner {
    state: GameState,
    privacy: Privacy,
    settings: GameSettings,
    host: HostId,
    acting_hosts_enabled: bool,
    acting_host_ids: BTreeSet<u32>,
    waiting_for_host: BTreeSet<u32>,
    /// Players whose join handshake still holds the acting host views back.
    acting_host_waiting_for: Vec<u32>,
    finished_acting_host_transaction: bool,
    connections: BTreeMap<u32, Arc<Connection>>,
    players: BTreeMap<u32, Player>,
    objects: ObjectGraph,
    outbound: Vec<OutboundEntry>,
    end_game_intents: Vec<(&'static str, GameOverReason)>,
    created_at: Instant,
    last_fixed_update: Instant,
    ever_joined: bool,
    banned_addresses: HashSet<IpAddr>,
    start_ready_deadline: Option<Instant>,
    /// Movement packets per sender, counted for the update-rate filter.
    movement_counters: HashMap<u32, u32>,
    /// Last broadcast position per sender, for the magnitude filter.
    movement_positions: HashMap<u32, Vector2>,
    anticheat: AntiCheat,
    decoder: DecoderTable,
}

pub struct Room {
    pub code: GameCode,
    config: Arc<ServerConfig>,
    hub: EventHub,
    metrics: Arc<dyn Metrics>,
    auth: Arc<dyn AuthApi>,
    inner: tokio::sync::Mutex<RoomInner>,
    destroyed: AtomicBool,
}

impl Room {
    pub fn new(
        code: GameCode,
        settings: GameSettings,
        config: Arc<ServerConfig>,
        hub: EventHub,
        metrics: Arc<dyn Metrics>,
        auth: Arc<dyn AuthApi>,
        decoder: DecoderTable,
    ) -> Arc<Self> {
        let settings = config.enforce_settings.clone().unwrap_or(settings);
        let now = Instant::now();
        Arc::new(Room {
            code,
            inner: tokio::sync::Mutex::new(RoomInner {
                state: GameState::NotStarted,
                privacy: Privacy::Private,
                settings,
                host: if config.server_as_host { HostId::Server } else { HostId::Client(0) },
                acting_hosts_enabled: config.server_as_host,
                acting_host_ids: BTreeSet::new(),
                waiting_for_host: BTreeSet::new(),
                acting_host_waiting_for: Vec::new(),
                finished_acting_host_transaction: false,
                connections: BTreeMap::new(),
                players: BTreeMap::new(),
                objects: ObjectGraph::new(config.advanced.unknown_objects.clone()),
                outbound: Vec::new(),
                end_game_intents: Vec::new(),
                created_at: now,
                last_fixed_update: now,
                ever_joined: false,
                banned_addresses: HashSet::new(),
                start_ready_deadline: None,
                movement_counters: HashMap::new(),
                movement_positions: HashMap::new(),
                anticheat: AntiCheat::new(),
                decoder,
            }),
            config,
            hub,
            metrics,
            auth,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Formatted one-line description for logs and the admin pages.
    pub async fn describe(&self) -> String {
        let inner = self.inner.lock().await;
        let diag = RoomDiag {
            code: self.code.to_string(),
            state: inner.state.name(),
            players: inner.connections.len(),
            host: match inner.host {
                HostId::Server => "server".to_string(),
                HostId::Client(id) => format!("#{id}"),
            },
            privacy: match inner.privacy {
                Privacy::Public => "public",
                Privacy::Private => "private",
            },
        };
        diag::format_room(&self.config.logging.rooms.format, &diag)
    }

    pub async fn is_joinable_public(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.privacy == Privacy::Public
            && inner.state == GameState::NotStarted
            && inner.connections.len() < inner.settings.max_players as usize
    }

    // ------------------------------------------------------------------
    // Host views
    // ------------------------------------------------------------------

    /// Which host a given connection must currently see (the per
    /// connection invariant of the host policy).
    fn host_view_for(inner: &RoomInner, client_id: u32) -> u32 {
        match inner.host {
            HostId::Client(host) => host,
            HostId::Server => {
                if inner.acting_hosts_enabled
                    && inner.acting_host_waiting_for.is_empty()
                    && inner.acting_host_ids.contains(&client_id)
                {
                    client_id
                } else {
                    SERVER_HOST_ID
                }
            }
        }
    }

    /// Pushes the current host view to every connection, as the paired
    /// temp join/remove that makes clients reconcile the host id without
    /// a rejoin.
    async fn broadcast_host_view(&self, inner: &RoomInner) {
        let code = self.code.as_int();
        let sends = inner.connections.values().map(|connection| {
            let shown = Self::host_view_for(inner, connection.client_id);
            let messages = [
                ServerRootMessage::JoinGame {
                    code,
                    client_id: TEMP_CLIENT_ID,
                    host_id: shown,
                },
                ServerRootMessage::RemovePlayer {
                    code,
                    client_id: TEMP_CLIENT_ID,
                    host_id: shown,
                    reason: DisconnectReason::ExitGame as u8,
                },
            ];
            let connection = connection.clone();
            async move { connection.send_reliable(&messages).await }
        });
        join_all(sends).await;
    }

    /// Picks a new host after the previous one left (or server-as-host
    /// got disabled): first acting host, else first connection.
    async fn select_new_host(&self, inner: &mut RoomInner) {
        let candidate = inner
            .acting_host_ids
            .iter()
            .next()
            .copied()
            .or_else(|| inner.connections.keys().next().copied());
        let Some(candidate) = candidate else {
            return;
        };

        let mut event = SelectHostEvent::new(self.code, candidate, false);
        self.hub.emit_serial(&mut event, |l, e| l.on_select_host(e));
        if event.is_cancelled() {
            return;
        }
        let chosen = event.candidate;
        inner.acting_host_ids.remove(&chosen);
        inner.host = HostId::Client(chosen);
        self.broadcast_host_view(inner).await;
    }

    /// Grants acting host status, subject to the selection event veto.
    async fn promote_acting_host(&self, inner: &mut RoomInner, client_id: u32) {
        let mut event = SelectHostEvent::new(self.code, client_id, true);
        self.hub.emit_serial(&mut event, |l, e| l.on_select_host(e));
        if event.is_cancelled() {
            return;
        }
        inner.acting_host_ids.insert(event.candidate);
        self.broadcast_host_view(inner).await;
    }

    /// Switches the room into server-as-host mode.
    pub async fn enable_server_as_host(&self, keep_previous_as_acting: bool) {
        let mut inner = self.inner.lock().await;
        let previous = inner.host;
        inner.host = HostId::Server;
        inner.acting_hosts_enabled = true;
        if keep_previous_as_acting {
            if let HostId::Client(id) = previous {
                inner.acting_host_ids.insert(id);
            }
        }
        self.broadcast_host_view(&inner).await;
    }

    /// Leaves server-as-host mode, handing the room to a client host.
    pub async fn disable_server_as_host(&self) {
        let mut inner = self.inner.lock().await;
        inner.acting_hosts_enabled = false;
        self.select_new_host(&mut inner).await;
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    /// The join protocol. On error the caller sends the disconnect.
    pub async fn join(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        remote_ip: IpAddr,
    ) -> Result<(), DisconnectReason> {
        let mut inner = self.inner.lock().await;

        if inner.banned_addresses.contains(&remote_ip) {
            return Err(DisconnectReason::Banned);
        }
        if inner.state == GameState::Destroyed {
            return Err(DisconnectReason::GameNotFound);
        }

        let client_id = connection.client_id;
        let rejoin = inner.connections.contains_key(&client_id);
        if !rejoin {
            if inner.connections.len() >= inner.settings.max_players as usize {
                return Err(DisconnectReason::GameFull);
            }
            if inner.state == GameState::Started {
                return Err(DisconnectReason::GameStarted);
            }
            let player_id = Self::free_player_id(&inner);
            inner.players.insert(client_id, Player::new(client_id, player_id));
            inner.connections.insert(client_id, connection.clone());
        } else if let Some(player) = inner.players.get_mut(&client_id) {
            player.is_ready = false;
            player.in_scene = false;
        }
        inner.ever_joined = true;
        connection.set_room(self);

        // First seat picks the host.
        if inner.connections.len() == 1 {
            match inner.host {
                HostId::Server => {
                    if inner.acting_host_ids.is_empty() {
                        self.promote_acting_host(&mut inner, client_id).await;
                    }
                }
                HostId::Client(_) => {
                    let mut event = SelectHostEvent::new(self.code, client_id, false);
                    self.hub.emit_serial(&mut event, |l, e| l.on_select_host(e));
                    inner.host = HostId::Client(event.candidate);
                }
            }
        } else if inner.host == HostId::Server
            && inner.acting_hosts_enabled
            && inner.acting_host_ids.is_empty()
        {
            self.promote_acting_host(&mut inner, client_id).await;
        }

        let code = self.code.as_int();
        let host_for_joiner = Self::host_view_for(&inner, client_id);

        let is_host = inner.host == HostId::Client(client_id);
        if inner.state == GameState::Ended && is_host {
            // The returning host reopens the lobby and releases everyone
            // who was parked waiting for them.
            inner.state = GameState::NotStarted;
            self.send_joined_game(&inner, &connection, host_for_joiner).await;
            self.broadcast_join(&inner, client_id).await;
            self.join_waiting_clients(&mut inner).await;
        } else if inner.state == GameState::Ended {
            inner.waiting_for_host.insert(client_id);
            connection
                .send_reliable(&[ServerRootMessage::WaitForHost { code, client_id }])
                .await;
        } else {
            // Joined-game and privacy notice coalesce into one packet.
            let others: Vec<u32> = inner
                .connections
                .keys()
                .copied()
                .filter(|id| *id != client_id)
                .collect();
            connection.buffer_message(ServerRootMessage::JoinedGame {
                code,
                client_id,
                host_id: host_for_joiner,
                others,
            });
            let privacy = if inner.privacy == Privacy::Public { 1 } else { 0 };
            connection.buffer_message(ServerRootMessage::AlterGame {
                code,
                alter_tag: ALTER_GAME_PRIVACY,
                value: privacy,
            });
            connection.flush().await;
            self.broadcast_join(&inner, client_id).await;
        }

        // With the server hosting, the lobby furniture must exist before
        // any client asks for it.
        if inner.host == HostId::Server {
            self.ensure_room_objects(&mut inner).await;
        }

        let player_line = diag::format_player(
            &self.config.logging.players.format,
            &PlayerDiag {
                name: connection.username.clone(),
                client_id,
                player_id: inner
                    .players
                    .get(&client_id)
                    .map(|p| p.player_id)
                    .unwrap_or(0),
                ping: connection.ping_ms(),
            },
        );
        tracing::info!(
            room = %self.code,
            player = %player_line,
            language = ?connection.language,
            platform = ?connection.platform,
            "Client joined."
        );
        Ok(())
    }

    fn free_player_id(inner: &RoomInner) -> u8 {
        let used: HashSet<u8> = inner.players.values().map(|p| p.player_id).collect();
        (0..=u8::MAX).find(|id| !used.contains(id)).unwrap_or(0)
    }

    async fn send_joined_game(
        &self,
        inner: &RoomInner,
        connection: &Arc<Connection>,
        host_id: u32,
    ) {
        let others: Vec<u32> = inner
            .connections
            .keys()
            .copied()
            .filter(|id| *id != connection.client_id)
            .collect();
        connection
            .send_reliable(&[ServerRootMessage::JoinedGame {
                code: self.code.as_int(),
                client_id: connection.client_id,
                host_id,
                others,
            }])
            .await;
    }

    async fn broadcast_join(&self, inner: &RoomInner, joiner: u32) {
        let code = self.code.as_int();
        let sends = inner
            .connections
            .values()
            .filter(|c| c.client_id != joiner)
            .map(|connection| {
                let host_id = Self::host_view_for(inner, connection.client_id);
                let connection = connection.clone();
                async move {
                    connection
                        .send_reliable(&[ServerRootMessage::JoinGame {
                            code,
                            client_id: joiner,
                            host_id,
                        }])
                        .await
                }
            });
        join_all(sends).await;
    }

    /// Releases clients parked in the wait-for-host set after the host
    /// reopened an ended room.
    async fn join_waiting_clients(&self, inner: &mut RoomInner) {
        let waiting: Vec<u32> = inner.waiting_for_host.iter().copied().collect();
        inner.waiting_for_host.clear();
        for client_id in waiting {
            let Some(connection) = inner.connections.get(&client_id).cloned() else {
                continue;
            };
            let host = Self::host_view_for(inner, client_id);
            self.send_joined_game(inner, &connection, host).await;
            self.broadcast_join(inner, client_id).await;
        }
    }

    /// The leave protocol. Returns true when the room destroyed itself.
    pub async fn leave(self: &Arc<Self>, client_id: u32, reason: DisconnectReason) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(connection) = inner.connections.remove(&client_id) else {
            return false;
        };
        connection.clear_room();
        inner.waiting_for_host.remove(&client_id);
        let was_acting = inner.acting_host_ids.remove(&client_id);
        inner.acting_host_waiting_for.retain(|id| *id != client_id);
        inner.players.remove(&client_id);
        inner.movement_counters.remove(&client_id);
        inner.movement_positions.remove(&client_id);

        // Their objects go with them.
        let despawned = inner.objects.despawn_owned_by(client_id as i32);
        for net_id in despawned {
            inner.outbound.push(OutboundEntry {
                message: GameDataMessage::Despawn { net_id },
                include: None,
                exclude: None,
            });
        }

        self.hub.emit(
            &ClientLeaveEvent { room: self.code, client_id, reason },
            |l, e| l.on_client_leave(e),
        );

        if inner.connections.is_empty() {
            drop(inner);
            self.destroy(false).await;
            return true;
        }

        let host_left = inner.host == HostId::Client(client_id);
        if host_left {
            self.select_new_host(&mut inner).await;
            // A host change can wake an ended room's waiters.
            if inner.state == GameState::Ended {
                if let HostId::Client(new_host) = inner.host {
                    if inner.waiting_for_host.remove(&new_host) {
                        inner.state = GameState::NotStarted;
                        self.join_waiting_clients(&mut inner).await;
                    }
                }
            }
        } else if was_acting && inner.acting_hosts_enabled && inner.acting_host_ids.is_empty() {
            // The only acting host left; promote the oldest connection.
            if let Some(next) = inner.connections.keys().next().copied() {
                self.promote_acting_host(&mut inner, next).await;
            }
        }

        // Tell the survivors, with their own host field.
        let code = self.code.as_int();
        let sends = inner.connections.values().map(|connection| {
            let host_id = Self::host_view_for(&inner, connection.client_id);
            let connection = connection.clone();
            async move {
                connection
                    .send_reliable(&[ServerRootMessage::RemovePlayer {
                        code,
                        client_id,
                        host_id,
                        reason: reason as u8,
                    }])
                    .await
            }
        });
        join_all(sends).await;

        tracing::info!(room = %self.code, client = client_id, ?reason, "Client left.");
        false
    }

    /// Kicks (and optionally bans) a player on behalf of the host.
    pub async fn kick_player(
        self: &Arc<Self>,
        sender_id: u32,
        target_id: u32,
        ban: bool,
        remote_ip: Option<IpAddr>,
    ) -> Result<(), ServerError> {
        {
            let mut inner = self.inner.lock().await;
            let sender_is_host = inner.host == HostId::Client(sender_id)
                || inner.acting_host_ids.contains(&sender_id);
            if !sender_is_host {
                return Err(ServerError::Unauthorized("kick requires host authority"));
            }
            if !inner.connections.contains_key(&target_id) {
                return Err(ServerError::NotFound("kick target is not in the room"));
            }
            if ban {
                if let Some(ip) = remote_ip {
                    inner.banned_addresses.insert(ip);
                }
                let name = inner
                    .players
                    .get(&target_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| format!("#{target_id}"));
                tracing::info!(room = %self.code, "{} banned", name);
            }
            let code = self.code.as_int();
            let sends = inner.connections.values().map(|connection| {
                let connection = connection.clone();
                async move {
                    connection
                        .send_reliable(&[ServerRootMessage::KickPlayer {
                            code,
                            client_id: target_id,
                            banned: ban,
                        }])
                        .await
                }
            });
            join_all(sends).await;
        }
        let reason = if ban { DisconnectReason::Banned } else { DisconnectReason::Kicked };
        self.leave(target_id, reason).await;
        Ok(())
    }

    /// Bans by name from a chat command; includes the custom message in
    /// the log line only when one was supplied.
    async fn ban_by_name(self: &Arc<Self>, sender_id: u32, name: &str, message: Option<&str>) -> Result<String, String> {
        let (target_id, ip) = {
            let inner = self.inner.lock().await;
            let Some(player) = inner.players.values().find(|p| p.name == name) else {
                return Err(format!("no player named {name}"));
            };
            let ip = inner
                .connections
                .get(&player.client_id)
                .map(|c| c.peer.addr.ip());
            (player.client_id, ip)
        };
        self.kick_player(sender_id, target_id, true, ip)
            .await
            .map_err(|err| err.to_string())?;
        match message {
            Some(message) => tracing::info!(room = %self.code, "{name} banned ({message})"),
            None => tracing::info!(room = %self.code, "{name} banned"),
        }
        Ok(format!("{name} was banned"))
    }

    // ------------------------------------------------------------------
    // Root message handling
    // ------------------------------------------------------------------

    pub async fn handle_start(self: &Arc<Self>, sender_id: u32) {
        let mut inner = self.inner.lock().await;
        let authorized = match inner.host {
            HostId::Client(host) => host == sender_id,
            HostId::Server => inner.acting_host_ids.contains(&sender_id),
        };
        if !authorized || inner.state == GameState::Started {
            return;
        }
        inner.state = GameState::Started;
        for player in inner.players.values_mut() {
            player.is_ready = false;
        }
        let code = self.code.as_int();
        let sends = inner.connections.values().map(|connection| {
            let connection = connection.clone();
            async move {
                connection
                    .send_reliable(&[ServerRootMessage::StartGame { code }])
                    .await
            }
        });
        join_all(sends).await;

        if inner.host == HostId::Server {
            inner.start_ready_deadline = Some(Instant::now() + START_READY_TIMEOUT);
        }
        tracing::info!(room = %self.code, "Game starting.");
    }

    pub async fn handle_end(self: &Arc<Self>, sender_id: u32, reason: u8) {
        let authorized = {
            let inner = self.inner.lock().await;
            match inner.host {
                HostId::Client(host) => host == sender_id,
                HostId::Server => inner.acting_host_ids.contains(&sender_id),
            }
        };
        if authorized {
            self.end_game(reason).await;
        }
    }

    pub async fn handle_alter(&self, sender_id: u32, alter_tag: u8, value: u8) {
        if alter_tag != ALTER_GAME_PRIVACY {
            return;
        }
        let mut inner = self.inner.lock().await;
        let authorized = inner.host == HostId::Client(sender_id)
            || inner.acting_host_ids.contains(&sender_id);
        if !authorized {
            return;
        }
        inner.privacy = if value != 0 { Privacy::Public } else { Privacy::Private };
        let code = self.code.as_int();
        let sends = inner
            .connections
            .values()
            .filter(|c| c.client_id != sender_id)
            .map(|connection| {
                let connection = connection.clone();
                async move {
                    connection
                        .send_reliable(&[ServerRootMessage::AlterGame {
                            code,
                            alter_tag: ALTER_GAME_PRIVACY,
                            value,
                        }])
                        .await
                }
            });
        join_all(sends).await;
    }

    /// Ends the running game and flushes the infraction buffer.
    pub async fn end_game(self: &Arc<Self>, reason: u8) {
        let mut inner = self.inner.lock().await;
        if inner.state != GameState::Started {
            return;
        }
        inner.state = GameState::Ended;
        inner.start_ready_deadline = None;
        inner.end_game_intents.clear();
        inner.outbound.clear();

        // The ship and everything on it is gone; the lobby comes back
        // when the host reopens the room.
        let ids: Vec<u32> = inner.objects.iter().map(|c| c.net_id).collect();
        for id in ids {
            inner.objects.despawn(id);
        }

        let code = self.code.as_int();
        let sends = inner.connections.values().map(|connection| {
            let connection = connection.clone();
            async move {
                connection
                    .send_reliable(&[ServerRootMessage::EndGame { code, reason, show_ad: false }])
                    .await
            }
        });
        join_all(sends).await;

        let batch = inner.anticheat.drain();
        if !batch.is_empty() {
            self.stamp_and_flush(batch).await;
        }
        tracing::info!(room = %self.code, reason, "Game ended.");
    }

    /// Attaches the sink's game id to a batch before handing it over.
    async fn stamp_and_flush(&self, mut batch: Vec<crate::metrics::Infraction>) {
        let game_id = self.metrics.current_game_id(self.code).await;
        for infraction in &mut batch {
            infraction.game_id = game_id.clone();
        }
        self.metrics.flush_infractions(batch).await;
    }

    // ------------------------------------------------------------------
    // Game data handling
    // ------------------------------------------------------------------

    /// Decodes and applies one game data envelope from a client, queueing
    /// whatever must be forwarded. `target` is set for targeted envelopes.
    pub async fn handle_game_data(
        self: &Arc<Self>,
        sender: &Arc<Connection>,
        payload: &[u8],
        target: Option<u32>,
    ) {
        let messages = {
            let inner = self.inner.lock().await;
            match inner
                .decoder
                .decode_all(&mut protocol::PacketReader::new(payload))
            {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!(room = %self.code, client = sender.client_id, %err, "Malformed game data.");
                    if sender.note_malformed() {
                        drop(inner);
                        self.boot_for_malformed(sender).await;
                    }
                    return;
                }
            }
        };

        for message in messages {
            self.apply_game_data_message(sender, message, target).await;
        }

        // Infractions past the threshold flush early.
        let batch = {
            let mut inner = self.inner.lock().await;
            inner.anticheat.drain_if_full()
        };
        if let Some(batch) = batch {
            self.stamp_and_flush(batch).await;
        }
    }

    async fn boot_for_malformed(self: &Arc<Self>, sender: &Arc<Connection>) {
        tracing::warn!(room = %self.code, client = sender.client_id, "Too many malformed packets.");
        sender.disconnect(DisconnectReason::Hacking, None).await;
        self.leave(sender.client_id, DisconnectReason::Hacking).await;
    }

    async fn apply_game_data_message(
        self: &Arc<Self>,
        sender: &Arc<Connection>,
        message: GameDataMessage,
        target: Option<u32>,
    ) {
        match message {
            GameDataMessage::Data { net_id, payload } => {
                self.apply_data(sender, net_id, payload).await;
            }
            GameDataMessage::Rpc { net_id, rpc } => {
                self.apply_rpc(sender, net_id, rpc, target).await;
            }
            GameDataMessage::Spawn(spawn) => {
                self.apply_remote_spawn(sender, spawn).await;
            }
            GameDataMessage::Despawn { net_id } => {
                let mut inner = self.inner.lock().await;
                let allowed = inner
                    .objects
                    .get(net_id)
                    .map(|c| {
                        c.owner_id == sender.client_id as i32
                            || inner.host == HostId::Client(sender.client_id)
                    })
                    .unwrap_or(false);
                if !allowed {
                    tracing::debug!(room = %self.code, net_id, "Despawn refused.");
                    return;
                }
                inner.objects.despawn(net_id);
                inner.outbound.push(OutboundEntry {
                    message: GameDataMessage::Despawn { net_id },
                    include: None,
                    exclude: Some(sender.client_id),
                });
            }
            GameDataMessage::SceneChange { client_id, scene } => {
                if client_id != sender.client_id {
                    tracing::debug!(room = %self.code, "Scene change for someone else refused.");
                    return;
                }
                self.apply_scene_change(sender, &scene).await;
            }
            GameDataMessage::Ready { client_id } => {
                if client_id != sender.client_id {
                    return;
                }
                let mut inner = self.inner.lock().await;
                if let Some(player) = inner.players.get_mut(&client_id) {
                    player.is_ready = true;
                }
                self.maybe_finish_start(&mut inner).await;
            }
            GameDataMessage::Extension { tag, payload } => {
                let mut inner = self.inner.lock().await;
                inner.outbound.push(OutboundEntry {
                    message: GameDataMessage::Extension { tag, payload },
                    include: target.map(|t| vec![t]),
                    exclude: Some(sender.client_id),
                });
            }
        }
    }

    /// State deltas. Movement goes through its own fan-out with loss
    /// tolerant delivery; everything else is applied and queued.
    async fn apply_data(self: &Arc<Self>, sender: &Arc<Connection>, net_id: u32, payload: Bytes) {
        let mut inner = self.inner.lock().await;
        let Some(component) = inner.objects.get(net_id) else {
            tracing::warn!(room = %self.code, net_id, "Data for unknown net id.");
            return;
        };
        if component.owner_id >= 0 && component.owner_id != sender.client_id as i32 {
            tracing::warn!(room = %self.code, net_id, client = sender.client_id, "Data for foreign object dropped.");
            return;
        }
        let is_movement = matches!(component.kind, ComponentKind::NetworkTransform { .. });

        if let Err(err) = inner.objects.deserialize_into(net_id, &payload) {
            tracing::warn!(room = %self.code, net_id, %err, "Bad data payload.");
            return;
        }

        if is_movement {
            self.fan_out_movement(&mut inner, sender.client_id, net_id, payload).await;
        } else {
            inner.outbound.push(OutboundEntry {
                message: GameDataMessage::Data { net_id, payload },
                include: None,
                exclude: Some(sender.client_id),
            });
        }
    }

    /// The movement fast path: update-rate deduplication, vision and
    /// ghost filtering, optional buffer reuse, unreliable delivery.
    async fn fan_out_movement(
        &self,
        inner: &mut RoomInner,
        sender_id: u32,
        net_id: u32,
        payload: Bytes,
    ) {
        let movement = &self.config.optimizations.movement;
        let position = match inner.objects.get(net_id).map(|c| &c.kind) {
            Some(ComponentKind::NetworkTransform { position, .. }) => *position,
            _ => return,
        };

        if movement.update_rate > 1 {
            let last = inner
                .movement_positions
                .get(&sender_id)
                .copied()
                .unwrap_or(position);
            let moved = position.distance(&last);
            let counter = inner.movement_counters.entry(sender_id).or_insert(0);
            // Standing still does not burn forwarding slots.
            if moved > MOVEMENT_EPSILON || inner.movement_positions.get(&sender_id).is_none() {
                *counter += 1;
            }
            let counter = *counter;
            inner.movement_positions.insert(sender_id, position);
            if counter % movement.update_rate != 0 {
                return;
            }
        } else {
            inner.movement_positions.insert(sender_id, position);
        }

        let sender_dead = inner
            .players
            .get(&sender_id)
            .map(|p| p.is_dead)
            .unwrap_or(false);

        // One shared buffer when no per-recipient rewriting is possible.
        let shared: Option<Bytes> = movement.reuse_buffer.then(|| {
            let mut writer = PacketWriter::new();
            GameDataMessage::Data { net_id, payload: payload.clone() }.encode(&mut writer);
            let mut root = PacketWriter::new();
            ServerRootMessage::GameData {
                code: self.code.as_int(),
                payload: writer.into_bytes(),
            }
            .encode(&mut root);
            root.into_bytes()
        });

        let mut sends = Vec::new();
        for connection in inner.connections.values() {
            if connection.client_id == sender_id {
                continue;
            }
            let recipient = inner.players.get(&connection.client_id);
            if movement.dead_checks && sender_dead {
                if let Some(recipient) = recipient {
                    if !recipient.is_dead {
                        continue;
                    }
                }
            }
            if movement.vision_checks {
                let recipient_position = inner
                    .objects
                    .find_owned(connection.client_id as i32, |k| {
                        matches!(k, ComponentKind::NetworkTransform { .. })
                    })
                    .map(|c| match &c.kind {
                        ComponentKind::NetworkTransform { position, .. } => *position,
                        _ => unreachable!(),
                    });
                if let Some(recipient_position) = recipient_position {
                    if position.distance(&recipient_position) > MOVEMENT_VISION_RANGE {
                        continue;
                    }
                }
            }

            let bytes = match &shared {
                Some(bytes) => bytes.clone(),
                None => {
                    let mut writer = PacketWriter::new();
                    GameDataMessage::Data { net_id, payload: payload.clone() }.encode(&mut writer);
                    let mut root = PacketWriter::new();
                    ServerRootMessage::GameData {
                        code: self.code.as_int(),
                        payload: writer.into_bytes(),
                    }
                    .encode(&mut root);
                    root.into_bytes()
                }
            };
            let peer = connection.peer.clone();
            sends.push(async move { peer.send_unreliable(bytes).await });
        }
        join_all(sends).await;
    }

    async fn apply_remote_spawn(self: &Arc<Self>, sender: &Arc<Connection>, spawn: SpawnMessage) {
        let mut inner = self.inner.lock().await;
        // Only the authoritative host spawns objects.
        if inner.host != HostId::Client(sender.client_id) {
            tracing::warn!(room = %self.code, client = sender.client_id, "Spawn from non-host dropped.");
            return;
        }
        match inner.objects.apply_spawn(&spawn) {
            Ok(()) => {
                inner.outbound.push(OutboundEntry {
                    message: GameDataMessage::Spawn(spawn),
                    include: None,
                    exclude: Some(sender.client_id),
                });
            }
            Err(err) => {
                tracing::warn!(room = %self.code, %err, "Spawn rejected.");
            }
        }
    }

    /// A client finished loading a scene. With the server hosting this is
    /// where its objects get spawned and the acting host handshake begins.
    async fn apply_scene_change(self: &Arc<Self>, sender: &Arc<Connection>, scene: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(player) = inner.players.get_mut(&sender.client_id) {
            player.in_scene = true;
        }
        // Forward the scene change so a classic host can answer it.
        inner.outbound.push(OutboundEntry {
            message: GameDataMessage::SceneChange {
                client_id: sender.client_id,
                scene: scene.to_string(),
            },
            include: None,
            exclude: Some(sender.client_id),
        });

        if inner.host != HostId::Server {
            return;
        }

        self.ensure_room_objects(&mut inner).await;

        // Send the newcomer everything that already exists, as grouped
        // prefab spawns.
        let spawns = Self::snapshot_spawns(&mut inner);
        if !spawns.is_empty() {
            let mut writer = PacketWriter::new();
            for spawn in &spawns {
                spawn.encode(&mut writer);
            }
            sender
                .send_reliable(&[ServerRootMessage::GameDataTo {
                    code: self.code.as_int(),
                    target: sender.client_id,
                    payload: writer.into_bytes(),
                }])
                .await;
        }

        // Spawn the newcomer's own player and announce it to everybody.
        let spawn = inner.objects.spawn_prefab(
            SpawnType::Player,
            sender.client_id as i32,
            SPAWN_FLAG_CLIENT_CHARACTER,
        );
        let player_id = inner
            .players
            .get(&sender.client_id)
            .map(|p| p.player_id)
            .unwrap_or(0);
        if let Some(control_data) = spawn.components.first() {
            if let Some(component) = inner.objects.get_mut(control_data.net_id) {
                if let ComponentKind::PlayerControl { player_id: slot, .. } = &mut component.kind {
                    *slot = player_id;
                }
            }
        }
        // Rebuild the announcement with the assigned slot.
        let spawn = Self::respawn_message(&mut inner, &spawn);
        Self::sync_player_info(&mut inner, sender.client_id);
        inner.outbound.push(OutboundEntry {
            message: GameDataMessage::Spawn(spawn),
            include: None,
            exclude: None,
        });

        // The handshake: acting host views stay suppressed until the
        // newcomer's name check went through.
        inner.acting_host_waiting_for.push(sender.client_id);
        self.broadcast_host_view(&inner).await;
    }

    /// Rebuilds a spawn message from the live components (after slot
    /// assignment and similar fixups).
    fn respawn_message(inner: &mut RoomInner, spawn: &SpawnMessage) -> SpawnMessage {
        let mut rebuilt = spawn.clone();
        for data in &mut rebuilt.components {
            if let Some(component) = inner.objects.get_mut(data.net_id) {
                data.payload = component.serialize(true).unwrap_or_default();
            }
        }
        rebuilt
    }

    /// Serializes every live object as spawn messages for a late joiner.
    fn snapshot_spawns(inner: &mut RoomInner) -> Vec<GameDataMessage> {
        use std::collections::BTreeMap as Ordered;
        // Group components by (spawn type, owner) the way they spawned.
        let mut groups: Ordered<(u32, i32), Vec<u32>> = Ordered::new();
        let mut ids: Vec<u32> = inner.objects.iter().map(|c| c.net_id).collect();
        ids.sort_unstable();
        for net_id in ids {
            let component = inner.objects.get(net_id).expect("listed above");
            groups
                .entry((component.spawn_type, component.owner_id))
                .or_default()
                .push(net_id);
        }
        let mut spawns = Vec::new();
        for ((spawn_type, owner_id), net_ids) in groups {
            let mut components = Vec::new();
            let mut flags = 0;
            for net_id in net_ids {
                let component = inner.objects.get_mut(net_id).expect("listed above");
                flags = component.flags;
                let payload = component.serialize(true).unwrap_or_default();
                components.push(protocol::game::ComponentData { net_id, payload });
            }
            spawns.push(GameDataMessage::Spawn(SpawnMessage {
                spawn_type,
                owner_id,
                flags,
                components,
            }));
        }
        spawns
    }

    /// Lobby furniture that must exist while the server hosts.
    async fn ensure_room_objects(&self, inner: &mut RoomInner) {
        let has_lobby = inner
            .objects
            .find(|k| matches!(k, ComponentKind::LobbyBehaviour))
            .is_some();
        if !has_lobby && inner.state == GameState::NotStarted {
            let spawn = inner.objects.spawn_prefab(SpawnType::LobbyBehaviour, OWNER_ROOM, 0);
            inner.outbound.push(OutboundEntry {
                message: GameDataMessage::Spawn(spawn),
                include: None,
                exclude: None,
            });
        }
        let has_game_data = inner
            .objects
            .find(|k| matches!(k, ComponentKind::GameData { .. }))
            .is_some();
        if !has_game_data {
            let spawn = inner.objects.spawn_prefab(SpawnType::GameData, OWNER_ROOM, 0);
            inner.outbound.push(OutboundEntry {
                message: GameDataMessage::Spawn(spawn),
                include: None,
                exclude: None,
            });
        }
    }

    /// Mirrors a player's room-level record into the replicated game data
    /// component and marks it dirty.
    fn sync_player_info(inner: &mut RoomInner, client_id: u32) {
        let Some(player) = inner.players.get(&client_id).cloned() else {
            return;
        };
        let Some(component) = inner
            .objects
            .find_mut(|k| matches!(k, ComponentKind::GameData { .. }))
        else {
            return;
        };
        if let ComponentKind::GameData { players } = &mut component.kind {
            let info = PlayerInfo {
                player_id: player.player_id,
                name: player.name.clone(),
                color: player.color,
                hat: player.hat,
                pet: player.pet,
                skin: player.skin,
                is_disconnected: false,
                is_impostor: player.is_impostor,
                is_dead: player.is_dead,
                tasks: player.tasks.clone(),
            };
            match players.iter_mut().find(|p| p.player_id == player.player_id) {
                Some(existing) => *existing = info,
                None => players.push(info),
            }
            component.dirty |= 1u32 << player.player_id.min(31);
        }
    }

    // ------------------------------------------------------------------
    // RPC handling
    // ------------------------------------------------------------------

    async fn apply_rpc(
        self: &Arc<Self>,
        sender: &Arc<Connection>,
        net_id: u32,
        rpc: Rpc,
        target: Option<u32>,
    ) {
        let user = sender.auth_user(self.auth.as_ref()).await;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let Some(component) = inner.objects.get(net_id) else {
            inner.anticheat.unknown_target(
                user.as_ref(),
                sender.client_id,
                sender.ping_ms(),
                net_id,
            );
            return;
        };

        // The trust boundary: every inbound call is checked first.
        let verdict = {
            let sender_player = inner.players.get(&sender.client_id);
            let (already_voted, suspect_ok) = Self::vote_context(inner, sender_player, &rpc);
            let context = RpcContext {
                sender_client_id: sender.client_id,
                sender_player_id: sender_player.map(|p| p.player_id),
                sender_role: sender_player.map(|p| p.role()).unwrap_or(Role::Crewmate),
                sender_is_acting_host: inner.acting_host_ids.contains(&sender.client_id),
                server_as_host: inner.host == HostId::Server,
                map: inner.settings.map,
                component,
                user: user.as_ref(),
                already_voted,
                suspect_alive_or_skip: suspect_ok,
                ping_ms: sender.ping_ms(),
            };
            inner.anticheat.check_rpc(&context, &rpc)
        };
        if verdict == Verdict::Suppress {
            return;
        }

        let forward = self.apply_rpc_effect(inner, sender, net_id, &rpc).await;
        if forward {
            inner.outbound.push(OutboundEntry {
                message: GameDataMessage::Rpc { net_id, rpc },
                include: target.map(|t| vec![t]),
                exclude: Some(sender.client_id),
            });
        }
    }

    fn vote_context(inner: &RoomInner, sender: Option<&Player>, rpc: &Rpc) -> (bool, bool) {
        let Rpc::CastVote { voter: _, suspect } = rpc else {
            return (false, true);
        };
        let already_voted = sender
            .and_then(|player| {
                inner
                    .objects
                    .find(|k| matches!(k, ComponentKind::MeetingHud { .. }))
                    .map(|component| match &component.kind {
                        ComponentKind::MeetingHud { states } => states
                            .iter()
                            .any(|s| s.player_id == player.player_id && s.voted_for.is_some()),
                        _ => false,
                    })
            })
            .unwrap_or(false);
        let suspect_ok = *suspect == VOTE_SKIP
            || inner
                .players
                .values()
                .any(|p| p.player_id == *suspect && !p.is_dead);
        (already_voted, suspect_ok)
    }

    /// Mutates room state for an accepted RPC. Returns whether the call
    /// is forwarded to the other clients.
    async fn apply_rpc_effect(
        self: &Arc<Self>,
        inner: &mut RoomInner,
        sender: &Arc<Connection>,
        net_id: u32,
        rpc: &Rpc,
    ) -> bool {
        let sender_id = sender.client_id;
        match rpc {
            Rpc::CheckName { name } => {
                if inner.host != HostId::Server {
                    return true;
                }
                // Duplicate names get a numeric suffix.
                let taken = inner
                    .players
                    .values()
                    .any(|p| p.client_id != sender_id && p.name == *name);
                let assigned = if taken {
                    let mut counter = 1;
                    loop {
                        let candidate = format!("{name} {counter}");
                        if !inner.players.values().any(|p| p.name == candidate) {
                            break candidate;
                        }
                        counter += 1;
                    }
                } else {
                    name.clone()
                };
                if let Some(player) = inner.players.get_mut(&sender_id) {
                    player.name = assigned.clone();
                }
                Self::sync_player_info(inner, sender_id);
                inner.outbound.push(OutboundEntry {
                    message: GameDataMessage::Rpc {
                        net_id,
                        rpc: Rpc::SetName { name: assigned },
                    },
                    include: None,
                    exclude: None,
                });
                self.advance_acting_host_handshake(inner, sender_id).await;
                false
            }
            Rpc::CheckColor { color } => {
                if inner.host != HostId::Server {
                    return true;
                }
                let taken: HashSet<u8> = inner
                    .players
                    .values()
                    .filter(|p| p.client_id != sender_id)
                    .map(|p| p.color)
                    .collect();
                let mut assigned = *color;
                while taken.contains(&assigned) {
                    assigned = (assigned + 1) % (protocol::MAX_COLOR_ID + 1);
                }
                if let Some(player) = inner.players.get_mut(&sender_id) {
                    player.color = assigned;
                }
                Self::sync_player_info(inner, sender_id);
                inner.outbound.push(OutboundEntry {
                    message: GameDataMessage::Rpc {
                        net_id,
                        rpc: Rpc::SetColor { color: assigned },
                    },
                    include: None,
                    exclude: None,
                });
                false
            }
            Rpc::SetName { name } => {
                if let Some(player) = inner.players.get_mut(&sender_id) {
                    player.name = name.clone();
                }
                Self::sync_player_info(inner, sender_id);
                true
            }
            Rpc::SetColor { color } => {
                if let Some(player) = inner.players.get_mut(&sender_id) {
                    player.color = *color;
                }
                Self::sync_player_info(inner, sender_id);
                true
            }
            Rpc::SetHat { hat } => {
                if let Some(player) = inner.players.get_mut(&sender_id) {
                    player.hat = *hat;
                }
                Self::sync_player_info(inner, sender_id);
                true
            }
            Rpc::SetPet { pet } => {
                if let Some(player) = inner.players.get_mut(&sender_id) {
                    player.pet = *pet;
                }
                Self::sync_player_info(inner, sender_id);
                true
            }
            Rpc::SetSkin { skin } => {
                if let Some(player) = inner.players.get_mut(&sender_id) {
                    player.skin = *skin;
                }
                Self::sync_player_info(inner, sender_id);
                true
            }
            Rpc::SyncSettings { settings } => {
                let adopted = self
                    .config
                    .enforce_settings
                    .clone()
                    .unwrap_or_else(|| settings.clone());
                inner.settings = adopted;
                true
            }
            Rpc::SendChat { message } => {
                if let Some(prefix) = self.config.chat_commands.prefix() {
                    if let Some(invocation) = chat::parse(prefix, message) {
                        let command = invocation.command.to_string();
                        let args: Vec<String> =
                            invocation.args.iter().map(|s| s.to_string()).collect();
                        self.run_chat_command(inner, sender, net_id, &command, &args, prefix)
                            .await;
                        return false;
                    }
                }
                true
            }
            Rpc::StartMeeting { .. } | Rpc::ReportDeadBody { .. } => {
                // A meeting needs its hud; spawn it if the host view has
                // not already.
                let exists = inner
                    .objects
                    .find(|k| matches!(k, ComponentKind::MeetingHud { .. }))
                    .is_some();
                if !exists && inner.host == HostId::Server {
                    let states: Vec<VoteArea> = inner
                        .players
                        .values()
                        .map(|p| VoteArea {
                            player_id: p.player_id,
                            voted_for: None,
                            did_report: p.client_id == sender_id,
                            is_dead: p.is_dead,
                        })
                        .collect();
                    let spawn = inner.objects.spawn_prefab(SpawnType::MeetingHud, OWNER_ROOM, 0);
                    if let Some(data) = spawn.components.first() {
                        if let Some(component) = inner.objects.get_mut(data.net_id) {
                            if let ComponentKind::MeetingHud { states: slot } = &mut component.kind {
                                *slot = states;
                            }
                        }
                    }
                    let spawn = Self::respawn_message(inner, &spawn);
                    inner.outbound.push(OutboundEntry {
                        message: GameDataMessage::Spawn(spawn),
                        include: None,
                        exclude: None,
                    });
                }
                true
            }
            Rpc::CastVote { voter, suspect } => {
                if let Some(component) = inner
                    .objects
                    .find_mut(|k| matches!(k, ComponentKind::MeetingHud { .. }))
                {
                    if let ComponentKind::MeetingHud { states } = &mut component.kind {
                        if let Some(state) = states.iter_mut().find(|s| s.player_id == *voter) {
                            state.voted_for = Some(*suspect);
                            component.dirty |= 1;
                        }
                    }
                }
                true
            }
            Rpc::ClearVote => {
                if let Some(component) = inner
                    .objects
                    .find_mut(|k| matches!(k, ComponentKind::MeetingHud { .. }))
                {
                    if let ComponentKind::MeetingHud { states } = &mut component.kind {
                        let player_id = inner
                            .players
                            .get(&sender_id)
                            .map(|p| p.player_id);
                        if let Some(player_id) = player_id {
                            if let Some(state) =
                                states.iter_mut().find(|s| s.player_id == player_id)
                            {
                                state.voted_for = None;
                                component.dirty |= 1;
                            }
                        }
                    }
                }
                true
            }
            Rpc::VotingComplete { exiled, .. } => {
                if *exiled != VOTE_SKIP {
                    Self::mark_dead_by_player_id(inner, *exiled);
                    Self::sync_player_info_by_player_id(inner, *exiled);
                    self.check_win_conditions(inner);
                }
                true
            }
            Rpc::Exiled => {
                Self::mark_dead_by_net_id(inner, net_id);
                self.check_win_conditions(inner);
                true
            }
            Rpc::MurderPlayer { target_net_id } => {
                Self::mark_dead_by_net_id(inner, *target_net_id);
                self.check_win_conditions(inner);
                true
            }
            Rpc::SetInfected { impostors } => {
                let ids: Vec<u32> = inner.players.keys().copied().collect();
                for client_id in ids {
                    let is_impostor = inner
                        .players
                        .get(&client_id)
                        .map(|p| impostors.contains(&p.player_id))
                        .unwrap_or(false);
                    if let Some(player) = inner.players.get_mut(&client_id) {
                        player.is_impostor = is_impostor;
                    }
                    Self::sync_player_info(inner, client_id);
                }
                true
            }
            Rpc::SetTasks { player_id, tasks } => {
                let client = inner
                    .players
                    .values()
                    .find(|p| p.player_id == *player_id)
                    .map(|p| p.client_id);
                if let Some(client_id) = client {
                    if let Some(player) = inner.players.get_mut(&client_id) {
                        player.tasks = tasks
                            .iter()
                            .map(|id| TaskState { id: *id as u32, complete: false })
                            .collect();
                    }
                    Self::sync_player_info(inner, client_id);
                }
                true
            }
            Rpc::CompleteTask { task } => {
                if let Some(player) = inner.players.get_mut(&sender_id) {
                    if let Some(state) = player.tasks.iter_mut().find(|t| t.id == *task) {
                        state.complete = true;
                    }
                }
                Self::sync_player_info(inner, sender_id);
                self.check_task_win(inner);
                true
            }
            Rpc::EnterVent { vent } => {
                if let Some(component) = inner.objects.get_mut(net_id) {
                    if let ComponentKind::PlayerPhysics { in_vent } = &mut component.kind {
                        *in_vent = Some(*vent);
                    }
                }
                true
            }
            Rpc::ExitVent { .. } | Rpc::BootFromVent { .. } => {
                if let Some(component) = inner.objects.get_mut(net_id) {
                    if let ComponentKind::PlayerPhysics { in_vent } = &mut component.kind {
                        *in_vent = None;
                    }
                }
                true
            }
            Rpc::SnapTo { position, sequence } => {
                if let Some(component) = inner.objects.get_mut(net_id) {
                    if let ComponentKind::NetworkTransform {
                        sequence: seq,
                        position: pos,
                        ..
                    } = &mut component.kind
                    {
                        *seq = *sequence;
                        *pos = *position;
                    }
                }
                true
            }
            Rpc::Close => {
                // Meeting over, the hud goes away.
                let hud = inner
                    .objects
                    .find(|k| matches!(k, ComponentKind::MeetingHud { .. }))
                    .map(|c| c.net_id);
                if let Some(hud_id) = hud {
                    inner.objects.despawn(hud_id);
                    inner.outbound.push(OutboundEntry {
                        message: GameDataMessage::Despawn { net_id: hud_id },
                        include: None,
                        exclude: None,
                    });
                }
                true
            }
            _ => true,
        }
    }

    fn mark_dead_by_net_id(inner: &mut RoomInner, net_id: u32) {
        let owner = inner.objects.get(net_id).map(|c| c.owner_id);
        if let Some(owner) = owner {
            if owner >= 0 {
                if let Some(player) = inner.players.get_mut(&(owner as u32)) {
                    player.is_dead = true;
                }
                Self::sync_player_info(inner, owner as u32);
            }
        }
    }

    fn mark_dead_by_player_id(inner: &mut RoomInner, player_id: u8) {
        let client = inner
            .players
            .values()
            .find(|p| p.player_id == player_id)
            .map(|p| p.client_id);
        if let Some(client_id) = client {
            if let Some(player) = inner.players.get_mut(&client_id) {
                player.is_dead = true;
            }
        }
    }

    fn sync_player_info_by_player_id(inner: &mut RoomInner, player_id: u8) {
        let client = inner
            .players
            .values()
            .find(|p| p.player_id == player_id)
            .map(|p| p.client_id);
        if let Some(client_id) = client {
            Self::sync_player_info(inner, client_id);
        }
    }

    /// Files end-game intents from the current life state. They are
    /// drained on the next tick, where listeners may still cancel.
    fn check_win_conditions(&self, inner: &mut RoomInner) {
        if inner.state != GameState::Started {
            return;
        }
        let alive_impostors = inner
            .players
            .values()
            .filter(|p| p.is_impostor && !p.is_dead)
            .count();
        let alive_crew = inner
            .players
            .values()
            .filter(|p| !p.is_impostor && !p.is_dead)
            .count();
        if alive_impostors == 0 {
            inner
                .end_game_intents
                .push(("impostors eliminated", GameOverReason::HumansByVote));
        } else if alive_crew <= alive_impostors {
            inner
                .end_game_intents
                .push(("crew outnumbered", GameOverReason::ImpostorByKill));
        }
    }

    fn check_task_win(&self, inner: &mut RoomInner) {
        if inner.state != GameState::Started {
            return;
        }
        let crew_done = inner
            .players
            .values()
            .filter(|p| !p.is_impostor)
            .all(|p| !p.tasks.is_empty() && p.tasks.iter().all(|t| t.complete));
        if crew_done {
            inner
                .end_game_intents
                .push(("tasks complete", GameOverReason::HumansByTask));
        }
    }

    /// One step of the acting host handshake, driven by the first waiting
    /// player's name check.
    async fn advance_acting_host_handshake(&self, inner: &mut RoomInner, sender_id: u32) {
        if inner.acting_host_waiting_for.first() != Some(&sender_id) {
            return;
        }
        inner.acting_host_waiting_for.remove(0);

        if !inner.finished_acting_host_transaction {
            inner.finished_acting_host_transaction = true;
            let code = self.code.as_int();
            let mut scene = PacketWriter::new();
            GameDataMessage::SceneChange {
                client_id: SERVER_HOST_ID,
                scene: "OnlineGame".into(),
            }
            .encode(&mut scene);
            let scene_payload = scene.into_bytes();
            let sends = inner
                .acting_host_ids
                .iter()
                .filter_map(|id| inner.connections.get(id).cloned())
                .map(|connection| {
                    let target = connection.client_id;
                    let payload = scene_payload.clone();
                    async move {
                        connection
                            .send_reliable(&[
                                ServerRootMessage::JoinGame {
                                    code,
                                    client_id: TEMP_CLIENT_ID,
                                    host_id: target,
                                },
                                ServerRootMessage::GameDataTo { code, target, payload },
                            ])
                            .await
                    }
                });
            join_all(sends).await;
        }

        // Views come back once nobody is waiting anymore.
        if inner.acting_host_waiting_for.is_empty() {
            self.broadcast_host_view(inner).await;
        }
    }

    // ------------------------------------------------------------------
    // Chat commands
    // ------------------------------------------------------------------

    async fn run_chat_command(
        self: &Arc<Self>,
        inner: &mut RoomInner,
        sender: &Arc<Connection>,
        net_id: u32,
        command: &str,
        args: &[String],
        prefix: &str,
    ) {
        let reply = match command {
            "help" => Ok(chat::help_text(prefix)),
            "kick" | "ban" => match args.first() {
                None => Err(format!("usage: {prefix}{command} <name>")),
                Some(name) => {
                    let target = inner
                        .players
                        .values()
                        .find(|p| p.name == *name)
                        .map(|p| p.client_id);
                    match target {
                        None => Err(format!("no player named {name}")),
                        Some(_) if command == "ban" => {
                            // Runs outside the lock; answer optimistically.
                            let room = self.clone();
                            let sender_id = sender.client_id;
                            let name_for_task = name.clone();
                            let note = (args.len() > 1).then(|| args[1..].join(" "));
                            tokio::spawn(async move {
                                let result = room
                                    .ban_by_name(sender_id, &name_for_task, note.as_deref())
                                    .await;
                                if let Err(err) = result {
                                    tracing::debug!(room = %room.code, %err, "Chat ban failed.");
                                }
                            });
                            Ok(format!("{name} will be banned"))
                        }
                        Some(target_id) => {
                            let room = self.clone();
                            let sender_id = sender.client_id;
                            tokio::spawn(async move {
                                if let Err(err) =
                                    room.kick_player(sender_id, target_id, false, None).await
                                {
                                    tracing::debug!(room = %room.code, %err, "Chat kick failed.");
                                }
                            });
                            Ok(format!("{name} was kicked"))
                        }
                    }
                }
            },
            other => Err(format!("unknown command {prefix}{other}")),
        };

        let text = match reply {
            Ok(text) => text,
            Err(text) => text,
        };
        self.send_server_chat(inner, sender, net_id, &text).await;
    }

    /// Answers one player as the configured server persona: temporarily
    /// rename their own player, speak, rename back.
    async fn send_server_chat(
        &self,
        inner: &RoomInner,
        target: &Arc<Connection>,
        net_id: u32,
        text: &str,
    ) {
        let original_name = inner
            .players
            .get(&target.client_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let persona = &self.config.server_player;
        let mut writer = PacketWriter::new();
        for rpc in [
            Rpc::SetName { name: persona.name.clone() },
            Rpc::SendChat { message: text.to_string() },
            Rpc::SetName { name: original_name },
        ] {
            GameDataMessage::Rpc { net_id, rpc }.encode(&mut writer);
        }
        target
            .send_reliable(&[ServerRootMessage::GameDataTo {
                code: self.code.as_int(),
                target: target.client_id,
                payload: writer.into_bytes(),
            }])
            .await;
    }

    // ------------------------------------------------------------------
    // Fixed tick
    // ------------------------------------------------------------------

    /// One fixed tick: timers, dirty component serialization, end game
    /// intents, stream flush.
    pub async fn fixed_update(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let delta = now.duration_since(inner.last_fixed_update).as_secs_f32();
        inner.last_fixed_update = now;

        // An empty room that nobody ever joined expires.
        if !inner.ever_joined
            && now.duration_since(inner.created_at).as_secs_f32() >= self.config.create_timeout
        {
            drop(inner);
            self.destroy(false).await;
            return;
        }

        // Stragglers who never reported ready get removed and the game
        // setup proceeds without them.
        if let Some(deadline) = inner.start_ready_deadline {
            if now >= deadline {
                inner.start_ready_deadline = None;
                let stragglers: Vec<u32> = inner
                    .players
                    .values()
                    .filter(|p| !p.is_ready)
                    .map(|p| p.client_id)
                    .collect();
                drop(inner);
                for client_id in stragglers {
                    if let Some(connection) = self.connection(client_id).await {
                        connection.disconnect(DisconnectReason::Error, None).await;
                    }
                    self.leave(client_id, DisconnectReason::Error).await;
                }
                if self.is_destroyed() {
                    return;
                }
                inner = self.inner.lock().await;
                self.setup_started_game(&mut inner).await;
            }
        }

        // Dirty replicated state becomes data messages on the stream.
        let dirty = inner.objects.drain_dirty(delta);
        for (net_id, payload) in dirty {
            inner.outbound.push(OutboundEntry {
                message: GameDataMessage::Data { net_id, payload },
                include: None,
                exclude: None,
            });
        }

        // End game intents: the first one nobody cancels wins.
        let intents = std::mem::take(&mut inner.end_game_intents);
        let mut winner: Option<GameOverReason> = None;
        for (intent, reason) in intents {
            let mut event = EndGameIntentEvent::new(self.code, intent);
            self.hub.emit_serial(&mut event, |l, e| l.on_end_game_intent(e));
            if !event.is_cancelled() {
                winner = Some(reason);
                break;
            }
        }
        if let Some(reason) = winner {
            drop(inner);
            self.end_game(reason as u8).await;
            return;
        }

        let mut event = FixedUpdateEvent::new(self.code);
        self.hub.emit_serial(&mut event, |l, e| l.on_fixed_update(e));
        if event.is_cancelled() {
            return;
        }

        let entries = std::mem::take(&mut inner.outbound);
        if !entries.is_empty() {
            self.flush_outbound(&inner, entries).await;
        }
    }

    async fn connection(&self, client_id: u32) -> Option<Arc<Connection>> {
        self.inner.lock().await.connections.get(&client_id).cloned()
    }

    /// Fan-out of the queued stream: per recipient event hook, filtering,
    /// enveloping, one coalesced reliable packet each.
    async fn flush_outbound(&self, inner: &RoomInner, entries: Vec<OutboundEntry>) {
        let code = self.code.as_int();
        let mut sends = Vec::new();
        for connection in inner.connections.values() {
            let recipient = connection.client_id;
            // Select what this recipient gets.
            let selected: Vec<&OutboundEntry> = entries
                .iter()
                .filter(|entry| {
                    if entry.exclude == Some(recipient) {
                        return false;
                    }
                    match &entry.include {
                        Some(targets) => targets.contains(&recipient),
                        None => true,
                    }
                })
                .collect();
            if selected.is_empty() {
                continue;
            }

            // Clients still loading get targeted catch-up data only; the
            // scene change hands them a full snapshot anyway.
            let in_scene = inner
                .players
                .get(&recipient)
                .map(|p| p.in_scene)
                .unwrap_or(false);
            let untargeted: Vec<GameDataMessage> = if in_scene {
                selected
                    .iter()
                    .filter(|e| e.include.is_none())
                    .map(|e| e.message.clone())
                    .collect()
            } else {
                Vec::new()
            };
            let targeted: Vec<GameDataMessage> = selected
                .iter()
                .filter(|e| e.include.is_some())
                .map(|e| e.message.clone())
                .collect();

            let mut event = BroadcastEvent::new(self.code, recipient, untargeted);
            self.hub.emit_serial(&mut event, |l, e| l.on_client_broadcast(e));
            if event.is_cancelled() {
                continue;
            }

            let mut roots = Vec::new();
            if !event.altered_game_data.is_empty() {
                let mut writer = PacketWriter::new();
                for message in &event.altered_game_data {
                    message.encode(&mut writer);
                }
                roots.push(ServerRootMessage::GameData { code, payload: writer.into_bytes() });
            }
            if !targeted.is_empty() {
                let mut writer = PacketWriter::new();
                for message in &targeted {
                    message.encode(&mut writer);
                }
                roots.push(ServerRootMessage::GameDataTo {
                    code,
                    target: recipient,
                    payload: writer.into_bytes(),
                });
            }
            if roots.is_empty() {
                continue;
            }
            let connection = connection.clone();
            sends.push(async move { connection.send_reliable(&roots).await });
        }
        join_all(sends).await;
    }

    /// Marks every present player ready-checked and builds the started
    /// game: ship, impostors, tasks.
    async fn maybe_finish_start(&self, inner: &mut RoomInner) {
        if inner.start_ready_deadline.is_none() {
            return;
        }
        let all_ready = inner.players.values().all(|p| p.is_ready);
        if all_ready {
            inner.start_ready_deadline = None;
            self.setup_started_game(inner).await;
        }
    }

    async fn setup_started_game(&self, inner: &mut RoomInner) {
        // Lobby furniture goes away.
        let lobby = inner
            .objects
            .find(|k| matches!(k, ComponentKind::LobbyBehaviour))
            .map(|c| c.net_id);
        if let Some(net_id) = lobby {
            inner.objects.despawn(net_id);
            inner.outbound.push(OutboundEntry {
                message: GameDataMessage::Despawn { net_id },
                include: None,
                exclude: None,
            });
        }

        // The map's ship.
        let ship_type = SpawnType::for_map(inner.settings.map);
        let spawn = inner.objects.spawn_prefab(ship_type, OWNER_ROOM, 0);
        inner.outbound.push(OutboundEntry {
            message: GameDataMessage::Spawn(spawn),
            include: None,
            exclude: None,
        });

        // Impostor assignment.
        let mut player_ids: Vec<u8> = inner.players.values().map(|p| p.player_id).collect();
        {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            player_ids.shuffle(&mut rng);
        }
        let impostor_count = (inner.settings.num_impostors as usize).min(player_ids.len());
        let impostors: Vec<u8> = player_ids.into_iter().take(impostor_count).collect();
        let clients: Vec<u32> = inner.players.keys().copied().collect();
        for client_id in &clients {
            let impostor = inner
                .players
                .get(client_id)
                .map(|p| impostors.contains(&p.player_id))
                .unwrap_or(false);
            if let Some(player) = inner.players.get_mut(client_id) {
                player.is_impostor = impostor;
            }
            Self::sync_player_info(inner, *client_id);
        }
        if let Some(host_control) = Self::any_player_control(inner) {
            inner.outbound.push(OutboundEntry {
                message: GameDataMessage::Rpc {
                    net_id: host_control,
                    rpc: Rpc::SetInfected { impostors: impostors.clone() },
                },
                include: None,
                exclude: None,
            });
        }

        // Task assignment.
        let task_count = inner.settings.num_common_tasks
            + inner.settings.num_long_tasks
            + inner.settings.num_short_tasks;
        for client_id in &clients {
            let (player_id, control) = {
                let Some(player) = inner.players.get(client_id) else { continue };
                (player.player_id, Self::player_control_of(inner, *client_id))
            };
            let tasks: Vec<u8> = (1..=task_count).collect();
            if let Some(player) = inner.players.get_mut(client_id) {
                player.tasks = tasks
                    .iter()
                    .map(|id| TaskState { id: *id as u32, complete: false })
                    .collect();
            }
            Self::sync_player_info(inner, *client_id);
            if let Some(control) = control {
                inner.outbound.push(OutboundEntry {
                    message: GameDataMessage::Rpc {
                        net_id: control,
                        rpc: Rpc::SetTasks { player_id, tasks },
                    },
                    include: None,
                    exclude: None,
                });
            }
        }
        tracing::info!(room = %self.code, impostors = impostor_count, "Game set up.");
    }

    fn any_player_control(inner: &RoomInner) -> Option<u32> {
        inner
            .objects
            .find(|k| matches!(k, ComponentKind::PlayerControl { .. }))
            .map(|c| c.net_id)
    }

    fn player_control_of(inner: &RoomInner, client_id: u32) -> Option<u32> {
        inner
            .objects
            .find_owned(client_id as i32, |k| {
                matches!(k, ComponentKind::PlayerControl { .. })
            })
            .map(|c| c.net_id)
    }

    // ------------------------------------------------------------------
    // Destruction
    // ------------------------------------------------------------------

    /// Tears the room down. With `notify` the remaining connections get a
    /// remove-game notice and a disconnect first.
    pub async fn destroy(self: &Arc<Self>, notify: bool) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.hub.emit(&self.code, |l, c| l.on_before_destroy(*c));

        let mut inner = self.inner.lock().await;
        inner.state = GameState::Destroyed;
        let connections: Vec<Arc<Connection>> = inner.connections.values().cloned().collect();
        inner.connections.clear();
        inner.players.clear();
        let batch = inner.anticheat.drain();
        drop(inner);

        if notify {
            let sends = connections.iter().map(|connection| {
                let connection = connection.clone();
                async move {
                    connection
                        .send_reliable(&[ServerRootMessage::RemoveGame {
                            reason: DisconnectReason::Destroy as u8,
                        }])
                        .await;
                    connection.disconnect(DisconnectReason::Destroy, None).await;
                }
            });
            join_all(sends).await;
        }
        for connection in &connections {
            connection.clear_room();
        }

        self.stamp_and_flush(batch).await;
        self.hub.emit(&self.code, |l, c| l.on_destroy(*c));
        tracing::info!(room = %self.code, "Room destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use tokio::time::{advance, timeout};

    use protocol::packets::{HelloInfo, Packet};
    use protocol::{Language, Platform};

    use crate::auth::NullAuth;
    use crate::metrics::testing::RecordingMetrics;
    use crate::transport::{Transport, TransportEvent};

    struct TestEnv {
        transport: Arc<Transport>,
        _events: mpsc::UnboundedReceiver<TransportEvent>,
        metrics: Arc<RecordingMetrics>,
        room: Arc<Room>,
    }

    async fn env(mutate: impl FnOnce(&mut crate::config::ServerConfig)) -> TestEnv {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport::new(socket, tx));
        let mut config = crate::config::ServerConfig::default();
        mutate(&mut config);
        let metrics = Arc::new(RecordingMetrics::default());
        let room = Room::new(
            GameCode::parse("ABCDEF").unwrap(),
            GameSettings::default(),
            Arc::new(config),
            EventHub::new(),
            metrics.clone(),
            Arc::new(NullAuth),
            DecoderTable::default(),
        );
        TestEnv { transport, _events: rx, metrics, room }
    }

    fn connect(env: &TestEnv, client_id: u32, addr: SocketAddr) -> Arc<Connection> {
        let peer = env.transport.peer_or_create(addr);
        let hello = HelloInfo {
            protocol_version: 1,
            client_version: 1,
            username: format!("user{client_id}"),
            language: Language::English,
            chat_mode: 0,
            platform: Platform::Unknown,
            platform_name: "Test".into(),
        };
        Arc::new(Connection::new(client_id, peer, &hello))
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    async fn join(env: &TestEnv, client_id: u32, port: u16) -> Arc<Connection> {
        let connection = connect(env, client_id, addr(port));
        env.room
            .join(connection.clone(), addr(port).ip())
            .await
            .unwrap();
        connection
    }

    #[tokio::test]
    async fn saah_first_join_promotes_acting_host() {
        let env = env(|c| c.server_as_host = true).await;
        join(&env, 1001, 40001).await;

        let inner = env.room.inner.lock().await;
        assert_eq!(inner.host, HostId::Server);
        assert!(inner.acting_host_ids.contains(&1001));
        // The acting host sees itself as host, everyone else the server.
        assert_eq!(Room::host_view_for(&inner, 1001), 1001);
        assert_eq!(Room::host_view_for(&inner, 9999), SERVER_HOST_ID);
    }

    #[tokio::test]
    async fn acting_host_handshake_runs_once_and_adopts_settings() {
        let env = env(|c| c.server_as_host = true).await;
        let alice = join(&env, 1001, 40001).await;

        env.room.apply_scene_change(&alice, "OnlineGame").await;
        let control = {
            let inner = env.room.inner.lock().await;
            // Views are held back while the handshake is pending.
            assert_eq!(inner.acting_host_waiting_for, vec![1001]);
            assert_eq!(Room::host_view_for(&inner, 1001), SERVER_HOST_ID);
            Room::player_control_of(&inner, 1001).unwrap()
        };

        env.room
            .apply_rpc(&alice, control, Rpc::CheckName { name: "Alice".into() }, None)
            .await;
        {
            let inner = env.room.inner.lock().await;
            assert!(inner.finished_acting_host_transaction);
            assert!(inner.acting_host_waiting_for.is_empty());
            assert_eq!(Room::host_view_for(&inner, 1001), 1001);
            assert_eq!(inner.players.get(&1001).unwrap().name, "Alice");
        }

        let mut settings = GameSettings::default();
        settings.num_impostors = 2;
        settings.is_defaults = false;
        env.room
            .apply_rpc(&alice, control, Rpc::SyncSettings { settings: settings.clone() }, None)
            .await;
        let inner = env.room.inner.lock().await;
        assert_eq!(inner.settings, settings);
    }

    #[tokio::test]
    async fn classic_host_migration_on_leave() {
        let env = env(|c| c.server_as_host = false).await;
        join(&env, 1001, 40001).await;
        join(&env, 1002, 40002).await;

        {
            let inner = env.room.inner.lock().await;
            assert_eq!(inner.host, HostId::Client(1001));
        }

        let destroyed = env.room.leave(1001, DisconnectReason::ExitGame).await;
        assert!(!destroyed);

        let inner = env.room.inner.lock().await;
        assert_eq!(inner.host, HostId::Client(1002));
        assert!(!inner.connections.contains_key(&1001));
        assert_eq!(Room::host_view_for(&inner, 1002), 1002);
    }

    #[tokio::test]
    async fn destroy_on_last_leave_flushes_metrics() {
        let env = env(|_| {}).await;
        let alice = join(&env, 1001, 40001).await;

        let destroyed = env.room.leave(1001, DisconnectReason::ExitGame).await;
        assert!(destroyed);
        assert!(env.room.is_destroyed());
        assert!(alice.room().is_none());
        assert_eq!(env.metrics.flushed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_expires_after_create_timeout() {
        let env = env(|c| c.create_timeout = 1.0).await;

        advance(Duration::from_millis(900)).await;
        env.room.fixed_update().await;
        assert!(!env.room.is_destroyed());

        advance(Duration::from_millis(200)).await;
        env.room.fixed_update().await;
        assert!(env.room.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_player_is_force_removed_and_game_sets_up() {
        let env = env(|c| c.server_as_host = true).await;
        join(&env, 1001, 40001).await;
        join(&env, 1002, 40002).await;

        env.room.handle_start(1001).await;
        {
            let mut inner = env.room.inner.lock().await;
            assert_eq!(inner.state, GameState::Started);
            assert!(inner.start_ready_deadline.is_some());
            inner.players.get_mut(&1001).unwrap().is_ready = true;
        }

        advance(Duration::from_millis(3100)).await;
        env.room.fixed_update().await;

        let inner = env.room.inner.lock().await;
        assert!(!inner.connections.contains_key(&1002), "straggler removed");
        assert!(inner.connections.contains_key(&1001));
        assert!(inner
            .objects
            .find(|k| matches!(k, ComponentKind::ShipStatus { .. }))
            .is_some());
        let impostors = inner.players.values().filter(|p| p.is_impostor).count();
        assert_eq!(impostors, 1);
    }

    #[tokio::test]
    async fn crewmate_vent_rpc_changes_nothing_and_is_recorded() {
        let env = env(|c| c.server_as_host = true).await;
        let _alice = join(&env, 1001, 40001).await;
        let bob = join(&env, 1002, 40002).await;

        let physics = {
            let mut inner = env.room.inner.lock().await;
            inner.state = GameState::Started;
            inner.outbound.clear();
            let spawn = inner.objects.spawn_prefab(SpawnType::Player, 1002, 0);
            spawn.components[1].net_id
        };

        env.room
            .apply_rpc(&bob, physics, Rpc::EnterVent { vent: 0 }, None)
            .await;

        let inner = env.room.inner.lock().await;
        match &inner.objects.get(physics).unwrap().kind {
            ComponentKind::PlayerPhysics { in_vent } => assert_eq!(*in_vent, None),
            other => panic!("expected physics, got {other:?}"),
        }
        assert_eq!(inner.anticheat.buffered(), 1);
        assert!(inner.outbound.is_empty(), "suppressed rpc is not forwarded");
    }

    #[tokio::test]
    async fn movement_update_rate_forwards_every_third_packet() {
        let env = env(|c| {
            c.server_as_host = true;
            c.optimizations.movement.update_rate = 3;
        })
        .await;
        let alice = join(&env, 1001, 40001).await;

        // Bob listens on a real socket so forwarded datagrams can be
        // counted.
        let bob_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob_addr = bob_socket.local_addr().unwrap();
        let bob = connect(&env, 1002, bob_addr);
        env.room.join(bob, bob_addr.ip()).await.unwrap();

        let transform = {
            let mut inner = env.room.inner.lock().await;
            let spawn = inner.objects.spawn_prefab(SpawnType::Player, 1001, 0);
            spawn.components[2].net_id
        };

        for step in 0..9u16 {
            let mut writer = PacketWriter::new();
            writer.write_u16(step + 1);
            writer.write_vector2(Vector2::new(0.0, step as f32));
            writer.write_vector2(Vector2::default());
            env.room
                .apply_data(&alice, transform, writer.into_bytes())
                .await;
        }

        let mut forwarded = 0;
        let mut buf = [0u8; 1024];
        while let Ok(Ok((len, _))) =
            timeout(Duration::from_millis(50), bob_socket.recv_from(&mut buf)).await
        {
            if matches!(Packet::decode(&buf[..len]), Ok(Packet::Unreliable { .. })) {
                forwarded += 1;
            }
        }
        assert_eq!(forwarded, 3, "9 packets at rate 3 forward 3");
    }

    #[tokio::test]
    async fn ended_room_parks_joiners_until_the_host_returns() {
        let env = env(|c| c.server_as_host = false).await;
        join(&env, 1001, 40001).await;
        let bob = connect(&env, 1002, addr(40002));
        {
            let mut inner = env.room.inner.lock().await;
            inner.state = GameState::Ended;
        }

        env.room.join(bob.clone(), addr(40002).ip()).await.unwrap();
        {
            let inner = env.room.inner.lock().await;
            assert!(inner.waiting_for_host.contains(&1002));
            assert_eq!(inner.state, GameState::Ended);
        }

        // The host rejoining reopens the lobby and releases the waiters.
        let alice = {
            let inner = env.room.inner.lock().await;
            inner.connections.get(&1001).unwrap().clone()
        };
        env.room.join(alice, addr(40001).ip()).await.unwrap();
        let inner = env.room.inner.lock().await;
        assert_eq!(inner.state, GameState::NotStarted);
        assert!(inner.waiting_for_host.is_empty());
    }

    #[tokio::test]
    async fn banned_address_cannot_join() {
        let env = env(|_| {}).await;
        join(&env, 1001, 40001).await;
        {
            let mut inner = env.room.inner.lock().await;
            inner.banned_addresses.insert(addr(40002).ip());
        }
        // Different port, same address.
        let bob = connect(&env, 1002, addr(40002));
        let result = env.room.join(bob, addr(40002).ip()).await;
        assert_eq!(result, Err(DisconnectReason::Banned));
    }
}
