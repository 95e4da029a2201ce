//! Wire protocol shared between the session server and its clients.
//! Contains the binary codec, room codes, game settings and the typed
//! message layers (transport packets, root messages, game data messages,
//! remote procedure calls). The ids in here are part of the client contract
//! and must stay bit exact.

pub mod codec;
pub mod code;
pub mod game;
pub mod packets;
pub mod rpc;
pub mod settings;

pub use code::{GameCode, PUBLIC_POOL_CODE};
pub use codec::{DecodeError, PacketReader, PacketWriter, Vector2};

use serde::{Deserialize, Serialize};

/// Why a peer got disconnected. The numeric values travel on the wire and
/// are displayed by stock clients, so they must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    ExitGame = 0,
    GameFull = 1,
    GameStarted = 2,
    GameNotFound = 3,
    IncorrectVersion = 5,
    Banned = 6,
    Kicked = 7,
    Custom = 8,
    InvalidName = 9,
    Hacking = 10,
    NotAuthorized = 11,
    Destroy = 16,
    Error = 17,
    IncorrectGame = 18,
    ServerRequest = 19,
    ServerFull = 20,
}

impl DisconnectReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        use DisconnectReason::*;
        Some(match value {
            0 => ExitGame,
            1 => GameFull,
            2 => GameStarted,
            3 => GameNotFound,
            5 => IncorrectVersion,
            6 => Banned,
            7 => Kicked,
            8 => Custom,
            9 => InvalidName,
            10 => Hacking,
            11 => NotAuthorized,
            16 => Destroy,
            17 => Error,
            18 => IncorrectGame,
            19 => ServerRequest,
            20 => ServerFull,
            _ => return None,
        })
    }
}

/// The map a game plays on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum GameMap {
    Skeld = 0,
    MiraHq = 1,
    Polus = 2,
    AprilSkeld = 3,
    Airship = 4,
}

impl GameMap {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => GameMap::Skeld,
            1 => GameMap::MiraHq,
            2 => GameMap::Polus,
            3 => GameMap::AprilSkeld,
            4 => GameMap::Airship,
            _ => return None,
        })
    }
}

/// Client language reported in the hello handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Language {
    English = 0,
    Latam = 1,
    Brazilian = 2,
    Portuguese = 3,
    Korean = 4,
    Russian = 5,
    Dutch = 6,
    Filipino = 7,
    French = 8,
    German = 9,
    Italian = 10,
    Japanese = 11,
    Spanish = 12,
    SimplifiedChinese = 13,
    TraditionalChinese = 14,
    Irish = 15,
}

impl Language {
    /// Unknown values fall back to English rather than failing the hello.
    pub fn from_u32(value: u32) -> Self {
        use Language::*;
        match value {
            1 => Latam,
            2 => Brazilian,
            3 => Portuguese,
            4 => Korean,
            5 => Russian,
            6 => Dutch,
            7 => Filipino,
            8 => French,
            9 => German,
            10 => Italian,
            11 => Japanese,
            12 => Spanish,
            13 => SimplifiedChinese,
            14 => TraditionalChinese,
            15 => Irish,
            _ => English,
        }
    }
}

/// Platform the client runs on, reported in the hello handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Platform {
    Unknown = 0,
    StandaloneSteam = 1,
    StandaloneMac = 2,
    StandaloneEpicPc = 3,
    StandaloneWin10 = 4,
    StandaloneItch = 5,
    IPhone = 6,
    Android = 7,
    Switch = 8,
    Xbox = 9,
    Playstation = 10,
}

impl Platform {
    pub fn from_u8(value: u8) -> Self {
        use Platform::*;
        match value {
            1 => StandaloneSteam,
            2 => StandaloneMac,
            3 => StandaloneEpicPc,
            4 => StandaloneWin10,
            5 => StandaloneItch,
            6 => IPhone,
            7 => Android,
            8 => Switch,
            9 => Xbox,
            10 => Playstation,
            _ => Unknown,
        }
    }
}

/// Replicated object templates. The id selects which component set a spawn
/// message materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SpawnType {
    ShipStatus = 0,
    MeetingHud = 1,
    LobbyBehaviour = 2,
    GameData = 3,
    Player = 4,
    Headquarters = 5,
    PlanetMap = 6,
    AprilShipStatus = 7,
    Airship = 8,
}

impl SpawnType {
    pub fn from_u32(value: u32) -> Option<Self> {
        use SpawnType::*;
        Some(match value {
            0 => ShipStatus,
            1 => MeetingHud,
            2 => LobbyBehaviour,
            3 => GameData,
            4 => Player,
            5 => Headquarters,
            6 => PlanetMap,
            7 => AprilShipStatus,
            8 => Airship,
            _ => return None,
        })
    }

    /// The ship template used by a given map.
    pub fn for_map(map: GameMap) -> Self {
        match map {
            GameMap::Skeld => SpawnType::ShipStatus,
            GameMap::MiraHq => SpawnType::Headquarters,
            GameMap::Polus => SpawnType::PlanetMap,
            GameMap::AprilSkeld => SpawnType::AprilShipStatus,
            GameMap::Airship => SpawnType::Airship,
        }
    }
}

/// Spawn flag marking the object as the receiving client's own character.
pub const SPAWN_FLAG_CLIENT_CHARACTER: u8 = 0x01;

/// Owner id of objects owned by the room itself rather than a client.
pub const OWNER_ROOM: i32 = -2;
/// Owner sentinel meaning "the connection this message arrived on".
pub const OWNER_SENDER: i32 = -1;

/// The client id rooms report when the server itself is the host.
pub const SERVER_HOST_ID: u32 = u32::MAX - 1;
/// Throwaway client id used by the paired join/remove host view update.
pub const TEMP_CLIENT_ID: u32 = u32::MAX - 2;

/// How an ended game is reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GameOverReason {
    HumansByVote = 0,
    HumansByTask = 1,
    ImpostorByVote = 2,
    ImpostorByKill = 3,
    ImpostorBySabotage = 4,
    ImpostorDisconnect = 5,
    HumansDisconnect = 6,
}

/// Sub-command of the alter game root message that flips room privacy.
pub const ALTER_GAME_PRIVACY: u8 = 1;

/// Highest color id stock clients can select.
pub const MAX_COLOR_ID: u8 = 17;
/// Highest free hat id; anything above needs inventory ownership.
pub const MAX_FREE_HAT_ID: u32 = 94;
/// Highest free pet id; anything above needs inventory ownership.
pub const MAX_FREE_PET_ID: u32 = 17;
/// Highest free skin id; anything above needs inventory ownership.
pub const MAX_FREE_SKIN_ID: u32 = 15;
