//! Server configuration, read from `ServerConfig.json` next to the binary.
//! It provides:
//! - [`ServerConfig`]: every recognized room and worker option
//! - [`load_config`] / [`reload_config`]: hot-reloading without a restart
//!
//! Missing fields fall back to their defaults, so an empty file is a valid
//! configuration.

use std::sync::Arc;

use serde::Deserialize;
use tokio::fs;
use tokio::sync::RwLock;

use protocol::settings::GameSettings;

/// File the configuration is read from.
pub const CONFIG_FILE: &str = "ServerConfig.json";

/// Chat command switch: plain bool or an object carrying the prefix.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatCommandConfig {
    Enabled(bool),
    Prefixed { prefix: String },
}

impl Default for ChatCommandConfig {
    fn default() -> Self {
        ChatCommandConfig::Enabled(true)
    }
}

impl ChatCommandConfig {
    pub fn prefix(&self) -> Option<&str> {
        match self {
            ChatCommandConfig::Enabled(true) => Some("/"),
            ChatCommandConfig::Enabled(false) => None,
            ChatCommandConfig::Prefixed { prefix } => Some(prefix),
        }
    }
}

/// An unknown-prefab entry: numeric spawn type or a prefab name.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UnknownObjectId {
    Id(u32),
    Name(String),
}

/// What to do with spawn messages for templates we do not know.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UnknownObjectPolicy {
    /// `false`: reject, `true`: materialize unknown templates.
    Flag(bool),
    /// `"all"`: also materialize known-but-unregistered templates.
    Mode(String),
    /// Only the listed templates are materialized.
    List(Vec<UnknownObjectId>),
}

impl Default for UnknownObjectPolicy {
    fn default() -> Self {
        UnknownObjectPolicy::Flag(false)
    }
}

impl UnknownObjectPolicy {
    /// Whether a spawn of the given unknown template may be materialized.
    pub fn allows(&self, spawn_type: u32) -> bool {
        match self {
            UnknownObjectPolicy::Flag(flag) => *flag,
            UnknownObjectPolicy::Mode(mode) => mode == "all",
            UnknownObjectPolicy::List(entries) => entries.iter().any(|entry| match entry {
                UnknownObjectId::Id(id) => *id == spawn_type,
                // Names would need a registry lookup; numeric ids cover the
                // practical cases, names only match their decimal form.
                UnknownObjectId::Name(name) => name.parse::<u32>() == Ok(spawn_type),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvancedConfig {
    pub unknown_objects: UnknownObjectPolicy,
}

/// Movement fan-out tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MovementConfig {
    /// Forward every n-th movement packet per sender. 1 forwards all.
    pub update_rate: u32,
    /// Skip recipients further than vision range from the sender.
    pub vision_checks: bool,
    /// Do not leak ghost movement to living players.
    pub dead_checks: bool,
    /// Serialize once and reuse the buffer for every recipient.
    pub reuse_buffer: bool,
}

impl Default for MovementConfig {
    fn default() -> Self {
        MovementConfig {
            update_rate: 1,
            vision_checks: false,
            dead_checks: false,
            reuse_buffer: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizationsConfig {
    pub movement: MovementConfig,
}

/// Cosmetic identity used when the server itself speaks in chat.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerPlayerConfig {
    pub name: String,
    pub color: u8,
    pub hat: u32,
    pub skin: u32,
}

impl Default for ServerPlayerConfig {
    fn default() -> Self {
        ServerPlayerConfig {
            name: "<color=yellow>[Server]</color>".into(),
            color: 5,
            hat: 0,
            skin: 0,
        }
    }
}

/// Which fields the diagnostic formatters print, in order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormatConfig {
    pub format: Vec<String>,
}

impl FormatConfig {
    fn of(fields: &[&str]) -> Self {
        FormatConfig {
            format: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        FormatConfig::of(&["code", "state", "players", "host"])
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub rooms: FormatConfig,
    pub players: FormatConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            rooms: FormatConfig::default(),
            players: FormatConfig::of(&["name", "clientId", "ping"]),
        }
    }
}

/// The whole configuration surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// UDP address the game socket binds to.
    pub bind: String,
    /// TCP address of the admin pages.
    pub admin_bind: String,
    /// Whether new rooms run with the server as the authoritative host.
    pub server_as_host: bool,
    /// Seconds a room may sit empty before it is destroyed.
    pub create_timeout: f32,
    pub chat_commands: ChatCommandConfig,
    /// When set, overrides whatever settings hosts propose.
    pub enforce_settings: Option<GameSettings>,
    pub advanced: AdvancedConfig,
    pub optimizations: OptimizationsConfig,
    pub server_player: ServerPlayerConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:22023".into(),
            admin_bind: "127.0.0.1:8080".into(),
            server_as_host: false,
            create_timeout: 10.0,
            chat_commands: ChatCommandConfig::default(),
            enforce_settings: None,
            advanced: AdvancedConfig::default(),
            optimizations: OptimizationsConfig::default(),
            server_player: ServerPlayerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Loads the configuration file. A missing file yields the defaults, a
/// present but broken file is an error so typos do not silently reset a
/// production server.
pub async fn load_config() -> Result<ServerConfig, String> {
    let json_content = match fs::read_to_string(CONFIG_FILE).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ServerConfig::default());
        }
        Err(err) => return Err(format!("Failed to read {CONFIG_FILE}: {err}")),
    };
    serde_json::from_str(&json_content).map_err(|err| format!("Failed to parse {CONFIG_FILE}: {err}"))
}

/// Reloads the config into the shared slot. Rooms pick the new value up
/// on their next access; already-running games keep their settings.
pub async fn reload_config(slot: &RwLock<Arc<ServerConfig>>) -> Result<Arc<ServerConfig>, String> {
    let fresh = Arc::new(load_config().await?);
    let mut current = slot.write().await;
    *current = fresh.clone();
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_all_defaults() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.server_as_host);
        assert_eq!(config.create_timeout, 10.0);
        assert_eq!(config.chat_commands.prefix(), Some("/"));
        assert_eq!(config.optimizations.movement.update_rate, 1);
    }

    #[test]
    fn chat_commands_accepts_bool_and_object() {
        let off: ServerConfig = serde_json::from_str(r#"{"chatCommands": false}"#).unwrap();
        assert_eq!(off.chat_commands.prefix(), None);

        let custom: ServerConfig =
            serde_json::from_str(r#"{"chatCommands": {"prefix": "!"}}"#).unwrap();
        assert_eq!(custom.chat_commands.prefix(), Some("!"));
    }

    #[test]
    fn unknown_objects_accepts_all_three_shapes() {
        let flag: AdvancedConfig = serde_json::from_str(r#"{"unknownObjects": true}"#).unwrap();
        assert!(flag.unknown_objects.allows(77));

        let all: AdvancedConfig = serde_json::from_str(r#"{"unknownObjects": "all"}"#).unwrap();
        assert!(all.unknown_objects.allows(3));

        let list: AdvancedConfig =
            serde_json::from_str(r#"{"unknownObjects": [12, "13"]}"#).unwrap();
        assert!(list.unknown_objects.allows(12));
        assert!(list.unknown_objects.allows(13));
        assert!(!list.unknown_objects.allows(14));
    }

    #[test]
    fn movement_overrides_merge_with_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"optimizations": {"movement": {"updateRate": 3, "visionChecks": true}}}"#,
        )
        .unwrap();
        let movement = &config.optimizations.movement;
        assert_eq!(movement.update_rate, 3);
        assert!(movement.vision_checks);
        assert!(!movement.dead_checks);
        assert!(movement.reuse_buffer);
    }
}
