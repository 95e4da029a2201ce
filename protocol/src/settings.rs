//! Game settings as proposed by hosts and replicated to every client.
//! The wire form is a packed-length prefixed block whose layout grew over
//! protocol versions; versions 1 through 4 are accepted, version 4 is
//! written. Also deserializable from the server config file so an operator
//! can pin settings for a room.

use serde::{Deserialize, Serialize};

use crate::codec::{DecodeError, PacketReader, PacketWriter};
use crate::GameMap;

/// Taskbar visibility mode, version 4 settings onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskBarUpdates {
    Always = 0,
    Meetings = 1,
    Never = 2,
}

impl TaskBarUpdates {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskBarUpdates::Meetings,
            2 => TaskBarUpdates::Never,
            _ => TaskBarUpdates::Always,
        }
    }
}

/// The full settings block. Field order matters for the wire layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSettings {
    pub version: u8,
    pub max_players: u8,
    pub keywords: u32,
    pub map: GameMap,
    pub player_speed_mod: f32,
    pub crew_light_mod: f32,
    pub impostor_light_mod: f32,
    pub kill_cooldown: f32,
    pub num_common_tasks: u8,
    pub num_long_tasks: u8,
    pub num_short_tasks: u8,
    pub num_emergencies: i32,
    pub num_impostors: u8,
    pub kill_distance: u8,
    pub discussion_time: i32,
    pub voting_time: i32,
    pub is_defaults: bool,
    // Version 2+
    pub emergency_cooldown: u8,
    // Version 3+
    pub confirm_ejects: bool,
    pub visual_tasks: bool,
    // Version 4+
    pub anonymous_votes: bool,
    pub task_bar_updates: TaskBarUpdates,
}

impl Default for GameSettings {
    fn default() -> Self {
        GameSettings {
            version: 4,
            max_players: 10,
            keywords: 0,
            map: GameMap::Skeld,
            player_speed_mod: 1.0,
            crew_light_mod: 1.0,
            impostor_light_mod: 1.5,
            kill_cooldown: 45.0,
            num_common_tasks: 1,
            num_long_tasks: 1,
            num_short_tasks: 2,
            num_emergencies: 1,
            num_impostors: 1,
            kill_distance: 1,
            discussion_time: 15,
            voting_time: 120,
            is_defaults: true,
            emergency_cooldown: 15,
            confirm_ejects: true,
            visual_tasks: true,
            anonymous_votes: false,
            task_bar_updates: TaskBarUpdates::Always,
        }
    }
}

impl GameSettings {
    /// Decodes the length-prefixed block.
    pub fn decode(reader: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let block = reader.read_bytes()?;
        let mut r = PacketReader::new(block);

        let version = r.read_u8()?;
        let mut settings = GameSettings {
            version,
            max_players: r.read_u8()?,
            keywords: r.read_u32()?,
            map: GameMap::from_u8(r.read_u8()?).unwrap_or(GameMap::Skeld),
            player_speed_mod: r.read_f32()?,
            crew_light_mod: r.read_f32()?,
            impostor_light_mod: r.read_f32()?,
            kill_cooldown: r.read_f32()?,
            num_common_tasks: r.read_u8()?,
            num_long_tasks: r.read_u8()?,
            num_short_tasks: r.read_u8()?,
            num_emergencies: r.read_i32()?,
            num_impostors: r.read_u8()?,
            kill_distance: r.read_u8()?,
            discussion_time: r.read_i32()?,
            voting_time: r.read_i32()?,
            is_defaults: r.read_bool()?,
            ..GameSettings::default()
        };
        if version >= 2 {
            settings.emergency_cooldown = r.read_u8()?;
        }
        if version >= 3 {
            settings.confirm_ejects = r.read_bool()?;
            settings.visual_tasks = r.read_bool()?;
        }
        if version >= 4 {
            settings.anonymous_votes = r.read_bool()?;
            settings.task_bar_updates = TaskBarUpdates::from_u8(r.read_u8()?);
        }
        Ok(settings)
    }

    pub fn encode(&self, writer: &mut PacketWriter) {
        let mut body = PacketWriter::new();
        body.write_u8(self.version);
        body.write_u8(self.max_players);
        body.write_u32(self.keywords);
        body.write_u8(self.map as u8);
        body.write_f32(self.player_speed_mod);
        body.write_f32(self.crew_light_mod);
        body.write_f32(self.impostor_light_mod);
        body.write_f32(self.kill_cooldown);
        body.write_u8(self.num_common_tasks);
        body.write_u8(self.num_long_tasks);
        body.write_u8(self.num_short_tasks);
        body.write_i32(self.num_emergencies);
        body.write_u8(self.num_impostors);
        body.write_u8(self.kill_distance);
        body.write_i32(self.discussion_time);
        body.write_i32(self.voting_time);
        body.write_bool(self.is_defaults);
        if self.version >= 2 {
            body.write_u8(self.emergency_cooldown);
        }
        if self.version >= 3 {
            body.write_bool(self.confirm_ejects);
            body.write_bool(self.visual_tasks);
        }
        if self.version >= 4 {
            body.write_bool(self.anonymous_votes);
            body.write_u8(self.task_bar_updates as u8);
        }
        writer.write_bytes(body.as_slice());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let settings = GameSettings {
            version: 4,
            max_players: 15,
            keywords: 256,
            map: GameMap::Polus,
            player_speed_mod: 1.25,
            kill_cooldown: 27.5,
            num_impostors: 2,
            discussion_time: 30,
            voting_time: 90,
            is_defaults: false,
            anonymous_votes: true,
            task_bar_updates: TaskBarUpdates::Meetings,
            ..GameSettings::default()
        };

        let mut writer = PacketWriter::new();
        settings.encode(&mut writer);
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes);
        let decoded = GameSettings::decode(&mut reader).unwrap();
        assert_eq!(decoded, settings);
        assert!(reader.is_empty());
    }

    #[test]
    fn version_two_block_omits_newer_fields() {
        let settings = GameSettings {
            version: 2,
            ..GameSettings::default()
        };
        let mut writer = PacketWriter::new();
        settings.encode(&mut writer);
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes);
        let decoded = GameSettings::decode(&mut reader).unwrap();
        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.emergency_cooldown, settings.emergency_cooldown);
        // Newer fields hold their defaults after a v2 decode.
        assert_eq!(decoded.confirm_ejects, GameSettings::default().confirm_ejects);
    }

    #[test]
    fn truncated_block_is_malformed() {
        let mut writer = PacketWriter::new();
        writer.write_bytes(&[4, 10]); // Declares a block far too short.
        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        assert!(GameSettings::decode(&mut reader).is_err());
    }
}
