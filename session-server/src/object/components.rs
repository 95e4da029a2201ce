//! The networked component kinds a room can replicate. The original title
//! models these as subclasses of one base behaviour; here they are a tagged
//! union with per-kind serialize, deserialize and update hooks. State the
//! server does not arbitrate (ship systems, cosmetic animation) stays
//! minimal, it only needs to survive a serialize round trip.

use bytes::Bytes;

use protocol::codec::{DecodeError, PacketReader, PacketWriter, Vector2};
use protocol::GameMap;

/// One task on a player's list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    pub id: u32,
    pub complete: bool,
}

/// Replicated per-player record inside the game data component.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    pub player_id: u8,
    pub name: String,
    pub color: u8,
    pub hat: u32,
    pub pet: u32,
    pub skin: u32,
    pub is_disconnected: bool,
    pub is_impostor: bool,
    pub is_dead: bool,
    pub tasks: Vec<TaskState>,
}

impl PlayerInfo {
    pub fn new(player_id: u8) -> Self {
        PlayerInfo {
            player_id,
            name: String::new(),
            color: 0,
            hat: 0,
            pet: 0,
            skin: 0,
            is_disconnected: false,
            is_impostor: false,
            is_dead: false,
            tasks: Vec::new(),
        }
    }

    fn flags(&self) -> u8 {
        (self.is_disconnected as u8) | (self.is_impostor as u8) << 1 | (self.is_dead as u8) << 2
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u8(self.player_id);
        writer.write_string(&self.name);
        writer.write_u8(self.color);
        writer.write_packed_u32(self.hat);
        writer.write_packed_u32(self.pet);
        writer.write_packed_u32(self.skin);
        writer.write_u8(self.flags());
        writer.write_u8(self.tasks.len() as u8);
        for task in &self.tasks {
            writer.write_packed_u32(task.id);
            writer.write_bool(task.complete);
        }
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let player_id = reader.read_u8()?;
        let name = reader.read_string()?;
        let color = reader.read_u8()?;
        let hat = reader.read_packed_u32()?;
        let pet = reader.read_packed_u32()?;
        let skin = reader.read_packed_u32()?;
        let flags = reader.read_u8()?;
        let task_count = reader.read_u8()? as usize;
        let mut tasks = Vec::with_capacity(task_count.min(32));
        for _ in 0..task_count {
            tasks.push(TaskState {
                id: reader.read_packed_u32()?,
                complete: reader.read_bool()?,
            });
        }
        Ok(PlayerInfo {
            player_id,
            name,
            color,
            hat,
            pet,
            skin,
            is_disconnected: flags & 1 != 0,
            is_impostor: flags & 2 != 0,
            is_dead: flags & 4 != 0,
            tasks,
        })
    }
}

/// Vote bookkeeping for one meeting participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteArea {
    pub player_id: u8,
    /// Suspect player id, `0xFF` for a skip vote, `None` while undecided.
    pub voted_for: Option<u8>,
    pub did_report: bool,
    pub is_dead: bool,
}

const VOTE_NONE: u8 = 0xFE;

impl VoteArea {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u8(self.player_id);
        writer.write_u8(self.voted_for.unwrap_or(VOTE_NONE));
        writer.write_u8((self.did_report as u8) | (self.is_dead as u8) << 1);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let player_id = reader.read_u8()?;
        let voted = reader.read_u8()?;
        let flags = reader.read_u8()?;
        Ok(VoteArea {
            player_id,
            voted_for: (voted != VOTE_NONE).then_some(voted),
            did_report: flags & 1 != 0,
            is_dead: flags & 2 != 0,
        })
    }
}

/// Kind-specific state of a networked component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentKind {
    PlayerControl {
        is_new: bool,
        player_id: u8,
    },
    PlayerPhysics {
        /// Vent id while vented.
        in_vent: Option<u32>,
    },
    NetworkTransform {
        sequence: u16,
        position: Vector2,
        velocity: Vector2,
    },
    LobbyBehaviour,
    GameData {
        players: Vec<PlayerInfo>,
    },
    VoteBanSystem {
        /// Kick votes per target client, as voter client ids.
        votes: Vec<(u32, Vec<u32>)>,
    },
    ShipStatus {
        map: GameMap,
    },
    MeetingHud {
        states: Vec<VoteArea>,
    },
    /// Template outside the known set; payload is carried verbatim.
    Unknown {
        payload: Bytes,
    },
}

impl ComponentKind {
    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ComponentKind::PlayerControl { .. } => "PlayerControl",
            ComponentKind::PlayerPhysics { .. } => "PlayerPhysics",
            ComponentKind::NetworkTransform { .. } => "CustomNetworkTransform",
            ComponentKind::LobbyBehaviour => "LobbyBehaviour",
            ComponentKind::GameData { .. } => "GameData",
            ComponentKind::VoteBanSystem { .. } => "VoteBanSystem",
            ComponentKind::ShipStatus { .. } => "ShipStatus",
            ComponentKind::MeetingHud { .. } => "MeetingHud",
            ComponentKind::Unknown { .. } => "Unknown",
        }
    }

    /// Per-tick update hook. Returns the dirty mask the update produced.
    pub fn fixed_update(&mut self, _delta: f32) -> u32 {
        // No component advances state on its own yet; everything is
        // driven by inbound messages.
        0
    }

    /// Hook before serialization; meeting state recomputes derived bits.
    pub fn pre_serialize(&mut self) {}

    /// Writes the component state. `spawn` selects the full snapshot;
    /// otherwise only what the dirty mask covers. Returns whether any
    /// bytes were written.
    pub fn serialize(&self, writer: &mut PacketWriter, spawn: bool, dirty: u32) -> bool {
        match self {
            ComponentKind::PlayerControl { is_new, player_id } => {
                if spawn {
                    writer.write_bool(*is_new);
                }
                writer.write_u8(*player_id);
                true
            }
            ComponentKind::PlayerPhysics { .. } => false,
            ComponentKind::NetworkTransform { sequence, position, velocity } => {
                writer.write_u16(*sequence);
                writer.write_vector2(*position);
                writer.write_vector2(*velocity);
                true
            }
            ComponentKind::LobbyBehaviour => false,
            ComponentKind::GameData { players } => {
                if spawn {
                    writer.write_packed_u32(players.len() as u32);
                    for player in players {
                        player.write(writer);
                    }
                    true
                } else {
                    let dirty_players: Vec<&PlayerInfo> = players
                        .iter()
                        .filter(|p| dirty & (1 << p.player_id.min(31)) != 0)
                        .collect();
                    if dirty_players.is_empty() {
                        return false;
                    }
                    writer.write_packed_u32(dirty_players.len() as u32);
                    for player in dirty_players {
                        player.write(writer);
                    }
                    true
                }
            }
            ComponentKind::VoteBanSystem { votes } => {
                writer.write_packed_u32(votes.len() as u32);
                for (target, voters) in votes {
                    writer.write_u32(*target);
                    writer.write_packed_u32(voters.len() as u32);
                    for voter in voters {
                        writer.write_u32(*voter);
                    }
                }
                true
            }
            ComponentKind::ShipStatus { .. } => false,
            ComponentKind::MeetingHud { states } => {
                writer.write_packed_u32(states.len() as u32);
                for state in states {
                    state.write(writer);
                }
                true
            }
            ComponentKind::Unknown { payload } => {
                if payload.is_empty() {
                    return false;
                }
                writer.write_raw(payload);
                true
            }
        }
    }

    /// Applies a received state block.
    pub fn deserialize(
        &mut self,
        reader: &mut PacketReader<'_>,
        spawn: bool,
    ) -> Result<(), DecodeError> {
        match self {
            ComponentKind::PlayerControl { is_new, player_id } => {
                if spawn {
                    *is_new = reader.read_bool()?;
                }
                *player_id = reader.read_u8()?;
            }
            ComponentKind::PlayerPhysics { .. } => {}
            ComponentKind::NetworkTransform { sequence, position, velocity } => {
                let incoming_seq = reader.read_u16()?;
                let incoming_pos = reader.read_vector2()?;
                let incoming_vel = reader.read_vector2()?;
                // Stale movement (old sequence) is dropped, wrap aware.
                if spawn || incoming_seq.wrapping_sub(*sequence) < 0x8000 {
                    *sequence = incoming_seq;
                    *position = incoming_pos;
                    *velocity = incoming_vel;
                }
            }
            ComponentKind::LobbyBehaviour => {}
            ComponentKind::GameData { players } => {
                let count = reader.read_packed_u32()? as usize;
                let mut incoming = Vec::with_capacity(count.min(32));
                for _ in 0..count {
                    incoming.push(PlayerInfo::read(reader)?);
                }
                if spawn {
                    *players = incoming;
                } else {
                    for info in incoming {
                        match players.iter_mut().find(|p| p.player_id == info.player_id) {
                            Some(existing) => *existing = info,
                            None => players.push(info),
                        }
                    }
                }
            }
            ComponentKind::VoteBanSystem { votes } => {
                let count = reader.read_packed_u32()? as usize;
                let mut incoming = Vec::with_capacity(count.min(32));
                for _ in 0..count {
                    let target = reader.read_u32()?;
                    let voter_count = reader.read_packed_u32()? as usize;
                    let mut voters = Vec::with_capacity(voter_count.min(16));
                    for _ in 0..voter_count {
                        voters.push(reader.read_u32()?);
                    }
                    incoming.push((target, voters));
                }
                *votes = incoming;
            }
            ComponentKind::ShipStatus { .. } => {}
            ComponentKind::MeetingHud { states } => {
                let count = reader.read_packed_u32()? as usize;
                let mut incoming = Vec::with_capacity(count.min(32));
                for _ in 0..count {
                    incoming.push(VoteArea::read(reader)?);
                }
                *states = incoming;
            }
            ComponentKind::Unknown { payload } => {
                *payload = Bytes::copy_from_slice(reader.take_rest());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(kind: &mut ComponentKind, spawn: bool) -> Option<Bytes> {
        let mut writer = PacketWriter::new();
        if !kind.serialize(&mut writer, spawn, u32::MAX) {
            return None;
        }
        let bytes = writer.into_bytes();
        let mut copy = kind.clone();
        copy.deserialize(&mut PacketReader::new(&bytes), spawn).unwrap();
        assert_eq!(&copy, kind);
        Some(bytes)
    }

    #[test]
    fn game_data_spawn_round_trips() {
        let mut player = PlayerInfo::new(2);
        player.name = "Alice".into();
        player.color = 7;
        player.is_impostor = true;
        player.tasks = vec![
            TaskState { id: 12, complete: false },
            TaskState { id: 3, complete: true },
        ];
        let mut kind = ComponentKind::GameData { players: vec![PlayerInfo::new(0), player] };
        round_trip(&mut kind, true).unwrap();
    }

    #[test]
    fn game_data_delta_covers_only_dirty_players() {
        let players = vec![PlayerInfo::new(0), PlayerInfo::new(1), PlayerInfo::new(2)];
        let kind = ComponentKind::GameData { players };
        let mut writer = PacketWriter::new();
        assert!(kind.serialize(&mut writer, false, 1 << 1));
        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_packed_u32().unwrap(), 1);
        assert_eq!(reader.read_u8().unwrap(), 1);
    }

    #[test]
    fn meeting_hud_round_trips() {
        let mut kind = ComponentKind::MeetingHud {
            states: vec![
                VoteArea { player_id: 0, voted_for: Some(2), did_report: true, is_dead: false },
                VoteArea { player_id: 1, voted_for: Some(0xFF), did_report: false, is_dead: false },
                VoteArea { player_id: 2, voted_for: None, did_report: false, is_dead: true },
            ],
        };
        round_trip(&mut kind, false).unwrap();
    }

    #[test]
    fn stale_movement_is_dropped() {
        let mut kind = ComponentKind::NetworkTransform {
            sequence: 10,
            position: Vector2::new(1.0, 1.0),
            velocity: Vector2::default(),
        };
        let mut writer = PacketWriter::new();
        // A delta with an older sequence number.
        writer.write_u16(5);
        writer.write_vector2(Vector2::new(30.0, 30.0));
        writer.write_vector2(Vector2::default());
        let bytes = writer.into_bytes();
        kind.deserialize(&mut PacketReader::new(&bytes), false).unwrap();
        match kind {
            ComponentKind::NetworkTransform { sequence, position, .. } => {
                assert_eq!(sequence, 10);
                assert!((position.x - 1.0).abs() < 0.01);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn unknown_component_is_verbatim() {
        let mut kind = ComponentKind::Unknown { payload: Bytes::from_static(&[1, 2, 3]) };
        let bytes = round_trip(&mut kind, true).unwrap();
        assert_eq!(&bytes[..], &[1, 2, 3]);
    }
}
