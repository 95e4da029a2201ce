//! Remote procedure calls carried inside game data messages. A call is
//! addressed by net id and a one byte tag; the payload layout depends on
//! the tag. Tags the server never inspects are kept opaque and forwarded
//! verbatim so newer client builds keep working.

use bytes::Bytes;

use crate::codec::{DecodeError, PacketReader, PacketWriter, Vector2};
use crate::settings::GameSettings;

/// Stable tag values. Part of the client contract.
pub mod tags {
    pub const PLAY_ANIMATION: u8 = 0;
    pub const COMPLETE_TASK: u8 = 1;
    pub const SYNC_SETTINGS: u8 = 2;
    pub const SET_INFECTED: u8 = 3;
    pub const EXILED: u8 = 4;
    pub const CHECK_NAME: u8 = 5;
    pub const SET_NAME: u8 = 6;
    pub const CHECK_COLOR: u8 = 7;
    pub const SET_COLOR: u8 = 8;
    pub const SET_HAT: u8 = 9;
    pub const SET_SKIN: u8 = 10;
    pub const REPORT_DEAD_BODY: u8 = 11;
    pub const MURDER_PLAYER: u8 = 12;
    pub const SEND_CHAT: u8 = 13;
    pub const START_MEETING: u8 = 14;
    pub const SET_SCANNER: u8 = 15;
    pub const SEND_CHAT_NOTE: u8 = 16;
    pub const SET_PET: u8 = 17;
    pub const SET_START_COUNTER: u8 = 18;
    pub const ENTER_VENT: u8 = 19;
    pub const EXIT_VENT: u8 = 20;
    pub const SNAP_TO: u8 = 21;
    pub const CLOSE: u8 = 22;
    pub const VOTING_COMPLETE: u8 = 23;
    pub const CAST_VOTE: u8 = 24;
    pub const CLEAR_VOTE: u8 = 25;
    pub const ADD_VOTE: u8 = 26;
    pub const CLOSE_DOORS_OF_TYPE: u8 = 27;
    pub const REPAIR_SYSTEM: u8 = 28;
    pub const SET_TASKS: u8 = 29;
    pub const UPDATE_GAME_DATA: u8 = 30;
    pub const CLIMB_LADDER: u8 = 31;
    pub const USE_PLATFORM: u8 = 32;
    pub const SEND_QUICK_CHAT: u8 = 33;
    pub const BOOT_FROM_VENT: u8 = 34;
}

/// A decoded remote procedure call.
#[derive(Debug, Clone, PartialEq)]
pub enum Rpc {
    PlayAnimation { animation: u8 },
    CompleteTask { task: u32 },
    SyncSettings { settings: GameSettings },
    SetInfected { impostors: Vec<u8> },
    Exiled,
    CheckName { name: String },
    SetName { name: String },
    CheckColor { color: u8 },
    SetColor { color: u8 },
    SetHat { hat: u32 },
    SetSkin { skin: u32 },
    ReportDeadBody { body: u8 },
    MurderPlayer { target_net_id: u32 },
    SendChat { message: String },
    StartMeeting { body: u8 },
    SetScanner { scanning: bool, count: u8 },
    SendChatNote { player_id: u8, note_type: u8 },
    SetPet { pet: u32 },
    SetStartCounter { sequence: i32, counter: i8 },
    EnterVent { vent: u32 },
    ExitVent { vent: u32 },
    SnapTo { position: Vector2, sequence: u16 },
    Close,
    VotingComplete { states: Vec<u8>, exiled: u8, tie: bool },
    CastVote { voter: u8, suspect: u8 },
    ClearVote,
    AddVote { voter: u32, target: u32 },
    CloseDoorsOfType { system: u8 },
    RepairSystem { system: u8, player_net_id: u32, amount: u8 },
    SetTasks { player_id: u8, tasks: Vec<u8> },
    ClimbLadder { ladder: u8, sequence: u8 },
    UsePlatform,
    BootFromVent { vent: u32 },
    /// Tag the server does not inspect; forwarded byte for byte.
    Unknown { tag: u8, payload: Bytes },
}

impl Rpc {
    pub fn tag(&self) -> u8 {
        use Rpc::*;
        match self {
            PlayAnimation { .. } => tags::PLAY_ANIMATION,
            CompleteTask { .. } => tags::COMPLETE_TASK,
            SyncSettings { .. } => tags::SYNC_SETTINGS,
            SetInfected { .. } => tags::SET_INFECTED,
            Exiled => tags::EXILED,
            CheckName { .. } => tags::CHECK_NAME,
            SetName { .. } => tags::SET_NAME,
            CheckColor { .. } => tags::CHECK_COLOR,
            SetColor { .. } => tags::SET_COLOR,
            SetHat { .. } => tags::SET_HAT,
            SetSkin { .. } => tags::SET_SKIN,
            ReportDeadBody { .. } => tags::REPORT_DEAD_BODY,
            MurderPlayer { .. } => tags::MURDER_PLAYER,
            SendChat { .. } => tags::SEND_CHAT,
            StartMeeting { .. } => tags::START_MEETING,
            SetScanner { .. } => tags::SET_SCANNER,
            SendChatNote { .. } => tags::SEND_CHAT_NOTE,
            SetPet { .. } => tags::SET_PET,
            SetStartCounter { .. } => tags::SET_START_COUNTER,
            EnterVent { .. } => tags::ENTER_VENT,
            ExitVent { .. } => tags::EXIT_VENT,
            SnapTo { .. } => tags::SNAP_TO,
            Close => tags::CLOSE,
            VotingComplete { .. } => tags::VOTING_COMPLETE,
            CastVote { .. } => tags::CAST_VOTE,
            ClearVote => tags::CLEAR_VOTE,
            AddVote { .. } => tags::ADD_VOTE,
            CloseDoorsOfType { .. } => tags::CLOSE_DOORS_OF_TYPE,
            RepairSystem { .. } => tags::REPAIR_SYSTEM,
            SetTasks { .. } => tags::SET_TASKS,
            ClimbLadder { .. } => tags::CLIMB_LADDER,
            UsePlatform => tags::USE_PLATFORM,
            BootFromVent { .. } => tags::BOOT_FROM_VENT,
            Unknown { tag, .. } => *tag,
        }
    }

    /// Short name for diagnostics and infraction records.
    pub fn name(&self) -> &'static str {
        use Rpc::*;
        match self {
            PlayAnimation { .. } => "PlayAnimation",
            CompleteTask { .. } => "CompleteTask",
            SyncSettings { .. } => "SyncSettings",
            SetInfected { .. } => "SetInfected",
            Exiled => "Exiled",
            CheckName { .. } => "CheckName",
            SetName { .. } => "SetName",
            CheckColor { .. } => "CheckColor",
            SetColor { .. } => "SetColor",
            SetHat { .. } => "SetHat",
            SetSkin { .. } => "SetSkin",
            ReportDeadBody { .. } => "ReportDeadBody",
            MurderPlayer { .. } => "MurderPlayer",
            SendChat { .. } => "SendChat",
            StartMeeting { .. } => "StartMeeting",
            SetScanner { .. } => "SetScanner",
            SendChatNote { .. } => "SendChatNote",
            SetPet { .. } => "SetPet",
            SetStartCounter { .. } => "SetStartCounter",
            EnterVent { .. } => "EnterVent",
            ExitVent { .. } => "ExitVent",
            SnapTo { .. } => "SnapTo",
            Close => "Close",
            VotingComplete { .. } => "VotingComplete",
            CastVote { .. } => "CastVote",
            ClearVote => "ClearVote",
            AddVote { .. } => "AddVote",
            CloseDoorsOfType { .. } => "CloseDoorsOfType",
            RepairSystem { .. } => "RepairSystem",
            SetTasks { .. } => "SetTasks",
            ClimbLadder { .. } => "ClimbLadder",
            UsePlatform => "UsePlatform",
            BootFromVent { .. } => "BootFromVent",
            Unknown { .. } => "Unknown",
        }
    }

    pub fn decode(tag: u8, reader: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let rpc = match tag {
            tags::PLAY_ANIMATION => Rpc::PlayAnimation {
                animation: reader.read_u8()?,
            },
            tags::COMPLETE_TASK => Rpc::CompleteTask {
                task: reader.read_packed_u32()?,
            },
            tags::SYNC_SETTINGS => Rpc::SyncSettings {
                settings: GameSettings::decode(reader)?,
            },
            tags::SET_INFECTED => {
                let count = reader.read_packed_u32()? as usize;
                let mut impostors = Vec::with_capacity(count.min(32));
                for _ in 0..count {
                    impostors.push(reader.read_u8()?);
                }
                Rpc::SetInfected { impostors }
            }
            tags::EXILED => Rpc::Exiled,
            tags::CHECK_NAME => Rpc::CheckName {
                name: reader.read_string()?,
            },
            tags::SET_NAME => Rpc::SetName {
                name: reader.read_string()?,
            },
            tags::CHECK_COLOR => Rpc::CheckColor {
                color: reader.read_u8()?,
            },
            tags::SET_COLOR => Rpc::SetColor {
                color: reader.read_u8()?,
            },
            tags::SET_HAT => Rpc::SetHat {
                hat: reader.read_packed_u32()?,
            },
            tags::SET_SKIN => Rpc::SetSkin {
                skin: reader.read_packed_u32()?,
            },
            tags::REPORT_DEAD_BODY => Rpc::ReportDeadBody {
                body: reader.read_u8()?,
            },
            tags::MURDER_PLAYER => Rpc::MurderPlayer {
                target_net_id: reader.read_packed_u32()?,
            },
            tags::SEND_CHAT => Rpc::SendChat {
                message: reader.read_string()?,
            },
            tags::START_MEETING => Rpc::StartMeeting {
                body: reader.read_u8()?,
            },
            tags::SET_SCANNER => Rpc::SetScanner {
                scanning: reader.read_bool()?,
                count: reader.read_u8()?,
            },
            tags::SEND_CHAT_NOTE => Rpc::SendChatNote {
                player_id: reader.read_u8()?,
                note_type: reader.read_u8()?,
            },
            tags::SET_PET => Rpc::SetPet {
                pet: reader.read_packed_u32()?,
            },
            tags::SET_START_COUNTER => Rpc::SetStartCounter {
                sequence: reader.read_packed_i32()?,
                counter: reader.read_u8()? as i8,
            },
            tags::ENTER_VENT => Rpc::EnterVent {
                vent: reader.read_packed_u32()?,
            },
            tags::EXIT_VENT => Rpc::ExitVent {
                vent: reader.read_packed_u32()?,
            },
            tags::SNAP_TO => Rpc::SnapTo {
                position: reader.read_vector2()?,
                sequence: reader.read_u16()?,
            },
            tags::CLOSE => Rpc::Close,
            tags::VOTING_COMPLETE => {
                let states = reader.read_bytes()?.to_vec();
                Rpc::VotingComplete {
                    states,
                    exiled: reader.read_u8()?,
                    tie: reader.read_bool()?,
                }
            }
            tags::CAST_VOTE => Rpc::CastVote {
                voter: reader.read_u8()?,
                suspect: reader.read_u8()?,
            },
            tags::CLEAR_VOTE => Rpc::ClearVote,
            tags::ADD_VOTE => Rpc::AddVote {
                voter: reader.read_u32()?,
                target: reader.read_u32()?,
            },
            tags::CLOSE_DOORS_OF_TYPE => Rpc::CloseDoorsOfType {
                system: reader.read_u8()?,
            },
            tags::REPAIR_SYSTEM => Rpc::RepairSystem {
                system: reader.read_u8()?,
                player_net_id: reader.read_packed_u32()?,
                amount: reader.read_u8()?,
            },
            tags::SET_TASKS => {
                let player_id = reader.read_u8()?;
                let tasks = reader.read_bytes()?.to_vec();
                Rpc::SetTasks { player_id, tasks }
            }
            tags::CLIMB_LADDER => Rpc::ClimbLadder {
                ladder: reader.read_u8()?,
                sequence: reader.read_u8()?,
            },
            tags::USE_PLATFORM => Rpc::UsePlatform,
            tags::BOOT_FROM_VENT => Rpc::BootFromVent {
                vent: reader.read_packed_u32()?,
            },
            _ => Rpc::Unknown {
                tag,
                payload: Bytes::copy_from_slice(reader.take_rest()),
            },
        };
        Ok(rpc)
    }

    /// Writes the payload only; the caller frames tag and net id.
    pub fn encode(&self, writer: &mut PacketWriter) {
        use Rpc::*;
        match self {
            PlayAnimation { animation } => writer.write_u8(*animation),
            CompleteTask { task } => writer.write_packed_u32(*task),
            SyncSettings { settings } => settings.encode(writer),
            SetInfected { impostors } => {
                writer.write_packed_u32(impostors.len() as u32);
                for id in impostors {
                    writer.write_u8(*id);
                }
            }
            Exiled | Close | ClearVote | UsePlatform => {}
            CheckName { name } | SetName { name } => writer.write_string(name),
            CheckColor { color } | SetColor { color } => writer.write_u8(*color),
            SetHat { hat } => writer.write_packed_u32(*hat),
            SetSkin { skin } => writer.write_packed_u32(*skin),
            ReportDeadBody { body } => writer.write_u8(*body),
            MurderPlayer { target_net_id } => writer.write_packed_u32(*target_net_id),
            SendChat { message } => writer.write_string(message),
            StartMeeting { body } => writer.write_u8(*body),
            SetScanner { scanning, count } => {
                writer.write_bool(*scanning);
                writer.write_u8(*count);
            }
            SendChatNote { player_id, note_type } => {
                writer.write_u8(*player_id);
                writer.write_u8(*note_type);
            }
            SetPet { pet } => writer.write_packed_u32(*pet),
            SetStartCounter { sequence, counter } => {
                writer.write_packed_i32(*sequence);
                writer.write_u8(*counter as u8);
            }
            EnterVent { vent } | BootFromVent { vent } | ExitVent { vent } => {
                writer.write_packed_u32(*vent)
            }
            SnapTo { position, sequence } => {
                writer.write_vector2(*position);
                writer.write_u16(*sequence);
            }
            VotingComplete { states, exiled, tie } => {
                writer.write_bytes(states);
                writer.write_u8(*exiled);
                writer.write_bool(*tie);
            }
            CastVote { voter, suspect } => {
                writer.write_u8(*voter);
                writer.write_u8(*suspect);
            }
            AddVote { voter, target } => {
                writer.write_u32(*voter);
                writer.write_u32(*target);
            }
            CloseDoorsOfType { system } => writer.write_u8(*system),
            RepairSystem { system, player_net_id, amount } => {
                writer.write_u8(*system);
                writer.write_packed_u32(*player_net_id);
                writer.write_u8(*amount);
            }
            SetTasks { player_id, tasks } => {
                writer.write_u8(*player_id);
                writer.write_bytes(tasks);
            }
            ClimbLadder { ladder, sequence } => {
                writer.write_u8(*ladder);
                writer.write_u8(*sequence);
            }
            Unknown { payload, .. } => writer.write_raw(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(rpc: Rpc) {
        let mut writer = PacketWriter::new();
        rpc.encode(&mut writer);
        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        let decoded = Rpc::decode(rpc.tag(), &mut reader).unwrap();
        assert_eq!(decoded, rpc);
        assert!(reader.is_empty());
    }

    #[test]
    fn inspected_calls_round_trip() {
        round_trip(Rpc::CheckName { name: "Alice".into() });
        round_trip(Rpc::CastVote { voter: 3, suspect: 255 });
        round_trip(Rpc::SetStartCounter { sequence: 5, counter: -1 });
        round_trip(Rpc::SetInfected { impostors: vec![1, 4] });
        round_trip(Rpc::VotingComplete {
            states: vec![0, 1, 2],
            exiled: 255,
            tie: true,
        });
    }

    #[test]
    fn snap_to_round_trips_within_quantization() {
        let rpc = Rpc::SnapTo {
            position: Vector2::new(12.5, -3.75),
            sequence: 12,
        };
        let mut writer = PacketWriter::new();
        rpc.encode(&mut writer);
        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        match Rpc::decode(tags::SNAP_TO, &mut reader).unwrap() {
            Rpc::SnapTo { position, sequence } => {
                assert_eq!(sequence, 12);
                assert!((position.x - 12.5).abs() < 0.01);
                assert!((position.y + 3.75).abs() < 0.01);
            }
            other => panic!("expected snap-to, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_kept_opaque() {
        let payload = [1u8, 2, 3, 4];
        let mut reader = PacketReader::new(&payload);
        let rpc = Rpc::decode(200, &mut reader).unwrap();
        match &rpc {
            Rpc::Unknown { tag: 200, payload: p } => assert_eq!(&p[..], &payload),
            other => panic!("expected unknown rpc, got {other:?}"),
        }
        let mut writer = PacketWriter::new();
        rpc.encode(&mut writer);
        assert_eq!(&writer.into_bytes()[..], &payload);
    }
}
