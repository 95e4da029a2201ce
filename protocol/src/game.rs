//! Messages carried inside the game data envelope: replicated state deltas,
//! remote procedure calls, object spawns and despawns, scene changes and
//! ready notices. Decoding goes through a [`DecoderTable`] so a room can
//! accept extension tags beyond the worker wide defaults.

use bytes::Bytes;

use crate::codec::{DecodeError, PacketReader, PacketWriter};
use crate::rpc::Rpc;

/// Stable tag values of the game data messages.
pub mod tags {
    pub const DATA: u8 = 1;
    pub const RPC: u8 = 2;
    pub const SPAWN: u8 = 4;
    pub const DESPAWN: u8 = 5;
    pub const SCENE_CHANGE: u8 = 6;
    pub const READY: u8 = 7;
}

/// Serialized state of one component inside a spawn message.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentData {
    pub net_id: u32,
    pub payload: Bytes,
}

/// An object spawn: template id, owner and the initial state of every
/// component the template lists.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnMessage {
    pub spawn_type: u32,
    pub owner_id: i32,
    pub flags: u8,
    pub components: Vec<ComponentData>,
}

/// One message of the game data envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum GameDataMessage {
    /// State delta for a single component.
    Data { net_id: u32, payload: Bytes },
    /// Remote procedure call addressed at a component.
    Rpc { net_id: u32, rpc: Rpc },
    Spawn(SpawnMessage),
    Despawn { net_id: u32 },
    SceneChange { client_id: u32, scene: String },
    Ready { client_id: u32 },
    /// Registered extension tag; forwarded verbatim.
    Extension { tag: u8, payload: Bytes },
}

impl GameDataMessage {
    pub fn tag(&self) -> u8 {
        match self {
            GameDataMessage::Data { .. } => tags::DATA,
            GameDataMessage::Rpc { .. } => tags::RPC,
            GameDataMessage::Spawn(_) => tags::SPAWN,
            GameDataMessage::Despawn { .. } => tags::DESPAWN,
            GameDataMessage::SceneChange { .. } => tags::SCENE_CHANGE,
            GameDataMessage::Ready { .. } => tags::READY,
            GameDataMessage::Extension { tag, .. } => *tag,
        }
    }

    /// Writes the message including its `[len][tag]` frame.
    pub fn encode(&self, writer: &mut PacketWriter) {
        writer.start_message(self.tag());
        match self {
            GameDataMessage::Data { net_id, payload } => {
                writer.write_packed_u32(*net_id);
                writer.write_raw(payload);
            }
            GameDataMessage::Rpc { net_id, rpc } => {
                writer.write_packed_u32(*net_id);
                writer.write_u8(rpc.tag());
                rpc.encode(writer);
            }
            GameDataMessage::Spawn(spawn) => {
                writer.write_packed_u32(spawn.spawn_type);
                writer.write_packed_i32(spawn.owner_id);
                writer.write_u8(spawn.flags);
                writer.write_packed_u32(spawn.components.len() as u32);
                for component in &spawn.components {
                    writer.write_packed_u32(component.net_id);
                    writer.start_message(1);
                    writer.write_raw(&component.payload);
                    writer.end_message();
                }
            }
            GameDataMessage::Despawn { net_id } => {
                writer.write_packed_u32(*net_id);
            }
            GameDataMessage::SceneChange { client_id, scene } => {
                writer.write_packed_u32(*client_id);
                writer.write_string(scene);
            }
            GameDataMessage::Ready { client_id } => {
                writer.write_packed_u32(*client_id);
            }
            GameDataMessage::Extension { payload, .. } => {
                writer.write_raw(payload);
            }
        }
        writer.end_message();
    }

    fn decode_one(tag: u8, reader: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let message = match tag {
            tags::DATA => GameDataMessage::Data {
                net_id: reader.read_packed_u32()?,
                payload: Bytes::copy_from_slice(reader.take_rest()),
            },
            tags::RPC => {
                let net_id = reader.read_packed_u32()?;
                let rpc_tag = reader.read_u8()?;
                GameDataMessage::Rpc {
                    net_id,
                    rpc: Rpc::decode(rpc_tag, reader)?,
                }
            }
            tags::SPAWN => {
                let spawn_type = reader.read_packed_u32()?;
                let owner_id = reader.read_packed_i32()?;
                let flags = reader.read_u8()?;
                let count = reader.read_packed_u32()? as usize;
                let mut components = Vec::with_capacity(count.min(16));
                for _ in 0..count {
                    let net_id = reader.read_packed_u32()?;
                    let (_, mut body) = reader.read_message()?;
                    components.push(ComponentData {
                        net_id,
                        payload: Bytes::copy_from_slice(body.take_rest()),
                    });
                }
                GameDataMessage::Spawn(SpawnMessage {
                    spawn_type,
                    owner_id,
                    flags,
                    components,
                })
            }
            tags::DESPAWN => GameDataMessage::Despawn {
                net_id: reader.read_packed_u32()?,
            },
            tags::SCENE_CHANGE => GameDataMessage::SceneChange {
                client_id: reader.read_packed_u32()?,
                scene: reader.read_string()?,
            },
            tags::READY => GameDataMessage::Ready {
                client_id: reader.read_packed_u32()?,
            },
            other => return Err(DecodeError::UnknownTag { tag: other }),
        };
        Ok(message)
    }
}

/// Which game data tags a decoder accepts. The worker owns a default table;
/// a room clones it and may register extension tags on top.
#[derive(Debug, Clone, Default)]
pub struct DecoderTable {
    extensions: Vec<u8>,
}

impl DecoderTable {
    /// Accept an additional tag; its payload is carried opaque.
    pub fn register_extension(&mut self, tag: u8) {
        if !self.extensions.contains(&tag) {
            self.extensions.push(tag);
        }
    }

    fn allows_extension(&self, tag: u8) -> bool {
        self.extensions.contains(&tag)
    }

    /// Decodes every message remaining in the reader. Unknown tags outside
    /// the extension set abort the whole envelope.
    pub fn decode_all(
        &self,
        reader: &mut PacketReader<'_>,
    ) -> Result<Vec<GameDataMessage>, DecodeError> {
        let mut messages = Vec::new();
        while !reader.is_empty() {
            let (tag, mut body) = reader.read_message()?;
            match GameDataMessage::decode_one(tag, &mut body) {
                Ok(message) => messages.push(message),
                Err(DecodeError::UnknownTag { tag }) if self.allows_extension(tag) => {
                    messages.push(GameDataMessage::Extension {
                        tag,
                        payload: Bytes::copy_from_slice(body.take_rest()),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(messages: Vec<GameDataMessage>) -> Vec<GameDataMessage> {
        let mut writer = PacketWriter::new();
        for message in &messages {
            message.encode(&mut writer);
        }
        let bytes = writer.into_bytes();
        let decoded = DecoderTable::default()
            .decode_all(&mut PacketReader::new(&bytes))
            .unwrap();
        assert_eq!(decoded, messages);
        decoded
    }

    #[test]
    fn envelope_round_trips() {
        round_trip(vec![
            GameDataMessage::Data {
                net_id: 7,
                payload: Bytes::from_static(&[1, 2, 3]),
            },
            GameDataMessage::Rpc {
                net_id: 7,
                rpc: Rpc::CheckName { name: "Alice".into() },
            },
            GameDataMessage::SceneChange {
                client_id: 1001,
                scene: "OnlineGame".into(),
            },
            GameDataMessage::Ready { client_id: 1001 },
            GameDataMessage::Despawn { net_id: 7 },
        ]);
    }

    #[test]
    fn spawn_round_trips_with_components() {
        round_trip(vec![GameDataMessage::Spawn(SpawnMessage {
            spawn_type: 4,
            owner_id: 1001,
            flags: 1,
            components: vec![
                ComponentData { net_id: 1, payload: Bytes::from_static(&[9, 9]) },
                ComponentData { net_id: 2, payload: Bytes::new() },
                ComponentData { net_id: 3, payload: Bytes::from_static(&[0xFF]) },
            ],
        })]);
    }

    #[test]
    fn unknown_tag_without_registration_is_rejected() {
        let mut writer = PacketWriter::new();
        GameDataMessage::Extension {
            tag: 99,
            payload: Bytes::from_static(&[5]),
        }
        .encode(&mut writer);
        let bytes = writer.into_bytes();

        let err = DecoderTable::default()
            .decode_all(&mut PacketReader::new(&bytes))
            .unwrap_err();
        assert_eq!(err, DecodeError::UnknownTag { tag: 99 });
    }

    #[test]
    fn registered_extension_passes_through() {
        let mut table = DecoderTable::default();
        table.register_extension(99);

        let mut writer = PacketWriter::new();
        GameDataMessage::Extension {
            tag: 99,
            payload: Bytes::from_static(&[5, 6]),
        }
        .encode(&mut writer);
        let bytes = writer.into_bytes();

        let decoded = table.decode_all(&mut PacketReader::new(&bytes)).unwrap();
        assert_eq!(
            decoded,
            vec![GameDataMessage::Extension {
                tag: 99,
                payload: Bytes::from_static(&[5, 6]),
            }]
        );
    }
}
