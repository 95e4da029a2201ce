//! The outermost wire layers: transport packets (reliability framing,
//! hello, disconnect, acks, pings) and the root messages they carry.
//! Root messages are direction specific, so serverbound and clientbound
//! get their own types; both encode, so tests can forge either side.

use bytes::Bytes;

use crate::codec::{DecodeError, PacketReader, PacketWriter};
use crate::settings::GameSettings;
use crate::{DisconnectReason, Language, Platform};

/// Transport packet kinds. Stable values.
pub mod kind {
    pub const UNRELIABLE: u8 = 0;
    pub const RELIABLE: u8 = 1;
    pub const HELLO: u8 = 8;
    pub const DISCONNECT: u8 = 9;
    pub const ACK: u8 = 10;
    pub const PING: u8 = 12;
}

/// Root message tags. Stable values.
pub mod root {
    pub const HOST_GAME: u8 = 0;
    pub const JOIN_GAME: u8 = 1;
    pub const START_GAME: u8 = 2;
    pub const REMOVE_GAME: u8 = 3;
    pub const REMOVE_PLAYER: u8 = 4;
    pub const GAME_DATA: u8 = 5;
    pub const GAME_DATA_TO: u8 = 6;
    pub const JOINED_GAME: u8 = 7;
    pub const END_GAME: u8 = 8;
    pub const ALTER_GAME: u8 = 10;
    pub const KICK_PLAYER: u8 = 11;
    pub const WAIT_FOR_HOST: u8 = 12;
    pub const REDIRECT: u8 = 13;
}

/// Identity a client announces in its hello packet.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloInfo {
    pub protocol_version: u8,
    pub client_version: i32,
    pub username: String,
    pub language: Language,
    pub chat_mode: u8,
    pub platform: Platform,
    pub platform_name: String,
}

impl HelloInfo {
    pub fn decode(reader: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(HelloInfo {
            protocol_version: reader.read_u8()?,
            client_version: reader.read_i32()?,
            username: reader.read_string()?,
            language: Language::from_u32(reader.read_u32()?),
            chat_mode: reader.read_u8()?,
            platform: Platform::from_u8(reader.read_u8()?),
            platform_name: reader.read_string()?,
        })
    }

    pub fn encode(&self, writer: &mut PacketWriter) {
        writer.write_u8(self.protocol_version);
        writer.write_i32(self.client_version);
        writer.write_string(&self.username);
        writer.write_u32(self.language as u32);
        writer.write_u8(self.chat_mode);
        writer.write_u8(self.platform as u8);
        writer.write_string(&self.platform_name);
    }
}

/// One datagram, classified by its kind byte. Reliable and unreliable
/// payloads stay raw here; root message decoding happens a layer up, once
/// the transport has done its nonce bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Unreliable { payload: Bytes },
    Reliable { nonce: u16, payload: Bytes },
    Hello { nonce: u16, hello: HelloInfo },
    Disconnect { reason: Option<DisconnectReason>, message: Option<String> },
    Ack { nonce: u16, mask: u8 },
    Ping { nonce: u16 },
}

impl Packet {
    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = PacketReader::new(datagram);
        let packet = match reader.read_u8()? {
            kind::UNRELIABLE => Packet::Unreliable {
                payload: Bytes::copy_from_slice(reader.take_rest()),
            },
            kind::RELIABLE => Packet::Reliable {
                nonce: reader.read_u16_be()?,
                payload: Bytes::copy_from_slice(reader.take_rest()),
            },
            kind::HELLO => Packet::Hello {
                nonce: reader.read_u16_be()?,
                hello: HelloInfo::decode(&mut reader)?,
            },
            kind::DISCONNECT => {
                if reader.is_empty() {
                    Packet::Disconnect { reason: None, message: None }
                } else {
                    // Forced flag, then a framed reason body.
                    let _forced = reader.read_u8()?;
                    let (_, mut body) = reader.read_message()?;
                    let reason = DisconnectReason::from_u8(body.read_u8()?)
                        .unwrap_or(DisconnectReason::Error);
                    let message = if reason == DisconnectReason::Custom {
                        Some(body.read_string()?)
                    } else {
                        None
                    };
                    Packet::Disconnect { reason: Some(reason), message }
                }
            }
            kind::ACK => Packet::Ack {
                nonce: reader.read_u16_be()?,
                mask: reader.read_u8()?,
            },
            kind::PING => Packet::Ping {
                nonce: reader.read_u16_be()?,
            },
            tag => return Err(DecodeError::UnknownTag { tag }),
        };
        Ok(packet)
    }

    pub fn encode(&self) -> Bytes {
        let mut writer = PacketWriter::new();
        match self {
            Packet::Unreliable { payload } => {
                writer.write_u8(kind::UNRELIABLE);
                writer.write_raw(payload);
            }
            Packet::Reliable { nonce, payload } => {
                writer.write_u8(kind::RELIABLE);
                writer.write_u16_be(*nonce);
                writer.write_raw(payload);
            }
            Packet::Hello { nonce, hello } => {
                writer.write_u8(kind::HELLO);
                writer.write_u16_be(*nonce);
                hello.encode(&mut writer);
            }
            Packet::Disconnect { reason, message } => {
                writer.write_u8(kind::DISCONNECT);
                if let Some(reason) = reason {
                    writer.write_u8(1);
                    writer.start_message(0);
                    writer.write_u8(*reason as u8);
                    if *reason == DisconnectReason::Custom {
                        writer.write_string(message.as_deref().unwrap_or(""));
                    }
                    writer.end_message();
                }
            }
            Packet::Ack { nonce, mask } => {
                writer.write_u8(kind::ACK);
                writer.write_u16_be(*nonce);
                writer.write_u8(*mask);
            }
            Packet::Ping { nonce } => {
                writer.write_u8(kind::PING);
                writer.write_u16_be(*nonce);
            }
        }
        writer.into_bytes()
    }
}

/// Root messages a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRootMessage {
    HostGame { settings: GameSettings },
    JoinGame { code: i32 },
    StartGame { code: i32 },
    EndGame { code: i32, reason: u8 },
    GameData { code: i32, payload: Bytes },
    GameDataTo { code: i32, target: u32, payload: Bytes },
    AlterGame { code: i32, alter_tag: u8, value: u8 },
    KickPlayer { code: i32, client_id: u32, banned: bool },
}

impl ClientRootMessage {
    /// Decodes every root message in a reliable or unreliable payload.
    pub fn decode_all(reader: &mut PacketReader<'_>) -> Result<Vec<Self>, DecodeError> {
        let mut messages = Vec::new();
        while !reader.is_empty() {
            let (tag, mut body) = reader.read_message()?;
            let message = match tag {
                root::HOST_GAME => ClientRootMessage::HostGame {
                    settings: GameSettings::decode(&mut body)?,
                },
                root::JOIN_GAME => ClientRootMessage::JoinGame {
                    code: body.read_i32()?,
                },
                root::START_GAME => ClientRootMessage::StartGame {
                    code: body.read_i32()?,
                },
                root::END_GAME => ClientRootMessage::EndGame {
                    code: body.read_i32()?,
                    reason: body.read_u8()?,
                },
                root::GAME_DATA => ClientRootMessage::GameData {
                    code: body.read_i32()?,
                    payload: Bytes::copy_from_slice(body.take_rest()),
                },
                root::GAME_DATA_TO => ClientRootMessage::GameDataTo {
                    code: body.read_i32()?,
                    target: body.read_packed_u32()?,
                    payload: Bytes::copy_from_slice(body.take_rest()),
                },
                root::ALTER_GAME => ClientRootMessage::AlterGame {
                    code: body.read_i32()?,
                    alter_tag: body.read_u8()?,
                    value: body.read_u8()?,
                },
                root::KICK_PLAYER => ClientRootMessage::KickPlayer {
                    code: body.read_i32()?,
                    client_id: body.read_packed_u32()?,
                    banned: body.read_bool()?,
                },
                tag => return Err(DecodeError::UnknownTag { tag }),
            };
            messages.push(message);
        }
        Ok(messages)
    }

    pub fn encode(&self, writer: &mut PacketWriter) {
        match self {
            ClientRootMessage::HostGame { settings } => {
                writer.start_message(root::HOST_GAME);
                settings.encode(writer);
                writer.end_message();
            }
            ClientRootMessage::JoinGame { code } => {
                writer.start_message(root::JOIN_GAME);
                writer.write_i32(*code);
                writer.end_message();
            }
            ClientRootMessage::StartGame { code } => {
                writer.start_message(root::START_GAME);
                writer.write_i32(*code);
                writer.end_message();
            }
            ClientRootMessage::EndGame { code, reason } => {
                writer.start_message(root::END_GAME);
                writer.write_i32(*code);
                writer.write_u8(*reason);
                writer.end_message();
            }
            ClientRootMessage::GameData { code, payload } => {
                writer.start_message(root::GAME_DATA);
                writer.write_i32(*code);
                writer.write_raw(payload);
                writer.end_message();
            }
            ClientRootMessage::GameDataTo { code, target, payload } => {
                writer.start_message(root::GAME_DATA_TO);
                writer.write_i32(*code);
                writer.write_packed_u32(*target);
                writer.write_raw(payload);
                writer.end_message();
            }
            ClientRootMessage::AlterGame { code, alter_tag, value } => {
                writer.start_message(root::ALTER_GAME);
                writer.write_i32(*code);
                writer.write_u8(*alter_tag);
                writer.write_u8(*value);
                writer.end_message();
            }
            ClientRootMessage::KickPlayer { code, client_id, banned } => {
                writer.start_message(root::KICK_PLAYER);
                writer.write_i32(*code);
                writer.write_packed_u32(*client_id);
                writer.write_bool(*banned);
                writer.end_message();
            }
        }
    }
}

/// Root messages the server sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRootMessage {
    HostGame { code: i32 },
    JoinGame { code: i32, client_id: u32, host_id: u32 },
    StartGame { code: i32 },
    RemoveGame { reason: u8 },
    RemovePlayer { code: i32, client_id: u32, host_id: u32, reason: u8 },
    GameData { code: i32, payload: Bytes },
    GameDataTo { code: i32, target: u32, payload: Bytes },
    JoinedGame { code: i32, client_id: u32, host_id: u32, others: Vec<u32> },
    EndGame { code: i32, reason: u8, show_ad: bool },
    AlterGame { code: i32, alter_tag: u8, value: u8 },
    KickPlayer { code: i32, client_id: u32, banned: bool },
    WaitForHost { code: i32, client_id: u32 },
    Redirect { ip: [u8; 4], port: u16 },
}

impl ServerRootMessage {
    pub fn encode(&self, writer: &mut PacketWriter) {
        match self {
            ServerRootMessage::HostGame { code } => {
                writer.start_message(root::HOST_GAME);
                writer.write_i32(*code);
                writer.end_message();
            }
            ServerRootMessage::JoinGame { code, client_id, host_id } => {
                writer.start_message(root::JOIN_GAME);
                writer.write_i32(*code);
                writer.write_u32(*client_id);
                writer.write_u32(*host_id);
                writer.end_message();
            }
            ServerRootMessage::StartGame { code } => {
                writer.start_message(root::START_GAME);
                writer.write_i32(*code);
                writer.end_message();
            }
            ServerRootMessage::RemoveGame { reason } => {
                writer.start_message(root::REMOVE_GAME);
                writer.write_u8(*reason);
                writer.end_message();
            }
            ServerRootMessage::RemovePlayer { code, client_id, host_id, reason } => {
                writer.start_message(root::REMOVE_PLAYER);
                writer.write_i32(*code);
                writer.write_u32(*client_id);
                writer.write_u32(*host_id);
                writer.write_u8(*reason);
                writer.end_message();
            }
            ServerRootMessage::GameData { code, payload } => {
                writer.start_message(root::GAME_DATA);
                writer.write_i32(*code);
                writer.write_raw(payload);
                writer.end_message();
            }
            ServerRootMessage::GameDataTo { code, target, payload } => {
                writer.start_message(root::GAME_DATA_TO);
                writer.write_i32(*code);
                writer.write_packed_u32(*target);
                writer.write_raw(payload);
                writer.end_message();
            }
            ServerRootMessage::JoinedGame { code, client_id, host_id, others } => {
                writer.start_message(root::JOINED_GAME);
                writer.write_i32(*code);
                writer.write_u32(*client_id);
                writer.write_u32(*host_id);
                writer.write_packed_u32(others.len() as u32);
                for other in others {
                    writer.write_packed_u32(*other);
                }
                writer.end_message();
            }
            ServerRootMessage::EndGame { code, reason, show_ad } => {
                writer.start_message(root::END_GAME);
                writer.write_i32(*code);
                writer.write_u8(*reason);
                writer.write_bool(*show_ad);
                writer.end_message();
            }
            ServerRootMessage::AlterGame { code, alter_tag, value } => {
                writer.start_message(root::ALTER_GAME);
                writer.write_i32(*code);
                writer.write_u8(*alter_tag);
                writer.write_u8(*value);
                writer.end_message();
            }
            ServerRootMessage::KickPlayer { code, client_id, banned } => {
                writer.start_message(root::KICK_PLAYER);
                writer.write_i32(*code);
                writer.write_packed_u32(*client_id);
                writer.write_bool(*banned);
                writer.end_message();
            }
            ServerRootMessage::WaitForHost { code, client_id } => {
                writer.start_message(root::WAIT_FOR_HOST);
                writer.write_i32(*code);
                writer.write_u32(*client_id);
                writer.end_message();
            }
            ServerRootMessage::Redirect { ip, port } => {
                writer.start_message(root::REDIRECT);
                for octet in ip {
                    writer.write_u8(*octet);
                }
                writer.write_u16(*port);
                writer.end_message();
            }
        }
    }

    /// Decodes clientbound messages; exists so tests can assert on what a
    /// simulated client receives.
    pub fn decode_all(reader: &mut PacketReader<'_>) -> Result<Vec<Self>, DecodeError> {
        let mut messages = Vec::new();
        while !reader.is_empty() {
            let (tag, mut body) = reader.read_message()?;
            let message = match tag {
                root::HOST_GAME => ServerRootMessage::HostGame { code: body.read_i32()? },
                root::JOIN_GAME => ServerRootMessage::JoinGame {
                    code: body.read_i32()?,
                    client_id: body.read_u32()?,
                    host_id: body.read_u32()?,
                },
                root::START_GAME => ServerRootMessage::StartGame { code: body.read_i32()? },
                root::REMOVE_GAME => ServerRootMessage::RemoveGame { reason: body.read_u8()? },
                root::REMOVE_PLAYER => ServerRootMessage::RemovePlayer {
                    code: body.read_i32()?,
                    client_id: body.read_u32()?,
                    host_id: body.read_u32()?,
                    reason: body.read_u8()?,
                },
                root::GAME_DATA => ServerRootMessage::GameData {
                    code: body.read_i32()?,
                    payload: Bytes::copy_from_slice(body.take_rest()),
                },
                root::GAME_DATA_TO => ServerRootMessage::GameDataTo {
                    code: body.read_i32()?,
                    target: body.read_packed_u32()?,
                    payload: Bytes::copy_from_slice(body.take_rest()),
                },
                root::JOINED_GAME => {
                    let code = body.read_i32()?;
                    let client_id = body.read_u32()?;
                    let host_id = body.read_u32()?;
                    let count = body.read_packed_u32()? as usize;
                    let mut others = Vec::with_capacity(count.min(32));
                    for _ in 0..count {
                        others.push(body.read_packed_u32()?);
                    }
                    ServerRootMessage::JoinedGame { code, client_id, host_id, others }
                }
                root::END_GAME => ServerRootMessage::EndGame {
                    code: body.read_i32()?,
                    reason: body.read_u8()?,
                    show_ad: body.read_bool()?,
                },
                root::ALTER_GAME => ServerRootMessage::AlterGame {
                    code: body.read_i32()?,
                    alter_tag: body.read_u8()?,
                    value: body.read_u8()?,
                },
                root::KICK_PLAYER => ServerRootMessage::KickPlayer {
                    code: body.read_i32()?,
                    client_id: body.read_packed_u32()?,
                    banned: body.read_bool()?,
                },
                root::WAIT_FOR_HOST => ServerRootMessage::WaitForHost {
                    code: body.read_i32()?,
                    client_id: body.read_u32()?,
                },
                root::REDIRECT => {
                    let ip = [
                        body.read_u8()?,
                        body.read_u8()?,
                        body.read_u8()?,
                        body.read_u8()?,
                    ];
                    ServerRootMessage::Redirect { ip, port: body.read_u16()? }
                }
                tag => return Err(DecodeError::UnknownTag { tag }),
            };
            messages.push(message);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_packets_round_trip() {
        let packets = vec![
            Packet::Reliable {
                nonce: 517,
                payload: Bytes::from_static(&[1, 2, 3]),
            },
            Packet::Unreliable { payload: Bytes::from_static(&[9]) },
            Packet::Ack { nonce: 517, mask: 0b0000_0011 },
            Packet::Ping { nonce: 518 },
            Packet::Disconnect {
                reason: Some(DisconnectReason::Banned),
                message: None,
            },
            Packet::Disconnect {
                reason: Some(DisconnectReason::Custom),
                message: Some("tournament over".into()),
            },
            Packet::Disconnect { reason: None, message: None },
        ];
        for packet in packets {
            let bytes = packet.encode();
            assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn reliable_nonce_is_big_endian() {
        let bytes = Packet::Reliable { nonce: 0x0102, payload: Bytes::new() }.encode();
        assert_eq!(&bytes[..], &[kind::RELIABLE, 0x01, 0x02]);
    }

    #[test]
    fn hello_round_trips() {
        let hello = HelloInfo {
            protocol_version: 1,
            client_version: 50_537_300,
            username: "Alice".into(),
            language: Language::German,
            chat_mode: 1,
            platform: Platform::StandaloneSteam,
            platform_name: "Steam".into(),
        };
        let packet = Packet::Hello { nonce: 1, hello: hello.clone() };
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, Packet::Hello { nonce: 1, hello });
    }

    #[test]
    fn serverbound_roots_round_trip() {
        let messages = vec![
            ClientRootMessage::HostGame { settings: GameSettings::default() },
            ClientRootMessage::JoinGame { code: -1998843519 },
            ClientRootMessage::StartGame { code: -1998843519 },
            ClientRootMessage::GameData {
                code: -1998843519,
                payload: Bytes::from_static(&[0, 0, 1, 5]),
            },
            ClientRootMessage::GameDataTo {
                code: -1998843519,
                target: 1001,
                payload: Bytes::new(),
            },
            ClientRootMessage::KickPlayer {
                code: -1998843519,
                client_id: 1002,
                banned: true,
            },
        ];
        let mut writer = PacketWriter::new();
        for message in &messages {
            message.encode(&mut writer);
        }
        let bytes = writer.into_bytes();
        let decoded = ClientRootMessage::decode_all(&mut PacketReader::new(&bytes)).unwrap();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn clientbound_roots_round_trip() {
        let messages = vec![
            ServerRootMessage::JoinedGame {
                code: -1998843519,
                client_id: 1001,
                host_id: crate::SERVER_HOST_ID,
                others: vec![1002, 1003],
            },
            ServerRootMessage::RemovePlayer {
                code: -1998843519,
                client_id: 1002,
                host_id: 1001,
                reason: DisconnectReason::Error as u8,
            },
            ServerRootMessage::AlterGame {
                code: -1998843519,
                alter_tag: crate::ALTER_GAME_PRIVACY,
                value: 0,
            },
            ServerRootMessage::WaitForHost { code: -1998843519, client_id: 1002 },
            ServerRootMessage::Redirect { ip: [127, 0, 0, 1], port: 22023 },
        ];
        let mut writer = PacketWriter::new();
        for message in &messages {
            message.encode(&mut writer);
        }
        let bytes = writer.into_bytes();
        let decoded = ServerRootMessage::decode_all(&mut PacketReader::new(&bytes)).unwrap();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn truncated_root_fails() {
        // JoinGame frame that promises 4 bytes but carries 2.
        let bytes = [0x04, 0x00, root::JOIN_GAME, 0xAA, 0xBB];
        assert!(ClientRootMessage::decode_all(&mut PacketReader::new(&bytes)).is_err());
    }
}
