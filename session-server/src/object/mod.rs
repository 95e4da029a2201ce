//! The per-room registry of replicated objects.
//!
//! Every networked component lives here, indexed by net id. Spawns either
//! originate locally (the server instantiates a prefab and allocates ids)
//! or arrive from a client, in which case the allocator is advanced past
//! every observed id so later local spawns cannot collide.

pub mod components;

use std::collections::HashMap;

use bytes::Bytes;

use protocol::codec::{PacketReader, PacketWriter};
use protocol::game::{ComponentData, SpawnMessage};
use protocol::{GameMap, SpawnType};

use crate::config::UnknownObjectPolicy;
use crate::error::ServerError;
use components::ComponentKind;

/// A live replicated component.
#[derive(Debug, Clone, PartialEq)]
pub struct NetComponent {
    pub net_id: u32,
    pub owner_id: i32,
    pub spawn_type: u32,
    pub flags: u8,
    /// Per-field mask; any non-zero value queues a data message this tick.
    pub dirty: u32,
    pub kind: ComponentKind,
}

impl NetComponent {
    /// Serializes the component. Returns `None` when nothing was written.
    pub fn serialize(&mut self, spawn: bool) -> Option<Bytes> {
        self.kind.pre_serialize();
        let mut writer = PacketWriter::new();
        let wrote_any = self.kind.serialize(&mut writer, spawn, if spawn { u32::MAX } else { self.dirty });
        if !spawn {
            self.dirty = 0;
        }
        wrote_any.then(|| writer.into_bytes())
    }
}

/// Ordered component template of one spawn type.
fn prefab(spawn_type: SpawnType) -> Vec<ComponentKind> {
    match spawn_type {
        SpawnType::Player => vec![
            ComponentKind::PlayerControl { is_new: true, player_id: 0 },
            ComponentKind::PlayerPhysics { in_vent: None },
            ComponentKind::NetworkTransform {
                sequence: 0,
                position: Default::default(),
                velocity: Default::default(),
            },
        ],
        SpawnType::LobbyBehaviour => vec![ComponentKind::LobbyBehaviour],
        SpawnType::GameData => vec![
            ComponentKind::GameData { players: Vec::new() },
            ComponentKind::VoteBanSystem { votes: Vec::new() },
        ],
        SpawnType::MeetingHud => vec![ComponentKind::MeetingHud { states: Vec::new() }],
        SpawnType::ShipStatus => vec![ComponentKind::ShipStatus { map: GameMap::Skeld }],
        SpawnType::Headquarters => vec![ComponentKind::ShipStatus { map: GameMap::MiraHq }],
        SpawnType::PlanetMap => vec![ComponentKind::ShipStatus { map: GameMap::Polus }],
        SpawnType::AprilShipStatus => vec![ComponentKind::ShipStatus { map: GameMap::AprilSkeld }],
        SpawnType::Airship => vec![ComponentKind::ShipStatus { map: GameMap::Airship }],
    }
}

/// Registry of all replicated objects of one room.
pub struct ObjectGraph {
    components: HashMap<u32, NetComponent>,
    incr_net_id: u32,
    unknown_policy: UnknownObjectPolicy,
}

impl ObjectGraph {
    pub fn new(unknown_policy: UnknownObjectPolicy) -> Self {
        ObjectGraph {
            components: HashMap::new(),
            incr_net_id: 0,
            unknown_policy,
        }
    }

    /// Allocates the next net id. Monotonic for the room's lifetime.
    fn next_net_id(&mut self) -> u32 {
        self.incr_net_id += 1;
        self.incr_net_id
    }

    /// Highest id handed out or observed so far.
    pub fn current_net_id(&self) -> u32 {
        self.incr_net_id
    }

    pub fn get(&self, net_id: u32) -> Option<&NetComponent> {
        self.components.get(&net_id)
    }

    pub fn get_mut(&mut self, net_id: u32) -> Option<&mut NetComponent> {
        self.components.get_mut(&net_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetComponent> {
        self.components.values()
    }

    /// Finds the component of the given owner matching a predicate.
    pub fn find_owned(
        &self,
        owner_id: i32,
        predicate: impl Fn(&ComponentKind) -> bool,
    ) -> Option<&NetComponent> {
        self.components
            .values()
            .find(|c| c.owner_id == owner_id && predicate(&c.kind))
    }

    /// First component anywhere matching a predicate (room-owned
    /// singletons like the game data block).
    pub fn find(&self, predicate: impl Fn(&ComponentKind) -> bool) -> Option<&NetComponent> {
        self.components.values().find(|c| predicate(&c.kind))
    }

    pub fn find_mut(
        &mut self,
        predicate: impl Fn(&ComponentKind) -> bool,
    ) -> Option<&mut NetComponent> {
        self.components.values_mut().find(|c| predicate(&c.kind))
    }

    /// Instantiates a prefab locally and returns the wire message that
    /// announces it.
    pub fn spawn_prefab(
        &mut self,
        spawn_type: SpawnType,
        owner_id: i32,
        flags: u8,
    ) -> SpawnMessage {
        let mut message = SpawnMessage {
            spawn_type: spawn_type as u32,
            owner_id,
            flags,
            components: Vec::new(),
        };
        for kind in prefab(spawn_type) {
            let net_id = self.next_net_id();
            let mut component = NetComponent {
                net_id,
                owner_id,
                spawn_type: spawn_type as u32,
                flags,
                dirty: 0,
                kind,
            };
            let payload = component.serialize(true).unwrap_or_default();
            message.components.push(ComponentData { net_id, payload });
            self.components.insert(net_id, component);
        }
        message
    }

    /// Applies a spawn received from a client. Unknown templates go
    /// through the configured policy.
    pub fn apply_spawn(&mut self, message: &SpawnMessage) -> Result<(), ServerError> {
        let slots = match SpawnType::from_u32(message.spawn_type) {
            Some(spawn_type) => {
                let slots = prefab(spawn_type);
                if slots.len() != message.components.len() {
                    return Err(ServerError::Fatal(format!(
                        "spawn {:?} carries {} components, template has {}",
                        spawn_type,
                        message.components.len(),
                        slots.len()
                    )));
                }
                slots
            }
            None => {
                if !self.unknown_policy.allows(message.spawn_type) {
                    return Err(ServerError::PolicyViolation("unknown spawn type"));
                }
                message
                    .components
                    .iter()
                    .map(|_| ComponentKind::Unknown { payload: Bytes::new() })
                    .collect()
            }
        };

        for (slot, data) in slots.into_iter().zip(&message.components) {
            // Remote ids must never be re-issued locally.
            if data.net_id > self.incr_net_id {
                self.incr_net_id = data.net_id;
            }
            let mut component = NetComponent {
                net_id: data.net_id,
                owner_id: message.owner_id,
                spawn_type: message.spawn_type,
                flags: message.flags,
                dirty: 0,
                kind: slot,
            };
            component
                .kind
                .deserialize(&mut PacketReader::new(&data.payload), true)?;
            self.components.insert(data.net_id, component);
        }
        Ok(())
    }

    /// Removes one component. Returns it so callers can inspect the kind.
    pub fn despawn(&mut self, net_id: u32) -> Option<NetComponent> {
        self.components.remove(&net_id)
    }

    /// Removes everything a leaving client owned; returns the net ids.
    pub fn despawn_owned_by(&mut self, owner_id: i32) -> Vec<u32> {
        let ids: Vec<u32> = self
            .components
            .values()
            .filter(|c| c.owner_id == owner_id)
            .map(|c| c.net_id)
            .collect();
        for id in &ids {
            self.components.remove(id);
        }
        ids
    }

    /// Applies a data delta to the addressed component.
    pub fn deserialize_into(&mut self, net_id: u32, payload: &[u8]) -> Result<(), ServerError> {
        let component = self
            .components
            .get_mut(&net_id)
            .ok_or(ServerError::NotFound("data for unknown net id"))?;
        component
            .kind
            .deserialize(&mut PacketReader::new(payload), false)?;
        Ok(())
    }

    /// Runs the per-tick hook on every component and collects the serialized
    /// state of the ones that are dirty afterwards.
    pub fn drain_dirty(&mut self, delta: f32) -> Vec<(u32, Bytes)> {
        let mut out = Vec::new();
        // Deterministic order keeps the outbound stream stable.
        let mut ids: Vec<u32> = self.components.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let component = self.components.get_mut(&id).expect("id collected above");
            component.dirty |= component.kind.fixed_update(delta);
            if component.dirty != 0 {
                if let Some(payload) = component.serialize(false) {
                    out.push((id, payload));
                } else {
                    component.dirty = 0;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> ObjectGraph {
        ObjectGraph::new(UnknownObjectPolicy::Flag(false))
    }

    #[test]
    fn net_ids_are_monotonic_and_unique() {
        let mut graph = graph();
        let player = graph.spawn_prefab(SpawnType::Player, 1001, 1);
        let lobby = graph.spawn_prefab(SpawnType::LobbyBehaviour, -2, 0);
        let mut seen: Vec<u32> = player
            .components
            .iter()
            .chain(lobby.components.iter())
            .map(|c| c.net_id)
            .collect();
        let sorted = seen.clone();
        seen.dedup();
        assert_eq!(seen, sorted, "ids are strictly increasing");
        assert_eq!(graph.current_net_id(), 4);
    }

    #[test]
    fn remote_spawn_advances_the_allocator() {
        let mut graph = graph();
        let mut remote = graph.spawn_prefab(SpawnType::Player, 1001, 0);
        graph = ObjectGraph::new(UnknownObjectPolicy::Flag(false));
        // Pretend the ids came from a peer that is far ahead.
        for (offset, component) in remote.components.iter_mut().enumerate() {
            component.net_id = 50 + offset as u32;
        }
        graph.apply_spawn(&remote).unwrap();
        let next = graph.spawn_prefab(SpawnType::LobbyBehaviour, -2, 0);
        assert_eq!(next.components[0].net_id, 53);
    }

    #[test]
    fn spawn_round_trip_is_byte_equal() {
        let mut source = graph();
        let message = source.spawn_prefab(SpawnType::Player, 1001, 1);

        let mut replica = graph();
        replica.apply_spawn(&message).unwrap();

        for data in &message.components {
            let component = replica.get_mut(data.net_id).unwrap();
            let payload = component.serialize(true).unwrap_or_default();
            assert_eq!(payload, data.payload, "component {}", data.net_id);
        }
    }

    #[test]
    fn unknown_spawn_respects_policy() {
        let mut strict = graph();
        let message = SpawnMessage {
            spawn_type: 77,
            owner_id: -2,
            flags: 0,
            components: vec![ComponentData { net_id: 9, payload: Bytes::from_static(&[1]) }],
        };
        assert!(matches!(
            strict.apply_spawn(&message),
            Err(ServerError::PolicyViolation(_))
        ));

        let mut lenient = ObjectGraph::new(UnknownObjectPolicy::Flag(true));
        lenient.apply_spawn(&message).unwrap();
        let component = lenient.get(9).unwrap();
        assert!(matches!(&component.kind, ComponentKind::Unknown { payload } if payload[..] == [1]));
    }

    #[test]
    fn despawn_leaves_no_references() {
        let mut graph = graph();
        let message = graph.spawn_prefab(SpawnType::Player, 1001, 0);
        let ids = graph.despawn_owned_by(1001);
        assert_eq!(ids.len(), message.components.len());
        for id in ids {
            assert!(graph.get(id).is_none());
        }
        // The allocator never reuses freed ids.
        let lobby = graph.spawn_prefab(SpawnType::LobbyBehaviour, -2, 0);
        assert_eq!(lobby.components[0].net_id, 4);
    }

    #[test]
    fn dirty_components_serialize_once() {
        let mut graph = graph();
        graph.spawn_prefab(SpawnType::GameData, -2, 0);
        let game_data_id = graph.find(|k| matches!(k, ComponentKind::GameData { .. })).unwrap().net_id;
        {
            let component = graph.get_mut(game_data_id).unwrap();
            if let ComponentKind::GameData { players } = &mut component.kind {
                players.push(components::PlayerInfo::new(0));
            }
            component.dirty |= 1;
        }
        let first = graph.drain_dirty(0.05);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, game_data_id);
        // Mask cleared after serialization.
        assert!(graph.drain_dirty(0.05).is_empty());
    }
}
