//! Inbound RPC gatekeeper. Every call a client sends runs through the
//! ordered checks in here before the room applies it: does the target
//! exist, does the sender own it, is the tag legal for the sender's role
//! and the room's host mode, and does it sit on the right component class.
//! Findings become [`Infraction`] records buffered per room.

use protocol::rpc::{tags, Rpc};
use protocol::{GameMap, MAX_COLOR_ID, MAX_FREE_HAT_ID, MAX_FREE_PET_ID, MAX_FREE_SKIN_ID};

use crate::auth::User;
use crate::metrics::{Infraction, Severity};
use crate::object::NetComponent;
use std::time::SystemTime;

/// Buffered infractions beyond this count trigger an early flush.
pub const FLUSH_THRESHOLD: usize = 100;

/// In-game role, used by the per-role exception table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Crewmate,
    Impostor,
}

/// Infractions a role is allowed to cause without being recorded. This is
/// how impostors vent and kill without tripping the rules built for
/// crewmates.
pub fn anticheat_exceptions(role: Role) -> &'static [&'static str] {
    match role {
        Role::Impostor => &["ForbiddenRpcVent", "ForbiddenRpcMurder"],
        Role::Crewmate => &[],
    }
}

/// What the room should do with a checked RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Suppress,
}

/// Everything the checks need to know about the sender and the room at
/// the moment the RPC arrived.
pub struct RpcContext<'a> {
    pub sender_client_id: u32,
    pub sender_player_id: Option<u8>,
    pub sender_role: Role,
    pub sender_is_acting_host: bool,
    pub server_as_host: bool,
    pub map: GameMap,
    pub component: &'a NetComponent,
    pub user: Option<&'a User>,
    /// Whether the sender already cast a vote this meeting.
    pub already_voted: bool,
    /// For a cast vote: suspect is alive, or the skip sentinel 255.
    pub suspect_alive_or_skip: bool,
    pub ping_ms: u32,
}

/// Tags only the authoritative host may send.
fn is_host_only(rpc: &Rpc) -> bool {
    matches!(
        rpc.tag(),
        tags::CLOSE
            | tags::EXILED
            | tags::MURDER_PLAYER
            | tags::SET_INFECTED
            | tags::SET_TASKS
            | tags::START_MEETING
            | tags::SYNC_SETTINGS
            | tags::VOTING_COMPLETE
            | tags::BOOT_FROM_VENT
            | tags::SET_NAME
            | tags::SET_COLOR
    )
}

/// Which component class carries a given tag. `None` means the tag is not
/// class restricted.
fn expected_component(rpc: &Rpc) -> Option<&'static str> {
    Some(match rpc.tag() {
        tags::ENTER_VENT | tags::EXIT_VENT | tags::BOOT_FROM_VENT | tags::CLIMB_LADDER => {
            "PlayerPhysics"
        }
        tags::SNAP_TO => "CustomNetworkTransform",
        tags::CHECK_NAME | tags::SET_NAME | tags::CHECK_COLOR | tags::SET_COLOR
        | tags::SET_HAT | tags::SET_PET | tags::SET_SKIN | tags::SEND_CHAT
        | tags::SEND_CHAT_NOTE | tags::SYNC_SETTINGS | tags::SET_INFECTED
        | tags::SET_START_COUNTER | tags::START_MEETING | tags::REPORT_DEAD_BODY
        | tags::MURDER_PLAYER | tags::PLAY_ANIMATION | tags::COMPLETE_TASK
        | tags::SET_SCANNER | tags::EXILED => "PlayerControl",
        tags::CAST_VOTE | tags::CLEAR_VOTE | tags::VOTING_COMPLETE | tags::CLOSE => "MeetingHud",
        tags::REPAIR_SYSTEM | tags::CLOSE_DOORS_OF_TYPE => "ShipStatus",
        tags::ADD_VOTE => "VoteBanSystem",
        tags::SET_TASKS | tags::UPDATE_GAME_DATA => "GameData",
        _ => return None,
    })
}

/// The per-room check pipeline and infraction buffer.
pub struct AntiCheat {
    buffer: Vec<Infraction>,
}

impl Default for AntiCheat {
    fn default() -> Self {
        AntiCheat::new()
    }
}

impl AntiCheat {
    pub fn new() -> Self {
        AntiCheat { buffer: Vec::new() }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Takes the whole buffer for flushing.
    pub fn drain(&mut self) -> Vec<Infraction> {
        std::mem::take(&mut self.buffer)
    }

    /// Takes the buffer only once it crossed the flush threshold.
    pub fn drain_if_full(&mut self) -> Option<Vec<Infraction>> {
        (self.buffer.len() > FLUSH_THRESHOLD).then(|| self.drain())
    }

    fn record(
        &mut self,
        ctx: &RpcContext<'_>,
        name: &'static str,
        severity: Severity,
        details: String,
    ) {
        self.buffer.push(Infraction {
            user_id: ctx
                .user
                .map(|u| u.id.clone())
                .unwrap_or_else(|| format!("client:{}", ctx.sender_client_id)),
            game_id: None,
            created_at: SystemTime::now(),
            player_ping: ctx.ping_ms,
            name,
            details,
            severity,
        });
    }

    /// Records a rule hit unless the sender's role is excepted from it.
    /// Returns the verdict the rule asks for, `Allow` when excepted.
    fn rule_hit(
        &mut self,
        ctx: &RpcContext<'_>,
        name: &'static str,
        severity: Severity,
        details: String,
        on_hit: Verdict,
    ) -> Verdict {
        if anticheat_exceptions(ctx.sender_role).contains(&name) {
            return Verdict::Allow;
        }
        self.record(ctx, name, severity, details);
        on_hit
    }

    /// The target net id of an RPC did not resolve. Observational; stale
    /// ids race with despawn legitimately.
    pub fn unknown_target(&mut self, ctx_user: Option<&User>, sender: u32, ping: u32, net_id: u32) {
        self.buffer.push(Infraction {
            user_id: ctx_user
                .map(|u| u.id.clone())
                .unwrap_or_else(|| format!("client:{sender}")),
            game_id: None,
            created_at: SystemTime::now(),
            player_ping: ping,
            name: "UnknownRpcInnernetObject",
            details: format!("rpc targeted unknown net id {net_id}"),
            severity: Severity::Medium,
        });
    }

    /// Runs the ordered checks on one RPC.
    pub fn check_rpc(&mut self, ctx: &RpcContext<'_>, rpc: &Rpc) -> Verdict {
        // Ownership. Sender-owned sentinel (-1) counts as owned; room
        // owned objects (-2) are open to everyone and gated per tag below.
        if ctx.component.owner_id >= 0 && ctx.component.owner_id != ctx.sender_client_id as i32 {
            return self.rule_hit(
                ctx,
                "ForeignRpcInnernetObject",
                Severity::Critical,
                format!(
                    "{} on net id {} owned by {}",
                    rpc.name(),
                    ctx.component.net_id,
                    ctx.component.owner_id
                ),
                Verdict::Suppress,
            );
        }

        // Host-only tags while the server is the host. Acting hosts keep
        // their delegated authority.
        if ctx.server_as_host && !ctx.sender_is_acting_host && is_host_only(rpc) {
            return self.rule_hit(
                ctx,
                "ForbiddenRpcSaaH",
                Severity::Critical,
                format!("{} requires host authority", rpc.name()),
                Verdict::Suppress,
            );
        }

        // Component class match.
        if let Some(expected) = expected_component(rpc) {
            if ctx.component.kind.name() != expected {
                return self.rule_hit(
                    ctx,
                    "InvalidRpcComponent",
                    Severity::Critical,
                    format!(
                        "{} must be carried by {expected}, got {}",
                        rpc.name(),
                        ctx.component.kind.name()
                    ),
                    Verdict::Suppress,
                );
            }
        }

        match rpc {
            Rpc::CastVote { voter, suspect } => {
                if Some(*voter) != ctx.sender_player_id {
                    return self.rule_hit(
                        ctx,
                        "InvalidRpcVote",
                        Severity::High,
                        format!("vote cast as player {voter}"),
                        Verdict::Suppress,
                    );
                }
                if ctx.already_voted {
                    return self.rule_hit(
                        ctx,
                        "DoubleRpcVote",
                        Severity::High,
                        "second vote in one meeting".into(),
                        Verdict::Suppress,
                    );
                }
                if !ctx.suspect_alive_or_skip {
                    return self.rule_hit(
                        ctx,
                        "InvalidRpcVote",
                        Severity::High,
                        format!("vote against dead player {suspect}"),
                        Verdict::Suppress,
                    );
                }
                Verdict::Allow
            }
            Rpc::CheckName { name } => {
                if let Some(user) = ctx.user {
                    if user.display_name != *name {
                        return self.rule_hit(
                            ctx,
                            "InvalidRpcName",
                            Severity::Critical,
                            format!("requested name {name:?}"),
                            Verdict::Suppress,
                        );
                    }
                }
                Verdict::Allow
            }
            Rpc::CheckColor { color } => {
                if *color > MAX_COLOR_ID {
                    return self.rule_hit(
                        ctx,
                        "InvalidRpcColor",
                        Severity::Critical,
                        format!("color {color} outside the palette"),
                        Verdict::Suppress,
                    );
                }
                Verdict::Allow
            }
            Rpc::SetHat { hat } => self.check_cosmetic(ctx, "hat", *hat, MAX_FREE_HAT_ID),
            Rpc::SetPet { pet } => self.check_cosmetic(ctx, "pet", *pet, MAX_FREE_PET_ID),
            Rpc::SetSkin { skin } => self.check_cosmetic(ctx, "skin", *skin, MAX_FREE_SKIN_ID),
            Rpc::SnapTo { .. } => {
                if ctx.map != GameMap::Airship {
                    return self.rule_hit(
                        ctx,
                        "InvalidRpcTeleport",
                        Severity::Critical,
                        format!("snap-to on {:?}", ctx.map),
                        Verdict::Suppress,
                    );
                }
                Verdict::Allow
            }
            Rpc::SetStartCounter { .. } => {
                if ctx.server_as_host && !ctx.sender_is_acting_host {
                    return self.rule_hit(
                        ctx,
                        "ForbiddenRpcStartCounter",
                        Severity::Critical,
                        "start counter without host authority".into(),
                        Verdict::Suppress,
                    );
                }
                Verdict::Allow
            }
            Rpc::EnterVent { vent } | Rpc::ExitVent { vent } => {
                if ctx.sender_role != Role::Impostor {
                    return self.rule_hit(
                        ctx,
                        "ForbiddenRpcVent",
                        Severity::High,
                        format!("vent {vent} used by a crewmate"),
                        Verdict::Suppress,
                    );
                }
                Verdict::Allow
            }
            Rpc::MurderPlayer { target_net_id } => {
                if ctx.sender_role != Role::Impostor {
                    return self.rule_hit(
                        ctx,
                        "ForbiddenRpcMurder",
                        Severity::Critical,
                        format!("murder of net id {target_net_id} by a crewmate"),
                        Verdict::Suppress,
                    );
                }
                Verdict::Allow
            }
            _ => Verdict::Allow,
        }
    }

    fn check_cosmetic(
        &mut self,
        ctx: &RpcContext<'_>,
        what: &'static str,
        id: u32,
        free_limit: u32,
    ) -> Verdict {
        let owned = id <= free_limit || ctx.user.map(|u| u.owns_cosmetic(id)).unwrap_or(false);
        if owned {
            Verdict::Allow
        } else {
            self.rule_hit(
                ctx,
                "InvalidRpcCosmetic",
                Severity::Critical,
                format!("{what} {id} not owned"),
                Verdict::Suppress,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::components::ComponentKind;
    use protocol::SpawnType;

    fn component(kind: ComponentKind, owner_id: i32) -> NetComponent {
        NetComponent {
            net_id: 5,
            owner_id,
            spawn_type: SpawnType::Player as u32,
            flags: 0,
            dirty: 0,
            kind,
        }
    }

    fn ctx<'a>(component: &'a NetComponent, role: Role) -> RpcContext<'a> {
        RpcContext {
            sender_client_id: 1002,
            sender_player_id: Some(1),
            sender_role: role,
            sender_is_acting_host: false,
            server_as_host: true,
            map: GameMap::Skeld,
            component,
            user: None,
            already_voted: false,
            suspect_alive_or_skip: true,
            ping_ms: 42,
        }
    }

    #[test]
    fn crewmate_vent_is_suppressed_and_recorded() {
        let physics = component(ComponentKind::PlayerPhysics { in_vent: None }, 1002);
        let mut anticheat = AntiCheat::new();
        let verdict = anticheat.check_rpc(
            &ctx(&physics, Role::Crewmate),
            &Rpc::EnterVent { vent: 0 },
        );
        assert_eq!(verdict, Verdict::Suppress);
        let infractions = anticheat.drain();
        assert_eq!(infractions.len(), 1);
        assert_eq!(infractions[0].name, "ForbiddenRpcVent");
        assert_eq!(infractions[0].severity, Severity::High);
    }

    #[test]
    fn impostor_vent_is_excepted() {
        let physics = component(ComponentKind::PlayerPhysics { in_vent: None }, 1002);
        let mut anticheat = AntiCheat::new();
        let verdict = anticheat.check_rpc(
            &ctx(&physics, Role::Impostor),
            &Rpc::EnterVent { vent: 0 },
        );
        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(anticheat.buffered(), 0);
    }

    #[test]
    fn foreign_component_is_critical() {
        let control = component(ComponentKind::PlayerControl { is_new: false, player_id: 0 }, 1001);
        let mut anticheat = AntiCheat::new();
        let verdict = anticheat.check_rpc(
            &ctx(&control, Role::Crewmate),
            &Rpc::SendChat { message: "hi".into() },
        );
        assert_eq!(verdict, Verdict::Suppress);
        assert_eq!(anticheat.drain()[0].severity, Severity::Critical);
    }

    #[test]
    fn host_only_tag_from_plain_client_in_saah() {
        let control = component(ComponentKind::PlayerControl { is_new: false, player_id: 1 }, 1002);
        let mut anticheat = AntiCheat::new();
        let verdict = anticheat.check_rpc(
            &ctx(&control, Role::Crewmate),
            &Rpc::SetName { name: "Eve".into() },
        );
        assert_eq!(verdict, Verdict::Suppress);
        assert_eq!(anticheat.drain()[0].name, "ForbiddenRpcSaaH");
    }

    #[test]
    fn acting_host_keeps_host_tags() {
        let control = component(ComponentKind::PlayerControl { is_new: false, player_id: 1 }, 1002);
        let mut anticheat = AntiCheat::new();
        let mut context = ctx(&control, Role::Crewmate);
        context.sender_is_acting_host = true;
        let verdict = anticheat.check_rpc(
            &context,
            &Rpc::SyncSettings { settings: Default::default() },
        );
        assert_eq!(verdict, Verdict::Allow);
    }

    #[test]
    fn double_vote_is_high_and_suppressed() {
        let hud = component(ComponentKind::MeetingHud { states: vec![] }, -2);
        let mut anticheat = AntiCheat::new();
        let mut context = ctx(&hud, Role::Crewmate);
        context.already_voted = true;
        let verdict = anticheat.check_rpc(&context, &Rpc::CastVote { voter: 1, suspect: 255 });
        assert_eq!(verdict, Verdict::Suppress);
        let infractions = anticheat.drain();
        assert_eq!(infractions[0].name, "DoubleRpcVote");
        assert_eq!(infractions[0].severity, Severity::High);
    }

    #[test]
    fn wrong_component_class_is_critical() {
        // Vent RPC on the player control instead of the physics body.
        let control = component(ComponentKind::PlayerControl { is_new: false, player_id: 1 }, 1002);
        let mut anticheat = AntiCheat::new();
        let verdict = anticheat.check_rpc(
            &ctx(&control, Role::Impostor),
            &Rpc::EnterVent { vent: 2 },
        );
        assert_eq!(verdict, Verdict::Suppress);
        assert_eq!(anticheat.drain()[0].name, "InvalidRpcComponent");
    }

    #[test]
    fn snap_to_is_airship_only() {
        let transform = component(
            ComponentKind::NetworkTransform {
                sequence: 0,
                position: Default::default(),
                velocity: Default::default(),
            },
            1002,
        );
        let mut anticheat = AntiCheat::new();
        let rpc = Rpc::SnapTo { position: Default::default(), sequence: 1 };

        let verdict = anticheat.check_rpc(&ctx(&transform, Role::Crewmate), &rpc);
        assert_eq!(verdict, Verdict::Suppress);

        let mut airship = ctx(&transform, Role::Crewmate);
        airship.map = GameMap::Airship;
        assert_eq!(anticheat.check_rpc(&airship, &rpc), Verdict::Allow);
    }

    #[test]
    fn free_cosmetics_pass_and_paid_need_inventory() {
        let control = component(ComponentKind::PlayerControl { is_new: false, player_id: 1 }, 1002);
        let mut anticheat = AntiCheat::new();

        let verdict = anticheat.check_rpc(&ctx(&control, Role::Crewmate), &Rpc::SetHat { hat: 3 });
        assert_eq!(verdict, Verdict::Allow);

        let paid = Rpc::SetHat { hat: 4000 };
        assert_eq!(
            anticheat.check_rpc(&ctx(&control, Role::Crewmate), &paid),
            Verdict::Suppress
        );

        let owner = User {
            id: "u1".into(),
            display_name: "Alice".into(),
            owned_cosmetics: vec![4000],
        };
        let mut context = ctx(&control, Role::Crewmate);
        context.user = Some(&owner);
        assert_eq!(anticheat.check_rpc(&context, &paid), Verdict::Allow);
    }

    #[test]
    fn authenticated_name_must_match() {
        let control = component(ComponentKind::PlayerControl { is_new: false, player_id: 1 }, 1002);
        let user = User {
            id: "u1".into(),
            display_name: "Alice".into(),
            owned_cosmetics: vec![],
        };
        let mut anticheat = AntiCheat::new();
        let mut context = ctx(&control, Role::Crewmate);
        context.user = Some(&user);

        assert_eq!(
            anticheat.check_rpc(&context, &Rpc::CheckName { name: "Alice".into() }),
            Verdict::Allow
        );
        assert_eq!(
            anticheat.check_rpc(&context, &Rpc::CheckName { name: "NotAlice".into() }),
            Verdict::Suppress
        );
    }
}
