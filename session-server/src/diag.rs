//! Diagnostic formatting for rooms and players. Which fields show up, and
//! in which order, comes from the logging section of the config file, so
//! operators can tune their log lines without a rebuild.

/// Snapshot of the room fields the formatter can print.
pub struct RoomDiag {
    pub code: String,
    pub state: &'static str,
    pub players: usize,
    pub host: String,
    pub privacy: &'static str,
}

pub fn format_room(fields: &[String], diag: &RoomDiag) -> String {
    let parts: Vec<String> = fields
        .iter()
        .filter_map(|field| match field.as_str() {
            "code" => Some(diag.code.clone()),
            "state" => Some(diag.state.to_string()),
            "players" => Some(format!("{} players", diag.players)),
            "host" => Some(format!("host={}", diag.host)),
            "privacy" => Some(diag.privacy.to_string()),
            _ => None,
        })
        .collect();
    parts.join(" ")
}

/// Snapshot of the player fields the formatter can print.
pub struct PlayerDiag {
    pub name: String,
    pub client_id: u32,
    pub player_id: u8,
    pub ping: u32,
}

pub fn format_player(fields: &[String], diag: &PlayerDiag) -> String {
    let parts: Vec<String> = fields
        .iter()
        .filter_map(|field| match field.as_str() {
            "name" => Some(diag.name.clone()),
            "clientId" => Some(format!("#{}", diag.client_id)),
            "playerId" => Some(format!("slot {}", diag.player_id)),
            "ping" => Some(format!("{}ms", diag.ping)),
            _ => None,
        })
        .collect();
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_format_follows_field_order() {
        let diag = RoomDiag {
            code: "ABCDEF".into(),
            state: "NotStarted",
            players: 3,
            host: "server".into(),
            privacy: "private",
        };
        let fields = vec!["players".to_string(), "code".to_string()];
        assert_eq!(format_room(&fields, &diag), "3 players ABCDEF");
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let diag = PlayerDiag {
            name: "Alice".into(),
            client_id: 1001,
            player_id: 0,
            ping: 42,
        };
        let fields = vec!["name".into(), "nope".into(), "ping".into()];
        assert_eq!(format_player(&fields, &diag), "Alice 42ms");
    }
}
