//! Contract to the metrics and persistence sink, plus the infraction
//! record type the anti-cheat produces. Batches are flushed on game end,
//! room destruction, or when a room's buffer grows past the threshold.

use std::time::SystemTime;

use async_trait::async_trait;

use protocol::GameCode;

/// How bad a single anti-cheat finding is. `Critical` findings also
/// suppress the offending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One observed rule violation.
#[derive(Debug, Clone)]
pub struct Infraction {
    /// Account id, or the username for guests.
    pub user_id: String,
    pub game_id: Option<String>,
    pub created_at: SystemTime,
    pub player_ping: u32,
    pub name: &'static str,
    pub details: String,
    pub severity: Severity,
}

/// Batched, idempotent sink for infraction records.
#[async_trait]
pub trait Metrics: Send + Sync {
    /// Stable id of the running game in a room, if the sink tracks one.
    async fn current_game_id(&self, room: GameCode) -> Option<String>;

    async fn flush_infractions(&self, batch: Vec<Infraction>);
}

/// Default sink: log and drop.
pub struct LogMetrics;

#[async_trait]
impl Metrics for LogMetrics {
    async fn current_game_id(&self, _room: GameCode) -> Option<String> {
        None
    }

    async fn flush_infractions(&self, batch: Vec<Infraction>) {
        for infraction in &batch {
            tracing::info!(
                user = %infraction.user_id,
                game = ?infraction.game_id,
                name = infraction.name,
                severity = ?infraction.severity,
                details = %infraction.details,
                "Infraction recorded."
            );
        }
    }
}

/// Test sink collecting every flushed batch.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingMetrics {
        pub flushed: Mutex<Vec<Vec<Infraction>>>,
    }

    #[async_trait]
    impl Metrics for RecordingMetrics {
        async fn current_game_id(&self, _room: GameCode) -> Option<String> {
            Some("game-under-test".into())
        }

        async fn flush_infractions(&self, batch: Vec<Infraction>) {
            self.flushed.lock().unwrap().push(batch);
        }
    }
}
