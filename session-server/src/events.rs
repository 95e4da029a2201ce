//! The room event hub. Plugins and the chat layer observe room behavior
//! through an ordered list of typed listeners. Cancellable events are
//! emitted serially so an earlier listener's veto is visible to later
//! ones; pure notifications are fire and forget in registration order.
//! Listeners run on the room's execution context and must not block.

use std::sync::{Arc, RwLock};

use protocol::game::GameDataMessage;
use protocol::{DisconnectReason, GameCode};

/// Fired when a room needs a (possibly acting) host. Listeners may swap
/// the candidate or veto the promotion entirely.
pub struct SelectHostEvent {
    pub room: GameCode,
    pub candidate: u32,
    /// True when the candidate would become an acting host, not the host.
    pub acting: bool,
    cancelled: bool,
}

impl SelectHostEvent {
    pub fn new(room: GameCode, candidate: u32, acting: bool) -> Self {
        SelectHostEvent { room, candidate, acting, cancelled: false }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Fired for every recipient of a broadcast. Listeners may rewrite the
/// game data this one recipient gets, or cancel to skip them.
pub struct BroadcastEvent {
    pub room: GameCode,
    pub recipient: u32,
    pub altered_game_data: Vec<GameDataMessage>,
    cancelled: bool,
}

impl BroadcastEvent {
    pub fn new(room: GameCode, recipient: u32, game_data: Vec<GameDataMessage>) -> Self {
        BroadcastEvent { room, recipient, altered_game_data: game_data, cancelled: false }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Fired once per tick before the outbound stream is flushed. Cancelling
/// keeps the stream queued for the next tick.
pub struct FixedUpdateEvent {
    pub room: GameCode,
    cancelled: bool,
}

impl FixedUpdateEvent {
    pub fn new(room: GameCode) -> Self {
        FixedUpdateEvent { room, cancelled: false }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Fired for each queued end-game intent; the first one nobody cancels
/// ends the game.
pub struct EndGameIntentEvent {
    pub room: GameCode,
    pub intent: &'static str,
    cancelled: bool,
}

impl EndGameIntentEvent {
    pub fn new(room: GameCode, intent: &'static str) -> Self {
        EndGameIntentEvent { room, intent, cancelled: false }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// A client left its room (disconnect, kick or timeout).
pub struct ClientLeaveEvent {
    pub room: GameCode,
    pub client_id: u32,
    pub reason: DisconnectReason,
}

/// Observer interface. Every hook has a default empty body, listeners
/// implement only what they care about.
#[allow(unused_variables)]
pub trait RoomListener: Send + Sync {
    fn on_select_host(&self, event: &mut SelectHostEvent) {}
    fn on_client_broadcast(&self, event: &mut BroadcastEvent) {}
    fn on_fixed_update(&self, event: &mut FixedUpdateEvent) {}
    fn on_end_game_intent(&self, event: &mut EndGameIntentEvent) {}
    fn on_client_leave(&self, event: &ClientLeaveEvent) {}
    fn on_before_destroy(&self, room: GameCode) {}
    fn on_destroy(&self, room: GameCode) {}
}

/// Baseline listener wired up at boot: turns room lifecycle into log
/// lines. Plugins register the same way.
pub struct TraceListener;

impl RoomListener for TraceListener {
    fn on_select_host(&self, event: &mut SelectHostEvent) {
        tracing::debug!(
            room = %event.room,
            candidate = event.candidate,
            acting = event.acting,
            "Host selection."
        );
    }

    fn on_end_game_intent(&self, event: &mut EndGameIntentEvent) {
        tracing::debug!(room = %event.room, intent = event.intent, "End game intent.");
    }

    fn on_client_leave(&self, event: &ClientLeaveEvent) {
        tracing::debug!(room = %event.room, client = event.client_id, reason = ?event.reason, "Leave observed.");
    }

    fn on_destroy(&self, room: GameCode) {
        tracing::debug!(room = %room, "Destroy observed.");
    }
}

/// Ordered listener registry, shared by the worker and its rooms.
#[derive(Default, Clone)]
pub struct EventHub {
    listeners: Arc<RwLock<Vec<Arc<dyn RoomListener>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    pub fn register(&self, listener: Arc<dyn RoomListener>) {
        self.listeners
            .write()
            .expect("event hub lock poisoned")
            .push(listener);
    }

    /// Serial emission for cancellable events.
    pub fn emit_serial<E>(&self, event: &mut E, hook: impl Fn(&Arc<dyn RoomListener>, &mut E)) {
        let listeners = self.listeners.read().expect("event hub lock poisoned");
        for listener in listeners.iter() {
            hook(listener, event);
        }
    }

    /// Best-effort emission for notifications.
    pub fn emit<E: ?Sized>(&self, event: &E, hook: impl Fn(&Arc<dyn RoomListener>, &E)) {
        let listeners = self.listeners.read().expect("event hub lock poisoned");
        for listener in listeners.iter() {
            hook(listener, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Veto;
    impl RoomListener for Veto {
        fn on_select_host(&self, event: &mut SelectHostEvent) {
            if event.acting {
                event.cancel();
            }
        }
    }

    struct Counter(AtomicUsize);
    impl RoomListener for Counter {
        fn on_destroy(&self, _room: GameCode) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn serial_emission_carries_the_veto() {
        let hub = EventHub::new();
        hub.register(Arc::new(Veto));

        let code = GameCode::parse("ABCDEF").unwrap();
        let mut event = SelectHostEvent::new(code, 1001, true);
        hub.emit_serial(&mut event, |l, e| l.on_select_host(e));
        assert!(event.is_cancelled());

        let mut event = SelectHostEvent::new(code, 1001, false);
        hub.emit_serial(&mut event, |l, e| l.on_select_host(e));
        assert!(!event.is_cancelled());
    }

    #[test]
    fn notifications_reach_every_listener() {
        let hub = EventHub::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        hub.register(counter.clone());
        hub.register(Arc::new(Veto));

        let code = GameCode::parse("ABCDEF").unwrap();
        hub.emit(&code, |l, c| l.on_destroy(*c));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
