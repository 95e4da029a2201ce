//! A connected client: transport peer plus protocol identity plus the
//! pointer to the room it sits in. Outbound root messages can be buffered
//! and flushed as one coalesced reliable packet.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::OnceCell;

use protocol::packets::{HelloInfo, ServerRootMessage};
use protocol::{DisconnectReason, Language, PacketWriter, Platform};

use crate::auth::{AuthApi, User};
use crate::room::Room;
use crate::transport::Peer;

/// Malformed packets tolerated within the counting window.
const MALFORMED_LIMIT: u32 = 10;
/// Length of the malformed-packet counting window.
const MALFORMED_WINDOW_SECS: u64 = 30;

struct MalformedCounter {
    count: u32,
    window_start: Instant,
}

/// Encodes a batch of root messages into one payload.
pub fn encode_roots(messages: &[ServerRootMessage]) -> Bytes {
    let mut writer = PacketWriter::new();
    for message in messages {
        message.encode(&mut writer);
    }
    writer.into_bytes()
}

pub struct Connection {
    pub client_id: u32,
    pub peer: Arc<Peer>,
    pub username: String,
    pub language: Language,
    pub platform: Platform,
    room: Mutex<Weak<Room>>,
    auth_user: OnceCell<Option<User>>,
    outbound: Mutex<Vec<ServerRootMessage>>,
    malformed: Mutex<MalformedCounter>,
}

impl Connection {
    pub fn new(client_id: u32, peer: Arc<Peer>, hello: &HelloInfo) -> Self {
        Connection {
            client_id,
            peer,
            username: hello.username.clone(),
            language: hello.language,
            platform: hello.platform,
            room: Mutex::new(Weak::new()),
            auth_user: OnceCell::new(),
            outbound: Mutex::new(Vec::new()),
            malformed: Mutex::new(MalformedCounter {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Round trip estimate in milliseconds.
    pub fn ping_ms(&self) -> u32 {
        self.peer.rtt_ms()
    }

    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.lock().expect("room pointer poisoned").upgrade()
    }

    pub fn set_room(&self, room: &Arc<Room>) {
        *self.room.lock().expect("room pointer poisoned") = Arc::downgrade(room);
    }

    pub fn clear_room(&self) {
        *self.room.lock().expect("room pointer poisoned") = Weak::new();
    }

    /// Account lookup, answered from the cache after the first call.
    pub async fn auth_user(&self, api: &dyn AuthApi) -> Option<User> {
        self.auth_user
            .get_or_init(|| api.connection_user(self.client_id, &self.username))
            .await
            .clone()
    }

    /// Queues a root message for the next flush.
    pub fn buffer_message(&self, message: ServerRootMessage) {
        self.outbound
            .lock()
            .expect("outbound buffer poisoned")
            .push(message);
    }

    /// Coalesces everything buffered into one reliable packet.
    pub async fn flush(&self) {
        let messages: Vec<ServerRootMessage> = {
            let mut outbound = self.outbound.lock().expect("outbound buffer poisoned");
            std::mem::take(&mut *outbound)
        };
        if messages.is_empty() {
            return;
        }
        let _ = self.peer.send_reliable(encode_roots(&messages)).await;
    }

    /// Sends immediately, skipping the buffer.
    pub async fn send_reliable(&self, messages: &[ServerRootMessage]) {
        let _ = self.peer.send_reliable(encode_roots(messages)).await;
    }

    pub async fn disconnect(&self, reason: DisconnectReason, message: Option<String>) {
        self.peer.send_disconnect(reason, message).await;
    }

    /// Counts a malformed packet. Returns true once the peer has spent its
    /// tolerance and should be disconnected.
    pub fn note_malformed(&self) -> bool {
        let mut counter = self.malformed.lock().expect("malformed counter poisoned");
        if counter.window_start.elapsed().as_secs() >= MALFORMED_WINDOW_SECS {
            counter.window_start = Instant::now();
            counter.count = 0;
        }
        counter.count += 1;
        counter.count > MALFORMED_LIMIT
    }
}
