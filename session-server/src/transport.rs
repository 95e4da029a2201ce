//! Reliable delivery on top of the UDP socket.
//!
//! This module handles the per-peer transport state machine:
//! - Outbound reliable packets get a wrapping nonce and are retransmitted
//!   with exponential backoff until acked or the attempt budget is spent
//! - Inbound reliable nonces are acked immediately and deduplicated
//! - Pings keep quiet links alive, silent peers are dropped
//! - Disconnected peers linger briefly so in-flight packets still get acks
//!
//! Everything above the nonce bookkeeping (root messages, rooms) is handed
//! upward through a [`TransportEvent`] channel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use protocol::packets::{HelloInfo, Packet};
use protocol::DisconnectReason;

/// First retransmission delay.
const RESEND_INITIAL: Duration = Duration::from_secs(1);
/// Retransmission delay cap.
const RESEND_CAP: Duration = Duration::from_secs(2);
/// Transmissions per reliable packet before the peer is declared dead.
const MAX_SEND_ATTEMPTS: u8 = 5;
/// Outbound silence that triggers a keepalive ping.
const PING_INTERVAL: Duration = Duration::from_millis(1500);
/// Inbound silence after which a peer is dropped.
const PEER_TIMEOUT: Duration = Duration::from_secs(6);
/// How long a disconnected peer keeps acking in-flight packets.
const CLOSE_LINGER: Duration = Duration::from_millis(500);
/// Received-nonce window size.
const DEDUP_WINDOW: usize = 256;

/// Resolution of a reliable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    TimedOut,
}

/// What the transport reports upward.
#[derive(Debug)]
pub enum TransportEvent {
    /// First contact (or hello retransmit of a not yet answered peer).
    Hello { addr: SocketAddr, hello: HelloInfo },
    /// A deduplicated reliable or an unreliable payload of root messages.
    Payload { addr: SocketAddr, payload: Bytes },
    /// The peer told us it is leaving.
    Disconnected {
        addr: SocketAddr,
        reason: Option<DisconnectReason>,
        message: Option<String>,
    },
    /// The peer went silent or spent its retransmit budget.
    Dead { addr: SocketAddr },
}

/// Sliding window of recently received nonces.
struct DedupWindow {
    order: VecDeque<u16>,
    seen: HashSet<u16>,
}

impl DedupWindow {
    fn new() -> Self {
        DedupWindow {
            order: VecDeque::with_capacity(DEDUP_WINDOW),
            seen: HashSet::with_capacity(DEDUP_WINDOW),
        }
    }

    /// Records a nonce. Returns false when it was already in the window.
    fn insert(&mut self, nonce: u16) -> bool {
        if !self.seen.insert(nonce) {
            return false;
        }
        self.order.push_back(nonce);
        if self.order.len() > DEDUP_WINDOW {
            let evicted = self.order.pop_front().expect("window not empty");
            self.seen.remove(&evicted);
        }
        true
    }

    fn contains(&self, nonce: u16) -> bool {
        self.seen.contains(&nonce)
    }
}

struct PendingPacket {
    bytes: Bytes,
    first_sent: Instant,
    last_sent: Instant,
    attempts: u8,
    ack_tx: Option<oneshot::Sender<AckOutcome>>,
}

/// When a pending packet is due for its next transmission.
fn resend_delay(attempts: u8) -> Duration {
    if attempts <= 1 { RESEND_INITIAL } else { RESEND_CAP }
}

struct PeerState {
    next_nonce: u16,
    unacked: HashMap<u16, PendingPacket>,
    dedup: DedupWindow,
    last_heard: Instant,
    last_sent: Instant,
    rtt_ms: f32,
    /// Set once a disconnect came in; the peer only acks from then on.
    closing_since: Option<Instant>,
}

impl PeerState {
    fn new(now: Instant) -> Self {
        PeerState {
            next_nonce: 0,
            unacked: HashMap::new(),
            dedup: DedupWindow::new(),
            last_heard: now,
            last_sent: now,
            rtt_ms: 0.0,
            closing_since: None,
        }
    }
}

/// One remote address with its reliability bookkeeping.
pub struct Peer {
    pub addr: SocketAddr,
    socket: Arc<UdpSocket>,
    state: Mutex<PeerState>,
}

impl Peer {
    fn new(addr: SocketAddr, socket: Arc<UdpSocket>) -> Self {
        Peer {
            addr,
            socket,
            state: Mutex::new(PeerState::new(Instant::now())),
        }
    }

    /// Smoothed round trip estimate in milliseconds.
    pub fn rtt_ms(&self) -> u32 {
        self.state.lock().expect("peer lock poisoned").rtt_ms as u32
    }

    /// Sends a payload reliably. The returned receiver resolves once the
    /// peer acks or the retransmit budget is exhausted.
    pub async fn send_reliable(&self, payload: Bytes) -> oneshot::Receiver<AckOutcome> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let bytes = {
            let mut state = self.state.lock().expect("peer lock poisoned");
            state.next_nonce = state.next_nonce.wrapping_add(1);
            let nonce = state.next_nonce;
            let bytes = Packet::Reliable { nonce, payload }.encode();
            let now = Instant::now();
            state.last_sent = now;
            state.unacked.insert(
                nonce,
                PendingPacket {
                    bytes: bytes.clone(),
                    first_sent: now,
                    last_sent: now,
                    attempts: 1,
                    ack_tx: Some(ack_tx),
                },
            );
            bytes
        };
        if let Err(err) = self.socket.send_to(&bytes, self.addr).await {
            tracing::warn!(peer = %self.addr, ?err, "Reliable send failed.");
        }
        ack_rx
    }

    pub async fn send_unreliable(&self, payload: Bytes) {
        let bytes = Packet::Unreliable { payload }.encode();
        self.state.lock().expect("peer lock poisoned").last_sent = Instant::now();
        if let Err(err) = self.socket.send_to(&bytes, self.addr).await {
            tracing::warn!(peer = %self.addr, ?err, "Unreliable send failed.");
        }
    }

    /// Sends the disconnect notice and switches the peer into its linger
    /// phase where it only acks.
    pub async fn send_disconnect(&self, reason: DisconnectReason, message: Option<String>) {
        let bytes = Packet::Disconnect { reason: Some(reason), message }.encode();
        self.begin_close();
        if let Err(err) = self.socket.send_to(&bytes, self.addr).await {
            tracing::debug!(peer = %self.addr, ?err, "Disconnect send failed.");
        }
    }

    fn begin_close(&self) {
        let mut state = self.state.lock().expect("peer lock poisoned");
        if state.closing_since.is_none() {
            state.closing_since = Some(Instant::now());
        }
        // Whatever is still unacked will never resolve through an ack.
        for (_, mut pending) in state.unacked.drain() {
            if let Some(tx) = pending.ack_tx.take() {
                let _ = tx.send(AckOutcome::TimedOut);
            }
        }
    }

    pub fn is_closing(&self) -> bool {
        self.state
            .lock()
            .expect("peer lock poisoned")
            .closing_since
            .is_some()
    }

    /// Accepts an inbound reliable nonce. Returns `(deliver, ack_bytes)`:
    /// duplicates are acked again but not delivered.
    fn accept_reliable(&self, nonce: u16) -> (bool, Bytes) {
        let mut state = self.state.lock().expect("peer lock poisoned");
        state.last_heard = Instant::now();
        let fresh = state.dedup.insert(nonce);
        // The mask acks the eight nonces before this one as well.
        let mut mask = 0u8;
        for bit in 0..8u16 {
            if state.dedup.contains(nonce.wrapping_sub(bit + 1)) {
                mask |= 1 << bit;
            }
        }
        let ack = Packet::Ack { nonce, mask }.encode();
        (fresh && state.closing_since.is_none(), ack)
    }

    /// Processes an ack, resolving pending packets and updating RTT.
    fn handle_ack(&self, nonce: u16, mask: u8) {
        let mut state = self.state.lock().expect("peer lock poisoned");
        state.last_heard = Instant::now();
        let mut acked = vec![nonce];
        for bit in 0..8u16 {
            if mask & (1 << bit) != 0 {
                acked.push(nonce.wrapping_sub(bit + 1));
            }
        }
        for nonce in acked {
            if let Some(mut pending) = state.unacked.remove(&nonce) {
                if pending.attempts == 1 {
                    // Retransmitted packets give ambiguous samples, skip them.
                    let sample = pending.first_sent.elapsed().as_secs_f32() * 1000.0;
                    state.rtt_ms = if state.rtt_ms == 0.0 {
                        sample
                    } else {
                        0.875 * state.rtt_ms + 0.125 * sample
                    };
                }
                if let Some(tx) = pending.ack_tx.take() {
                    let _ = tx.send(AckOutcome::Acked);
                }
            }
        }
    }

    fn note_heard(&self) {
        self.state.lock().expect("peer lock poisoned").last_heard = Instant::now();
    }

    /// Retransmits due packets and emits a keepalive if the link is quiet.
    async fn housekeeping(&self, now: Instant) -> PeerSweep {
        enum Verdict {
            Drop,
            Send(Vec<Bytes>),
        }
        let verdict = {
            let mut state = self.state.lock().expect("peer lock poisoned");

            if let Some(since) = state.closing_since {
                if now.duration_since(since) >= CLOSE_LINGER {
                    return PeerSweep::Expired;
                }
                return PeerSweep::Keep;
            }

            if now.duration_since(state.last_heard) >= PEER_TIMEOUT {
                Verdict::Drop
            } else {
                let mut to_send = Vec::new();
                let mut exhausted = false;
                for pending in state.unacked.values_mut() {
                    if now.duration_since(pending.last_sent) >= resend_delay(pending.attempts) {
                        if pending.attempts >= MAX_SEND_ATTEMPTS {
                            exhausted = true;
                            break;
                        }
                        pending.attempts += 1;
                        pending.last_sent = now;
                        to_send.push(pending.bytes.clone());
                    }
                }
                if exhausted {
                    Verdict::Drop
                } else {
                    if !to_send.is_empty() {
                        state.last_sent = now;
                    } else if now.duration_since(state.last_sent) >= PING_INTERVAL {
                        // The ping is itself reliable, so a dead link runs
                        // the ping out of attempts and gets dropped here.
                        state.next_nonce = state.next_nonce.wrapping_add(1);
                        let nonce = state.next_nonce;
                        let bytes = Packet::Ping { nonce }.encode();
                        state.unacked.insert(
                            nonce,
                            PendingPacket {
                                bytes: bytes.clone(),
                                first_sent: now,
                                last_sent: now,
                                attempts: 1,
                                ack_tx: None,
                            },
                        );
                        state.last_sent = now;
                        to_send.push(bytes);
                    }
                    Verdict::Send(to_send)
                }
            }
        };

        match verdict {
            Verdict::Drop => {
                // Resolve every waiter before the peer goes away.
                self.begin_close();
                PeerSweep::TimedOut
            }
            Verdict::Send(packets) => {
                for bytes in packets {
                    if let Err(err) = self.socket.send_to(&bytes, self.addr).await {
                        tracing::debug!(peer = %self.addr, ?err, "Retransmit failed.");
                    }
                }
                PeerSweep::Keep
            }
        }
    }
}

/// Outcome of one housekeeping pass over a peer.
enum PeerSweep {
    Keep,
    /// Linger phase over; remove silently.
    Expired,
    /// Silence or spent retransmit budget; remove and report.
    TimedOut,
}

/// The socket multiplexer: owns every peer and routes datagrams.
pub struct Transport {
    socket: Arc<UdpSocket>,
    peers: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    pub fn new(socket: Arc<UdpSocket>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Transport {
            socket,
            peers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Existing peer handle, if any.
    pub fn peer(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.peers.lock().expect("peer map poisoned").get(&addr).cloned()
    }

    pub(crate) fn peer_or_create(&self, addr: SocketAddr) -> Arc<Peer> {
        let mut peers = self.peers.lock().expect("peer map poisoned");
        peers
            .entry(addr)
            .or_insert_with(|| Arc::new(Peer::new(addr, self.socket.clone())))
            .clone()
    }

    pub fn remove_peer(&self, addr: SocketAddr) {
        self.peers.lock().expect("peer map poisoned").remove(&addr);
    }

    /// Decodes one datagram and advances the owning peer's state machine.
    pub async fn handle_datagram(&self, addr: SocketAddr, datagram: &[u8]) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(peer = %addr, %err, "Dropping malformed datagram.");
                return;
            }
        };

        match packet {
            Packet::Hello { nonce, hello } => {
                let peer = self.peer_or_create(addr);
                let (fresh, ack) = peer.accept_reliable(nonce);
                self.send_raw(addr, ack).await;
                if fresh {
                    let _ = self.events.send(TransportEvent::Hello { addr, hello });
                }
            }
            Packet::Reliable { nonce, payload } => {
                let Some(peer) = self.peer(addr) else {
                    tracing::debug!(peer = %addr, "Reliable packet from unknown peer.");
                    return;
                };
                let (deliver, ack) = peer.accept_reliable(nonce);
                self.send_raw(addr, ack).await;
                if deliver {
                    let _ = self.events.send(TransportEvent::Payload { addr, payload });
                }
            }
            Packet::Unreliable { payload } => {
                let Some(peer) = self.peer(addr) else {
                    return;
                };
                peer.note_heard();
                if !peer.is_closing() {
                    let _ = self.events.send(TransportEvent::Payload { addr, payload });
                }
            }
            Packet::Ack { nonce, mask } => {
                if let Some(peer) = self.peer(addr) {
                    peer.handle_ack(nonce, mask);
                }
            }
            Packet::Ping { nonce } => {
                if let Some(peer) = self.peer(addr) {
                    let (_, ack) = peer.accept_reliable(nonce);
                    self.send_raw(addr, ack).await;
                }
            }
            Packet::Disconnect { reason, message } => {
                if let Some(peer) = self.peer(addr) {
                    peer.begin_close();
                    let _ = self
                        .events
                        .send(TransportEvent::Disconnected { addr, reason, message });
                }
            }
        }
    }

    async fn send_raw(&self, addr: SocketAddr, bytes: Bytes) {
        if let Err(err) = self.socket.send_to(&bytes, addr).await {
            tracing::debug!(peer = %addr, ?err, "Send failed.");
        }
    }

    /// Periodic retransmission, keepalive and timeout sweep. Runs until
    /// the process exits.
    pub async fn run_housekeeping(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            let peers: Vec<Arc<Peer>> = self
                .peers
                .lock()
                .expect("peer map poisoned")
                .values()
                .cloned()
                .collect();
            let now = Instant::now();
            for peer in peers {
                match peer.housekeeping(now).await {
                    PeerSweep::Keep => {}
                    PeerSweep::Expired => self.remove_peer(peer.addr),
                    PeerSweep::TimedOut => {
                        self.remove_peer(peer.addr);
                        let _ = self.events.send(TransportEvent::Dead { addr: peer.addr });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_window_is_bounded_and_wrap_safe() {
        let mut window = DedupWindow::new();
        assert!(window.insert(65535));
        assert!(window.insert(0)); // Wrapped around.
        assert!(!window.insert(65535));
        for nonce in 1..=DEDUP_WINDOW as u16 {
            assert!(window.insert(nonce));
        }
        // 65535 has been evicted by now and would be accepted again.
        assert!(window.insert(65535));
        assert!(window.seen.len() <= DEDUP_WINDOW);
    }

    #[test]
    fn resend_backoff_starts_at_one_second_and_caps() {
        assert_eq!(resend_delay(1), Duration::from_secs(1));
        assert_eq!(resend_delay(2), Duration::from_secs(2));
        assert_eq!(resend_delay(4), Duration::from_secs(2));
    }

    async fn socket_pair() -> (Arc<UdpSocket>, Arc<UdpSocket>, SocketAddr, SocketAddr) {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();
        (a, b, addr_a, addr_b)
    }

    #[tokio::test]
    async fn reliable_send_resolves_on_ack() {
        let (server, client, server_addr, client_addr) = socket_pair().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = Transport::new(server.clone(), tx);
        let peer = transport.peer_or_create(client_addr);

        let ack_rx = peer.send_reliable(Bytes::from_static(&[1, 2, 3])).await;

        // The "client" receives the reliable packet and acks its nonce.
        let mut buf = [0u8; 64];
        let (len, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, server_addr);
        let packet = Packet::decode(&buf[..len]).unwrap();
        let Packet::Reliable { nonce, payload } = packet else {
            panic!("expected reliable packet, got {packet:?}");
        };
        assert_eq!(&payload[..], &[1, 2, 3]);
        let ack = Packet::Ack { nonce, mask: 0 }.encode();
        client.send_to(&ack, server_addr).await.unwrap();

        // Feed the ack through the transport as the recv loop would.
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        transport.handle_datagram(from, &buf[..len]).await;

        assert_eq!(ack_rx.await.unwrap(), AckOutcome::Acked);
    }

    #[tokio::test]
    async fn duplicate_reliable_is_acked_but_not_delivered() {
        let (server, client, server_addr, client_addr) = socket_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Transport::new(server, tx);
        transport.peer_or_create(client_addr);

        let packet = Packet::Reliable {
            nonce: 7,
            payload: Bytes::from_static(&[9]),
        }
        .encode();
        transport.handle_datagram(client_addr, &packet).await;
        transport.handle_datagram(client_addr, &packet).await;

        // Exactly one delivery.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, TransportEvent::Payload { .. }));
        assert!(rx.try_recv().is_err());

        // But two acks on the wire.
        let mut buf = [0u8; 64];
        for _ in 0..2 {
            let (len, _) = client.recv_from(&mut buf).await.unwrap();
            let ack = Packet::decode(&buf[..len]).unwrap();
            assert!(matches!(ack, Packet::Ack { nonce: 7, .. }));
        }
        let _ = server_addr;
    }

    #[tokio::test]
    async fn disconnect_switches_peer_to_ack_only() {
        let (server, client, _server_addr, client_addr) = socket_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Transport::new(server, tx);
        transport.peer_or_create(client_addr);

        let goodbye = Packet::Disconnect {
            reason: Some(DisconnectReason::ExitGame),
            message: None,
        }
        .encode();
        transport.handle_datagram(client_addr, &goodbye).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportEvent::Disconnected { reason: Some(DisconnectReason::ExitGame), .. }
        ));

        // Payloads after the disconnect still get acked but not delivered.
        let late = Packet::Reliable { nonce: 3, payload: Bytes::from_static(&[1]) }.encode();
        transport.handle_datagram(client_addr, &late).await;
        assert!(rx.try_recv().is_err());
        let mut buf = [0u8; 64];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert!(matches!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack { nonce: 3, .. }));
    }

    #[tokio::test]
    async fn ack_mask_covers_preceding_nonces() {
        let (server, client, _server_addr, client_addr) = socket_pair().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = Transport::new(server, tx);
        let peer = transport.peer_or_create(client_addr);

        for nonce in [5u16, 6, 7] {
            let (_, _ack) = peer.accept_reliable(nonce);
        }
        let (_, ack) = peer.accept_reliable(8);
        let Packet::Ack { nonce, mask } = Packet::decode(&ack).unwrap() else {
            panic!("not an ack");
        };
        assert_eq!(nonce, 8);
        // Bits 0..2 cover nonces 7, 6 and 5.
        assert_eq!(mask & 0b111, 0b111);
        let _ = client;
    }
}
