//! UDP broadcast discovery — room announcements and the room directory.
//!
//! Two independently controlled halves share the discovery port:
//!
//! 1. **Announcer** — while this node hosts a room, broadcast an
//!    [`Announcement`] every two seconds so other instances can list it.
//!    The announcement parameters live in a `watch` channel the session
//!    updates; flipping it inactive silences the task without killing it.
//!
//! 2. **Scanner** — accept inbound datagrams and maintain the shared
//!    [`RoomDirectory`] that the public API reads. A sweeper task evicts
//!    rooms that stopped announcing.
//!
//! All tasks respect a [`CancellationToken`] for clean shutdown.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use super::protocol::{Announcement, RoomEntry, RoomStatus, ANNOUNCE_INTERVAL, ROOM_TIMEOUT_MS};
use crate::clock::Clock;
use crate::events::CoreEvent;

// ────────────────────────────────────────────────────────────────────────────
// Shared room directory
// ────────────────────────────────────────────────────────────────────────────

/// Thread-safe directory of currently announcing rooms, keyed by host id.
pub type RoomDirectory = Arc<RwLock<HashMap<uuid::Uuid, RoomEntry>>>;

pub fn new_directory() -> RoomDirectory {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Snapshot of all visible rooms, stable order for the UI.
pub fn directory_snapshot(directory: &RoomDirectory) -> Vec<RoomEntry> {
    let mut rooms: Vec<RoomEntry> = directory.read().values().cloned().collect();
    rooms.sort_by(|a, b| a.host_name.cmp(&b.host_name).then(a.host_id.cmp(&b.host_id)));
    rooms
}

// ────────────────────────────────────────────────────────────────────────────
// Announcer
// ────────────────────────────────────────────────────────────────────────────

/// What the announcer should currently broadcast, if anything.
#[derive(Debug, Clone)]
pub struct AnnounceState {
    pub active: bool,
    pub name: String,
    /// TCP port of the mesh listener, as actually bound.
    pub tcp_port: u16,
    pub player_count: u32,
    pub status: RoomStatus,
    /// Directed broadcast of the pinned interface, or the global
    /// broadcast address when no interface is pinned.
    pub broadcast_addr: Ipv4Addr,
}

impl Default for AnnounceState {
    fn default() -> Self {
        Self {
            active: false,
            name: String::new(),
            tcp_port: 0,
            player_count: 0,
            status: RoomStatus::Waiting,
            broadcast_addr: Ipv4Addr::BROADCAST,
        }
    }
}

/// Periodically broadcast the room announcement while the state says so.
///
/// The socket is bound to an ephemeral port with `SO_BROADCAST` so it
/// never conflicts with the scanner holding the discovery port.
pub async fn run_announcer(
    my_id: uuid::Uuid,
    discovery_port: u16,
    mut state: watch::Receiver<AnnounceState>,
    cancel: CancellationToken,
) {
    let socket = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!("discovery announcer bind failed: {}", e);
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!("discovery announcer set_broadcast failed: {}", e);
        return;
    }

    let mut tick = interval(ANNOUNCE_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let snapshot = state.borrow_and_update().clone();
                if !snapshot.active {
                    continue;
                }
                let ann = Announcement::new(
                    my_id,
                    snapshot.name,
                    snapshot.tcp_port,
                    snapshot.player_count,
                    snapshot.status,
                );
                let target = SocketAddr::V4(SocketAddrV4::new(snapshot.broadcast_addr, discovery_port));
                if let Err(e) = socket.send_to(&ann.encode(), target).await {
                    warn!("discovery announce to {} failed: {}", target, e);
                }
            }
        }
    }

    debug!("discovery announcer stopped");
}

// ────────────────────────────────────────────────────────────────────────────
// Scanner
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of folding one announcement into the directory.
#[derive(Debug, PartialEq, Eq)]
enum Upsert {
    New,
    Changed,
    Refreshed,
}

fn upsert_room(
    directory: &RoomDirectory,
    ann: &Announcement,
    ip: IpAddr,
    now_ms: u64,
) -> Upsert {
    let mut rooms = directory.write();
    let entry = RoomEntry {
        host_id: ann.uuid,
        host_name: ann.name.clone(),
        ip,
        port: ann.port,
        player_count: ann.player_count,
        status: ann.status,
        last_seen_ms: now_ms,
    };
    match rooms.insert(ann.uuid, entry) {
        None => Upsert::New,
        Some(old) => {
            if old.host_name != ann.name
                || old.ip != ip
                || old.port != ann.port
                || old.player_count != ann.player_count
                || old.status != ann.status
            {
                Upsert::Changed
            } else {
                Upsert::Refreshed
            }
        }
    }
}

/// Evict rooms not seen within [`ROOM_TIMEOUT_MS`]; returns how many.
fn sweep_stale(directory: &RoomDirectory, now_ms: u64) -> usize {
    let mut rooms = directory.write();
    let before = rooms.len();
    rooms.retain(|_, room| now_ms.saturating_sub(room.last_seen_ms) <= ROOM_TIMEOUT_MS);
    before - rooms.len()
}

/// Listen for announcements from other instances and maintain the
/// directory. Our own datagrams and foreign traffic are ignored.
pub async fn run_scanner(
    my_id: uuid::Uuid,
    socket: UdpSocket,
    directory: RoomDirectory,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<CoreEvent>,
    cancel: CancellationToken,
) {
    info!("discovery scanner started");
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let Some(ann) = Announcement::decode(&buf[..len]) else {
                            continue;
                        };
                        if ann.uuid == my_id {
                            continue;
                        }
                        let now = clock.now_ms();
                        match upsert_room(&directory, &ann, src.ip(), now) {
                            Upsert::New => {
                                info!(
                                    "room found: {} ({}) at {}:{}",
                                    ann.name, ann.uuid, src.ip(), ann.port
                                );
                                let entry = directory.read().get(&ann.uuid).cloned();
                                if let Some(entry) = entry {
                                    let _ = events.send(CoreEvent::RoomFound(entry)).await;
                                }
                                let _ = events
                                    .send(CoreEvent::RoomsChanged(directory_snapshot(&directory)))
                                    .await;
                            }
                            Upsert::Changed => {
                                let _ = events
                                    .send(CoreEvent::RoomsChanged(directory_snapshot(&directory)))
                                    .await;
                            }
                            Upsert::Refreshed => {}
                        }
                    }
                    Err(e) => {
                        warn!("discovery recv error: {}", e);
                    }
                }
            }
        }
    }

    debug!("discovery scanner stopped");
}

/// Evict stale directory entries on a fixed cadence.
pub async fn run_directory_sweeper(
    directory: RoomDirectory,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<CoreEvent>,
    cancel: CancellationToken,
) {
    let mut tick = interval(Duration::from_millis(ROOM_TIMEOUT_MS / 2));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let evicted = sweep_stale(&directory, clock.now_ms());
                if evicted > 0 {
                    debug!("evicted {} stale room(s)", evicted);
                    let _ = events
                        .send(CoreEvent::RoomsChanged(directory_snapshot(&directory)))
                        .await;
                }
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Socket setup
// ────────────────────────────────────────────────────────────────────────────

/// Bind the discovery UDP socket with `SO_REUSEADDR` (and `SO_REUSEPORT`
/// where available) so several local instances can share the port.
pub async fn bind_reusable_udp(port: u16) -> Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating discovery socket")?;

    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    #[cfg(not(target_os = "windows"))]
    if let Err(e) = socket.set_reuse_port(true) {
        warn!("SO_REUSEPORT unavailable (non-fatal): {}", e);
    }

    socket
        .set_nonblocking(true)
        .context("setting non-blocking mode")?;
    socket
        .bind(&socket2::SockAddr::from(addr))
        .with_context(|| format!("binding discovery port {}", port))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("converting discovery socket to tokio")
}
