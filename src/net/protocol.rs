//! Wire protocol — packet catalogue, discovery datagram, and constants.
//!
//! Everything exchanged over UDP (discovery) and TCP (mesh frames) is
//! defined here so that every sub-module speaks the same language. TCP
//! payloads are JSON inside a length-prefixed frame (see
//! [`codec`](crate::net::codec)); packet kinds travel as integer codes,
//! so both ends must be the same build.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::events::RankingEntry;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Application tag carried in every discovery datagram; records with a
/// different tag are ignored outright.
pub const APP_ID: &str = "TYPERACE_LAN";

/// Record type tag inside a discovery datagram.
pub const DISCOVERY_KIND: &str = "DISCOVERY";

/// Default UDP port used for broadcast discovery.
pub const DISCOVERY_PORT: u16 = 45454;

/// How often a room announcement is broadcast.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);

/// A directory entry not refreshed within this window is evicted.
pub const ROOM_TIMEOUT_MS: u64 = 5_000;

/// How long a join waits for the target's HELLO before giving up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the room creator waits for READY_RESPONSE packets.
pub const READY_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Countdown length broadcast before every race.
pub const COUNTDOWN_SECONDS: u32 = 3;

/// Cadence of PROGRESS_UPDATE broadcasts while racing.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum allowed frame payload. A peer sending more is disconnected.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Default roster cap, local player included.
pub const DEFAULT_MAX_PLAYERS: usize = 8;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Peer-level protocol violations. Any of these closes the offending
/// connection only; the session itself keeps running.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown packet kind {0}")]
    UnknownKind(u32),
    #[error("malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

// ────────────────────────────────────────────────────────────────────────────
// TCP packet catalogue
// ────────────────────────────────────────────────────────────────────────────

/// HELLO — first packet on every connection, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
    /// The sender's *listening* port, not the ephemeral socket port.
    pub port: u16,
    #[serde(rename = "isRoomCreator")]
    pub is_room_creator: bool,
    /// The sender's best knowledge of who hosts the room. Absent while a
    /// guest has not learned it yet.
    #[serde(
        rename = "hostUuid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub host_uuid: Option<Uuid>,
}

/// One element of a PEER_LIST payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: Uuid,
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// GAME_TEXT and READY_CHECK both carry the shared text and language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameText {
    pub text: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Countdown {
    pub seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub position: u32,
    pub total: u32,
    pub wpm: f64,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finish {
    pub wpm: f64,
    pub accuracy: f64,
    /// The sender's own finished-count when it finished. Receivers assign
    /// ranks from their own counters; this is informational.
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLeft {
    pub id: Uuid,
    pub name: String,
}

/// Every message exchanged on a mesh connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Hello(Hello),
    PeerList(Vec<PeerEntry>),
    GameText(GameText),
    Countdown(Countdown),
    ReadyCheck(GameText),
    ReadyResponse,
    GameStart,
    Progress(Progress),
    Finish(Finish),
    RaceResults(Vec<RankingEntry>),
    PlayerLeft(PlayerLeft),
    PlayAgainInvite,
}

impl PacketBody {
    /// Integer code on the wire. Codes are assigned in catalogue order
    /// and are not stable across builds.
    pub fn kind(&self) -> u32 {
        match self {
            PacketBody::Hello(_) => 0,
            PacketBody::PeerList(_) => 1,
            PacketBody::GameText(_) => 2,
            PacketBody::Countdown(_) => 3,
            PacketBody::ReadyCheck(_) => 4,
            PacketBody::ReadyResponse => 5,
            PacketBody::GameStart => 6,
            PacketBody::Progress(_) => 7,
            PacketBody::Finish(_) => 8,
            PacketBody::RaceResults(_) => 9,
            PacketBody::PlayerLeft(_) => 10,
            PacketBody::PlayAgainInvite => 11,
        }
    }

    /// Human-readable label for log messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            PacketBody::Hello(_) => "HELLO",
            PacketBody::PeerList(_) => "PEER_LIST",
            PacketBody::GameText(_) => "GAME_TEXT",
            PacketBody::Countdown(_) => "COUNTDOWN",
            PacketBody::ReadyCheck(_) => "READY_CHECK",
            PacketBody::ReadyResponse => "READY_RESPONSE",
            PacketBody::GameStart => "GAME_START",
            PacketBody::Progress(_) => "PROGRESS_UPDATE",
            PacketBody::Finish(_) => "FINISH",
            PacketBody::RaceResults(_) => "RACE_RESULTS",
            PacketBody::PlayerLeft(_) => "PLAYER_LEFT",
            PacketBody::PlayAgainInvite => "PLAY_AGAIN_INVITE",
        }
    }
}

/// A packet with its envelope fields. Ephemeral: serialized onto the
/// wire and discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub sender: Uuid,
    /// Sender's monotonic clock, milliseconds.
    pub ts: u64,
    pub body: PacketBody,
}

/// On-wire envelope shape: `{"type":<int>,"sender":"<uuid>","ts":<ms>,"payload":{..}}`.
#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: u32,
    sender: Uuid,
    ts: u64,
    #[serde(default)]
    payload: Value,
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).expect("packet payload serialisation is infallible")
}

impl Packet {
    /// Serialize the envelope to JSON bytes (without the frame prefix).
    pub fn to_json(&self) -> Vec<u8> {
        let payload = match &self.body {
            PacketBody::Hello(p) => to_value(p),
            PacketBody::PeerList(p) => to_value(p),
            PacketBody::GameText(p) => to_value(p),
            PacketBody::Countdown(p) => to_value(p),
            PacketBody::ReadyCheck(p) => to_value(p),
            PacketBody::Progress(p) => to_value(p),
            PacketBody::Finish(p) => to_value(p),
            PacketBody::RaceResults(p) => to_value(p),
            PacketBody::PlayerLeft(p) => to_value(p),
            PacketBody::ReadyResponse | PacketBody::GameStart | PacketBody::PlayAgainInvite => {
                Value::Object(Default::default())
            }
        };
        let envelope = Envelope {
            kind: self.body.kind(),
            sender: self.sender,
            ts: self.ts,
            payload,
        };
        serde_json::to_vec(&envelope).expect("packet serialisation is infallible")
    }

    /// Parse an envelope from JSON bytes. Unknown kinds and payloads
    /// missing required fields are errors; the caller disconnects the
    /// offending peer.
    pub fn from_json(bytes: &[u8]) -> Result<Packet, ProtocolError> {
        let env: Envelope = serde_json::from_slice(bytes)?;
        let body = match env.kind {
            0 => PacketBody::Hello(serde_json::from_value(env.payload)?),
            1 => PacketBody::PeerList(serde_json::from_value(env.payload)?),
            2 => PacketBody::GameText(serde_json::from_value(env.payload)?),
            3 => PacketBody::Countdown(serde_json::from_value(env.payload)?),
            4 => PacketBody::ReadyCheck(serde_json::from_value(env.payload)?),
            5 => PacketBody::ReadyResponse,
            6 => PacketBody::GameStart,
            7 => PacketBody::Progress(serde_json::from_value(env.payload)?),
            8 => PacketBody::Finish(serde_json::from_value(env.payload)?),
            9 => PacketBody::RaceResults(serde_json::from_value(env.payload)?),
            10 => PacketBody::PlayerLeft(serde_json::from_value(env.payload)?),
            11 => PacketBody::PlayAgainInvite,
            k => return Err(ProtocolError::UnknownKind(k)),
        };
        Ok(Packet {
            sender: env.sender,
            ts: env.ts,
            body,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// UDP discovery
// ────────────────────────────────────────────────────────────────────────────

/// Joinability of an announced room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "racing")]
    Racing,
}

/// Broadcast announcement — sent periodically over UDP by room creators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub app: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub uuid: Uuid,
    pub name: String,
    /// TCP port the announcing host listens on for mesh connections.
    pub port: u16,
    #[serde(rename = "playerCount")]
    pub player_count: u32,
    pub status: RoomStatus,
}

impl Announcement {
    pub fn new(uuid: Uuid, name: String, port: u16, player_count: u32, status: RoomStatus) -> Self {
        Self {
            app: APP_ID.to_string(),
            kind: DISCOVERY_KIND.to_string(),
            uuid,
            name,
            port,
            player_count,
            status,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("announcement serialisation is infallible")
    }

    /// Decode a datagram. Returns `None` when the record is not ours:
    /// foreign `app` tag, wrong `type`, or invalid JSON.
    pub fn decode(data: &[u8]) -> Option<Announcement> {
        let ann: Announcement = serde_json::from_slice(data).ok()?;
        if ann.app != APP_ID || ann.kind != DISCOVERY_KIND {
            return None;
        }
        Some(ann)
    }
}

/// A room currently visible in the discovery directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEntry {
    pub host_id: Uuid,
    pub host_name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub player_count: u32,
    pub status: RoomStatus,
    /// Monotonic ms at which the last announcement arrived.
    pub last_seen_ms: u64,
}
