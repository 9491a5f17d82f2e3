//! Typed notifications pushed to the embedding UI.
//!
//! The core never calls back into the UI; everything observable arrives
//! on the event channel returned by [`spawn_core`](crate::spawn_core).
//! Events that describe collections carry full snapshots, so a UI can
//! always redraw from the latest event alone.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::net::protocol::RoomEntry;

/// Lifecycle phase of the local session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Lobby,
    ReadyCheck,
    CountingDown,
    Racing,
    Finished,
}

impl SessionPhase {
    pub fn is_in_lobby(&self) -> bool {
        matches!(self, SessionPhase::Lobby)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, SessionPhase::Connecting)
    }

    /// True from the ready-check onwards, until the race result lands.
    pub fn is_in_game(&self) -> bool {
        matches!(
            self,
            SessionPhase::ReadyCheck | SessionPhase::CountingDown | SessionPhase::Racing
        )
    }
}

/// Snapshot of one player in the roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerSnapshot {
    pub id: Uuid,
    pub name: String,
    pub is_local: bool,
    /// Characters typed so far.
    pub position: u32,
    /// Length of the shared text, in characters.
    pub total: u32,
    pub wpm: f64,
    pub accuracy: f64,
    pub finished: bool,
    /// 1-based finish rank; 0 while unfinished.
    pub rank: u32,
    /// Monotonic ms at which the finish was recorded; 0 while unfinished.
    pub finish_time_ms: u64,
}

/// One row of the final ranking broadcast by the room creator. Doubles as
/// the RACE_RESULTS wire payload element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub id: Uuid,
    pub name: String,
    pub wpm: f64,
    pub accuracy: f64,
    /// 1-based final position.
    pub position: u32,
}

/// Notifications pushed to the embedding UI.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A room was seen for the first time.
    RoomFound(RoomEntry),
    /// The room directory changed in any visible way.
    RoomsChanged(Vec<RoomEntry>),
    /// Roster snapshot after any membership or name change.
    PlayersChanged(Vec<PlayerSnapshot>),
    PlayerJoined {
        name: String,
    },
    PlayerLeft {
        name: String,
    },
    JoinSucceeded,
    JoinFailed {
        reason: String,
    },
    PhaseChanged(SessionPhase),
    /// Kept for UI compatibility; the value only ever mirrors whether
    /// this node created the room and cannot change mid-session.
    AuthorityChanged(bool),
    GameTextChanged {
        text: String,
        language: String,
    },
    CountdownStarted {
        seconds: u32,
    },
    ProgressUpdated {
        id: Uuid,
        name: String,
        /// `position / total`, clamped to 0 when the text is empty.
        progress: f64,
        wpm: f64,
        finished: bool,
        rank: u32,
    },
    /// Final rankings, either received from the room creator or built
    /// locally by it.
    RaceFinished(Vec<RankingEntry>),
    /// The room creator proposed another round.
    PlayAgainInvited,
}
