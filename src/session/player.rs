//! Roster entry for one player, local or remote.

use uuid::Uuid;

use crate::events::PlayerSnapshot;

pub(crate) struct Player {
    pub id: Uuid,
    pub name: String,
    pub is_local: bool,
    /// Characters typed so far, as last reported.
    pub position: u32,
    /// Length of the shared text in characters, as last reported.
    pub total: u32,
    pub wpm: f64,
    pub accuracy: f64,
    pub finished: bool,
    /// 1-based finish rank assigned locally; 0 while unfinished.
    pub rank: u32,
    pub finish_time_ms: u64,
}

impl Player {
    pub fn new(id: Uuid, name: String, is_local: bool) -> Self {
        Self {
            id,
            name,
            is_local,
            position: 0,
            total: 0,
            wpm: 0.0,
            accuracy: 100.0,
            finished: false,
            rank: 0,
            finish_time_ms: 0,
        }
    }

    /// Clear everything race-related, keeping identity.
    pub fn reset_race(&mut self) {
        self.position = 0;
        self.total = 0;
        self.wpm = 0.0;
        self.accuracy = 100.0;
        self.finished = false;
        self.rank = 0;
        self.finish_time_ms = 0;
    }

    pub fn progress_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.position) / f64::from(self.total)
        }
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            id: self.id,
            name: self.name.clone(),
            is_local: self.is_local,
            position: self.position,
            total: self.total,
            wpm: self.wpm,
            accuracy: self.accuracy,
            finished: self.finished,
            rank: self.rank,
            finish_time_ms: self.finish_time_ms,
        }
    }
}
