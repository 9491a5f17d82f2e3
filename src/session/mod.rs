//! Session state machine and race coordination.
//!
//! The session is deliberately free of sockets and timers: inputs are
//! local API calls, post-handshake packets, peer join/loss notifications,
//! and timer fires; outputs are an ordered list of [`Effect`]s that the
//! runtime executes against the mesh, the discovery announcer, and the
//! event channel. That keeps every rule about rooms, countdowns, and
//! rankings testable without a single socket.

mod player;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::events::{CoreEvent, PlayerSnapshot, RankingEntry, SessionPhase};
use crate::net::protocol::{
    Countdown, Finish, GameText, PacketBody, PlayerLeft, Progress, RoomStatus, CONNECT_TIMEOUT,
    COUNTDOWN_SECONDS, READY_CHECK_TIMEOUT,
};
use crate::text::{compose_text, TextProvider};

pub(crate) use player::Player;

/// The session's cancellable one-shot timers. `leave_room` cancels all
/// of them unconditionally, which is why they are first-class handles
/// rather than booleans derived from state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    /// Join attempt waiting for the target's HELLO.
    Connect,
    /// Room creator waiting for READY_RESPONSE packets.
    ReadyCheck,
    /// The 3-second countdown before GAME_START.
    Countdown,
}

/// What the session wants done in the outside world, in order.
pub(crate) enum Effect {
    Broadcast(PacketBody),
    SendToPeer(Uuid, PacketBody),
    Emit(CoreEvent),
    Dial(SocketAddr),
    ClosePeer(Uuid),
    CloseAllPeers,
    OpenListener,
    CloseListener,
    StartTimer(TimerKind, Duration),
    CancelTimer(TimerKind),
    CancelAllTimers,
    /// Recompute the discovery announcement from current session state.
    RefreshAnnounce,
}

/// Room lifecycle as a sum type, so that illegal combinations such as
/// "connecting while racing" cannot be represented.
pub(crate) enum Phase {
    Idle,
    Connecting {
        target: SocketAddr,
    },
    Lobby,
    ReadyCheck {
        /// Players whose READY_RESPONSE arrived; includes the local
        /// player, marked ready up front. Only meaningful on the room
        /// creator.
        responded: HashSet<Uuid>,
    },
    CountingDown,
    Racing,
    Finished,
}

impl Phase {
    fn as_public(&self) -> SessionPhase {
        match self {
            Phase::Idle => SessionPhase::Idle,
            Phase::Connecting { .. } => SessionPhase::Connecting,
            Phase::Lobby => SessionPhase::Lobby,
            Phase::ReadyCheck { .. } => SessionPhase::ReadyCheck,
            Phase::CountingDown => SessionPhase::CountingDown,
            Phase::Racing => SessionPhase::Racing,
            Phase::Finished => SessionPhase::Finished,
        }
    }
}

pub(crate) struct Session {
    my_id: Uuid,
    my_name: String,
    is_room_creator: bool,
    /// Learned from the first HELLO when joining; our own id when
    /// hosting; `None` until either happens.
    host_id: Option<Uuid>,
    phase: Phase,
    text: String,
    language: String,
    roster: HashMap<Uuid, Player>,
    finished_count: u32,
    rankings: Vec<RankingEntry>,
    max_players: usize,
    clock: Arc<dyn Clock>,
    text_provider: Arc<dyn TextProvider>,
    outbox: Vec<Effect>,
}

impl Session {
    pub fn new(
        my_id: Uuid,
        my_name: String,
        max_players: usize,
        clock: Arc<dyn Clock>,
        text_provider: Arc<dyn TextProvider>,
    ) -> Self {
        let mut roster = HashMap::new();
        roster.insert(my_id, Player::new(my_id, my_name.clone(), true));
        Self {
            my_id,
            my_name,
            is_room_creator: false,
            host_id: None,
            phase: Phase::Idle,
            text: String::new(),
            language: "english".to_string(),
            roster,
            finished_count: 0,
            rankings: Vec::new(),
            max_players,
            clock,
            text_provider,
            outbox: Vec::new(),
        }
    }

    // ── Effect plumbing ──────────────────────────────────────────────────

    fn push(&mut self, effect: Effect) {
        self.outbox.push(effect);
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }

    fn emit(&mut self, event: CoreEvent) {
        self.push(Effect::Emit(event));
    }

    fn set_phase(&mut self, phase: Phase) {
        let public = phase.as_public();
        let changed = public != self.phase.as_public();
        self.phase = phase;
        if changed {
            self.emit(CoreEvent::PhaseChanged(public));
        }
    }

    fn emit_players(&mut self) {
        let mut players: Vec<PlayerSnapshot> =
            self.roster.values().map(Player::snapshot).collect();
        players.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        self.emit(CoreEvent::PlayersChanged(players));
    }

    fn emit_game_text(&mut self) {
        self.emit(CoreEvent::GameTextChanged {
            text: self.text.clone(),
            language: self.language.clone(),
        });
    }

    // ── Queries used by the runtime ──────────────────────────────────────

    pub fn my_id(&self) -> Uuid {
        self.my_id
    }

    pub fn my_name(&self) -> String {
        self.my_name.clone()
    }

    pub fn is_authority(&self) -> bool {
        self.is_room_creator
    }

    /// The host uuid advertised in our HELLO packets: ourselves when
    /// hosting, otherwise our best knowledge.
    pub fn advertised_host(&self) -> Option<Uuid> {
        if self.is_room_creator {
            Some(self.my_id)
        } else {
            self.host_id
        }
    }

    pub fn phase_public(&self) -> SessionPhase {
        self.phase.as_public()
    }

    pub fn has_player(&self, id: Uuid) -> bool {
        self.roster.contains_key(&id)
    }

    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// What the discovery announcer should say, or `None` to stay quiet.
    pub fn announce_status(&self) -> Option<(u32, RoomStatus)> {
        if !self.is_room_creator {
            return None;
        }
        let status = match self.phase {
            Phase::Lobby => RoomStatus::Waiting,
            Phase::ReadyCheck { .. }
            | Phase::CountingDown
            | Phase::Racing
            | Phase::Finished => RoomStatus::Racing,
            Phase::Idle | Phase::Connecting { .. } => return None,
        };
        Some((self.roster.len() as u32, status))
    }

    /// The PROGRESS_UPDATE body broadcast on every ticker fire, while
    /// racing.
    pub fn progress_body(&self) -> Option<Progress> {
        if !matches!(self.phase, Phase::Racing) {
            return None;
        }
        let me = self.roster.get(&self.my_id)?;
        Some(Progress {
            position: me.position,
            total: me.total,
            wpm: me.wpm,
            finished: me.finished,
        })
    }

    // ── Local API: room lifecycle ────────────────────────────────────────

    pub fn create_room(&mut self) -> bool {
        if !matches!(self.phase, Phase::Idle) {
            return false;
        }
        info!("creating room as {}", self.my_name);
        self.is_room_creator = true;
        self.host_id = Some(self.my_id);
        self.reset_race_state();
        if self.text.is_empty() {
            self.text = compose_text(&self.text_provider, &self.language);
        }
        self.set_phase(Phase::Lobby);
        self.push(Effect::OpenListener);
        self.push(Effect::RefreshAnnounce);
        self.emit(CoreEvent::AuthorityChanged(true));
        self.emit_players();
        self.emit_game_text();
        true
    }

    pub fn join_room(&mut self, target: SocketAddr) -> bool {
        if !matches!(self.phase, Phase::Idle) {
            return false;
        }
        info!("joining room at {}", target);
        self.set_phase(Phase::Connecting { target });
        self.push(Effect::OpenListener);
        self.push(Effect::Dial(target));
        self.push(Effect::StartTimer(TimerKind::Connect, CONNECT_TIMEOUT));
        true
    }

    pub fn leave_room(&mut self) {
        self.reset_to_idle();
    }

    pub fn set_player_name(&mut self, name: String) {
        if !matches!(self.phase, Phase::Idle | Phase::Lobby) || name.is_empty() {
            return;
        }
        self.my_name = name.clone();
        if let Some(me) = self.roster.get_mut(&self.my_id) {
            me.name = name;
        }
        self.emit_players();
        self.push(Effect::RefreshAnnounce);
    }

    // ── Local API: text & language (room creator only) ───────────────────

    pub fn set_game_text(&mut self, text: String) {
        if !self.is_room_creator {
            return;
        }
        self.text = text;
        self.broadcast_game_text();
    }

    pub fn set_game_language(&mut self, language: String) {
        if !self.is_room_creator || language.is_empty() {
            return;
        }
        self.language = language;
        // A language switch immediately regenerates the text.
        self.text = compose_text(&self.text_provider, &self.language);
        self.broadcast_game_text();
    }

    pub fn refresh_game_text(&mut self) {
        if !self.is_room_creator {
            return;
        }
        self.text = compose_text(&self.text_provider, &self.language);
        self.broadcast_game_text();
    }

    fn broadcast_game_text(&mut self) {
        let body = PacketBody::GameText(GameText {
            text: self.text.clone(),
            language: self.language.clone(),
        });
        self.push(Effect::Broadcast(body));
        self.emit_game_text();
    }

    // ── Local API: race control ──────────────────────────────────────────

    pub fn start_countdown(&mut self) {
        if !self.is_room_creator || !matches!(self.phase, Phase::Lobby) {
            return;
        }
        self.reset_race_state();
        self.emit_players();
        if self.roster.len() > 1 {
            let mut responded = HashSet::new();
            responded.insert(self.my_id);
            self.set_phase(Phase::ReadyCheck { responded });
            self.push(Effect::Broadcast(PacketBody::ReadyCheck(GameText {
                text: self.text.clone(),
                language: self.language.clone(),
            })));
            self.push(Effect::StartTimer(TimerKind::ReadyCheck, READY_CHECK_TIMEOUT));
        } else {
            self.begin_countdown();
        }
        self.push(Effect::RefreshAnnounce);
    }

    fn begin_countdown(&mut self) {
        self.push(Effect::CancelTimer(TimerKind::ReadyCheck));
        self.set_phase(Phase::CountingDown);
        self.push(Effect::Broadcast(PacketBody::Countdown(Countdown {
            seconds: COUNTDOWN_SECONDS,
        })));
        self.emit(CoreEvent::CountdownStarted {
            seconds: COUNTDOWN_SECONDS,
        });
        self.push(Effect::StartTimer(
            TimerKind::Countdown,
            Duration::from_secs(u64::from(COUNTDOWN_SECONDS)),
        ));
    }

    pub fn kick_player(&mut self, id: Uuid) {
        if !self.is_room_creator || id == self.my_id {
            return;
        }
        let Some(name) = self.roster.get(&id).map(|p| p.name.clone()) else {
            return;
        };
        info!("kicking {} ({})", name, id);
        self.push(Effect::Broadcast(PacketBody::PlayerLeft(PlayerLeft {
            id,
            name,
        })));
        self.remove_player(id);
        self.push(Effect::ClosePeer(id));
    }

    pub fn update_progress(&mut self, position: u32, total: u32, wpm: f64) {
        if !matches!(self.phase, Phase::Racing) {
            return;
        }
        if let Some(me) = self.roster.get_mut(&self.my_id) {
            me.position = position;
            me.total = total;
            me.wpm = wpm;
        }
    }

    pub fn finish_race(&mut self, wpm: f64, accuracy: f64, errors: u32) {
        if !matches!(self.phase, Phase::Racing) {
            return;
        }
        let now = self.clock.now_ms();
        let Some(me) = self.roster.get_mut(&self.my_id) else {
            return;
        };
        if me.finished {
            debug!("finish_race called twice; keeping rank {}", me.rank);
            return;
        }
        self.finished_count += 1;
        me.finished = true;
        me.rank = self.finished_count;
        me.finish_time_ms = now;
        me.wpm = wpm;
        me.accuracy = accuracy;
        debug!(
            "local finish: rank {}, {:.1} wpm, {:.1}% accuracy, {} errors",
            me.rank, wpm, accuracy, errors
        );
        let rank = me.rank;
        let name = me.name.clone();
        self.push(Effect::Broadcast(PacketBody::Finish(Finish {
            wpm,
            accuracy,
            position: rank,
        })));
        let progress = self
            .roster
            .get(&self.my_id)
            .map(|p| p.progress_ratio())
            .unwrap_or(0.0);
        self.emit(CoreEvent::ProgressUpdated {
            id: self.my_id,
            name,
            progress,
            wpm,
            finished: true,
            rank,
        });
        self.emit_players();
        self.check_completion();
    }

    // ── Local API: play-again ────────────────────────────────────────────

    pub fn send_play_again_invite(&mut self) {
        if !self.is_room_creator || !matches!(self.phase, Phase::Finished) {
            return;
        }
        self.push(Effect::Broadcast(PacketBody::PlayAgainInvite));
        self.return_to_lobby();
    }

    pub fn accept_play_again(&mut self) {
        if self.is_room_creator || !matches!(self.phase, Phase::Finished) {
            return;
        }
        self.return_to_lobby();
    }

    pub fn decline_play_again(&mut self) {
        if self.is_room_creator || !matches!(self.phase, Phase::Finished) {
            return;
        }
        self.leave_room();
    }

    fn return_to_lobby(&mut self) {
        self.reset_race_state();
        self.set_phase(Phase::Lobby);
        self.emit_players();
        self.push(Effect::RefreshAnnounce);
    }

    // ── Mesh notifications ───────────────────────────────────────────────

    /// A HELLO completed for a player we did not know yet.
    pub fn peer_joined(
        &mut self,
        id: Uuid,
        name: String,
        addr: std::net::IpAddr,
        listen_port: u16,
        is_room_creator: bool,
        advertised_host: Option<Uuid>,
    ) {
        if id == self.my_id {
            return;
        }
        if self.roster.contains_key(&id) {
            warn!("duplicate player id {}; ignoring", id);
            return;
        }
        if self.roster.len() >= self.max_players {
            info!("room full; rejecting {}", name);
            self.push(Effect::ClosePeer(id));
            return;
        }

        self.roster.insert(id, Player::new(id, name.clone(), false));

        if self.host_id.is_none() && !self.is_room_creator {
            self.host_id = advertised_host.or(is_room_creator.then_some(id));
            if let Some(host) = self.host_id {
                debug!("adopted host {}", host);
            }
        }

        if let Phase::Connecting { target } = self.phase {
            if target.ip() == addr && target.port() == listen_port {
                self.push(Effect::CancelTimer(TimerKind::Connect));
                self.set_phase(Phase::Lobby);
                self.emit(CoreEvent::JoinSucceeded);
            }
        }

        self.emit(CoreEvent::PlayerJoined { name });
        self.emit_players();
        self.push(Effect::RefreshAnnounce);

        // Late joiners receive the shared text straight away.
        if self.is_room_creator && !self.text.is_empty() {
            self.push(Effect::SendToPeer(
                id,
                PacketBody::GameText(GameText {
                    text: self.text.clone(),
                    language: self.language.clone(),
                }),
            ));
        }
    }

    /// The connection of an identified peer ended.
    pub fn peer_lost(&mut self, id: Uuid) {
        self.remove_player(id);
    }

    /// An outbound dial failed before any HELLO.
    pub fn dial_failed(&mut self, target: SocketAddr, reason: &str) {
        if let Phase::Connecting { target: expected } = self.phase {
            if expected == target {
                self.fail_join(format!("could not reach {}: {}", target, reason));
            }
        }
    }

    /// The mesh listener could not be opened.
    pub fn listener_failed(&mut self, reason: &str) {
        if matches!(self.phase, Phase::Idle) {
            return;
        }
        self.fail_join(format!("could not open listener: {}", reason));
    }

    // ── Timers ───────────────────────────────────────────────────────────

    pub fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Connect => {
                if matches!(self.phase, Phase::Connecting { .. }) {
                    self.fail_join("timed out waiting for the host".to_string());
                }
            }
            TimerKind::ReadyCheck => {
                // Whoever did not respond races anyway.
                if self.is_room_creator && matches!(self.phase, Phase::ReadyCheck { .. }) {
                    self.begin_countdown();
                }
            }
            TimerKind::Countdown => {
                if self.is_room_creator && matches!(self.phase, Phase::CountingDown) {
                    self.push(Effect::Broadcast(PacketBody::GameStart));
                    self.set_phase(Phase::Racing);
                }
            }
        }
    }

    // ── Packet handling (post-handshake only) ────────────────────────────

    pub fn handle_packet(&mut self, sender: Uuid, body: PacketBody) {
        match body {
            PacketBody::Hello(_) | PacketBody::PeerList(_) => {
                // Handled by the mesh before reaching the session.
                debug!("unexpected handshake packet from {}", sender);
            }
            PacketBody::GameText(text) => self.on_game_text(sender, text),
            PacketBody::ReadyCheck(text) => self.on_ready_check(sender, text),
            PacketBody::ReadyResponse => self.on_ready_response(sender),
            PacketBody::Countdown(countdown) => self.on_countdown(sender, countdown),
            PacketBody::GameStart => self.on_game_start(sender),
            PacketBody::Progress(progress) => self.on_progress(sender, progress),
            PacketBody::Finish(finish) => self.on_finish(sender, finish),
            PacketBody::RaceResults(rankings) => self.on_race_results(sender, rankings),
            PacketBody::PlayerLeft(left) => self.on_player_left(sender, left),
            PacketBody::PlayAgainInvite => self.on_play_again_invite(sender),
        }
    }

    /// Packets only the room creator may originate are dropped unless
    /// they came from the adopted host. Forward compatibility: a single
    /// violation never disconnects the peer.
    fn from_host(&self, sender: Uuid, what: &str) -> bool {
        if self.host_id == Some(sender) && !self.is_room_creator {
            true
        } else {
            debug!("dropping {} from non-host {}", what, sender);
            false
        }
    }

    fn on_game_text(&mut self, sender: Uuid, text: GameText) {
        if !self.from_host(sender, "GAME_TEXT") {
            return;
        }
        self.text = text.text;
        self.language = text.language;
        self.emit_game_text();
    }

    fn on_ready_check(&mut self, sender: Uuid, text: GameText) {
        if !self.from_host(sender, "READY_CHECK") {
            return;
        }
        if !matches!(self.phase, Phase::Lobby | Phase::ReadyCheck { .. }) {
            debug!("dropping READY_CHECK in phase {:?}", self.phase.as_public());
            return;
        }
        // Resynchronize before answering, in case we joined late.
        self.text = text.text;
        self.language = text.language;
        self.emit_game_text();
        self.reset_race_state();
        self.emit_players();
        self.set_phase(Phase::ReadyCheck {
            responded: HashSet::new(),
        });
        self.push(Effect::Broadcast(PacketBody::ReadyResponse));
    }

    fn on_ready_response(&mut self, sender: Uuid) {
        if !self.is_room_creator {
            debug!("dropping READY_RESPONSE on a non-creator");
            return;
        }
        let all_in = {
            let Phase::ReadyCheck { responded } = &mut self.phase else {
                debug!("dropping READY_RESPONSE outside the ready-check");
                return;
            };
            responded.insert(sender);
            let responded = &*responded;
            self.roster.keys().all(|id| responded.contains(id))
        };
        if all_in {
            self.begin_countdown();
        }
    }

    fn on_countdown(&mut self, sender: Uuid, countdown: Countdown) {
        if !self.from_host(sender, "COUNTDOWN") {
            return;
        }
        self.reset_race_state();
        self.set_phase(Phase::CountingDown);
        self.emit(CoreEvent::CountdownStarted {
            seconds: countdown.seconds,
        });
    }

    fn on_game_start(&mut self, sender: Uuid) {
        if !self.from_host(sender, "GAME_START") {
            return;
        }
        if matches!(self.phase, Phase::Idle | Phase::Connecting { .. }) {
            debug!("dropping GAME_START outside a room");
            return;
        }
        self.set_phase(Phase::Racing);
    }

    fn on_progress(&mut self, sender: Uuid, progress: Progress) {
        if !matches!(self.phase, Phase::Racing) {
            debug!("dropping PROGRESS_UPDATE outside racing");
            return;
        }
        let Some(player) = self.roster.get_mut(&sender) else {
            debug!("dropping PROGRESS_UPDATE for unknown player {}", sender);
            return;
        };
        player.position = progress.position;
        player.total = progress.total;
        player.wpm = progress.wpm;
        let event = CoreEvent::ProgressUpdated {
            id: sender,
            name: player.name.clone(),
            progress: player.progress_ratio(),
            wpm: player.wpm,
            // The FINISH packet is what assigns ranks; until it arrives
            // the player counts as still typing.
            finished: player.finished,
            rank: player.rank,
        };
        self.emit(event);
    }

    fn on_finish(&mut self, sender: Uuid, finish: Finish) {
        if !matches!(self.phase, Phase::Racing) {
            debug!("dropping FINISH outside racing");
            return;
        }
        let now = self.clock.now_ms();
        let Some(player) = self.roster.get_mut(&sender) else {
            debug!("dropping FINISH for unknown player {}", sender);
            return;
        };
        if player.finished {
            // Duplicate FINISH: the first-assigned rank stands.
            debug!("duplicate FINISH from {}; rank {} stands", sender, player.rank);
            return;
        }
        self.finished_count += 1;
        player.finished = true;
        player.rank = self.finished_count;
        player.finish_time_ms = now;
        player.wpm = finish.wpm;
        player.accuracy = finish.accuracy;
        player.position = player.total.max(player.position);
        let event = CoreEvent::ProgressUpdated {
            id: sender,
            name: player.name.clone(),
            progress: player.progress_ratio(),
            wpm: player.wpm,
            finished: true,
            rank: player.rank,
        };
        self.emit(event);
        self.emit_players();
        self.check_completion();
    }

    fn on_race_results(&mut self, sender: Uuid, rankings: Vec<RankingEntry>) {
        if !self.from_host(sender, "RACE_RESULTS") {
            return;
        }
        // The creator's view is canonical; align the roster with it.
        for entry in &rankings {
            if let Some(player) = self.roster.get_mut(&entry.id) {
                player.finished = true;
                player.rank = entry.position;
                player.wpm = entry.wpm;
                player.accuracy = entry.accuracy;
            }
        }
        self.finished_count = self.roster.values().filter(|p| p.finished).count() as u32;
        self.rankings = rankings.clone();
        self.set_phase(Phase::Finished);
        self.emit_players();
        self.emit(CoreEvent::RaceFinished(rankings));
    }

    fn on_player_left(&mut self, sender: Uuid, left: PlayerLeft) {
        if !self.from_host(sender, "PLAYER_LEFT") {
            return;
        }
        if left.id == self.my_id {
            // We were kicked.
            info!("removed from the room by the host");
            self.reset_to_idle();
            return;
        }
        self.remove_player(left.id);
        self.push(Effect::ClosePeer(left.id));
    }

    fn on_play_again_invite(&mut self, sender: Uuid) {
        if !self.from_host(sender, "PLAY_AGAIN_INVITE") {
            return;
        }
        if !matches!(self.phase, Phase::Finished) {
            debug!("dropping PLAY_AGAIN_INVITE outside finished");
            return;
        }
        self.emit(CoreEvent::PlayAgainInvited);
    }

    // ── Shared internals ─────────────────────────────────────────────────

    fn remove_player(&mut self, id: Uuid) {
        let Some(gone) = self.roster.remove(&id) else {
            return;
        };
        if gone.finished {
            // Keep ranks contiguous: everyone ranked below moves up.
            self.finished_count = self.finished_count.saturating_sub(1);
            for player in self.roster.values_mut() {
                if player.finished && player.rank > gone.rank {
                    player.rank -= 1;
                }
            }
        }
        info!("player left: {}", gone.name);
        self.emit(CoreEvent::PlayerLeft { name: gone.name });
        self.emit_players();
        self.push(Effect::RefreshAnnounce);
        // A departure can complete the race for everyone remaining.
        self.check_completion();
    }

    fn check_completion(&mut self) {
        if !self.is_room_creator || !matches!(self.phase, Phase::Racing) {
            return;
        }
        if self.roster.is_empty() || self.roster.values().any(|p| !p.finished) {
            return;
        }
        let mut finishers: Vec<&Player> = self.roster.values().collect();
        finishers.sort_by_key(|p| p.rank);
        let rankings: Vec<RankingEntry> = finishers
            .into_iter()
            .map(|p| RankingEntry {
                id: p.id,
                name: p.name.clone(),
                wpm: p.wpm,
                accuracy: p.accuracy,
                position: p.rank,
            })
            .collect();
        info!("race complete with {} finisher(s)", rankings.len());
        self.rankings = rankings.clone();
        self.push(Effect::Broadcast(PacketBody::RaceResults(rankings.clone())));
        self.set_phase(Phase::Finished);
        self.emit(CoreEvent::RaceFinished(rankings));
        self.push(Effect::RefreshAnnounce);
    }

    fn reset_race_state(&mut self) {
        self.finished_count = 0;
        self.rankings.clear();
        for player in self.roster.values_mut() {
            player.reset_race();
        }
    }

    fn fail_join(&mut self, reason: String) {
        warn!("join failed: {}", reason);
        self.emit(CoreEvent::JoinFailed { reason });
        self.reset_to_idle();
    }

    /// Tear everything down and re-emit the resulting state so the UI
    /// can reset. Used by `leave_room`, join failures, and being kicked.
    fn reset_to_idle(&mut self) {
        self.push(Effect::CancelAllTimers);
        self.push(Effect::CloseAllPeers);
        self.push(Effect::CloseListener);
        self.is_room_creator = false;
        self.host_id = None;
        self.text.clear();
        self.rankings.clear();
        self.finished_count = 0;
        self.roster.retain(|_, p| p.is_local);
        if let Some(me) = self.roster.get_mut(&self.my_id) {
            me.reset_race();
        }
        self.phase = Phase::Idle;
        self.emit(CoreEvent::PhaseChanged(SessionPhase::Idle));
        self.emit(CoreEvent::AuthorityChanged(false));
        self.emit_players();
        self.emit_game_text();
        self.push(Effect::RefreshAnnounce);
    }
}
