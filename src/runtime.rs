//! Core runtime — wires the session state machine to sockets and timers.
//!
//! One task owns every piece of mutable state (session, mesh, timers);
//! auxiliary tasks (listener accept loop, per-connection readers and
//! writers, discovery, timers) only feed typed events back into it. The
//! session expresses its decisions as [`Effect`]s, and `flush` executes
//! them here against the mesh, discovery, and the event channel.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::events::CoreEvent;
use crate::handle::{Command, CoreHandle};
use crate::net::discovery::{self, AnnounceState};
use crate::net::interfaces::{self, NetInterface};
use crate::net::mesh::{ConnId, MeshManager, NetEvent};
use crate::net::protocol::{Hello, Packet, PacketBody, PROGRESS_INTERVAL};
use crate::session::{Effect, Session, TimerKind};
use crate::text::TextProvider;

/// Start one core instance. Must be called from within a Tokio runtime.
///
/// Returns the command handle and the event channel the UI consumes.
/// Shutting down is `handle.shutdown()`; dropping the handle alone also
/// stops the core loop once its command channel closes.
pub fn spawn_core(
    config: CoreConfig,
    text_provider: Arc<dyn TextProvider>,
    clock: Arc<dyn Clock>,
) -> (CoreHandle, mpsc::Receiver<CoreEvent>) {
    let my_id = Uuid::new_v4();
    let my_name = config
        .player_name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| format!("Racer-{}", &my_id.to_string()[..8]))
        });

    let (events_tx, events_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (net_tx, net_rx) = mpsc::channel(256);
    let (timer_tx, timer_rx) = mpsc::channel(16);
    let (announce_tx, announce_rx) = watch::channel(AnnounceState::default());
    let cancel = CancellationToken::new();
    let rooms = discovery::new_directory();
    let ifaces = Arc::new(interfaces::enumerate());

    info!("core started: id={}, name={}", my_id, my_name);

    if config.enable_discovery {
        let port = config.resolved_discovery_port();
        tokio::spawn(discovery::run_announcer(
            my_id,
            port,
            announce_rx,
            cancel.child_token(),
        ));
        {
            let directory = rooms.clone();
            let clock = clock.clone();
            let events = events_tx.clone();
            let token = cancel.child_token();
            tokio::spawn(async move {
                match discovery::bind_reusable_udp(port).await {
                    Ok(socket) => {
                        discovery::run_scanner(my_id, socket, directory, clock, events, token)
                            .await
                    }
                    Err(e) => error!("discovery disabled: {:#}", e),
                }
            });
        }
        tokio::spawn(discovery::run_directory_sweeper(
            rooms.clone(),
            clock.clone(),
            events_tx.clone(),
            cancel.child_token(),
        ));
    }

    let session = Session::new(
        my_id,
        my_name,
        config.max_players,
        clock.clone(),
        text_provider,
    );
    let mesh = MeshManager::new(net_tx.clone(), cancel.child_token());

    let core = Core {
        session,
        mesh,
        tcp_port: config.tcp_port,
        listen_port: 0,
        listener_cancel: None,
        timers: HashMap::new(),
        selected_broadcast: Ipv4Addr::BROADCAST,
        interfaces: ifaces.clone(),
        announce_tx,
        events: events_tx,
        net_tx,
        timer_tx,
        clock,
        cancel: cancel.clone(),
    };
    tokio::spawn(core.run(cmd_rx, net_rx, timer_rx));

    (
        CoreHandle {
            cmd: cmd_tx,
            rooms,
            interfaces: ifaces,
            cancel,
        },
        events_rx,
    )
}

struct Core {
    session: Session,
    mesh: MeshManager,
    /// Configured listen port; 0 lets the OS pick.
    tcp_port: u16,
    /// Actually bound port, 0 while not listening.
    listen_port: u16,
    listener_cancel: Option<CancellationToken>,
    timers: HashMap<TimerKind, CancellationToken>,
    selected_broadcast: Ipv4Addr,
    interfaces: Arc<Vec<NetInterface>>,
    announce_tx: watch::Sender<AnnounceState>,
    events: mpsc::Sender<CoreEvent>,
    net_tx: mpsc::Sender<NetEvent>,
    timer_tx: mpsc::Sender<TimerKind>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Core {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut net_rx: mpsc::Receiver<NetEvent>,
        mut timer_rx: mpsc::Receiver<TimerKind>,
    ) {
        let mut progress = interval(PROGRESS_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => break,
                },
                Some(event) = net_rx.recv() => self.on_net(event).await,
                Some(kind) = timer_rx.recv() => {
                    self.session.handle_timer(kind);
                    self.flush().await;
                }
                _ = progress.tick() => self.on_progress_tick(),
            }
        }
        self.mesh.shutdown_conns();
        debug!("core loop stopped");
    }

    fn make_packet(&self, body: PacketBody) -> Packet {
        Packet {
            sender: self.session.my_id(),
            ts: self.clock.now_ms(),
            body,
        }
    }

    // ── Commands from the handle ─────────────────────────────────────────

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::CreateRoom { reply } => {
                let ok = self.session.create_room();
                self.flush().await;
                let _ = reply.send(ok);
            }
            Command::JoinRoom { target, reply } => {
                let ok = self.session.join_room(target);
                self.flush().await;
                let _ = reply.send(ok);
            }
            Command::LeaveRoom => {
                self.session.leave_room();
                self.flush().await;
            }
            Command::SetPlayerName(name) => {
                self.session.set_player_name(name);
                self.flush().await;
            }
            Command::SetSelectedInterface(ip) => {
                self.selected_broadcast = ip
                    .and_then(|ip| self.interfaces.iter().find(|iface| iface.ip == ip))
                    .map(|iface| iface.broadcast)
                    .unwrap_or(Ipv4Addr::BROADCAST);
                self.refresh_announce();
            }
            Command::SetGameLanguage(language) => {
                self.session.set_game_language(language);
                self.flush().await;
            }
            Command::SetGameText(text) => {
                self.session.set_game_text(text);
                self.flush().await;
            }
            Command::RefreshGameText => {
                self.session.refresh_game_text();
                self.flush().await;
            }
            Command::StartCountdown => {
                self.session.start_countdown();
                self.flush().await;
            }
            Command::KickPlayer(id) => {
                self.session.kick_player(id);
                self.flush().await;
            }
            Command::UpdateProgress {
                position,
                total,
                wpm,
            } => {
                self.session.update_progress(position, total, wpm);
            }
            Command::FinishRace {
                wpm,
                accuracy,
                errors,
            } => {
                self.session.finish_race(wpm, accuracy, errors);
                self.flush().await;
            }
            Command::SendPlayAgainInvite => {
                self.session.send_play_again_invite();
                self.flush().await;
            }
            Command::AcceptPlayAgain => {
                self.session.accept_play_again();
                self.flush().await;
            }
            Command::DeclinePlayAgain => {
                self.session.decline_play_again();
                self.flush().await;
            }
        }
    }

    // ── Socket events ────────────────────────────────────────────────────

    async fn on_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Accepted { stream, addr } => {
                if self.session.roster_len() >= self.session.max_players() {
                    info!("rejecting connection from {}: room full", addr);
                    drop(stream);
                    return;
                }
                info!("accepted connection from {}", addr);
                let conn = self.mesh.adopt_stream(stream, false, None);
                self.send_hello(conn);
            }
            NetEvent::DialDone { target, result } => match result {
                Ok(stream) => {
                    info!("connected to {}", target);
                    let conn = self.mesh.adopt_stream(stream, true, Some(target));
                    self.send_hello(conn);
                }
                Err(e) => {
                    debug!("dial to {} failed: {}", target, e);
                    self.mesh.dial_failed(target);
                    self.session.dial_failed(target, &e.to_string());
                    self.flush().await;
                }
            },
            NetEvent::Packet { conn, packet } => self.on_packet(conn, packet).await,
            NetEvent::Closed { conn, reason } => {
                // A connection we closed ourselves is already gone from
                // the mesh; nothing to do then.
                if let Some(peer) = self.mesh.remove_conn(conn) {
                    info!("connection {} closed: {}", peer.key(), reason);
                    if let Some(id) = peer.id {
                        self.session.peer_lost(id);
                    } else if let (true, Some(target)) = (peer.outbound, peer.dial_target) {
                        self.session.dial_failed(target, &reason);
                    }
                    self.flush().await;
                }
            }
        }
    }

    async fn on_packet(&mut self, conn: ConnId, packet: Packet) {
        match packet.body {
            PacketBody::Hello(hello) => {
                let my_id = self.session.my_id();
                let Some(outcome) = self.mesh.handle_hello(conn, packet.sender, &hello, my_id)
                else {
                    return;
                };
                if outcome.replaced_existing || self.session.has_player(outcome.id) {
                    return;
                }
                self.session.peer_joined(
                    outcome.id,
                    outcome.name,
                    outcome.addr,
                    outcome.listen_port,
                    outcome.is_room_creator,
                    outcome.host_uuid,
                );
                if self.session.has_player(outcome.id) {
                    // Introduce the rest of the mesh. The list never
                    // contains us: our HELLO already did that.
                    let entries = self.mesh.peer_list_excluding(outcome.id);
                    let list = self.make_packet(PacketBody::PeerList(entries));
                    self.mesh.send_to_id(outcome.id, &list);
                }
                self.flush().await;
            }
            PacketBody::PeerList(entries) => {
                for target in self.mesh.peers_to_dial(self.session.my_id(), &entries) {
                    self.mesh.begin_dial(target);
                }
            }
            body => match self.mesh.sender_of(conn) {
                Some(id) if id == packet.sender => {
                    self.session.handle_packet(id, body);
                    self.flush().await;
                }
                Some(_) => debug!("dropping {} with a mismatched sender", body.kind_name()),
                None => debug!("dropping {} before handshake", body.kind_name()),
            },
        }
    }

    fn on_progress_tick(&mut self) {
        if let Some(progress) = self.session.progress_body() {
            let packet = self.make_packet(PacketBody::Progress(progress));
            self.mesh.broadcast(&packet);
        }
    }

    fn send_hello(&mut self, conn: ConnId) {
        let body = PacketBody::Hello(Hello {
            name: self.session.my_name(),
            port: self.listen_port,
            is_room_creator: self.session.is_authority(),
            host_uuid: self.session.advertised_host(),
        });
        let packet = self.make_packet(body);
        self.mesh.send(conn, &packet);
    }

    // ── Effect execution ─────────────────────────────────────────────────

    async fn flush(&mut self) {
        // Executing one batch can queue more (a failed listener rolls the
        // session back, for instance), so drain until quiet.
        loop {
            let effects = self.session.drain_effects();
            if effects.is_empty() {
                break;
            }
            for effect in effects {
                match effect {
                    Effect::Broadcast(body) => {
                        let packet = self.make_packet(body);
                        self.mesh.broadcast(&packet);
                    }
                    Effect::SendToPeer(id, body) => {
                        let packet = self.make_packet(body);
                        self.mesh.send_to_id(id, &packet);
                    }
                    Effect::Emit(event) => {
                        let _ = self.events.send(event).await;
                    }
                    Effect::Dial(target) => {
                        self.mesh.begin_dial(target);
                    }
                    Effect::ClosePeer(id) => self.mesh.disconnect_id(id),
                    Effect::CloseAllPeers => self.mesh.shutdown_conns(),
                    Effect::OpenListener => self.open_listener().await,
                    Effect::CloseListener => self.close_listener(),
                    Effect::StartTimer(kind, duration) => self.start_timer(kind, duration),
                    Effect::CancelTimer(kind) => {
                        if let Some(timer) = self.timers.remove(&kind) {
                            timer.cancel();
                        }
                    }
                    Effect::CancelAllTimers => {
                        for (_, timer) in self.timers.drain() {
                            timer.cancel();
                        }
                    }
                    Effect::RefreshAnnounce => self.refresh_announce(),
                }
            }
        }
    }

    async fn open_listener(&mut self) {
        if self.listener_cancel.is_some() {
            return;
        }
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.tcp_port));
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => {
                let port = listener
                    .local_addr()
                    .map(|addr| addr.port())
                    .unwrap_or(self.tcp_port);
                self.listen_port = port;
                self.mesh
                    .set_self_endpoints(port, &interfaces::local_ipv4s());
                info!("mesh listener on port {}", port);

                let token = self.cancel.child_token();
                let accept_token = token.clone();
                let net_tx = self.net_tx.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = accept_token.cancelled() => break,
                            accepted = listener.accept() => match accepted {
                                Ok((stream, addr)) => {
                                    if net_tx
                                        .send(NetEvent::Accepted { stream, addr })
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Err(e) => warn!("accept error: {}", e),
                            }
                        }
                    }
                });
                self.listener_cancel = Some(token);
            }
            Err(e) => {
                error!("could not bind the mesh listener: {}", e);
                self.session.listener_failed(&e.to_string());
            }
        }
    }

    fn close_listener(&mut self) {
        if let Some(token) = self.listener_cancel.take() {
            token.cancel();
        }
        self.listen_port = 0;
    }

    fn start_timer(&mut self, kind: TimerKind, duration: Duration) {
        if let Some(old) = self.timers.remove(&kind) {
            old.cancel();
        }
        let token = self.cancel.child_token();
        let task_token = token.clone();
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    let _ = timer_tx.send(kind).await;
                }
            }
        });
        self.timers.insert(kind, token);
    }

    fn refresh_announce(&mut self) {
        let state = match self.session.announce_status() {
            Some((player_count, status)) => AnnounceState {
                active: true,
                name: self.session.my_name(),
                tcp_port: self.listen_port,
                player_count,
                status,
                broadcast_addr: self.selected_broadcast,
            },
            None => AnnounceState {
                broadcast_addr: self.selected_broadcast,
                ..Default::default()
            },
        };
        let _ = self.announce_tx.send(state);
    }
}
