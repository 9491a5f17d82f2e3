//! Thread-safe handle for driving the core from the UI thread.
//!
//! All mutation goes through a command channel into the core loop; the
//! handle itself only holds shared read-side state (the room directory
//! and the interface list) plus the shutdown token.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::net::discovery::{directory_snapshot, RoomDirectory};
use crate::net::interfaces::{best_ip, NetInterface};
use crate::net::protocol::RoomEntry;

pub(crate) enum Command {
    CreateRoom {
        reply: oneshot::Sender<bool>,
    },
    JoinRoom {
        target: SocketAddr,
        reply: oneshot::Sender<bool>,
    },
    LeaveRoom,
    SetPlayerName(String),
    SetSelectedInterface(Option<Ipv4Addr>),
    SetGameLanguage(String),
    SetGameText(String),
    RefreshGameText,
    StartCountdown,
    KickPlayer(Uuid),
    UpdateProgress {
        position: u32,
        total: u32,
        wpm: f64,
    },
    FinishRace {
        wpm: f64,
        accuracy: f64,
        errors: u32,
    },
    SendPlayAgainInvite,
    AcceptPlayAgain,
    DeclinePlayAgain,
}

/// Cloneable handle to one running core.
#[derive(Clone)]
pub struct CoreHandle {
    pub(crate) cmd: mpsc::Sender<Command>,
    pub(crate) rooms: RoomDirectory,
    pub(crate) interfaces: Arc<Vec<NetInterface>>,
    pub(crate) cancel: CancellationToken,
}

impl CoreHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.cmd
            .send(command)
            .await
            .ok()
            .context("core task stopped")
    }

    /// Open a room and start announcing it. Returns false when a session
    /// is already active.
    pub async fn create_room(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateRoom { reply }).await?;
        rx.await.context("core task stopped")
    }

    /// Dial a discovered (or known) room. A true result only means the
    /// attempt started; completion arrives as `JoinSucceeded` or
    /// `JoinFailed`.
    pub async fn join_room(&self, ip: IpAddr, port: u16) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::JoinRoom {
            target: SocketAddr::new(ip, port),
            reply,
        })
        .await?;
        rx.await.context("core task stopped")
    }

    pub async fn leave_room(&self) -> Result<()> {
        self.send(Command::LeaveRoom).await
    }

    /// Only effective while idle or in the lobby.
    pub async fn set_player_name(&self, name: impl Into<String>) -> Result<()> {
        self.send(Command::SetPlayerName(name.into())).await
    }

    /// Pin discovery broadcasts to one interface, or `None` for the
    /// global broadcast address.
    pub async fn set_selected_interface(&self, ip: Option<Ipv4Addr>) -> Result<()> {
        self.send(Command::SetSelectedInterface(ip)).await
    }

    /// Room creator only; silently ignored otherwise.
    pub async fn set_game_language(&self, language: impl Into<String>) -> Result<()> {
        self.send(Command::SetGameLanguage(language.into())).await
    }

    /// Room creator only; silently ignored otherwise.
    pub async fn set_game_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SetGameText(text.into())).await
    }

    /// Room creator only; silently ignored otherwise.
    pub async fn refresh_game_text(&self) -> Result<()> {
        self.send(Command::RefreshGameText).await
    }

    /// Room creator only; silently ignored otherwise.
    pub async fn start_countdown(&self) -> Result<()> {
        self.send(Command::StartCountdown).await
    }

    /// Room creator only; silently ignored otherwise.
    pub async fn kick_player(&self, id: Uuid) -> Result<()> {
        self.send(Command::KickPlayer(id)).await
    }

    /// Feed the local typing position; broadcast on the next ticker fire.
    pub async fn update_progress(&self, position: u32, total: u32, wpm: f64) -> Result<()> {
        self.send(Command::UpdateProgress {
            position,
            total,
            wpm,
        })
        .await
    }

    /// Report the local player done. Idempotent.
    pub async fn finish_race(&self, wpm: f64, accuracy: f64, errors: u32) -> Result<()> {
        self.send(Command::FinishRace {
            wpm,
            accuracy,
            errors,
        })
        .await
    }

    pub async fn send_play_again_invite(&self) -> Result<()> {
        self.send(Command::SendPlayAgainInvite).await
    }

    pub async fn accept_play_again(&self) -> Result<()> {
        self.send(Command::AcceptPlayAgain).await
    }

    pub async fn decline_play_again(&self) -> Result<()> {
        self.send(Command::DeclinePlayAgain).await
    }

    /// Rooms currently visible on the LAN.
    pub fn discovered_rooms(&self) -> Vec<RoomEntry> {
        directory_snapshot(&self.rooms)
    }

    /// Usable interfaces for the interface picker.
    pub fn available_interfaces(&self) -> Vec<NetInterface> {
        (*self.interfaces).clone()
    }

    /// The address discovery would pick without user input.
    pub fn best_interface_ip(&self) -> Ipv4Addr {
        best_ip(&self.interfaces)
    }

    /// Stop every task belonging to this core.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
