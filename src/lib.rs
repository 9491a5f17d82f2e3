//! Serverless LAN multiplayer core for a typing race game.
//!
//! Two or more instances on the same network discover each other over
//! UDP broadcast, form a fully connected mesh of TCP connections, agree
//! on shared race text, run a synchronized countdown, trade progress
//! updates while everyone types, and settle on one final ranking even
//! when players drop mid-race.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────────┐
//!  │                          core loop                             │
//!  │                                                                │
//!  │   ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐  │
//!  │   │  UDP announcer│  │ UDP scanner  │   │  TCP listener    │  │
//!  │   │  (own room)   │  │ (directory)  │   │  (accept loop)   │  │
//!  │   └──────────────┘   └──────┬───────┘   └────────┬─────────┘  │
//!  │                             │                    │            │
//!  │                       RoomDirectory         MeshManager       │
//!  │                                                  │            │
//!  │                                     one reader + one writer   │
//!  │                                     task per peer connection  │
//!  │                                                                │
//!  │   Session (sans-IO state machine) ──effects──▶ executed here  │
//!  └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The embedding UI talks to the core through a [`CoreHandle`] and reads
//! everything observable from the [`CoreEvent`] channel. Two
//! capabilities are injected: a [`TextProvider`] for race text and a
//! [`Clock`] for monotonic timestamps.
//!
//! ```no_run
//! use std::sync::Arc;
//! use typerace_lan::{spawn_core, CoreConfig, StaticWordBank, SystemClock};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let provider = Arc::new(StaticWordBank::new(["hello", "world"]));
//! let clock = Arc::new(SystemClock::new());
//! let (core, mut events) = spawn_core(CoreConfig::default(), provider, clock);
//!
//! core.create_room().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod events;
mod handle;
pub mod net;
mod runtime;
mod session;
pub mod text;

pub use clock::{Clock, SystemClock};
pub use config::CoreConfig;
pub use events::{CoreEvent, PlayerSnapshot, RankingEntry, SessionPhase};
pub use handle::CoreHandle;
pub use net::interfaces::{InterfaceKind, NetInterface};
pub use net::protocol::{RoomEntry, RoomStatus, DISCOVERY_PORT};
pub use runtime::spawn_core;
pub use text::{StaticWordBank, TextProvider};
