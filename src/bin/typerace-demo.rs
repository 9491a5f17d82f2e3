//! Terminal demo for the LAN race core.
//!
//! Runs a headless player that hosts or joins a room and "types" the
//! shared text at a fixed pace, printing every core event. Start one
//! `host` and one or more `join`/`auto` instances on the same LAN (or
//! the same machine) to watch a full race.
//!
//! ```text
//! typerace-demo host [name]        host a room, start once someone joins
//! typerace-demo join <ip:port> [name]
//! typerace-demo auto [name]        join the first room discovery finds
//! typerace-demo scan               list visible rooms for ten seconds
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use tokio::sync::mpsc;
use tokio::time::sleep;

use typerace_lan::{
    spawn_core, CoreConfig, CoreEvent, CoreHandle, SessionPhase, StaticWordBank, SystemClock,
};

/// Milliseconds per simulated keystroke.
const TYPING_PACE_MS: u64 = 120;

#[tokio::main]
async fn main() -> Result<()> {
    TermLogger::init(
        LevelFilter::Info,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .ok();

    let args: Vec<String> = std::env::args().collect();
    let provider = Arc::new(StaticWordBank::new([
        "the", "quick", "brown", "fox", "jumps", "over", "a", "lazy", "dog",
    ]));
    let clock = Arc::new(SystemClock::new());

    match args.get(1).map(String::as_str) {
        Some("host") => {
            let config = CoreConfig {
                player_name: args.get(2).cloned(),
                ..CoreConfig::default()
            };
            let (core, events) = spawn_core(config, provider, clock);
            core.create_room().await?;
            println!("room open; waiting for players …");
            run_player(core, events, true).await
        }
        Some("join") => {
            let Some(addr) = args.get(2) else {
                bail!("usage: typerace-demo join <ip:port> [name]");
            };
            let target: SocketAddr = addr.parse()?;
            let config = CoreConfig {
                player_name: args.get(3).cloned(),
                ..CoreConfig::default()
            };
            let (core, events) = spawn_core(config, provider, clock);
            core.join_room(target.ip(), target.port()).await?;
            run_player(core, events, false).await
        }
        Some("auto") => {
            let config = CoreConfig {
                player_name: args.get(2).cloned(),
                ..CoreConfig::default()
            };
            let (core, mut events) = spawn_core(config, provider, clock);
            println!("scanning for a room …");
            let room = loop {
                match events.recv().await {
                    Some(CoreEvent::RoomFound(room)) => break room,
                    Some(_) => continue,
                    None => bail!("core stopped before a room appeared"),
                }
            };
            println!("joining {} at {}:{}", room.host_name, room.ip, room.port);
            core.join_room(room.ip, room.port).await?;
            run_player(core, events, false).await
        }
        Some("scan") => {
            let (core, mut events) = spawn_core(CoreConfig::default(), provider, clock);
            println!("scanning for ten seconds …");
            let deadline = sleep(Duration::from_secs(10));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.recv() => match event {
                        Some(CoreEvent::RoomsChanged(rooms)) => {
                            for room in &rooms {
                                println!(
                                    "  {} — {}:{} ({} player(s), {:?})",
                                    room.host_name, room.ip, room.port,
                                    room.player_count, room.status,
                                );
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
            core.shutdown();
            Ok(())
        }
        _ => {
            eprintln!("usage: typerace-demo host [name] | join <ip:port> [name] | auto [name] | scan");
            Ok(())
        }
    }
}

/// Shared event loop: print what happens, auto-start when hosting, and
/// type the text at a fixed pace once the race begins.
async fn run_player(
    core: CoreHandle,
    mut events: mpsc::Receiver<CoreEvent>,
    hosting: bool,
) -> Result<()> {
    let mut text_len: u32 = 0;

    while let Some(event) = events.recv().await {
        match event {
            CoreEvent::GameTextChanged { text, language } => {
                text_len = text.chars().count() as u32;
                println!("text ({}): {}", language, text);
            }
            CoreEvent::PlayerJoined { name } => {
                println!("+ {}", name);
                if hosting {
                    // Give stragglers a moment, then go.
                    let core = core.clone();
                    tokio::spawn(async move {
                        sleep(Duration::from_secs(2)).await;
                        let _ = core.start_countdown().await;
                    });
                }
            }
            CoreEvent::PlayerLeft { name } => println!("- {}", name),
            CoreEvent::JoinSucceeded => println!("joined the room"),
            CoreEvent::JoinFailed { reason } => {
                println!("join failed: {}", reason);
                break;
            }
            CoreEvent::CountdownStarted { seconds } => println!("race in {} …", seconds),
            CoreEvent::PhaseChanged(SessionPhase::Racing) => {
                println!("go!");
                tokio::spawn(type_the_text(core.clone(), text_len));
            }
            CoreEvent::ProgressUpdated {
                name,
                progress,
                wpm,
                finished,
                rank,
                ..
            } => {
                if finished {
                    println!("{} finished #{} at {:.0} wpm", name, rank, wpm);
                } else {
                    println!("{} {:>3.0}% ({:.0} wpm)", name, progress * 100.0, wpm);
                }
            }
            CoreEvent::RaceFinished(rankings) => {
                println!("results:");
                for entry in &rankings {
                    println!(
                        "  #{} {} — {:.0} wpm, {:.1}%",
                        entry.position, entry.name, entry.wpm, entry.accuracy
                    );
                }
                break;
            }
            CoreEvent::PlayAgainInvited => {
                core.decline_play_again().await?;
                break;
            }
            _ => {}
        }
    }

    core.leave_room().await.ok();
    core.shutdown();
    Ok(())
}

/// Simulate typing: one keystroke per tick, then report the finish.
async fn type_the_text(core: CoreHandle, total: u32) {
    if total == 0 {
        return;
    }
    let start = std::time::Instant::now();
    for position in 1..=total {
        sleep(Duration::from_millis(TYPING_PACE_MS)).await;
        let minutes = start.elapsed().as_secs_f64() / 60.0;
        let wpm = if minutes > 0.0 {
            f64::from(position) / 5.0 / minutes
        } else {
            0.0
        };
        let _ = core.update_progress(position, total, wpm).await;
    }
    let minutes = start.elapsed().as_secs_f64() / 60.0;
    let wpm = f64::from(total) / 5.0 / minutes;
    let _ = core.finish_race(wpm, 100.0, 0).await;
}
