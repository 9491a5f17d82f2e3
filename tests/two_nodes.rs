//! Two real cores racing over loopback TCP.
//!
//! Discovery stays off so the test is self-contained; the guest joins by
//! explicit address, which exercises the whole mesh path: listener,
//! dial, HELLO handshake, PEER_LIST, text sync, ready-check, countdown,
//! progress, finish, and rankings.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use typerace_lan::{
    spawn_core, CoreConfig, CoreEvent, SessionPhase, StaticWordBank, SystemClock,
};

const HOST_PORT: u16 = 47311;
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn config(name: &str, tcp_port: u16) -> CoreConfig {
    CoreConfig {
        player_name: Some(name.to_string()),
        tcp_port,
        enable_discovery: false,
        ..CoreConfig::default()
    }
}

fn spawn(name: &str, tcp_port: u16) -> (typerace_lan::CoreHandle, mpsc::Receiver<CoreEvent>) {
    spawn_core(
        config(name, tcp_port),
        Arc::new(StaticWordBank::new(["alpha", "beta", "gamma"])),
        Arc::new(SystemClock::new()),
    )
}

/// Drain events until one matches, with a hard deadline.
async fn wait_for<F>(
    events: &mut mpsc::Receiver<CoreEvent>,
    what: &str,
    mut matches: F,
) -> CoreEvent
where
    F: FnMut(&CoreEvent) -> bool,
{
    timeout(Duration::from_secs(15), async {
        loop {
            let event = events.recv().await.unwrap_or_else(|| {
                panic!("core stopped while waiting for {}", what);
            });
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

#[tokio::test]
async fn two_nodes_run_a_full_race() {
    let (host, mut host_events) = spawn("alice", HOST_PORT);
    let (guest, mut guest_events) = spawn("bob", 0);

    assert!(host.create_room().await.expect("create_room"));
    host.set_game_text("alpha beta gamma").await.unwrap();

    assert!(guest.join_room(LOCALHOST, HOST_PORT).await.expect("join_room"));
    wait_for(&mut guest_events, "join success", |e| {
        matches!(e, CoreEvent::JoinSucceeded)
    })
    .await;
    wait_for(&mut host_events, "bob to appear", |e| {
        matches!(e, CoreEvent::PlayerJoined { name } if name == "bob")
    })
    .await;

    // The guest inherits the host's text.
    wait_for(&mut guest_events, "text sync", |e| {
        matches!(e, CoreEvent::GameTextChanged { text, .. } if text == "alpha beta gamma")
    })
    .await;

    // Both rosters hold both players.
    let snapshot = wait_for(&mut host_events, "full roster on the host", |e| {
        matches!(e, CoreEvent::PlayersChanged(players) if players.len() == 2)
    })
    .await;
    if let CoreEvent::PlayersChanged(players) = snapshot {
        let mut names: Vec<&str> = players.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["alice", "bob"]);
    }

    // Ready-check and countdown.
    host.start_countdown().await.unwrap();
    wait_for(&mut guest_events, "the countdown", |e| {
        matches!(e, CoreEvent::CountdownStarted { seconds: 3 })
    })
    .await;
    wait_for(&mut host_events, "host racing", |e| {
        matches!(e, CoreEvent::PhaseChanged(SessionPhase::Racing))
    })
    .await;
    wait_for(&mut guest_events, "guest racing", |e| {
        matches!(e, CoreEvent::PhaseChanged(SessionPhase::Racing))
    })
    .await;

    // Alice types everything and finishes first.
    host.update_progress(15, 15, 60.0).await.unwrap();
    host.finish_race(60.0, 100.0, 0).await.unwrap();

    // Bob sees her finish with rank 1 before finishing himself.
    wait_for(&mut guest_events, "alice's finish", |e| {
        matches!(
            e,
            CoreEvent::ProgressUpdated { name, finished: true, rank: 1, .. } if name == "alice"
        )
    })
    .await;
    guest.update_progress(15, 15, 40.0).await.unwrap();
    guest.finish_race(40.0, 100.0, 0).await.unwrap();

    // Both nodes settle on the same rankings.
    let host_results = wait_for(&mut host_events, "host rankings", |e| {
        matches!(e, CoreEvent::RaceFinished(_))
    })
    .await;
    let guest_results = wait_for(&mut guest_events, "guest rankings", |e| {
        matches!(e, CoreEvent::RaceFinished(_))
    })
    .await;

    for results in [&host_results, &guest_results] {
        let CoreEvent::RaceFinished(rankings) = results else {
            unreachable!();
        };
        assert_eq!(rankings.len(), 2);
        assert_eq!(rankings[0].name, "alice");
        assert_eq!(rankings[0].position, 1);
        assert_eq!(rankings[0].wpm, 60.0);
        assert_eq!(rankings[1].name, "bob");
        assert_eq!(rankings[1].position, 2);
        assert_eq!(rankings[1].wpm, 40.0);
    }

    host.shutdown();
    guest.shutdown();
}

#[tokio::test]
async fn joining_a_dead_endpoint_fails() {
    let (guest, mut events) = spawn("carol", 0);

    // Port 1 is never listening; the dial is refused almost instantly.
    assert!(guest.join_room(LOCALHOST, 1).await.expect("join_room"));
    wait_for(&mut events, "the join failure", |e| {
        matches!(e, CoreEvent::JoinFailed { .. })
    })
    .await;

    guest.shutdown();
}
