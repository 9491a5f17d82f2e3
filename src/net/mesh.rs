//! TCP mesh — peer connections, handshake, duplicate resolution.
//!
//! The mesh manager is the exclusive owner of every peer connection. A
//! connection starts anonymous ("pending:ip:port") and is keyed by the
//! remote player's id once its HELLO arrives. Each connection runs two
//! small tasks: a reader that feeds bytes through a [`FrameCodec`] and
//! forwards decoded packets to the core loop, and a writer that drains a
//! best-effort outbound queue. Everything stateful happens on the core
//! loop via the methods here; the tasks never touch shared state.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::FrameCodec;
use super::protocol::{Hello, Packet, PeerEntry};

/// Identifies one TCP connection for the life of its socket. Stable
/// across the pending→identified rekey, unlike the display key.
pub(crate) type ConnId = u64;

/// Everything the socket tasks report back to the core loop.
pub(crate) enum NetEvent {
    /// The listener accepted an inbound connection.
    Accepted { stream: TcpStream, addr: SocketAddr },
    /// An outbound dial finished, successfully or not.
    DialDone {
        target: SocketAddr,
        result: std::io::Result<TcpStream>,
    },
    /// A full packet arrived on a connection.
    Packet { conn: ConnId, packet: Packet },
    /// A connection ended: remote close, socket error, or a protocol
    /// violation detected by the codec.
    Closed { conn: ConnId, reason: String },
}

/// One TCP connection and what we know about the player behind it.
pub(crate) struct Peer {
    /// Filled once HELLO arrives.
    pub id: Option<Uuid>,
    pub name: String,
    /// Remote address of the socket.
    pub addr: IpAddr,
    /// The port the remote *listens* on, learned from HELLO; 0 until then.
    pub listen_port: u16,
    /// True when we dialed this connection.
    pub outbound: bool,
    pub handshaken: bool,
    /// The address we dialed, for matching join attempts.
    pub dial_target: Option<SocketAddr>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl Peer {
    /// Display key for log messages.
    pub fn key(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => format!("pending:{}:{}", self.addr, self.listen_port),
        }
    }
}

/// Result of a completed HELLO handshake, handed to the session layer.
pub(crate) struct HelloOutcome {
    pub id: Uuid,
    pub name: String,
    pub addr: IpAddr,
    pub listen_port: u16,
    pub is_room_creator: bool,
    pub host_uuid: Option<Uuid>,
    /// True when this HELLO re-identified an already known peer after
    /// duplicate-connection resolution (no roster change needed).
    pub replaced_existing: bool,
}

pub(crate) struct MeshManager {
    peers: HashMap<ConnId, Peer>,
    by_id: HashMap<Uuid, ConnId>,
    dialing: HashSet<SocketAddr>,
    /// Addresses that would loop back to our own listener.
    self_endpoints: HashSet<SocketAddr>,
    next_conn: ConnId,
    net_tx: mpsc::Sender<NetEvent>,
    cancel: CancellationToken,
}

impl MeshManager {
    pub fn new(net_tx: mpsc::Sender<NetEvent>, cancel: CancellationToken) -> Self {
        Self {
            peers: HashMap::new(),
            by_id: HashMap::new(),
            dialing: HashSet::new(),
            self_endpoints: HashSet::new(),
            next_conn: 1,
            net_tx,
            cancel,
        }
    }

    /// Record the endpoints our own listener is reachable on, so a
    /// PEER_LIST entry pointing back at us is never dialed.
    pub fn set_self_endpoints(&mut self, port: u16, local_ips: &[Ipv4Addr]) {
        self.self_endpoints = local_ips
            .iter()
            .map(|ip| SocketAddr::new(IpAddr::V4(*ip), port))
            .collect();
    }

    // ── Connection lifecycle ─────────────────────────────────────────────

    /// Take ownership of a freshly accepted or dialed stream and spawn
    /// its reader and writer tasks.
    pub fn adopt_stream(
        &mut self,
        stream: TcpStream,
        outbound: bool,
        dial_target: Option<SocketAddr>,
    ) -> ConnId {
        if let Some(target) = dial_target {
            self.dialing.remove(&target);
        }
        let addr = stream
            .peer_addr()
            .ok()
            .map(|a| a.ip())
            .or_else(|| dial_target.map(|t| t.ip()))
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let conn = self.next_conn;
        self.next_conn += 1;

        let (mut read_half, mut write_half) = stream.into_split();
        let token = self.cancel.child_token();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Writer: drain the outbound queue until the socket or queue dies.
        {
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        frame = writer_rx.recv() => match frame {
                            Some(frame) => {
                                if write_half.write_all(&frame).await.is_err() {
                                    // The reader will surface the error.
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            });
        }

        // Reader: bytes → codec → packets → core loop.
        {
            let token = token.clone();
            let net_tx = self.net_tx.clone();
            tokio::spawn(async move {
                let mut codec = FrameCodec::new();
                let mut buf = [0u8; 4096];
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        read = read_half.read(&mut buf) => {
                            let reason = match read {
                                Ok(0) => "connection closed by peer".to_string(),
                                Ok(n) => match codec.feed(&buf[..n]) {
                                    Ok(packets) => {
                                        for packet in packets {
                                            if net_tx
                                                .send(NetEvent::Packet { conn, packet })
                                                .await
                                                .is_err()
                                            {
                                                return;
                                            }
                                        }
                                        continue;
                                    }
                                    Err(e) => e.to_string(),
                                },
                                Err(e) => e.to_string(),
                            };
                            let _ = net_tx.send(NetEvent::Closed { conn, reason }).await;
                            return;
                        }
                    }
                }
            });
        }

        self.peers.insert(
            conn,
            Peer {
                id: None,
                name: String::new(),
                addr,
                listen_port: 0,
                outbound,
                handshaken: false,
                dial_target,
                writer: writer_tx,
                cancel: token,
            },
        );
        conn
    }

    /// Whether a dial to `target` would currently be accepted.
    pub fn can_dial(&self, target: SocketAddr) -> bool {
        if self.dialing.contains(&target) || self.self_endpoints.contains(&target) {
            return false;
        }
        // Already connected to whoever listens there.
        !self
            .peers
            .values()
            .any(|p| p.handshaken && p.addr == target.ip() && p.listen_port == target.port())
    }

    /// Start an outbound dial. Refused dials return false silently; the
    /// result of an accepted dial arrives as [`NetEvent::DialDone`].
    pub fn begin_dial(&mut self, target: SocketAddr) -> bool {
        if !self.can_dial(target) {
            debug!("dial to {} refused", target);
            return false;
        }
        self.dialing.insert(target);
        let net_tx = self.net_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                r = TcpStream::connect(target) => r,
            };
            let _ = net_tx.send(NetEvent::DialDone { target, result }).await;
        });
        true
    }

    /// Forget an in-flight dial that failed.
    pub fn dial_failed(&mut self, target: SocketAddr) {
        self.dialing.remove(&target);
    }

    /// Close a connection and drop its record.
    pub fn close_conn(&mut self, conn: ConnId) -> Option<Peer> {
        let peer = self.peers.remove(&conn)?;
        peer.cancel.cancel();
        if let Some(id) = peer.id {
            if self.by_id.get(&id) == Some(&conn) {
                self.by_id.remove(&id);
            }
        }
        Some(peer)
    }

    /// Drop the record for a connection whose tasks already ended.
    pub fn remove_conn(&mut self, conn: ConnId) -> Option<Peer> {
        self.close_conn(conn)
    }

    /// Close the connection of an identified peer, if any.
    pub fn disconnect_id(&mut self, id: Uuid) {
        if let Some(&conn) = self.by_id.get(&id) {
            self.close_conn(conn);
        }
    }

    /// Close every connection and forget all dials.
    pub fn shutdown_conns(&mut self) {
        let conns: Vec<ConnId> = self.peers.keys().copied().collect();
        for conn in conns {
            self.close_conn(conn);
        }
        self.dialing.clear();
    }

    // ── Handshake ────────────────────────────────────────────────────────

    /// Process a HELLO on `conn`. Applies duplicate-connection
    /// resolution: when two nodes dial each other concurrently, each side
    /// keeps the socket dialed by the node with the smaller id. Returns
    /// `None` when the connection did not survive (or the HELLO was
    /// redundant); the surviving peer's details otherwise.
    pub fn handle_hello(
        &mut self,
        conn: ConnId,
        sender: Uuid,
        hello: &Hello,
        my_id: Uuid,
    ) -> Option<HelloOutcome> {
        if !self.peers.contains_key(&conn) {
            return None;
        }
        if sender == my_id {
            warn!("dropping connection to self");
            self.close_conn(conn);
            return None;
        }

        let mut replaced_existing = false;
        if let Some(&existing) = self.by_id.get(&sender) {
            if existing == conn {
                // Redundant HELLO on an identified connection.
                return None;
            }
            let keep_my_dial = my_id < sender;
            let new_outbound = self.peers[&conn].outbound;
            let old_outbound = self.peers[&existing].outbound;
            let new_wins = new_outbound == keep_my_dial && old_outbound != keep_my_dial;
            if new_wins {
                debug!(
                    "duplicate connection to {}: keeping the {} socket",
                    sender,
                    if new_outbound { "dialed" } else { "accepted" }
                );
                self.close_conn(existing);
                replaced_existing = true;
            } else {
                debug!("duplicate connection to {}: dropping the newcomer", sender);
                self.close_conn(conn);
                return None;
            }
        }

        let peer = self.peers.get_mut(&conn)?;
        peer.id = Some(sender);
        peer.name = hello.name.clone();
        peer.listen_port = hello.port;
        peer.handshaken = true;
        self.by_id.insert(sender, conn);

        info!(
            "handshake complete: {} ({}) at {}:{}",
            hello.name, sender, peer.addr, hello.port
        );

        Some(HelloOutcome {
            id: sender,
            name: hello.name.clone(),
            addr: peer.addr,
            listen_port: hello.port,
            is_room_creator: hello.is_room_creator,
            host_uuid: hello.host_uuid,
            replaced_existing,
        })
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// The identified sender behind a connection, once handshaken.
    pub fn sender_of(&self, conn: ConnId) -> Option<Uuid> {
        self.peers.get(&conn).filter(|p| p.handshaken).and_then(|p| p.id)
    }

    pub fn has_id(&self, id: Uuid) -> bool {
        self.by_id.contains_key(&id)
    }

    /// PEER_LIST payload for `recipient`: every other handshake-complete
    /// peer. The recipient itself and the sender are never listed; HELLO
    /// already introduced us.
    pub fn peer_list_excluding(&self, recipient: Uuid) -> Vec<PeerEntry> {
        self.peers
            .values()
            .filter(|p| p.handshaken)
            .filter_map(|p| {
                let id = p.id?;
                if id == recipient {
                    return None;
                }
                Some(PeerEntry {
                    id,
                    name: p.name.clone(),
                    ip: p.addr,
                    port: p.listen_port,
                })
            })
            .collect()
    }

    /// Addresses from a PEER_LIST that are actually worth dialing:
    /// unknown ids only, minus in-flight dials and our own endpoints.
    /// Feeding the same list twice therefore yields nothing the second
    /// time.
    pub fn peers_to_dial(&self, my_id: Uuid, entries: &[PeerEntry]) -> Vec<SocketAddr> {
        let mut seen = HashSet::new();
        entries
            .iter()
            .filter(|e| e.id != my_id && !self.by_id.contains_key(&e.id))
            .map(|e| SocketAddr::new(e.ip, e.port))
            .filter(|target| self.can_dial(*target) && seen.insert(*target))
            .collect()
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Queue one packet on one connection. Best-effort: a dead writer is
    /// cleaned up when its closure surfaces through the reader.
    pub fn send(&self, conn: ConnId, packet: &Packet) {
        if let Some(peer) = self.peers.get(&conn) {
            let _ = peer.writer.send(FrameCodec::encode(packet));
        }
    }

    pub fn send_to_id(&self, id: Uuid, packet: &Packet) {
        if let Some(&conn) = self.by_id.get(&id) {
            self.send(conn, packet);
        }
    }

    /// Queue a packet on every handshake-complete connection.
    pub fn broadcast(&self, packet: &Packet) {
        let frame = FrameCodec::encode(packet);
        for peer in self.peers.values().filter(|p| p.handshaken) {
            let _ = peer.writer.send(frame.clone());
        }
    }

    // ── Test support ─────────────────────────────────────────────────────

    /// Insert a connection without any socket behind it.
    #[cfg(test)]
    pub fn insert_stub(
        &mut self,
        outbound: bool,
        addr: IpAddr,
        dial_target: Option<SocketAddr>,
    ) -> (ConnId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let conn = self.next_conn;
        self.next_conn += 1;
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        self.peers.insert(
            conn,
            Peer {
                id: None,
                name: String::new(),
                addr,
                listen_port: 0,
                outbound,
                handshaken: false,
                dial_target,
                writer: writer_tx,
                cancel: self.cancel.child_token(),
            },
        );
        (conn, writer_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn mesh() -> (MeshManager, mpsc::Receiver<NetEvent>) {
        let (net_tx, net_rx) = mpsc::channel(64);
        (MeshManager::new(net_tx, CancellationToken::new()), net_rx)
    }

    fn hello(name: &str, port: u16) -> Hello {
        Hello {
            name: name.into(),
            port,
            is_room_creator: false,
            host_uuid: None,
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    const SMALL: Uuid = Uuid::from_u128(1);
    const LARGE: Uuid = Uuid::from_u128(u128::MAX);

    #[test]
    fn hello_identifies_a_pending_connection() {
        let (mut mesh, _rx) = mesh();
        let (conn, _w) = mesh.insert_stub(false, ip(7), None);

        let outcome = mesh
            .handle_hello(conn, LARGE, &hello("bob", 4444), SMALL)
            .expect("hello accepted");
        assert_eq!(outcome.id, LARGE);
        assert_eq!(outcome.listen_port, 4444);
        assert!(!outcome.replaced_existing);
        assert_eq!(mesh.sender_of(conn), Some(LARGE));
        assert!(mesh.has_id(LARGE));
    }

    #[test]
    fn smaller_id_keeps_its_dialed_socket() {
        // We are the smaller id: our outbound connection must survive,
        // regardless of which HELLO lands first.
        let (mut mesh, _rx) = mesh();
        let (inbound, _w1) = mesh.insert_stub(false, ip(7), None);
        let (outbound, _w2) = mesh.insert_stub(true, ip(7), Some(SocketAddr::new(ip(7), 4444)));

        assert!(mesh
            .handle_hello(inbound, LARGE, &hello("bob", 4444), SMALL)
            .is_some());
        let second = mesh
            .handle_hello(outbound, LARGE, &hello("bob", 4444), SMALL)
            .expect("outbound wins");
        assert!(second.replaced_existing);
        assert_eq!(mesh.sender_of(outbound), Some(LARGE));
        assert_eq!(mesh.sender_of(inbound), None);
    }

    #[test]
    fn larger_id_keeps_the_accepted_socket() {
        // We are the larger id: the remote (smaller) dialed us, so the
        // accepted connection survives and our own dial is dropped.
        let (mut mesh, _rx) = mesh();
        let (outbound, _w1) = mesh.insert_stub(true, ip(7), Some(SocketAddr::new(ip(7), 4444)));
        let (inbound, _w2) = mesh.insert_stub(false, ip(7), None);

        assert!(mesh
            .handle_hello(outbound, SMALL, &hello("alice", 4444), LARGE)
            .is_some());
        let second = mesh
            .handle_hello(inbound, SMALL, &hello("alice", 4444), LARGE)
            .expect("inbound wins");
        assert!(second.replaced_existing);
        assert_eq!(mesh.sender_of(inbound), Some(SMALL));
        assert_eq!(mesh.sender_of(outbound), None);
        // Exactly one connection remains for that id.
        assert!(mesh.has_id(SMALL));
    }

    #[test]
    fn redundant_hello_is_ignored() {
        let (mut mesh, _rx) = mesh();
        let (conn, _w) = mesh.insert_stub(false, ip(7), None);
        assert!(mesh
            .handle_hello(conn, LARGE, &hello("bob", 4444), SMALL)
            .is_some());
        assert!(mesh
            .handle_hello(conn, LARGE, &hello("bob", 4444), SMALL)
            .is_none());
    }

    #[test]
    fn hello_from_our_own_id_drops_the_connection() {
        let (mut mesh, _rx) = mesh();
        let (conn, _w) = mesh.insert_stub(false, ip(7), None);
        assert!(mesh
            .handle_hello(conn, SMALL, &hello("me", 4444), SMALL)
            .is_none());
        assert!(mesh.sender_of(conn).is_none());
    }

    #[test]
    fn peer_list_excludes_recipient_and_pending() {
        let (mut mesh, _rx) = mesh();
        let (a, _wa) = mesh.insert_stub(false, ip(1), None);
        let (b, _wb) = mesh.insert_stub(false, ip(2), None);
        let (_pending, _wc) = mesh.insert_stub(false, ip(3), None);

        let id_a = Uuid::from_u128(10);
        let id_b = Uuid::from_u128(11);
        let me = Uuid::from_u128(99);
        mesh.handle_hello(a, id_a, &hello("a", 1000), me).unwrap();
        mesh.handle_hello(b, id_b, &hello("b", 2000), me).unwrap();

        let list = mesh.peer_list_excluding(id_b);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id_a);
        assert_eq!(list[0].port, 1000);
    }

    #[test]
    fn peers_to_dial_skips_known_ids_self_and_duplicates() {
        let (mut mesh, _rx) = mesh();
        let me = Uuid::from_u128(99);
        let known = Uuid::from_u128(10);
        let fresh = Uuid::from_u128(11);

        let (conn, _w) = mesh.insert_stub(false, ip(1), None);
        mesh.handle_hello(conn, known, &hello("known", 1000), me)
            .unwrap();
        mesh.set_self_endpoints(5000, &[Ipv4Addr::new(192, 168, 1, 50)]);

        let entries = vec![
            PeerEntry {
                id: me,
                name: "me".into(),
                ip: ip(50),
                port: 5000,
            },
            PeerEntry {
                id: known,
                name: "known".into(),
                ip: ip(1),
                port: 1000,
            },
            PeerEntry {
                id: fresh,
                name: "fresh".into(),
                ip: ip(9),
                port: 9000,
            },
            // Same endpoint listed twice.
            PeerEntry {
                id: fresh,
                name: "fresh".into(),
                ip: ip(9),
                port: 9000,
            },
        ];
        let targets = mesh.peers_to_dial(me, &entries);
        assert_eq!(targets, vec![SocketAddr::new(ip(9), 9000)]);
    }

    #[tokio::test]
    async fn feeding_a_peer_list_twice_dials_nothing_new() {
        let (mut mesh, _rx) = mesh();
        let me = Uuid::from_u128(99);
        let entries = vec![PeerEntry {
            id: Uuid::from_u128(7),
            name: "n".into(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 1,
        }];

        let first = mesh.peers_to_dial(me, &entries);
        assert_eq!(first.len(), 1);
        assert!(mesh.begin_dial(first[0]));

        // The dial is now in flight; the same list produces no targets.
        assert!(mesh.peers_to_dial(me, &entries).is_empty());
    }
}
