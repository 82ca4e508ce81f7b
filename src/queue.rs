//! Queue Manager — owns the listening socket, drives every live
//! `Connection`, and exposes the FIFO that carries both outbound `send`
//! requests and completed inbound `recv` payloads (spec §4.5).
//!
//! Grounded on the teacher's `S2sManager` in `s2s.rs`: a single owner of
//! all peer connections, a FIFO-ordered dispatch path, and whitelist-gated
//! accept — adapted from QUIC streams to the length-framed TCP connection
//! state machine in [`crate::connection`].

use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};

use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

use crate::connection::{Connection, State};
use crate::crypto::KEY_LEN;
use crate::log::PeerLog;
use crate::registry::PeerRegistry;

enum QueueEntry {
    Send { peer_id: String, payload: Vec<u8> },
    Recv { peer_id: String, payload: Vec<u8> },
}

pub struct QueueManager {
    listener: TcpListener,
    whitelist: HashSet<Ipv4Addr>,
    connections: Vec<Connection>,
    fifo: VecDeque<QueueEntry>,
    local_id: String,
    key: [u8; KEY_LEN],
}

impl QueueManager {
    pub async fn bind(
        bind_ip: Ipv4Addr,
        bind_port: u16,
        whitelist: HashSet<Ipv4Addr>,
        local_id: String,
        key: [u8; KEY_LEN],
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((bind_ip, bind_port)).await?;
        Ok(Self {
            listener,
            whitelist,
            connections: Vec::new(),
            fifo: VecDeque::new(),
            local_id,
            key,
        })
    }

    pub fn send_to_peer(&mut self, peer_id: &str, payload: Vec<u8>) {
        self.fifo.push_back(QueueEntry::Send {
            peer_id: peer_id.to_string(),
            payload,
        });
    }

    pub fn send_to_all(&mut self, peers: &PeerRegistry, payload: Vec<u8>) {
        for peer in peers.peers() {
            self.fifo.push_back(QueueEntry::Send {
                peer_id: peer.peer_id.clone(),
                payload: payload.clone(),
            });
        }
    }

    /// One tick: accept, advance every connection, harvest completed
    /// inbound payloads into the FIFO.
    pub async fn handle_queue(&mut self, log: &PeerLog) {
        self.accept_one(log).await;

        for conn in &mut self.connections {
            conn.tick(&self.local_id, &self.key, log).await;
        }

        for conn in &mut self.connections {
            if conn.status() == State::HasData && conn.input_ready() {
                if let Some((peer_id, payload)) = conn.get_input() {
                    self.fifo.push_back(QueueEntry::Recv { peer_id, payload });
                }
            }
        }

        self.connections.retain(|c| c.status() != State::Closed);
    }

    async fn accept_one(&mut self, log: &PeerLog) {
        let accepted = timeout(Duration::from_millis(0), self.listener.accept()).await;
        let Ok(Ok((stream, addr))) = accepted else {
            return;
        };
        let ip = match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => {
                log.write_line(&format!("rejected non-IPv4 peer {addr}"));
                return;
            }
        };
        if !self.whitelist.contains(&ip) {
            log.write_line(&format!("rejected connection from non-whitelisted IP {ip}"));
            return;
        }
        self.connections.push(Connection::inbound(stream));
    }

    /// Drains the FIFO head. `send` entries launch an outbound connection
    /// and are not returned; the first `recv` entry is returned.
    pub fn pop(&mut self, peers: &PeerRegistry, log: &PeerLog) -> Option<(String, Vec<u8>)> {
        while let Some(entry) = self.fifo.pop_front() {
            match entry {
                QueueEntry::Send { peer_id, payload } => {
                    self.launch_data_conn(peers, &peer_id, payload, log);
                }
                QueueEntry::Recv { peer_id, payload } => {
                    return Some((peer_id, payload));
                }
            }
        }
        None
    }

    fn launch_data_conn(&mut self, peers: &PeerRegistry, peer_id: &str, payload: Vec<u8>, log: &PeerLog) {
        let Some(entry) = peers.find(peer_id) else {
            // spec §8 scenario 6: unknown peer on send must not be
            // silently dropped.
            log.write_line(&format!("dropped outbound payload for unknown peer '{peer_id}'"));
            return;
        };
        let mut conn = Connection::outbound(SocketAddrV4::new(entry.ip, entry.port), peer_id.to_string());
        conn.assign_outgoing(payload);
        self.connections.push(conn);
    }
}

/// Looking up an unknown peer at send time is a dispatch-time error
/// (spec §8 scenario 6); library consumers that want this surfaced as an
/// `Err` should check `peers.find(peer_id)` before calling
/// [`QueueManager::send_to_peer`]. The `repsvr` binary does so in
/// `main.rs`.
pub fn peer_known(peers: &PeerRegistry, peer_id: &str) -> bool {
    peers.find(peer_id).is_some()
}
