//! Connection — one TCP connection's state machine.
//!
//! Ticks are bounded by a short timeout on every I/O step so a single
//! stalled peer cannot starve the Queue Manager's single-threaded,
//! cooperative loop over all live connections (spec §4.4/§5). This is the
//! idiomatic-async equivalent of the source's non-blocking socket model:
//! no connection gets its own OS thread or long-lived task, each `tick`
//! call is one bounded quantum of work over `try`-free async I/O with a
//! timeout, driven entirely from the Queue Manager's loop.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::crypto::{self, KEY_LEN};
use crate::error::{Error, Result};
use crate::log::PeerLog;

/// Per-I/O-step budget. Generous enough for a LAN round trip, short
/// enough that one unhealthy peer doesn't stall the others for long.
const TICK_IO_TIMEOUT: Duration = Duration::from_millis(200);
/// How long after a failed outbound connect before retrying (spec §4.4).
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Guards against an adversarial or corrupt peer claiming a huge frame.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Authenticating,
    HasData,
    Writing,
    Closed,
}

pub struct Connection {
    pub direction: Direction,
    pub state: State,
    pub remote_peer_id: Option<String>,
    stream: Option<TcpStream>,
    target: Option<SocketAddrV4>,
    outbound_payload: Option<Vec<u8>>,
    inbound_payload: Option<Vec<u8>>,
    ready: bool,
    pub reconnect_at: Option<Instant>,
    auth_local_sent: bool,
    auth_peer_verified: bool,
    outbound_sent: bool,
}

impl Connection {
    /// Creates an outbound connection to `target`, known from the peer
    /// registry. Starts in `Connecting`.
    pub fn outbound(target: SocketAddrV4, remote_peer_id: String) -> Self {
        Self {
            direction: Direction::Outbound,
            state: State::Connecting,
            remote_peer_id: Some(remote_peer_id),
            stream: None,
            target: Some(target),
            outbound_payload: None,
            inbound_payload: None,
            ready: false,
            reconnect_at: None,
            auth_local_sent: false,
            auth_peer_verified: false,
            outbound_sent: false,
        }
    }

    /// Wraps an already-accepted inbound socket. Starts in
    /// `Authenticating` — the remote peer_id is learned during auth.
    pub fn inbound(stream: TcpStream) -> Self {
        Self {
            direction: Direction::Inbound,
            state: State::Authenticating,
            remote_peer_id: None,
            stream: Some(stream),
            target: None,
            outbound_payload: None,
            inbound_payload: None,
            ready: false,
            reconnect_at: None,
            auth_local_sent: false,
            auth_peer_verified: false,
            outbound_sent: false,
        }
    }

    pub fn assign_outgoing(&mut self, payload: Vec<u8>) {
        self.outbound_payload = Some(payload);
    }

    pub fn status(&self) -> State {
        self.state
    }

    pub fn input_ready(&self) -> bool {
        self.ready
    }

    /// Takes the completed inbound payload and closes the connection.
    /// Returns `None` if no payload is ready yet.
    pub fn get_input(&mut self) -> Option<(String, Vec<u8>)> {
        if !self.ready {
            return None;
        }
        let peer_id = self.remote_peer_id.clone().unwrap_or_default();
        let payload = self.inbound_payload.take()?;
        self.ready = false;
        self.state = State::Closed;
        Some((peer_id, payload))
    }

    /// Advances the state machine by one bounded quantum of work.
    pub async fn tick(&mut self, local_id: &str, key: &[u8; KEY_LEN], log: &PeerLog) {
        match self.state {
            State::Connecting => self.tick_connecting().await,
            State::Authenticating => self.tick_authenticating(local_id, key, log).await,
            State::HasData => self.tick_receiving(key, log).await,
            State::Writing => self.tick_writing(key, log).await,
            State::Closed => {}
        }
    }

    async fn tick_connecting(&mut self) {
        if let Some(at) = self.reconnect_at {
            if Instant::now() < at {
                return;
            }
        }
        let target = self.target.expect("outbound connection always has a target");
        match timeout(TICK_IO_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                self.state = State::Authenticating;
                self.reconnect_at = None;
            }
            _ => {
                // Connection refused, unreachable, or timed out — all
                // recoverable-network per spec §4.4/§7.
                self.reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
            }
        }
    }

    /// Authentication proceeds as two independently-resumable steps (send
    /// local proof, verify peer's proof) so a peer that hasn't been
    /// ticked yet doesn't block this connection's tick indefinitely — the
    /// order (outbound sends before it reads; inbound reads before it
    /// sends) is what keeps both sides from waiting to read first.
    async fn tick_authenticating(&mut self, local_id: &str, key: &[u8; KEY_LEN], log: &PeerLog) {
        let stream = self.stream.as_mut().expect("authenticating connection has a stream");

        if self.direction == Direction::Outbound && !self.auth_local_sent {
            if !send_local_proof(stream, local_id, key, log, &mut self.auth_local_sent).await {
                self.state = State::Closed;
            }
            return;
        }

        if !self.auth_peer_verified {
            match timeout(TICK_IO_TIMEOUT, read_frame(stream, key)).await {
                Ok(Ok(msg)) => match decode_auth(&msg).and_then(|(peer_id, mac)| {
                    verify_auth(key, &peer_id, &mac).map(|()| peer_id)
                }) {
                    Ok(peer_id) => {
                        if self.direction == Direction::Inbound {
                            self.remote_peer_id = Some(peer_id);
                        }
                        self.auth_peer_verified = true;
                    }
                    Err(e) => {
                        log.write_line(&format!("authentication failed: {e}"));
                        self.state = State::Closed;
                        return;
                    }
                },
                Ok(Err(e)) => {
                    log.write_line(&format!("authentication failed: {e}"));
                    self.state = State::Closed;
                    return;
                }
                Err(_) => return, // peer hasn't sent its proof yet; retry next tick
            }
        }

        if self.direction == Direction::Inbound
            && !self.auth_local_sent
            && !send_local_proof(stream, local_id, key, log, &mut self.auth_local_sent).await
        {
            self.state = State::Closed;
            return;
        }

        if self.auth_local_sent && self.auth_peer_verified {
            self.state = match self.direction {
                Direction::Inbound => State::HasData,
                Direction::Outbound => State::Writing,
            };
        }
    }

    async fn tick_receiving(&mut self, key: &[u8; KEY_LEN], log: &PeerLog) {
        if self.ready {
            return;
        }
        let stream = self.stream.as_mut().expect("hasdata connection has a stream");
        match timeout(TICK_IO_TIMEOUT, read_frame(stream, key)).await {
            Ok(Ok(payload)) => {
                self.inbound_payload = Some(payload);
                self.ready = true;
                let _ = timeout(TICK_IO_TIMEOUT, write_frame(stream, key, b"ACK")).await;
            }
            Ok(Err(e)) => {
                log.write_line(&format!("connection dropped before delivering payload: {e}"));
                self.state = State::Closed;
            }
            Err(_) => {} // payload not in yet; retry next tick
        }
    }

    /// Sends the assigned payload once, then waits (resumable across
    /// ticks) for the peer's length ack before the connection is closable.
    async fn tick_writing(&mut self, key: &[u8; KEY_LEN], log: &PeerLog) {
        let stream = self.stream.as_mut().expect("writing connection has a stream");

        if !self.outbound_sent {
            let payload = self
                .outbound_payload
                .as_ref()
                .expect("writing connection always has an assigned payload")
                .clone();
            match timeout(TICK_IO_TIMEOUT, write_frame(stream, key, &payload)).await {
                Ok(Ok(())) => self.outbound_sent = true,
                _ => {
                    log.write_line("connection dropped while sending payload");
                    self.state = State::Closed;
                    return;
                }
            }
        }

        let mut ack = [0u8; 3];
        match timeout(TICK_IO_TIMEOUT, stream.read_exact(&mut ack)).await {
            Ok(Ok(_)) => self.state = State::Closed,
            Ok(Err(e)) => {
                log.write_line(&format!("connection dropped before ack: {e}"));
                self.state = State::Closed;
            }
            Err(_) => {} // ack not in yet; retry next tick
        }
    }
}

/// Writes this node's peer-id + shared-key proof, bounded by one tick's
/// I/O budget. Returns `false` (and logs) on a real I/O failure; a bare
/// timeout leaves `*sent` false so the caller retries next tick.
async fn send_local_proof(
    stream: &mut TcpStream,
    local_id: &str,
    key: &[u8; KEY_LEN],
    log: &PeerLog,
    sent: &mut bool,
) -> bool {
    let proof = crypto::challenge_response(key, local_id);
    match timeout(TICK_IO_TIMEOUT, write_frame(stream, key, &encode_auth(local_id, &proof))).await {
        Ok(Ok(())) => {
            *sent = true;
            true
        }
        Ok(Err(e)) => {
            log.write_line(&format!("authentication failed: {e}"));
            false
        }
        Err(_) => true, // timed out, not yet sent; retry next tick without closing
    }
}

fn verify_auth(key: &[u8; KEY_LEN], peer_id: &str, mac: &[u8]) -> Result<()> {
    let expected = crypto::challenge_response(key, peer_id);
    if expected == mac {
        Ok(())
    } else {
        Err(Error::Framing("shared-key proof did not match claimed peer id".into()))
    }
}

fn encode_auth(peer_id: &str, mac: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + peer_id.len() + mac.len());
    buf.extend_from_slice(&(peer_id.len() as u16).to_le_bytes());
    buf.extend_from_slice(peer_id.as_bytes());
    buf.extend_from_slice(mac);
    buf
}

fn decode_auth(buf: &[u8]) -> Result<(String, Vec<u8>)> {
    if buf.len() < 2 {
        return Err(Error::Framing("auth message too short".into()));
    }
    let id_len = u16::from_le_bytes(buf[0..2].try_into().unwrap()) as usize;
    if buf.len() < 2 + id_len {
        return Err(Error::Framing("auth message truncated".into()));
    }
    let peer_id = String::from_utf8(buf[2..2 + id_len].to_vec())
        .map_err(|_| Error::Framing("auth peer id was not valid UTF-8".into()))?;
    let mac = buf[2 + id_len..].to_vec();
    Ok((peer_id, mac))
}

async fn write_frame(stream: &mut TcpStream, key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<()> {
    let encrypted = crypto::encrypt(key, plaintext);
    let len = encrypted.len() as u32;
    stream.write_all(&len.to_le_bytes()).await.map_err(Error::Network)?;
    stream.write_all(&encrypted).await.map_err(Error::Network)?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream, key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(Error::Network)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Framing(format!("frame length {len} exceeds max {MAX_FRAME_LEN}")));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(Error::Network)?;
    crypto::decrypt(key, &buf)
}
