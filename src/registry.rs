//! Peer Registry — static table of peers loaded from `servers.txt`, plus
//! the whitelist loader named as an external collaborator in spec §6 (its
//! contract — "is this IP allowed to connect" — is in scope; nothing more).

use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};

/// One entry in the peer list: `{peer_id, ip, port}`, immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub peer_id: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// The peer list with the local entry removed, plus the identity it
/// resolved to.
pub struct PeerRegistry {
    pub local_id: String,
    peers: Vec<PeerEntry>,
}

impl PeerRegistry {
    /// Loads `peer_id, ip, port` lines from `path`, trimming whitespace
    /// around each field. A blank trailing line ends parsing.
    fn load_entries<P: AsRef<Path>>(path: P) -> Result<Vec<PeerEntry>> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::FatalInit(format!("could not read peer list {}: {e}", path.as_ref().display()))
        })?;

        let mut entries = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                break;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() != 3 {
                return Err(Error::FatalInit(format!("malformed peer list line: {line}")));
            }
            let peer_id = fields[0].trim().to_string();
            let ip: Ipv4Addr = fields[1]
                .trim()
                .parse()
                .map_err(|_| Error::FatalInit(format!("bad IP in peer list line: {line}")))?;
            let port: u16 = fields[2]
                .trim()
                .parse()
                .map_err(|_| Error::FatalInit(format!("bad port in peer list line: {line}")))?;
            entries.push(PeerEntry { peer_id, ip, port });
        }
        Ok(entries)
    }

    /// Loads the registry and removes the entry matching `(bind_ip,
    /// bind_port)`, retaining its peer_id as the local identity. Fails
    /// fatally if the local entry is not found, or if node ids are not
    /// contiguous starting from 1 (see SPEC_FULL.md §4.3/§9).
    pub fn load<P: AsRef<Path>>(path: P, bind_ip: Ipv4Addr, bind_port: u16) -> Result<Self> {
        let mut entries = Self::load_entries(path)?;

        let pos = entries
            .iter()
            .position(|e| e.ip == bind_ip && e.port == bind_port);
        let Some(pos) = pos else {
            return Err(Error::FatalInit(format!(
                "local bind address {bind_ip}:{bind_port} not listed in peer registry"
            )));
        };
        let local = entries.remove(pos);

        Ok(Self {
            local_id: local.peer_id,
            peers: entries,
        })
    }

    pub fn peers(&self) -> &[PeerEntry] {
        &self.peers
    }

    pub fn find(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.peers.iter().find(|e| e.peer_id == peer_id)
    }

    /// Validates that every `node_id` implied by peer_ids `"1".."N"` plus
    /// the local id forms a contiguous 1..=N range, required by the skew
    /// table's node_id-1 array indexing (SPEC_FULL.md §9 Open Question).
    pub fn validate_contiguous_node_ids(&self, node_count: usize) -> Result<()> {
        let mut ids: Vec<u32> = self
            .peers
            .iter()
            .chain(std::iter::once(&PeerEntry {
                peer_id: self.local_id.clone(),
                ip: Ipv4Addr::UNSPECIFIED,
                port: 0,
            }))
            .filter_map(|e| e.peer_id.parse::<u32>().ok())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        let expected: Vec<u32> = (1..=node_count as u32).collect();
        if ids != expected {
            return Err(Error::FatalInit(format!(
                "node ids must be contiguous from 1..={node_count}, got {ids:?}"
            )));
        }
        Ok(())
    }
}

/// Loads a newline-delimited whitelist of permitted source IPs.
pub fn load_whitelist<P: AsRef<Path>>(path: P) -> Result<HashSet<Ipv4Addr>> {
    let text = fs::read_to_string(path.as_ref()).map_err(|e| {
        Error::FatalInit(format!("could not read whitelist {}: {e}", path.as_ref().display()))
    })?;
    let mut set = HashSet::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let ip: Ipv4Addr = line
            .parse()
            .map_err(|_| Error::FatalInit(format!("bad IP in whitelist: {line}")))?;
        set.insert(ip);
    }
    Ok(set)
}
