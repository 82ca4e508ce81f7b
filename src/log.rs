//! Per-peer append-only log writer (`<peer_id>server.log`), named as an
//! external collaborator in spec §6. Kept deliberately simple: one line of
//! text per significant event, independent of the `tracing` verbosity
//! level.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

pub struct PeerLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl PeerLog {
    /// Opens `<dir>/<peer_id>server.log` for append, creating it if needed.
    pub fn open_in<P: AsRef<Path>>(dir: P, peer_id: &str) -> std::io::Result<Self> {
        let path = dir.as_ref().join(format!("{peer_id}server.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Opens `<peer_id>server.log` in the current working directory.
    pub fn open(peer_id: &str) -> std::io::Result<Self> {
        Self::open_in(".", peer_id)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn write_line(&self, line: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "{line}");
    }
}
