//! CLI / configuration surface, grounded on the teacher's
//! `clap::Parser`-derived config struct (`main.rs`'s
//! `ServerConfig::parse()`).

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

/// A replication server that receives drone plot reports from a local
/// antenna and replicates them to other peers.
#[derive(Debug, Parser)]
#[command(name = "repsvr")]
pub struct Config {
    /// Path to the antenna's inject database (binary plot file).
    pub sim_data: PathBuf,

    /// IP address to bind the server to.
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    pub ip: Ipv4Addr,

    /// Port to bind the server to.
    #[arg(short = 'p', long, default_value_t = 9999)]
    pub port: u16,

    /// Time multiplier: 2.0 runs the simulation twice as fast.
    #[arg(short = 't', long, default_value_t = 1.0)]
    pub time_mult: f32,

    /// File to write the final plot database dump to, in CSV format.
    #[arg(short = 'o', long, default_value = "replication_db.csv")]
    pub outfile: PathBuf,

    /// Duration of the simulation, in sim-time seconds.
    #[arg(short = 'd', long, default_value_t = 900)]
    pub duration: u64,

    /// Verbosity: 0 (quiet) to 3 (max).
    #[arg(short = 'v', long, default_value_t = 0)]
    pub verbosity: u8,

    /// Peer list file.
    #[arg(long, default_value = "servers.txt")]
    pub servers_file: PathBuf,

    /// Pre-shared AES-128 key file.
    #[arg(long, default_value = "sharedkey.bin")]
    pub key_file: PathBuf,

    /// Whitelist of IPs allowed to connect.
    #[arg(long, default_value = "whitelist")]
    pub whitelist_file: PathBuf,

    /// Total number of nodes in the fleet, used to validate that node ids
    /// are contiguous from 1.
    #[arg(long, default_value_t = 3)]
    pub node_count: usize,

    /// The elected reference node; all clocks are aligned to this node's.
    #[arg(long, default_value_t = 1)]
    pub reference_node: u32,
}

impl Config {
    /// Maps the `-v` verbosity flag onto a `tracing` filter directive for
    /// this crate's own target; the per-peer log file (§6) is a separate,
    /// always-on sink independent of this level.
    pub fn log_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "repsvr=warn",
            1 => "repsvr=info",
            2 => "repsvr=debug",
            _ => "repsvr=trace",
        }
    }
}
