//! Server tunables.
//!
//! All tunables live in one [`ServerConfig`] value. The engine reads it by
//! reference on every entry point and only swaps it between ticks, so a handler
//! never sees two different limits within one frame.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Upper bound on the reconnection cooldown base, in seconds
pub const MAX_RECONNECT_WAIT_SECS: u64 = 300;
/// Upper bound on the saved-position reload cooldown, in seconds
pub const MAX_LOAD_POSITION_WAIT_SECS: u64 = 3600;

pub const DEFAULT_RATE: u32 = 3000;
pub const DEFAULT_SNAPSHOT_MSEC: u32 = 50;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Identity advertised to browsers
    pub hostname: String,
    pub map: String,
    pub game: String,
    pub gametype: u32,
    pub mod_version: String,
    pub heartbeat_game: String,

    // Slots and passwords
    pub max_clients: usize,
    pub private_clients: usize,
    pub private_password: String,
    pub password: String,
    pub rcon_password: String,
    pub rcon_allowed_addr: Option<IpAddr>,

    // Timing
    pub sv_fps: u32,
    pub timeout_secs: u64,
    pub zombie_time_secs: u64,
    pub challenge_ttl_ms: u64,

    // Admission
    pub reconnect_limit_secs: u64,
    pub reconnect_wait_secs: u64,
    pub limit_connect_packets: bool,
    pub max_clients_per_ip: usize,
    pub min_ping: u32,
    pub max_ping: u32,
    pub require_valid_guid: bool,
    pub authorize_server: Option<SocketAddr>,
    pub strict_auth: bool,
    pub locator_server: Option<SocketAddr>,

    // Per-session behaviour
    pub min_rate: u32,
    pub max_rate: u32,
    pub lan_force_rate: bool,
    pub flood_protect: bool,
    pub sanitize_names: bool,
    pub radio_enabled: bool,
    pub vote_connect_wait_secs: u64,
    /// Seconds between two `callvote cyclemap` on the same map; 0 disables the limit
    pub cyclemap_vote_wait_secs: u64,
    /// Turns `team red` and `team blue` into `team free` for human players
    pub force_autojoin: bool,

    // Downloads and purity
    pub allow_download: bool,
    pub download_root: PathBuf,
    pub protected_assets: Vec<String>,
    pub pure: bool,

    pub voip: bool,

    // Discovery
    pub master_servers: Vec<String>,

    // Persistence and mini-features
    pub data_dir: Option<PathBuf>,
    pub allow_positions: bool,
    pub load_position_wait_secs: u64,
    pub allow_goto: bool,
    pub goto_wait_secs: u64,
    pub kill_rewards: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "noname".to_string(),
            map: "ut4_abbey".to_string(),
            game: "q3ut4".to_string(),
            gametype: 4,
            mod_version: "4.3.4".to_string(),
            heartbeat_game: "QuakeArena-1".to_string(),
            max_clients: 16,
            private_clients: 0,
            private_password: String::new(),
            password: String::new(),
            rcon_password: String::new(),
            rcon_allowed_addr: None,
            sv_fps: 20,
            timeout_secs: 200,
            zombie_time_secs: 2,
            challenge_ttl_ms: 120_000,
            reconnect_limit_secs: 3,
            reconnect_wait_secs: 0,
            limit_connect_packets: true,
            max_clients_per_ip: 3,
            min_ping: 0,
            max_ping: 0,
            require_valid_guid: false,
            authorize_server: None,
            strict_auth: false,
            locator_server: None,
            min_rate: 1000,
            max_rate: 90000,
            lan_force_rate: true,
            flood_protect: true,
            sanitize_names: true,
            radio_enabled: true,
            vote_connect_wait_secs: 0,
            cyclemap_vote_wait_secs: 0,
            force_autojoin: false,
            allow_download: false,
            download_root: PathBuf::from("."),
            protected_assets: vec!["zpak000".to_string(), "zpak000_assets".to_string()],
            pure: false,
            voip: false,
            master_servers: Vec::new(),
            data_dir: None,
            allow_positions: false,
            load_position_wait_secs: 0,
            allow_goto: false,
            goto_wait_secs: 0,
            kill_rewards: false,
        }
    }
}

impl ServerConfig {
    /// Applies the hard limits every tunable must respect
    pub fn normalized(mut self) -> Self {
        self.max_clients = self.max_clients.clamp(1, 64);
        self.private_clients = self.private_clients.min(self.max_clients);
        self.sv_fps = self.sv_fps.clamp(1, 1000);
        self.reconnect_wait_secs = self.reconnect_wait_secs.min(MAX_RECONNECT_WAIT_SECS);
        self.load_position_wait_secs = self
            .load_position_wait_secs
            .min(MAX_LOAD_POSITION_WAIT_SECS);
        self.min_rate = self.min_rate.max(1);
        if self.max_rate < self.min_rate {
            self.max_rate = self.min_rate;
        }
        if self.max_ping != 0 && self.max_ping < self.min_ping {
            self.max_ping = self.min_ping;
        }
        self
    }

    /// Duration of one simulation tick in milliseconds
    pub fn frame_msec(&self) -> u64 {
        (1000 / self.sv_fps.max(1) as u64).max(1)
    }

    /// Slots available without the private password
    pub fn public_slots(&self) -> usize {
        self.max_clients - self.private_clients
    }

    pub fn needs_password(&self) -> bool {
        !self.password.is_empty()
    }
}
