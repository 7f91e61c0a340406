use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::engine::Engine;
use server::game::ArenaGame;
use server::network::Server;
use server::world::{PakRef, PureManifest};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Authoritative arena shooter server
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// UDP port to listen on
    #[clap(short, long, default_value = "27960")]
    port: u16,
    /// Session slots, private ones included
    #[clap(short = 'c', long, default_value = "16")]
    max_clients: usize,
    /// Slots reserved for holders of the private password
    #[clap(long, default_value = "0")]
    private_clients: usize,
    #[clap(long, default_value = "")]
    private_password: String,
    /// Simulation ticks per second
    #[clap(short, long, default_value = "20")]
    tick_rate: u32,
    #[clap(long, default_value = "noname")]
    hostname: String,
    #[clap(short, long, default_value = "ut4_abbey")]
    map: String,
    #[clap(long, default_value = "4")]
    gametype: u32,
    /// Password every connecting player must supply
    #[clap(long, default_value = "")]
    password: String,
    /// Remote console password; rcon is disabled while empty
    #[clap(long, default_value = "")]
    rcon_password: String,
    /// Address allowed to use rcon without throttling
    #[clap(long)]
    rcon_allowed: Option<IpAddr>,
    /// Seconds of silence before a session is dropped
    #[clap(long, default_value = "200")]
    timeout: u64,
    /// Base cooldown in seconds before a dropped player may reconnect
    #[clap(long, default_value = "0")]
    reconnect_wait: u64,
    #[clap(long, default_value = "3")]
    max_clients_per_ip: usize,
    #[clap(long, default_value = "0")]
    min_ping: u32,
    #[clap(long, default_value = "0")]
    max_ping: u32,
    #[clap(long, default_value = "1000")]
    min_rate: u32,
    #[clap(long, default_value = "90000")]
    max_rate: u32,
    /// Refuse clients whose cl_guid is malformed
    #[clap(long)]
    require_guid: bool,
    /// Serve game files from the download root
    #[clap(long)]
    allow_download: bool,
    #[clap(long, default_value = ".")]
    download_root: PathBuf,
    /// Referenced paks as name:checksum; enables pure checking when given
    #[clap(long = "pak")]
    paks: Vec<PakRef>,
    #[clap(long, default_value = "0")]
    cgame_checksum: i32,
    #[clap(long, default_value = "0")]
    ui_checksum: i32,
    /// Relay voice chat between players
    #[clap(long)]
    voip: bool,
    /// Master server to announce to; may be repeated
    #[clap(long = "master")]
    masters: Vec<String>,
    /// CD key authorization service
    #[clap(long)]
    authorize_server: Option<SocketAddr>,
    /// Geo-location service
    #[clap(long)]
    locator_server: Option<SocketAddr>,
    /// Directory for the ban list and saved positions
    #[clap(long)]
    data_dir: Option<PathBuf>,
    /// Enable saving and loading player positions
    #[clap(long)]
    allow_positions: bool,
    #[clap(long)]
    allow_goto: bool,
    /// Announce kill streaks
    #[clap(long)]
    kill_rewards: bool,
    /// Seconds a new player waits before calling a vote
    #[clap(long, default_value = "0")]
    vote_connect_wait: u64,
    /// Seconds between two cyclemap votes on the same map
    #[clap(long, default_value = "0")]
    cyclemap_vote_wait: u64,
    /// Send players choosing red or blue to autojoin instead
    #[clap(long)]
    force_autojoin: bool,
}

impl Args {
    fn manifest(&self) -> PureManifest {
        PureManifest {
            cgame_checksum: self.cgame_checksum,
            ui_checksum: self.ui_checksum,
            paks: self.paks.clone(),
        }
    }

    fn into_config(self) -> ServerConfig {
        ServerConfig {
            hostname: self.hostname,
            map: self.map,
            gametype: self.gametype,
            max_clients: self.max_clients,
            private_clients: self.private_clients,
            private_password: self.private_password,
            password: self.password,
            rcon_password: self.rcon_password,
            rcon_allowed_addr: self.rcon_allowed,
            sv_fps: self.tick_rate,
            timeout_secs: self.timeout,
            reconnect_wait_secs: self.reconnect_wait,
            max_clients_per_ip: self.max_clients_per_ip,
            min_ping: self.min_ping,
            max_ping: self.max_ping,
            require_valid_guid: self.require_guid,
            authorize_server: self.authorize_server,
            locator_server: self.locator_server,
            min_rate: self.min_rate,
            max_rate: self.max_rate,
            allow_download: self.allow_download,
            download_root: self.download_root,
            pure: !self.paks.is_empty(),
            voip: self.voip,
            master_servers: self.masters,
            data_dir: self.data_dir,
            allow_positions: self.allow_positions,
            allow_goto: self.allow_goto,
            kill_rewards: self.kill_rewards,
            vote_connect_wait_secs: self.vote_connect_wait,
            cyclemap_vote_wait_secs: self.cyclemap_vote_wait,
            force_autojoin: self.force_autojoin,
            ..Default::default()
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);
    let manifest = args.manifest();
    let config = args.into_config();
    info!(
        "Starting {} on {} ({} slots, {} Hz)",
        config.hostname, config.map, config.max_clients, config.sv_fps
    );

    let game = ArenaGame::new(config.max_clients.clamp(1, 64));
    let engine = Engine::new(config, game, manifest);
    let mut server = Server::bind(&address, engine).await?;
    server.run().await?;
    Ok(())
}
