//! The server core without a socket.
//!
//! [`Engine`] owns every piece of session, admission and world state. The
//! network layer feeds it datagrams through [`Engine::packet_event`], drives
//! the clock with [`Engine::frame`] and flushes whatever the engine queued with
//! [`Engine::take_outgoing`]. Keeping the socket outside makes every protocol
//! path testable with plain function calls.

use crate::admission::AdmissionGate;
use crate::bans::BanList;
use crate::client_manager::{ClientManager, ClientState};
use crate::config::ServerConfig;
use crate::game::GameModule;
use crate::positions::PositionStore;
use crate::world::{PureManifest, WorldState};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{netchan, oob};
use std::net::SocketAddr;

pub const BANS_FILE: &str = "bans.dat";
pub const POSITIONS_FILE: &str = "positions.dat";

/// Config strings at or above this length are sent in `bcs` chunks
const MAX_CONFIGSTRING_CHUNK: usize = 1000;
/// Bytes per chunk; always yields at least a `bcs0` and a `bcs2`
const CONFIGSTRING_CHUNK_BYTES: usize = MAX_CONFIGSTRING_CHUNK - 1;

/// A datagram waiting for the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

pub struct Engine<G: GameModule> {
    pub(crate) config: ServerConfig,
    pending_config: Option<ServerConfig>,
    pub(crate) clients: ClientManager,
    pub(crate) world: WorldState,
    pub(crate) game: G,
    pub(crate) gate: AdmissionGate,
    pub(crate) bans: BanList,
    pub(crate) positions: PositionStore,
    pub(crate) rng: StdRng,
    /// Server clock in milliseconds, advanced one tick at a time
    pub(crate) time: u64,
    pub(crate) residual: u64,
    outbox: Vec<Outgoing>,
    pub(crate) masters: Vec<SocketAddr>,
    pub(crate) next_heartbeat: u64,
    pub(crate) last_rcon_time: Option<u64>,
    pub(crate) shutdown_requested: bool,
    pub(crate) stopped: bool,
}

impl<G: GameModule> Engine<G> {
    pub fn new(config: ServerConfig, game: G, manifest: PureManifest) -> Self {
        Self::with_rng(config, game, manifest, StdRng::from_entropy())
    }

    /// Deterministic tokens and ids, for tests and replays
    pub fn with_seed(config: ServerConfig, game: G, manifest: PureManifest, seed: u64) -> Self {
        Self::with_rng(config, game, manifest, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ServerConfig, game: G, manifest: PureManifest, rng: StdRng) -> Self {
        let config = config.normalized();
        let (bans, positions) = match &config.data_dir {
            Some(dir) => (
                BanList::load(dir.join(BANS_FILE)),
                PositionStore::load(dir.join(POSITIONS_FILE)),
            ),
            None => (BanList::new(), PositionStore::new()),
        };

        let mut engine = Self {
            clients: ClientManager::new(config.max_clients, config.private_clients),
            config,
            pending_config: None,
            world: WorldState::new(manifest),
            game,
            gate: AdmissionGate::new(),
            bans,
            positions,
            rng,
            time: 0,
            residual: 0,
            outbox: Vec::new(),
            masters: Vec::new(),
            next_heartbeat: 0,
            last_rcon_time: None,
            shutdown_requested: false,
            stopped: false,
        };
        let map = engine.config.map.clone();
        engine.spawn_map(&map, false);
        engine
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    pub fn bans(&self) -> &BanList {
        &self.bans
    }

    /// Server clock in milliseconds
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Set once the engine has said goodbye to every session
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Ends the run at the start of the next frame
    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    /// Stages a new configuration, installed at the start of the next frame.
    ///
    /// Slot counts are fixed for the life of the engine.
    pub fn apply_config(&mut self, config: ServerConfig) {
        let mut config = config.normalized();
        config.max_clients = self.config.max_clients;
        config.private_clients = config.private_clients.min(config.max_clients);
        self.pending_config = Some(config);
    }

    pub(crate) fn install_pending_config(&mut self) {
        if let Some(config) = self.pending_config.take() {
            info!("Installing new server configuration");
            self.config = config;
            self.refresh_info_strings();
        }
    }

    /// Discovery endpoints resolved by the caller
    pub fn set_master_servers(&mut self, masters: Vec<SocketAddr>) {
        self.masters = masters;
    }

    /// Datagrams queued since the last call
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn send_raw(&mut self, to: SocketAddr, data: Vec<u8>) {
        self.outbox.push(Outgoing { to, data });
    }

    pub(crate) fn send_oob(&mut self, to: SocketAddr, text: &str) {
        self.send_raw(to, oob::encode(text));
    }

    pub(crate) fn send_oob_print(&mut self, to: SocketAddr, text: &str) {
        self.send_raw(to, oob::print(text));
    }

    /// Sends `payload` over the slot's channel, fragmenting as needed
    pub(crate) fn transmit(&mut self, slot: usize, payload: &[u8]) {
        let Some(chan) = self.clients.get_mut(slot).and_then(|c| c.netchan.as_mut()) else {
            return;
        };
        let to = chan.remote();
        match chan.transmit(payload) {
            Ok(datagrams) => self
                .outbox
                .extend(datagrams.into_iter().map(|data| Outgoing { to, data })),
            Err(e) => warn!("Could not transmit to slot {}: {}", slot, e),
        }
    }

    /// Queues a reliable command for one session; overflowing its ring drops it
    pub fn send_server_command(&mut self, slot: usize, command: &str) {
        let overflow = match self.clients.get_mut(slot) {
            Some(client) => client.queue_reliable(command).is_err(),
            None => false,
        };
        if overflow {
            warn!("Reliable command overflow for slot {}", slot);
            self.drop_client(slot, "Server command overflow");
        }
    }

    /// Queues a reliable command for every session that has a gamestate
    pub fn broadcast_command(&mut self, command: &str) {
        for slot in 0..self.clients.capacity() {
            self.send_server_command(slot, command);
        }
    }

    /// Console text shown to one player
    pub(crate) fn print_to(&mut self, slot: usize, text: &str) {
        self.send_server_command(slot, &format!("print \"{}\n\"", text));
    }

    pub(crate) fn is_pure(&self) -> bool {
        self.config.pure && !self.world.manifest.paks.is_empty()
    }

    /// Stores a config string and pushes it to sessions that already have a gamestate
    pub fn set_configstring(&mut self, index: usize, value: &str) {
        if !self.world.set_configstring(index, value) {
            return;
        }
        let commands = configstring_commands(index, value);
        for slot in 0..self.clients.capacity() {
            let Some(client) = self.clients.get_mut(slot) else {
                continue;
            };
            if client.gamestate_pending {
                continue;
            }
            match client.state() {
                ClientState::Primed => {
                    client.dirty_configstrings.insert(index);
                }
                ClientState::Active if client.awaiting_begin => {
                    client.dirty_configstrings.insert(index);
                }
                ClientState::Active => {
                    for command in commands.iter() {
                        self.send_server_command(slot, command);
                    }
                }
                _ => {}
            }
        }
    }

    /// Rebuilds serverinfo and systeminfo and pushes any change
    pub(crate) fn refresh_info_strings(&mut self) {
        let serverinfo = self.world.serverinfo(&self.config).to_string();
        let systeminfo = self.world.systeminfo(&self.config).to_string();
        self.set_configstring(shared::CS_SERVERINFO, &serverinfo);
        self.set_configstring(shared::CS_SYSTEMINFO, &systeminfo);
    }

    /// Loads `map`; every live session gets a fresh gamestate
    pub fn spawn_map(&mut self, map: &str, cheats: bool) {
        info!("Spawning map {} (cheats {})", map, if cheats { "on" } else { "off" });
        self.world.spawn(map, cheats, &mut self.rng);
        self.world.time = 0;
        self.world.set_baselines(self.game.baselines());

        for slot in 0..self.clients.capacity() {
            let Some(client) = self.clients.get_mut(slot) else {
                continue;
            };
            if client.state() < ClientState::Connected {
                continue;
            }
            client.gamestate_pending = true;
            client.awaiting_begin = client.state() == ClientState::Active;
            client.dirty_configstrings.clear();
            client.delta_message = -1;
            client.last_usercmd = Default::default();
            let is_bot = client.is_bot;
            if let Some(reason) = self.game.on_client_connect(slot, false, is_bot) {
                self.drop_client(slot, &reason);
            }
        }

        self.refresh_info_strings();
    }

    /// Restarts the current map without sending new gamestates
    pub fn restart_map(&mut self) {
        info!("Restarting map {}", self.world.map_name);
        self.world.restart();
        self.world.time = 0;
        self.refresh_info_strings();
        self.broadcast_command("map_restart");

        for slot in 0..self.clients.capacity() {
            let (state, is_bot) = match self.clients.get(slot) {
                Some(c) => (c.state(), c.is_bot),
                None => continue,
            };
            if state < ClientState::Connected {
                continue;
            }
            if let Some(reason) = self.game.on_client_connect(slot, false, is_bot) {
                self.drop_client(slot, &reason);
                continue;
            }
            if let Some(client) = self.clients.get_mut(slot) {
                if client.in_world() {
                    client.rewards.reset();
                    self.game.on_client_begin(slot);
                }
            }
        }
    }

    /// Drops a session: notifies the peer and everyone else, then leaves a zombie.
    ///
    /// Safe to call from inside handlers run on behalf of the same session;
    /// dropping a zombie or a free slot changes nothing.
    pub fn drop_client(&mut self, slot: usize, reason: &str) {
        let time = self.time;
        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        match client.state() {
            ClientState::Zombie => return,
            ClientState::Free => {
                client.userinfo.clear();
                return;
            }
            _ => {}
        }

        let was = client.state();
        let name = client.name.clone();
        let addr = client.addr();
        if !client.is_bot {
            if let Some(addr) = addr {
                self.gate.drops.record(addr.ip(), client.qport(), reason, time);
            }
        }
        client.download = None;
        info!("Dropping {} (slot {}): {}", name, slot, reason);

        let notice = format!("print \"{}^7 {}\n\"", name, reason);
        for other in self.clients.in_state(ClientState::Active) {
            if other != slot {
                self.send_server_command(other, &notice);
            }
        }

        self.game.on_client_disconnect(slot);

        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        if was >= ClientState::Primed {
            // The ring may already be full; the zombie still gets whatever fits
            let _ = client.queue_reliable(&format!("disconnect \"{}\"", reason));
        } else if let Some(addr) = addr {
            self.send_oob_print(addr, &format!("{}\n", reason));
            self.send_oob(addr, "disconnect");
        }

        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        client.userinfo.clear();
        client.voice.clear();
        client.set_state(ClientState::Zombie);
        if client.is_bot {
            self.free_slot(slot);
        }

        if self.clients.is_empty() {
            self.heartbeat(true);
        }
    }

    /// Returns a zombie to the free pool
    pub(crate) fn free_slot(&mut self, slot: usize) {
        if let Some(client) = self.clients.get_mut(slot) {
            if client.state() == ClientState::Zombie && client.set_state(ClientState::Free) {
                client.reset();
            }
        }
    }

    /// Silently vacates a slot the same peer is reconnecting into
    pub(crate) fn retire_slot(&mut self, slot: usize) {
        let state = match self.clients.get(slot) {
            Some(client) => client.state(),
            None => return,
        };
        if state >= ClientState::Connected {
            self.game.on_client_disconnect(slot);
            if let Some(client) = self.clients.get_mut(slot) {
                client.set_state(ClientState::Zombie);
            }
        }
        self.free_slot(slot);
    }

    /// Announces the server to every master; forced calls ignore the interval
    pub fn heartbeat(&mut self, force: bool) {
        if self.masters.is_empty() || (!force && self.time < self.next_heartbeat) {
            return;
        }
        let game = self.config.heartbeat_game.clone();
        self.send_heartbeat(&game);
    }

    pub(crate) fn send_heartbeat(&mut self, game: &str) {
        self.next_heartbeat = self.time + crate::tick::HEARTBEAT_MSEC;
        let text = format!("heartbeat {}\n", game);
        for master in self.masters.clone() {
            debug!("Sending heartbeat to {}", master);
            self.send_oob(master, &text);
        }
    }

    /// Entry point for every received datagram
    pub fn packet_event(&mut self, from: SocketAddr, data: &[u8]) {
        if oob::is_connectionless(data) {
            self.connectionless_packet(from, data);
            return;
        }

        let Some(qport) = netchan::peek_qport(data) else {
            debug!("Runt packet from {}", from);
            return;
        };

        let Some(slot) = self.clients.find_client_by_addr(from, qport) else {
            debug!("Sequenced packet without a session from {}", from);
            self.send_oob(from, "disconnect");
            return;
        };

        let time = self.time;
        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        let Some(chan) = client.netchan.as_mut() else {
            return;
        };
        if chan.remote().port() != from.port() {
            info!("Port changed for slot {}: {} -> {}", slot, chan.remote(), from);
            chan.set_remote(from);
        }

        match chan.process(data) {
            Ok(Some(message)) => {
                if client.state() == ClientState::Zombie {
                    return;
                }
                client.last_packet_time = time;
                self.execute_client_message(slot, &message);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Channel desynchronized for slot {}: {}", slot, e);
                self.send_oob(from, "disconnect");
                self.drop_client(slot, "Channel desynchronized");
            }
        }
    }
}

/// Reliable commands that carry config string `index`
pub fn configstring_commands(index: usize, value: &str) -> Vec<String> {
    if value.len() < MAX_CONFIGSTRING_CHUNK {
        return vec![format!("cs {} \"{}\"", index, value)];
    }

    let mut commands = Vec::new();
    let mut rest = value;
    let mut first = true;
    while !rest.is_empty() {
        let mut cut = rest.len().min(CONFIGSTRING_CHUNK_BYTES);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (chunk, tail) = rest.split_at(cut);
        let op = if first {
            "bcs0"
        } else if tail.is_empty() {
            "bcs2"
        } else {
            "bcs1"
        };
        commands.push(format!("{} {} \"{}\"", op, index, chunk));
        rest = tail;
        first = false;
    }
    commands
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::game::ArenaGame;
    use crate::userinfo::apply_userinfo;
    use shared::{InfoString, NetSide, Netchan};

    pub(crate) fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([203, 0, 113, 10], port))
    }

    pub(crate) fn engine_with(config: ServerConfig) -> Engine<ArenaGame> {
        let game = ArenaGame::new(config.max_clients);
        Engine::with_seed(config, game, PureManifest::default(), 7)
    }

    /// Puts a peer straight into the world in `slot`, bypassing the handshake
    pub(crate) fn place_client(engine: &mut Engine<ArenaGame>, slot: usize, name: &str, guid: &str) {
        let addr = test_addr(27960 + slot as u16);
        let config = engine.config.clone();
        let client = engine.clients.get_mut(slot).unwrap();
        client.netchan = Some(Netchan::new(NetSide::Server, addr, slot as u16 + 100));
        client.userinfo = InfoString::parse(&format!("\\name\\{}\\cl_guid\\{}", name, guid)).unwrap();
        apply_userinfo(client, &config).unwrap();
        assert!(client.set_state(ClientState::Connected));
        assert!(client.set_state(ClientState::Primed));
        assert!(client.set_state(ClientState::Active));
        assert!(engine.game.on_client_connect(slot, true, false).is_none());
        engine.game.on_client_begin(slot);
    }

    pub(crate) fn active_engine(config: ServerConfig, players: &[(&str, &str)]) -> Engine<ArenaGame> {
        let mut engine = engine_with(config);
        for (slot, (name, guid)) in players.iter().enumerate() {
            place_client(&mut engine, slot, name, guid);
        }
        engine
    }

    /// `print` commands still waiting for the session's acknowledgement
    pub(crate) fn printed(engine: &Engine<ArenaGame>, slot: usize) -> Vec<String> {
        engine
            .clients
            .get(slot)
            .unwrap()
            .unacknowledged()
            .filter(|(_, cmd)| cmd.starts_with("print"))
            .map(|(_, cmd)| cmd.to_string())
            .collect()
    }

    /// Text of every connectionless datagram queued for `to`
    pub(crate) fn oob_to(engine: &mut Engine<ArenaGame>, to: SocketAddr) -> Vec<String> {
        engine
            .take_outgoing()
            .into_iter()
            .filter(|o| o.to == to)
            .filter_map(|o| oob::payload(&o.data))
            .collect()
    }

    #[test]
    fn test_configstring_chunks() {
        assert_eq!(configstring_commands(3, "short"), vec!["cs 3 \"short\""]);

        let long = "x".repeat(2500);
        let commands = configstring_commands(7, &long);
        assert_eq!(commands.len(), 3);
        assert!(commands[0].starts_with("bcs0 7 "));
        assert!(commands[1].starts_with("bcs1 7 "));
        assert!(commands[2].starts_with("bcs2 7 "));

        let two = configstring_commands(7, &"y".repeat(1000));
        assert_eq!(two.len(), 2);
        assert!(two[0].starts_with("bcs0"));
        assert!(two[1].starts_with("bcs2"));
    }

    #[test]
    fn test_configstring_reaches_active_and_marks_primed() {
        let mut engine = active_engine(ServerConfig::default(), &[("One", "A"), ("Two", "B")]);
        let primed = engine.clients.get_mut(1).unwrap();
        primed.awaiting_begin = true;

        engine.set_configstring(20, "hello");

        let active: Vec<String> = engine.clients.get(0).unwrap().unacknowledged().map(|(_, c)| c.to_string()).collect();
        assert!(active.contains(&"cs 20 \"hello\"".to_string()));
        assert!(engine.clients.get(1).unwrap().dirty_configstrings.contains(&20));
    }

    #[test]
    fn test_drop_notifies_others_and_leaves_zombie() {
        let mut engine = active_engine(ServerConfig::default(), &[("Leaver", "A"), ("Stayer", "B")]);

        engine.drop_client(0, "disconnected");

        let leaver = engine.clients.get(0).unwrap();
        assert_eq!(leaver.state(), ClientState::Zombie);
        assert!(leaver.userinfo.is_empty());
        assert!(leaver.unacknowledged().any(|(_, c)| c == "disconnect \"disconnected\""));
        assert!(printed(&engine, 1).iter().any(|l| l.contains("Leaver^7 disconnected")));
        assert!(engine.game.player_state(0).is_none());
    }

    #[test]
    fn test_drop_is_idempotent() {
        let mut engine = active_engine(ServerConfig::default(), &[("Leaver", "A"), ("Stayer", "B")]);

        engine.drop_client(0, "disconnected");
        let before = printed(&engine, 1).len();
        engine.drop_client(0, "disconnected");

        assert_eq!(printed(&engine, 1).len(), before);
        assert_eq!(engine.clients.get(0).unwrap().state(), ClientState::Zombie);
    }

    #[test]
    fn test_drop_of_connected_peer_goes_out_of_band() {
        let mut engine = engine_with(ServerConfig::default());
        let addr = test_addr(5000);
        let client = engine.clients.get_mut(0).unwrap();
        client.netchan = Some(Netchan::new(NetSide::Server, addr, 1));
        client.set_state(ClientState::Connected);

        engine.drop_client(0, "was kicked");

        let sent = oob_to(&mut engine, addr);
        assert!(sent.contains(&"disconnect".to_string()));
    }

    #[test]
    fn test_command_overflow_drops_session() {
        let mut engine = active_engine(ServerConfig::default(), &[("Spammed", "A")]);
        for i in 0..=shared::MAX_RELIABLE_COMMANDS {
            engine.send_server_command(0, &format!("print \"{}\"", i));
        }
        assert_eq!(engine.clients.get(0).unwrap().state(), ClientState::Zombie);
    }

    #[test]
    fn test_spawn_map_marks_sessions_for_new_gamestate() {
        let mut engine = active_engine(ServerConfig::default(), &[("Player", "A")]);
        let old_id = engine.world.server_id;

        engine.spawn_map("ut4_casa", false);

        let client = engine.clients.get(0).unwrap();
        assert_ne!(engine.world.server_id, old_id);
        assert!(client.gamestate_pending);
        assert!(client.awaiting_begin);
        assert_eq!(client.state(), ClientState::Active);
        assert!(!engine.world.cheats);
    }

    #[test]
    fn test_restart_map_keeps_gamestate() {
        let mut engine = active_engine(ServerConfig::default(), &[("Player", "A")]);
        let old_id = engine.world.server_id;

        engine.restart_map();

        let client = engine.clients.get(0).unwrap();
        assert!(!client.gamestate_pending);
        assert!(client.unacknowledged().any(|(_, c)| c == "map_restart"));
        assert!(engine.world.is_pre_restart_id(old_id));
    }

    #[test]
    fn test_unknown_sequenced_peer_gets_disconnect() {
        let mut engine = engine_with(ServerConfig::default());
        let stranger = test_addr(9999);
        let mut chan = Netchan::new(NetSide::Client, stranger, 77);
        let datagram = chan.transmit(&[0u8; 12]).unwrap().remove(0);

        engine.packet_event(stranger, &datagram);

        assert_eq!(oob_to(&mut engine, stranger), vec!["disconnect".to_string()]);
    }

    #[test]
    fn test_staged_config_keeps_slot_count() {
        let mut engine = engine_with(ServerConfig::default());
        engine.apply_config(ServerConfig {
            max_clients: 2,
            hostname: "Renamed".to_string(),
            ..Default::default()
        });
        engine.install_pending_config();

        assert_eq!(engine.config.max_clients, 16);
        assert!(engine.world.configstring(shared::CS_SERVERINFO).contains("Renamed"));
    }
}
