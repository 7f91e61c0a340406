//! Client session table for the multiplayer server
//!
//! This module owns the fixed-size array of player slots, including:
//! - The per-slot session state machine (free, connected, primed, active, zombie)
//! - Reliable server command queues and acknowledgement tracking
//! - Round-trip estimates from acknowledged snapshot frames
//! - Lookups by network address, slot number and player name
//!
//! Slots are addressed by plain indices. Anything that needs to refer to a
//! player (the game module, voice relay, operator commands) stores the index,
//! never a reference, so reusing a slot cannot leave anything dangling.

use crate::download::Download;
use crate::error::{CommandOverflow, LookupError};
use crate::rewards::RewardBags;
use crate::voice::VoiceState;
use log::{debug, warn};
use shared::{InfoString, Netchan, UserCmd, MAX_RELIABLE_COMMANDS, PACKET_BACKUP, PACKET_MASK};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};

/// Ping reported for sessions without usable measurements
pub const MAX_PING: u32 = 999;

/// Lifecycle of a slot.
///
/// Ordering follows the declaration order so `state >= ClientState::Connected`
/// reads as "has a live peer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ClientState {
    #[default]
    Free,
    /// Dropped, kept briefly to swallow late packets from the same peer
    Zombie,
    /// Admitted, waiting for the gamestate
    Connected,
    /// Gamestate sent, waiting for the first movement command
    Primed,
    /// In the world
    Active,
}

impl ClientState {
    /// Edges of the session lifecycle
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;
        matches!(
            (self, next),
            (Free, Connected)
                | (Connected, Primed)
                | (Primed, Active)
                | (Connected, Zombie)
                | (Primed, Zombie)
                | (Active, Zombie)
                | (Zombie, Free)
        )
    }
}

/// Send and acknowledgement times for one outgoing message
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTiming {
    pub sent: u64,
    pub acked: Option<u64>,
}

/// Accepts at most `limit` events per window
#[derive(Debug, Clone, Default)]
pub struct FloodGate {
    window_start: u64,
    accepted: u32,
}

impl FloodGate {
    pub fn allow(&mut self, now: u64, window_ms: u64, limit: u32) -> bool {
        if self.accepted == 0 || now.saturating_sub(self.window_start) >= window_ms {
            self.window_start = now;
            self.accepted = 0;
        }
        if self.accepted < limit {
            self.accepted += 1;
            true
        } else {
            false
        }
    }
}

/// Everything the server tracks about one slot.
///
/// `Client::default()` is the vacant slot; [`Client::reset`] returns a slot to
/// that value before it is handed to a new peer.
#[derive(Debug, Default)]
pub struct Client {
    state: ClientState,

    // Identity
    pub netchan: Option<Netchan>,
    pub userinfo: InfoString,
    pub name: String,
    pub challenge: i32,
    pub is_bot: bool,
    pub is_lan: bool,

    // Derived from userinfo
    pub rate: u32,
    pub snapshot_msec: u32,

    // Reliable channel, server to client
    pub reliable_sequence: i32,
    pub reliable_acknowledge: i32,
    reliable_commands: Vec<String>,

    // Reliable channel, client to server
    pub last_client_command: i32,
    pub last_client_command_string: String,
    pub message_acknowledge: i32,

    // Map lifetime
    pub gamestate_message_num: i32,
    pub gamestate_pending: bool,
    pub awaiting_begin: bool,
    pub delta_message: i32,
    pub last_usercmd: UserCmd,
    pub dirty_configstrings: BTreeSet<usize>,

    // Timing
    pub last_packet_time: u64,
    pub last_connect_time: u64,
    pub next_snapshot_time: u64,
    pub timeout_count: u32,
    pub ping: u32,
    frames: Vec<FrameTiming>,

    pub command_flood: FloodGate,
    pub userinfo_flood: FloodGate,

    // Pure validation
    pub pure_authentic: bool,
    pub got_cp: bool,

    pub download: Option<Download>,
    pub voice: VoiceState,

    // Moderation and mini-features
    pub muted: bool,
    pub location: String,
    pub locate_token: Option<u32>,
    pub allow_goto: bool,
    pub last_goto_time: Option<u64>,
    pub last_load_time: Option<u64>,
    pub rewards: RewardBags,
}

impl Client {
    /// Returns the slot to its vacant value
    pub fn reset(&mut self) {
        *self = Client::default();
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Moves along a lifecycle edge; refuses (and logs) anything else
    pub fn set_state(&mut self, next: ClientState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "Refusing session transition {:?} -> {:?} for {}",
                self.state, next, self.name
            );
            return false;
        }
        debug!("Session {} {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
        true
    }

    pub fn is_free(&self) -> bool {
        self.state == ClientState::Free
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.netchan.as_ref().map(Netchan::remote)
    }

    pub fn qport(&self) -> u16 {
        self.netchan.as_ref().map(Netchan::qport).unwrap_or(0)
    }

    /// Active and past the first movement command of the current gamestate
    pub fn in_world(&self) -> bool {
        self.state == ClientState::Active && !self.awaiting_begin && !self.gamestate_pending
    }

    pub fn is_downloading(&self) -> bool {
        self.download.is_some()
    }

    /// Queues a reliable command for delivery with the next outgoing message.
    ///
    /// Sessions that have not been sent a gamestate yet silently skip it; they
    /// receive the current state through the gamestate instead.
    pub fn queue_reliable(&mut self, command: &str) -> Result<(), CommandOverflow> {
        if self.state < ClientState::Primed {
            return Ok(());
        }
        self.reliable_sequence += 1;
        // Exactly one past full is the overflow; later calls land on a dropped session
        if self.reliable_sequence - self.reliable_acknowledge == MAX_RELIABLE_COMMANDS as i32 + 1 {
            return Err(CommandOverflow);
        }
        if self.reliable_commands.len() != MAX_RELIABLE_COMMANDS {
            self.reliable_commands = vec![String::new(); MAX_RELIABLE_COMMANDS];
        }
        let index = self.reliable_sequence as usize & (MAX_RELIABLE_COMMANDS - 1);
        self.reliable_commands[index] = command.to_string();
        Ok(())
    }

    /// Reliable command stored for `sequence`, if still in the ring
    pub fn reliable_command(&self, sequence: i32) -> &str {
        let index = sequence as usize & (MAX_RELIABLE_COMMANDS - 1);
        self.reliable_commands
            .get(index)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Sequences not yet acknowledged by the client, oldest first
    pub fn unacknowledged(&self) -> impl Iterator<Item = (i32, &str)> {
        (self.reliable_acknowledge + 1..=self.reliable_sequence)
            .map(move |seq| (seq, self.reliable_command(seq)))
    }

    fn frames_mut(&mut self) -> &mut Vec<FrameTiming> {
        if self.frames.len() != PACKET_BACKUP {
            self.frames = vec![FrameTiming::default(); PACKET_BACKUP];
        }
        &mut self.frames
    }

    /// Records when message `sequence` left the server
    pub fn record_frame_sent(&mut self, sequence: u32, now: u64) {
        let frame = &mut self.frames_mut()[sequence as usize & PACKET_MASK];
        frame.sent = now;
        frame.acked = None;
    }

    /// Marks message `sequence` as acknowledged at `now` (first ack wins)
    pub fn ack_frame(&mut self, sequence: i32, now: u64) {
        let frame = &mut self.frames_mut()[sequence as usize & PACKET_MASK];
        if frame.acked.is_none() && frame.sent != 0 {
            frame.acked = Some(now);
        }
    }

    /// Recomputes [`Client::ping`] from the acknowledged frames
    pub fn calc_ping(&mut self) {
        if self.state != ClientState::Active {
            self.ping = MAX_PING;
            return;
        }
        let samples: Vec<u64> = self
            .frames
            .iter()
            .filter_map(|f| f.acked.map(|acked| acked.saturating_sub(f.sent)))
            .collect();
        self.ping = if samples.is_empty() {
            MAX_PING
        } else {
            let mean = samples.iter().sum::<u64>() / samples.len() as u64;
            (mean as u32).min(MAX_PING)
        };
    }
}

/// Strips `^X` colour escapes
pub fn clean_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c == '^' {
            chars.next();
            continue;
        }
        out.push(c);
    }
    out
}

/// Fixed-capacity arena of player slots
///
/// The ClientManager provides centralized control over all sessions and
/// enforces the slot capacity. Slots below `private_clients` are reserved for
/// peers that supply the private password.
pub struct ClientManager {
    slots: Vec<Client>,
    private_clients: usize,
}

impl ClientManager {
    /// Creates `max_clients` vacant slots, the first `private_clients` reserved
    pub fn new(max_clients: usize, private_clients: usize) -> Self {
        let mut slots = Vec::with_capacity(max_clients);
        slots.resize_with(max_clients, Client::default);
        Self {
            slots,
            private_clients: private_clients.min(max_clients),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn private_clients(&self) -> usize {
        self.private_clients
    }

    pub fn get(&self, slot: usize) -> Option<&Client> {
        self.slots.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Client> {
        self.slots.get_mut(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Client)> {
        self.slots.iter().enumerate()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Client)> {
        self.slots.iter_mut().enumerate()
    }

    /// Slots with a live peer or a lingering zombie
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &Client)> {
        self.iter().filter(|(_, c)| !c.is_free())
    }

    /// Slots currently in `state`
    pub fn in_state(&self, state: ClientState) -> Vec<usize> {
        self.iter()
            .filter(|(_, c)| c.state() == state)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of sessions at or past CONNECTED
    pub fn len(&self) -> usize {
        self.iter()
            .filter(|(_, c)| c.state() >= ClientState::Connected)
            .count()
    }

    /// Returns true if no session is connected
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Routes a sequenced datagram: same IP and qport, any non-free slot
    pub fn find_client_by_addr(&self, addr: SocketAddr, qport: u16) -> Option<usize> {
        self.occupied()
            .find(|(_, c)| c.addr().map(|a| a.ip()) == Some(addr.ip()) && c.qport() == qport)
            .map(|(i, _)| i)
    }

    /// Slot already held by this peer, matched by qport or by port
    pub fn find_reconnect_slot(&self, addr: SocketAddr, qport: u16) -> Option<usize> {
        self.occupied()
            .find(|(_, c)| match c.addr() {
                Some(a) => a.ip() == addr.ip() && (c.qport() == qport || a.port() == addr.port()),
                None => false,
            })
            .map(|(i, _)| i)
    }

    /// First vacant slot at or above `start`
    pub fn find_free_slot(&self, start: usize) -> Option<usize> {
        self.iter()
            .skip(start)
            .find(|(_, c)| c.is_free())
            .map(|(i, _)| i)
    }

    /// Non-free sessions whose peer shares `ip`
    pub fn count_from_ip(&self, ip: IpAddr) -> usize {
        self.occupied()
            .filter(|(_, c)| c.addr().map(|a| a.ip()) == Some(ip))
            .count()
    }

    pub fn bot_count(&self) -> usize {
        self.iter()
            .filter(|(_, c)| c.state() >= ClientState::Connected && c.is_bot)
            .count()
    }

    /// Resolves an operator-supplied player handle.
    ///
    /// A numeric handle is a slot number. Otherwise an exact, case-insensitive
    /// match on the colour-stripped name wins; failing that a unique substring
    /// match. Several substring matches are reported instead of guessed.
    pub fn lookup_by_handle(&self, handle: &str) -> Result<usize, LookupError> {
        if !handle.is_empty() && handle.bytes().all(|b| b.is_ascii_digit()) {
            let slot: usize = handle
                .parse()
                .map_err(|_| LookupError::NotFound(handle.to_string()))?;
            let client = self.get(slot).ok_or(LookupError::BadSlot(slot))?;
            if client.state() < ClientState::Connected {
                return Err(LookupError::NotConnected(slot));
            }
            return Ok(slot);
        }

        let wanted = clean_name(handle).to_lowercase();
        // An empty pattern would match every name as a substring
        if wanted.trim().is_empty() {
            return Err(LookupError::NotFound(handle.to_string()));
        }
        let live: Vec<(usize, String)> = self
            .iter()
            .filter(|(_, c)| c.state() >= ClientState::Connected)
            .map(|(i, c)| (i, clean_name(&c.name).to_lowercase()))
            .collect();

        if let Some((slot, _)) = live.iter().find(|(_, name)| *name == wanted) {
            return Ok(*slot);
        }

        let partial: Vec<&(usize, String)> =
            live.iter().filter(|(_, name)| name.contains(&wanted)).collect();
        match partial.as_slice() {
            [] => Err(LookupError::NotFound(handle.to_string())),
            [(slot, _)] => Ok(*slot),
            many => Err(LookupError::Ambiguous(
                many.iter()
                    .map(|(slot, _)| self.slots[*slot].name.clone())
                    .collect(),
            )),
        }
    }

    /// Recomputes ping for every slot
    pub fn calc_pings(&mut self) {
        for client in self.slots.iter_mut() {
            client.calc_ping();
        }
    }
}
