//! Per-session outbound messages.
//!
//! Every due session gets one message per frame: the unacknowledged reliable
//! commands, then either a gamestate or a snapshot header, then a slice of any
//! download, then queued voice, then the end marker. How soon the session is
//! due again depends on its rate and on how large the message was.

use crate::client_manager::{Client, ClientState};
use crate::config::ServerConfig;
use crate::download::blocks_per_snap;
use crate::engine::Engine;
use crate::error::Result;
use crate::game::GameModule;
use crate::world::WorldState;
use log::{debug, error};
use shared::delta::write_delta_entity;
use shared::{EntityState, MsgWriter, SvcOp, MAX_DOWNLOAD_BLKSIZE, MAX_MSGLEN, MAX_RELIABLE_COMMANDS};
use shared::{MAX_STRING_CHARS, PACKET_BACKUP};

/// Per-datagram overhead counted against the session's rate
const HEADER_RATE_BYTES: usize = 48;
/// Sessions outside the world are polled at most this often
const IDLE_SNAPSHOT_MSEC: u64 = 1000;
/// Room kept after the reliable commands for a snapshot header and the end marker
const TRAILER_BYTES: usize = 16;
pub const OVERFLOW_REASON: &str = "Server message overflow";

/// Cuts `text` to what fits in one wire string
fn clip(text: &str) -> &str {
    if text.len() < MAX_STRING_CHARS {
        return text;
    }
    let mut cut = MAX_STRING_CHARS - 1;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

fn write_gamestate(msg: &mut MsgWriter, client: &Client, world: &WorldState, slot: usize) -> Result<()> {
    msg.write_u8(SvcOp::Gamestate as u8)?;
    msg.write_i32(client.reliable_sequence)?;
    for (index, value) in world.configstrings() {
        msg.write_u8(SvcOp::ConfigString as u8)?;
        msg.write_u16(index as u16)?;
        msg.write_big_string(value)?;
    }
    let null = EntityState::default();
    for baseline in world.baselines() {
        msg.write_u8(SvcOp::Baseline as u8)?;
        write_delta_entity(msg, &null, Some(baseline), true)?;
    }
    msg.write_u8(SvcOp::Eof as u8)?;
    msg.write_i32(slot as i32)?;
    msg.write_i32(world.checksum_feed)?;
    Ok(())
}

/// Builds the next message for `client`, updating its gamestate and download state
fn build_message(client: &mut Client, world: &WorldState, slot: usize, sequence: u32, now: u64) -> Result<Vec<u8>> {
    let mut msg = MsgWriter::new(MAX_MSGLEN);
    msg.write_i32(client.last_client_command)?;

    // A zombie may have overflowed its ring on the way out; only the tail is still stored
    let first = if client.state() == ClientState::Zombie {
        (client.reliable_acknowledge + 1).max(client.reliable_sequence - MAX_RELIABLE_COMMANDS as i32 + 1)
    } else {
        client.reliable_acknowledge + 1
    };
    // Whatever does not fit stays unacknowledged and goes out in a later message
    for sequence in first..=client.reliable_sequence {
        let command = clip(client.reliable_command(sequence));
        if msg.remaining() < 1 + 4 + 2 + command.len() + TRAILER_BYTES {
            debug!(
                "Deferring commands {}..={} for slot {}",
                sequence, client.reliable_sequence, slot
            );
            break;
        }
        msg.write_u8(SvcOp::ServerCommand as u8)?;
        msg.write_i32(sequence)?;
        msg.write_string(command)?;
    }

    let needs_gamestate = client.state() == ClientState::Connected
        || (client.gamestate_pending && client.state() != ClientState::Zombie);
    if needs_gamestate {
        debug!("Sending gamestate to {} (slot {})", client.name, slot);
        write_gamestate(&mut msg, client, world, slot)?;
        if client.state() == ClientState::Connected {
            client.set_state(ClientState::Primed);
        }
        client.gamestate_message_num = sequence as i32;
        client.gamestate_pending = false;
        client.pure_authentic = false;
        client.got_cp = false;
    } else if client.in_world() {
        let delta_num = if client.delta_message <= 0 {
            0
        } else {
            let age = sequence as i64 - client.delta_message as i64;
            if age > 0 && age < PACKET_BACKUP as i64 - 3 {
                age as u8
            } else {
                0
            }
        };
        msg.write_u8(SvcOp::Snapshot as u8)?;
        msg.write_i32(world.time as i32)?;
        msg.write_u8(delta_num)?;
    }

    if let Some(download) = client.download.as_mut() {
        let failed = download.is_failed();
        let blocks = blocks_per_snap(client.rate, client.snapshot_msec);
        download.write_blocks(&mut msg, now, blocks)?;
        // A refusal that did not fit this time is retried next message
        if failed && !download.is_failed() {
            client.download = None;
        }
    } else if client.voice.queued() > 0 {
        client.voice.write_pending(&mut msg, MAX_DOWNLOAD_BLKSIZE)?;
    }

    msg.write_u8(SvcOp::Eof as u8)?;
    Ok(msg.into_bytes())
}

/// When `client` may be sent its next message
pub fn next_snapshot_time(client: &Client, message_len: usize, now: u64, config: &ServerConfig) -> u64 {
    let loopback = client.addr().map(|a| a.ip().is_loopback()).unwrap_or(false);
    if loopback || (client.is_lan && config.lan_force_rate) {
        return now;
    }

    let rate = client.rate.max(1) as u64;
    let rate_msec = (message_len + HEADER_RATE_BYTES) as u64 * 1000 / rate;
    let mut next = now + rate_msec.max(client.snapshot_msec as u64);
    if !client.in_world() && !client.is_downloading() {
        next = next.max(now + IDLE_SNAPSHOT_MSEC);
    }
    next
}

impl<G: GameModule> Engine<G> {
    /// Sends a message to every session whose turn has come
    pub(crate) fn send_client_messages(&mut self) {
        let now = self.time;
        for slot in 0..self.clients.capacity() {
            let due = match self.clients.get(slot) {
                Some(c) => !c.is_free() && !c.is_bot && now >= c.next_snapshot_time,
                None => false,
            };
            if due {
                self.send_client_message(slot);
            }
        }
    }

    pub(crate) fn send_client_message(&mut self, slot: usize) {
        let now = self.time;
        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        let Some(sequence) = client.netchan.as_ref().map(|n| n.outgoing_sequence()) else {
            return;
        };
        let payload = match build_message(client, &self.world, slot, sequence, now) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Could not build message for slot {}: {}", slot, e);
                self.drop_client(slot, OVERFLOW_REASON);
                return;
            }
        };
        client.record_frame_sent(sequence, now);
        client.next_snapshot_time = next_snapshot_time(client, payload.len(), now, &self.config);
        self.transmit(slot, &payload);
    }
}
