//! Voice relay.
//!
//! Clients send voice frames addressed to a set of recipient slots. The server
//! queues a copy on every eligible recipient and drains those queues into the
//! outgoing message, behind an end-of-message marker so receivers that do not
//! know the extension stop reading before they reach it.

use crate::client_manager::{ClientManager, ClientState};
use crate::error::Result;
use log::{debug, warn};
use shared::{MsgReader, MsgWriter, SvcOp, MAX_VOIP_PACKET, VOIP_QUEUE_LENGTH};
use std::collections::VecDeque;

/// Bits of each recipient word that address slots
const RECIPIENT_BITS: usize = 31;

/// One voice frame as sent by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoipFrame {
    pub generation: u8,
    pub sequence: i32,
    pub frames: u8,
    pub recipients: [u32; 3],
    pub data: Vec<u8>,
}

impl VoipFrame {
    pub fn read(msg: &mut MsgReader<'_>) -> shared::msg::Result<Self> {
        let generation = msg.read_u8()?;
        let sequence = msg.read_i32()?;
        let frames = msg.read_u8()?;
        let recipients = [msg.read_u32()?, msg.read_u32()?, msg.read_u32()?];
        let size = msg.read_u16()? as usize;
        let data = msg.read_bytes(size)?.to_vec();
        Ok(Self {
            generation,
            sequence,
            frames,
            recipients,
            data,
        })
    }

    pub fn write(&self, msg: &mut MsgWriter) -> shared::msg::Result<()> {
        msg.write_u8(self.generation)?;
        msg.write_i32(self.sequence)?;
        msg.write_u8(self.frames)?;
        for word in self.recipients {
            msg.write_u32(word)?;
        }
        msg.write_u16(self.data.len() as u16)?;
        msg.write_bytes(&self.data)
    }

    pub fn addresses(&self, slot: usize) -> bool {
        let word = slot / RECIPIENT_BITS;
        word < self.recipients.len() && self.recipients[word] & (1 << (slot % RECIPIENT_BITS)) != 0
    }
}

/// Sets the recipient bit for `slot`
pub fn add_recipient(recipients: &mut [u32; 3], slot: usize) {
    let word = slot / RECIPIENT_BITS;
    if word < recipients.len() {
        recipients[word] |= 1 << (slot % RECIPIENT_BITS);
    }
}

/// A frame waiting to be relayed to one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedVoice {
    pub sender: usize,
    pub generation: u8,
    pub sequence: i32,
    pub frames: u8,
    pub data: Vec<u8>,
}

/// Per-session voice settings and relay queue
#[derive(Debug, Default)]
pub struct VoiceState {
    /// Client advertised voice support in its userinfo
    pub enabled: bool,
    pub mute_all: bool,
    ignored: u64,
    queue: VecDeque<QueuedVoice>,
}

impl VoiceState {
    pub fn ignore(&mut self, slot: usize) {
        if slot < 64 {
            self.ignored |= 1 << slot;
        }
    }

    pub fn unignore(&mut self, slot: usize) {
        if slot < 64 {
            self.ignored &= !(1 << slot);
        }
    }

    pub fn is_ignoring(&self, slot: usize) -> bool {
        slot < 64 && self.ignored & (1 << slot) != 0
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Drops everything, used when a slot is vacated
    pub fn clear(&mut self) {
        *self = VoiceState::default();
    }

    /// Writes queued frames until `budget` bytes would be exceeded.
    ///
    /// Every frame goes behind its own end-of-message marker, so nothing is
    /// written when not even one frame fits. Returns the number of frames written.
    pub fn write_pending(&mut self, msg: &mut MsgWriter, budget: usize) -> Result<usize> {
        let mut used = 0;
        let mut written = 0;
        while let Some(packet) = self.queue.front() {
            let size = 3 + 2 + 1 + 4 + 1 + 2 + packet.data.len();
            if used + size > budget || msg.remaining() < size + 1 {
                break;
            }
            msg.write_u8(SvcOp::Eof as u8)?;
            msg.write_u8(SvcOp::Extension as u8)?;
            msg.write_u8(SvcOp::Voip as u8)?;
            msg.write_i16(packet.sender as i16)?;
            msg.write_u8(packet.generation)?;
            msg.write_i32(packet.sequence)?;
            msg.write_u8(packet.frames)?;
            msg.write_u16(packet.data.len() as u16)?;
            msg.write_bytes(&packet.data)?;
            used += size;
            written += 1;
            self.queue.pop_front();
        }
        Ok(written)
    }
}

/// Queues `frame` from `sender` on every session that should hear it.
///
/// Recipients must be in the world, have voice enabled, not be muting
/// everyone or this sender, and not be downloading. Returns how many
/// sessions received a copy.
pub fn relay(clients: &mut ClientManager, sender: usize, frame: &VoipFrame) -> usize {
    if frame.data.len() > MAX_VOIP_PACKET {
        debug!("Ignoring oversized voice frame ({} bytes) from slot {}", frame.data.len(), sender);
        return 0;
    }
    match clients.get(sender) {
        Some(c) if c.voice.enabled => {}
        _ => return 0,
    }

    let mut delivered = 0;
    for (slot, client) in clients.iter_mut() {
        if slot == sender
            || client.state() != ClientState::Active
            || !client.voice.enabled
            || client.voice.mute_all
            || client.voice.is_ignoring(sender)
            || client.is_downloading()
            || !frame.addresses(slot)
        {
            continue;
        }
        if client.voice.queue.len() >= VOIP_QUEUE_LENGTH {
            warn!("Voice queue full for slot {}, dropping frame from {}", slot, sender);
            continue;
        }
        client.voice.queue.push_back(QueuedVoice {
            sender,
            generation: frame.generation,
            sequence: frame.sequence,
            frames: frame.frames,
            data: frame.data.clone(),
        });
        delivered += 1;
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{NetSide, Netchan};
    use std::net::SocketAddr;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn active_manager(count: usize) -> ClientManager {
        let mut manager = ClientManager::new(count, 0);
        for slot in 0..count {
            let client = manager.get_mut(slot).unwrap();
            client.netchan = Some(Netchan::new(NetSide::Server, test_addr(27000 + slot as u16), slot as u16));
            client.set_state(ClientState::Connected);
            client.set_state(ClientState::Primed);
            client.set_state(ClientState::Active);
            client.voice.enabled = true;
        }
        manager
    }

    fn frame_for(slots: &[usize]) -> VoipFrame {
        let mut recipients = [0; 3];
        for slot in slots {
            add_recipient(&mut recipients, *slot);
        }
        VoipFrame {
            generation: 1,
            sequence: 7,
            frames: 2,
            recipients,
            data: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_recipient_bits_span_words() {
        let frame = frame_for(&[0, 30, 31, 63]);
        assert!(frame.addresses(0));
        assert!(frame.addresses(30));
        assert!(frame.addresses(31));
        assert!(frame.addresses(63));
        assert!(!frame.addresses(1));
        assert!(!frame.addresses(93));
    }

    #[test]
    fn test_frame_wire_layout() {
        let frame = frame_for(&[2]);
        let mut msg = MsgWriter::new(256);
        frame.write(&mut msg).unwrap();

        let mut reader = MsgReader::new(msg.as_bytes());
        assert_eq!(VoipFrame::read(&mut reader).unwrap(), frame);
    }

    #[test]
    fn test_relay_filters_recipients() {
        let mut manager = active_manager(5);
        manager.get_mut(2).unwrap().voice.mute_all = true;
        manager.get_mut(3).unwrap().voice.ignore(0);
        manager.get_mut(4).unwrap().voice.enabled = false;

        let delivered = relay(&mut manager, 0, &frame_for(&[0, 1, 2, 3, 4]));

        assert_eq!(delivered, 1);
        assert_eq!(manager.get(1).unwrap().voice.queued(), 1);
        assert_eq!(manager.get(0).unwrap().voice.queued(), 0);
        assert_eq!(manager.get(3).unwrap().voice.queued(), 0);
    }

    #[test]
    fn test_sender_without_voice_is_ignored() {
        let mut manager = active_manager(2);
        manager.get_mut(0).unwrap().voice.enabled = false;
        assert_eq!(relay(&mut manager, 0, &frame_for(&[1])), 0);
    }

    #[test]
    fn test_queue_is_bounded() {
        let mut manager = active_manager(2);
        for _ in 0..VOIP_QUEUE_LENGTH + 5 {
            relay(&mut manager, 0, &frame_for(&[1]));
        }
        assert_eq!(manager.get(1).unwrap().voice.queued(), VOIP_QUEUE_LENGTH);
    }

    #[test]
    fn test_write_pending_respects_budget() {
        let mut manager = active_manager(2);
        for _ in 0..3 {
            relay(&mut manager, 0, &frame_for(&[1]));
        }
        let voice = &mut manager.get_mut(1).unwrap().voice;

        let mut msg = MsgWriter::new(1024);
        // Each frame costs 13 bytes of header plus 4 of data
        assert_eq!(voice.write_pending(&mut msg, 40).unwrap(), 2);
        assert_eq!(voice.queued(), 1);

        let mut reader = MsgReader::new(msg.as_bytes());
        assert_eq!(reader.read_u8().unwrap(), SvcOp::Eof as u8);
        assert_eq!(reader.read_u8().unwrap(), SvcOp::Extension as u8);
        assert_eq!(reader.read_u8().unwrap(), SvcOp::Voip as u8);
        assert_eq!(reader.read_i16().unwrap(), 0);
    }

    #[test]
    fn test_ignore_toggle() {
        let mut voice = VoiceState::default();
        voice.ignore(5);
        assert!(voice.is_ignoring(5));
        voice.unignore(5);
        assert!(!voice.is_ignoring(5));
        voice.ignore(200);
        assert!(!voice.is_ignoring(200));
    }
}
