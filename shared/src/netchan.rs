//! Sequenced channel over UDP.
//!
//! Each datagram starts with a 32-bit sequence number. The high bit flags a
//! fragment of a message too large for one datagram; fragments carry their
//! byte offset and length so the receiver can stitch them back together.
//! Datagrams sent by a client also carry the client's qport so the server can
//! find the session even after a NAT rewrites the source port.
//!
//! Delivery is at-most-once: anything at or behind the last accepted sequence
//! is discarded without comment. A fragment that does not line up with what
//! has been assembled so far means the two ends have lost sync.

use crate::msg::{CodecError, MsgReader};
use crate::{FRAGMENT_SIZE, MAX_MSGLEN};
use log::debug;
use std::net::SocketAddr;
use thiserror::Error;

pub const FRAGMENT_BIT: u32 = 1 << 31;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetchanError {
    #[error("fragment starts at {got}, expected {expected}")]
    FragmentMismatch { expected: usize, got: usize },

    #[error("fragment of {len} bytes would overflow the reassembly buffer")]
    FragmentOverflow { len: usize },

    #[error("message of {0} bytes is too large to send")]
    MessageTooLarge(usize),

    #[error("malformed header: {0}")]
    Header(#[from] CodecError),
}

/// Which end of the conversation this channel sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetSide {
    /// Receives qport-tagged datagrams, sends untagged ones
    Server,
    /// Sends qport-tagged datagrams, receives untagged ones
    Client,
}

#[derive(Debug, Clone)]
pub struct Netchan {
    side: NetSide,
    remote: SocketAddr,
    qport: u16,
    incoming_sequence: u32,
    outgoing_sequence: u32,
    dropped: u32,
    fragment_sequence: u32,
    fragment_buffer: Vec<u8>,
}

impl Netchan {
    pub fn new(side: NetSide, remote: SocketAddr, qport: u16) -> Self {
        Self {
            side,
            remote,
            qport,
            incoming_sequence: 0,
            outgoing_sequence: 1,
            dropped: 0,
            fragment_sequence: 0,
            fragment_buffer: Vec::new(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Follows the peer to a new source port after NAT rebinding
    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = remote;
    }

    pub fn qport(&self) -> u16 {
        self.qport
    }

    pub fn incoming_sequence(&self) -> u32 {
        self.incoming_sequence
    }

    pub fn outgoing_sequence(&self) -> u32 {
        self.outgoing_sequence
    }

    /// Sequences skipped between the last two accepted datagrams
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    fn header(&self, sequence: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_SIZE + 10);
        out.extend_from_slice(&sequence.to_le_bytes());
        if self.side == NetSide::Client {
            out.extend_from_slice(&self.qport.to_le_bytes());
        }
        out
    }

    /// Wraps `payload` into one or more datagrams sharing the next sequence number.
    pub fn transmit(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>, NetchanError> {
        if payload.len() > MAX_MSGLEN {
            return Err(NetchanError::MessageTooLarge(payload.len()));
        }

        let sequence = self.outgoing_sequence;
        self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1);

        if payload.len() < FRAGMENT_SIZE {
            let mut datagram = self.header(sequence);
            datagram.extend_from_slice(payload);
            return Ok(vec![datagram]);
        }

        let mut datagrams = Vec::new();
        let mut start = 0;
        loop {
            let len = (payload.len() - start).min(FRAGMENT_SIZE);
            let mut datagram = self.header(sequence | FRAGMENT_BIT);
            datagram.extend_from_slice(&(start as u16).to_le_bytes());
            datagram.extend_from_slice(&(len as u16).to_le_bytes());
            datagram.extend_from_slice(&payload[start..start + len]);
            datagrams.push(datagram);
            start += len;

            // A short fragment ends the message, so an exact multiple needs an empty one
            if len < FRAGMENT_SIZE {
                break;
            }
        }
        Ok(datagrams)
    }

    /// Accepts one datagram from the peer.
    ///
    /// Returns `Ok(Some(message))` once a complete message is available,
    /// `Ok(None)` for stale duplicates and partial fragments.
    pub fn process(&mut self, datagram: &[u8]) -> Result<Option<Vec<u8>>, NetchanError> {
        let mut reader = MsgReader::new(datagram);
        let raw_sequence = reader.read_u32()?;
        if self.side == NetSide::Server {
            // qport was already used to route the datagram here
            reader.read_u16()?;
        }

        let fragmented = raw_sequence & FRAGMENT_BIT != 0;
        let sequence = raw_sequence & !FRAGMENT_BIT;

        let (fragment_start, fragment_len) = if fragmented {
            (reader.read_u16()? as usize, reader.read_u16()? as usize)
        } else {
            (0, 0)
        };

        if sequence <= self.incoming_sequence {
            debug!(
                "{}: out of order packet {} at {}",
                self.remote, sequence, self.incoming_sequence
            );
            return Ok(None);
        }

        if fragmented {
            if sequence != self.fragment_sequence {
                self.fragment_sequence = sequence;
                self.fragment_buffer.clear();
            }

            if fragment_start != self.fragment_buffer.len() {
                return Err(NetchanError::FragmentMismatch {
                    expected: self.fragment_buffer.len(),
                    got: fragment_start,
                });
            }

            if fragment_len > FRAGMENT_SIZE
                || fragment_len > reader.remaining()
                || self.fragment_buffer.len() + fragment_len > MAX_MSGLEN
            {
                return Err(NetchanError::FragmentOverflow { len: fragment_len });
            }

            let data = reader.read_bytes(fragment_len)?;
            self.fragment_buffer.extend_from_slice(data);

            if fragment_len == FRAGMENT_SIZE {
                return Ok(None);
            }

            self.note_accepted(sequence);
            return Ok(Some(std::mem::take(&mut self.fragment_buffer)));
        }

        self.note_accepted(sequence);
        Ok(Some(reader.rest().to_vec()))
    }

    fn note_accepted(&mut self, sequence: u32) {
        self.dropped = sequence - (self.incoming_sequence + 1);
        if self.dropped > 0 {
            debug!(
                "{}: dropped {} packets at {}",
                self.remote, self.dropped, sequence
            );
        }
        self.incoming_sequence = sequence;
    }
}

/// Reads the qport a client stamped on a sequenced datagram
pub fn peek_qport(datagram: &[u8]) -> Option<u16> {
    let mut reader = MsgReader::new(datagram);
    reader.read_u32().ok()?;
    reader.read_u16().ok()
}
