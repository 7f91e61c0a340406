//! Protocol definitions shared by the server and its test client.
//!
//! Holds the wire constants, op codes, the little-endian message codec, delta
//! records, userinfo blobs, connectionless packet helpers and the sequenced
//! channel. Nothing in here touches sockets or clocks; callers own both.

pub mod clc;
pub mod delta;
pub mod info;
pub mod msg;
pub mod netchan;
pub mod oob;
pub mod svc;

pub use clc::{move_key, ClientMessage};
pub use delta::{EntityDelta, EntityState, UserCmd};
pub use info::{InfoError, InfoString};
pub use msg::{CodecError, MsgReader, MsgWriter};
pub use netchan::{NetSide, Netchan, NetchanError};
pub use oob::CommandArgs;
pub use svc::{parse_server_message, ServerMessage};

pub const PROTOCOL_VERSION: i32 = 68;

pub const MAX_MSGLEN: usize = 16384;
pub const MAX_PACKETLEN: usize = 1400;
pub const FRAGMENT_SIZE: usize = 1300;

pub const MAX_RELIABLE_COMMANDS: usize = 64;
pub const MAX_STRING_CHARS: usize = 1024;
pub const BIG_INFO_STRING: usize = 8192;
pub const MAX_INFO_STRING: usize = 1024;
pub const MAX_CONFIGSTRINGS: usize = 1024;
pub const MAX_GENTITIES: u16 = 1024;

pub const PACKET_BACKUP: usize = 32;
pub const PACKET_MASK: usize = PACKET_BACKUP - 1;
pub const MAX_PACKET_USERCMDS: usize = 32;

pub const MAX_DOWNLOAD_WINDOW: usize = 8;
pub const MAX_DOWNLOAD_BLKSIZE: usize = 2048;

pub const MAX_VOIP_PACKET: usize = 1024;
pub const VOIP_QUEUE_LENGTH: usize = 64;

/// Config string slots with a fixed meaning
pub const CS_SERVERINFO: usize = 0;
pub const CS_SYSTEMINFO: usize = 1;

/// Client-to-server message ops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClcOp {
    Bad = 0,
    Nop = 1,
    Move = 2,
    MoveNoDelta = 3,
    ClientCommand = 4,
    Eof = 5,
    Extension = 6,
    Voip = 7,
}

impl TryFrom<u8> for ClcOp {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ClcOp::Bad,
            1 => ClcOp::Nop,
            2 => ClcOp::Move,
            3 => ClcOp::MoveNoDelta,
            4 => ClcOp::ClientCommand,
            5 => ClcOp::Eof,
            6 => ClcOp::Extension,
            7 => ClcOp::Voip,
            other => return Err(CodecError::UnknownOp(other)),
        })
    }
}

/// Server-to-client message ops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SvcOp {
    Bad = 0,
    Nop = 1,
    Gamestate = 2,
    ConfigString = 3,
    Baseline = 4,
    ServerCommand = 5,
    Download = 6,
    Snapshot = 7,
    Eof = 8,
    Extension = 9,
    Voip = 10,
}

impl TryFrom<u8> for SvcOp {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => SvcOp::Bad,
            1 => SvcOp::Nop,
            2 => SvcOp::Gamestate,
            3 => SvcOp::ConfigString,
            4 => SvcOp::Baseline,
            5 => SvcOp::ServerCommand,
            6 => SvcOp::Download,
            7 => SvcOp::Snapshot,
            8 => SvcOp::Eof,
            9 => SvcOp::Extension,
            10 => SvcOp::Voip,
            other => return Err(CodecError::UnknownOp(other)),
        })
    }
}
