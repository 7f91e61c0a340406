//! Reader for server-to-client messages.
//!
//! The server only ever writes these; the reader exists for the bundled test
//! client and for tests that need to look inside what the server sent.

use crate::delta::{read_delta_entity, EntityDelta, EntityState};
use crate::msg::{CodecError, MsgReader, Result};
use crate::SvcOp;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gamestate {
    pub reliable_sequence: i32,
    pub configstrings: Vec<(u16, String)>,
    pub baselines: Vec<EntityState>,
    pub client_num: i32,
    pub checksum_feed: i32,
}

impl Gamestate {
    pub fn configstring(&self, index: u16) -> Option<&str> {
        self.configstrings
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, s)| s.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub server_time: i32,
    pub delta_num: u8,
}

/// One download block, or the error that ended the transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadBlock {
    pub block: i16,
    /// Total file size, sent with block zero only; -1 marks an error block
    pub size: Option<i32>,
    pub data: Vec<u8>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    pub sender: i16,
    pub generation: u8,
    pub sequence: i32,
    pub frames: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerMessage {
    pub last_client_command: i32,
    pub commands: Vec<(i32, String)>,
    pub gamestate: Option<Gamestate>,
    pub snapshot: Option<SnapshotHeader>,
    pub downloads: Vec<DownloadBlock>,
    pub voice: Vec<VoicePacket>,
}

fn read_gamestate(msg: &mut MsgReader<'_>) -> Result<Gamestate> {
    let mut gamestate = Gamestate {
        reliable_sequence: msg.read_i32()?,
        ..Default::default()
    };
    loop {
        match SvcOp::try_from(msg.read_u8()?)? {
            SvcOp::ConfigString => {
                let index = msg.read_u16()?;
                gamestate.configstrings.push((index, msg.read_big_string()?));
            }
            SvcOp::Baseline => {
                if let EntityDelta::Updated(state) = read_delta_entity(msg, &EntityState::default())? {
                    gamestate.baselines.push(state);
                }
            }
            SvcOp::Eof => break,
            other => return Err(CodecError::UnknownOp(other as u8)),
        }
    }
    gamestate.client_num = msg.read_i32()?;
    gamestate.checksum_feed = msg.read_i32()?;
    Ok(gamestate)
}

fn read_download(msg: &mut MsgReader<'_>) -> Result<DownloadBlock> {
    let block = msg.read_i16()?;
    let mut size = None;
    if block == 0 {
        let declared = msg.read_i32()?;
        size = Some(declared);
        if declared < 0 {
            return Ok(DownloadBlock {
                block,
                size,
                data: Vec::new(),
                error: Some(msg.read_string()?),
            });
        }
    }
    let len = msg.read_u16()? as usize;
    Ok(DownloadBlock {
        block,
        size,
        data: msg.read_bytes(len)?.to_vec(),
        error: None,
    })
}

fn read_voice(msg: &mut MsgReader<'_>) -> Result<VoicePacket> {
    let sender = msg.read_i16()?;
    let generation = msg.read_u8()?;
    let sequence = msg.read_i32()?;
    let frames = msg.read_u8()?;
    let len = msg.read_u16()? as usize;
    Ok(VoicePacket {
        sender,
        generation,
        sequence,
        frames,
        data: msg.read_bytes(len)?.to_vec(),
    })
}

/// Decodes a complete server message
pub fn parse_server_message(data: &[u8]) -> Result<ServerMessage> {
    let mut msg = MsgReader::new(data);
    let mut out = ServerMessage {
        last_client_command: msg.read_i32()?,
        ..Default::default()
    };

    loop {
        match SvcOp::try_from(msg.read_u8()?)? {
            SvcOp::Nop => {}
            SvcOp::ServerCommand => {
                let sequence = msg.read_i32()?;
                out.commands.push((sequence, msg.read_string()?));
            }
            SvcOp::Gamestate => out.gamestate = Some(read_gamestate(&mut msg)?),
            SvcOp::Snapshot => {
                out.snapshot = Some(SnapshotHeader {
                    server_time: msg.read_i32()?,
                    delta_num: msg.read_u8()?,
                });
            }
            SvcOp::Download => out.downloads.push(read_download(&mut msg)?),
            SvcOp::Eof => {
                // Extensions hide behind an end marker so older readers stop here
                if msg.rest().first() != Some(&(SvcOp::Extension as u8)) {
                    break;
                }
                msg.read_u8()?;
                match SvcOp::try_from(msg.read_u8()?)? {
                    SvcOp::Voip => out.voice.push(read_voice(&mut msg)?),
                    other => return Err(CodecError::UnknownOp(other as u8)),
                }
            }
            other => return Err(CodecError::UnknownOp(other as u8)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::MsgWriter;
    use crate::MAX_MSGLEN;

    #[test]
    fn test_commands_and_snapshot() {
        let mut msg = MsgWriter::new(MAX_MSGLEN);
        msg.write_i32(7).unwrap();
        msg.write_u8(SvcOp::ServerCommand as u8).unwrap();
        msg.write_i32(3).unwrap();
        msg.write_string("print \"hi\"").unwrap();
        msg.write_u8(SvcOp::Snapshot as u8).unwrap();
        msg.write_i32(1500).unwrap();
        msg.write_u8(0).unwrap();
        msg.write_u8(SvcOp::Eof as u8).unwrap();

        let parsed = parse_server_message(msg.as_bytes()).unwrap();
        assert_eq!(parsed.last_client_command, 7);
        assert_eq!(parsed.commands, vec![(3, "print \"hi\"".to_string())]);
        assert_eq!(parsed.snapshot.unwrap().server_time, 1500);
    }

    #[test]
    fn test_error_block() {
        let mut msg = MsgWriter::new(MAX_MSGLEN);
        msg.write_i32(0).unwrap();
        msg.write_u8(SvcOp::Download as u8).unwrap();
        msg.write_i16(0).unwrap();
        msg.write_i32(-1).unwrap();
        msg.write_string("nope").unwrap();
        msg.write_u8(SvcOp::Eof as u8).unwrap();

        let parsed = parse_server_message(msg.as_bytes()).unwrap();
        assert_eq!(parsed.downloads.len(), 1);
        assert_eq!(parsed.downloads[0].size, Some(-1));
        assert_eq!(parsed.downloads[0].error.as_deref(), Some("nope"));
    }

    #[test]
    fn test_voice_after_end_marker() {
        let mut msg = MsgWriter::new(MAX_MSGLEN);
        msg.write_i32(0).unwrap();
        msg.write_u8(SvcOp::Eof as u8).unwrap();
        msg.write_u8(SvcOp::Extension as u8).unwrap();
        msg.write_u8(SvcOp::Voip as u8).unwrap();
        msg.write_i16(2).unwrap();
        msg.write_u8(1).unwrap();
        msg.write_i32(40).unwrap();
        msg.write_u8(3).unwrap();
        msg.write_u16(2).unwrap();
        msg.write_bytes(&[9, 9]).unwrap();
        msg.write_u8(SvcOp::Eof as u8).unwrap();

        let parsed = parse_server_message(msg.as_bytes()).unwrap();
        assert_eq!(parsed.voice.len(), 1);
        assert_eq!(parsed.voice[0].sender, 2);
        assert_eq!(parsed.voice[0].data, vec![9, 9]);
    }

    #[test]
    fn test_truncated_message() {
        let mut msg = MsgWriter::new(MAX_MSGLEN);
        msg.write_i32(0).unwrap();
        msg.write_u8(SvcOp::ServerCommand as u8).unwrap();
        msg.write_i32(1).unwrap();

        assert!(matches!(
            parse_server_message(msg.as_bytes()),
            Err(CodecError::Truncated { .. })
        ));
    }
}
