//! Writer for client-to-server messages.
//!
//! The server only reads these. The writer is what the bundled test client
//! speaks, and it lets tests build well-formed messages without repeating the
//! header layout.

use crate::delta::{hash_key, write_delta_usercmd, UserCmd};
use crate::msg::{MsgWriter, Result};
use crate::{ClcOp, MAX_MSGLEN};

/// Key that obscures movement commands sent after acknowledging
/// `message_ack` and the server command `last_command`
pub fn move_key(checksum_feed: i32, message_ack: i32, last_command: &str) -> i32 {
    checksum_feed ^ message_ack ^ hash_key(last_command, 32)
}

/// Builder for one client message; [`ClientMessage::finish`] appends the end marker
#[derive(Debug, Clone)]
pub struct ClientMessage {
    msg: MsgWriter,
}

impl ClientMessage {
    pub fn new(server_id: i32, message_ack: i32, reliable_ack: i32) -> Result<Self> {
        let mut msg = MsgWriter::new(MAX_MSGLEN);
        msg.write_i32(server_id)?;
        msg.write_i32(message_ack)?;
        msg.write_i32(reliable_ack)?;
        Ok(Self { msg })
    }

    pub fn command(&mut self, sequence: i32, text: &str) -> Result<&mut Self> {
        self.msg.write_u8(ClcOp::ClientCommand as u8)?;
        self.msg.write_i32(sequence)?;
        self.msg.write_string(text)?;
        Ok(self)
    }

    /// Appends a batch of movement commands, each delta-encoded against the previous one.
    ///
    /// `delta` selects `move` over `moveNoDelta`, which only changes whether the
    /// server may delta-compress the next snapshot.
    pub fn moves(&mut self, key: i32, cmds: &[UserCmd], delta: bool) -> Result<&mut Self> {
        let op = if delta { ClcOp::Move } else { ClcOp::MoveNoDelta };
        self.msg.write_u8(op as u8)?;
        self.msg.write_u8(cmds.len() as u8)?;
        let mut previous = UserCmd::default();
        for cmd in cmds {
            write_delta_usercmd(&mut self.msg, key, &previous, cmd)?;
            previous = *cmd;
        }
        Ok(self)
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.msg.write_u8(ClcOp::Eof as u8)?;
        Ok(self.msg.into_bytes())
    }
}
