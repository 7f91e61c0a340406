//! Windowed file transfer to clients.
//!
//! Files go out in fixed-size blocks. At most [`MAX_DOWNLOAD_WINDOW`] blocks are
//! read ahead of the client's acknowledgement cursor; the client acknowledges
//! blocks strictly in order with `nextdl`. When nothing new has been acked for a
//! second the transmit cursor rewinds to the acknowledgement cursor and the
//! whole window goes out again. A zero-length block marks the end of the file.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::world::PureManifest;
use log::{debug, info};
use shared::{MsgWriter, SvcOp, MAX_DOWNLOAD_BLKSIZE, MAX_DOWNLOAD_WINDOW};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// Milliseconds without an acknowledgement before the window is resent
pub const DOWNLOAD_RESEND_MS: u64 = 1000;

/// Result of a `nextdl` acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The cursor moved on by one block
    Advanced,
    /// The end-of-file block was acknowledged
    Finished,
    /// The client acknowledged a block out of order
    Broken,
}

/// An in-flight transfer, or one that failed and still owes the client an error block
#[derive(Debug)]
pub struct Download {
    pub name: String,
    file: Option<File>,
    error: Option<String>,
    pub size: u64,
    /// Bytes read from the file so far
    pub count: u64,
    blocks: Vec<Vec<u8>>,
    /// Blocks read into the window
    pub current_block: i32,
    /// Next block the client expects
    pub client_block: i32,
    /// Next block to transmit
    pub xmit_block: i32,
    pub eof: bool,
    pub send_time: u64,
}

impl Download {
    /// Opens `path` for transfer under the client-visible `name`
    pub fn open(name: &str, path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        info!("Starting download of {} ({} bytes)", name, size);
        Ok(Self {
            file: Some(file),
            size,
            ..Self::empty(name)
        })
    }

    /// A refused transfer; the scheduler sends `reason` once and discards it
    pub fn failed(name: &str, reason: String) -> Self {
        Self {
            error: Some(reason),
            ..Self::empty(name)
        }
    }

    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            file: None,
            error: None,
            size: 0,
            count: 0,
            blocks: vec![Vec::new(); MAX_DOWNLOAD_WINDOW],
            current_block: 0,
            client_block: 0,
            xmit_block: 0,
            eof: false,
            send_time: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Blocks sent but not yet acknowledged
    pub fn in_flight(&self) -> i32 {
        self.xmit_block - self.client_block
    }

    /// Handles `nextdl <block>`
    pub fn acknowledge(&mut self, block: i32, now: u64) -> AckOutcome {
        if block != self.client_block || block >= self.current_block {
            return AckOutcome::Broken;
        }
        if self.eof && block == self.current_block - 1 {
            return AckOutcome::Finished;
        }
        self.send_time = now;
        self.client_block += 1;
        AckOutcome::Advanced
    }

    /// Reads ahead until the window is full or the file is exhausted
    fn fill_window(&mut self) -> Result<()> {
        let window = MAX_DOWNLOAD_WINDOW as i32;
        while self.current_block - self.client_block < window && self.count < self.size {
            let Some(file) = self.file.as_mut() else {
                break;
            };
            let index = self.current_block as usize % MAX_DOWNLOAD_WINDOW;
            let want = (self.size - self.count).min(MAX_DOWNLOAD_BLKSIZE as u64) as usize;
            let buffer = &mut self.blocks[index];
            buffer.resize(want, 0);
            file.read_exact(buffer)?;
            self.count += want as u64;
            self.current_block += 1;
        }

        if self.count == self.size && !self.eof && self.current_block - self.client_block < window {
            let index = self.current_block as usize % MAX_DOWNLOAD_WINDOW;
            self.blocks[index].clear();
            self.current_block += 1;
            self.eof = true;
        }
        Ok(())
    }

    /// Writes up to `max_blocks` blocks into `msg`; returns how many went out.
    ///
    /// A failed transfer writes its error block instead and reports one block.
    pub fn write_blocks(&mut self, msg: &mut MsgWriter, now: u64, max_blocks: usize) -> Result<usize> {
        if let Some(reason) = self.error.as_ref() {
            // Header, length-prefixed reason and the end marker that follows
            if msg.remaining() < 1 + 2 + 4 + 2 + reason.len() + 1 {
                return Ok(0);
            }
            let reason = self.error.take().unwrap_or_default();
            msg.write_u8(SvcOp::Download as u8)?;
            msg.write_i16(0)?;
            msg.write_i32(-1)?;
            msg.write_string(&reason)?;
            return Ok(1);
        }

        self.fill_window()?;

        let mut written = 0;
        while written < max_blocks.max(1) {
            if self.client_block == self.current_block {
                break;
            }
            if self.xmit_block == self.current_block {
                if now.saturating_sub(self.send_time) > DOWNLOAD_RESEND_MS {
                    debug!("Resending {} from block {}", self.name, self.client_block);
                    self.xmit_block = self.client_block;
                } else {
                    break;
                }
            }

            let block = &self.blocks[self.xmit_block as usize % MAX_DOWNLOAD_WINDOW];
            // Leaves room for the end marker
            let needed = 1 + 2 + 4 + 2 + block.len() + 1;
            if msg.remaining() < needed {
                break;
            }
            msg.write_u8(SvcOp::Download as u8)?;
            msg.write_i16(self.xmit_block as i16)?;
            if self.xmit_block == 0 {
                msg.write_i32(self.size as i32)?;
            }
            msg.write_u16(block.len() as u16)?;
            msg.write_bytes(block)?;

            self.xmit_block += 1;
            self.send_time = now;
            written += 1;
        }
        Ok(written)
    }
}

/// Blocks a client can take per snapshot at its configured rate, at least one
pub fn blocks_per_snap(rate: u32, snapshot_msec: u32) -> usize {
    let blk = MAX_DOWNLOAD_BLKSIZE as u64;
    let per_snap = (rate as u64 * snapshot_msec as u64 / 1000 + blk) / blk;
    per_snap.max(1) as usize
}

fn is_safe_relative(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && !name.contains('\\')
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Decides whether `name` may be served and where it lives.
///
/// The error string is the text shown to the client.
pub fn resolve_download(
    config: &ServerConfig,
    manifest: &PureManifest,
    name: &str,
) -> std::result::Result<PathBuf, String> {
    let not_found = || format!("File \"{}\" not found on server for autodownloading.\n", name);

    if !is_safe_relative(name) || !name.to_ascii_lowercase().ends_with(".pk3") {
        return Err(not_found());
    }
    if !manifest.references(name) {
        return Err(not_found());
    }

    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    if config
        .protected_assets
        .iter()
        .any(|p| p.eq_ignore_ascii_case(stem))
    {
        return Err(format!("Cannot autodownload official pk3 file \"{}\"", name));
    }

    if !config.allow_download {
        return Err(format!(
            "Could not download \"{}\" because autodownloading is disabled on the server.\n\n\
             You will need to get this file elsewhere before you can connect to this pure server.\n",
            name
        ));
    }

    let path = config.download_root.join(name);
    if !path.is_file() {
        return Err(not_found());
    }
    Ok(path)
}

/// Starts a transfer, turning any refusal into a pending error block
pub fn begin_download(config: &ServerConfig, manifest: &PureManifest, name: &str) -> Download {
    match resolve_download(config, manifest, name) {
        Ok(path) => Download::open(name, &path)
            .unwrap_or_else(|e| Download::failed(name, format!("Could not read \"{}\": {}\n", name, e))),
        Err(reason) => {
            debug!("Refusing download of {:?}: {}", name, reason.trim_end());
            Download::failed(name, reason)
        }
    }
}
