//! Subnet bans and exceptions.
//!
//! An address is banned when it falls inside any ban subnet and inside no
//! exception subnet. The list survives map changes and is saved to disk after
//! every edit.

use crate::error::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub addr: IpAddr,
    /// Number of leading bits that must match
    pub prefix: u8,
    pub exception: bool,
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn octets(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

impl BanEntry {
    pub fn ban(addr: IpAddr, prefix: u8) -> Self {
        Self {
            addr,
            prefix: prefix.min(max_prefix(&addr)),
            exception: false,
        }
    }

    pub fn exception(addr: IpAddr, prefix: u8) -> Self {
        Self {
            exception: true,
            ..Self::ban(addr, prefix)
        }
    }

    /// True if `ip` lies inside this entry's subnet
    pub fn matches(&self, ip: IpAddr) -> bool {
        if self.addr.is_ipv4() != ip.is_ipv4() {
            return false;
        }
        let ours = octets(&self.addr);
        let theirs = octets(&ip);

        let mut bits = self.prefix as usize;
        let mut index = 0;
        while bits > 7 {
            if ours[index] != theirs[index] {
                return false;
            }
            bits -= 8;
            index += 1;
        }
        if bits > 0 {
            let mask = 0xffu8 << (8 - bits);
            if ours[index] & mask != theirs[index] & mask {
                return false;
            }
        }
        true
    }

    /// Same subnet, ignoring host bits beyond the prefix
    fn same_subnet(&self, other: &BanEntry) -> bool {
        self.prefix == other.prefix && self.exception == other.exception && self.matches(other.addr)
    }
}

impl FromStr for BanEntry {
    type Err = String;

    /// Parses `a.b.c.d` or `a.b.c.d/bits` as a ban
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, bits)) => (addr, Some(bits)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| format!("bad address {:?}: {}", addr, e))?;
        let prefix = match prefix {
            Some(bits) => bits
                .parse::<u8>()
                .map_err(|e| format!("bad prefix {:?}: {}", bits, e))?,
            None => max_prefix(&addr),
        };
        if prefix > max_prefix(&addr) {
            return Err(format!("prefix /{} too long for {}", prefix, addr));
        }
        Ok(BanEntry::ban(addr, prefix))
    }
}

impl fmt::Display for BanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{}",
            self.addr,
            self.prefix,
            if self.exception { " (exception)" } else { "" }
        )
    }
}

/// Ordered ban and exception list with optional on-disk persistence
#[derive(Debug, Default)]
pub struct BanList {
    entries: Vec<BanEntry>,
    path: Option<PathBuf>,
}

impl BanList {
    /// In-memory list
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the list from `path`; a missing or unreadable file yields an empty list
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match bincode::deserialize::<Vec<BanEntry>>(&bytes) {
                Ok(entries) => {
                    info!("Loaded {} ban entries from {}", entries.len(), path.display());
                    entries
                }
                Err(e) => {
                    warn!("Ignoring corrupt ban file {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("Could not read ban file {}: {}", path.display(), e);
                Vec::new()
            }
        };
        Self {
            entries,
            path: Some(path),
        }
    }

    pub fn entries(&self) -> &[BanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exceptions are consulted first and override any ban
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        if self
            .entries
            .iter()
            .any(|e| e.exception && e.matches(ip))
        {
            return false;
        }
        self.entries.iter().any(|e| !e.exception && e.matches(ip))
    }

    /// Adds an entry unless the same subnet is already listed; returns true if added
    pub fn add(&mut self, entry: BanEntry) -> Result<bool> {
        if self.entries.iter().any(|e| e.same_subnet(&entry)) {
            return Ok(false);
        }
        self.entries.push(entry);
        self.save()?;
        Ok(true)
    }

    /// Removes entries covering the same subnet; returns how many were removed
    pub fn remove(&mut self, entry: &BanEntry) -> Result<usize> {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.prefix == entry.prefix && e.matches(entry.addr)));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let bytes = bincode::serialize(&self.entries)?;
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }
}
