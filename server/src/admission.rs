//! Bookkeeping for the pre-connection handshake.
//!
//! Four bounded tables live here, none of them persisted:
//! - [`ChallengePool`]: tokens handed out by `getchallenge`, proving a peer can
//!   receive at the address it claims
//! - [`ReceiptRing`]: recent `connect` attempts per address, for rate limiting
//! - [`DropLog`]: recent drops per address and qport, for reconnection cooldowns
//! - [`DrdosGuard`]: recent unauthenticated info queries, so the server cannot be
//!   used to reflect traffic at a spoofed victim
//!
//! Every table evicts its oldest entry when full instead of growing.

use log::warn;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const MAX_CHALLENGES: usize = 1024;
/// How long an authorization server gets before we answer the challenge ourselves
pub const AUTHORIZE_TIMEOUT_MS: u64 = 5000;
/// Authorization queries sent per challenge before giving up on the service
pub const MAX_AUTHORIZE_REQUESTS: u32 = 2;

pub const MAX_CONNECT_RECEIPTS: usize = 256;
pub const CONNECT_WINDOW_MS: u64 = 6000;
pub const CONNECT_LIMIT: usize = 4;

pub const MAX_DROP_RECEIPTS: usize = 64;

pub const MAX_INFO_RECEIPTS: usize = 48;
pub const INFO_WINDOW_MS: u64 = 2000;
pub const INFO_PER_SOURCE_LIMIT: usize = 3;

pub const KICK_REASON: &str = "was kicked";
pub const TEAMKILL_REASON: &str = "was kicked for team killing";

/// True for loopback, private and link-local addresses
pub fn is_lan_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Collapses an address to its /24 (IPv4) or /64 (IPv6) network
pub fn subnet_of(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 0))
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            IpAddr::V6(Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub addr: SocketAddr,
    pub token: i32,
    pub created: u64,
    /// When the token was sent to the peer
    pub ping_time: Option<u64>,
    /// Round trip measured on the first connect
    pub ping: u64,
    pub connected: bool,
    pub authorize_requests: u32,
}

/// Bounded pool of outstanding challenge tokens
#[derive(Debug)]
pub struct ChallengePool {
    records: Vec<ChallengeRecord>,
    capacity: usize,
}

impl ChallengePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the pending record for `addr`, creating one if needed.
    ///
    /// Records already used to connect are never reused, so a second client
    /// behind the same address gets its own token. A pending record older
    /// than `ttl_ms` is replaced with a fresh token. When the pool is full
    /// the oldest record is replaced.
    pub fn issue<R: Rng>(
        &mut self,
        addr: SocketAddr,
        now: u64,
        ttl_ms: u64,
        rng: &mut R,
    ) -> &mut ChallengeRecord {
        let existing = self
            .records
            .iter()
            .position(|r| !r.connected && r.addr == addr);

        let index = match existing {
            Some(index) if now.saturating_sub(self.records[index].created) <= ttl_ms => index,
            Some(index) => {
                self.records[index] = Self::fresh_record(addr, now, rng);
                index
            }
            None => {
                let record = Self::fresh_record(addr, now, rng);
                if self.records.len() < self.capacity {
                    self.records.push(record);
                    self.records.len() - 1
                } else {
                    let oldest = self
                        .records
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, r)| r.created)
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    self.records[oldest] = record;
                    oldest
                }
            }
        };
        &mut self.records[index]
    }

    fn fresh_record<R: Rng>(addr: SocketAddr, now: u64, rng: &mut R) -> ChallengeRecord {
        let token = loop {
            let candidate = rng.gen::<i32>() & 0x7fff_ffff;
            if candidate != 0 {
                break candidate;
            }
        };
        ChallengeRecord {
            addr,
            token,
            created: now,
            ping_time: None,
            ping: 0,
            connected: false,
            authorize_requests: 0,
        }
    }

    /// Record matching both the exact address and the token, if not expired
    pub fn validate(
        &mut self,
        addr: SocketAddr,
        token: i32,
        now: u64,
        ttl_ms: u64,
    ) -> Option<&mut ChallengeRecord> {
        self.records
            .iter_mut()
            .find(|r| r.addr == addr && r.token == token && now.saturating_sub(r.created) <= ttl_ms)
    }

    pub fn find_token_mut(&mut self, token: i32) -> Option<&mut ChallengeRecord> {
        self.records.iter_mut().find(|r| r.token == token)
    }

    pub fn remove_token(&mut self, token: i32) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.token != token);
        before != self.records.len()
    }
}

/// Fixed ring of `(address, time)` receipts
#[derive(Debug)]
pub struct ReceiptRing {
    entries: Vec<Option<(IpAddr, u64)>>,
}

impl ReceiptRing {
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![None; size.max(1)],
        }
    }

    /// Receipts from `ip` newer than `window_ms`
    pub fn count_recent(&self, ip: IpAddr, now: u64, window_ms: u64) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|(addr, time)| *addr == ip && now.saturating_sub(*time) < window_ms)
            .count()
    }

    /// Overwrites the oldest (or an empty) entry
    pub fn record(&mut self, ip: IpAddr, now: u64) {
        let oldest = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.map(|(_, t)| t + 1).unwrap_or(0))
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.entries[oldest] = Some((ip, now));
    }

    /// Counts an attempt and reports whether it is within the limit.
    ///
    /// Rejected attempts are not recorded.
    pub fn admit(&mut self, ip: IpAddr, now: u64, window_ms: u64, limit: usize) -> bool {
        if self.count_recent(ip, now, window_ms) + 1 > limit {
            return false;
        }
        self.record(ip, now);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropReceipt {
    pub ip: IpAddr,
    pub qport: u16,
    pub time: u64,
    pub wait_factor: u64,
}

/// Cooldown multiplier for the reason a session was dropped
pub fn wait_factor(reason: &str) -> u64 {
    match reason {
        TEAMKILL_REASON => 3,
        KICK_REASON => 2,
        _ => 1,
    }
}

/// Recent drops, consulted before letting the same peer back in
#[derive(Debug)]
pub struct DropLog {
    entries: Vec<Option<DropReceipt>>,
}

impl DropLog {
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![None; size.max(1)],
        }
    }

    pub fn record(&mut self, ip: IpAddr, qport: u16, reason: &str, now: u64) {
        let receipt = DropReceipt {
            ip,
            qport,
            time: now,
            wait_factor: wait_factor(reason),
        };
        let same = self
            .entries
            .iter()
            .position(|e| matches!(e, Some(r) if r.ip == ip && r.qport == qport));
        let index = same.unwrap_or_else(|| {
            self.entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.as_ref().map(|r| r.time + 1).unwrap_or(0))
                .map(|(i, _)| i)
                .unwrap_or(0)
        });
        self.entries[index] = Some(receipt);
    }

    /// Milliseconds left before this peer may reconnect, if any
    pub fn cooldown_remaining(&self, ip: IpAddr, qport: u16, now: u64, base_wait_secs: u64) -> Option<u64> {
        if base_wait_secs == 0 {
            return None;
        }
        self.entries
            .iter()
            .flatten()
            .filter(|r| r.ip == ip && r.qport == qport)
            .map(|r| r.time + r.wait_factor * base_wait_secs * 1000)
            .filter(|until| *until > now)
            .map(|until| until - now)
            .max()
    }
}

/// Throttles unauthenticated info queries per subnet and globally
#[derive(Debug)]
pub struct DrdosGuard {
    receipts: Vec<Option<(IpAddr, u64)>>,
    last_warning: Option<u64>,
}

impl DrdosGuard {
    pub fn new() -> Self {
        Self {
            receipts: vec![None; MAX_INFO_RECEIPTS],
            last_warning: None,
        }
    }

    /// Returns true if a query from `ip` should be dropped without a reply
    pub fn should_drop(&mut self, ip: IpAddr, now: u64) -> bool {
        if is_lan_address(ip) {
            return false;
        }
        let subnet = subnet_of(ip);

        let mut global = 0;
        let mut specific = 0;
        let mut oldest = 0;
        let mut oldest_time = u64::MAX;
        for (i, receipt) in self.receipts.iter().enumerate() {
            match receipt {
                Some((addr, time)) => {
                    if time + INFO_WINDOW_MS > now {
                        global += 1;
                        if *addr == subnet {
                            specific += 1;
                        }
                    }
                    if *time < oldest_time {
                        oldest_time = *time;
                        oldest = i;
                    }
                }
                None => {
                    if oldest_time != 0 {
                        oldest_time = 0;
                        oldest = i;
                    }
                }
            }
        }

        if global >= MAX_INFO_RECEIPTS {
            self.warn(now, format!("Too many info queries, dropping {}", ip));
            return true;
        }
        if specific >= INFO_PER_SOURCE_LIMIT {
            self.warn(now, format!("Possible reflection attack against {}", ip));
            return true;
        }

        self.receipts[oldest] = Some((subnet, now));
        false
    }

    fn warn(&mut self, now: u64, message: String) {
        let due = self
            .last_warning
            .map(|last| now.saturating_sub(last) >= 1000)
            .unwrap_or(true);
        if due {
            warn!("{}", message);
            self.last_warning = Some(now);
        }
    }
}

impl Default for DrdosGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// All pre-connection state, grouped so the engine can hand it around as one
#[derive(Debug)]
pub struct AdmissionGate {
    pub challenges: ChallengePool,
    pub connects: ReceiptRing,
    pub drops: DropLog,
    pub drdos: DrdosGuard,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self {
            challenges: ChallengePool::new(MAX_CHALLENGES),
            connects: ReceiptRing::new(MAX_CONNECT_RECEIPTS),
            drops: DropLog::new(MAX_DROP_RECEIPTS),
            drdos: DrdosGuard::new(),
        }
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}
