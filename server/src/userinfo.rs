//! Derives cached session fields from a client's userinfo blob.

use crate::client_manager::Client;
use crate::config::{ServerConfig, DEFAULT_RATE, DEFAULT_SNAPSHOT_MSEC};
use thiserror::Error;

/// Longest sanitised name
pub const MAX_SANITIZED_NAME: usize = 20;
/// Longest name kept on the session
pub const MAX_NAME_LENGTH: usize = 32;
pub const UNNAMED_PLAYER: &str = "UnnamedPlayer";

/// Why a userinfo blob was refused.
///
/// `Display` is the text printed to a peer that is still connecting;
/// [`UserinfoError::drop_reason`] is used for sessions already in the table.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserinfoError {
    #[error("Illegal characters in userinfo string.")]
    IllegalCharacters,

    #[error("Illegal characters in player name.")]
    IllegalName,

    #[error("Userinfo overflow.")]
    Overflow,

    #[error("Invalid client identifier.")]
    InvalidGuid,
}

impl UserinfoError {
    pub fn drop_reason(&self) -> &'static str {
        match self {
            UserinfoError::IllegalCharacters => "illegal characters in userinfo",
            UserinfoError::IllegalName => "illegal characters in player name",
            UserinfoError::Overflow => "userinfo string length exceeded",
            UserinfoError::InvalidGuid => "Invalid client identifier.",
        }
    }
}

/// Leading decimal integer of `s`, 0 when there is none
pub fn atoi(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| acc.saturating_mul(10).saturating_add((d - b'0') as i64));
    if negative {
        -value
    } else {
        value
    }
}

/// Reduces a raw name to what the game shows.
///
/// Whitespace, control characters and DEL are stripped before colour escapes
/// are interpreted, so `"^ 7W"` becomes `"W"`. Characters that can only
/// appear in a handcrafted packet make the whole name invalid.
pub fn sanitize_name(raw: &str) -> Result<String, UserinfoError> {
    let mut out = String::new();
    let mut gobble = false;

    for c in raw.chars() {
        let code = c as u32;
        if code >= 0x80 || matches!(c, '\u{1b}' | '"' | '%' | ';' | '\\') {
            return Err(UserinfoError::IllegalName);
        }
        if out.len() == MAX_SANITIZED_NAME {
            // Keep scanning for illegal characters only
            continue;
        }
        match c {
            '^' => gobble = !gobble,
            _ if code <= 0x20 || code >= 0x7e => {}
            c => {
                if gobble {
                    gobble = false;
                } else {
                    out.push(c);
                }
            }
        }
    }

    if out.is_empty() {
        out.push_str(UNNAMED_PLAYER);
    }
    Ok(out)
}

/// A `cl_guid` must be 32 upper-case hexadecimal characters
pub fn is_valid_guid(guid: &str) -> bool {
    guid.len() == 32 && guid.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

/// Recomputes name, rate, snapshot interval and voice support from
/// `client.userinfo`, forcing the server-owned keys back in.
pub fn apply_userinfo(client: &mut Client, config: &ServerConfig) -> Result<(), UserinfoError> {
    let info = &mut client.userinfo;

    if client.location.is_empty() {
        info.remove("location");
    }

    if config.sanitize_names {
        let name = sanitize_name(info.get("name"))?;
        info.set("name", &name).map_err(|_| UserinfoError::Overflow)?;
    }
    client.name = info.get("name").chars().take(MAX_NAME_LENGTH).collect();

    client.rate = if client.is_lan && config.lan_force_rate {
        config.max_rate
    } else {
        match info.get("rate") {
            "" => DEFAULT_RATE,
            rate => atoi(rate).clamp(config.min_rate as i64, config.max_rate as i64) as u32,
        }
    };

    let handicap = info.get("handicap");
    if !handicap.is_empty() {
        let value = atoi(handicap);
        if value <= 0 || value > 100 || handicap.len() > 4 {
            info.set("handicap", "100").map_err(|_| UserinfoError::Overflow)?;
        }
    }

    client.snapshot_msec = match info.get("snaps") {
        "" => DEFAULT_SNAPSHOT_MSEC,
        snaps => 1000 / atoi(snaps).clamp(1, config.sv_fps as i64) as u32,
    };

    client.voice.enabled = atoi(info.get("cl_voip")) == 1;

    let ip = match client.netchan.as_ref().map(|n| n.remote()) {
        Some(addr) if addr.ip().is_loopback() => "localhost".to_string(),
        Some(addr) => addr.to_string(),
        None => String::new(),
    };
    if !ip.is_empty() {
        info.set("ip", &ip).map_err(|_| UserinfoError::Overflow)?;
    }

    if !client.location.is_empty() {
        info.set("location", &client.location)
            .map_err(|_| UserinfoError::Overflow)?;
    }

    if config.require_valid_guid && !client.is_bot && !client.is_lan && !is_valid_guid(info.get("cl_guid")) {
        return Err(UserinfoError::InvalidGuid);
    }
    Ok(())
}
