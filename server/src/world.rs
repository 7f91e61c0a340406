//! Map-lifetime state shared by every session: server id, checksum feed,
//! config strings and entity baselines.

use crate::config::ServerConfig;
use rand::Rng;
use shared::{EntityState, InfoString, BIG_INFO_STRING};
use shared::{MAX_CONFIGSTRINGS, PROTOCOL_VERSION};
use std::str::FromStr;

/// A pak file the current map references, with its pure checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PakRef {
    pub name: String,
    pub checksum: i32,
}

impl FromStr for PakRef {
    type Err = String;

    /// Parses `name` or `name:checksum`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, checksum) = match s.rsplit_once(':') {
            Some((name, sum)) => (
                name,
                sum.parse::<i32>()
                    .map_err(|e| format!("bad checksum in {}: {}", s, e))?,
            ),
            None => (s, 0),
        };
        if name.is_empty() {
            return Err(format!("empty pak name in {:?}", s));
        }
        Ok(Self {
            name: name.to_string(),
            checksum,
        })
    }
}

/// Checksums a pure server expects clients to have loaded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PureManifest {
    pub cgame_checksum: i32,
    pub ui_checksum: i32,
    pub paks: Vec<PakRef>,
}

impl PureManifest {
    pub fn pak_checksums(&self) -> Vec<i32> {
        self.paks.iter().map(|p| p.checksum).collect()
    }

    /// True if `name` (with or without `.pk3`) is one of the referenced paks
    pub fn references(&self, name: &str) -> bool {
        let stem = name
            .strip_suffix(".pk3")
            .or_else(|| name.strip_suffix(".PK3"))
            .unwrap_or(name);
        self.paks.iter().any(|p| p.name.eq_ignore_ascii_case(stem))
    }
}

#[derive(Debug, Clone)]
pub struct WorldState {
    pub map_name: String,
    /// Changes on every map load or restart
    pub server_id: i32,
    /// Id from before the last restart; clients still on it are tolerated
    pub restarted_server_id: i32,
    pub checksum_feed: i32,
    /// Server id current when the checksum feed was drawn
    pub feed_server_id: i32,
    /// Simulation clock in milliseconds
    pub time: u64,
    pub cheats: bool,
    /// Server time of the last `callvote cyclemap` on this map
    pub last_cyclemap_vote: Option<u64>,
    pub manifest: PureManifest,
    configstrings: Vec<String>,
    baselines: Vec<EntityState>,
}

impl WorldState {
    pub fn new(manifest: PureManifest) -> Self {
        Self {
            map_name: String::new(),
            server_id: 0,
            restarted_server_id: 0,
            checksum_feed: 0,
            feed_server_id: 0,
            time: 0,
            cheats: false,
            last_cyclemap_vote: None,
            manifest,
            configstrings: vec![String::new(); MAX_CONFIGSTRINGS],
            baselines: Vec::new(),
        }
    }

    /// Loads `map` with fresh identifiers and cleared config strings
    pub fn spawn<R: Rng>(&mut self, map: &str, cheats: bool, rng: &mut R) {
        self.map_name = map.to_string();
        self.cheats = cheats;
        self.last_cyclemap_vote = None;
        self.server_id = self.server_id.wrapping_add(rng.gen_range(1..=0xffff)) & 0x7fff_ffff;
        self.restarted_server_id = self.server_id;
        self.checksum_feed = (rng.gen::<i32>() << 16) ^ rng.gen::<i32>();
        self.feed_server_id = self.server_id;
        self.configstrings.iter_mut().for_each(String::clear);
        self.baselines.clear();
    }

    /// Restarts the current map in place; clients on the old id are not forced to reload
    pub fn restart(&mut self) {
        self.restarted_server_id = self.server_id;
        self.server_id = self.server_id.wrapping_add(1) & 0x7fff_ffff;
    }

    /// True for ids handed out before the last restart of the current map
    pub fn is_pre_restart_id(&self, server_id: i32) -> bool {
        server_id >= self.restarted_server_id && server_id < self.server_id
    }

    pub fn configstring(&self, index: usize) -> &str {
        self.configstrings.get(index).map(String::as_str).unwrap_or("")
    }

    /// Stores a config string; returns true when the value actually changed
    pub fn set_configstring(&mut self, index: usize, value: &str) -> bool {
        match self.configstrings.get_mut(index) {
            Some(slot) if slot != value => {
                *slot = value.to_string();
                true
            }
            _ => false,
        }
    }

    /// Non-empty config strings in index order
    pub fn configstrings(&self) -> impl Iterator<Item = (usize, &str)> {
        self.configstrings
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_empty())
            .map(|(i, s)| (i, s.as_str()))
    }

    pub fn set_baselines(&mut self, baselines: Vec<EntityState>) {
        self.baselines = baselines;
    }

    pub fn baselines(&self) -> &[EntityState] {
        &self.baselines
    }

    /// Key/value description answered to browsers and stored in the first config string
    pub fn serverinfo(&self, config: &ServerConfig) -> InfoString {
        let mut info = InfoString::with_limit(BIG_INFO_STRING);
        let pairs = [
            ("sv_hostname", config.hostname.clone()),
            ("mapname", self.map_name.clone()),
            ("sv_maxclients", config.public_slots().to_string()),
            ("g_gametype", config.gametype.to_string()),
            ("protocol", PROTOCOL_VERSION.to_string()),
            ("gamename", config.game.clone()),
            ("g_modversion", config.mod_version.clone()),
            ("g_needpass", (config.needs_password() as i32).to_string()),
            ("sv_minPing", config.min_ping.to_string()),
            ("sv_maxPing", config.max_ping.to_string()),
            ("sv_floodProtect", (config.flood_protect as i32).to_string()),
            ("sv_allowDownload", (config.allow_download as i32).to_string()),
        ];
        for (key, value) in pairs.iter() {
            // Operator-provided values with separators are dropped rather than corrupting the blob
            let _ = info.set(key, value);
        }
        info
    }

    /// Settings every client must mirror, stored in the second config string
    pub fn systeminfo(&self, config: &ServerConfig) -> InfoString {
        let join_sums = |paks: &[PakRef]| {
            paks.iter()
                .map(|p| p.checksum.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        let join_names = |paks: &[PakRef]| {
            paks.iter()
                .map(|p| p.name.clone())
                .collect::<Vec<_>>()
                .join(" ")
        };

        let mut info = InfoString::with_limit(BIG_INFO_STRING);
        let pure = config.pure && !self.manifest.paks.is_empty();
        let pairs = [
            ("sv_serverid", self.server_id.to_string()),
            ("sv_pure", (pure as i32).to_string()),
            ("sv_cheats", (self.cheats as i32).to_string()),
            ("sv_paks", if pure { join_sums(&self.manifest.paks) } else { String::new() }),
            ("sv_pakNames", if pure { join_names(&self.manifest.paks) } else { String::new() }),
            ("sv_referencedPaks", join_sums(&self.manifest.paks)),
            ("sv_referencedPakNames", join_names(&self.manifest.paks)),
        ];
        for (key, value) in pairs.iter() {
            let _ = info.set(key, value);
        }
        info
    }
}
