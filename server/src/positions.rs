//! Saved player positions and the goto mini-feature.
//!
//! Players can store where they stand on a map and return there later, or
//! jump to another player who allows it. Records are keyed by the player's
//! `cl_guid` and the map name and are rewritten to disk after every save.

use crate::engine::Engine;
use crate::error::Result;
use crate::game::{GameAction, GameModule, PlayerState, Team};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use shared::CommandArgs;
use std::path::PathBuf;

pub const MAX_SAVED_POSITIONS: usize = 1024;
/// Cap on the goto cooldown, in seconds
pub const MAX_GOTO_WAIT_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPosition {
    pub guid: String,
    pub map: String,
    pub origin: [f32; 3],
}

/// Bounded table of saved positions with optional on-disk persistence
#[derive(Debug, Default)]
pub struct PositionStore {
    records: Vec<SavedPosition>,
    path: Option<PathBuf>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the table from `path`; missing or corrupt files give an empty table
    pub fn load(path: PathBuf) -> Self {
        let records = match std::fs::read(&path) {
            Ok(bytes) => match bincode::deserialize::<Vec<SavedPosition>>(&bytes) {
                Ok(mut records) => {
                    records.truncate(MAX_SAVED_POSITIONS);
                    info!("Loaded {} saved positions from {}", records.len(), path.display());
                    records
                }
                Err(e) => {
                    warn!("Ignoring corrupt position file {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("Could not read position file {}: {}", path.display(), e);
                Vec::new()
            }
        };
        Self {
            records,
            path: Some(path),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Case-insensitive on both keys
    pub fn get(&self, guid: &str, map: &str) -> Option<&SavedPosition> {
        self.records
            .iter()
            .find(|r| r.guid.eq_ignore_ascii_case(guid) && r.map.eq_ignore_ascii_case(map))
    }

    /// Replaces the record for the same guid and map, or appends one.
    ///
    /// Returns `Ok(false)` when the table is full and the record is new.
    pub fn save(&mut self, record: SavedPosition) -> Result<bool> {
        let existing = self.records.iter().position(|r| {
            r.guid.eq_ignore_ascii_case(&record.guid) && r.map.eq_ignore_ascii_case(&record.map)
        });
        match existing {
            Some(index) => self.records[index].origin = record.origin,
            None if self.records.len() >= MAX_SAVED_POSITIONS => return Ok(false),
            None => self.records.push(record),
        }
        self.persist()?;
        Ok(true)
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let bytes = bincode::serialize(&self.records)?;
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }
}

/// Seconds shown to a player still waiting on a cooldown
fn seconds_left(until: u64, now: u64) -> u64 {
    (until - now) / 1000 + 1
}

impl<G: GameModule> Engine<G> {
    /// Player state of `slot` if the session is in the world
    fn in_game_state(&self, slot: usize) -> Option<PlayerState> {
        let client = self.clients.get(slot)?;
        if !client.in_world() {
            return None;
        }
        self.game.player_state(slot).cloned()
    }

    pub(crate) fn cmd_position_help(&mut self, slot: usize) {
        let load_note = if self.config.allow_positions { "" } else { " (currently disabled)" };
        let goto_note = if self.config.allow_goto { "" } else { " (currently disabled)" };
        let lines = [
            "^3The following are commands for save/load position and goto:".to_string(),
            "    ^3\\help   ^1-> ^7Show this list of commands".to_string(),
            "    ^3\\save   ^1-> ^7Save current position".to_string(),
            format!("    ^3\\load   ^1-> ^7Load saved position{}", load_note),
            "    ^3\\allowgoto   ^1 -> ^7Allow players to teleport where you are".to_string(),
            format!("    ^3\\goto ^4<client> ^1 ->^7 Goto another player{}", goto_note),
        ];
        for line in lines.iter() {
            self.print_to(slot, line);
        }
    }

    pub(crate) fn cmd_save_position(&mut self, slot: usize, args: &CommandArgs) {
        if !self.config.allow_positions {
            self.print_to(slot, "^7Save is disabled on server.");
            return;
        }
        let Some(state) = self.in_game_state(slot) else {
            self.print_to(slot, "^7You ^1must be alive and in-game ^7when saving your position.");
            return;
        };
        if state.team == Team::Spectator {
            self.print_to(slot, "^7You ^1can not be in spectators ^7when saving your position.");
            return;
        }
        if !state.is_alive() {
            self.print_to(slot, "^7You ^1must be alive and in-game ^7when saving your position.");
            return;
        }
        if args.argc() > 1 {
            self.print_to(slot, "^1Too many arguments ^7to saveposition command, none expected.");
            return;
        }
        if !state.on_ground {
            self.print_to(slot, "^7You ^1must be standing on solid ground ^7when saving your position.");
            return;
        }
        if !state.is_still() {
            self.print_to(slot, "^7You ^1must be standing still ^7when saving your position.");
            return;
        }

        let guid = self
            .clients
            .get(slot)
            .map(|c| c.userinfo.get("cl_guid").to_string())
            .unwrap_or_default();
        let record = SavedPosition {
            guid,
            map: self.world.map_name.clone(),
            origin: state.origin,
        };
        match self.positions.save(record) {
            Ok(true) => self.print_to(slot, "^7You ^2saved ^7your position."),
            Ok(false) => self.print_to(slot, "^1No more saving slots."),
            Err(e) => {
                error!("Failed to persist saved positions: {}", e);
                self.print_to(slot, "^7You ^2saved ^7your position.");
            }
        }
    }

    pub(crate) fn cmd_load_position(&mut self, slot: usize, args: &CommandArgs) {
        if !self.config.allow_positions {
            self.print_to(slot, "^7Load is ^1disabled ^7on server.");
            return;
        }
        let Some(state) = self.in_game_state(slot) else {
            self.print_to(slot, "^7You ^1must be alive^7 and in-game when loading your position.");
            return;
        };
        if state.team == Team::Spectator {
            self.print_to(slot, "^7You ^1can not be in spectators ^7when loading your position.");
            return;
        }
        if !state.is_alive() {
            self.print_to(slot, "^7You ^1must be alive^7 and in-game when loading your position.");
            return;
        }
        if args.argc() > 1 {
            self.print_to(slot, "^1Too many arguments ^7to loadposition command, none expected.");
            return;
        }

        let now = self.time;
        let Some(client) = self.clients.get(slot) else {
            return;
        };
        if let Some(last) = client.last_load_time {
            let until = last + self.config.load_position_wait_secs * 1000;
            if until > now {
                let message = format!(
                    "^7You ^1must wait ^5{} ^7seconds before loading saved position again.",
                    seconds_left(until, now)
                );
                self.print_to(slot, &message);
                return;
            }
        }

        let guid = client.userinfo.get("cl_guid");
        let Some(origin) = self.positions.get(guid, &self.world.map_name).map(|r| r.origin) else {
            self.print_to(slot, "^7You have ^1not saved ^7your position on this map.");
            return;
        };
        self.game.apply(slot, GameAction::Teleport(origin));
        if let Some(client) = self.clients.get_mut(slot) {
            client.last_load_time = Some(now);
        }
        self.print_to(slot, "^7You ^5loaded ^7your position.");
    }

    pub(crate) fn cmd_allow_goto(&mut self, slot: usize, args: &CommandArgs) {
        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        let explicit = if args.argc() == 2 {
            match args.argv(1) {
                "0" => Some(false),
                "1" => Some(true),
                _ => None,
            }
        } else {
            None
        };

        let message = match explicit {
            Some(false) => {
                client.allow_goto = false;
                "^7Players now are ^1not ^7allowed to ^6goto ^7to you."
            }
            Some(true) => {
                client.allow_goto = true;
                "^7Players now are ^1allowed ^7to ^6goto ^7to you."
            }
            None => {
                client.allow_goto = !client.allow_goto;
                if client.allow_goto {
                    "^7Players now are ^2allowed^7 to ^6goto ^7to you."
                } else {
                    "^7Players now are ^1not allowed^7 to ^6goto ^7to you."
                }
            }
        };
        self.print_to(slot, message);
    }

    pub(crate) fn cmd_goto(&mut self, slot: usize, args: &CommandArgs) {
        if !self.config.allow_goto {
            self.print_to(slot, "^7Goto is ^1disabled ^7on server.");
            return;
        }
        let Some(state) = self.in_game_state(slot) else {
            self.print_to(slot, "^7You ^1must be alive^7 and in-game when using goto.");
            return;
        };
        if state.team == Team::Spectator {
            self.print_to(slot, "^7You ^1cannot be in spectators ^7when using goto.");
            return;
        }
        if !state.is_alive() {
            self.print_to(slot, "^7You ^1must be alive^7 and in-game when using goto.");
            return;
        }
        if args.argc() > 2 {
            self.print_to(slot, "^1Too many arguments^7 in goto command.");
            return;
        }
        if args.argv(1).is_empty() {
            self.print_to(slot, "^7You ^1forgot to specify ^7a goto target client.");
            return;
        }

        let now = self.time;
        if let Some(last) = self.clients.get(slot).and_then(|c| c.last_goto_time) {
            let wait = self.config.goto_wait_secs.min(MAX_GOTO_WAIT_SECS);
            let until = last + wait * 1000;
            if until > now {
                let message = format!(
                    "^7You ^1must wait ^5{} ^7seconds before using goto again.",
                    seconds_left(until, now)
                );
                self.print_to(slot, &message);
                return;
            }
        }

        let target = match self.clients.lookup_by_handle(args.argv(1)) {
            Ok(target) => target,
            Err(_) => {
                self.print_to(slot, "^7You specified an ^1invalid goto target ^7client.");
                return;
            }
        };
        if target == slot {
            self.print_to(slot, "^7You ^1can not ^7goto yourself! LoL o_O");
            return;
        }
        let (target_name, target_allows) = match self.clients.get(target) {
            Some(c) => (c.name.clone(), c.allow_goto),
            None => return,
        };
        if !target_allows {
            self.print_to(slot, &format!("^3{} ^1does not ^7allow goto", target_name));
            return;
        }
        let target_state = self.in_game_state(target);
        match target_state {
            Some(s) if s.team == Team::Spectator => {
                self.print_to(slot, &format!("^3{} ^7is currently ^1in spectators^7.", target_name));
            }
            Some(s) if s.is_alive() => {
                self.game.apply(slot, GameAction::Teleport(s.origin));
                let my_name = match self.clients.get_mut(slot) {
                    Some(client) => {
                        client.last_goto_time = Some(now);
                        client.name.clone()
                    }
                    None => return,
                };
                self.print_to(slot, &format!("^7You ^6goted ^7to ^3{}", target_name));
                self.print_to(target, &format!("^3{} ^6goted ^7to you", my_name));
            }
            _ => {
                self.print_to(
                    slot,
                    &format!("^3{} ^1isn't currently alive or isn't in-game.", target_name),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::engine::tests::{active_engine, printed};
    use crate::game::ArenaGame;

    fn record(guid: &str, map: &str, x: f32) -> SavedPosition {
        SavedPosition {
            guid: guid.to_string(),
            map: map.to_string(),
            origin: [x, 0.0, 0.0],
        }
    }

    fn position_config() -> ServerConfig {
        ServerConfig {
            allow_positions: true,
            allow_goto: true,
            load_position_wait_secs: 10,
            goto_wait_secs: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_save_replaces_existing_record() {
        let mut store = PositionStore::new();
        assert!(store.save(record("AA", "ut4_abbey", 1.0)).unwrap());
        assert!(store.save(record("aa", "UT4_ABBEY", 2.0)).unwrap());

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("AA", "ut4_abbey").unwrap().origin[0], 2.0);
        assert!(store.get("AA", "ut4_casa").is_none());
    }

    #[test]
    fn test_store_is_capped() {
        let mut store = PositionStore::new();
        for i in 0..MAX_SAVED_POSITIONS {
            assert!(store.save(record(&i.to_string(), "map", 0.0)).unwrap());
        }
        assert!(!store.save(record("new", "map", 0.0)).unwrap());
        // Existing records can still be updated when full
        assert!(store.save(record("0", "map", 5.0)).unwrap());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.dat");

        let mut store = PositionStore::load(path.clone());
        store.save(record("GUID", "ut4_abbey", 12.5)).unwrap();

        let reloaded = PositionStore::load(path);
        assert_eq!(reloaded.get("GUID", "ut4_abbey"), Some(&record("GUID", "ut4_abbey", 12.5)));
    }

    #[test]
    fn test_save_and_load_through_commands() {
        let mut engine = active_engine(position_config(), &[("Runner", "GUIDA")]);
        engine
            .game_mut()
            .apply(0, GameAction::Teleport([100.0, 50.0, 0.0]));

        engine.cmd_save_position(0, &CommandArgs::tokenize("save"));
        assert!(printed(&engine, 0).iter().any(|l| l.contains("^2saved")));

        engine.game_mut().apply(0, GameAction::Teleport([0.0, 0.0, 0.0]));
        engine.cmd_load_position(0, &CommandArgs::tokenize("load"));

        let state = engine.game().player_state(0).unwrap();
        assert_eq!(state.origin, [100.0, 50.0, 0.0]);

        // Second load inside the cooldown is refused
        engine.cmd_load_position(0, &CommandArgs::tokenize("load"));
        assert!(printed(&engine, 0)
            .iter()
            .any(|l| l.contains("must wait ^511 ^7seconds")));
    }

    #[test]
    fn test_save_refused_while_moving() {
        let mut engine = active_engine(position_config(), &[("Runner", "GUIDA")]);
        let forward = shared::UserCmd {
            server_time: 100,
            forward_move: 127,
            ..Default::default()
        };
        engine.game_mut().on_client_think(0, &forward);

        engine.cmd_save_position(0, &CommandArgs::tokenize("save"));
        assert!(printed(&engine, 0).iter().any(|l| l.contains("standing still")));
    }

    #[test]
    fn test_save_disabled() {
        let mut engine = active_engine(ServerConfig::default(), &[("Runner", "GUIDA")]);
        engine.cmd_save_position(0, &CommandArgs::tokenize("save"));
        assert!(printed(&engine, 0).iter().any(|l| l.contains("Save is disabled")));
    }

    #[test]
    fn test_goto_requires_target_permission() {
        let mut engine = active_engine(position_config(), &[("Runner", "GUIDA"), ("Target", "GUIDB")]);
        engine.game_mut().apply(1, GameAction::Teleport([300.0, 0.0, 0.0]));

        engine.cmd_goto(0, &CommandArgs::tokenize("goto Target"));
        assert!(printed(&engine, 0).iter().any(|l| l.contains("does not ^7allow goto")));

        engine.cmd_allow_goto(1, &CommandArgs::tokenize("allowgoto 1"));
        engine.cmd_goto(0, &CommandArgs::tokenize("goto Target"));

        assert_eq!(engine.game().player_state(0).unwrap().origin, [300.0, 0.0, 0.0]);
        assert!(printed(&engine, 1).iter().any(|l| l.contains("goted ^7to you")));
    }

    #[test]
    fn test_goto_self_and_unknown_target() {
        let mut engine = active_engine(position_config(), &[("Runner", "GUIDA")]);

        engine.cmd_goto(0, &CommandArgs::tokenize("goto Runner"));
        assert!(printed(&engine, 0).iter().any(|l| l.contains("goto yourself")));

        engine.cmd_goto(0, &CommandArgs::tokenize("goto Nobody"));
        assert!(printed(&engine, 0).iter().any(|l| l.contains("invalid goto target")));
    }

    #[test]
    fn test_allowgoto_toggles_without_argument() {
        let mut engine: Engine<ArenaGame> = active_engine(position_config(), &[("Runner", "GUIDA")]);

        engine.cmd_allow_goto(0, &CommandArgs::tokenize("allowgoto"));
        assert!(engine.clients().get(0).unwrap().allow_goto);
        engine.cmd_allow_goto(0, &CommandArgs::tokenize("allowgoto"));
        assert!(!engine.clients().get(0).unwrap().allow_goto);
    }
}
