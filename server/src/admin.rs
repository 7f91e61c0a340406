//! Remote console commands.
//!
//! Each command writes its console output into a string that the caller sends
//! back to the operator as `print` packets.

use crate::admission::KICK_REASON;
use crate::bans::BanEntry;
use crate::client_manager::ClientState;
use crate::engine::Engine;
use crate::game::GameModule;
use log::{info, warn};
use shared::CommandArgs;
use std::fmt::{self, Write};

impl<G: GameModule> Engine<G> {
    /// Runs one console command line and returns what it printed
    pub fn execute_rcon(&mut self, line: &str) -> String {
        let args = CommandArgs::tokenize(line);
        let mut out = String::new();
        let result = match args.command().to_ascii_lowercase().as_str() {
            "status" => self.console_status(&mut out),
            "serverinfo" => self.console_serverinfo(&mut out),
            "dumpuser" => self.console_dumpuser(&args, &mut out),
            "kick" => self.console_kick(&args, &mut out),
            "clientkick" => self.console_clientkick(&args, &mut out),
            "mute" => self.console_mute(&args, &mut out),
            "addip" => self.console_add_ban(&args, false, &mut out),
            "exceptip" => self.console_add_ban(&args, true, &mut out),
            "removeip" => self.console_remove_ban(&args, &mut out),
            "listip" => self.console_list_bans(&mut out),
            "map" => self.console_map(&args, false, &mut out),
            "devmap" => self.console_map(&args, true, &mut out),
            "map_restart" => {
                self.restart_map();
                Ok(())
            }
            "heartbeat" => {
                self.heartbeat(true);
                writeln!(out, "Heartbeat sent to {} master(s)", self.masters.len())
            }
            "say" => {
                let text = args.args().replace('"', "'");
                info!("Console says: {}", text);
                self.broadcast_command(&format!("chat \"console: {}\"", text));
                Ok(())
            }
            "killserver" => {
                self.request_shutdown();
                writeln!(out, "Shutting down")
            }
            "" => Ok(()),
            other => writeln!(out, "Unknown command: {}", other),
        };
        if let Err(e) = result {
            warn!("Console output truncated: {}", e);
        }
        out
    }

    fn console_status(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "map: {}", self.world.map_name)?;
        writeln!(out, "num score ping name            lastmsg address               qport rate")?;
        writeln!(out, "--- ----- ---- --------------- ------- --------------------- ----- -----")?;
        for (slot, client) in self.clients.occupied() {
            let score = self.game.player_state(slot).map(|p| p.score).unwrap_or(0);
            let ping = match client.state() {
                ClientState::Connected | ClientState::Primed => "CNCT".to_string(),
                ClientState::Zombie => "ZMBI".to_string(),
                _ => client.ping.min(999).to_string(),
            };
            let address = match client.addr() {
                _ if client.is_bot => "bot".to_string(),
                Some(addr) => addr.to_string(),
                None => String::new(),
            };
            writeln!(
                out,
                "{:>3} {:>5} {:>4} {:<15} {:>7} {:<21} {:>5} {:>5}",
                slot,
                score,
                ping,
                client.name,
                self.time.saturating_sub(client.last_packet_time),
                address,
                client.qport(),
                client.rate
            )?;
        }
        Ok(())
    }

    fn console_serverinfo(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "Server info settings:")?;
        for (key, value) in self.world.serverinfo(&self.config).pairs() {
            writeln!(out, "{:<20}{}", key, value)?;
        }
        Ok(())
    }

    fn console_dumpuser(&self, args: &CommandArgs, out: &mut String) -> fmt::Result {
        if args.argc() != 2 {
            return writeln!(out, "Usage: dumpuser <player>");
        }
        let slot = match self.clients.lookup_by_handle(args.argv(1)) {
            Ok(slot) => slot,
            Err(e) => return writeln!(out, "{}", e),
        };
        let Some(client) = self.clients.get(slot) else {
            return Ok(());
        };
        writeln!(out, "userinfo")?;
        writeln!(out, "--------")?;
        for (key, value) in client.userinfo.pairs() {
            writeln!(out, "{:<20}{}", key, value)?;
        }
        Ok(())
    }

    fn console_kick(&mut self, args: &CommandArgs, out: &mut String) -> fmt::Result {
        if args.argc() != 2 {
            return writeln!(out, "Usage: kick <player name|all>");
        }
        let handle = args.argv(1);
        if handle.eq_ignore_ascii_case("all") {
            let everyone: Vec<usize> = self
                .clients
                .iter()
                .filter(|(_, c)| c.state() >= ClientState::Connected)
                .map(|(slot, _)| slot)
                .collect();
            for slot in everyone {
                self.drop_client(slot, KICK_REASON);
            }
            return Ok(());
        }

        match self.clients.lookup_by_handle(handle) {
            Ok(slot) => self.kick_slot(slot, out),
            Err(e) => writeln!(out, "{}", e),
        }
    }

    fn console_clientkick(&mut self, args: &CommandArgs, out: &mut String) -> fmt::Result {
        if args.argc() != 2 {
            return writeln!(out, "Usage: clientkick <client number>");
        }
        let Ok(slot) = args.argv(1).parse::<usize>() else {
            return writeln!(out, "Bad client slot: {}", args.argv(1));
        };
        match self.clients.get(slot) {
            None => writeln!(out, "Bad client slot: {}", slot),
            Some(client) if client.state() < ClientState::Connected => {
                writeln!(out, "Client {} is not active", slot)
            }
            Some(_) => self.kick_slot(slot, out),
        }
    }

    fn kick_slot(&mut self, slot: usize, out: &mut String) -> fmt::Result {
        let loopback = self
            .clients
            .get(slot)
            .and_then(|c| c.addr())
            .map_or(false, |a| a.ip().is_loopback());
        if loopback {
            return writeln!(out, "Cannot kick host player");
        }
        self.drop_client(slot, KICK_REASON);
        Ok(())
    }

    fn console_mute(&mut self, args: &CommandArgs, out: &mut String) -> fmt::Result {
        if args.argc() != 2 {
            return writeln!(out, "Usage: mute <player>");
        }
        let slot = match self.clients.lookup_by_handle(args.argv(1)) {
            Ok(slot) => slot,
            Err(e) => return writeln!(out, "{}", e),
        };
        let Some(client) = self.clients.get_mut(slot) else {
            return Ok(());
        };
        client.muted = !client.muted;
        let (verb, notice) = if client.muted {
            ("muted", "You have been muted by the server.")
        } else {
            ("unmuted", "You have been unmuted by the server.")
        };
        writeln!(out, "{} {}", client.name, verb)?;
        self.print_to(slot, notice);
        Ok(())
    }

    fn console_add_ban(&mut self, args: &CommandArgs, exception: bool, out: &mut String) -> fmt::Result {
        if args.argc() != 2 {
            let name = if exception { "exceptip" } else { "addip" };
            return writeln!(out, "Usage: {} <ip[/subnet]>", name);
        }
        let entry = match args.argv(1).parse::<BanEntry>() {
            Ok(entry) if exception => BanEntry::exception(entry.addr, entry.prefix),
            Ok(entry) => entry,
            Err(e) => return writeln!(out, "{}", e),
        };
        match self.bans.add(entry) {
            Ok(true) => {
                info!("Ban list: added {}", entry);
                writeln!(out, "Added {}", entry)
            }
            Ok(false) => writeln!(out, "{} is already listed", entry),
            Err(e) => {
                warn!("Could not save ban list: {}", e);
                writeln!(out, "Added {}, but the ban list could not be saved", entry)
            }
        }
    }

    fn console_remove_ban(&mut self, args: &CommandArgs, out: &mut String) -> fmt::Result {
        if args.argc() != 2 {
            return writeln!(out, "Usage: removeip <ip[/subnet]>");
        }
        let entry = match args.argv(1).parse::<BanEntry>() {
            Ok(entry) => entry,
            Err(e) => return writeln!(out, "{}", e),
        };
        match self.bans.remove(&entry) {
            Ok(0) => writeln!(out, "No entry matches {}", entry),
            Ok(removed) => writeln!(out, "Removed {} entr{}", removed, if removed == 1 { "y" } else { "ies" }),
            Err(e) => {
                warn!("Could not save ban list: {}", e);
                writeln!(out, "Removed, but the ban list could not be saved")
            }
        }
    }

    fn console_list_bans(&self, out: &mut String) -> fmt::Result {
        if self.bans.is_empty() {
            return writeln!(out, "Ban list is empty");
        }
        for (i, entry) in self.bans.entries().iter().enumerate() {
            writeln!(out, "{}: {}", i, entry)?;
        }
        Ok(())
    }

    fn console_map(&mut self, args: &CommandArgs, cheats: bool, out: &mut String) -> fmt::Result {
        let map = args.argv(1);
        if args.argc() != 2 || map.is_empty() {
            return writeln!(out, "Usage: {} <map name>", args.command());
        }
        if map.contains(&['/', '\\', '"'][..]) || map.contains("..") {
            return writeln!(out, "Bad map name: {}", map);
        }
        let map = map.to_string();
        self.spawn_map(&map, cheats);
        Ok(())
    }
}
