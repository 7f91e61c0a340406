//! Client message parsing and reliable command dispatch.
//!
//! A sequenced client message carries the ids the client last saw, any number
//! of reliable command strings and then at most one movement or voice block.
//! Reliable commands are applied strictly in order. A small set of core
//! commands is always handled here; local mini-feature commands are handled
//! here when the session is not flooding; everything else is handed to the
//! game module after the mute, vote and chat checks.

use crate::client_manager::ClientState;
use crate::download::{begin_download, AckOutcome};
use crate::engine::{configstring_commands, Engine};
use crate::game::{GameModule, Team};
use crate::userinfo::{apply_userinfo, atoi};
use crate::voice::{relay, VoipFrame};
use crate::world::PureManifest;
use log::{debug, info, warn};
use shared::delta::read_delta_usercmd;
use shared::msg::Result;
use shared::{move_key, ClcOp, CommandArgs, InfoString, MsgReader, UserCmd};
use shared::{MAX_PACKET_USERCMDS, MAX_RELIABLE_COMMANDS};

const COMMAND_FLOOD_WINDOW_MS: u64 = 1500;
const COMMAND_FLOOD_LIMIT: u32 = 2;
const USERINFO_FLOOD_WINDOW_MS: u64 = 2000;
const USERINFO_FLOOD_LIMIT: u32 = 2;

pub const MAX_SAY_STRLEN: usize = 256;
pub const MAX_RADIO_STRLEN: usize = 118;
/// Room for the two numeric radio arguments and their separators
const RADIO_ARG_ALLOWANCE: usize = 4;
pub const MAX_DOLLAR_VARS: usize = 6;
/// Extra length charged for each `$` template variable
pub const DOLLAR_VAR_PENALTY: usize = 16;

const MAX_VOTE_CONNECT_WAIT_SECS: u64 = 1800;
const MAX_CYCLEMAP_VOTE_WAIT_SECS: u64 = 1800;

/// Commands a muted session may not issue
const MUTED_COMMANDS: [&str; 5] = ["say", "say_team", "tell", "ut_radio", "callvote"];

/// Commands the server always handles itself, matched case-sensitively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoreCommand {
    Userinfo,
    Disconnect,
    VerifyPaks,
    ResetPure,
    Download,
    NextDownload,
    StopDownload,
    DoneDownload,
    Voip,
}

impl CoreCommand {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "userinfo" => CoreCommand::Userinfo,
            "disconnect" => CoreCommand::Disconnect,
            "cp" => CoreCommand::VerifyPaks,
            "vdr" => CoreCommand::ResetPure,
            "download" => CoreCommand::Download,
            "nextdl" => CoreCommand::NextDownload,
            "stopdl" => CoreCommand::StopDownload,
            "donedl" => CoreCommand::DoneDownload,
            "voip" => CoreCommand::Voip,
            _ => return None,
        })
    }
}

/// Server-side mini-feature commands, suppressed while the session floods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalCommand {
    Help,
    SavePosition,
    LoadPosition,
    AllowGoto,
    Goto,
}

impl LocalCommand {
    fn parse(token: &str) -> Option<Self> {
        Some(match token.to_ascii_lowercase().as_str() {
            "help" => LocalCommand::Help,
            "save" | "saveposition" | "savelocation" | "s" => LocalCommand::SavePosition,
            "load" | "loadposition" | "loadlocation" | "l" => LocalCommand::LoadPosition,
            "allowgoto" => LocalCommand::AllowGoto,
            "goto" => LocalCommand::Goto,
            _ => return None,
        })
    }
}

/// True if the chat arguments of `args` would expand past `max_len`.
///
/// Arguments are counted from the last one back, one per character plus the
/// separators between them, with every `$` variable charged extra.
pub fn exceeds_chat_budget(args: &CommandArgs, max_len: usize) -> bool {
    let mut chars = 0;
    let mut dollars = 0;
    for index in (1..args.argc()).rev() {
        for byte in args.argv(index).bytes() {
            chars += 1;
            if chars > max_len {
                return true;
            }
            if byte == b'$' {
                dollars += 1;
                if dollars > MAX_DOLLAR_VARS {
                    return true;
                }
                chars += DOLLAR_VAR_PENALTY;
                if chars > max_len {
                    return true;
                }
            }
        }
        if index != 1 {
            chars += 1;
            if chars > max_len {
                return true;
            }
        }
    }
    false
}

/// Checks a `cp` pak list against the manifest.
///
/// The list is `cp <serverId> <cgame> <ui> @ <pak>... <encoded count>`; the
/// encoded count is the checksum feed xor every pak checksum xor the pak count.
pub fn verify_pure_checksums(args: &CommandArgs, manifest: &PureManifest, checksum_feed: i32) -> bool {
    if args.argc() < 6 {
        return false;
    }
    let expect = |index: usize, sum: i32| {
        let arg = args.argv(index);
        !arg.starts_with('@') && atoi(arg) as i32 == sum
    };
    if !expect(2, manifest.cgame_checksum) || !expect(3, manifest.ui_checksum) {
        return false;
    }
    if !args.argv(4).starts_with('@') {
        return false;
    }

    let sums: Vec<i32> = (5..args.argc()).map(|i| atoi(args.argv(i)) as i32).collect();
    let Some((encoded, paks)) = sums.split_last() else {
        return false;
    };
    for (i, sum) in paks.iter().enumerate() {
        if paks[i + 1..].contains(sum) {
            return false;
        }
    }
    let known = manifest.pak_checksums();
    if paks.iter().any(|sum| !known.contains(sum)) {
        return false;
    }

    let folded = paks.iter().fold(checksum_feed, |acc, sum| acc ^ sum) ^ paks.len() as i32;
    folded == *encoded
}

impl<G: GameModule> Engine<G> {
    /// Applies one decoded channel message from `slot`
    pub(crate) fn execute_client_message(&mut self, slot: usize, data: &[u8]) {
        let mut msg = MsgReader::new(data);
        if let Err(e) = self.read_client_message(slot, &mut msg) {
            warn!("Malformed message from slot {}: {}", slot, e);
        }
    }

    fn read_client_message(&mut self, slot: usize, msg: &mut MsgReader<'_>) -> Result<()> {
        let server_id = msg.read_i32()?;
        let message_ack = msg.read_i32()?;
        if message_ack < 0 {
            debug!("Ignoring message with negative acknowledge from slot {}", slot);
            return Ok(());
        }
        let reliable_ack = msg.read_i32()?;

        let Some(client) = self.clients.get_mut(slot) else {
            return Ok(());
        };
        client.message_acknowledge = message_ack;
        if reliable_ack < client.reliable_sequence - MAX_RELIABLE_COMMANDS as i32 {
            client.reliable_acknowledge = client.reliable_sequence;
            self.drop_client(slot, "Illegible client message");
            return Ok(());
        }
        client.reliable_acknowledge = reliable_ack.min(client.reliable_sequence);

        // Downloads keep going across map changes; the gamestate follows once they finish
        if server_id != self.world.server_id
            && client.download.is_none()
            && !client.last_client_command_string.contains("nextdl")
        {
            if self.world.is_pre_restart_id(server_id) {
                debug!("{}: ignoring message from before the map restart", client.name);
            } else if message_ack > client.gamestate_message_num {
                debug!("{}: gamestate lost, resending", client.name);
                client.gamestate_pending = true;
            }
            return Ok(());
        }

        let op = loop {
            if msg.is_exhausted() {
                break ClcOp::Eof;
            }
            let mut op = ClcOp::try_from(msg.read_u8()?)?;
            // Extensions hide behind an end marker so older servers stop reading
            if op == ClcOp::Eof && msg.rest().first() == Some(&(ClcOp::Extension as u8)) {
                msg.read_u8()?;
                op = match msg.read_u8() {
                    Ok(byte) => ClcOp::try_from(byte)?,
                    Err(_) => ClcOp::Eof,
                };
            }
            if op != ClcOp::ClientCommand {
                break op;
            }
            if !self.client_command(slot, msg)? {
                return Ok(());
            }
            if self
                .clients
                .get(slot)
                .map_or(true, |c| c.state() == ClientState::Zombie || c.is_free())
            {
                return Ok(());
            }
        };

        match op {
            ClcOp::Move => self.user_move(slot, msg, true),
            ClcOp::MoveNoDelta => self.user_move(slot, msg, false),
            ClcOp::Voip => self.user_voip(slot, msg),
            ClcOp::Eof => Ok(()),
            other => {
                warn!("Bad command byte {:?} from slot {}", other, slot);
                Ok(())
            }
        }
    }

    /// Reads one reliable command; returns false when the rest of the message must be skipped
    fn client_command(&mut self, slot: usize, msg: &mut MsgReader<'_>) -> Result<bool> {
        let sequence = msg.read_i32()?;
        let text = msg.read_string()?;
        let now = self.time;
        let flood_protect = self.config.flood_protect;

        let Some(client) = self.clients.get_mut(slot) else {
            return Ok(false);
        };
        if client.last_client_command >= sequence {
            return Ok(true);
        }
        debug!("Client command from {} ({}): {}", client.name, sequence, text);

        if sequence > client.last_client_command + 1 {
            warn!(
                "{} lost {} client commands",
                client.name,
                sequence - client.last_client_command - 1
            );
            self.drop_client(slot, "Lost reliable commands");
            return Ok(false);
        }

        // Flooders still advance the sequence; only the effects are suppressed
        let client_ok = !(flood_protect
            && client.state() >= ClientState::Active
            && !client
                .command_flood
                .allow(now, COMMAND_FLOOD_WINDOW_MS, COMMAND_FLOOD_LIMIT));

        self.execute_command(slot, &text, client_ok);

        if let Some(client) = self.clients.get_mut(slot) {
            client.last_client_command = sequence;
            client.last_client_command_string = text;
        }
        Ok(true)
    }

    /// Runs one reliable command string for `slot`
    pub(crate) fn execute_command(&mut self, slot: usize, text: &str, client_ok: bool) {
        let args = CommandArgs::tokenize(text);

        if let Some(command) = CoreCommand::parse(args.command()) {
            self.run_core_command(slot, command, &args);
            return;
        }

        if let Some(command) = LocalCommand::parse(args.command()) {
            if client_ok {
                match command {
                    LocalCommand::Help => self.cmd_position_help(slot),
                    LocalCommand::SavePosition => self.cmd_save_position(slot, &args),
                    LocalCommand::LoadPosition => self.cmd_load_position(slot, &args),
                    LocalCommand::AllowGoto => self.cmd_allow_goto(slot, &args),
                    LocalCommand::Goto => self.cmd_goto(slot, &args),
                }
            }
            return;
        }

        if client_ok {
            self.forward_to_game(slot, args);
        } else {
            debug!("Flood protection ignored {:?} from slot {}", args.command(), slot);
        }
    }

    fn run_core_command(&mut self, slot: usize, command: CoreCommand, args: &CommandArgs) {
        match command {
            CoreCommand::Userinfo => self.cmd_userinfo(slot, args),
            CoreCommand::Disconnect => self.drop_client(slot, "disconnected"),
            CoreCommand::VerifyPaks => self.cmd_verify_paks(slot, args),
            CoreCommand::ResetPure => {
                if let Some(client) = self.clients.get_mut(slot) {
                    client.pure_authentic = false;
                    client.got_cp = false;
                }
            }
            CoreCommand::Download => {
                let download = begin_download(&self.config, &self.world.manifest, args.argv(1));
                if let Some(client) = self.clients.get_mut(slot) {
                    client.download = Some(download);
                }
            }
            CoreCommand::NextDownload => self.cmd_next_download(slot, args),
            CoreCommand::StopDownload => {
                if let Some(client) = self.clients.get_mut(slot) {
                    if let Some(download) = client.download.take() {
                        debug!("Download of {} aborted by slot {}", download.name, slot);
                    }
                }
            }
            CoreCommand::DoneDownload => {
                if let Some(client) = self.clients.get_mut(slot) {
                    debug!("{} finished downloading", client.name);
                    // Whoever entered while the download ran needs the current state
                    if client.state() != ClientState::Active {
                        client.gamestate_pending = true;
                    }
                }
            }
            CoreCommand::Voip => self.cmd_voip(slot, args),
        }
    }

    fn cmd_userinfo(&mut self, slot: usize, args: &CommandArgs) {
        let now = self.time;
        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        if self.config.flood_protect
            && !client
                .userinfo_flood
                .allow(now, USERINFO_FLOOD_WINDOW_MS, USERINFO_FLOOD_LIMIT)
        {
            self.print_to(slot, "You cannot change your userinfo that quickly.");
            return;
        }

        match InfoString::parse(args.argv(1)) {
            Ok(userinfo) => client.userinfo = userinfo,
            Err(_) => {
                self.drop_client(slot, "illegal characters in userinfo");
                return;
            }
        }
        if let Err(e) = apply_userinfo(client, &self.config) {
            self.drop_client(slot, e.drop_reason());
            return;
        }
        self.game.on_client_userinfo_changed(slot);
    }

    fn cmd_verify_paks(&mut self, slot: usize, args: &CommandArgs) {
        if !self.is_pure() {
            return;
        }
        // Late answers to an older checksum feed
        if (atoi(args.argv(1)) as i32) < self.world.feed_server_id {
            debug!("Ignoring outdated cp from slot {}", slot);
            return;
        }

        let authentic = verify_pure_checksums(args, &self.world.manifest, self.world.checksum_feed);
        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        client.got_cp = true;
        client.pure_authentic = authentic;
        if !authentic {
            self.drop_client(slot, "Unpure client detected. Invalid .PK3 files referenced!");
        }
    }

    fn cmd_next_download(&mut self, slot: usize, args: &CommandArgs) {
        let now = self.time;
        let block = atoi(args.argv(1)) as i32;
        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        let Some(download) = client.download.as_mut() else {
            return;
        };
        match download.acknowledge(block, now) {
            AckOutcome::Advanced => {}
            AckOutcome::Finished => {
                info!("{} completed download of {}", client.name, download.name);
                client.download = None;
            }
            AckOutcome::Broken => self.drop_client(slot, "broken download"),
        }
    }

    fn cmd_voip(&mut self, slot: usize, args: &CommandArgs) {
        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        let target = || {
            let arg = args.argv(2);
            match arg.as_bytes().first() {
                Some(b) if b.is_ascii_digit() => Some(atoi(arg) as usize),
                _ => None,
            }
        };
        match args.argv(1) {
            "ignore" => {
                if let Some(other) = target() {
                    client.voice.ignore(other);
                }
            }
            "unignore" => {
                if let Some(other) = target() {
                    client.voice.unignore(other);
                }
            }
            "muteall" => client.voice.mute_all = true,
            "unmuteall" => client.voice.mute_all = false,
            other => debug!("Unknown voip subcommand {:?} from slot {}", other, slot),
        }
    }

    /// Seconds `slot` still has to wait before calling a vote, if it must wait
    fn vote_wait_remaining(&self, slot: usize) -> Option<u64> {
        let wait = self.config.vote_connect_wait_secs.min(MAX_VOTE_CONNECT_WAIT_SECS) * 1000;
        let client = self.clients.get(slot)?;
        let elapsed = self.time.saturating_sub(client.last_connect_time);
        if wait == 0 || elapsed >= wait {
            return None;
        }
        let others_playing = self
            .clients
            .iter()
            .filter(|(other, c)| *other != slot && c.state() >= ClientState::Connected && !c.is_bot)
            .filter(|(other, _)| {
                self.game
                    .player_state(*other)
                    .map_or(true, |p| p.team != Team::Spectator)
            })
            .count();
        if others_playing == 0 {
            return None;
        }
        Some((wait - elapsed) / 1000 + 1)
    }

    fn forward_to_game(&mut self, slot: usize, mut args: CommandArgs) {
        let command = args.command().to_ascii_lowercase();
        let muted = self.clients.get(slot).map(|c| c.muted).unwrap_or(false);
        if muted && MUTED_COMMANDS.contains(&command.as_str()) {
            self.print_to(slot, "You are currently muted and may not perform that action.");
            return;
        }

        if command == "callvote" {
            if let Some(seconds) = self.vote_wait_remaining(slot) {
                let message = format!(
                    "You recently connected and must wait another {} seconds before calling a vote.",
                    seconds
                );
                self.print_to(slot, &message);
                return;
            }
        }

        let cyclemap_vote = command == "callvote" && args.argv(1).eq_ignore_ascii_case("cyclemap");
        if cyclemap_vote {
            if let Some(seconds) = self.cyclemap_wait_remaining() {
                let message = format!(
                    "Server won't accept repeated cyclemap vote for another {} seconds.",
                    seconds
                );
                self.print_to(slot, &message);
                return;
            }
        }

        let budget = match command.as_str() {
            "say" | "say_team" | "tell" => Some(MAX_SAY_STRLEN),
            "ut_radio" => {
                if !self.config.radio_enabled {
                    self.print_to(slot, "Radio is disabled on this server.");
                    return;
                }
                Some(MAX_RADIO_STRLEN + RADIO_ARG_ALLOWANCE)
            }
            _ => None,
        };

        if let Some(max_len) = budget {
            if exceeds_chat_budget(&args, max_len) {
                let addr = self.clients.get(slot).and_then(|c| c.addr());
                warn!("Oversized chat from slot {} ({:?}) dropped", slot, addr);
                self.print_to(slot, "Chat dropped due to message length constraints.");
                return;
            }
        } else if command == "callvote" {
            let name = self.clients.get(slot).map(|c| c.name.as_str()).unwrap_or("");
            info!("Callvote from {} (slot {}): {}", name, slot, args.args());
        } else if command == "team" {
            let is_bot = self.clients.get(slot).map(|c| c.is_bot).unwrap_or(false);
            let side = args.argv(1);
            if self.config.force_autojoin
                && !is_bot
                && (side.eq_ignore_ascii_case("red") || side.eq_ignore_ascii_case("blue"))
            {
                args = CommandArgs::tokenize("team free");
                self.print_to(slot, "Forcing autojoin.");
            }
            // The one-letter forms still pick a side under forced autojoin
            match args.argv(1).to_ascii_lowercase().as_str() {
                "r" => args = CommandArgs::tokenize("team red"),
                "b" => args = CommandArgs::tokenize("team blue"),
                _ => {}
            }
        }

        self.game.on_client_command(slot, &args);
        if cyclemap_vote {
            self.world.last_cyclemap_vote = Some(self.time);
        }
    }

    /// Seconds until another cyclemap vote is accepted on this map, if blocked
    fn cyclemap_wait_remaining(&self) -> Option<u64> {
        let last = self.world.last_cyclemap_vote?;
        let wait = self.config.cyclemap_vote_wait_secs.min(MAX_CYCLEMAP_VOTE_WAIT_SECS) * 1000;
        let next = last + wait;
        if wait == 0 || next <= self.time {
            return None;
        }
        Some((next - self.time) / 1000 + 1)
    }

    fn user_move(&mut self, slot: usize, msg: &mut MsgReader<'_>, delta: bool) -> Result<()> {
        let now = self.time;
        let pure = self.is_pure();
        let checksum_feed = self.world.checksum_feed;
        let Some(client) = self.clients.get_mut(slot) else {
            return Ok(());
        };

        client.delta_message = if delta { client.message_acknowledge } else { -1 };
        let count = msg.read_u8()? as usize;
        if count < 1 || count > MAX_PACKET_USERCMDS {
            warn!("Bad usercmd count {} from slot {}", count, slot);
            return Ok(());
        }

        let key = move_key(
            checksum_feed,
            client.message_acknowledge,
            client.reliable_command(client.reliable_acknowledge),
        );
        let mut cmds = Vec::with_capacity(count);
        let mut previous = UserCmd::default();
        for _ in 0..count {
            let cmd = read_delta_usercmd(msg, key, &previous)?;
            cmds.push(cmd);
            previous = cmd;
        }
        client.ack_frame(client.message_acknowledge, now);

        if pure && !client.pure_authentic && !client.got_cp {
            // Movement without a pak list: ask again with a fresh gamestate
            if client.state() == ClientState::Active {
                debug!("{}: no cp yet, resending gamestate", client.name);
                client.gamestate_pending = true;
            }
            return Ok(());
        }
        if client.gamestate_pending {
            return Ok(());
        }

        let entering = client.state() == ClientState::Primed
            || (client.state() == ClientState::Active && client.awaiting_begin);
        if entering {
            self.enter_world(slot, cmds[0]);
        }

        if pure && !self.clients.get(slot).map(|c| c.pure_authentic).unwrap_or(false) {
            self.drop_client(slot, "Cannot validate pure client!");
            return Ok(());
        }

        let Some(client) = self.clients.get_mut(slot) else {
            return Ok(());
        };
        if !client.in_world() {
            client.delta_message = -1;
            return Ok(());
        }

        // Repeated commands from packet duplication carry old server times
        let newest = cmds[count - 1].server_time;
        for cmd in cmds.iter() {
            if cmd.server_time > newest || cmd.server_time <= client.last_usercmd.server_time {
                continue;
            }
            client.last_usercmd = *cmd;
            self.game.on_client_think(slot, cmd);
        }
        Ok(())
    }

    /// First movement of a gamestate: the session joins the simulation
    fn enter_world(&mut self, slot: usize, first: UserCmd) {
        let now = self.time;
        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        if client.state() == ClientState::Primed {
            client.set_state(ClientState::Active);
        }
        info!("{} entered the game (slot {})", client.name, slot);
        client.awaiting_begin = false;
        client.delta_message = -1;
        client.next_snapshot_time = now;
        client.last_usercmd = first;
        client.rewards.reset();

        let dirty = std::mem::take(&mut client.dirty_configstrings);
        for index in dirty {
            let value = self.world.configstring(index).to_string();
            for command in configstring_commands(index, &value) {
                self.send_server_command(slot, &command);
            }
        }
        self.game.on_client_begin(slot);
    }

    fn user_voip(&mut self, slot: usize, msg: &mut MsgReader<'_>) -> Result<()> {
        let frame = VoipFrame::read(msg)?;
        if !self.config.voip {
            return Ok(());
        }
        let delivered = relay(&mut self.clients, slot, &frame);
        debug!("Voice frame {} from slot {} relayed to {}", frame.sequence, slot, delivered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::download::Download;
    use crate::engine::tests::{active_engine, engine_with, printed, test_addr};
    use crate::game::ArenaGame;
    use shared::delta::write_delta_usercmd;
    use shared::{MsgWriter, NetSide, Netchan, MAX_MSGLEN};

    fn header(msg: &mut MsgWriter, server_id: i32, message_ack: i32, reliable_ack: i32) {
        msg.write_i32(server_id).unwrap();
        msg.write_i32(message_ack).unwrap();
        msg.write_i32(reliable_ack).unwrap();
    }

    fn command_message(engine: &Engine<ArenaGame>, commands: &[(i32, &str)]) -> Vec<u8> {
        let mut msg = MsgWriter::new(MAX_MSGLEN);
        header(&mut msg, engine.world.server_id, 1, 0);
        for (sequence, text) in commands {
            msg.write_u8(ClcOp::ClientCommand as u8).unwrap();
            msg.write_i32(*sequence).unwrap();
            msg.write_string(text).unwrap();
        }
        msg.write_u8(ClcOp::Eof as u8).unwrap();
        msg.into_bytes()
    }

    fn move_message(engine: &Engine<ArenaGame>, slot: usize, cmds: &[UserCmd]) -> Vec<u8> {
        let client = engine.clients.get(slot).unwrap();
        let message_ack = 1;
        let key = move_key(engine.world.checksum_feed, message_ack, client.reliable_command(0));

        let mut msg = MsgWriter::new(MAX_MSGLEN);
        header(&mut msg, engine.world.server_id, message_ack, 0);
        msg.write_u8(ClcOp::Move as u8).unwrap();
        msg.write_u8(cmds.len() as u8).unwrap();
        let mut previous = UserCmd::default();
        for cmd in cmds {
            write_delta_usercmd(&mut msg, key, &previous, cmd).unwrap();
            previous = *cmd;
        }
        msg.write_u8(ClcOp::Eof as u8).unwrap();
        msg.into_bytes()
    }

    fn primed_client(engine: &mut Engine<ArenaGame>, slot: usize) {
        let client = engine.clients.get_mut(slot).unwrap();
        client.netchan = Some(Netchan::new(NetSide::Server, test_addr(5000 + slot as u16), 9));
        client.name = "Fresh".to_string();
        assert!(client.set_state(ClientState::Connected));
        assert!(client.set_state(ClientState::Primed));
        assert!(engine.game.on_client_connect(slot, true, false).is_none());
    }

    fn pure_engine() -> Engine<ArenaGame> {
        let config = ServerConfig {
            pure: true,
            ..Default::default()
        };
        let game = ArenaGame::new(config.max_clients);
        let manifest = PureManifest {
            cgame_checksum: 11,
            ui_checksum: 22,
            paks: vec!["q3ut4/zpak000:100".parse().unwrap(), "q3ut4/ut4_casa:200".parse().unwrap()],
        };
        Engine::with_seed(config, game, manifest, 7)
    }

    fn good_cp(engine: &Engine<ArenaGame>) -> String {
        let encoded = engine.world.checksum_feed ^ 100 ^ 200 ^ 2;
        format!("cp {} 11 22 @ 100 200 {}", engine.world.server_id, encoded)
    }

    fn moving(server_time: i32) -> UserCmd {
        UserCmd {
            server_time,
            forward_move: 127,
            ..Default::default()
        }
    }

    #[test]
    fn test_duplicate_command_is_noop() {
        let mut engine = active_engine(ServerConfig::default(), &[("Player", "A")]);

        let message = command_message(&engine, &[(1, "allowgoto")]);
        engine.execute_client_message(0, &message);
        assert!(engine.clients.get(0).unwrap().allow_goto);

        engine.execute_client_message(0, &message);

        let client = engine.clients.get(0).unwrap();
        assert!(client.allow_goto);
        assert_eq!(client.last_client_command, 1);
    }

    #[test]
    fn test_command_gap_drops_session() {
        let mut engine = active_engine(ServerConfig::default(), &[("Player", "A")]);

        let message = command_message(&engine, &[(3, "say hello")]);
        engine.execute_client_message(0, &message);

        let client = engine.clients.get(0).unwrap();
        assert_eq!(client.state(), ClientState::Zombie);
        assert!(client
            .unacknowledged()
            .any(|(_, c)| c == "disconnect \"Lost reliable commands\""));
    }

    #[test]
    fn test_flood_suppresses_effects_but_not_sequence() {
        let mut engine = active_engine(ServerConfig::default(), &[("Spammer", "A")]);

        let message = command_message(
            &engine,
            &[(1, "allowgoto"), (2, "allowgoto"), (3, "allowgoto"), (4, "voip muteall")],
        );
        engine.execute_client_message(0, &message);

        let client = engine.clients.get(0).unwrap();
        // Third toggle suppressed, core command still applied
        assert!(!client.allow_goto);
        assert!(client.voice.mute_all);
        assert_eq!(client.last_client_command, 4);
        assert_eq!(client.last_client_command_string, "voip muteall");
    }

    #[test]
    fn test_disconnect_command_stops_processing() {
        let mut engine = active_engine(ServerConfig::default(), &[("Leaver", "A"), ("Stayer", "B")]);

        let message = command_message(&engine, &[(1, "disconnect"), (2, "allowgoto")]);
        engine.execute_client_message(0, &message);

        let client = engine.clients.get(0).unwrap();
        assert_eq!(client.state(), ClientState::Zombie);
        assert!(!client.allow_goto);
        assert!(printed(&engine, 1).iter().any(|l| l.contains("Leaver^7 disconnected")));
    }

    #[test]
    fn test_muted_session_cannot_chat() {
        let mut engine = active_engine(ServerConfig::default(), &[("Loud", "A")]);
        engine.clients.get_mut(0).unwrap().muted = true;

        let message = command_message(&engine, &[(1, "say hello")]);
        engine.execute_client_message(0, &message);

        assert!(printed(&engine, 0)
            .iter()
            .any(|l| l.contains("You are currently muted")));
    }

    #[test]
    fn test_oversized_chat_dropped_without_disconnect() {
        let mut engine = active_engine(ServerConfig::default(), &[("Talker", "A")]);
        let long = format!("say {}", "a".repeat(300));

        let message = command_message(&engine, &[(1, &long)]);
        engine.execute_client_message(0, &message);

        let client = engine.clients.get(0).unwrap();
        assert_eq!(client.state(), ClientState::Active);
        assert!(printed(&engine, 0)
            .iter()
            .any(|l| l.contains("Chat dropped due to message length constraints.")));
    }

    #[test]
    fn test_chat_budget() {
        let short = CommandArgs::tokenize("say hello there");
        assert!(!exceeds_chat_budget(&short, MAX_SAY_STRLEN));

        // Seven template variables is always too many
        let dollars = CommandArgs::tokenize("say $a$b$c$d$e$f$g");
        assert!(exceeds_chat_budget(&dollars, MAX_SAY_STRLEN));

        // 12 characters, 6 variables, one separator and "x" come to 110
        let six = CommandArgs::tokenize("say x $a$b$c$d$e$f");
        assert!(!exceeds_chat_budget(&six, 6 * 17 + 6 + 2));
        assert!(exceeds_chat_budget(&six, 6 * 17 + 6 + 1));

        let radio = CommandArgs::tokenize(&format!("ut_radio 1 1 {}", "r".repeat(MAX_RADIO_STRLEN)));
        assert!(!exceeds_chat_budget(&radio, MAX_RADIO_STRLEN + RADIO_ARG_ALLOWANCE));
    }

    #[test]
    fn test_radio_can_be_disabled() {
        let config = ServerConfig {
            radio_enabled: false,
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Radio", "A")]);

        let message = command_message(&engine, &[(1, "ut_radio 1 1 affirmative")]);
        engine.execute_client_message(0, &message);

        assert!(printed(&engine, 0)
            .iter()
            .any(|l| l.contains("Radio is disabled on this server.")));
    }

    #[test]
    fn test_callvote_waits_after_connect() {
        let config = ServerConfig {
            vote_connect_wait_secs: 60,
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Newcomer", "A"), ("Regular", "B")]);

        let message = command_message(&engine, &[(1, "callvote map ut4_casa")]);
        engine.execute_client_message(0, &message);

        assert!(printed(&engine, 0)
            .iter()
            .any(|l| l.contains("must wait another 61 seconds")));
    }

    #[test]
    fn test_callvote_alone_is_allowed() {
        let config = ServerConfig {
            vote_connect_wait_secs: 60,
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Lonely", "A")]);

        let message = command_message(&engine, &[(1, "callvote map ut4_casa")]);
        engine.execute_client_message(0, &message);

        assert!(printed(&engine, 0).is_empty());
    }

    #[test]
    fn test_team_shorthand_forwarded() {
        let mut engine = active_engine(ServerConfig::default(), &[("Joiner", "A")]);

        let message = command_message(&engine, &[(1, "team b")]);
        engine.execute_client_message(0, &message);

        assert_eq!(engine.game.player_state(0).unwrap().team, Team::Blue);
    }

    #[test]
    fn test_repeated_cyclemap_vote_refused() {
        let config = ServerConfig {
            cyclemap_vote_wait_secs: 300,
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Voter", "A")]);

        let message = command_message(&engine, &[(1, "callvote cyclemap"), (2, "callvote CYCLEMAP")]);
        engine.execute_client_message(0, &message);

        assert_eq!(engine.world.last_cyclemap_vote, Some(engine.time));
        let refusals: Vec<String> = printed(&engine, 0)
            .into_iter()
            .filter(|l| l.contains("repeated cyclemap vote"))
            .collect();
        assert_eq!(refusals.len(), 1);
        assert!(refusals[0].contains("for another 301 seconds"));

        // Other votes are not held back
        engine.time += 2000;
        let message = command_message(&engine, &[(3, "callvote map ut4_casa")]);
        engine.execute_client_message(0, &message);
        assert_eq!(printed(&engine, 0).len(), 1);

        engine.time += 300_000;
        let message = command_message(&engine, &[(4, "callvote cyclemap")]);
        engine.execute_client_message(0, &message);
        assert_eq!(printed(&engine, 0).len(), 1);
        assert_eq!(engine.world.last_cyclemap_vote, Some(engine.time));
    }

    #[test]
    fn test_cyclemap_vote_unlimited_by_default() {
        let mut engine = active_engine(ServerConfig::default(), &[("Voter", "A")]);

        let message = command_message(&engine, &[(1, "callvote cyclemap"), (2, "callvote cyclemap")]);
        engine.execute_client_message(0, &message);

        assert!(printed(&engine, 0).is_empty());
    }

    #[test]
    fn test_forced_autojoin_rewrites_team_choice() {
        let config = ServerConfig {
            force_autojoin: true,
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Picky", "A")]);

        let message = command_message(&engine, &[(1, "team Red")]);
        engine.execute_client_message(0, &message);

        assert_eq!(engine.game.player_state(0).unwrap().team, Team::Free);
        assert!(printed(&engine, 0).iter().any(|l| l.contains("Forcing autojoin.")));
    }

    #[test]
    fn test_team_shorthand_bypasses_forced_autojoin() {
        let config = ServerConfig {
            force_autojoin: true,
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Veteran", "A")]);

        let message = command_message(&engine, &[(1, "team r")]);
        engine.execute_client_message(0, &message);

        assert_eq!(engine.game.player_state(0).unwrap().team, Team::Red);
        assert!(printed(&engine, 0).is_empty());
    }

    #[test]
    fn test_forced_autojoin_skips_bots() {
        let config = ServerConfig {
            force_autojoin: true,
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Bot", "A")]);
        engine.clients.get_mut(0).unwrap().is_bot = true;

        engine.execute_command(0, "team blue", true);

        assert_eq!(engine.game.player_state(0).unwrap().team, Team::Blue);
    }

    #[test]
    fn test_first_move_enters_world() {
        let mut engine = engine_with(ServerConfig::default());
        primed_client(&mut engine, 2);

        let message = move_message(&engine, 2, &[moving(100), moving(150)]);
        engine.execute_client_message(2, &message);

        let client = engine.clients.get(2).unwrap();
        assert_eq!(client.state(), ClientState::Active);
        assert!(client.in_world());
        assert_eq!(client.last_usercmd.server_time, 150);
        assert!(engine.game.player_state(2).unwrap().velocity[0] > 0.0);
    }

    #[test]
    fn test_stale_moves_are_not_rerun() {
        let mut engine = active_engine(ServerConfig::default(), &[("Mover", "A")]);
        engine.clients.get_mut(0).unwrap().last_usercmd.server_time = 500;

        let message = move_message(&engine, 0, &[moving(400), moving(450)]);
        engine.execute_client_message(0, &message);

        assert_eq!(engine.clients.get(0).unwrap().last_usercmd.server_time, 500);
        assert!(engine.game.player_state(0).unwrap().is_still());
    }

    #[test]
    fn test_pure_server_waits_for_pak_list() {
        let mut engine = pure_engine();
        primed_client(&mut engine, 0);

        let message = move_message(&engine, 0, &[moving(100)]);
        engine.execute_client_message(0, &message);
        assert_eq!(engine.clients.get(0).unwrap().state(), ClientState::Primed);

        let cp = good_cp(&engine);
        let message = command_message(&engine, &[(1, &cp)]);
        engine.execute_client_message(0, &message);
        assert!(engine.clients.get(0).unwrap().pure_authentic);

        let message = move_message(&engine, 0, &[moving(200)]);
        engine.execute_client_message(0, &message);
        assert_eq!(engine.clients.get(0).unwrap().state(), ClientState::Active);
    }

    #[test]
    fn test_unpure_client_dropped() {
        let mut engine = pure_engine();
        primed_client(&mut engine, 0);
        let bad = format!("cp {} 11 22 @ 100 999 0", engine.world.server_id);

        let message = command_message(&engine, &[(1, &bad)]);
        engine.execute_client_message(0, &message);

        let client = engine.clients.get(0).unwrap();
        assert_eq!(client.state(), ClientState::Zombie);
        assert!(client
            .unacknowledged()
            .any(|(_, c)| c.contains("Unpure client detected")));
    }

    #[test]
    fn test_verify_pure_checksums() {
        let manifest = PureManifest {
            cgame_checksum: 1,
            ui_checksum: 2,
            paks: vec!["a:10".parse().unwrap(), "b:20".parse().unwrap()],
        };
        let feed = 0x1234;
        let good = CommandArgs::tokenize(&format!("cp 5 1 2 @ 10 20 {}", feed ^ 10 ^ 20 ^ 2));
        assert!(verify_pure_checksums(&good, &manifest, feed));

        let wrong_count = CommandArgs::tokenize(&format!("cp 5 1 2 @ 10 20 {}", feed ^ 10 ^ 20));
        assert!(!verify_pure_checksums(&wrong_count, &manifest, feed));

        let repeated = CommandArgs::tokenize(&format!("cp 5 1 2 @ 10 10 {}", feed ^ 2));
        assert!(!verify_pure_checksums(&repeated, &manifest, feed));

        let wrong_ui = CommandArgs::tokenize(&format!("cp 5 1 3 @ 10 20 {}", feed ^ 10 ^ 20 ^ 2));
        assert!(!verify_pure_checksums(&wrong_ui, &manifest, feed));

        assert!(!verify_pure_checksums(&CommandArgs::tokenize("cp 5 1 2"), &manifest, feed));
    }

    #[test]
    fn test_unreferenced_download_refused_without_drop() {
        let config = ServerConfig {
            allow_download: true,
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Fetcher", "A")]);

        let message = command_message(&engine, &[(1, "download q3ut4/secret.pk3")]);
        engine.execute_client_message(0, &message);

        let client = engine.clients.get(0).unwrap();
        assert_eq!(client.state(), ClientState::Active);
        assert!(client.download.as_ref().unwrap().is_failed());
    }

    #[test]
    fn test_out_of_order_ack_breaks_download() {
        let mut engine = active_engine(ServerConfig::default(), &[("Fetcher", "A")]);
        engine.clients.get_mut(0).unwrap().download = Some(Download::failed("x.pk3", "gone".to_string()));

        let message = command_message(&engine, &[(1, "nextdl 5")]);
        engine.execute_client_message(0, &message);

        assert_eq!(engine.clients.get(0).unwrap().state(), ClientState::Zombie);
    }

    #[test]
    fn test_stopdl_clears_download() {
        let mut engine = active_engine(ServerConfig::default(), &[("Fetcher", "A")]);
        engine.clients.get_mut(0).unwrap().download = Some(Download::failed("x.pk3", "gone".to_string()));

        let message = command_message(&engine, &[(1, "stopdl")]);
        engine.execute_client_message(0, &message);

        assert!(engine.clients.get(0).unwrap().download.is_none());
    }

    #[test]
    fn test_stale_server_id_requests_gamestate() {
        let mut engine = active_engine(ServerConfig::default(), &[("Lagger", "A")]);
        let mut msg = MsgWriter::new(MAX_MSGLEN);
        header(&mut msg, engine.world.server_id.wrapping_sub(5000), 3, 0);
        msg.write_u8(ClcOp::Eof as u8).unwrap();

        engine.execute_client_message(0, msg.as_bytes());

        assert!(engine.clients.get(0).unwrap().gamestate_pending);
    }

    #[test]
    fn test_ancient_reliable_ack_drops_session() {
        let mut engine = active_engine(ServerConfig::default(), &[("Forger", "A")]);
        for i in 0..40 {
            engine.send_server_command(0, &format!("print \"{}\"", i));
        }
        engine.clients.get_mut(0).unwrap().reliable_acknowledge = 39;
        for i in 0..40 {
            engine.send_server_command(0, &format!("print \"{}\"", i));
        }

        let mut msg = MsgWriter::new(MAX_MSGLEN);
        header(&mut msg, engine.world.server_id, 1, 0);
        msg.write_u8(ClcOp::Eof as u8).unwrap();
        engine.execute_client_message(0, msg.as_bytes());

        assert_eq!(engine.clients.get(0).unwrap().state(), ClientState::Zombie);
    }

    #[test]
    fn test_userinfo_update_renames() {
        let mut engine = active_engine(ServerConfig::default(), &[("Before", "A")]);

        let message = command_message(&engine, &[(1, "userinfo \"\\name\\After\\rate\\8000\"")]);
        engine.execute_client_message(0, &message);

        let client = engine.clients.get(0).unwrap();
        assert_eq!(client.name, "After");
        assert_eq!(client.rate, 8000);
    }

    #[test]
    fn test_bad_userinfo_drops_session() {
        let mut engine = active_engine(ServerConfig::default(), &[("Before", "A")]);

        let message = command_message(&engine, &[(1, "userinfo \\name\\a;b")]);
        engine.execute_client_message(0, &message);

        let client = engine.clients.get(0).unwrap();
        assert_eq!(client.state(), ClientState::Zombie);
        assert!(client
            .unacknowledged()
            .any(|(_, c)| c == "disconnect \"illegal characters in userinfo\""));
    }

    #[test]
    fn test_voip_ignore_list() {
        let mut engine = active_engine(ServerConfig::default(), &[("Listener", "A")]);

        let message = command_message(&engine, &[(1, "voip ignore 3"), (2, "voip unignore x")]);
        engine.execute_client_message(0, &message);

        let client = engine.clients.get(0).unwrap();
        assert!(client.voice.is_ignoring(3));
    }
}
