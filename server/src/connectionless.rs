//! Out-of-band commands: browser queries, the challenge exchange, external
//! service answers and remote console.

use crate::admission::{is_lan_address, AUTHORIZE_TIMEOUT_MS, MAX_AUTHORIZE_REQUESTS};
use crate::client_manager::ClientState;
use crate::engine::Engine;
use crate::game::GameModule;
use crate::userinfo::atoi;
use log::{debug, info, warn};
use shared::{oob, CommandArgs, InfoString, MAX_INFO_STRING, PROTOCOL_VERSION};
use std::net::SocketAddr;

/// Longer `getinfo`/`getstatus` challenges are ignored
pub const MAX_QUERY_CHALLENGE: usize = 128;

const RCON_BAD_PASSWORD_WAIT_MS: u64 = 600;
const RCON_GOOD_PASSWORD_WAIT_MS: u64 = 180;
/// Largest piece of console output sent in one `print` packet
const RCON_OUTPUT_CHUNK: usize = 1000;

/// Splits console output at line boundaries into pieces of at most `max` bytes
fn output_chunks(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if !current.is_empty() && current.len() + line.len() > max {
            chunks.push(std::mem::take(&mut current));
        }
        let mut rest = line;
        while rest.len() > max {
            let mut cut = max;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            chunks.push(rest[..cut].to_string());
            rest = &rest[cut..];
        }
        current.push_str(rest);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

impl<G: GameModule> Engine<G> {
    /// Handles a datagram starting with the out-of-band marker
    pub(crate) fn connectionless_packet(&mut self, from: SocketAddr, data: &[u8]) {
        let Some(text) = oob::payload(data) else {
            return;
        };
        let args = CommandArgs::tokenize(&text);
        debug!("Connectionless {:?} from {}", args.command(), from);

        match args.command().to_ascii_lowercase().as_str() {
            "getstatus" => self.status_query(from, &args),
            "getinfo" => self.info_query(from, &args),
            "getchallenge" => self.get_challenge(from),
            "connect" => self.direct_connect(from, &args),
            "ipauthorize" => self.authorize_response(from, &args),
            "ip2locresponse" => self.locate_response(from, &args),
            "rcon" => self.remote_command(from, &args),
            // Sessions end over the channel; a bare disconnect could be spoofed
            "disconnect" => {}
            other => debug!("Bad connectionless packet {:?} from {}", other, from),
        }
    }

    /// Shared gate for unauthenticated queries; returns the echoed challenge if the query may be answered
    fn query_challenge<'a>(&mut self, from: SocketAddr, args: &'a CommandArgs) -> Option<&'a str> {
        if self.gate.drdos.should_drop(from.ip(), self.time) {
            return None;
        }
        let challenge = args.argv(1);
        if challenge.len() > MAX_QUERY_CHALLENGE {
            debug!("Oversized query challenge from {}", from);
            return None;
        }
        Some(challenge)
    }

    fn info_query(&mut self, from: SocketAddr, args: &CommandArgs) {
        let Some(challenge) = self.query_challenge(from, args) else {
            return;
        };

        let private = self.clients.private_clients();
        let humans = self
            .clients
            .iter()
            .filter(|(slot, c)| *slot >= private && c.state() >= ClientState::Connected)
            .count();
        let pure = self.is_pure();

        let mut info = InfoString::with_limit(MAX_INFO_STRING);
        let pairs = [
            ("challenge", challenge.to_string()),
            ("protocol", PROTOCOL_VERSION.to_string()),
            ("hostname", self.config.hostname.clone()),
            ("mapname", self.world.map_name.clone()),
            ("clients", humans.to_string()),
            ("bots", self.clients.bot_count().to_string()),
            ("sv_maxclients", self.config.public_slots().to_string()),
            ("gametype", self.config.gametype.to_string()),
            ("pure", (pure as i32).to_string()),
            ("needpass", (self.config.needs_password() as i32).to_string()),
            ("minPing", self.config.min_ping.to_string()),
            ("maxPing", self.config.max_ping.to_string()),
            ("game", self.config.game.clone()),
            ("modversion", self.config.mod_version.clone()),
        ];
        for (key, value) in pairs.iter() {
            if let Err(e) = info.set(key, value) {
                debug!("Leaving {} out of infoResponse: {}", key, e);
            }
        }
        self.send_oob(from, &format!("infoResponse\n{}", info));
    }

    fn status_query(&mut self, from: SocketAddr, args: &CommandArgs) {
        let Some(challenge) = self.query_challenge(from, args) else {
            return;
        };

        let mut info = self.world.serverinfo(&self.config);
        if let Err(e) = info.set("challenge", challenge) {
            debug!("Leaving challenge out of statusResponse: {}", e);
        }

        let mut text = format!("statusResponse\n{}\n", info);
        for (slot, client) in self.clients.iter() {
            if client.state() < ClientState::Connected {
                continue;
            }
            let score = self.game.player_state(slot).map(|p| p.score).unwrap_or(0);
            text.push_str(&format!("{} {} \"{}\"\n", score, client.ping, client.name));
        }
        self.send_oob(from, &text);
    }

    /// Hands out a token, possibly after asking the authorization service first
    fn get_challenge(&mut self, from: SocketAddr) {
        let now = self.time;
        let authorize = self
            .config
            .authorize_server
            .filter(|_| !is_lan_address(from.ip()));

        let ttl = self.config.challenge_ttl_ms;
        let record = self.gate.challenges.issue(from, now, ttl, &mut self.rng);
        let token = record.token;
        let waited = now.saturating_sub(record.created);

        let query = match authorize {
            Some(server) if waited <= AUTHORIZE_TIMEOUT_MS => {
                if record.authorize_requests >= MAX_AUTHORIZE_REQUESTS {
                    debug!("Still waiting on authorization for {}", from);
                    return;
                }
                record.authorize_requests += 1;
                Some(server)
            }
            // Answered directly once the service had its chance
            _ => {
                // Ping is measured from the first reply, not from repeats
                record.ping_time.get_or_insert(now);
                None
            }
        };

        match query {
            Some(server) => {
                let text = format!("getIpAuthorize {} {} {} 0", token, from.ip(), self.config.game);
                self.send_oob(server, &text);
            }
            None => self.send_oob(from, &format!("challengeResponse {}", token)),
        }
    }

    /// Verdict from the authorization service on a pending challenge
    fn authorize_response(&mut self, from: SocketAddr, args: &CommandArgs) {
        if self.config.authorize_server.map(|a| a.ip()) != Some(from.ip()) {
            debug!("ipAuthorize from unexpected address {}", from);
            return;
        }
        let now = self.time;
        let token = atoi(args.argv(1)) as i32;
        let Some(record) = self.gate.challenges.find_token_mut(token) else {
            debug!("ipAuthorize for unknown challenge {}", token);
            return;
        };
        let peer = record.addr;
        let reason = args.args_from(3);

        let message = match args.argv(2) {
            "accept" => {
                record.ping_time.get_or_insert(now);
                self.send_oob(peer, &format!("challengeResponse {}", token));
                return;
            }
            "demo" => "Server is not a demo server".to_string(),
            "unknown" if reason.is_empty() => "Awaiting CD key authorization".to_string(),
            _ if !reason.is_empty() => reason,
            _ => "Someone is using this CD Key".to_string(),
        };
        info!("Authorization refused {}: {}", peer, message);
        self.send_oob_print(peer, &format!("{}\n", message));
        self.gate.challenges.remove_token(token);
    }

    /// Location text from the geo service for a session that asked
    fn locate_response(&mut self, from: SocketAddr, args: &CommandArgs) {
        if self.config.locator_server.map(|a| a.ip()) != Some(from.ip()) {
            debug!("ip2locResponse from unexpected address {}", from);
            return;
        }
        let Ok(token) = args.argv(1).parse::<u32>() else {
            return;
        };
        let Some(slot) = self
            .clients
            .iter()
            .find(|(_, c)| c.locate_token == Some(token))
            .map(|(slot, _)| slot)
        else {
            return;
        };

        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        client.locate_token = None;
        client.location = args.args_from(2);
        if let Err(e) = client.userinfo.set("location", &client.location) {
            warn!("Could not store location for {}: {}", client.name, e);
            return;
        }
        info!("{} is located in {}", client.name, client.location);
        self.game.on_client_userinfo_changed(slot);
    }

    fn remote_command(&mut self, from: SocketAddr, args: &CommandArgs) {
        let now = self.time;
        let password = &self.config.rcon_password;
        let valid = !password.is_empty() && args.argv(1) == password.as_str();
        let no_password = password.is_empty();

        let exempt = from.ip().is_loopback() || self.config.rcon_allowed_addr == Some(from.ip());
        if !exempt {
            let wait = if valid {
                RCON_GOOD_PASSWORD_WAIT_MS
            } else {
                RCON_BAD_PASSWORD_WAIT_MS
            };
            if let Some(last) = self.last_rcon_time {
                if now.saturating_sub(last) < wait {
                    debug!("Throttled rcon from {}", from);
                    return;
                }
            }
            self.last_rcon_time = Some(now);
        }

        let command = args.args_from(2);
        if !valid {
            warn!("Bad rcon from {}: {}", from, command);
            let reply = if no_password {
                "No rcon password set on the server.\n"
            } else {
                "Bad rcon password.\n"
            };
            self.send_oob_print(from, reply);
            return;
        }

        info!("Rcon from {}: {}", from, command);
        let output = self.execute_rcon(&command);
        for chunk in output_chunks(&output, RCON_OUTPUT_CHUNK) {
            self.send_oob_print(from, &chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::engine::tests::{active_engine, engine_with, oob_to, test_addr};
    use std::net::{IpAddr, Ipv4Addr};

    fn public(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, last)), port)
    }

    #[test]
    fn test_output_chunks_split_on_lines() {
        let text = "aaaa\nbbbb\ncccc\n";
        assert_eq!(output_chunks(text, 10), vec!["aaaa\nbbbb\n", "cccc\n"]);
        assert_eq!(output_chunks("abcdefgh", 3), vec!["abc", "def", "gh"]);
        assert!(output_chunks("", 10).is_empty());
    }

    #[test]
    fn test_getinfo_echoes_challenge() {
        let config = ServerConfig {
            hostname: "Arena".to_string(),
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("One", "A"), ("Two", "B")]);
        let from = public(1, 27960);

        engine.packet_event(from, &oob::encode("getinfo xyz"));

        let replies = oob_to(&mut engine, from);
        assert_eq!(replies.len(), 1);
        let info = InfoString::parse(replies[0].trim_start_matches("infoResponse\n")).unwrap();
        assert_eq!(info.get("challenge"), "xyz");
        assert_eq!(info.get("hostname"), "Arena");
        assert_eq!(info.get("clients"), "2");
        assert_eq!(info.get("protocol"), "68");
    }

    #[test]
    fn test_oversized_query_challenge_ignored() {
        let mut engine = engine_with(ServerConfig::default());
        let from = public(1, 27960);
        let long = "c".repeat(MAX_QUERY_CHALLENGE + 1);

        engine.packet_event(from, &oob::encode(&format!("getinfo {}", long)));

        assert!(oob_to(&mut engine, from).is_empty());
    }

    #[test]
    fn test_getstatus_lists_players() {
        let mut engine = active_engine(ServerConfig::default(), &[("Alpha", "A")]);
        let from = public(2, 27960);

        engine.packet_event(from, &oob::encode("getstatus 1"));

        let replies = oob_to(&mut engine, from);
        assert!(replies[0].starts_with("statusResponse\n"));
        assert!(replies[0].contains("\\challenge\\1"));
        assert!(replies[0].ends_with("\"Alpha\"\n"));
    }

    #[test]
    fn test_status_queries_throttled_per_source() {
        let mut engine = engine_with(ServerConfig::default());
        let victim = public(3, 27960);

        for _ in 0..3 {
            engine.packet_event(victim, &oob::encode("getstatus"));
        }
        assert_eq!(oob_to(&mut engine, victim).len(), 3);

        engine.packet_event(victim, &oob::encode("getstatus"));
        assert!(oob_to(&mut engine, victim).is_empty());

        let lan: SocketAddr = "192.168.1.9:27960".parse().unwrap();
        for _ in 0..10 {
            engine.packet_event(lan, &oob::encode("getinfo"));
        }
        assert_eq!(oob_to(&mut engine, lan).len(), 10);
    }

    #[test]
    fn test_challenge_without_authorize_server() {
        let mut engine = engine_with(ServerConfig::default());
        let from = public(4, 27960);

        engine.packet_event(from, &oob::encode("getchallenge"));

        let replies = oob_to(&mut engine, from);
        assert_eq!(replies.len(), 1);
        let token: i32 = replies[0]["challengeResponse ".len()..].parse().unwrap();
        assert_ne!(token, 0);
    }

    #[test]
    fn test_repeated_getchallenge_keeps_first_ping_time() {
        let mut engine = engine_with(ServerConfig::default());
        let from = public(4, 27960);

        engine.packet_event(from, &oob::encode("getchallenge"));
        let sent_at = engine.time();
        engine.take_outgoing();
        engine.frame(500);
        engine.packet_event(from, &oob::encode("getchallenge"));
        engine.take_outgoing();

        let now = engine.time();
        let token = engine.gate.challenges.issue(from, now, 120_000, &mut engine.rng).token;
        let record = engine.gate.challenges.find_token_mut(token).unwrap();
        assert_eq!(record.ping_time, Some(sent_at));
    }

    #[test]
    fn test_authorize_deferral_and_accept() {
        let auth = public(200, 27952);
        let config = ServerConfig {
            authorize_server: Some(auth),
            ..Default::default()
        };
        let mut engine = engine_with(config);
        let peer = public(5, 27960);

        engine.packet_event(peer, &oob::encode("getchallenge"));
        let outgoing = engine.take_outgoing();
        let queries: Vec<String> = outgoing
            .iter()
            .filter(|o| o.to == auth)
            .filter_map(|o| oob::payload(&o.data))
            .collect();
        assert!(outgoing.iter().all(|o| o.to != peer));
        assert_eq!(queries.len(), 1);
        let token: i32 = queries[0].split(' ').nth(1).unwrap().parse().unwrap();

        // Only the authorization server may answer
        engine.packet_event(public(6, 27952), &oob::encode(&format!("ipAuthorize {} accept", token)));
        assert!(oob_to(&mut engine, peer).is_empty());

        engine.packet_event(auth, &oob::encode(&format!("ipAuthorize {} accept", token)));
        assert_eq!(oob_to(&mut engine, peer), vec![format!("challengeResponse {}", token)]);
    }

    #[test]
    fn test_authorize_denial_discards_challenge() {
        let auth = public(200, 27952);
        let config = ServerConfig {
            authorize_server: Some(auth),
            ..Default::default()
        };
        let mut engine = engine_with(config);
        let peer = public(5, 27960);

        engine.packet_event(peer, &oob::encode("getchallenge"));
        let token = engine.gate.challenges.issue(peer, 0, 120_000, &mut engine.rng).token;
        engine.take_outgoing();

        engine.packet_event(auth, &oob::encode(&format!("ipAuthorize {} deny", token)));

        assert_eq!(oob_to(&mut engine, peer), vec!["print\nSomeone is using this CD Key\n"]);
        assert!(engine.gate.challenges.find_token_mut(token).is_none());
    }

    #[test]
    fn test_silent_authorize_server_defaults_to_admit() {
        let auth = public(200, 27952);
        let config = ServerConfig {
            authorize_server: Some(auth),
            ..Default::default()
        };
        let mut engine = engine_with(config);
        let peer = public(5, 27960);

        engine.packet_event(peer, &oob::encode("getchallenge"));
        engine.take_outgoing();
        engine.frame(AUTHORIZE_TIMEOUT_MS + 100);
        engine.take_outgoing();

        engine.packet_event(peer, &oob::encode("getchallenge"));
        let replies = oob_to(&mut engine, peer);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("challengeResponse "));
    }

    #[test]
    fn test_locate_response_sets_location() {
        let locator = public(201, 27953);
        let config = ServerConfig {
            locator_server: Some(locator),
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Traveller", "A")]);
        engine.clients.get_mut(0).unwrap().locate_token = Some(99);

        engine.packet_event(locator, &oob::encode("ip2locResponse 99 Lisbon, Portugal"));

        let client = engine.clients.get(0).unwrap();
        assert_eq!(client.location, "Lisbon, Portugal");
        assert_eq!(client.userinfo.get("location"), "Lisbon, Portugal");
        assert!(client.locate_token.is_none());
    }

    #[test]
    fn test_rcon_password_and_throttle() {
        let config = ServerConfig {
            rcon_password: "hunter2".to_string(),
            ..Default::default()
        };
        let mut engine = engine_with(config);
        let admin = public(7, 27960);

        engine.packet_event(admin, &oob::encode("rcon wrong status"));
        assert_eq!(oob_to(&mut engine, admin), vec!["print\nBad rcon password.\n"]);

        // Too soon after the last attempt
        engine.packet_event(admin, &oob::encode("rcon hunter2 status"));
        assert!(oob_to(&mut engine, admin).is_empty());

        engine.frame(650);
        engine.take_outgoing();
        engine.packet_event(admin, &oob::encode("rcon hunter2 status"));
        let replies = oob_to(&mut engine, admin);
        assert!(!replies.is_empty());
        assert!(replies[0].starts_with("print\nmap: ut4_abbey"));
    }

    #[test]
    fn test_rcon_without_password_configured() {
        let mut engine = engine_with(ServerConfig::default());
        let from = public(8, 27960);

        engine.packet_event(from, &oob::encode("rcon anything status"));

        assert_eq!(
            oob_to(&mut engine, from),
            vec!["print\nNo rcon password set on the server.\n"]
        );
    }

    #[test]
    fn test_connectionless_disconnect_ignored() {
        let mut engine = active_engine(ServerConfig::default(), &[("Player", "A")]);

        engine.packet_event(test_addr(27960), &oob::encode("disconnect"));

        assert_eq!(engine.clients.get(0).unwrap().state(), ClientState::Active);
    }
}
