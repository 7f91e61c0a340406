//! `connect` handling: every check a peer must pass before it gets a slot.
//!
//! Refusals that can only come from a forged or replayed packet are silent so
//! the server cannot be used to reflect traffic. Everything else answers with
//! a short out-of-band `print` and consumes no slot.

use crate::admission::{is_lan_address, CONNECT_LIMIT, CONNECT_WINDOW_MS};
use crate::client_manager::ClientState;
use crate::engine::Engine;
use crate::game::GameModule;
use crate::userinfo::{apply_userinfo, atoi, is_valid_guid};
use log::{debug, info};
use rand::Rng;
use shared::{CommandArgs, InfoString, NetSide, Netchan, PROTOCOL_VERSION};
use std::net::SocketAddr;

impl<G: GameModule> Engine<G> {
    fn refuse_connect(&mut self, to: SocketAddr, reason: &str) {
        debug!("Refused connect from {}: {}", to, reason);
        self.send_oob_print(to, &format!("{}\n", reason));
    }

    /// Admits a peer into a session slot, or tells it why not
    pub(crate) fn direct_connect(&mut self, from: SocketAddr, args: &CommandArgs) {
        let now = self.time;
        let ip = from.ip();
        let is_lan = is_lan_address(ip);

        let userinfo = match InfoString::parse(args.argv(1)) {
            Ok(userinfo) => userinfo,
            Err(_) => {
                self.refuse_connect(from, "Illegal characters in userinfo string.");
                return;
            }
        };

        if atoi(userinfo.get("protocol")) != PROTOCOL_VERSION as i64 {
            let reason = format!("Server uses protocol version {}.", PROTOCOL_VERSION);
            self.refuse_connect(from, &reason);
            return;
        }

        let token = atoi(userinfo.get("challenge")) as i32;
        let qport = atoi(userinfo.get("qport")) as u16;

        let mut ping = 0;
        if !ip.is_loopback() {
            let ttl = self.config.challenge_ttl_ms;
            let Some(record) = self.gate.challenges.validate(from, token, now, ttl) else {
                debug!("Connect from {} without a valid challenge", from);
                return;
            };
            if !record.connected {
                record.ping = now.saturating_sub(record.ping_time.unwrap_or(now));
                record.connected = true;
            }
            ping = record.ping;
        }

        if self.config.limit_connect_packets
            && !self.gate.connects.admit(ip, now, CONNECT_WINDOW_MS, CONNECT_LIMIT)
        {
            debug!("Connect rate limit hit by {}", from);
            return;
        }

        if self.bans.is_banned(ip) {
            self.refuse_connect(from, "You are banned from this server.");
            return;
        }

        let existing = self.clients.find_reconnect_slot(from, qport);
        if let Some(client) = existing.and_then(|slot| self.clients.get(slot)) {
            if now.saturating_sub(client.last_connect_time) < self.config.reconnect_limit_secs * 1000 {
                debug!("{}: reconnect rejected, too soon", from);
                return;
            }
        }

        if !is_lan {
            let ping = ping as u32;
            if self.config.min_ping != 0 && ping < self.config.min_ping {
                self.refuse_connect(from, "Server is for high pings only");
                return;
            }
            if self.config.max_ping != 0 && ping > self.config.max_ping {
                self.refuse_connect(from, "Server is for low pings only");
                return;
            }

            if self.config.max_clients_per_ip > 0 {
                let from_ip = self
                    .clients
                    .iter()
                    .filter(|(slot, c)| Some(*slot) != existing && c.state() >= ClientState::Connected)
                    .filter(|(_, c)| c.addr().map(|a| a.ip()) == Some(ip))
                    .count();
                if from_ip >= self.config.max_clients_per_ip {
                    self.refuse_connect(from, "Currently too many clients from your IP address.");
                    return;
                }
            }

            let wait = self.config.reconnect_wait_secs;
            if let Some(left) = self.gate.drops.cooldown_remaining(ip, qport, now, wait) {
                debug!("{} must wait {} ms before reconnecting", from, left);
                self.refuse_connect(from, "Reconnecting, please wait...");
                return;
            }

            if self.config.require_valid_guid && !is_valid_guid(userinfo.get("cl_guid")) {
                self.refuse_connect(from, "Invalid client identifier.");
                return;
            }
        }

        let private_ok = !self.config.private_password.is_empty()
            && userinfo.get("password") == self.config.private_password;
        let slot = match existing {
            Some(slot) => {
                info!("{} reconnecting into slot {}", from, slot);
                self.retire_slot(slot);
                slot
            }
            None => {
                let start = if private_ok { 0 } else { self.clients.private_clients() };
                match self.clients.find_free_slot(start) {
                    Some(slot) => slot,
                    None => {
                        self.refuse_connect(from, "Server is full.");
                        return;
                    }
                }
            }
        };

        let password_ok = private_ok
            || !self.config.needs_password()
            || userinfo.get("password") == self.config.password;

        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        client.reset();
        client.netchan = Some(Netchan::new(NetSide::Server, from, qport));
        client.userinfo = userinfo;
        client.challenge = token;
        client.is_lan = is_lan;
        client.last_connect_time = now;
        client.last_packet_time = now;
        client.next_snapshot_time = now;
        client.delta_message = -1;

        if let Err(e) = apply_userinfo(client, &self.config) {
            client.reset();
            self.refuse_connect(from, &e.to_string());
            return;
        }
        if !password_ok {
            client.reset();
            self.refuse_connect(from, "Invalid password");
            return;
        }

        if let Some(reason) = self.game.on_client_connect(slot, true, false) {
            if let Some(client) = self.clients.get_mut(slot) {
                client.reset();
            }
            self.refuse_connect(from, &reason);
            return;
        }

        let Some(client) = self.clients.get_mut(slot) else {
            return;
        };
        client.set_state(ClientState::Connected);
        info!("{} connected from {} into slot {} (ping {})", client.name, from, slot, ping);

        if let Some(locator) = self.config.locator_server {
            let locate_token: u32 = self.rng.gen();
            client.locate_token = Some(locate_token);
            self.send_oob(locator, &format!("ip2loc {} {}", locate_token, ip));
        }
        self.send_oob(from, "connectResponse");

        let count = self.clients.len();
        if count == 1 || count == self.clients.capacity() {
            self.heartbeat(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::KICK_REASON;
    use crate::bans::BanEntry;
    use crate::config::ServerConfig;
    use crate::engine::tests::{engine_with, oob_to, test_addr};
    use crate::game::ArenaGame;
    use shared::oob;

    const GUID: &str = "0123456789ABCDEF0123456789ABCDEF";

    fn challenge(engine: &mut Engine<ArenaGame>, from: SocketAddr) -> i32 {
        engine.packet_event(from, &oob::encode("getchallenge"));
        let replies = oob_to(engine, from);
        let reply = replies
            .iter()
            .find(|r| r.starts_with("challengeResponse"))
            .expect("no challenge response");
        reply["challengeResponse ".len()..].trim().parse().unwrap()
    }

    fn connect_packet(name: &str, token: i32, qport: u16, extra: &str) -> Vec<u8> {
        oob::encode(&format!(
            "connect \"\\name\\{}\\protocol\\68\\challenge\\{}\\qport\\{}\\cl_guid\\{}{}\"",
            name, token, qport, GUID, extra
        ))
    }

    fn connect(engine: &mut Engine<ArenaGame>, from: SocketAddr, qport: u16, extra: &str) -> Vec<String> {
        let token = challenge(engine, from);
        engine.packet_event(from, &connect_packet("Player", token, qport, extra));
        oob_to(engine, from)
    }

    #[test]
    fn test_handshake_reaches_connected() {
        let mut engine = engine_with(ServerConfig::default());
        let from = test_addr(40000);

        let replies = connect(&mut engine, from, 1234, "");

        assert_eq!(replies, vec!["connectResponse".to_string()]);
        let client = engine.clients.get(0).unwrap();
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.qport(), 1234);
        assert_eq!(client.name, "Player");
        assert_eq!(client.userinfo.get("ip"), from.to_string());
    }

    #[test]
    fn test_wrong_challenge_is_silent() {
        let mut engine = engine_with(ServerConfig::default());
        let from = test_addr(40000);
        let token = challenge(&mut engine, from);

        engine.packet_event(from, &connect_packet("Player", token.wrapping_add(1), 1, ""));

        assert!(oob_to(&mut engine, from).is_empty());
        assert!(engine.clients.is_empty());
    }

    #[test]
    fn test_challenge_renewed_after_expiry() {
        let mut engine = engine_with(ServerConfig::default());
        let from = test_addr(40000);
        let first = challenge(&mut engine, from);

        engine.frame(engine.config().challenge_ttl_ms + 1000);
        engine.take_outgoing();
        let second = challenge(&mut engine, from);
        assert_ne!(second, first);

        engine.packet_event(from, &connect_packet("Late", second, 7, ""));
        assert_eq!(oob_to(&mut engine, from), vec!["connectResponse".to_string()]);
    }

    #[test]
    fn test_protocol_mismatch() {
        let mut engine = engine_with(ServerConfig::default());
        let from = test_addr(40000);

        engine.packet_event(from, &oob::encode("connect \"\\name\\Old\\protocol\\43\""));

        assert_eq!(
            oob_to(&mut engine, from),
            vec!["print\nServer uses protocol version 68.\n".to_string()]
        );
    }

    #[test]
    fn test_loopback_skips_challenge() {
        let mut engine = engine_with(ServerConfig::default());
        let from: SocketAddr = "127.0.0.1:27961".parse().unwrap();

        engine.packet_event(from, &connect_packet("Host", 0, 5, ""));

        assert_eq!(oob_to(&mut engine, from), vec!["connectResponse".to_string()]);
        let client = engine.clients.get(0).unwrap();
        assert!(client.is_lan);
        assert_eq!(client.userinfo.get("ip"), "localhost");
    }

    #[test]
    fn test_banned_address_refused() {
        let mut engine = engine_with(ServerConfig::default());
        engine.bans.add(BanEntry::ban(test_addr(0).ip(), 24)).unwrap();
        let from = test_addr(40000);

        let replies = connect(&mut engine, from, 1, "");

        assert_eq!(replies, vec!["print\nYou are banned from this server.\n".to_string()]);
        assert!(engine.clients.is_empty());
    }

    #[test]
    fn test_ban_exception_admits() {
        let mut engine = engine_with(ServerConfig::default());
        engine.bans.add(BanEntry::ban(test_addr(0).ip(), 16)).unwrap();
        engine.bans.add(BanEntry::exception(test_addr(0).ip(), 32)).unwrap();

        let replies = connect(&mut engine, test_addr(40000), 1, "");

        assert_eq!(replies, vec!["connectResponse".to_string()]);
    }

    #[test]
    fn test_connect_attempts_rate_limited() {
        let mut engine = engine_with(ServerConfig::default());
        engine.bans.add(BanEntry::ban(test_addr(0).ip(), 32)).unwrap();
        let from = test_addr(40000);
        let token = challenge(&mut engine, from);

        for _ in 0..CONNECT_LIMIT {
            engine.packet_event(from, &connect_packet("Player", token, 1, ""));
            assert_eq!(oob_to(&mut engine, from).len(), 1);
        }
        engine.packet_event(from, &connect_packet("Player", token, 1, ""));

        assert!(oob_to(&mut engine, from).is_empty());
    }

    #[test]
    fn test_high_ping_only() {
        let config = ServerConfig {
            min_ping: 50,
            ..Default::default()
        };
        let mut engine = engine_with(config);

        let replies = connect(&mut engine, test_addr(40000), 1, "");

        assert_eq!(replies, vec!["print\nServer is for high pings only\n".to_string()]);
    }

    #[test]
    fn test_too_many_from_one_address() {
        let config = ServerConfig {
            max_clients_per_ip: 1,
            ..Default::default()
        };
        let mut engine = engine_with(config);

        assert_eq!(connect(&mut engine, test_addr(40000), 1, ""), vec!["connectResponse"]);
        let replies = connect(&mut engine, test_addr(40001), 2, "");

        assert_eq!(
            replies,
            vec!["print\nCurrently too many clients from your IP address.\n".to_string()]
        );
        assert_eq!(engine.clients.len(), 1);
    }

    #[test]
    fn test_kick_cooldown_outlasts_disconnect() {
        let config = ServerConfig {
            reconnect_wait_secs: 10,
            ..Default::default()
        };
        let mut engine = engine_with(config);
        let kicked = test_addr(40000);
        let leaver = test_addr(40001);
        connect(&mut engine, kicked, 1, "");
        connect(&mut engine, leaver, 2, "");
        engine.drop_client(0, KICK_REASON);
        engine.drop_client(1, "disconnected");

        engine.frame(12_000);

        let kicked_replies = connect(&mut engine, kicked, 1, "");
        assert_eq!(kicked_replies, vec!["print\nReconnecting, please wait...\n".to_string()]);
        assert_eq!(connect(&mut engine, leaver, 2, ""), vec!["connectResponse"]);
    }

    #[test]
    fn test_invalid_guid_refused() {
        let config = ServerConfig {
            require_valid_guid: true,
            ..Default::default()
        };
        let mut engine = engine_with(config);
        let from = test_addr(40000);
        let token = challenge(&mut engine, from);

        engine.packet_event(
            from,
            &oob::encode(&format!(
                "connect \"\\name\\X\\protocol\\68\\challenge\\{}\\qport\\1\\cl_guid\\nope\"",
                token
            )),
        );

        assert_eq!(oob_to(&mut engine, from), vec!["print\nInvalid client identifier.\n"]);
    }

    #[test]
    fn test_full_server_and_private_slots() {
        let config = ServerConfig {
            max_clients: 2,
            private_clients: 1,
            private_password: "vip".to_string(),
            ..Default::default()
        };
        let mut engine = engine_with(config);

        assert_eq!(connect(&mut engine, test_addr(40000), 1, ""), vec!["connectResponse"]);
        assert_eq!(
            connect(&mut engine, test_addr(40001), 2, ""),
            vec!["print\nServer is full.\n"]
        );

        let replies = connect(&mut engine, test_addr(40002), 3, "\\password\\vip");
        assert_eq!(replies, vec!["connectResponse"]);
        assert_eq!(engine.clients.get(0).unwrap().qport(), 3);
    }

    #[test]
    fn test_server_password() {
        let config = ServerConfig {
            password: "secret".to_string(),
            ..Default::default()
        };
        let mut engine = engine_with(config);

        assert_eq!(
            connect(&mut engine, test_addr(40000), 1, ""),
            vec!["print\nInvalid password\n"]
        );
        assert!(engine.clients.get(0).unwrap().is_free());
        assert_eq!(
            connect(&mut engine, test_addr(40001), 2, "\\password\\secret"),
            vec!["connectResponse"]
        );
    }

    #[test]
    fn test_reconnect_reuses_slot() {
        let mut engine = engine_with(ServerConfig::default());
        let from = test_addr(40000);
        connect(&mut engine, from, 7, "");
        engine.frame(5_000);

        let replies = connect(&mut engine, from, 7, "");

        assert_eq!(replies, vec!["connectResponse"]);
        assert_eq!(engine.clients.len(), 1);
        assert_eq!(engine.clients.get(0).unwrap().state(), ClientState::Connected);
    }

    #[test]
    fn test_locator_queried_on_connect() {
        let locator = test_addr(5000);
        let config = ServerConfig {
            locator_server: Some(locator),
            ..Default::default()
        };
        let mut engine = engine_with(config);
        let token = challenge(&mut engine, test_addr(40000));
        engine.packet_event(test_addr(40000), &connect_packet("Player", token, 1, ""));

        let queries = oob_to(&mut engine, locator);

        assert_eq!(queries.len(), 1);
        assert!(queries[0].starts_with("ip2loc "));
        assert!(engine.clients.get(0).unwrap().locate_token.is_some());
    }
}
