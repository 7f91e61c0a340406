//! Fixed-rate frame driver: simulation ticks, ping, timeouts, outbound flush
//! and master heartbeats.

use crate::client_manager::ClientState;
use crate::engine::Engine;
use crate::game::{GameEvent, GameModule};
use crate::rewards::describe;
use log::info;

/// Interval between regular master heartbeats
pub const HEARTBEAT_MSEC: u64 = 300 * 1000;
/// Consecutive silent checks before a session is timed out
pub const TIMEOUT_CHECKS: u32 = 5;
/// The world clock is reset by reloading the map before it gets near wrapping
pub const WORLD_TIME_WRAP: u64 = 0x7000_0000;

const SHUTDOWN_MESSAGE: &str = "Server shutdown";

/// What the network loop should do after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The engine has said goodbye; stop the loop
    Shutdown,
    /// Not enough time has passed for a tick; wait this many milliseconds at most
    Sleep(u64),
    /// One or more ticks ran
    Ran,
}

impl<G: GameModule> Engine<G> {
    /// Advances the server by `elapsed_ms` of wall-clock time.
    pub fn frame(&mut self, elapsed_ms: u64) -> FrameOutcome {
        if self.shutdown_requested {
            if !self.stopped {
                self.shutdown(SHUTDOWN_MESSAGE);
            }
            return FrameOutcome::Shutdown;
        }

        self.install_pending_config();

        let frame_msec = self.config.frame_msec();
        self.residual += elapsed_ms;
        if self.residual < frame_msec {
            return FrameOutcome::Sleep(frame_msec - self.residual);
        }

        if self.world.time > WORLD_TIME_WRAP {
            info!("World clock near wraparound, reloading {}", self.world.map_name);
            let map = self.world.map_name.clone();
            let cheats = self.world.cheats;
            self.spawn_map(&map, cheats);
        }

        self.clients.calc_pings();

        while self.residual >= frame_msec {
            self.residual -= frame_msec;
            self.time += frame_msec;
            self.world.time += frame_msec;
            self.game.on_run_frame(self.world.time);
        }

        self.process_game_events();
        self.check_timeouts();
        self.send_client_messages();
        self.heartbeat(false);
        FrameOutcome::Ran
    }

    /// Hands out kill and flag rewards for the events of the last ticks
    fn process_game_events(&mut self) {
        for event in self.game.drain_events() {
            match event {
                GameEvent::Kill { killer, victim, cause } => {
                    if !self.config.kill_rewards || killer == victim {
                        continue;
                    }
                    let action = match self.clients.get_mut(killer) {
                        Some(client) if client.in_world() => client.rewards.for_kill(cause, &mut self.rng),
                        _ => None,
                    };
                    if let Some(action) = action {
                        self.game.apply(killer, action);
                        self.print_to(killer, &describe(&action));
                    }
                }
                GameEvent::FlagTaken { slot } => {
                    if !self.config.kill_rewards {
                        continue;
                    }
                    let action = match self.clients.get_mut(slot) {
                        Some(client) if client.in_world() => client.rewards.for_flag(&mut self.rng),
                        _ => None,
                    };
                    if let Some(action) = action {
                        self.game.apply(slot, action);
                        self.print_to(slot, &describe(&action));
                    }
                }
                GameEvent::Spawn { slot } => {
                    if let Some(client) = self.clients.get_mut(slot) {
                        client.rewards.reset();
                    }
                }
            }
        }
    }

    /// Drops silent sessions and frees expired zombies
    fn check_timeouts(&mut self) {
        let now = self.time;
        let drop_point = now.saturating_sub(self.config.timeout_secs * 1000);
        let zombie_point = now.saturating_sub(self.config.zombie_time_secs * 1000);

        for slot in 0..self.clients.capacity() {
            let Some(client) = self.clients.get_mut(slot) else {
                continue;
            };
            if client.is_bot {
                continue;
            }
            // Clock adjustments must not leave a session in the future
            if client.last_packet_time > now {
                client.last_packet_time = now;
            }

            if client.state() == ClientState::Zombie {
                if client.last_packet_time < zombie_point {
                    info!("Freeing zombie slot {}", slot);
                    self.free_slot(slot);
                }
                continue;
            }

            if client.state() >= ClientState::Connected && client.last_packet_time < drop_point {
                client.timeout_count += 1;
                if client.timeout_count > TIMEOUT_CHECKS {
                    self.drop_client(slot, "timed out");
                    self.free_slot(slot);
                }
            } else {
                client.timeout_count = 0;
            }
        }
    }

    /// Tells every session goodbye and stops the engine
    pub fn shutdown(&mut self, reason: &str) {
        info!("Shutting down: {}", reason);
        // Sent twice in case the first is lost
        for _ in 0..2 {
            for slot in 0..self.clients.capacity() {
                let state = match self.clients.get(slot) {
                    Some(client) => client.state(),
                    None => continue,
                };
                if state >= ClientState::Primed {
                    let command = format!("print \"{}\n\"", reason);
                    let disconnect = format!("disconnect \"{}\"", reason);
                    if let Some(client) = self.clients.get_mut(slot) {
                        // Overflow is irrelevant on the way out
                        let _ = client.queue_reliable(&command);
                        let _ = client.queue_reliable(&disconnect);
                    }
                    self.send_client_message(slot);
                } else if state == ClientState::Connected {
                    if let Some(addr) = self.clients.get(slot).and_then(|c| c.addr()) {
                        self.send_oob(addr, "disconnect");
                    }
                }
            }
        }

        for _ in 0..2 {
            self.send_heartbeat("flatline");
        }
        self.shutdown_requested = true;
        self.stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::engine::tests::{active_engine, engine_with, oob_to, printed, test_addr};
    use crate::game::{GameAction, KillCause};
    use shared::{NetSide, Netchan};

    fn fast_config() -> ServerConfig {
        ServerConfig {
            sv_fps: 20,
            timeout_secs: 1,
            zombie_time_secs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_short_frame_sleeps() {
        let mut engine = engine_with(ServerConfig::default());

        assert_eq!(engine.frame(10), FrameOutcome::Sleep(40));
        assert_eq!(engine.frame(20), FrameOutcome::Sleep(20));
        assert_eq!(engine.time(), 0);
    }

    #[test]
    fn test_whole_ticks_are_consumed() {
        let mut engine = engine_with(ServerConfig::default());
        let frames_before = engine.game().frames;

        assert_eq!(engine.frame(130), FrameOutcome::Ran);

        assert_eq!(engine.time(), 100);
        assert_eq!(engine.residual, 30);
        assert_eq!(engine.world().time, 100);
        assert_eq!(engine.game().frames, frames_before + 2);
    }

    #[test]
    fn test_silent_session_times_out_after_repeated_checks() {
        let mut engine = active_engine(fast_config(), &[("Quiet", "A"), ("Chatty", "B")]);

        for _ in 0..40 {
            engine.clients.get_mut(1).unwrap().last_packet_time = engine.time();
            engine.frame(50);
        }

        assert!(engine.clients.get(0).unwrap().is_free());
        assert_eq!(engine.clients.get(1).unwrap().state(), ClientState::Active);
        assert!(printed(&engine, 1).iter().any(|l| l.contains("Quiet^7 timed out")));
    }

    #[test]
    fn test_zombie_freed_after_retention() {
        let mut engine = active_engine(fast_config(), &[("Leaver", "A")]);
        engine.drop_client(0, "disconnected");
        engine.clients.get_mut(0).unwrap().last_packet_time = 0;

        engine.frame(500);
        assert_eq!(engine.clients.get(0).unwrap().state(), ClientState::Zombie);

        engine.frame(1000);
        assert!(engine.clients.get(0).unwrap().is_free());
    }

    #[test]
    fn test_kill_reward_goes_to_killer() {
        let config = ServerConfig {
            kill_rewards: true,
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Killer", "A"), ("Victim", "B")]);
        engine.game_mut().push_event(GameEvent::Kill {
            killer: 0,
            victim: 1,
            cause: KillCause::Pistol,
        });

        engine.frame(50);

        let state = engine.game().player_state(0).unwrap();
        assert_eq!(state.weapons.len(), 1);
        assert!(printed(&engine, 0).iter().any(|l| l.contains("You got a")));
    }

    #[test]
    fn test_suicide_earns_nothing() {
        let config = ServerConfig {
            kill_rewards: true,
            ..Default::default()
        };
        let mut engine = active_engine(config, &[("Jumper", "A")]);
        engine.game_mut().push_event(GameEvent::Kill {
            killer: 0,
            victim: 0,
            cause: KillCause::Knife,
        });
        engine.game_mut().apply(0, GameAction::AddHealth(-50));

        engine.frame(50);

        assert_eq!(engine.game().player_state(0).unwrap().health, 50);
    }

    #[test]
    fn test_shutdown_says_goodbye_twice() {
        let mut engine = active_engine(ServerConfig::default(), &[("Player", "A")]);
        let pending = test_addr(6000);
        let client = engine.clients.get_mut(1).unwrap();
        client.netchan = Some(Netchan::new(NetSide::Server, pending, 9));
        client.set_state(ClientState::Connected);
        engine.set_master_servers(vec![test_addr(27950)]);

        engine.request_shutdown();
        assert_eq!(engine.frame(0), FrameOutcome::Shutdown);

        assert!(engine.is_stopped());
        let disconnects = engine
            .clients
            .get(0)
            .unwrap()
            .unacknowledged()
            .filter(|(_, c)| *c == "disconnect \"Server shutdown\"")
            .count();
        assert_eq!(disconnects, 2);

        let outgoing = engine.take_outgoing();
        let flatlines = outgoing
            .iter()
            .filter(|o| o.to == test_addr(27950))
            .filter_map(|o| shared::oob::payload(&o.data))
            .filter(|t| t == "heartbeat flatline\n")
            .count();
        assert_eq!(flatlines, 2);
        let goodbyes = outgoing
            .iter()
            .filter(|o| o.to == pending)
            .filter_map(|o| shared::oob::payload(&o.data))
            .filter(|t| t == "disconnect")
            .count();
        assert_eq!(goodbyes, 2);
    }

    #[test]
    fn test_heartbeat_interval() {
        let mut engine = engine_with(ServerConfig::default());
        let master = test_addr(27950);
        engine.set_master_servers(vec![master]);

        engine.frame(50);
        assert_eq!(oob_to(&mut engine, master), vec!["heartbeat QuakeArena-1\n".to_string()]);

        engine.frame(50);
        assert!(oob_to(&mut engine, master).is_empty());

        engine.frame(HEARTBEAT_MSEC);
        assert_eq!(oob_to(&mut engine, master).len(), 1);
    }
}
