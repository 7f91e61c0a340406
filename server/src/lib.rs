//! # Arena Server Library
//!
//! Authoritative server core for a fast-paced arena shooter speaking the
//! classic sequenced-UDP protocol (version 68). It admits players, keeps
//! their sessions, runs the simulation at a fixed rate and streams
//! delta-compressed snapshots and file downloads back to every client.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Every player walks the same path: `getchallenge`, an optional round trip
//! to a CD key authorization service, then `connect` with a userinfo string.
//! The connect path checks the protocol, the challenge, rate limits, bans,
//! ping bounds, per-address caps, reconnection cooldowns, the client
//! identifier and passwords, in that order, before any slot is touched.
//!
//! ### Session Management
//! Each slot walks `Free -> Connected -> Primed -> Active`, falling back to
//! `Zombie` for a short grace period after a drop. The session table owns the
//! sequenced channel, the reliable command ring, flood gates and the
//! per-session download state.
//!
//! ### Command Dispatch
//! Reliable client commands are executed exactly once, in order. A gap in the
//! sequence drops the session; flooding only suppresses the effects.
//!
//! ### Snapshots and Downloads
//! Outgoing messages are paced by each client's rate and snapshot interval.
//! Downloads stream through a sliding window of acknowledged blocks.
//!
//! ## Architecture Design
//!
//! ### Socket-Free Engine
//! [`engine::Engine`] holds all state and never touches a socket. It consumes
//! datagrams through [`engine::Engine::packet_event`], advances time through
//! [`engine::Engine::frame`] and queues its replies for
//! [`engine::Engine::take_outgoing`]. Tests drive it with plain calls.
//!
//! ### Single-Threaded Event Loop
//! [`network::Server`] owns the socket and the engine on one task. The only
//! suspension point is the wait for the next datagram or tick deadline, so
//! session state is never shared.
//!
//! ### Game Module Seam
//! Gameplay lives behind [`game::GameModule`]. The core only calls its hooks
//! and never looks at gameplay state beyond what the hooks return.
//!
//! ## Module Organization
//!
//! - `admission`: challenge pool, connect rate limits, reconnect cooldowns
//! - `bans`: address ban and exception list
//! - `client_manager`: session slots and their state machine
//! - `commands`: client message parsing and reliable command dispatch
//! - `connect`, `connectionless`: the out-of-band packet handlers
//! - `admin`: operator console reached through `rcon`
//! - `scheduler`, `download`, `voice`: outbound message assembly
//! - `tick`: the fixed-rate frame driver
//! - `userinfo`, `world`, `positions`, `rewards`: supporting state
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::engine::Engine;
//! use server::game::ArenaGame;
//! use server::network::Server;
//! use server::world::PureManifest;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         hostname: "Arena".to_string(),
//!         max_clients: 12,
//!         ..Default::default()
//!     };
//!     let game = ArenaGame::new(config.max_clients);
//!     let engine = Engine::new(config, game, PureManifest::default());
//!
//!     // Runs until Ctrl+C or an rcon `killserver`
//!     let mut server = Server::bind("0.0.0.0:27960", engine).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod admission;
pub mod bans;
pub mod client_manager;
pub mod commands;
pub mod config;
pub mod connect;
pub mod connectionless;
pub mod download;
pub mod engine;
pub mod error;
pub mod game;
pub mod network;
pub mod positions;
pub mod rewards;
pub mod scheduler;
pub mod tick;
pub mod userinfo;
pub mod voice;
pub mod world;
