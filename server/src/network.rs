//! Server network layer: binds the UDP socket and drives the [`Engine`].
//!
//! One task owns both the socket and the engine. Each pass of the loop waits
//! for whichever comes first of an inbound datagram, the next tick deadline or
//! Ctrl+C, then hands the elapsed wall-clock time to [`Engine::frame`] and
//! flushes every queued datagram. Session state is never touched from anywhere
//! else.

use crate::engine::Engine;
use crate::error::{Result, ServerError};
use crate::game::GameModule;
use crate::tick::FrameOutcome;
use log::{debug, error, info, warn};
use shared::MAX_MSGLEN;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::Instant;

/// Longest wait between frames while nothing is due
pub const IDLE_POLL_MSEC: u64 = 1000;
/// Port assumed for a master server given without one
pub const DEFAULT_MASTER_PORT: u16 = 27950;

pub struct Server<G: GameModule> {
    socket: UdpSocket,
    engine: Engine<G>,
}

impl<G: GameModule> Server<G> {
    pub async fn bind(addr: &str, engine: Engine<G>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Server listening on {}", socket.local_addr()?);
        Ok(Self { socket, engine })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn engine(&self) -> &Engine<G> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<G> {
        &mut self.engine
    }

    /// Resolves the configured master server names; unresolvable ones are skipped
    pub async fn resolve_masters(&mut self) {
        let mut masters = Vec::new();
        for name in &self.engine.config().master_servers {
            match resolve(name).await {
                Ok(addr) => {
                    info!("Master server {} resolved to {}", name, addr);
                    masters.push(addr);
                }
                Err(e) => warn!("Master server {}: {}", name, e),
            }
        }
        self.engine.set_master_servers(masters);
    }

    /// Runs until the engine shuts down, either by operator command or Ctrl+C.
    pub async fn run(&mut self) -> Result<()> {
        self.resolve_masters().await;
        self.engine.heartbeat(true);
        self.flush().await;

        let mut buffer = vec![0u8; MAX_MSGLEN];
        let mut last_frame = Instant::now();
        let mut wait = 0;

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => {
                        self.engine.packet_event(from, &buffer[..len]);
                        self.flush().await;
                    }
                    // ICMP port unreachable surfaces here on some platforms
                    Err(e) => debug!("Receive failed: {}", e),
                },
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
                result = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    if let Err(e) = result {
                        error!("Could not listen for Ctrl+C: {}", e);
                    } else {
                        info!("Received Ctrl+C, shutting down");
                        self.engine.request_shutdown();
                    }
                }
            }

            let elapsed = last_frame.elapsed().as_millis() as u64;
            last_frame += Duration::from_millis(elapsed);

            let outcome = self.engine.frame(elapsed);
            self.flush().await;
            wait = match outcome {
                FrameOutcome::Shutdown => break,
                FrameOutcome::Sleep(ms) => ms.min(IDLE_POLL_MSEC),
                FrameOutcome::Ran => self.engine.config().frame_msec(),
            };
        }

        info!("Server stopped");
        Ok(())
    }

    async fn flush(&mut self) {
        for datagram in self.engine.take_outgoing() {
            if let Err(e) = self.socket.send_to(&datagram.data, datagram.to).await {
                error!("Failed to send {} bytes to {}: {}", datagram.data.len(), datagram.to, e);
            }
        }
    }
}

/// Resolves `host[:port]`, defaulting the port for masters
pub async fn resolve(name: &str) -> Result<SocketAddr> {
    let target = if name.contains(':') {
        name.to_string()
    } else {
        format!("{}:{}", name, DEFAULT_MASTER_PORT)
    };
    let mut addrs = lookup_host(target.as_str())
        .await
        .map_err(|_| ServerError::Resolve(name.to_string()))?;
    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ServerError::Resolve(name.to_string()))
}
