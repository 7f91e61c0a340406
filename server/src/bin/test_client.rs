//! Minimal protocol client: challenge, connect, gamestate, a few seconds of
//! movement, then a clean disconnect. Useful for checking a running server.

use clap::Parser;
use shared::{
    move_key, oob, parse_server_message, ClientMessage, InfoString, NetSide, Netchan, ServerMessage,
    UserCmd, CS_SYSTEMINFO, MAX_MSGLEN, MAX_RELIABLE_COMMANDS, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

/// How long to keep resending `disconnect` before giving up on an answer
const LINGER: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:27960")]
    server: SocketAddr,
    /// Player name sent in the userinfo
    #[clap(short, long, default_value = "TestClient")]
    name: String,
    /// Seconds to stay in the game
    #[clap(short, long, default_value = "5")]
    duration: u64,
    /// Milliseconds between movement packets
    #[clap(long, default_value = "50")]
    move_interval: u64,
}

/// What the client knows about its session
struct Session {
    chan: Netchan,
    server_id: i32,
    checksum_feed: i32,
    /// Server commands by sequence, for the movement key
    server_commands: Vec<String>,
    reliable_ack: i32,
    command_sequence: i32,
    pending_commands: Vec<(i32, String)>,
    server_time: i32,
    snapshots: u32,
    dropped: bool,
}

impl Session {
    fn new(server: SocketAddr, qport: u16) -> Self {
        Self {
            chan: Netchan::new(NetSide::Client, server, qport),
            server_id: 0,
            checksum_feed: 0,
            server_commands: vec![String::new(); MAX_RELIABLE_COMMANDS],
            reliable_ack: 0,
            command_sequence: 0,
            pending_commands: Vec::new(),
            server_time: 0,
            snapshots: 0,
            dropped: false,
        }
    }

    fn absorb(&mut self, message: ServerMessage) {
        for (sequence, text) in message.commands {
            if sequence > self.reliable_ack {
                println!("Server command {}: {}", sequence, text);
                self.dropped |= text.starts_with("disconnect");
                self.server_commands[sequence as usize % MAX_RELIABLE_COMMANDS] = text;
                self.reliable_ack = sequence;
            }
        }
        // Commands the server has seen no longer need resending
        self.pending_commands
            .retain(|(sequence, _)| *sequence > message.last_client_command);

        if let Some(gamestate) = message.gamestate {
            let systeminfo = gamestate
                .configstring(CS_SYSTEMINFO as u16)
                .and_then(|s| InfoString::parse(s).ok())
                .unwrap_or_default();
            self.server_id = systeminfo.get("sv_serverid").parse().unwrap_or(0);
            self.checksum_feed = gamestate.checksum_feed;
            println!(
                "Gamestate: slot {}, server id {}, {} config strings",
                gamestate.client_num,
                self.server_id,
                gamestate.configstrings.len()
            );
        }
        if let Some(snapshot) = message.snapshot {
            self.server_time = snapshot.server_time;
            self.snapshots += 1;
        }
        for block in message.downloads {
            if let Some(error) = block.error {
                println!("Download refused: {}", error);
            }
        }
    }

    fn queue_command(&mut self, text: &str) {
        self.command_sequence += 1;
        self.pending_commands.push((self.command_sequence, text.to_string()));
    }

    fn next_datagrams(&mut self) -> Result<Vec<Vec<u8>>, Box<dyn std::error::Error>> {
        let message_ack = self.chan.incoming_sequence() as i32;
        let last_command = &self.server_commands[self.reliable_ack as usize % MAX_RELIABLE_COMMANDS];
        let key = move_key(self.checksum_feed, message_ack, last_command);

        let mut message = ClientMessage::new(self.server_id, message_ack, self.reliable_ack)?;
        for (sequence, text) in &self.pending_commands {
            message.command(*sequence, text)?;
        }
        if self.server_id != 0 {
            let cmd = UserCmd {
                server_time: self.server_time,
                forward_move: 127,
                ..Default::default()
            };
            message.moves(key, &[cmd], false)?;
        }
        Ok(self.chan.transmit(&message.finish()?)?)
    }
}

async fn request(
    socket: &UdpSocket,
    server: SocketAddr,
    text: &str,
    expect: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut buf = vec![0u8; MAX_MSGLEN];
    for attempt in 1..=3 {
        println!("Sending {:?} (attempt {})", text, attempt);
        socket.send_to(&oob::encode(text), server).await?;
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(received) = timeout(remaining, socket.recv_from(&mut buf)).await else {
                break;
            };
            let (len, from) = received?;
            let Some(reply) = oob::payload(&buf[..len]).filter(|_| from == server) else {
                continue;
            };
            if reply.starts_with(expect) {
                return Ok(reply);
            }
            if let Some(message) = reply.strip_prefix("print\n") {
                return Err(format!("Server refused: {}", message.trim_end()).into());
            }
        }
    }
    Err(format!("No {} from {}", expect, server).into())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    let reply = request(&socket, args.server, "getchallenge", "challengeResponse").await?;
    let challenge = oob::CommandArgs::tokenize(&reply).argv(1).to_string();
    println!("Challenge {}", challenge);

    let qport = rand::random::<u16>();
    let protocol = PROTOCOL_VERSION.to_string();
    let qport_text = qport.to_string();
    let mut userinfo = InfoString::default();
    for (key, value) in [
        ("name", args.name.as_str()),
        ("protocol", protocol.as_str()),
        ("challenge", challenge.as_str()),
        ("qport", qport_text.as_str()),
        ("rate", "25000"),
        ("snaps", "20"),
    ] {
        userinfo.set(key, value)?;
    }
    request(
        &socket,
        args.server,
        &format!("connect \"{}\"", userinfo),
        "connectResponse",
    )
    .await?;
    println!("Connected with qport {}", qport);

    let mut session = Session::new(args.server, qport);
    let mut buf = vec![0u8; MAX_MSGLEN];
    let mut ticker = tokio::time::interval(Duration::from_millis(args.move_interval));
    let finish = Instant::now() + Duration::from_secs(args.duration);
    let mut disconnecting = false;

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                if from != args.server {
                    continue;
                }
                if oob::is_connectionless(&buf[..len]) {
                    if let Some(text) = oob::payload(&buf[..len]) {
                        println!("Out-of-band: {}", text.trim_end());
                        if text.starts_with("disconnect") {
                            break;
                        }
                    }
                    continue;
                }
                match session.chan.process(&buf[..len]) {
                    Ok(Some(payload)) => match parse_server_message(&payload) {
                        Ok(message) => session.absorb(message),
                        Err(e) => println!("Unreadable server message: {}", e),
                    },
                    Ok(None) => {}
                    Err(e) => println!("Channel error: {}", e),
                }
            }
            _ = ticker.tick() => {
                if !disconnecting && Instant::now() >= finish {
                    session.queue_command("disconnect");
                    disconnecting = true;
                } else if disconnecting && (session.dropped || Instant::now() >= finish + LINGER) {
                    break;
                }
                for datagram in session.next_datagrams()? {
                    socket.send_to(&datagram, args.server).await?;
                }
            }
        }
    }

    println!(
        "Test client finished after {} snapshots (server time {})",
        session.snapshots, session.server_time
    );
    Ok(())
}
