//! Game module interface and the built-in arena simulation.
//!
//! The engine never inspects gameplay beyond [`PlayerState`]; everything else
//! goes through the [`GameModule`] hooks. [`ArenaGame`] is the module the server
//! binary runs when no other one is plugged in: free movement on a flat floor,
//! team changes and suicides, enough to exercise every hook.

use log::{debug, info};
use shared::{CommandArgs, EntityState, UserCmd};

pub const PLAYER_SPEED: f32 = 320.0;
pub const GRAVITY: f32 = 800.0;
pub const JUMP_VELOCITY: f32 = 270.0;
pub const FLOOR_Z: f32 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Team {
    #[default]
    Free,
    Red,
    Blue,
    Spectator,
}

impl Team {
    pub fn from_arg(arg: &str) -> Option<Team> {
        match arg.to_ascii_lowercase().as_str() {
            "r" | "red" => Some(Team::Red),
            "b" | "blue" => Some(Team::Blue),
            "s" | "spectator" => Some(Team::Spectator),
            "f" | "free" => Some(Team::Free),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weapon {
    Spas12,
    Mp5k,
    Ump45,
    Hk69,
    Lr300,
    G36,
    Psg1,
    Sr8,
    Ak103,
    Negev,
    M4,
}

impl Weapon {
    pub const ALL: [Weapon; 11] = [
        Weapon::Spas12,
        Weapon::Mp5k,
        Weapon::Ump45,
        Weapon::Hk69,
        Weapon::Lr300,
        Weapon::G36,
        Weapon::Psg1,
        Weapon::Sr8,
        Weapon::Ak103,
        Weapon::Negev,
        Weapon::M4,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item {
    Kevlar,
    Helmet,
    Medkit,
    Silencer,
    ExtraAmmo,
}

impl Item {
    pub const ALL: [Item; 5] = [
        Item::Kevlar,
        Item::Helmet,
        Item::Medkit,
        Item::Silencer,
        Item::ExtraAmmo,
    ];
}

/// How a kill happened, as far as rewards care
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillCause {
    Knife,
    KnifeThrown,
    Pistol,
    Grenade,
    Other,
}

/// Notifications the game module hands back to the engine after a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    Kill {
        killer: usize,
        victim: usize,
        cause: KillCause,
    },
    FlagTaken {
        slot: usize,
    },
    Spawn {
        slot: usize,
    },
}

/// Changes the engine may ask the game module to make to a player
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GameAction {
    GiveWeapon(Weapon),
    GiveItem(Item),
    AddHealth(i32),
    Teleport([f32; 3]),
}

/// The slice of a player's state the engine is allowed to read
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub origin: [f32; 3],
    pub velocity: [f32; 3],
    pub health: i32,
    pub team: Team,
    pub on_ground: bool,
    pub score: i32,
    pub weapons: Vec<Weapon>,
    pub items: Vec<Item>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            origin: [0.0, 0.0, FLOOR_Z],
            velocity: [0.0; 3],
            health: 100,
            team: Team::Free,
            on_ground: true,
            score: 0,
            weapons: Vec::new(),
            items: Vec::new(),
        }
    }
}

impl PlayerState {
    pub fn is_alive(&self) -> bool {
        self.health > 0
    }

    pub fn is_still(&self) -> bool {
        self.velocity.iter().all(|v| *v == 0.0)
    }
}

/// Hooks the engine calls into. Slots are plain indices into the session table.
pub trait GameModule {
    /// Returns a reason to refuse the connection, or `None` to accept it
    fn on_client_connect(&mut self, slot: usize, first_time: bool, is_bot: bool) -> Option<String>;

    fn on_client_begin(&mut self, slot: usize);

    fn on_client_disconnect(&mut self, slot: usize);

    fn on_client_userinfo_changed(&mut self, _slot: usize) {}

    /// A command the engine did not handle itself
    fn on_client_command(&mut self, slot: usize, args: &CommandArgs);

    fn on_client_think(&mut self, slot: usize, cmd: &UserCmd);

    fn on_run_frame(&mut self, world_time: u64);

    fn player_state(&self, slot: usize) -> Option<&PlayerState>;

    fn apply(&mut self, _slot: usize, _action: GameAction) {}

    /// Events produced since the last call
    fn drain_events(&mut self) -> Vec<GameEvent> {
        Vec::new()
    }

    /// Entity baselines sent with the gamestate
    fn baselines(&self) -> Vec<EntityState> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Default)]
struct ArenaPlayer {
    state: PlayerState,
    in_world: bool,
    last_cmd: UserCmd,
}

/// Minimal free-movement game used by the server binary
#[derive(Debug, Default)]
pub struct ArenaGame {
    players: Vec<Option<ArenaPlayer>>,
    events: Vec<GameEvent>,
    last_frame_time: u64,
    pub frames: u64,
}

impl ArenaGame {
    pub fn new(max_clients: usize) -> Self {
        Self {
            players: vec![None; max_clients],
            ..Default::default()
        }
    }

    /// Queues an event for the engine, as game rules would after a frag or a capture
    pub fn push_event(&mut self, event: GameEvent) {
        self.events.push(event);
    }

    fn player_mut(&mut self, slot: usize) -> Option<&mut ArenaPlayer> {
        self.players.get_mut(slot).and_then(Option::as_mut)
    }

    fn spawn_origin(slot: usize) -> [f32; 3] {
        [64.0 * slot as f32, 0.0, FLOOR_Z]
    }

    /// Advances every player in the world by `dt` seconds
    fn update_physics(&mut self, dt: f32) {
        for player in self.players.iter_mut().flatten() {
            if !player.in_world || !player.state.is_alive() {
                continue;
            }
            let state = &mut player.state;
            if !state.on_ground {
                state.velocity[2] -= GRAVITY * dt;
            }
            for axis in 0..3 {
                state.origin[axis] += state.velocity[axis] * dt;
            }
            if state.origin[2] <= FLOOR_Z {
                state.origin[2] = FLOOR_Z;
                state.velocity[2] = 0.0;
                state.on_ground = true;
            }
        }
    }
}

impl GameModule for ArenaGame {
    fn on_client_connect(&mut self, slot: usize, first_time: bool, is_bot: bool) -> Option<String> {
        if slot >= self.players.len() {
            self.players.resize(slot + 1, None);
        }
        if first_time || self.players[slot].is_none() {
            let state = PlayerState {
                origin: Self::spawn_origin(slot),
                ..Default::default()
            };
            self.players[slot] = Some(ArenaPlayer {
                state,
                ..Default::default()
            });
        }
        debug!("Game accepted slot {} (bot: {})", slot, is_bot);
        None
    }

    fn on_client_begin(&mut self, slot: usize) {
        if let Some(player) = self.player_mut(slot) {
            player.in_world = true;
            info!("Slot {} entered the arena", slot);
            self.events.push(GameEvent::Spawn { slot });
        }
    }

    fn on_client_disconnect(&mut self, slot: usize) {
        if let Some(player) = self.players.get_mut(slot) {
            *player = None;
        }
    }

    fn on_client_command(&mut self, slot: usize, args: &CommandArgs) {
        match args.command().to_ascii_lowercase().as_str() {
            "kill" => {
                if let Some(player) = self.player_mut(slot) {
                    player.state.health = 0;
                    player.state.score -= 1;
                    self.events.push(GameEvent::Kill {
                        killer: slot,
                        victim: slot,
                        cause: KillCause::Other,
                    });
                }
            }
            "team" => {
                let team = Team::from_arg(args.argv(1));
                if let (Some(team), Some(player)) = (team, self.player_mut(slot)) {
                    player.state.team = team;
                    player.state.health = 100;
                    self.events.push(GameEvent::Spawn { slot });
                }
            }
            other => debug!("Arena ignores command {:?} from slot {}", other, slot),
        }
    }

    fn on_client_think(&mut self, slot: usize, cmd: &UserCmd) {
        if let Some(player) = self.player_mut(slot) {
            let state = &mut player.state;
            if state.team == Team::Spectator || !state.is_alive() {
                player.last_cmd = *cmd;
                return;
            }
            state.velocity[0] = PLAYER_SPEED * cmd.forward_move as f32 / 127.0;
            state.velocity[1] = PLAYER_SPEED * cmd.right_move as f32 / 127.0;
            if cmd.up_move > 0 && state.on_ground {
                state.velocity[2] = JUMP_VELOCITY;
                state.on_ground = false;
            }
            player.last_cmd = *cmd;
        }
    }

    fn on_run_frame(&mut self, world_time: u64) {
        let dt = world_time.saturating_sub(self.last_frame_time) as f32 / 1000.0;
        self.last_frame_time = world_time;
        self.frames += 1;
        if dt > 0.0 {
            self.update_physics(dt.min(0.25));
        }
    }

    fn player_state(&self, slot: usize) -> Option<&PlayerState> {
        self.players
            .get(slot)
            .and_then(Option::as_ref)
            .map(|p| &p.state)
    }

    fn apply(&mut self, slot: usize, action: GameAction) {
        let Some(player) = self.player_mut(slot) else {
            return;
        };
        let state = &mut player.state;
        match action {
            GameAction::GiveWeapon(weapon) => {
                if !state.weapons.contains(&weapon) {
                    state.weapons.push(weapon);
                }
            }
            GameAction::GiveItem(item) => {
                if !state.items.contains(&item) {
                    state.items.push(item);
                }
            }
            GameAction::AddHealth(amount) => {
                state.health = (state.health + amount).clamp(0, 100);
            }
            GameAction::Teleport(origin) => {
                state.origin = origin;
                state.velocity = [0.0; 3];
            }
        }
    }

    fn drain_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    fn baselines(&self) -> Vec<EntityState> {
        self.players
            .iter()
            .enumerate()
            .filter_map(|(slot, p)| p.as_ref().map(|p| (slot, p)))
            .map(|(slot, player)| EntityState {
                number: slot as u16,
                e_type: 1,
                origin: player.state.origin,
                client_num: slot as u8,
                ..Default::default()
            })
            .collect()
    }
}
