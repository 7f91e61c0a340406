//! Kill rewards: random weapons, items and health handed to killers.
//!
//! Draws come from per-player shuffle bags so the same weapon is not handed
//! out twice until every option has been drawn once.

use crate::game::{GameAction, Item, KillCause, Weapon};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::VecDeque;

/// Health restored for a knife kill, drawn uniformly from this range
const KNIFE_HEALTH: std::ops::RangeInclusive<i32> = 10..=30;

/// A permutation of the remaining choices, refilled and reshuffled when empty
#[derive(Debug, Clone)]
pub struct ShuffleBag<T: Clone> {
    options: Vec<T>,
    remaining: VecDeque<T>,
}

impl<T: Clone> ShuffleBag<T> {
    pub fn new(options: Vec<T>) -> Self {
        Self {
            options,
            remaining: VecDeque::new(),
        }
    }

    /// Draws the next option; `None` only when the bag has no options at all
    pub fn draw<R: Rng>(&mut self, rng: &mut R) -> Option<T> {
        if self.remaining.is_empty() {
            let mut refill = self.options.clone();
            refill.shuffle(rng);
            self.remaining = refill.into();
        }
        self.remaining.pop_front()
    }

    /// Forgets what has been drawn so far
    pub fn reset(&mut self) {
        self.remaining.clear();
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

/// Per-player reward state
#[derive(Debug, Clone)]
pub struct RewardBags {
    pub weapons: ShuffleBag<Weapon>,
    pub items: ShuffleBag<Item>,
}

impl Default for RewardBags {
    fn default() -> Self {
        Self {
            weapons: ShuffleBag::new(Weapon::ALL.to_vec()),
            items: ShuffleBag::new(Item::ALL.to_vec()),
        }
    }
}

impl RewardBags {
    pub fn reset(&mut self) {
        self.weapons.reset();
        self.items.reset();
    }

    /// Reward for a kill by this player, if the cause earns one
    pub fn for_kill<R: Rng>(&mut self, cause: KillCause, rng: &mut R) -> Option<GameAction> {
        match cause {
            KillCause::Pistol => self.weapons.draw(rng).map(GameAction::GiveWeapon),
            KillCause::KnifeThrown | KillCause::Grenade => {
                self.items.draw(rng).map(GameAction::GiveItem)
            }
            KillCause::Knife => Some(GameAction::AddHealth(rng.gen_range(KNIFE_HEALTH))),
            KillCause::Other => None,
        }
    }

    /// Reward for picking up the enemy flag
    pub fn for_flag<R: Rng>(&mut self, rng: &mut R) -> Option<GameAction> {
        self.weapons.draw(rng).map(GameAction::GiveWeapon)
    }
}

/// Text shown to the player receiving `action`
pub fn describe(action: &GameAction) -> String {
    match action {
        GameAction::GiveWeapon(weapon) => format!("You got a {:?}", weapon),
        GameAction::GiveItem(item) => format!("You got a {:?}", item),
        GameAction::AddHealth(amount) => format!("You regained {} health", amount),
        GameAction::Teleport(_) => "You were moved".to_string(),
    }
}
