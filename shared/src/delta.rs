//! Delta-compressed records: entity states and keyed movement commands.
//!
//! An entity delta carries only the fields that differ from a reference record.
//! The reference is either the last state the peer acknowledged or the all-zero
//! [`EntityState::default`] when nothing has been sent yet.

use crate::msg::{CodecError, MsgReader, MsgWriter, Result};
use crate::MAX_GENTITIES;

const ENTITY_CHANGED: u8 = 0x01;
const ENTITY_REMOVED: u8 = 0x02;

/// Networked portion of a world entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityState {
    pub number: u16,
    pub e_type: u8,
    pub e_flags: u32,
    pub origin: [f32; 3],
    pub angles: [f32; 3],
    pub model_index: u16,
    pub frame: u16,
    pub event: u16,
    pub event_parm: u16,
    pub solid: u32,
    pub weapon: u8,
    pub legs_anim: u16,
    pub torso_anim: u16,
    pub ground_entity: u16,
    pub client_num: u8,
}

/// Result of decoding one entity delta
#[derive(Debug, Clone, PartialEq)]
pub enum EntityDelta {
    Removed(u16),
    Updated(EntityState),
}

fn vec_differs(a: &[f32; 3], b: &[f32; 3]) -> bool {
    a.iter().zip(b).any(|(x, y)| x.to_bits() != y.to_bits())
}

fn write_vec(msg: &mut MsgWriter, v: &[f32; 3]) -> Result<()> {
    for c in v {
        msg.write_f32(*c)?;
    }
    Ok(())
}

fn read_vec(msg: &mut MsgReader<'_>) -> Result<[f32; 3]> {
    Ok([msg.read_f32()?, msg.read_f32()?, msg.read_f32()?])
}

impl EntityState {
    /// Bit mask of fields in `to` that differ from `self`
    pub fn changed_fields(&self, to: &EntityState) -> u16 {
        let checks = [
            self.e_type != to.e_type,
            self.e_flags != to.e_flags,
            vec_differs(&self.origin, &to.origin),
            vec_differs(&self.angles, &to.angles),
            self.model_index != to.model_index,
            self.frame != to.frame,
            self.event != to.event,
            self.event_parm != to.event_parm,
            self.solid != to.solid,
            self.weapon != to.weapon,
            self.legs_anim != to.legs_anim,
            self.torso_anim != to.torso_anim,
            self.ground_entity != to.ground_entity,
            self.client_num != to.client_num,
        ];
        checks
            .iter()
            .enumerate()
            .filter(|(_, changed)| **changed)
            .fold(0u16, |mask, (bit, _)| mask | (1 << bit))
    }
}

/// Writes `to` as a delta against `from`.
///
/// `None` marks the entity as removed. When nothing changed and `force` is not
/// set, nothing is written at all; forced writes emit a header with no fields so
/// the receiver still learns that the entity exists.
pub fn write_delta_entity(
    msg: &mut MsgWriter,
    from: &EntityState,
    to: Option<&EntityState>,
    force: bool,
) -> Result<()> {
    let to = match to {
        Some(to) => to,
        None => {
            msg.write_u16(from.number)?;
            return msg.write_u8(ENTITY_REMOVED);
        }
    };

    if to.number >= MAX_GENTITIES {
        return Err(CodecError::EntityNumber(to.number));
    }

    let mask = from.changed_fields(to);
    if mask == 0 && !force {
        return Ok(());
    }

    msg.write_u16(to.number)?;
    if mask == 0 {
        return msg.write_u8(0);
    }
    msg.write_u8(ENTITY_CHANGED)?;
    msg.write_u16(mask)?;

    let set = |bit: u16| mask & (1 << bit) != 0;
    if set(0) {
        msg.write_u8(to.e_type)?;
    }
    if set(1) {
        msg.write_u32(to.e_flags)?;
    }
    if set(2) {
        write_vec(msg, &to.origin)?;
    }
    if set(3) {
        write_vec(msg, &to.angles)?;
    }
    if set(4) {
        msg.write_u16(to.model_index)?;
    }
    if set(5) {
        msg.write_u16(to.frame)?;
    }
    if set(6) {
        msg.write_u16(to.event)?;
    }
    if set(7) {
        msg.write_u16(to.event_parm)?;
    }
    if set(8) {
        msg.write_u32(to.solid)?;
    }
    if set(9) {
        msg.write_u8(to.weapon)?;
    }
    if set(10) {
        msg.write_u16(to.legs_anim)?;
    }
    if set(11) {
        msg.write_u16(to.torso_anim)?;
    }
    if set(12) {
        msg.write_u16(to.ground_entity)?;
    }
    if set(13) {
        msg.write_u8(to.client_num)?;
    }
    Ok(())
}

/// Reads one entity delta against `from`; unchanged fields keep the reference value.
pub fn read_delta_entity(msg: &mut MsgReader<'_>, from: &EntityState) -> Result<EntityDelta> {
    let number = msg.read_u16()?;
    if number >= MAX_GENTITIES {
        return Err(CodecError::EntityNumber(number));
    }

    let flags = msg.read_u8()?;
    if flags & ENTITY_REMOVED != 0 {
        return Ok(EntityDelta::Removed(number));
    }

    let mut to = from.clone();
    to.number = number;
    if flags & ENTITY_CHANGED == 0 {
        return Ok(EntityDelta::Updated(to));
    }

    let mask = msg.read_u16()?;
    let set = |bit: u16| mask & (1 << bit) != 0;
    if set(0) {
        to.e_type = msg.read_u8()?;
    }
    if set(1) {
        to.e_flags = msg.read_u32()?;
    }
    if set(2) {
        to.origin = read_vec(msg)?;
    }
    if set(3) {
        to.angles = read_vec(msg)?;
    }
    if set(4) {
        to.model_index = msg.read_u16()?;
    }
    if set(5) {
        to.frame = msg.read_u16()?;
    }
    if set(6) {
        to.event = msg.read_u16()?;
    }
    if set(7) {
        to.event_parm = msg.read_u16()?;
    }
    if set(8) {
        to.solid = msg.read_u32()?;
    }
    if set(9) {
        to.weapon = msg.read_u8()?;
    }
    if set(10) {
        to.legs_anim = msg.read_u16()?;
    }
    if set(11) {
        to.torso_anim = msg.read_u16()?;
    }
    if set(12) {
        to.ground_entity = msg.read_u16()?;
    }
    if set(13) {
        to.client_num = msg.read_u8()?;
    }
    Ok(EntityDelta::Updated(to))
}

/// One movement command as sampled by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserCmd {
    pub server_time: i32,
    pub angles: [i32; 3],
    pub buttons: i32,
    pub weapon: u8,
    pub forward_move: i8,
    pub right_move: i8,
    pub up_move: i8,
}

/// Writes a movement command delta, obscuring changed fields with `key`.
///
/// The key is mixed with the command's own server time so every command in a
/// packet ends up with a different mask.
pub fn write_delta_usercmd(
    msg: &mut MsgWriter,
    key: i32,
    from: &UserCmd,
    to: &UserCmd,
) -> Result<()> {
    let dt = to.server_time.wrapping_sub(from.server_time);
    if (0..256).contains(&dt) {
        msg.write_u8(1)?;
        msg.write_u8(dt as u8)?;
    } else {
        msg.write_u8(0)?;
        msg.write_i32(to.server_time)?;
    }

    let checks = [
        from.angles[0] != to.angles[0],
        from.angles[1] != to.angles[1],
        from.angles[2] != to.angles[2],
        from.forward_move != to.forward_move,
        from.right_move != to.right_move,
        from.up_move != to.up_move,
        from.buttons != to.buttons,
        from.weapon != to.weapon,
    ];
    let mask = checks
        .iter()
        .enumerate()
        .filter(|(_, changed)| **changed)
        .fold(0u8, |mask, (bit, _)| mask | (1 << bit));
    msg.write_u8(mask)?;
    if mask == 0 {
        return Ok(());
    }

    let key = key ^ to.server_time;
    let set = |bit: u8| mask & (1 << bit) != 0;
    for axis in 0..3 {
        if set(axis as u8) {
            msg.write_i32(to.angles[axis] ^ key)?;
        }
    }
    if set(3) {
        msg.write_i8(to.forward_move ^ key as i8)?;
    }
    if set(4) {
        msg.write_i8(to.right_move ^ key as i8)?;
    }
    if set(5) {
        msg.write_i8(to.up_move ^ key as i8)?;
    }
    if set(6) {
        msg.write_i32(to.buttons ^ key)?;
    }
    if set(7) {
        msg.write_u8(to.weapon ^ key as u8)?;
    }
    Ok(())
}

pub fn read_delta_usercmd(msg: &mut MsgReader<'_>, key: i32, from: &UserCmd) -> Result<UserCmd> {
    let mut to = *from;
    if msg.read_u8()? == 1 {
        to.server_time = from.server_time.wrapping_add(msg.read_u8()? as i32);
    } else {
        to.server_time = msg.read_i32()?;
    }

    let mask = msg.read_u8()?;
    if mask == 0 {
        return Ok(to);
    }

    let key = key ^ to.server_time;
    let set = |bit: u8| mask & (1 << bit) != 0;
    for axis in 0..3 {
        if set(axis as u8) {
            to.angles[axis] = msg.read_i32()? ^ key;
        }
    }
    if set(3) {
        to.forward_move = msg.read_i8()? ^ key as i8;
    }
    if set(4) {
        to.right_move = msg.read_i8()? ^ key as i8;
    }
    if set(5) {
        to.up_move = msg.read_i8()? ^ key as i8;
    }
    if set(6) {
        to.buttons = msg.read_i32()? ^ key;
    }
    if set(7) {
        to.weapon = msg.read_u8()? ^ key as u8;
    }
    Ok(to)
}

/// Folds up to `max_len` bytes of `text` into the movement-command key.
pub fn hash_key(text: &str, max_len: usize) -> i32 {
    let mut hash: i32 = 0;
    for (i, b) in text.bytes().take(max_len).enumerate() {
        if b == 0 {
            break;
        }
        hash = hash.wrapping_add((b as i8 as i32).wrapping_mul(119 + i as i32));
    }
    hash ^ (hash >> 10) ^ (hash >> 20)
}
