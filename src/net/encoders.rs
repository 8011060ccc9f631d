//! Builders for every outbound message the simulation emits. Each returns a
//! ready-to-cipher [`OutboundFrame`]; the writer thread does the framing.

use crate::combat::hit::Hit;
use crate::entities::entity::EntityId;
use crate::net::packet::PacketWriter;
use crate::net::session::OutboundFrame;
use crate::world::tile::WorldTile;

pub const OPCODE_SCENE_RELOAD: u8 = 73;
pub const OPCODE_ENTITY_MOVED: u8 = 77;
pub const OPCODE_ENTITY_ADDED: u8 = 79;
pub const OPCODE_ENTITY_REMOVED: u8 = 81;
pub const OPCODE_LOGOUT: u8 = 86;
pub const OPCODE_GAME_MESSAGE: u8 = 99;
pub const OPCODE_HIT_SPLAT: u8 = 104;

pub const ENTITY_MARK_PLAYER: u8 = 0;
pub const ENTITY_MARK_NPC: u8 = 1;

fn write_tile(writer: &mut PacketWriter, tile: WorldTile) {
    writer.write_u16(tile.x);
    writer.write_u16(tile.y);
    writer.write_u8(tile.plane);
}

/// Full scene rebuild around a new center. Sent on login and whenever the
/// client crosses between the static grid and an instanced region.
pub fn scene_reload(center: WorldTile) -> OutboundFrame {
    let mut writer = PacketWriter::with_capacity(5);
    write_tile(&mut writer, center);
    OutboundFrame::fixed(OPCODE_SCENE_RELOAD, writer.into_vec())
}

pub fn entity_added(id: EntityId, mark: u8, tile: WorldTile, name: &str) -> OutboundFrame {
    let mut writer = PacketWriter::with_capacity(11 + name.len());
    writer.write_u32(id.0);
    writer.write_u8(mark);
    write_tile(&mut writer, tile);
    writer.write_string(name);
    OutboundFrame::variable_byte(OPCODE_ENTITY_ADDED, writer.into_vec())
}

pub fn entity_removed(id: EntityId) -> OutboundFrame {
    let mut writer = PacketWriter::with_capacity(4);
    writer.write_u32(id.0);
    OutboundFrame::fixed(OPCODE_ENTITY_REMOVED, writer.into_vec())
}

pub fn entity_moved(id: EntityId, tile: WorldTile, run: bool) -> OutboundFrame {
    let mut writer = PacketWriter::with_capacity(10);
    writer.write_u32(id.0);
    write_tile(&mut writer, tile);
    writer.write_u8(u8::from(run));
    OutboundFrame::fixed(OPCODE_ENTITY_MOVED, writer.into_vec())
}

/// Damage splat plus the health bar ratio the client renders above the
/// target.
pub fn hit_splat(target: EntityId, hit: Hit, hitpoints: u32, max_hitpoints: u32) -> OutboundFrame {
    let mut writer = PacketWriter::with_capacity(8);
    writer.write_u32(target.0);
    writer.write_u16(hit.amount.min(u16::MAX as u32) as u16);
    writer.write_u8(hit.look.mark());
    let ratio = if max_hitpoints == 0 {
        0
    } else {
        ((hitpoints.min(max_hitpoints) as u64 * 255) / max_hitpoints as u64) as u8
    };
    writer.write_u8(ratio);
    OutboundFrame::fixed(OPCODE_HIT_SPLAT, writer.into_vec())
}

pub fn game_message(text: &str) -> OutboundFrame {
    let mut writer = PacketWriter::with_capacity(text.len() + 1);
    writer.write_string(text);
    OutboundFrame::variable_byte(OPCODE_GAME_MESSAGE, writer.into_vec())
}

pub fn logout() -> OutboundFrame {
    OutboundFrame::fixed(OPCODE_LOGOUT, Vec::new())
}
