use std::collections::HashSet;

use crate::entities::entity::EntityId;
use crate::net::session::SessionHandle;
use crate::world::tile::{RegionId, WorldTile};

/// One carried stack. `value` drives kept-on-death ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemStack {
    pub item_id: u16,
    pub amount: u32,
    pub value: u32,
}

#[derive(Debug)]
pub struct PlayerData {
    pub username: String,
    pub rights: u8,
    /// None for players constructed outside a live connection (tests,
    /// background spawns); frames to such players are dropped.
    pub session: Option<SessionHandle>,
    /// Names of worn items, used for faction-protection matching.
    pub equipment: Vec<String>,
    pub inventory: Vec<ItemStack>,
    /// Regions the client has been sent map data for. Commands referencing
    /// tiles outside this set are ignored.
    pub loaded_regions: HashSet<RegionId>,
    /// Entities the client currently knows about.
    pub known_entities: HashSet<EntityId>,
    /// Forces a full scene rebuild on the next sync pass.
    pub scene_reload_pending: bool,
    pub home_tile: WorldTile,
}

impl PlayerData {
    pub fn new(username: String, home_tile: WorldTile) -> Self {
        Self {
            username,
            rights: 0,
            session: None,
            equipment: Vec::new(),
            inventory: Vec::new(),
            loaded_regions: HashSet::new(),
            known_entities: HashSet::new(),
            scene_reload_pending: true,
            home_tile,
        }
    }

    /// Case-insensitive substring match of worn item names against a
    /// protected-name list.
    pub fn wears_any(&self, protected_names: &[String]) -> bool {
        for worn in &self.equipment {
            let worn = worn.to_lowercase();
            for protected in protected_names {
                if worn.contains(&protected.to_lowercase()) {
                    return true;
                }
            }
        }
        false
    }

    /// Split the inventory for the death sequence: the `keep` most valuable
    /// stacks stay, the rest are returned for dropping. Ties keep the
    /// earlier slot.
    pub fn split_kept_items(&mut self, keep: usize) -> Vec<ItemStack> {
        if self.inventory.len() <= keep {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..self.inventory.len()).collect();
        order.sort_by(|&a, &b| {
            self.inventory[b]
                .value
                .cmp(&self.inventory[a].value)
                .then_with(|| a.cmp(&b))
        });
        let kept_slots: HashSet<usize> = order.into_iter().take(keep).collect();
        let mut kept = Vec::with_capacity(keep);
        let mut dropped = Vec::new();
        for (slot, stack) in self.inventory.drain(..).enumerate() {
            if kept_slots.contains(&slot) {
                kept.push(stack);
            } else {
                dropped.push(stack);
            }
        }
        self.inventory = kept;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(item_id: u16, value: u32) -> ItemStack {
        ItemStack {
            item_id,
            amount: 1,
            value,
        }
    }

    #[test]
    fn wears_any_matches_substring_case_insensitive() {
        let mut player = PlayerData::new("ada".to_string(), WorldTile::new(10, 10, 0));
        player.equipment = vec![
            "Aurelian Full Helm".to_string(),
            "Leather boots".to_string(),
        ];
        let protected = vec!["aurelian full helm".to_string()];
        assert!(player.wears_any(&protected));

        player.equipment = vec!["Leather boots".to_string()];
        assert!(!player.wears_any(&protected));
    }

    #[test]
    fn split_kept_items_keeps_most_valuable() {
        let mut player = PlayerData::new("ada".to_string(), WorldTile::new(10, 10, 0));
        player.inventory = vec![
            stack(1, 100),
            stack(2, 5000),
            stack(3, 10),
            stack(4, 900),
            stack(5, 1200),
        ];
        let dropped = player.split_kept_items(3);
        let kept_ids: Vec<u16> = player.inventory.iter().map(|s| s.item_id).collect();
        assert_eq!(kept_ids, vec![2, 4, 5]);
        let dropped_ids: Vec<u16> = dropped.iter().map(|s| s.item_id).collect();
        assert_eq!(dropped_ids, vec![1, 3]);
    }

    #[test]
    fn split_kept_items_with_small_inventory_drops_nothing() {
        let mut player = PlayerData::new("ada".to_string(), WorldTile::new(10, 10, 0));
        player.inventory = vec![stack(1, 10), stack(2, 20)];
        assert!(player.split_kept_items(3).is_empty());
        assert_eq!(player.inventory.len(), 2);
    }

    #[test]
    fn split_kept_items_tie_keeps_earlier_slot() {
        let mut player = PlayerData::new("ada".to_string(), WorldTile::new(10, 10, 0));
        player.inventory = vec![stack(1, 50), stack(2, 50), stack(3, 50)];
        let dropped = player.split_kept_items(2);
        let kept_ids: Vec<u16> = player.inventory.iter().map(|s| s.item_id).collect();
        assert_eq!(kept_ids, vec![1, 2]);
        assert_eq!(dropped[0].item_id, 3);
    }
}
