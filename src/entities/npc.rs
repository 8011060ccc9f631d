use std::time::{Duration, Instant};

use crate::entities::entity::EntityId;
use crate::world::tile::WorldTile;

/// Harvestable leftovers of a defeated creature. Until the grace window
/// elapses only the killer may harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemainsState {
    pub killer: Option<EntityId>,
    pub since: Instant,
}

impl RemainsState {
    pub fn new(killer: Option<EntityId>) -> Self {
        Self {
            killer,
            since: Instant::now(),
        }
    }

    pub fn harvestable_by(&self, who: EntityId, grace: Duration) -> bool {
        if self.since.elapsed() >= grace {
            return true;
        }
        self.killer == Some(who)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpcData {
    /// Key into the combat definition tables.
    pub def_key: String,
    pub spawn_tile: WorldTile,
    pub remains: Option<RemainsState>,
}

impl NpcData {
    pub fn new(def_key: String, spawn_tile: WorldTile) -> Self {
        Self {
            def_key,
            spawn_tile,
            remains: None,
        }
    }

    pub fn is_remains(&self) -> bool {
        self.remains.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn killer_harvests_inside_grace_window() {
        let remains = RemainsState::new(Some(EntityId(3)));
        let grace = Duration::from_secs(60);
        assert!(remains.harvestable_by(EntityId(3), grace));
        assert!(!remains.harvestable_by(EntityId(4), grace));
    }

    #[test]
    fn anyone_harvests_after_grace_elapses() {
        let mut remains = RemainsState::new(Some(EntityId(3)));
        remains.since = Instant::now() - Duration::from_secs(61);
        assert!(remains.harvestable_by(EntityId(4), Duration::from_secs(60)));
    }

    #[test]
    fn ownerless_remains_wait_out_the_grace() {
        let remains = RemainsState::new(None);
        assert!(!remains.harvestable_by(EntityId(1), Duration::from_secs(60)));
    }
}
