use std::collections::VecDeque;

use crate::combat::combat::CombatState;
use crate::combat::hit::Hit;
use crate::entities::npc::NpcData;
use crate::entities::player::PlayerData;
use crate::world::clock::{Cooldown, GameClock, GameTick};
use crate::world::tile::{RegionId, WorldTile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

/// Lifecycle of a simulated actor. `Locked` suppresses voluntary movement
/// and attack initiation but not pending-hit resolution; `Dead` suppresses
/// all initiation; `Respawning` hides the entity until its respawn task
/// fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Active,
    Locked { until: GameTick },
    Dead,
    Respawning,
}

/// Deferred action that fires when the entity arrives at its walk target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalAction {
    PickupItem { tile: WorldTile, item_id: u16 },
}

/// Summoned companion; the owner reference is the capability, not a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamiliarData {
    pub owner: EntityId,
    pub def_key: String,
}

#[derive(Debug)]
pub enum EntityKind {
    Player(PlayerData),
    Npc(NpcData),
    Familiar(FamiliarData),
}

impl EntityKind {
    pub fn is_player(&self) -> bool {
        matches!(self, EntityKind::Player(_))
    }

    /// Familiars count as npcs for visibility and targeting queries.
    pub fn is_npc_like(&self) -> bool {
        matches!(self, EntityKind::Npc(_) | EntityKind::Familiar(_))
    }

    pub fn owner(&self) -> Option<EntityId> {
        match self {
            EntityKind::Familiar(familiar) => Some(familiar.owner),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
    pub tile: WorldTile,
    /// Position at the end of the previous sync pass, for delta encoding.
    pub last_tile: WorldTile,
    /// Set while the entity occupies an instanced region; region membership
    /// then follows this id instead of the tile-derived one.
    pub dynamic_region: Option<RegionId>,
    pub walk_target: Option<WorldTile>,
    pub run: bool,
    hitpoints: u32,
    max_hitpoints: u32,
    state: EntityState,
    pub combat: CombatState,
    hits: VecDeque<Hit>,
    pub arrival_action: Option<ArrivalAction>,
    pub regen: Cooldown,
    pub last_interaction: GameTick,
    pub finished: bool,
}

impl Entity {
    pub fn new(id: EntityId, name: String, kind: EntityKind, tile: WorldTile, hitpoints: u32) -> Self {
        Self {
            id,
            name,
            kind,
            tile,
            last_tile: tile,
            dynamic_region: None,
            walk_target: None,
            run: false,
            hitpoints,
            max_hitpoints: hitpoints,
            state: EntityState::Active,
            combat: CombatState::default(),
            hits: VecDeque::new(),
            arrival_action: None,
            regen: Cooldown::ready(),
            last_interaction: GameTick(0),
            finished: false,
        }
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn hitpoints(&self) -> u32 {
        self.hitpoints
    }

    pub fn max_hitpoints(&self) -> u32 {
        self.max_hitpoints
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state, EntityState::Dead)
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state, EntityState::Locked { .. })
    }

    /// Voluntary movement and attack initiation are only allowed here.
    pub fn can_initiate(&self) -> bool {
        matches!(self.state, EntityState::Active) && !self.finished
    }

    /// Whether other clients are told about this entity at all.
    pub fn is_visible(&self) -> bool {
        !self.finished && !matches!(self.state, EntityState::Respawning)
    }

    /// Expire a timed lock. Called at the start of the entity's turn.
    pub fn refresh_state(&mut self, clock: &GameClock) {
        if let EntityState::Locked { until } = self.state {
            if clock.now() >= until {
                self.state = EntityState::Active;
            }
        }
    }

    /// Lock for `ticks` from now. A no-op unless currently `Active`.
    pub fn lock(&mut self, clock: &GameClock, ticks: u64) {
        if matches!(self.state, EntityState::Active | EntityState::Locked { .. }) {
            self.state = EntityState::Locked {
                until: GameTick(clock.now().0.saturating_add(ticks)),
            };
            self.walk_target = None;
            self.arrival_action = None;
        }
    }

    pub fn unlock(&mut self) {
        if matches!(self.state, EntityState::Locked { .. }) {
            self.state = EntityState::Active;
        }
    }

    /// Transition into `Dead`. Returns false when the entity was already
    /// dying or waiting to respawn, making the death sequence idempotent.
    pub fn set_dead(&mut self) -> bool {
        if matches!(self.state, EntityState::Dead | EntityState::Respawning) {
            return false;
        }
        self.state = EntityState::Dead;
        self.combat.clear_target();
        self.walk_target = None;
        self.arrival_action = None;
        self.hits.clear();
        true
    }

    pub fn set_respawning(&mut self) {
        self.state = EntityState::Respawning;
    }

    /// Back to life at full health.
    pub fn revive(&mut self) {
        self.state = EntityState::Active;
        self.hitpoints = self.max_hitpoints;
        self.combat = CombatState::default();
    }

    pub fn set_max_hitpoints(&mut self, max: u32) {
        self.max_hitpoints = max;
        self.hitpoints = self.hitpoints.min(max);
    }

    pub fn set_hitpoints(&mut self, hitpoints: u32) {
        self.hitpoints = hitpoints.min(self.max_hitpoints);
    }

    /// Queue a hit for atomic application during this entity's own turn.
    /// Queueing onto a dead or finished entity is a no-op.
    pub fn queue_hit(&mut self, hit: Hit) -> bool {
        if self.is_dead() || self.finished || matches!(self.state, EntityState::Respawning) {
            return false;
        }
        self.hits.push_back(hit);
        true
    }

    pub fn take_pending_hits(&mut self) -> Vec<Hit> {
        self.hits.drain(..).collect()
    }

    pub fn pending_hit_count(&self) -> usize {
        self.hits.len()
    }

    /// Deduct hitpoints, clamped to `[0, max]`. Returns the amount actually
    /// removed.
    pub fn apply_damage(&mut self, amount: u32) -> u32 {
        let applied = amount.min(self.hitpoints);
        self.hitpoints -= applied;
        applied
    }

    pub fn heal(&mut self, amount: u32) -> u32 {
        let before = self.hitpoints;
        self.hitpoints = self.hitpoints.saturating_add(amount).min(self.max_hitpoints);
        self.hitpoints - before
    }

    pub fn touch(&mut self, now: GameTick) {
        self.last_interaction = now;
    }

    pub fn as_player(&self) -> Option<&PlayerData> {
        match &self.kind {
            EntityKind::Player(player) => Some(player),
            _ => None,
        }
    }

    pub fn as_player_mut(&mut self) -> Option<&mut PlayerData> {
        match &mut self.kind {
            EntityKind::Player(player) => Some(player),
            _ => None,
        }
    }

    pub fn as_npc(&self) -> Option<&NpcData> {
        match &self.kind {
            EntityKind::Npc(npc) => Some(npc),
            _ => None,
        }
    }

    pub fn as_npc_mut(&mut self) -> Option<&mut NpcData> {
        match &mut self.kind {
            EntityKind::Npc(npc) => Some(npc),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::hit::HitLook;
    use std::time::Duration;

    fn npc_entity() -> Entity {
        Entity::new(
            EntityId(1),
            "Meadow wolf".to_string(),
            EntityKind::Npc(NpcData::new(
                "meadow_wolf".to_string(),
                WorldTile::new(50, 50, 0),
            )),
            WorldTile::new(50, 50, 0),
            25,
        )
    }

    #[test]
    fn damage_clamps_to_zero() {
        let mut entity = npc_entity();
        assert_eq!(entity.apply_damage(10), 10);
        assert_eq!(entity.hitpoints(), 15);
        assert_eq!(entity.apply_damage(100), 15);
        assert_eq!(entity.hitpoints(), 0);
    }

    #[test]
    fn heal_clamps_to_max() {
        let mut entity = npc_entity();
        entity.apply_damage(20);
        assert_eq!(entity.heal(200), 20);
        assert_eq!(entity.hitpoints(), entity.max_hitpoints());
    }

    #[test]
    fn queue_hit_on_dead_entity_is_noop() {
        let mut entity = npc_entity();
        assert!(entity.set_dead());
        assert!(!entity.queue_hit(Hit::new(5, HitLook::Melee, None)));
        assert_eq!(entity.pending_hit_count(), 0);
    }

    #[test]
    fn death_transition_is_idempotent() {
        let mut entity = npc_entity();
        entity.combat.set_target(EntityId(9));
        assert!(entity.set_dead());
        assert!(!entity.set_dead());
        assert_eq!(entity.combat.target(), None);
        assert_eq!(entity.walk_target, None);
    }

    #[test]
    fn lock_expires_with_clock() {
        let mut clock = GameClock::new(Duration::from_millis(600));
        let mut entity = npc_entity();
        entity.lock(&clock, 3);
        assert!(entity.is_locked());
        assert!(!entity.can_initiate());

        clock.advance(2);
        entity.refresh_state(&clock);
        assert!(entity.is_locked());

        clock.advance(1);
        entity.refresh_state(&clock);
        assert!(entity.can_initiate());
    }

    #[test]
    fn lock_does_not_resurrect() {
        let clock = GameClock::new(Duration::from_millis(600));
        let mut entity = npc_entity();
        entity.set_dead();
        entity.lock(&clock, 5);
        assert!(entity.is_dead());
    }

    #[test]
    fn respawning_entity_is_hidden() {
        let mut entity = npc_entity();
        entity.set_dead();
        entity.set_respawning();
        assert!(!entity.is_visible());
        entity.revive();
        assert!(entity.is_visible());
        assert_eq!(entity.hitpoints(), entity.max_hitpoints());
    }

    #[test]
    fn familiar_exposes_owner() {
        let kind = EntityKind::Familiar(FamiliarData {
            owner: EntityId(7),
            def_key: "granite_hound".to_string(),
        });
        assert_eq!(kind.owner(), Some(EntityId(7)));
        assert!(kind.is_npc_like());
        assert!(!kind.is_player());
    }
}
