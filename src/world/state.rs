use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::combat::combat::{attack_range, mitigated_damage, CombatState};
use crate::combat::hit::{Hit, HitLook};
use crate::config::{NpcDefinition, WorldConfig};
use crate::entities::entity::{ArrivalAction, Entity, EntityId, EntityKind, FamiliarData};
use crate::entities::npc::{NpcData, RemainsState};
use crate::entities::player::{ItemStack, PlayerData};
use crate::net::encoders;
use crate::net::session::{LogicCommand, SessionHandle};
use crate::telemetry::logging;
use crate::world::clock::{GameClock, GameTick};
use crate::world::region::{GroundItem, RegionIndex, WorldObject};
use crate::world::task::{TaskAction, TaskHandle, TaskScheduler};
use crate::world::tile::{RegionId, WorldTile};

/// Fixed mitigation factor for a player's protection prayers. Non-player
/// factors come from the definition tables instead.
const PLAYER_PRAYER_MULTIPLIER: f64 = 0.6;

/// Handler for a chat command. Registered once at startup under its literal
/// keyword; there is no runtime discovery.
pub type ChatCommandHandler = fn(&mut WorldState, EntityId, &[&str]) -> Result<(), String>;

#[derive(Debug, Default)]
struct CommandRegistry {
    handlers: HashMap<&'static str, ChatCommandHandler>,
}

impl CommandRegistry {
    fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register("players", command_players);
        registry.register("pos", command_pos);
        registry.register("home", command_home);
        registry
    }

    fn register(&mut self, keyword: &'static str, handler: ChatCommandHandler) {
        self.handlers.insert(keyword, handler);
    }

    fn get(&self, keyword: &str) -> Option<ChatCommandHandler> {
        self.handlers.get(keyword).copied()
    }
}

fn command_players(world: &mut WorldState, player: EntityId, _args: &[&str]) -> Result<(), String> {
    let online = world.player_count();
    world.send_message(player, &format!("There are {} players online.", online));
    Ok(())
}

fn command_pos(world: &mut WorldState, player: EntityId, _args: &[&str]) -> Result<(), String> {
    let tile = world
        .entity(player)
        .map(|entity| entity.tile)
        .ok_or_else(|| "unknown entity".to_string())?;
    world.send_message(
        player,
        &format!("Position: {}, {}, plane {}.", tile.x, tile.y, tile.plane),
    );
    Ok(())
}

fn command_home(world: &mut WorldState, player: EntityId, _args: &[&str]) -> Result<(), String> {
    let home = world
        .entity(player)
        .and_then(|entity| entity.as_player())
        .map(|data| data.home_tile)
        .ok_or_else(|| "unknown player".to_string())?;
    world.teleport(player, home);
    world.send_message(player, "You feel the pull of home.");
    Ok(())
}

/// Deterministic damage-roll generator; reseedable for reproducible tests.
#[derive(Debug, Clone, Copy)]
pub struct WorldRng {
    state: u64,
}

impl WorldRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed | 1 }
    }

    fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.state >> 32) as u32
    }

    pub fn roll_inclusive(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        self.next_u32() % (max + 1)
    }
}

/// One applied hit, recorded for the sync pass.
#[derive(Debug, Clone, Copy)]
pub struct HitEvent {
    pub target: EntityId,
    pub hit: Hit,
    pub hitpoints: u32,
    pub max_hitpoints: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub tasks_run: usize,
    pub entities_processed: usize,
    pub hits_applied: usize,
    pub frames_sent: usize,
}

/// The process-wide registry of live entities and regions, owned by the
/// tick thread. Constructed once at startup and passed explicitly.
pub struct WorldState {
    pub config: WorldConfig,
    pub clock: GameClock,
    pub scheduler: TaskScheduler,
    pub regions: RegionIndex,
    entities: HashMap<EntityId, Entity>,
    next_entity_id: u32,
    rng: WorldRng,
    commands: CommandRegistry,
}

impl WorldState {
    pub fn new(config: WorldConfig) -> Self {
        let clock = GameClock::new(Duration::from_millis(config.tick_millis));
        let force_loaded = config
            .force_loaded_regions
            .iter()
            .map(|&id| RegionId(id))
            .collect::<Vec<_>>();
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e3779b97f4a7c15);
        let mut world = Self {
            clock,
            scheduler: TaskScheduler::new(),
            regions: RegionIndex::new(force_loaded.clone()),
            entities: HashMap::new(),
            next_entity_id: 1,
            rng: WorldRng::new(seed),
            commands: CommandRegistry::with_defaults(),
            config,
        };
        for id in force_loaded {
            world.regions.get_or_create(id);
            world.regions.ensure_placement(id, &world.config);
        }
        let spawns = world.config.npc_spawns.clone();
        for spawn in spawns {
            if let Err(err) = world.spawn_npc(&spawn.definition, spawn.tile.tile()) {
                logging::log_error(&format!("npc spawn failed: {}", err));
            }
        }
        let unload_interval = world.config.region_unload_interval_ticks.max(1);
        world.schedule(
            unload_interval,
            Some(unload_interval),
            Box::new(|world| {
                let unloaded = world.regions.unload_idle();
                if unloaded > 0 {
                    logging::log_game(&format!("unloaded {} idle regions", unloaded));
                }
                Ok(())
            }),
        );
        world
    }

    pub fn reseed_rng(&mut self, seed: u64) {
        self.rng = WorldRng::new(seed);
    }

    // ---- scheduler ----------------------------------------------------

    pub fn schedule(
        &mut self,
        delay: u64,
        repeat: Option<u64>,
        action: TaskAction,
    ) -> TaskHandle {
        let now = self.clock.now();
        self.scheduler.schedule(now, delay, repeat, action)
    }

    pub fn cancel_task(&mut self, handle: &TaskHandle) -> bool {
        self.scheduler.cancel(handle)
    }

    /// Execute every task due this tick. A failing task is logged and
    /// isolated; the rest of the queue still runs.
    pub fn run_due_tasks(&mut self) -> usize {
        let current = self.clock.now();
        let due = self.scheduler.take_due(current);
        let mut executed = 0;
        for task in due {
            let id = task.id;
            let mut action = task.action;
            let result = action(self);
            executed += 1;
            match result {
                Ok(()) => self.scheduler.complete(current, id, action, true),
                Err(err) => {
                    logging::log_error(&format!("task {:?} failed: {}", id, err));
                    self.scheduler.complete(current, id, action, false);
                }
            }
        }
        executed
    }

    // ---- registry lifecycle -------------------------------------------

    fn allocate_id(&mut self) -> EntityId {
        let id = EntityId(self.next_entity_id);
        self.next_entity_id += 1;
        id
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn player_count(&self) -> usize {
        self.entities
            .values()
            .filter(|entity| entity.kind.is_player())
            .count()
    }

    pub fn player_by_name(&self, username: &str) -> Option<EntityId> {
        self.entities
            .values()
            .find(|entity| {
                entity
                    .as_player()
                    .map(|player| player.username.eq_ignore_ascii_case(username))
                    .unwrap_or(false)
            })
            .map(|entity| entity.id)
    }

    pub fn register_player(
        &mut self,
        username: String,
        session: Option<SessionHandle>,
    ) -> EntityId {
        let tile = self.config.player_respawn_tile.tile();
        let id = self.allocate_id();
        let mut data = PlayerData::new(username.clone(), tile);
        data.session = session;
        let mut entity = Entity::new(
            id,
            username.clone(),
            EntityKind::Player(data),
            tile,
            self.config.player_hitpoints,
        );
        entity.touch(self.clock.now());
        self.entities.insert(id, entity);
        self.regions.add_entity(tile.region_id(), id);
        logging::log_game(&format!("{} logged in as entity {}", username, id.0));
        id
    }

    pub fn spawn_npc(&mut self, def_key: &str, tile: WorldTile) -> Result<EntityId, String> {
        let defs = self
            .config
            .npc_definition(def_key)
            .cloned()
            .ok_or_else(|| format!("unknown npc definition '{}'", def_key))?;
        let id = self.allocate_id();
        let entity = Entity::new(
            id,
            defs.name.clone(),
            EntityKind::Npc(NpcData::new(def_key.to_string(), tile)),
            tile,
            defs.hitpoints,
        );
        self.entities.insert(id, entity);
        self.regions.add_entity(tile.region_id(), id);
        Ok(id)
    }

    pub fn spawn_familiar(
        &mut self,
        owner: EntityId,
        def_key: &str,
        tile: WorldTile,
    ) -> Result<EntityId, String> {
        if !self.entities.contains_key(&owner) {
            return Err("familiar owner is not registered".to_string());
        }
        let defs = self
            .config
            .npc_definition(def_key)
            .cloned()
            .ok_or_else(|| format!("unknown npc definition '{}'", def_key))?;
        let id = self.allocate_id();
        let entity = Entity::new(
            id,
            defs.name.clone(),
            EntityKind::Familiar(FamiliarData {
                owner,
                def_key: def_key.to_string(),
            }),
            tile,
            defs.hitpoints,
        );
        self.entities.insert(id, entity);
        self.regions.add_entity(tile.region_id(), id);
        Ok(id)
    }

    /// Remove an entity from its region and the registry. Safe to call on
    /// an id that is already gone.
    pub fn finish_entity(&mut self, id: EntityId) {
        let region = self.current_region_of(id);
        match self.entities.get_mut(&id) {
            Some(entity) if !entity.finished => entity.finished = true,
            _ => return,
        }
        if let Some(region) = region {
            self.regions.remove_entity(region, id);
        }
        self.entities.remove(&id);
        self.clear_targets_on(id);
        // A familiar does not outlive its owner.
        let orphans: Vec<EntityId> = self
            .entities
            .values()
            .filter(|entity| entity.kind.owner() == Some(id))
            .map(|entity| entity.id)
            .collect();
        for orphan in orphans {
            self.finish_entity(orphan);
        }
    }

    fn current_region_of(&self, id: EntityId) -> Option<RegionId> {
        self.entities
            .get(&id)
            .map(|entity| entity.dynamic_region.unwrap_or_else(|| entity.tile.region_id()))
    }

    fn clear_targets_on(&mut self, target: EntityId) {
        for entity in self.entities.values_mut() {
            if entity.combat.target() == Some(target) {
                entity.combat.clear_target();
            }
        }
    }

    // ---- outward entity seams -----------------------------------------

    pub fn apply_hit(&mut self, target: EntityId, hit: Hit) -> bool {
        match self.entities.get_mut(&target) {
            Some(entity) => entity.queue_hit(hit),
            None => false,
        }
    }

    pub fn lock_entity(&mut self, id: EntityId, ticks: u64) {
        let clock = self.clock.clone();
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.lock(&clock, ticks);
        }
    }

    pub fn unlock_entity(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.unlock();
        }
    }

    pub fn combat_state(&self, id: EntityId) -> Option<&CombatState> {
        self.entities.get(&id).map(|entity| &entity.combat)
    }

    /// Move an entity instantly. Region membership is swapped in the same
    /// mutation; leaving an instanced region forces a scene resync.
    pub fn teleport(&mut self, id: EntityId, destination: WorldTile) {
        let Some(from) = self.current_region_of(id) else {
            return;
        };
        let to = destination.region_id();
        let was_dynamic = {
            let Some(entity) = self.entities.get_mut(&id) else {
                return;
            };
            let was_dynamic = entity.dynamic_region.is_some();
            entity.tile = destination;
            entity.walk_target = None;
            entity.arrival_action = None;
            entity.dynamic_region = None;
            was_dynamic
        };
        self.regions.move_entity(id, from, to);
        if was_dynamic || from != to {
            self.mark_scene_reload(id, was_dynamic);
        }
    }

    /// Place an entity into an instanced region. The id must come from
    /// `RegionIndex::allocate_dynamic`.
    pub fn enter_dynamic_region(&mut self, id: EntityId, region: RegionId) -> Result<(), String> {
        if !region.is_dynamic() {
            return Err("not a dynamic region id".to_string());
        }
        let Some(from) = self.current_region_of(id) else {
            return Err("unknown entity".to_string());
        };
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.dynamic_region = Some(region);
        }
        self.regions.move_entity(id, from, region);
        self.mark_scene_reload(id, true);
        Ok(())
    }

    pub fn leave_dynamic_region(&mut self, id: EntityId) {
        let Some(entity) = self.entities.get(&id) else {
            return;
        };
        if entity.dynamic_region.is_none() {
            return;
        }
        let destination = entity.tile;
        self.teleport(id, destination);
    }

    fn mark_scene_reload(&mut self, id: EntityId, always: bool) {
        if let Some(player) = self
            .entities
            .get_mut(&id)
            .and_then(|entity| entity.as_player_mut())
        {
            if always || !player.scene_reload_pending {
                player.scene_reload_pending = true;
            }
        }
    }

    /// Set an attack target. Dead or finished entities can neither hold a
    /// target nor be acquired as one.
    pub fn set_attack_target(&mut self, attacker: EntityId, target: EntityId) -> bool {
        if attacker == target {
            return false;
        }
        let target_ok = match self.entities.get(&target) {
            Some(entity) => {
                entity.is_visible()
                    && !entity.is_dead()
                    && !entity.as_npc().map(NpcData::is_remains).unwrap_or(false)
            }
            None => false,
        };
        if !target_ok {
            return false;
        }
        match self.entities.get_mut(&attacker) {
            Some(entity) if entity.can_initiate() => {
                entity.combat.set_target(target);
                true
            }
            _ => false,
        }
    }

    /// Request a walk. Voluntary movement is refused while locked or dead.
    pub fn walk_to(&mut self, id: EntityId, destination: WorldTile) -> bool {
        match self.entities.get_mut(&id) {
            Some(entity)
                if entity.can_initiate() && entity.tile.plane == destination.plane =>
            {
                entity.walk_target = Some(destination);
                true
            }
            _ => false,
        }
    }

    // ---- ground items --------------------------------------------------

    pub fn spawn_ground_item(
        &mut self,
        item_id: u16,
        amount: u32,
        tile: WorldTile,
        owner: Option<EntityId>,
    ) {
        let public_at = GameTick(
            self.clock
                .now()
                .0
                .saturating_add(self.config.ground_item_public_ticks),
        );
        let region = self.regions.get_or_create(tile.region_id());
        region.ground_items.push(GroundItem {
            item_id,
            amount,
            tile,
            owner,
            public_at,
        });
    }

    /// Register a dynamic object on top of the region's static placement.
    pub fn spawn_object(&mut self, object_id: u16, tile: WorldTile) {
        let region = self.regions.get_or_create(tile.region_id());
        region.objects.push(WorldObject { object_id, tile });
    }

    /// Killer-only harvest gate on remains, relaxing to public after the
    /// configured wall-clock grace window.
    pub fn can_harvest_remains(&self, harvester: EntityId, npc: EntityId) -> bool {
        let grace = Duration::from_secs(self.config.remains_grace_seconds);
        self.entities
            .get(&npc)
            .and_then(|entity| entity.as_npc())
            .and_then(|data| data.remains.as_ref())
            .map(|remains| remains.harvestable_by(harvester, grace))
            .unwrap_or(false)
    }

    // ---- visibility ----------------------------------------------------

    /// Entities within `radius` tiles of `tile` on the same plane,
    /// excluding `exclude`. Looks only at the static grid; instanced
    /// lookups go through the querier's dynamic region instead.
    pub fn entities_within(
        &self,
        tile: WorldTile,
        radius: u16,
        include_players: bool,
        include_npcs: bool,
        exclude: Option<EntityId>,
    ) -> Vec<EntityId> {
        let mut out = Vec::new();
        for region_id in RegionIndex::region_ids_in_range(tile, radius) {
            let Some(region) = self.regions.get(region_id) else {
                continue;
            };
            self.collect_candidates(
                region.entities().iter().copied(),
                tile,
                radius,
                include_players,
                include_npcs,
                exclude,
                &mut out,
            );
        }
        out.sort();
        out
    }

    fn entities_within_scope(
        &self,
        scope: Option<RegionId>,
        tile: WorldTile,
        radius: u16,
        include_players: bool,
        include_npcs: bool,
        exclude: Option<EntityId>,
    ) -> Vec<EntityId> {
        match scope {
            Some(region_id) => {
                let mut out = Vec::new();
                if let Some(region) = self.regions.get(region_id) {
                    self.collect_candidates(
                        region.entities().iter().copied(),
                        tile,
                        radius,
                        include_players,
                        include_npcs,
                        exclude,
                        &mut out,
                    );
                }
                out.sort();
                out
            }
            None => self.entities_within(tile, radius, include_players, include_npcs, exclude),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_candidates(
        &self,
        ids: impl Iterator<Item = EntityId>,
        tile: WorldTile,
        radius: u16,
        include_players: bool,
        include_npcs: bool,
        exclude: Option<EntityId>,
        out: &mut Vec<EntityId>,
    ) {
        for id in ids {
            if exclude == Some(id) {
                continue;
            }
            let Some(entity) = self.entities.get(&id) else {
                continue;
            };
            if !entity.is_visible() {
                continue;
            }
            let wanted = (include_players && entity.kind.is_player())
                || (include_npcs && entity.kind.is_npc_like());
            if !wanted {
                continue;
            }
            if tile.within_distance(entity.tile, radius) {
                out.push(id);
            }
        }
    }

    /// Candidate targets for a hostile actor. Inside its faction geofence
    /// the list spans players and npcs minus same-faction actors and
    /// players wearing aligned equipment; outside, normal acquisition.
    pub fn possible_targets(&self, npc_id: EntityId) -> Vec<EntityId> {
        let Some(entity) = self.entities.get(&npc_id) else {
            return Vec::new();
        };
        let Some(defs) = self.definition_for(entity) else {
            return Vec::new();
        };
        if !defs.aggressive || entity.as_npc().map(NpcData::is_remains).unwrap_or(false) {
            return Vec::new();
        }
        let scope = entity.dynamic_region;
        let tile = entity.tile;
        let geofence = defs.faction.as_ref().and_then(|faction| {
            self.config.geofences.iter().find(|fence| {
                fence.faction == *faction
                    && tile.within_distance(fence.center.tile(), fence.radius)
            })
        });
        let candidates = match geofence {
            Some(fence) => {
                let mut targets = Vec::new();
                for id in self.entities_within_scope(
                    scope,
                    tile,
                    defs.aggro_radius,
                    true,
                    true,
                    Some(npc_id),
                ) {
                    let Some(candidate) = self.entities.get(&id) else {
                        continue;
                    };
                    if candidate.is_dead() {
                        continue;
                    }
                    match &candidate.kind {
                        EntityKind::Player(player) => {
                            if player.wears_any(&fence.protected_item_names) {
                                continue;
                            }
                        }
                        EntityKind::Npc(other) => {
                            if other.is_remains() {
                                continue;
                            }
                            let same_faction = self
                                .config
                                .npc_definition(&other.def_key)
                                .and_then(|d| d.faction.as_ref())
                                == defs.faction.as_ref();
                            if same_faction {
                                continue;
                            }
                        }
                        EntityKind::Familiar(_) => {}
                    }
                    targets.push(id);
                }
                targets
            }
            None => self
                .entities_within_scope(scope, tile, defs.aggro_radius, true, false, Some(npc_id))
                .into_iter()
                .filter(|id| {
                    self.entities
                        .get(id)
                        .map(|candidate| !candidate.is_dead())
                        .unwrap_or(false)
                })
                .collect(),
        };
        candidates
    }

    fn definition_for(&self, entity: &Entity) -> Option<&NpcDefinition> {
        match &entity.kind {
            EntityKind::Npc(npc) => self.config.npc_definition(&npc.def_key),
            EntityKind::Familiar(familiar) => self.config.npc_definition(&familiar.def_key),
            EntityKind::Player(_) => None,
        }
    }

    /// (max hit, style, cooldown) of an attacker.
    fn attack_profile(&self, id: EntityId) -> Option<(u32, HitLook, u64)> {
        let entity = self.entities.get(&id)?;
        match &entity.kind {
            EntityKind::Player(_) => Some((
                self.config.player_max_hit,
                HitLook::Melee,
                self.config.player_attack_speed_ticks,
            )),
            _ => {
                let defs = self.definition_for(entity)?;
                Some((defs.max_hit, defs.attack_style, defs.attack_speed_ticks))
            }
        }
    }

    /// Mitigation constants of a defender: definition-table numbers for
    /// non-players, the fixed player factor otherwise.
    fn mitigation_profile(&self, id: EntityId) -> NpcDefinition {
        let defaults = NpcDefinition::default;
        match self.entities.get(&id).map(|entity| &entity.kind) {
            Some(EntityKind::Player(_)) => NpcDefinition {
                melee_prayer_multiplier: PLAYER_PRAYER_MULTIPLIER,
                ranged_prayer_multiplier: PLAYER_PRAYER_MULTIPLIER,
                magic_prayer_multiplier: PLAYER_PRAYER_MULTIPLIER,
                ..defaults()
            },
            Some(_) => self
                .entities
                .get(&id)
                .and_then(|entity| self.definition_for(entity))
                .cloned()
                .unwrap_or_else(defaults),
            None => defaults(),
        }
    }

    // ---- tick pipeline -------------------------------------------------

    /// One full simulation step: due tasks, per-entity updates, pending
    /// hits, client sync, then the tick counter.
    pub fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary {
            tasks_run: self.run_due_tasks(),
            ..TickSummary::default()
        };
        let targeted = self.targeted_entities();
        let order = self.update_order();
        for &id in &order {
            if !self.entities.contains_key(&id) {
                continue;
            }
            summary.entities_processed += 1;
            if let Err(err) = self.process_entity(id, &targeted) {
                logging::log_error(&format!("entity {} update failed: {}", id.0, err));
            }
        }
        let mut hit_events = Vec::new();
        for &id in &order {
            self.flush_hits(id, &mut hit_events);
        }
        summary.hits_applied = hit_events.len();
        summary.frames_sent = self.sync_players(&hit_events);
        self.clock.advance(1);
        summary
    }

    /// Players update before non-players; within a kind, ascending id. No
    /// cross-entity ordering beyond that is guaranteed.
    fn update_order(&self) -> Vec<EntityId> {
        let mut players = Vec::new();
        let mut others = Vec::new();
        for entity in self.entities.values() {
            if entity.kind.is_player() {
                players.push(entity.id);
            } else {
                others.push(entity.id);
            }
        }
        players.sort();
        others.sort();
        players.extend(others);
        players
    }

    /// Everything currently held as someone's target; regeneration is
    /// suppressed for these.
    fn targeted_entities(&self) -> HashSet<EntityId> {
        self.entities
            .values()
            .filter(|entity| !entity.is_dead() && !entity.finished)
            .filter_map(|entity| entity.combat.target())
            .collect()
    }

    fn process_entity(
        &mut self,
        id: EntityId,
        targeted: &HashSet<EntityId>,
    ) -> Result<(), String> {
        {
            let clock = self.clock.clone();
            let Some(entity) = self.entities.get_mut(&id) else {
                return Ok(());
            };
            if entity.finished {
                return Ok(());
            }
            entity.refresh_state(&clock);
        }
        self.drain_commands(id);
        if self.entity_is_gone_or_dead(id) {
            return Ok(());
        }
        self.process_arrival(id)?;
        if self.entity_is_gone_or_dead(id) {
            return Ok(());
        }
        self.advance_movement(id);
        if self.entity_is_gone_or_dead(id) {
            return Ok(());
        }
        self.combat_step(id);
        self.regen_step(id, targeted);
        Ok(())
    }

    fn entity_is_gone_or_dead(&self, id: EntityId) -> bool {
        match self.entities.get(&id) {
            Some(entity) => entity.is_dead() || entity.finished,
            None => true,
        }
    }

    // ---- command handling ---------------------------------------------

    fn drain_commands(&mut self, id: EntityId) {
        let commands = match self
            .entities
            .get(&id)
            .and_then(|entity| entity.as_player())
            .and_then(|player| player.session.as_ref())
        {
            Some(session) => session.commands.drain(),
            None => return,
        };
        for command in commands {
            if let Err(err) = self.dispatch_command(id, &command) {
                logging::log_error(&format!("entity {} command failed: {}", id.0, err));
            }
            if !self.entities.contains_key(&id) {
                break;
            }
        }
    }

    fn dispatch_command(&mut self, id: EntityId, command: &LogicCommand) -> Result<(), String> {
        match command {
            LogicCommand::KeepAlive => {
                let now = self.clock.now();
                if let Some(entity) = self.entities.get_mut(&id) {
                    entity.touch(now);
                }
                Ok(())
            }
            LogicCommand::Walk { x, y, run } => {
                let destination = match self.entities.get_mut(&id) {
                    Some(entity) => {
                        entity.run = *run;
                        WorldTile::new(*x, *y, entity.tile.plane)
                    }
                    None => return Ok(()),
                };
                self.walk_to(id, destination);
                Ok(())
            }
            LogicCommand::Attack { target_index } => {
                self.set_attack_target(id, EntityId(u32::from(*target_index)));
                Ok(())
            }
            LogicCommand::PickupItem {
                x,
                y,
                item_id,
                run,
            } => self.handle_pickup_command(id, *x, *y, *item_id, *run),
            LogicCommand::Chat { text } => {
                self.broadcast_chat(id, text);
                Ok(())
            }
            LogicCommand::Command { text, .. } => self.handle_chat_command(id, text),
            LogicCommand::Logout => {
                if let Some(session) = self
                    .entities
                    .get(&id)
                    .and_then(|entity| entity.as_player())
                    .and_then(|player| player.session.as_ref())
                {
                    session.send(encoders::logout());
                    session.close();
                }
                let name = self
                    .entities
                    .get(&id)
                    .map(|entity| entity.name.clone())
                    .unwrap_or_default();
                self.finish_entity(id);
                logging::log_game(&format!("{} logged out", name));
                Ok(())
            }
        }
    }

    /// Walk to the item's tile, then take it on arrival. Ignored outright
    /// when the session has no map data for that region, when the entity
    /// cannot act, or when pickup rights fail.
    fn handle_pickup_command(
        &mut self,
        id: EntityId,
        x: u16,
        y: u16,
        item_id: u16,
        run: bool,
    ) -> Result<(), String> {
        let now = self.clock.now();
        let (tile, region_id) = {
            let Some(entity) = self.entities.get(&id) else {
                return Ok(());
            };
            if !entity.can_initiate() {
                return Ok(());
            }
            let tile = WorldTile::new(x, y, entity.tile.plane);
            (tile, tile.region_id())
        };
        let region_loaded = self
            .entities
            .get(&id)
            .and_then(|entity| entity.as_player())
            .map(|player| player.loaded_regions.contains(&region_id))
            .unwrap_or(false);
        if !region_loaded {
            return Ok(());
        }
        let item_exists = self
            .regions
            .get(region_id)
            .and_then(|region| region.ground_item(item_id, tile))
            .map(|item| item.may_take(id, now))
            .unwrap_or(false);
        if !item_exists {
            return Ok(());
        }
        if let Some(entity) = self.entities.get_mut(&id) {
            if run {
                entity.run = true;
            }
            entity.walk_target = Some(tile);
            entity.arrival_action = Some(ArrivalAction::PickupItem { tile, item_id });
        }
        Ok(())
    }

    fn handle_chat_command(&mut self, id: EntityId, text: &str) -> Result<(), String> {
        let mut parts = text.split_whitespace();
        let Some(keyword) = parts.next() else {
            return Ok(());
        };
        let args: Vec<&str> = parts.collect();
        match self.commands.get(&keyword.to_lowercase()) {
            Some(handler) => handler(self, id, &args),
            None => {
                self.send_message(id, &format!("Unknown command: {}", keyword));
                Ok(())
            }
        }
    }

    fn broadcast_chat(&mut self, id: EntityId, text: &str) {
        let Some(speaker) = self.entities.get(&id) else {
            return;
        };
        if !speaker.can_initiate() {
            return;
        }
        let line = format!("{}: {}", speaker.name, text);
        let tile = speaker.tile;
        let scope = speaker.dynamic_region;
        let mut audience =
            self.entities_within_scope(scope, tile, self.config.view_radius, true, false, None);
        if !audience.contains(&id) {
            audience.push(id);
        }
        for listener in audience {
            self.send_message(listener, &line);
        }
    }

    pub fn send_message(&self, id: EntityId, text: &str) {
        if let Some(session) = self
            .entities
            .get(&id)
            .and_then(|entity| entity.as_player())
            .and_then(|player| player.session.as_ref())
        {
            session.send(encoders::game_message(text));
        }
    }

    // ---- per-entity steps ----------------------------------------------

    fn process_arrival(&mut self, id: EntityId) -> Result<(), String> {
        let action = {
            let Some(entity) = self.entities.get_mut(&id) else {
                return Ok(());
            };
            let pending = entity.arrival_action;
            match pending {
                Some(ArrivalAction::PickupItem { tile, .. }) if entity.tile == tile => {
                    entity.arrival_action.take()
                }
                _ => None,
            }
        };
        match action {
            Some(ArrivalAction::PickupItem { tile, item_id }) => {
                self.complete_pickup(id, tile, item_id)
            }
            None => Ok(()),
        }
    }

    fn complete_pickup(
        &mut self,
        id: EntityId,
        tile: WorldTile,
        item_id: u16,
    ) -> Result<(), String> {
        let now = self.clock.now();
        let region_id = tile.region_id();
        let allowed = self
            .regions
            .get(region_id)
            .and_then(|region| region.ground_item(item_id, tile))
            .map(|item| item.may_take(id, now))
            .unwrap_or(false);
        if !allowed {
            return Ok(());
        }
        let taken = self
            .regions
            .get_mut(region_id)
            .and_then(|region| region.remove_ground_item(item_id, tile));
        let Some(item) = taken else {
            return Ok(());
        };
        let name = match self.entities.get_mut(&id) {
            Some(entity) => {
                if let Some(player) = entity.as_player_mut() {
                    player.inventory.push(ItemStack {
                        item_id: item.item_id,
                        amount: item.amount,
                        value: 0,
                    });
                }
                entity.name.clone()
            }
            None => return Ok(()),
        };
        logging::log_game(&format!(
            "{} picked up item {} x{} at {},{}",
            name, item.item_id, item.amount, tile.x, tile.y
        ));
        Ok(())
    }

    /// Advance along the straight-line path by the per-tick allowance,
    /// swapping region membership with the position.
    fn advance_movement(&mut self, id: EntityId) {
        let (from_region, mut tile, destination, allowance, dynamic) = {
            let Some(entity) = self.entities.get(&id) else {
                return;
            };
            if !entity.can_initiate() {
                return;
            }
            let Some(destination) = entity.walk_target else {
                return;
            };
            let allowance = if entity.kind.is_player() && entity.run {
                2
            } else {
                1
            };
            (
                entity.dynamic_region.unwrap_or_else(|| entity.tile.region_id()),
                entity.tile,
                destination,
                allowance,
                entity.dynamic_region,
            )
        };
        let mut arrived = false;
        for _ in 0..allowance {
            match tile.direction_towards(destination).and_then(|d| tile.step(d)) {
                Some(next) => {
                    tile = next;
                    if tile == destination {
                        arrived = true;
                        break;
                    }
                }
                None => {
                    arrived = true;
                    break;
                }
            }
        }
        let to_region = dynamic.unwrap_or_else(|| tile.region_id());
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.tile = tile;
            if arrived || entity.walk_target == Some(tile) {
                entity.walk_target = None;
            }
        }
        self.regions.move_entity(id, from_region, to_region);
    }

    fn combat_step(&mut self, id: EntityId) {
        let (is_npc_like, can_initiate, is_remains) = match self.entities.get(&id) {
            Some(entity) => (
                entity.kind.is_npc_like(),
                entity.can_initiate(),
                entity.as_npc().map(NpcData::is_remains).unwrap_or(false),
            ),
            None => return,
        };
        if is_remains {
            return;
        }
        if is_npc_like {
            self.npc_idle_behaviour(id);
        }
        if !can_initiate {
            return;
        }
        let Some(target) = self
            .entities
            .get(&id)
            .and_then(|entity| entity.combat.target())
        else {
            return;
        };
        // Target validation against the pre-tick snapshot.
        let target_state = self.entities.get(&target).map(|entity| {
            (
                entity.tile,
                entity.is_dead()
                    || entity.finished
                    || !entity.is_visible()
                    || entity.as_npc().map(NpcData::is_remains).unwrap_or(false),
            )
        });
        let Some((target_tile, invalid)) = target_state else {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.combat.clear_target();
            }
            return;
        };
        if invalid {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.combat.clear_target();
            }
            return;
        }
        let Some((max_hit, style, speed)) = self.attack_profile(id) else {
            return;
        };
        let range = attack_range(style);
        let (in_range, cooldown_ready) = {
            let Some(entity) = self.entities.get(&id) else {
                return;
            };
            (
                entity.tile.within_distance(target_tile, range),
                entity.combat.attack_cooldown.is_ready(&self.clock),
            )
        };
        if !in_range {
            // Chase; melee stops adjacent, projectile styles close in the
            // same way.
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.walk_target = Some(target_tile);
            }
            return;
        }
        if !cooldown_ready {
            return;
        }
        let rolled = self.rng.roll_inclusive(max_hit);
        let mitigation = self.mitigation_profile(target);
        let protections = self
            .entities
            .get(&target)
            .map(|entity| entity.combat.protections)
            .unwrap_or_default();
        let damage = mitigated_damage(rolled, style, protections, &mitigation);
        let now = self.clock.now();
        if let Some(entity) = self.entities.get_mut(&target) {
            entity.queue_hit(Hit::new(damage, style, Some(id)));
            entity.touch(now);
        }
        let clock = self.clock.clone();
        if let Some(entity) = self.entities.get_mut(&id) {
            entity
                .combat
                .attack_cooldown
                .reset_from_now_ticks(&clock, speed.max(1));
            entity.touch(now);
        }
    }

    /// Acquisition and boss idle-regeneration for hostile non-players.
    fn npc_idle_behaviour(&mut self, id: EntityId) {
        let defs = match self.entities.get(&id).and_then(|e| self.definition_for(e)) {
            Some(defs) => defs.clone(),
            None => return,
        };
        if !defs.aggressive {
            return;
        }
        let candidates = self.possible_targets(id);
        if defs.regen_to_full_when_idle && candidates.is_empty() {
            if let Some(entity) = self.entities.get_mut(&id) {
                if !entity.is_dead() && entity.hitpoints() < entity.max_hitpoints() {
                    let max = entity.max_hitpoints();
                    entity.set_hitpoints(max);
                }
            }
        }
        let has_target = self
            .entities
            .get(&id)
            .map(|entity| entity.combat.target().is_some())
            .unwrap_or(true);
        if has_target {
            return;
        }
        if let Some(&nearest) = candidates.first() {
            self.set_attack_target(id, nearest);
        }
    }

    /// Slow background healing, one point per interval, suppressed while
    /// any hostile holds this entity as a target.
    fn regen_step(&mut self, id: EntityId, targeted: &HashSet<EntityId>) {
        let interval = self.config.regen_interval_ticks.max(1);
        let clock = self.clock.clone();
        let Some(entity) = self.entities.get_mut(&id) else {
            return;
        };
        if entity.is_dead() || entity.finished {
            return;
        }
        if !entity.regen.is_ready(&clock) {
            return;
        }
        entity.regen.reset_from_now_ticks(&clock, interval);
        if targeted.contains(&id) {
            return;
        }
        if entity.hitpoints() < entity.max_hitpoints() {
            entity.heal(1);
        }
    }

    // ---- hits and death ------------------------------------------------

    /// Apply this entity's queued hits atomically. Hits landing after the
    /// death transition in the same flush are no-ops.
    fn flush_hits(&mut self, id: EntityId, events: &mut Vec<HitEvent>) {
        let (died, killer) = {
            let Some(entity) = self.entities.get_mut(&id) else {
                return;
            };
            if entity.finished {
                return;
            }
            let hits = entity.take_pending_hits();
            if hits.is_empty() {
                return;
            }
            let mut killer = None;
            let mut died = false;
            for hit in hits {
                if entity.is_dead() {
                    break;
                }
                let applied = entity.apply_damage(hit.amount);
                if applied > 0 {
                    if let Some(source) = hit.source {
                        killer = Some(source);
                    }
                }
                events.push(HitEvent {
                    target: id,
                    hit: Hit::new(applied, hit.look, hit.source),
                    hitpoints: entity.hitpoints(),
                    max_hitpoints: entity.max_hitpoints(),
                });
                if entity.hitpoints() == 0 {
                    died = true;
                    break;
                }
            }
            (died, killer)
        };
        if died {
            self.begin_death(id, killer);
        }
    }

    /// Enter the death sequence. Idempotent: a second invocation before
    /// respawn completes is a no-op.
    pub fn begin_death(&mut self, id: EntityId, killer: Option<EntityId>) {
        let def_key = {
            let Some(entity) = self.entities.get_mut(&id) else {
                return;
            };
            if !entity.set_dead() {
                return;
            }
            match &entity.kind {
                EntityKind::Player(_) => None,
                EntityKind::Npc(npc) => Some(npc.def_key.clone()),
                EntityKind::Familiar(familiar) => Some(familiar.def_key.clone()),
            }
        };
        let delay = match &def_key {
            None => self.config.player_death_delay_ticks,
            Some(key) => self
                .config
                .npc_definition(key)
                .map(|defs| defs.death_delay_ticks)
                .unwrap_or(3),
        };
        self.clear_targets_on(id);
        let name = self
            .entities
            .get(&id)
            .map(|entity| entity.name.clone())
            .unwrap_or_default();
        logging::log_game(&format!("{} died", name));
        self.schedule(
            delay,
            None,
            Box::new(move |world| world.finish_death(id, killer)),
        );
    }

    /// Death-delay expiry: item handling and respawn for players, loot and
    /// remains or a scheduled respawn for non-players.
    fn finish_death(&mut self, id: EntityId, killer: Option<EntityId>) -> Result<(), String> {
        let Some(entity) = self.entities.get(&id) else {
            return Ok(());
        };
        if !entity.is_dead() {
            return Ok(());
        }
        match &entity.kind {
            EntityKind::Player(_) => self.finish_player_death(id, killer),
            EntityKind::Npc(_) => self.finish_npc_death(id, killer),
            EntityKind::Familiar(_) => {
                self.finish_entity(id);
                Ok(())
            }
        }
    }

    fn finish_player_death(&mut self, id: EntityId, killer: Option<EntityId>) -> Result<(), String> {
        let kept = self.config.kept_on_death;
        let (death_tile, dropped, home) = {
            let Some(entity) = self.entities.get_mut(&id) else {
                return Ok(());
            };
            let tile = entity.tile;
            let Some(player) = entity.as_player_mut() else {
                return Ok(());
            };
            (tile, player.split_kept_items(kept), player.home_tile)
        };
        for stack in dropped {
            self.spawn_ground_item(stack.item_id, stack.amount, death_tile, killer);
        }
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.set_respawning();
        }
        self.teleport(id, home);
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.revive();
        }
        self.mark_scene_reload(id, true);
        self.send_message(id, "Oh dear, you have died.");
        Ok(())
    }

    fn finish_npc_death(&mut self, id: EntityId, killer: Option<EntityId>) -> Result<(), String> {
        let (defs, death_tile) = {
            let Some(entity) = self.entities.get(&id) else {
                return Ok(());
            };
            let defs = self
                .definition_for(entity)
                .cloned()
                .ok_or_else(|| "npc lost its definition".to_string())?;
            (defs, entity.tile)
        };
        for drop in &defs.loot {
            self.spawn_ground_item(drop.item_id, drop.amount, death_tile, killer);
        }
        if defs.leaves_remains {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.revive();
                if let Some(npc) = entity.as_npc_mut() {
                    npc.remains = Some(RemainsState::new(killer));
                }
            }
            self.schedule(
                self.config.remains_duration_ticks.max(1),
                None,
                Box::new(move |world| world.restore_npc(id)),
            );
        } else {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.set_respawning();
            }
            self.schedule(
                defs.respawn_delay_ticks.max(1),
                None,
                Box::new(move |world| world.restore_npc(id)),
            );
        }
        Ok(())
    }

    /// Bring an npc back at its spawn tile: end of the remains window or of
    /// the respawn delay.
    fn restore_npc(&mut self, id: EntityId) -> Result<(), String> {
        let spawn_tile = {
            let Some(entity) = self.entities.get_mut(&id) else {
                return Ok(());
            };
            let Some(npc) = entity.as_npc_mut() else {
                return Ok(());
            };
            npc.remains = None;
            npc.spawn_tile
        };
        self.teleport(id, spawn_tile);
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.revive();
        }
        Ok(())
    }

    // ---- client sync ---------------------------------------------------

    /// Serialize per-player deltas after all updates are applied. Runs on
    /// the tick thread only.
    fn sync_players(&mut self, hit_events: &[HitEvent]) -> usize {
        let player_ids: Vec<EntityId> = self
            .entities
            .values()
            .filter(|entity| {
                entity.kind.is_player()
                    && entity
                        .as_player()
                        .map(|player| player.session.is_some())
                        .unwrap_or(false)
            })
            .map(|entity| entity.id)
            .collect();
        let mut frames_sent = 0;
        for id in player_ids {
            frames_sent += self.sync_one_player(id, hit_events);
        }
        for entity in self.entities.values_mut() {
            entity.last_tile = entity.tile;
        }
        frames_sent
    }

    fn sync_one_player(&mut self, id: EntityId, hit_events: &[HitEvent]) -> usize {
        let (session, tile, scope, reload) = {
            let Some(player) = self.entities.get(&id).and_then(|entity| entity.as_player())
            else {
                return 0;
            };
            let Some(session) = player.session.clone() else {
                return 0;
            };
            let entity = match self.entities.get(&id) {
                Some(entity) => entity,
                None => return 0,
            };
            (
                session,
                entity.tile,
                entity.dynamic_region,
                player.scene_reload_pending,
            )
        };
        if session.is_closed() {
            return 0;
        }
        let visible: Vec<EntityId> = self
            .entities_within_scope(scope, tile, self.config.view_radius, true, true, Some(id))
            .into_iter()
            .collect();
        let visible_set: HashSet<EntityId> = visible.iter().copied().collect();

        let mut frames = Vec::new();
        let (adds, removes, moves) = {
            let Some(player) = self.entities.get(&id).and_then(|entity| entity.as_player())
            else {
                return 0;
            };
            let known = &player.known_entities;
            let adds: Vec<EntityId> = if reload {
                visible.clone()
            } else {
                visible
                    .iter()
                    .copied()
                    .filter(|other| !known.contains(other))
                    .collect()
            };
            let removes: Vec<EntityId> = known
                .iter()
                .copied()
                .filter(|other| !visible_set.contains(other))
                .collect();
            let moves: Vec<EntityId> = if reload {
                Vec::new()
            } else {
                visible
                    .iter()
                    .copied()
                    .filter(|other| known.contains(other))
                    .filter(|other| {
                        self.entities
                            .get(other)
                            .map(|entity| entity.tile != entity.last_tile)
                            .unwrap_or(false)
                    })
                    .collect()
            };
            (adds, removes, moves)
        };

        if reload {
            frames.push(encoders::scene_reload(tile));
        }
        for other in &removes {
            frames.push(encoders::entity_removed(*other));
        }
        for other in &adds {
            if let Some(entity) = self.entities.get(other) {
                let mark = if entity.kind.is_player() {
                    encoders::ENTITY_MARK_PLAYER
                } else {
                    encoders::ENTITY_MARK_NPC
                };
                frames.push(encoders::entity_added(
                    *other,
                    mark,
                    entity.tile,
                    &entity.name,
                ));
            }
        }
        for other in &moves {
            if let Some(entity) = self.entities.get(other) {
                frames.push(encoders::entity_moved(*other, entity.tile, entity.run));
            }
        }
        for event in hit_events {
            if event.target == id || visible_set.contains(&event.target) {
                frames.push(encoders::hit_splat(
                    event.target,
                    event.hit,
                    event.hitpoints,
                    event.max_hitpoints,
                ));
            }
        }

        let sent = frames.len();
        for frame in frames {
            session.send(frame);
        }

        if let Some(player) = self
            .entities
            .get_mut(&id)
            .and_then(|entity| entity.as_player_mut())
        {
            player.known_entities = visible_set;
            if reload {
                player.scene_reload_pending = false;
                player.loaded_regions = match scope {
                    Some(region) => [region].into_iter().collect(),
                    None => RegionIndex::region_ids_in_range(tile, self.config.view_radius)
                        .into_iter()
                        .collect(),
                };
            }
        }
        sent
    }
}
