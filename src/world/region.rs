use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::config::WorldConfig;
use crate::entities::entity::EntityId;
use crate::world::clock::GameTick;
use crate::world::tile::{RegionId, WorldTile, DYNAMIC_REGION_BASE};

const PLACEMENT_CACHE_CAPACITY: usize = 256;

/// A dropped stack on the floor. Until `public_at` only the owner may take
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroundItem {
    pub item_id: u16,
    pub amount: u32,
    pub tile: WorldTile,
    pub owner: Option<EntityId>,
    pub public_at: GameTick,
}

impl GroundItem {
    pub fn may_take(&self, who: EntityId, now: GameTick) -> bool {
        match self.owner {
            Some(owner) => owner == who || now >= self.public_at,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldObject {
    pub object_id: u16,
    pub tile: WorldTile,
}

/// Static object placement for one region, built lazily from configuration
/// and shared between the live region and the eviction cache.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RegionPlacement {
    pub objects: Vec<WorldObject>,
}

#[derive(Debug)]
pub struct Region {
    pub id: RegionId,
    entities: HashSet<EntityId>,
    pub ground_items: Vec<GroundItem>,
    /// Objects spawned at runtime, on top of the static placement.
    pub objects: Vec<WorldObject>,
    placement: Option<Arc<RegionPlacement>>,
}

impl Region {
    fn new(id: RegionId) -> Self {
        Self {
            id,
            entities: HashSet::new(),
            ground_items: Vec::new(),
            objects: Vec::new(),
            placement: None,
        }
    }

    pub fn entities(&self) -> &HashSet<EntityId> {
        &self.entities
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn placement(&self) -> Option<&Arc<RegionPlacement>> {
        self.placement.as_ref()
    }

    pub fn ground_item(&self, item_id: u16, tile: WorldTile) -> Option<&GroundItem> {
        self.ground_items
            .iter()
            .find(|item| item.item_id == item_id && item.tile == tile)
    }

    pub fn remove_ground_item(&mut self, item_id: u16, tile: WorldTile) -> Option<GroundItem> {
        let index = self
            .ground_items
            .iter()
            .position(|item| item.item_id == item_id && item.tile == tile)?;
        Some(self.ground_items.remove(index))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementCacheStats {
    pub hits: u64,
    pub builds: u64,
    pub evictions: u64,
}

pub struct RegionIndex {
    regions: HashMap<RegionId, Region>,
    force_loaded: HashSet<RegionId>,
    placement_cache: LruCache<RegionId, Arc<RegionPlacement>>,
    stats: PlacementCacheStats,
    next_dynamic: u32,
}

impl std::fmt::Debug for RegionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionIndex")
            .field("regions", &self.regions.len())
            .field("cached_placements", &self.placement_cache.len())
            .field("next_dynamic", &self.next_dynamic)
            .finish()
    }
}

impl RegionIndex {
    pub fn new(force_loaded: impl IntoIterator<Item = RegionId>) -> Self {
        let capacity = NonZeroUsize::new(PLACEMENT_CACHE_CAPACITY)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            regions: HashMap::new(),
            force_loaded: force_loaded.into_iter().collect(),
            placement_cache: LruCache::new(capacity),
            stats: PlacementCacheStats::default(),
            next_dynamic: DYNAMIC_REGION_BASE,
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn contains(&self, id: RegionId) -> bool {
        self.regions.contains_key(&id)
    }

    pub fn is_force_loaded(&self, id: RegionId) -> bool {
        self.force_loaded.contains(&id)
    }

    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(&id)
    }

    pub fn get_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.get_mut(&id)
    }

    /// Lazily create the region on first entity entry or explicit preload.
    pub fn get_or_create(&mut self, id: RegionId) -> &mut Region {
        self.regions.entry(id).or_insert_with(|| Region::new(id))
    }

    /// Instanced regions live in their own id-space above the static grid.
    pub fn allocate_dynamic(&mut self) -> RegionId {
        let id = RegionId(self.next_dynamic);
        self.next_dynamic += 1;
        self.get_or_create(id);
        id
    }

    pub fn add_entity(&mut self, region_id: RegionId, entity: EntityId) {
        self.get_or_create(region_id).entities.insert(entity);
    }

    pub fn remove_entity(&mut self, region_id: RegionId, entity: EntityId) {
        if let Some(region) = self.regions.get_mut(&region_id) {
            region.entities.remove(&entity);
        }
    }

    /// Synchronous membership swap accompanying a position change.
    pub fn move_entity(&mut self, entity: EntityId, from: RegionId, to: RegionId) {
        if from == to {
            return;
        }
        self.remove_entity(from, entity);
        self.add_entity(to, entity);
    }

    /// Resolve the static placement for a region, consulting the eviction
    /// cache before rebuilding from configuration.
    pub fn ensure_placement(
        &mut self,
        id: RegionId,
        config: &WorldConfig,
    ) -> Arc<RegionPlacement> {
        if let Some(region) = self.regions.get(&id) {
            if let Some(placement) = region.placement.as_ref() {
                return Arc::clone(placement);
            }
        }
        let placement = if let Some(cached) = self.placement_cache.pop(&id) {
            self.stats.hits += 1;
            cached
        } else {
            self.stats.builds += 1;
            let objects = config
                .static_objects
                .iter()
                .filter(|spawn| spawn.tile.tile().region_id() == id)
                .map(|spawn| WorldObject {
                    object_id: spawn.object_id,
                    tile: spawn.tile.tile(),
                })
                .collect();
            Arc::new(RegionPlacement { objects })
        };
        self.get_or_create(id).placement = Some(Arc::clone(&placement));
        placement
    }

    /// Evict regions holding zero entities that are not force-loaded.
    /// Placement data moves to the LRU cache; entities are never touched
    /// here (callers relocate them first).
    pub fn unload_idle(&mut self) -> usize {
        let idle: Vec<RegionId> = self
            .regions
            .iter()
            .filter(|(id, region)| {
                region.entities.is_empty() && !self.force_loaded.contains(id)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            if let Some(region) = self.regions.remove(id) {
                if let Some(placement) = region.placement {
                    if self.placement_cache.put(*id, placement).is_some() {
                        self.stats.evictions += 1;
                    }
                }
            }
        }
        idle.len()
    }

    pub fn stats(&self) -> &PlacementCacheStats {
        &self.stats
    }

    /// Static-grid region ids covering the square of `radius` around a
    /// tile. Dynamic regions are not enumerable by coordinates.
    pub fn region_ids_in_range(tile: WorldTile, radius: u16) -> Vec<RegionId> {
        let min_x = tile.x.saturating_sub(radius) >> 6;
        let max_x = tile.x.saturating_add(radius) >> 6;
        let min_y = tile.y.saturating_sub(radius) >> 6;
        let max_y = tile.y.saturating_add(radius) >> 6;
        let mut ids = Vec::new();
        for rx in min_x..=max_x {
            for ry in min_y..=max_y {
                ids.push(RegionId((u32::from(rx) << 8) | u32::from(ry)));
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectSpawnConfig;
    use crate::config::TileConfig;

    #[test]
    fn regions_are_created_lazily() {
        let mut index = RegionIndex::new([]);
        let id = WorldTile::new(3222, 3218, 0).region_id();
        assert!(!index.contains(id));
        index.add_entity(id, EntityId(1));
        assert!(index.contains(id));
        assert_eq!(index.get(id).expect("region").entity_count(), 1);
    }

    #[test]
    fn move_entity_swaps_membership() {
        let mut index = RegionIndex::new([]);
        let from = RegionId(100);
        let to = RegionId(101);
        index.add_entity(from, EntityId(1));
        index.move_entity(EntityId(1), from, to);
        assert_eq!(index.get(from).expect("from").entity_count(), 0);
        assert_eq!(index.get(to).expect("to").entity_count(), 1);
    }

    #[test]
    fn unload_skips_occupied_and_force_loaded() {
        let mut index = RegionIndex::new([RegionId(7)]);
        index.get_or_create(RegionId(7));
        index.get_or_create(RegionId(8));
        index.add_entity(RegionId(9), EntityId(1));

        let unloaded = index.unload_idle();
        assert_eq!(unloaded, 1);
        assert!(index.contains(RegionId(7)));
        assert!(!index.contains(RegionId(8)));
        assert!(index.contains(RegionId(9)));
    }

    #[test]
    fn placement_survives_unload_through_cache() {
        let mut config = WorldConfig::default();
        let tile = TileConfig {
            x: 3200,
            y: 3200,
            plane: 0,
        };
        config.static_objects.push(ObjectSpawnConfig {
            object_id: 1276,
            tile,
        });
        let region_id = tile.tile().region_id();

        let mut index = RegionIndex::new([]);
        let built = index.ensure_placement(region_id, &config);
        assert_eq!(built.objects.len(), 1);
        assert_eq!(index.stats().builds, 1);

        index.unload_idle();
        assert!(!index.contains(region_id));

        let cached = index.ensure_placement(region_id, &config);
        assert_eq!(index.stats().hits, 1);
        assert_eq!(index.stats().builds, 1);
        assert!(Arc::ptr_eq(&built, &cached));
    }

    #[test]
    fn dynamic_ids_are_distinct_from_static_grid() {
        let mut index = RegionIndex::new([]);
        let first = index.allocate_dynamic();
        let second = index.allocate_dynamic();
        assert!(first.is_dynamic());
        assert!(second.is_dynamic());
        assert_ne!(first, second);
        assert!(!WorldTile::new(u16::MAX, u16::MAX, 0).region_id().is_dynamic());
    }

    #[test]
    fn ground_item_rights_honor_owner_and_timer() {
        let item = GroundItem {
            item_id: 995,
            amount: 100,
            tile: WorldTile::new(10, 10, 0),
            owner: Some(EntityId(1)),
            public_at: GameTick(50),
        };
        assert!(item.may_take(EntityId(1), GameTick(0)));
        assert!(!item.may_take(EntityId(2), GameTick(49)));
        assert!(item.may_take(EntityId(2), GameTick(50)));
    }

    #[test]
    fn region_ids_in_range_cover_neighbouring_regions() {
        let tile = WorldTile::new(3263, 3263, 0);
        let ids = RegionIndex::region_ids_in_range(tile, 2);
        assert_eq!(ids.len(), 4);
        assert!(ids.contains(&tile.region_id()));
        assert!(ids.contains(&WorldTile::new(3265, 3265, 0).region_id()));
    }
}
