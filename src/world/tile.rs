/// Region ids above this bound belong to the dynamic (instanced) id-space.
pub const DYNAMIC_REGION_BASE: u32 = 0x1_0000;

/// Side length of one region in tiles.
pub const REGION_SIZE: u16 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

impl RegionId {
    pub fn is_dynamic(self) -> bool {
        self.0 >= DYNAMIC_REGION_BASE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorldTile {
    pub x: u16,
    pub y: u16,
    pub plane: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    East,
    South,
    West,
    Northeast,
    Northwest,
    Southeast,
    Southwest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDelta {
    pub dx: i32,
    pub dy: i32,
}

impl WorldTile {
    pub fn new(x: u16, y: u16, plane: u8) -> Self {
        Self { x, y, plane }
    }

    pub fn region_id(self) -> RegionId {
        RegionId((u32::from(self.x >> 6) << 8) | u32::from(self.y >> 6))
    }

    /// Chebyshev distance on the same plane; planes never overlap.
    pub fn within_distance(self, other: WorldTile, radius: u16) -> bool {
        if self.plane != other.plane {
            return false;
        }
        let dx = i32::from(self.x) - i32::from(other.x);
        let dy = i32::from(self.y) - i32::from(other.y);
        dx.abs() <= i32::from(radius) && dy.abs() <= i32::from(radius)
    }

    pub fn offset(self, delta: TileDelta) -> Option<Self> {
        let x = i32::from(self.x) + delta.dx;
        let y = i32::from(self.y) + delta.dy;
        if x < 0 || y < 0 || x > i32::from(u16::MAX) || y > i32::from(u16::MAX) {
            return None;
        }
        Some(Self {
            x: x as u16,
            y: y as u16,
            plane: self.plane,
        })
    }

    pub fn step(self, direction: Direction) -> Option<Self> {
        self.offset(direction.delta())
    }

    /// Single greedy step towards a destination on the same plane.
    pub fn direction_towards(self, destination: WorldTile) -> Option<Direction> {
        if self.plane != destination.plane || self == destination {
            return None;
        }
        let dx = i32::from(destination.x) - i32::from(self.x);
        let dy = i32::from(destination.y) - i32::from(self.y);
        let direction = match (dx.signum(), dy.signum()) {
            (0, 1) => Direction::North,
            (0, -1) => Direction::South,
            (1, 0) => Direction::East,
            (-1, 0) => Direction::West,
            (1, 1) => Direction::Northeast,
            (-1, 1) => Direction::Northwest,
            (1, -1) => Direction::Southeast,
            (-1, -1) => Direction::Southwest,
            _ => return None,
        };
        Some(direction)
    }
}

impl Direction {
    pub fn delta(self) -> TileDelta {
        match self {
            Direction::North => TileDelta { dx: 0, dy: 1 },
            Direction::East => TileDelta { dx: 1, dy: 0 },
            Direction::South => TileDelta { dx: 0, dy: -1 },
            Direction::West => TileDelta { dx: -1, dy: 0 },
            Direction::Northeast => TileDelta { dx: 1, dy: 1 },
            Direction::Northwest => TileDelta { dx: -1, dy: 1 },
            Direction::Southeast => TileDelta { dx: 1, dy: -1 },
            Direction::Southwest => TileDelta { dx: -1, dy: -1 },
        }
    }

    pub fn is_diagonal(self) -> bool {
        matches!(
            self,
            Direction::Northeast
                | Direction::Northwest
                | Direction::Southeast
                | Direction::Southwest
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_id_coarse_division() {
        let tile = WorldTile::new(3222, 3218, 0);
        assert_eq!(tile.region_id(), RegionId((50 << 8) | 50));

        let same_region = WorldTile::new(3200, 3263, 0);
        assert_eq!(same_region.region_id(), tile.region_id());

        let east = WorldTile::new(3264, 3218, 0);
        assert_ne!(east.region_id(), tile.region_id());
    }

    #[test]
    fn region_id_independent_of_plane() {
        let ground = WorldTile::new(2881, 5306, 0);
        let upstairs = WorldTile::new(2881, 5306, 2);
        assert_eq!(ground.region_id(), upstairs.region_id());
    }

    #[test]
    fn within_distance_requires_same_plane() {
        let a = WorldTile::new(100, 100, 0);
        let b = WorldTile::new(101, 102, 0);
        assert!(a.within_distance(b, 2));
        assert!(!a.within_distance(b, 1));
        assert!(!a.within_distance(WorldTile::new(100, 100, 1), 5));
    }

    #[test]
    fn direction_towards_reaches_destination() {
        let mut tile = WorldTile::new(10, 10, 0);
        let destination = WorldTile::new(14, 7, 0);
        let mut steps = 0;
        while let Some(direction) = tile.direction_towards(destination) {
            tile = tile.step(direction).expect("step");
            steps += 1;
            assert!(steps <= 8, "walk did not converge");
        }
        assert_eq!(tile, destination);
        assert_eq!(steps, 4);
    }

    #[test]
    fn step_stays_on_plane() {
        let origin = WorldTile::new(200, 200, 1);
        for direction in [
            Direction::North,
            Direction::East,
            Direction::South,
            Direction::West,
            Direction::Northeast,
            Direction::Northwest,
            Direction::Southeast,
            Direction::Southwest,
        ] {
            let next = origin.step(direction).expect("step");
            assert_eq!(next.plane, origin.plane);
            assert!(origin.within_distance(next, 1));
        }
    }

    #[test]
    fn offset_rejects_map_edge() {
        let corner = WorldTile::new(0, 0, 0);
        assert_eq!(corner.offset(TileDelta { dx: -1, dy: 0 }), None);
        assert_eq!(corner.offset(TileDelta { dx: 0, dy: -1 }), None);
    }

    #[test]
    fn dynamic_region_space_is_disjoint() {
        let static_id = WorldTile::new(u16::MAX, u16::MAX, 0).region_id();
        assert!(!static_id.is_dynamic());
        assert!(RegionId(DYNAMIC_REGION_BASE).is_dynamic());
    }
}
