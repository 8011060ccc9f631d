use serde::{Deserialize, Serialize};

use crate::entities::entity::EntityId;

/// Damage channel of a queued hit; decides which protection and which
/// per-type mitigation multiplier applies on the defender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitLook {
    Melee,
    Ranged,
    Magic,
    Poison,
    Typeless,
}

impl HitLook {
    pub const COUNT: usize = 5;

    pub fn mark(self) -> u8 {
        match self {
            Self::Melee => 0,
            Self::Ranged => 1,
            Self::Magic => 2,
            Self::Poison => 3,
            Self::Typeless => 4,
        }
    }

    pub fn from_mark(mark: u8) -> Option<Self> {
        match mark {
            0 => Some(Self::Melee),
            1 => Some(Self::Ranged),
            2 => Some(Self::Magic),
            3 => Some(Self::Poison),
            4 => Some(Self::Typeless),
            _ => None,
        }
    }
}

/// A pending damage application. Queued onto the target and applied
/// atomically during that target's own update turn, never cross-entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub amount: u32,
    pub look: HitLook,
    pub source: Option<EntityId>,
}

impl Hit {
    pub fn new(amount: u32, look: HitLook, source: Option<EntityId>) -> Self {
        Self {
            amount,
            look,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn look_mark_roundtrip() {
        for mark in 0..HitLook::COUNT as u8 {
            let look = HitLook::from_mark(mark).expect("look");
            assert_eq!(look.mark(), mark);
        }
        assert_eq!(HitLook::from_mark(HitLook::COUNT as u8), None);
    }
}
