use crate::combat::hit::HitLook;
use crate::config::NpcDefinition;
use crate::entities::entity::EntityId;
use crate::world::clock::Cooldown;

pub const MELEE_ATTACK_RANGE: u16 = 1;
pub const PROJECTILE_ATTACK_RANGE: u16 = 8;
pub const SPECIAL_CHARGE_FULL: u8 = 100;

/// Per-entity combat bookkeeping. The target is a weak reference: a plain id
/// that is re-validated against the registry every tick, never ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombatState {
    target: Option<EntityId>,
    pub attack_cooldown: Cooldown,
    pub special_charge: u8,
    pub protections: ProtectionFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtectionFlags {
    pub melee: bool,
    pub ranged: bool,
    pub magic: bool,
}

impl ProtectionFlags {
    pub fn protects_against(&self, look: HitLook) -> bool {
        match look {
            HitLook::Melee => self.melee,
            HitLook::Ranged => self.ranged,
            HitLook::Magic => self.magic,
            HitLook::Poison | HitLook::Typeless => false,
        }
    }
}

impl Default for CombatState {
    fn default() -> Self {
        Self {
            target: None,
            attack_cooldown: Cooldown::ready(),
            special_charge: SPECIAL_CHARGE_FULL,
            protections: ProtectionFlags::default(),
        }
    }
}

impl CombatState {
    pub fn target(&self) -> Option<EntityId> {
        self.target
    }

    pub fn set_target(&mut self, target: EntityId) {
        self.target = Some(target);
    }

    pub fn clear_target(&mut self) {
        self.target = None;
    }

    pub fn drain_special(&mut self, cost: u8) -> bool {
        if self.special_charge < cost {
            return false;
        }
        self.special_charge -= cost;
        true
    }

    pub fn recharge_special(&mut self, amount: u8) {
        self.special_charge = self
            .special_charge
            .saturating_add(amount)
            .min(SPECIAL_CHARGE_FULL);
    }
}

pub fn attack_range(look: HitLook) -> u16 {
    match look {
        HitLook::Melee => MELEE_ATTACK_RANGE,
        HitLook::Ranged | HitLook::Magic => PROJECTILE_ATTACK_RANGE,
        HitLook::Poison | HitLook::Typeless => MELEE_ATTACK_RANGE,
    }
}

/// Scale an incoming hit by the defender's fixed per-type mitigation
/// multiplier when the matching protection is up, then clamp to the
/// defender's damage cap. Multipliers are per-entity-type constants from
/// the definition tables, never computed from equipment.
pub fn mitigated_damage(
    amount: u32,
    look: HitLook,
    protections: ProtectionFlags,
    defs: &NpcDefinition,
) -> u32 {
    let mut damage = amount;
    if protections.protects_against(look) {
        let multiplier = defs.prayer_multiplier(look);
        damage = ((damage as f64) * multiplier).floor() as u32;
    }
    if let Some(cap) = defs.damage_cap {
        damage = damage.min(cap);
    }
    damage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;

    fn boss_defs() -> NpcDefinition {
        WorldConfig::default()
            .npc_definitions
            .get("corporeal_husk")
            .cloned()
            .expect("boss definition")
    }

    #[test]
    fn protection_scales_magic_by_fixed_multiplier() {
        let defs = boss_defs();
        let protections = ProtectionFlags {
            magic: true,
            ..ProtectionFlags::default()
        };
        assert_eq!(mitigated_damage(100, HitLook::Magic, protections, &defs), 60);
        // No protection up: full damage.
        assert_eq!(
            mitigated_damage(100, HitLook::Magic, ProtectionFlags::default(), &defs),
            100
        );
    }

    #[test]
    fn damage_cap_clamps_after_mitigation() {
        let defs = boss_defs();
        let cap = defs.damage_cap.expect("cap");
        assert_eq!(
            mitigated_damage(cap * 3, HitLook::Melee, ProtectionFlags::default(), &defs),
            cap
        );
    }

    #[test]
    fn special_charge_drains_and_recharges() {
        let mut combat = CombatState::default();
        assert!(combat.drain_special(60));
        assert_eq!(combat.special_charge, 40);
        assert!(!combat.drain_special(60));
        combat.recharge_special(200);
        assert_eq!(combat.special_charge, SPECIAL_CHARGE_FULL);
    }

    #[test]
    fn poison_ignores_protections() {
        let defs = boss_defs();
        let protections = ProtectionFlags {
            melee: true,
            ranged: true,
            magic: true,
        };
        assert_eq!(mitigated_damage(30, HitLook::Poison, protections, &defs), 30);
    }
}
