use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::combat::hit::HitLook;
use crate::world::tile::WorldTile;

#[derive(Debug)]
pub struct AppConfig {
    pub root: PathBuf,
    pub bind_addr: String,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        if args.len() < 2 {
            return Err("usage: varrock <data-root> [bind_addr]".to_string());
        }

        let root = Path::new(&args[1]).to_path_buf();
        let bind_addr = if args.len() > 2 {
            args[2].clone()
        } else {
            std::env::var("VARROCK_BIND_ADDR")
                .ok()
                .and_then(|value| {
                    let trimmed = value.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        Some(trimmed.to_string())
                    }
                })
                .unwrap_or_else(|| "0.0.0.0:43594".to_string())
        };
        Ok(Self { root, bind_addr })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileConfig {
    pub x: u16,
    pub y: u16,
    pub plane: u8,
}

impl TileConfig {
    pub fn tile(self) -> WorldTile {
        WorldTile::new(self.x, self.y, self.plane)
    }
}

impl From<WorldTile> for TileConfig {
    fn from(tile: WorldTile) -> Self {
        Self {
            x: tile.x,
            y: tile.y,
            plane: tile.plane,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemDropConfig {
    pub item_id: u16,
    pub amount: u32,
}

impl Default for ItemDropConfig {
    fn default() -> Self {
        Self {
            item_id: 0,
            amount: 1,
        }
    }
}

/// Combat behaviour of one non-player archetype. Balance numbers live here
/// as data, not in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NpcDefinition {
    pub name: String,
    pub hitpoints: u32,
    pub attack_style: HitLook,
    pub max_hit: u32,
    pub attack_speed_ticks: u64,
    pub aggressive: bool,
    pub aggro_radius: u16,
    pub death_delay_ticks: u64,
    pub respawn_delay_ticks: u64,
    pub damage_cap: Option<u32>,
    pub regen_to_full_when_idle: bool,
    pub melee_prayer_multiplier: f64,
    pub ranged_prayer_multiplier: f64,
    pub magic_prayer_multiplier: f64,
    pub faction: Option<String>,
    pub leaves_remains: bool,
    pub loot: Vec<ItemDropConfig>,
}

impl Default for NpcDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            hitpoints: 1,
            attack_style: HitLook::Melee,
            max_hit: 0,
            attack_speed_ticks: 4,
            aggressive: false,
            aggro_radius: 4,
            death_delay_ticks: 3,
            respawn_delay_ticks: 25,
            damage_cap: None,
            regen_to_full_when_idle: false,
            melee_prayer_multiplier: 1.0,
            ranged_prayer_multiplier: 1.0,
            magic_prayer_multiplier: 1.0,
            faction: None,
            leaves_remains: false,
            loot: Vec::new(),
        }
    }
}

impl NpcDefinition {
    pub fn prayer_multiplier(&self, look: HitLook) -> f64 {
        match look {
            HitLook::Melee => self.melee_prayer_multiplier,
            HitLook::Ranged => self.ranged_prayer_multiplier,
            HitLook::Magic => self.magic_prayer_multiplier,
            HitLook::Poison | HitLook::Typeless => 1.0,
        }
    }
}

/// A faction war zone. Inside the fence, faction actors fight everything
/// except their own kind and players wearing aligned equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceConfig {
    pub name: String,
    pub faction: String,
    pub center: TileConfig,
    pub radius: u16,
    pub protected_item_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcSpawnConfig {
    pub definition: String,
    pub tile: TileConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSpawnConfig {
    pub object_id: u16,
    pub tile: TileConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub client_revision: u32,
    pub tick_millis: u64,
    pub max_players: usize,
    pub view_radius: u16,
    pub player_hitpoints: u32,
    pub player_max_hit: u32,
    pub player_attack_speed_ticks: u64,
    pub player_death_delay_ticks: u64,
    pub player_respawn_tile: TileConfig,
    pub regen_interval_ticks: u64,
    pub kept_on_death: usize,
    pub ground_item_public_ticks: u64,
    pub remains_grace_seconds: u64,
    pub remains_duration_ticks: u64,
    pub region_unload_interval_ticks: u64,
    pub force_loaded_regions: Vec<u32>,
    pub geofences: Vec<GeofenceConfig>,
    pub npc_definitions: HashMap<String, NpcDefinition>,
    pub npc_spawns: Vec<NpcSpawnConfig>,
    pub static_objects: Vec<ObjectSpawnConfig>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        let mut npc_definitions = HashMap::new();
        npc_definitions.insert(
            "meadow_wolf".to_string(),
            NpcDefinition {
                name: "Meadow wolf".to_string(),
                hitpoints: 25,
                max_hit: 4,
                aggressive: true,
                aggro_radius: 4,
                loot: vec![ItemDropConfig {
                    item_id: 526,
                    amount: 1,
                }],
                ..NpcDefinition::default()
            },
        );
        npc_definitions.insert(
            "aurelian_zealot".to_string(),
            NpcDefinition {
                name: "Aurelian zealot".to_string(),
                hitpoints: 350,
                max_hit: 12,
                aggressive: true,
                aggro_radius: 8,
                faction: Some("aurelian".to_string()),
                ..NpcDefinition::default()
            },
        );
        npc_definitions.insert(
            "corporeal_husk".to_string(),
            NpcDefinition {
                name: "Corporeal husk".to_string(),
                hitpoints: 2000,
                attack_style: HitLook::Magic,
                max_hit: 65,
                attack_speed_ticks: 4,
                aggressive: true,
                aggro_radius: 8,
                death_delay_ticks: 5,
                respawn_delay_ticks: 50,
                damage_cap: Some(1000),
                regen_to_full_when_idle: true,
                magic_prayer_multiplier: 0.6,
                ..NpcDefinition::default()
            },
        );
        npc_definitions.insert(
            "rock_creature".to_string(),
            NpcDefinition {
                name: "Rock creature".to_string(),
                hitpoints: 120,
                max_hit: 8,
                aggressive: true,
                aggro_radius: 3,
                death_delay_ticks: 2,
                respawn_delay_ticks: 30,
                leaves_remains: true,
                ..NpcDefinition::default()
            },
        );

        Self {
            client_revision: 633,
            tick_millis: 600,
            max_players: 2000,
            view_radius: 15,
            player_hitpoints: 100,
            player_max_hit: 20,
            player_attack_speed_ticks: 4,
            player_death_delay_ticks: 4,
            player_respawn_tile: TileConfig {
                x: 3222,
                y: 3218,
                plane: 0,
            },
            regen_interval_ticks: 10,
            kept_on_death: 3,
            ground_item_public_ticks: 100,
            remains_grace_seconds: 60,
            remains_duration_ticks: 300,
            region_unload_interval_ticks: 100,
            force_loaded_regions: Vec::new(),
            geofences: vec![GeofenceConfig {
                name: "aurelian stronghold".to_string(),
                faction: "aurelian".to_string(),
                center: TileConfig {
                    x: 2881,
                    y: 5306,
                    plane: 0,
                },
                radius: 200,
                protected_item_names: vec![
                    "aurelian coif".to_string(),
                    "aurelian mitre".to_string(),
                    "aurelian full helm".to_string(),
                    "aurelian halo".to_string(),
                    "aurelian cape".to_string(),
                    "aurelian cloak".to_string(),
                    "aurelian stole".to_string(),
                    "aurelian arrow".to_string(),
                    "aurelian godsword".to_string(),
                    "aurelian staff".to_string(),
                    "aurelian crozier".to_string(),
                    "aurelian robe top".to_string(),
                    "aurelian d'hide".to_string(),
                    "aurelian platebody".to_string(),
                    "aurelian kiteshield".to_string(),
                    "blessed symbol".to_string(),
                    "blessed book".to_string(),
                ],
            }],
            npc_definitions,
            npc_spawns: Vec::new(),
            static_objects: Vec::new(),
        }
    }
}

impl WorldConfig {
    pub const FILE_NAME: &'static str = "world.yaml";

    /// Load `<root>/world.yaml`; a missing file means defaults, a present
    /// but unparsable file is a startup failure.
    pub fn load(root: &Path) -> Result<Self, String> {
        let path = root.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| format!("read {} failed: {}", path.display(), err))?;
        serde_yaml::from_str(&raw).map_err(|err| format!("parse {} failed: {}", path.display(), err))
    }

    pub fn npc_definition(&self, key: &str) -> Option<&NpcDefinition> {
        self.npc_definitions.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_config_requires_root() {
        let err = AppConfig::from_args(&["varrock".to_string()]).unwrap_err();
        assert!(err.starts_with("usage:"));
    }

    #[test]
    fn app_config_reads_positional_bind_addr() {
        let config = AppConfig::from_args(&[
            "varrock".to_string(),
            "data".to_string(),
            "127.0.0.1:5000".to_string(),
        ])
        .expect("config");
        assert_eq!(config.root, PathBuf::from("data"));
        assert_eq!(config.bind_addr, "127.0.0.1:5000");
    }

    #[test]
    fn world_config_partial_yaml_overlays_defaults() {
        let parsed: WorldConfig =
            serde_yaml::from_str("client_revision: 700\ntick_millis: 500\n").expect("yaml");
        assert_eq!(parsed.client_revision, 700);
        assert_eq!(parsed.tick_millis, 500);
        assert_eq!(parsed.kept_on_death, WorldConfig::default().kept_on_death);
        assert!(parsed.npc_definitions.contains_key("corporeal_husk"));
    }

    #[test]
    fn world_config_roundtrips_through_yaml() {
        let config = WorldConfig::default();
        let raw = serde_yaml::to_string(&config).expect("serialize");
        let parsed: WorldConfig = serde_yaml::from_str(&raw).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn default_boss_definition_is_capped_and_mitigated() {
        let config = WorldConfig::default();
        let boss = config.npc_definition("corporeal_husk").expect("boss");
        assert_eq!(boss.damage_cap, Some(1000));
        assert!(boss.regen_to_full_when_idle);
        assert!((boss.magic_prayer_multiplier - 0.6).abs() < f64::EPSILON);
    }
}
