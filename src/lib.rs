pub mod combat;
mod config;
pub mod entities;
mod net;
pub mod telemetry;
pub mod world;

pub use config::{AppConfig, GeofenceConfig, NpcDefinition, WorldConfig};
pub use net::packet::{PacketReader, PacketWriter};
pub use net::server::{run_game_server, GameServerConfig, ServerControl, ServerExit};
pub use net::session::{LogicCommand, ProtocolError, SessionHandle, SessionStage};

pub fn run(args: &[String]) -> Result<(), String> {
    loop {
        let config = config::AppConfig::from_args(args)?;
        telemetry::logging::init(&config.root)?;
        let world_config = config::WorldConfig::load(&config.root)?;

        println!("varrock: world server");
        println!("- root: {}", config.root.display());
        println!("- bind: {}", config.bind_addr);
        println!("- client revision: {}", world_config.client_revision);
        println!("- tick length: {}ms", world_config.tick_millis);
        println!(
            "- npc definitions: {}, spawns: {}",
            world_config.npc_definitions.len(),
            world_config.npc_spawns.len()
        );
        println!(
            "- geofences: {}, force-loaded regions: {}",
            world_config.geofences.len(),
            world_config.force_loaded_regions.len()
        );

        let world = std::sync::Arc::new(std::sync::Mutex::new(
            world::state::WorldState::new(world_config),
        ));
        {
            let world = world
                .lock()
                .map_err(|_| "world lock poisoned".to_string())?;
            telemetry::logging::log_game(&format!(
                "world ready: {} entities, {} regions",
                world.entity_count(),
                world.regions.len()
            ));
        }

        let control = std::sync::Arc::new(ServerControl::new());
        let server_config = GameServerConfig {
            bind_addr: config.bind_addr.clone(),
        };
        let exit = run_game_server(server_config, world, std::sync::Arc::clone(&control))?;

        match exit {
            ServerExit::Shutdown => return Ok(()),
            ServerExit::Restart => {
                println!("varrock: restart requested, relaunching");
            }
        }
    }
}
