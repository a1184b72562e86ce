use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::messaging::{DoorEvent, MessageBus};
use crate::core::namespace::{HandleNamespace, Namespace};
use crate::core::selection::{PoolSelector, SelectionError};

pub mod rpc;
pub mod simulated;

pub use rpc::{RpcMessageBus, RpcPoolManager};
pub use simulated::{SimPool, SimulatedPools, Simulator};

/// Everything the door talks to.
pub struct Collaborators {
    pub selector: Arc<dyn PoolSelector>,
    pub bus: Arc<dyn MessageBus>,
    pub namespace: Arc<dyn Namespace>,
}

pub fn get_collaborators(config: &AppConfig, events: mpsc::Sender<DoorEvent>) -> Result<Collaborators> {
    let namespace: Arc<dyn Namespace> = Arc::new(HandleNamespace);

    if config.simulation {
        let pools = vec![
            SimPool::new("pool-a", &["127.0.0.1:20491"], 1),
            SimPool::new("pool-b", &["127.0.0.1:20492"], 2),
        ];
        let (sim, controller) = SimulatedPools::new(pools, events);
        spawn_console(controller);

        let sim = Arc::new(sim);
        return Ok(Collaborators {
            selector: sim.clone(),
            bus: sim,
            namespace,
        });
    }

    let manager = config
        .endpoints
        .get(&config.pool_manager)
        .with_context(|| format!("No endpoint configured for pool manager {}", config.pool_manager))?;

    Ok(Collaborators {
        selector: Arc::new(RpcPoolManager::new(*manager)),
        bus: Arc::new(RpcMessageBus::spawn(config.endpoints.clone())),
        namespace,
    })
}

const CONSOLE_HELP: &str =
    "(Simulator) Use: 'restart <pool> <verifier>', 'fail <rc>', 'heal', 'hold', 'release'";

fn spawn_console(controller: Simulator) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lines().map_while(Result::ok) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["restart", pool, verifier] => match verifier.parse() {
                    Ok(v) if controller.restart_pool(pool, v) => {
                        println!("(Simulator) {} restarted", pool)
                    }
                    _ => println!("(Simulator) No such pool or bad verifier"),
                },
                ["fail", rc] => match rc.parse() {
                    Ok(rc) => controller.set_failure(Some(SelectionError::from_rc(rc, "simulated"))),
                    Err(_) => println!("{}", CONSOLE_HELP),
                },
                ["heal"] => controller.set_failure(None),
                ["hold"] => controller.set_auto_ready(false),
                ["release"] => controller.set_auto_ready(true),
                _ => println!("{}", CONSOLE_HELP),
            }
        }
    });
}
