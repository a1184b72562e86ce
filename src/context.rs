use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::messaging::DoorEvent;
use crate::core::notifications::create_notifier;
use crate::door::{DoorOptions, LayoutDoor};

/// Pool reports waiting for the event loop.
const EVENT_QUEUE: usize = 256;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub door: Arc<LayoutDoor>,
    /// Pool reports go through here to the orchestrator.
    pub events: mpsc::Sender<DoorEvent>,
}

impl AppContext {
    /// Wire the door to the collaborators `config` selects. The receiver
    /// belongs to the orchestrator.
    pub fn new(config: AppConfig) -> Result<(Self, mpsc::Receiver<DoorEvent>)> {
        let (events, rx) = mpsc::channel(EVENT_QUEUE);
        let collaborators = adapters::get_collaborators(&config, events.clone())?;

        let door = LayoutDoor::new(
            DoorOptions::from(&config),
            collaborators.selector,
            collaborators.bus,
            collaborators.namespace,
        )
        .with_notifier(create_notifier(&config.notifications));

        Ok((Self::with_door(config, Arc::new(door), events), rx))
    }

    pub fn with_door(config: AppConfig, door: Arc<LayoutDoor>, events: mpsc::Sender<DoorEvent>) -> Self {
        Self {
            config: Arc::new(config),
            door,
            events,
        }
    }
}
