mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{NotificationChannelType, NotificationConfig};
use crate::core::state::StateId;
use crate::core::transfer::IoMode;

pub use webhook::WebhookNotifier;

/// Events that feed downstream transfer accounting
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Finished {
        state_id: StateId,
        file: String,
        pool: Option<String>,
        mover_id: Option<u32>,
        client: SocketAddr,
        mode: IoMode,
        return_code: i32,
        message: String,
        duration_ms: i64,
    },
}

/// Trait for accounting sinks (webhook, ...)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: TransferEvent) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Webhook => {
            let url = config.webhook_url.as_ref()?;
            if url.is_empty() {
                return None;
            }
            Some(Arc::new(WebhookNotifier::new(url.clone())))
        }
    }
}
