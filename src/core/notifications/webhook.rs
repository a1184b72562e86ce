use super::{NotificationChannel, TransferEvent};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

/// Posts accounting records as JSON to a webhook.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    fn format_record(&self, event: &TransferEvent) -> serde_json::Value {
        match event {
            TransferEvent::Finished {
                state_id,
                file,
                pool,
                mover_id,
                client,
                mode,
                return_code,
                message,
                duration_ms,
            } => json!({
                "type": "door_transfer",
                "protocol": "NFSV4.1",
                "state_id": state_id,
                "pnfsid": file,
                "pool": pool,
                "mover_id": mover_id,
                "client": client.ip().to_string(),
                "is_write": mode.is_write(),
                "transfer_time_ms": duration_ms,
                "status": {
                    "code": return_code,
                    "message": message,
                },
            }),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookNotifier {
    async fn notify(&self, event: TransferEvent) -> Result<()> {
        let payload = self.format_record(&event);
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::StateId;
    use crate::core::transfer::IoMode;

    #[test]
    fn record_carries_status_and_direction() {
        let notifier = WebhookNotifier::new("http://localhost/".into());
        let event = TransferEvent::Finished {
            state_id: StateId::new([1; 12], 1),
            file: "0000ABCD".into(),
            pool: Some("pool-1".into()),
            mover_id: Some(4),
            client: "10.1.1.1:900".parse().unwrap(),
            mode: IoMode::ReadWrite,
            return_code: 0,
            message: String::new(),
            duration_ms: 1500,
        };

        let record = notifier.format_record(&event);
        assert_eq!(record["pnfsid"], "0000ABCD");
        assert_eq!(record["is_write"], true);
        assert_eq!(record["client"], "10.1.1.1");
        assert_eq!(record["status"]["code"], 0);
    }
}
