//! Where to report a finished batch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

use crate::error::DistexpError;
use crate::scheduler::format_duration;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn on_finish(&self, experiments: usize, elapsed: Duration) -> Result<(), DistexpError>;
}

/// Reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

#[async_trait]
impl Notifier for Silent {
    async fn on_finish(&self, _: usize, _: Duration) -> Result<(), DistexpError> {
        Ok(())
    }
}

/// Posts a status message to a Slack incoming webhook.
pub struct Slack {
    webhook_url: String,
    client: Client,
}

impl Slack {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: Client::new(),
        }
    }

    pub async fn send(&self, text: &str) -> Result<(), DistexpError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        info!("Slack API: {}", response.text().await?);
        Ok(())
    }
}

#[async_trait]
impl Notifier for Slack {
    async fn on_finish(&self, experiments: usize, elapsed: Duration) -> Result<(), DistexpError> {
        self.send(&finish_message(experiments, elapsed)).await
    }
}

/// The user that started the batch, seeing through `sudo`.
fn invoking_user() -> String {
    std::env::var("SUDO_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn finish_message(experiments: usize, elapsed: Duration) -> String {
    format!(
        "*_Status report_*\n\n*{}* experiments from *{}* finished in {}.",
        experiments,
        invoking_user(),
        format_duration(elapsed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_message() {
        let message = finish_message(12, Duration::from_secs(3723));
        assert!(message.contains("*12* experiments"));
        assert!(message.ends_with("finished in 01:02:03.0000."));
    }

    #[tokio::test]
    async fn test_silent_never_fails() {
        Silent.on_finish(3, Duration::from_secs(1)).await.unwrap();
    }
}
