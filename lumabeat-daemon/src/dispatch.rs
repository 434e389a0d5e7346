use anyhow::{Context, Result};
use serde_json::json;
use std::future::Future;
use std::time::Duration;

use crate::palette::Color;

/// Output collaborator. Fire-and-forget: only call success/failure matters,
/// response bodies are ignored.
pub trait ColorSink: Send + Sync + 'static {
    fn send(
        &self,
        color: Color,
        transition_secs: f32,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// POSTs `{"rgb":[r,g,b],"transition":t}` to the configured endpoint.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, url })
    }
}

impl ColorSink for WebhookSink {
    async fn send(&self, color: Color, transition_secs: f32) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&json!({
                "rgb": [color.r, color.g, color.b],
                "transition": transition_secs,
            }))
            .send()
            .await
            .with_context(|| format!("light webhook unreachable: {}", self.url))?
            .error_for_status()
            .context("light webhook rejected dispatch")?;
        Ok(())
    }
}
