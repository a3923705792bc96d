//! Watchdog probe of the daemon's health endpoint

use async_trait::async_trait;
use std::time::Duration;
use supervisor_lib::{Result, SelfCheck, SupervisorError};

/// Passes when `GET {base}/healthz` answers 2xx
pub struct HttpSelfCheck {
    client: reqwest::Client,
    url: String,
}

impl HttpSelfCheck {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SupervisorError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}/healthz", base_url.trim_end_matches('/')),
        })
    }

    /// Probe of a daemon listening on localhost
    pub fn local(port: u16, timeout: Duration) -> Result<Self> {
        Self::new(&format!("http://127.0.0.1:{port}"), timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SelfCheck for HttpSelfCheck {
    async fn check(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SupervisorError::SelfCheck(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SupervisorError::SelfCheck(format!("{} returned {}", self.url, status)))
        }
    }
}
