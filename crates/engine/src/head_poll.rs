//! Execution Head Polling
//!
//! Periodically probes every execution upstream with `eth_blockNumber` so
//! freshness scoring has data even when beacon events are disabled or an
//! upstream never serves a winning request. Probes go straight to each
//! upstream rather than through selection.

use crate::registry::{UpstreamKind, UpstreamRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Head poller task over the execution pool.
pub struct HeadPoller {
    registry: Arc<UpstreamRegistry>,
    client: reqwest::Client,
    interval: Duration,
}

impl HeadPoller {
    /// # Errors
    /// Fails when the probe HTTP client cannot initialize.
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        interval: Duration,
    ) -> Result<Self, crate::error::GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| crate::error::GatewayError::Fatal(format!("head poll client: {e}")))?;
        Ok(Self {
            registry,
            client,
            interval,
        })
    }

    /// Poll until shutdown flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.poll_once().await;
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One sweep over the execution pool. Failures only cost freshness.
    pub async fn poll_once(&self) {
        let pool = self.registry.pool(UpstreamKind::EthRpc);
        let probes = pool.iter().enumerate().map(|(idx, upstream)| {
            let client = self.client.clone();
            let url = upstream.url.clone();
            async move { (idx, probe_block_number(&client, &url).await) }
        });
        for (idx, observed) in futures::future::join_all(probes).await {
            if let Some(block) = observed {
                self.registry.head_observed(UpstreamKind::EthRpc, idx, block);
            }
        }
    }
}

async fn probe_block_number(client: &reqwest::Client, url: &str) -> Option<u64> {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "eth_blockNumber",
        "params": [],
        "id": 1,
    });
    let response = client.post(url).json(&body).send().await.ok()?;
    let value: serde_json::Value = response.json().await.ok()?;
    let hex = value.get("result")?.as_str()?;
    u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok()
}
