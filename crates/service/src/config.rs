//! Gateway Configuration
//!
//! Flags and environment variables, parsed once at startup and translated
//! into the per-component configs the engine crates expect.

use clap::{ArgAction, Parser};
use gateway_engine::{
    flags, CacheConfig, DispatchConfig, EventsConfig, PeriodStoreConfig, RegistryConfig, Upstream,
    UpstreamRegistry,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "stateless-gateway")]
#[command(about = "Stateless verifying Ethereum RPC gateway")]
pub struct Args {
    /// HTTP listen port
    #[arg(long, env = "PORT", default_value_t = 8545)]
    pub port: u16,

    /// Chain id served to clients
    #[arg(long, env = "CHAIN_ID", default_value_t = 1)]
    pub chain_id: u64,

    /// Execution JSON-RPC upstreams, comma separated
    #[arg(long, env = "RPC_NODES", value_delimiter = ',')]
    pub rpc_nodes: Vec<String>,

    /// Beacon REST upstreams, comma separated; the first doubles as the
    /// event publisher
    #[arg(long, env = "BEACON_NODES", value_delimiter = ',')]
    pub beacon_nodes: Vec<String>,

    /// Other gateways able to answer proof reads directly
    #[arg(long, env = "PROVER_NODES", value_delimiter = ',')]
    pub prover_nodes: Vec<String>,

    /// Per-request deadline in seconds
    #[arg(long, env = "REQ_TIMEOUT", default_value_t = 120)]
    pub req_timeout: u64,

    /// Subscribe to beacon head/finality events
    #[arg(long, env = "BEACON_EVENTS", default_value_t = true, action = ArgAction::Set)]
    pub beacon_events: bool,

    /// Period store directory; unset disables the internal path
    #[arg(long, env = "PERIOD_STORE")]
    pub period_store: Option<PathBuf>,

    /// Master gateway filling period store misses
    #[arg(long, env = "PERIOD_STORE_MASTER")]
    pub period_store_master: Option<String>,

    /// Committee periods retained before eviction
    #[arg(long, env = "MAX_SYNC_STATES", default_value_t = 3)]
    pub max_sync_states: usize,

    /// Starting per-upstream concurrency window
    #[arg(long, env = "MAX_CONCURRENCY_DEFAULT", default_value_t = 16)]
    pub max_concurrency_default: u32,

    /// Hard ceiling for the adaptive window
    #[arg(long, env = "MAX_CONCURRENCY_CAP", default_value_t = 128)]
    pub max_concurrency_cap: u32,

    /// Latency below which a window may widen, in milliseconds
    #[arg(long, env = "LATENCY_TARGET_MS", default_value_t = 500)]
    pub latency_target_ms: u64,

    /// Minimum spacing between window increases, in milliseconds
    #[arg(long, env = "CONC_COOLDOWN_MS", default_value_t = 2_000)]
    pub conc_cooldown_ms: u64,

    /// Extra slots past the window once saturation waiting is exhausted
    #[arg(long, env = "OVERFLOW_SLOTS", default_value_t = 2)]
    pub overflow_slots: u32,

    /// Pause before overflowing onto a saturated pool, in milliseconds
    #[arg(long, env = "SATURATION_WAIT_MS", default_value_t = 200)]
    pub saturation_wait_ms: u64,

    /// TTL for head-block data in the cache, in seconds
    #[arg(long, env = "BLOCK_AVAILABILITY_TTL_SEC", default_value_t = 12)]
    pub block_availability_ttl_sec: u64,

    /// Probe execution upstreams for their head block
    #[arg(long, env = "RPC_HEAD_POLL_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub rpc_head_poll_enabled: bool,

    /// Head probe interval, in milliseconds
    #[arg(long, env = "RPC_HEAD_POLL_INTERVAL_MS", default_value_t = 12_000)]
    pub rpc_head_poll_interval_ms: u64,

    /// Cache entry budget; past it lookups degrade to direct dispatch
    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value_t = 100_000)]
    pub cache_max_entries: usize,

    /// Grace period for draining open requests at shutdown, in seconds
    #[arg(long, env = "SHUTDOWN_DRAIN_SEC", default_value_t = 10)]
    pub shutdown_drain_sec: u64,
}

impl Args {
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_concurrency_default: self.max_concurrency_default,
            max_concurrency_cap: self.max_concurrency_cap,
            latency_target_ms: self.latency_target_ms,
            conc_cooldown: Duration::from_millis(self.conc_cooldown_ms),
            overflow_slots: self.overflow_slots,
            ..RegistryConfig::default()
        }
    }

    #[must_use]
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            saturation_wait: Duration::from_millis(self.saturation_wait_ms),
            ..DispatchConfig::default()
        }
    }

    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.cache_max_entries,
            head_ttl: Duration::from_secs(self.block_availability_ttl_sec),
            ..CacheConfig::default()
        }
    }

    #[must_use]
    pub fn events_config(&self) -> EventsConfig {
        EventsConfig {
            head_ttl: Duration::from_secs(self.block_availability_ttl_sec),
            ..EventsConfig::default()
        }
    }

    #[must_use]
    pub fn period_store_config(&self) -> Option<PeriodStoreConfig> {
        self.period_store.as_ref().map(|dir| PeriodStoreConfig {
            dir: dir.clone(),
            max_sync_states: self.max_sync_states,
            master_url: self.period_store_master.clone(),
        })
    }

    /// Build the upstream pools. The first beacon node carries the event
    /// flags; prover gateways join the REST pool.
    #[must_use]
    pub fn build_registry(&self) -> UpstreamRegistry {
        let config = self.registry_config();
        let eth_rpc = self
            .rpc_nodes
            .iter()
            .filter(|u| !u.is_empty())
            .map(|url| Upstream::new(url.clone(), 0, &config))
            .collect();
        let beacon = self
            .beacon_nodes
            .iter()
            .filter(|u| !u.is_empty())
            .enumerate()
            .map(|(i, url)| {
                let node_flags = if i == 0 {
                    flags::EVENT_SOURCE | flags::BEACON_EVENT_PUBLISHER
                } else {
                    flags::EVENT_SOURCE
                };
                Upstream::new(url.clone(), node_flags, &config)
            })
            .collect();
        let rest = self
            .prover_nodes
            .iter()
            .filter(|u| !u.is_empty())
            .map(|url| Upstream::new(url.clone(), flags::PROVER, &config))
            .collect();
        UpstreamRegistry::new(config, eth_rpc, beacon, rest)
    }

    #[must_use]
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.req_timeout)
    }

    /// Redacted snapshot for the config endpoints.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "port": self.port,
            "chain_id": self.chain_id,
            "rpc_nodes": self.rpc_nodes,
            "beacon_nodes": self.beacon_nodes,
            "prover_nodes": self.prover_nodes,
            "req_timeout": self.req_timeout,
            "beacon_events": self.beacon_events,
            "period_store": self.period_store,
            "max_sync_states": self.max_sync_states,
            "max_concurrency_default": self.max_concurrency_default,
            "max_concurrency_cap": self.max_concurrency_cap,
            "latency_target_ms": self.latency_target_ms,
            "conc_cooldown_ms": self.conc_cooldown_ms,
            "overflow_slots": self.overflow_slots,
            "saturation_wait_ms": self.saturation_wait_ms,
            "block_availability_ttl_sec": self.block_availability_ttl_sec,
            "rpc_head_poll_enabled": self.rpc_head_poll_enabled,
            "rpc_head_poll_interval_ms": self.rpc_head_poll_interval_ms,
            "cache_max_entries": self.cache_max_entries,
        })
    }

    /// Apply a validated subset of keys from a config POST. Returns the
    /// keys applied.
    ///
    /// # Errors
    /// Unknown keys or mistyped values are rejected whole.
    pub fn apply_overrides(&mut self, body: &serde_json::Value) -> Result<Vec<String>, String> {
        let object = body.as_object().ok_or("config body must be an object")?;
        let mut staged = self.clone();
        let mut applied = Vec::new();
        for (key, value) in object {
            match key.as_str() {
                "latency_target_ms" => staged.latency_target_ms = as_u64(key, value)?,
                "conc_cooldown_ms" => staged.conc_cooldown_ms = as_u64(key, value)?,
                "saturation_wait_ms" => staged.saturation_wait_ms = as_u64(key, value)?,
                "req_timeout" => staged.req_timeout = as_u64(key, value)?,
                "block_availability_ttl_sec" => {
                    staged.block_availability_ttl_sec = as_u64(key, value)?;
                }
                "rpc_head_poll_interval_ms" => {
                    staged.rpc_head_poll_interval_ms = as_u64(key, value)?;
                }
                "rpc_head_poll_enabled" => {
                    staged.rpc_head_poll_enabled =
                        value.as_bool().ok_or(format!("{key} must be a bool"))?;
                }
                "rpc_nodes" => staged.rpc_nodes = as_urls(key, value)?,
                "beacon_nodes" => staged.beacon_nodes = as_urls(key, value)?,
                "prover_nodes" => staged.prover_nodes = as_urls(key, value)?,
                other => return Err(format!("unknown config key {other}")),
            }
            applied.push(key.clone());
        }
        *self = staged;
        Ok(applied)
    }
}

fn as_u64(key: &str, value: &serde_json::Value) -> Result<u64, String> {
    value.as_u64().ok_or(format!("{key} must be a number"))
}

fn as_urls(key: &str, value: &serde_json::Value) -> Result<Vec<String>, String> {
    value
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect::<Vec<_>>()
        })
        .filter(|urls: &Vec<String>| !urls.is_empty())
        .ok_or(format!("{key} must be a non-empty array of urls"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_engine::UpstreamKind;

    fn args() -> Args {
        Args::parse_from([
            "stateless-gateway",
            "--rpc-nodes",
            "http://rpc0,http://rpc1",
            "--beacon-nodes",
            "http://beacon0,http://beacon1",
            "--prover-nodes",
            "http://prover0",
        ])
    }

    #[test]
    fn pools_are_built_with_flags() {
        let registry = args().build_registry();
        assert_eq!(registry.pool(UpstreamKind::EthRpc).len(), 2);
        assert_eq!(registry.pool(UpstreamKind::BeaconApi).len(), 2);
        assert_eq!(registry.pool(UpstreamKind::Rest).len(), 1);
        assert!(
            registry.pool(UpstreamKind::BeaconApi)[0].flags & flags::BEACON_EVENT_PUBLISHER != 0
        );
        assert!(
            registry.pool(UpstreamKind::BeaconApi)[1].flags & flags::BEACON_EVENT_PUBLISHER == 0
        );
        assert!(registry.pool(UpstreamKind::Rest)[0].flags & flags::PROVER != 0);
    }

    #[test]
    fn overrides_apply_atomically() {
        let mut args = args();
        let result = args.apply_overrides(&serde_json::json!({
            "latency_target_ms": 250,
            "rpc_head_poll_enabled": false,
        }));
        assert_eq!(result.unwrap().len(), 2);
        assert_eq!(args.latency_target_ms, 250);
        assert!(!args.rpc_head_poll_enabled);

        // one bad key rejects the whole batch
        let before = args.latency_target_ms;
        assert!(args
            .apply_overrides(&serde_json::json!({
                "latency_target_ms": 100,
                "not_a_key": 1,
            }))
            .is_err());
        assert_eq!(args.latency_target_ms, before);
    }

    #[test]
    fn env_style_defaults() {
        let args = args();
        assert_eq!(args.port, 8545);
        assert_eq!(args.req_timeout, 120);
        assert!(args.beacon_events);
        assert_eq!(args.registry_config().latency_target_ms, 500);
    }
}
