//! Tip status service: owns the transaction, relay and balance watchers
//! behind one lifecycle.
//!
//! Build it once from a `WatcherConfig`, either over the JSON-RPC and
//! bridging-API clients or over caller-supplied sources, and call
//! `shutdown` to cancel everything still running.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tipwatch_balance::{BalanceOptions, BalanceWatcher};
use tipwatch_flight::{Clock, SystemClock};
use tipwatch_relay::{ChainProfile, RelayOptions, RelayTracker};
use tipwatch_sources::{
    BalanceSource, BridgeApiClient, BridgeStatusApi, DestinationResolver, JsonRpcClient,
    NoDestinationResolver, ReceiptSource,
};
use tipwatch_tx::{TransactionWatcher, WatchOptions};
use tipwatch_types::{ChainId, Result, TipwatchError};
use tracing::info;

pub mod telemetry;

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub transactions: WatchOptions,
    pub relays: RelayOptions,
    pub balances: BalanceOptions,
    pub chains: ChainProfile,
    /// JSON-RPC endpoint per chain id.
    pub rpc_endpoints: HashMap<ChainId, String>,
    pub bridge_api_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            transactions: WatchOptions::default(),
            relays: RelayOptions::default(),
            balances: BalanceOptions::default(),
            chains: ChainProfile::default(),
            rpc_endpoints: HashMap::new(),
            bridge_api_url: None,
            request_timeout_ms: 15_000,
        }
    }
}

impl WatcherConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TipwatchError::Config(format!("invalid watcher config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject intervals and budgets that would make a loop spin or never
    /// start.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("transactions.retry_interval_ms", self.transactions.retry_interval_ms),
            ("transactions.timeout_ms", self.transactions.timeout_ms),
            ("relays.poll_interval_ms", self.relays.poll_interval_ms),
            ("relays.max_wait_time_ms", self.relays.max_wait_time_ms),
            ("balances.poll_interval_ms", self.balances.poll_interval_ms),
            ("balances.refresh_interval_ms", self.balances.refresh_interval_ms),
            ("balances.refresh_max_wait_ms", self.balances.refresh_max_wait_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(TipwatchError::Config(format!("{} must be positive", name)));
        }
        if self.transactions.confirmations_required == 0 {
            return Err(TipwatchError::Config(
                "transactions.confirmations_required must be at least 1".into(),
            ));
        }
        for (chain_id, url) in &self.rpc_endpoints {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(TipwatchError::Config(format!(
                    "rpc endpoint for chain {} is not an http url: {}",
                    chain_id, url
                )));
            }
        }
        if let Some(url) = &self.bridge_api_url {
            if url.trim().is_empty() {
                return Err(TipwatchError::Config("bridge_api_url is empty".into()));
            }
        }
        Ok(())
    }
}

/// External collaborators the watchers read from.
#[derive(Clone)]
pub struct WatcherSources {
    pub receipts: Arc<dyn ReceiptSource>,
    pub balances: Arc<dyn BalanceSource>,
    pub bridge_api: Option<Arc<dyn BridgeStatusApi>>,
    pub destinations: Arc<dyn DestinationResolver>,
}

impl WatcherSources {
    /// JSON-RPC reads for every configured chain, plus the bridging API
    /// when a URL is set.
    pub fn from_config(config: &WatcherConfig) -> Result<Self> {
        if config.rpc_endpoints.is_empty() {
            return Err(TipwatchError::Config("no rpc endpoints configured".into()));
        }
        let rpc = Arc::new(JsonRpcClient::new(
            config.rpc_endpoints.clone(),
            Some(config.request_timeout_ms),
        ));
        let bridge_api = config.bridge_api_url.as_deref().map(|url| {
            Arc::new(BridgeApiClient::new(url, Some(config.request_timeout_ms)))
                as Arc<dyn BridgeStatusApi>
        });
        Ok(Self {
            receipts: rpc.clone(),
            balances: rpc,
            bridge_api,
            destinations: Arc::new(NoDestinationResolver),
        })
    }
}

/// Number of live watches per watcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWatches {
    pub transactions: usize,
    pub relays: usize,
    pub balances: usize,
}

impl ActiveWatches {
    pub fn total(&self) -> usize {
        self.transactions + self.relays + self.balances
    }
}

/// The three watchers, sharing one clock.
#[derive(Clone, Debug)]
pub struct WatcherService {
    transactions: TransactionWatcher,
    relays: RelayTracker,
    balances: BalanceWatcher,
}

impl WatcherService {
    /// Service over JSON-RPC and the configured bridging API.
    pub fn from_config(config: WatcherConfig) -> Result<Self> {
        let sources = WatcherSources::from_config(&config)?;
        Self::new(config, sources)
    }

    pub fn new(config: WatcherConfig, sources: WatcherSources) -> Result<Self> {
        Self::with_clock(config, sources, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: WatcherConfig,
        sources: WatcherSources,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let transactions = TransactionWatcher::with_options(
            sources.receipts,
            config.transactions.clone(),
            Arc::clone(&clock),
        );
        let relays = RelayTracker::from_sources(
            transactions.clone(),
            sources.bridge_api,
            sources.destinations,
            config.chains.clone(),
            config.relays.clone(),
            Arc::clone(&clock),
        );
        let balances = BalanceWatcher::with_options(sources.balances, config.balances.clone(), clock);
        info!(
            "watcher service ready ({} rpc endpoints, bridge api {})",
            config.rpc_endpoints.len(),
            if config.bridge_api_url.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            transactions,
            relays,
            balances,
        })
    }

    pub fn transactions(&self) -> &TransactionWatcher {
        &self.transactions
    }

    pub fn relays(&self) -> &RelayTracker {
        &self.relays
    }

    pub fn balances(&self) -> &BalanceWatcher {
        &self.balances
    }

    pub fn active_watches(&self) -> ActiveWatches {
        ActiveWatches {
            transactions: self.transactions.active_count(),
            relays: self.relays.active_count(),
            balances: self.balances.active_count(),
        }
    }

    /// Cancel every running watch. Pending transaction and relay results
    /// fail with a cancellation error.
    pub fn shutdown(&self) -> ActiveWatches {
        let cancelled = ActiveWatches {
            relays: self.relays.cancel_all(),
            transactions: self.transactions.cancel_all(),
            balances: self.balances.cancel_all(),
        };
        info!("watcher service shut down, cancelled {} watches", cancelled.total());
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config = WatcherConfig::from_json("{}").unwrap();
        assert_eq!(config, WatcherConfig::default());
        assert_eq!(config.transactions.max_retries, 100);
        assert_eq!(config.relays.poll_interval_ms, 5_000);
        assert_eq!(config.balances.cache_ttl_ms, 5_000);
    }

    #[test]
    fn test_config_partial_override() {
        let config = WatcherConfig::from_json(
            r#"{
                "transactions": { "confirmations_required": 3 },
                "rpc_endpoints": { "10": "https://optimism.example" },
                "bridge_api_url": "https://bridge.example",
                "chains": { "slow_chains": [1, 137] }
            }"#,
        )
        .unwrap();
        assert_eq!(config.transactions.confirmations_required, 3);
        assert_eq!(config.transactions.retry_interval_ms, 3_000);
        assert_eq!(config.rpc_endpoints.get(&10).unwrap(), "https://optimism.example");
        assert_eq!(config.chains.slow_chains, vec![1, 137]);
        assert_eq!(config.chains.settlement_chain_id, Some(8453));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = WatcherConfig::default();
        config.relays.poll_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TipwatchError::Config(ref m) if m.contains("relays.poll_interval_ms")));

        let err = WatcherConfig::from_json(r#"{ "transactions": { "timeout_ms": 0 } }"#).unwrap_err();
        assert!(matches!(err, TipwatchError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_endpoints() {
        let mut config = WatcherConfig::default();
        config.rpc_endpoints.insert(1, "ws://mainnet".into());
        assert!(config.validate().is_err());

        let config = WatcherConfig {
            bridge_api_url: Some(" ".into()),
            ..WatcherConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_config_requires_endpoints() {
        let err = WatcherService::from_config(WatcherConfig::default()).unwrap_err();
        assert!(matches!(err, TipwatchError::Config(_)));
    }
}
