//! Relay status resolvers.
//!
//! A resolver turns a relay whose source transaction is confirmed into a
//! `RelayRecord`. `BridgeApiResolver` asks the bridging vendor,
//! `HeuristicResolver` estimates from elapsed time and best-effort
//! destination discovery, and `FallbackResolver` tries one then the other.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tipwatch_flight::Clock;
use tipwatch_sources::{BridgeStatusApi, DestinationResolver};
use tipwatch_tx::TransactionWatcher;
use tipwatch_types::{ChainId, Hex, RelayRecord, RelayStatus, Result, TransactionStatus};
use tracing::{debug, warn};

const BASE_RELAY_SECS: u64 = 120;
const SLOW_SOURCE_PENALTY_SECS: u64 = 60;
const SETTLEMENT_BONUS_SECS: u64 = 30;
const MIN_RELAY_SECS: u64 = 60;

const HEURISTIC_FLOOR: u8 = 50;
const HEURISTIC_CEILING: u8 = 95;

/// Everything a resolver may look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayContext {
    pub relay_id: String,
    pub source_chain_id: ChainId,
    pub destination_chain_id: ChainId,
    pub source_tx_hash: Hex,
    /// Unix ms at which the source transaction was first seen confirmed.
    pub source_confirmed_at: u64,
}

impl RelayContext {
    fn record(&self, status: RelayStatus, progress: u8) -> RelayRecord {
        RelayRecord::new(
            &self.relay_id,
            self.source_chain_id,
            self.destination_chain_id,
            &self.source_tx_hash,
            status,
            progress,
        )
    }
}

/// Chains that shape the heuristic relay-duration estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainProfile {
    /// Source chains whose finality adds to relay time.
    pub slow_chains: Vec<ChainId>,
    /// The platform's settlement chain; relays into it are faster.
    pub settlement_chain_id: Option<ChainId>,
}

impl Default for ChainProfile {
    fn default() -> Self {
        Self {
            slow_chains: vec![1],
            settlement_chain_id: Some(8453),
        }
    }
}

/// Expected relay duration between two chains.
pub fn estimate_relay_duration(
    source_chain_id: ChainId,
    destination_chain_id: ChainId,
    profile: &ChainProfile,
) -> Duration {
    let mut secs = BASE_RELAY_SECS;
    if profile.slow_chains.contains(&source_chain_id) {
        secs += SLOW_SOURCE_PENALTY_SECS;
    }
    if profile.settlement_chain_id == Some(destination_chain_id) {
        secs = secs.saturating_sub(SETTLEMENT_BONUS_SECS);
    }
    Duration::from_secs(secs.max(MIN_RELAY_SECS))
}

/// Linear progress between 50 and 95 over the estimated duration.
pub fn interpolate_progress(elapsed: Duration, estimate: Duration) -> u8 {
    if estimate.is_zero() {
        return HEURISTIC_CEILING;
    }
    let ratio = (elapsed.as_secs_f64() / estimate.as_secs_f64()).clamp(0.0, 1.0);
    let span = (HEURISTIC_CEILING - HEURISTIC_FLOOR) as f64;
    HEURISTIC_FLOOR + (ratio * span).round() as u8
}

/// A strategy for deriving relay status once the source is confirmed.
///
/// `Ok(None)` means "no opinion"; callers fall through to the next strategy.
#[async_trait]
pub trait StatusResolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, ctx: &RelayContext) -> Result<Option<RelayRecord>>;
}

/// Authoritative status from the bridging vendor.
pub struct BridgeApiResolver {
    api: Arc<dyn BridgeStatusApi>,
}

impl BridgeApiResolver {
    pub fn new(api: Arc<dyn BridgeStatusApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl StatusResolver for BridgeApiResolver {
    fn name(&self) -> &'static str {
        "bridge-api"
    }

    async fn resolve(&self, ctx: &RelayContext) -> Result<Option<RelayRecord>> {
        let vendor = match self.api.get_status(&ctx.relay_id).await? {
            Some(vendor) => vendor,
            None => return Ok(None),
        };
        if vendor.status.trim().is_empty()
            || (!vendor.relay_id.is_empty() && vendor.relay_id != ctx.relay_id)
        {
            warn!("ignoring malformed bridge record for relay {}", ctx.relay_id);
            return Ok(None);
        }

        let status = RelayStatus::from_vendor(&vendor.status);
        let mut record = ctx.record(
            status,
            vendor
                .progress
                .unwrap_or_else(|| status.default_progress())
                .min(100),
        );
        record.destination_tx_hash = vendor.destination_tx_hash;
        record.estimated_completion = vendor.estimated_completion;
        record.actual_completion = vendor.completed_at;
        record.source_amount = vendor.source_amount;
        record.destination_amount = vendor.destination_amount;
        record.token_symbol = vendor.token_symbol;
        record.error = vendor.error;
        Ok(Some(record))
    }
}

/// Time-based estimate plus destination-transaction discovery.
pub struct HeuristicResolver {
    transactions: TransactionWatcher,
    destinations: Arc<dyn DestinationResolver>,
    clock: Arc<dyn Clock>,
    profile: ChainProfile,
}

impl HeuristicResolver {
    pub fn new(
        transactions: TransactionWatcher,
        destinations: Arc<dyn DestinationResolver>,
        clock: Arc<dyn Clock>,
        profile: ChainProfile,
    ) -> Self {
        Self {
            transactions,
            destinations,
            clock,
            profile,
        }
    }

    async fn find_destination(&self, ctx: &RelayContext) -> Option<Hex> {
        match self
            .destinations
            .find_destination_transaction(&ctx.source_tx_hash, ctx.destination_chain_id, &ctx.relay_id)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!("destination lookup for relay {} failed: {}", ctx.relay_id, e);
                None
            }
        }
    }
}

#[async_trait]
impl StatusResolver for HeuristicResolver {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn resolve(&self, ctx: &RelayContext) -> Result<Option<RelayRecord>> {
        let now = self.clock.now_millis();
        let elapsed = Duration::from_millis(now.saturating_sub(ctx.source_confirmed_at));
        let estimate =
            estimate_relay_duration(ctx.source_chain_id, ctx.destination_chain_id, &self.profile);
        let estimated_completion = ctx.source_confirmed_at + estimate.as_millis() as u64;

        if elapsed <= estimate {
            let mut record =
                ctx.record(RelayStatus::Relaying, interpolate_progress(elapsed, estimate));
            record.estimated_completion = Some(estimated_completion);
            return Ok(Some(record));
        }

        let destination = match self.find_destination(ctx).await {
            Some(hash) => hash,
            None => {
                debug!(
                    "relay {} past its {}s estimate with no destination tx",
                    ctx.relay_id,
                    estimate.as_secs()
                );
                let mut record = ctx.record(RelayStatus::Relaying, HEURISTIC_CEILING);
                record.estimated_completion = Some(estimated_completion);
                return Ok(Some(record));
            }
        };

        let destination_status = match self
            .transactions
            .get_status(&destination, ctx.destination_chain_id)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!("destination status for relay {} unavailable: {}", ctx.relay_id, e);
                TransactionStatus::Pending
            }
        };

        let mut record = match destination_status {
            TransactionStatus::Confirmed => {
                let mut record = ctx.record(RelayStatus::Completed, 100);
                record.actual_completion = Some(now);
                record
            }
            TransactionStatus::Failed => ctx
                .record(RelayStatus::Failed, 75)
                .with_error("destination transaction failed"),
            _ => ctx.record(RelayStatus::Relaying, 50),
        };
        record.destination_tx_hash = Some(destination);
        record.estimated_completion = Some(estimated_completion);
        Ok(Some(record))
    }
}

/// Try `primary`; on absence or error use `secondary`.
pub struct FallbackResolver {
    primary: Arc<dyn StatusResolver>,
    secondary: Arc<dyn StatusResolver>,
}

impl FallbackResolver {
    pub fn new(primary: Arc<dyn StatusResolver>, secondary: Arc<dyn StatusResolver>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl StatusResolver for FallbackResolver {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn resolve(&self, ctx: &RelayContext) -> Result<Option<RelayRecord>> {
        match self.primary.resolve(ctx).await {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => debug!(
                "{} has no status for relay {}, using {}",
                self.primary.name(),
                ctx.relay_id,
                self.secondary.name()
            ),
            Err(e) => warn!(
                "{} failed for relay {}: {}; using {}",
                self.primary.name(),
                ctx.relay_id,
                e,
                self.secondary.name()
            ),
        }
        self.secondary.resolve(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tipwatch_flight::ManualClock;
    use tipwatch_sources::memory::{
        mock_receipt, MemoryBridgeApi, MemoryDestinationResolver, MemoryReceiptSource,
    };
    use tipwatch_types::BridgeStatusRecord;

    const CONFIRMED_AT: u64 = 1_700_000_000_000;

    fn ctx(source: ChainId, destination: ChainId) -> RelayContext {
        RelayContext {
            relay_id: "relay-1".into(),
            source_chain_id: source,
            destination_chain_id: destination,
            source_tx_hash: "0xaa".into(),
            source_confirmed_at: CONFIRMED_AT,
        }
    }

    fn heuristic(
        receipts: Arc<MemoryReceiptSource>,
        destinations: Arc<MemoryDestinationResolver>,
        clock: Arc<ManualClock>,
    ) -> HeuristicResolver {
        HeuristicResolver::new(
            TransactionWatcher::new(receipts),
            destinations,
            clock,
            ChainProfile::default(),
        )
    }

    fn vendor(status: &str, progress: Option<u8>) -> BridgeStatusRecord {
        BridgeStatusRecord {
            relay_id: "relay-1".into(),
            status: status.into(),
            progress,
            destination_tx_hash: None,
            source_amount: Some("1000".into()),
            destination_amount: Some("990".into()),
            token_symbol: Some("USDC".into()),
            estimated_completion: None,
            completed_at: None,
            error: None,
        }
    }

    #[test]
    fn test_estimate_relay_duration() {
        let profile = ChainProfile::default();
        assert_eq!(estimate_relay_duration(10, 42161, &profile), Duration::from_secs(120));
        assert_eq!(estimate_relay_duration(1, 42161, &profile), Duration::from_secs(180));
        assert_eq!(estimate_relay_duration(1, 8453, &profile), Duration::from_secs(150));
        assert_eq!(estimate_relay_duration(10, 8453, &profile), Duration::from_secs(90));
    }

    #[test]
    fn test_interpolation_bounds() {
        let estimate = Duration::from_secs(120);
        assert_eq!(interpolate_progress(Duration::ZERO, estimate), 50);
        assert_eq!(interpolate_progress(estimate, estimate), 95);
        assert_eq!(interpolate_progress(estimate * 3, estimate), 95);
    }

    #[tokio::test]
    async fn test_heuristic_progress_increases_with_elapsed_time() {
        let clock = Arc::new(ManualClock::new(CONFIRMED_AT));
        let resolver = heuristic(
            Arc::new(MemoryReceiptSource::new()),
            Arc::new(MemoryDestinationResolver::new()),
            clock.clone(),
        );
        let ctx = ctx(10, 42161);

        clock.set(CONFIRMED_AT + 30_000);
        let early = resolver.resolve(&ctx).await.unwrap().unwrap();
        clock.set(CONFIRMED_AT + 90_000);
        let late = resolver.resolve(&ctx).await.unwrap().unwrap();

        assert_eq!(early.status, RelayStatus::Relaying);
        assert_eq!(late.status, RelayStatus::Relaying);
        assert!((50..=95).contains(&early.progress));
        assert!((50..=95).contains(&late.progress));
        assert!(late.progress > early.progress);
        assert_eq!(early.estimated_completion, Some(CONFIRMED_AT + 120_000));
    }

    #[tokio::test]
    async fn test_heuristic_completes_when_destination_confirmed() {
        let receipts = Arc::new(MemoryReceiptSource::new());
        receipts.set_receipt(42161, "0xdd", mock_receipt("0xdd", true, 2));
        let destinations = Arc::new(MemoryDestinationResolver::new());
        destinations.set_destination("relay-1", "0xdd");
        let clock = Arc::new(ManualClock::new(CONFIRMED_AT + 200_000));
        let resolver = heuristic(receipts, destinations.clone(), clock);

        let record = resolver.resolve(&ctx(10, 42161)).await.unwrap().unwrap();
        assert_eq!(record.status, RelayStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.destination_tx_hash.as_deref(), Some("0xdd"));
        assert_eq!(record.actual_completion, Some(CONFIRMED_AT + 200_000));
        assert_eq!(destinations.calls(), 1);
    }

    #[tokio::test]
    async fn test_heuristic_destination_states() {
        let receipts = Arc::new(MemoryReceiptSource::new());
        receipts.set_receipt(42161, "0xdd", mock_receipt("0xdd", false, 2));
        receipts.add_pending(42161, "0xee");
        let destinations = Arc::new(MemoryDestinationResolver::new());
        destinations.set_destination("relay-1", "0xdd");
        destinations.set_destination("relay-2", "0xee");
        let clock = Arc::new(ManualClock::new(CONFIRMED_AT + 200_000));
        let resolver = heuristic(receipts, destinations, clock);

        let failed = resolver.resolve(&ctx(10, 42161)).await.unwrap().unwrap();
        assert_eq!(failed.status, RelayStatus::Failed);
        assert_eq!(failed.progress, 75);

        let mut pending_ctx = ctx(10, 42161);
        pending_ctx.relay_id = "relay-2".into();
        let pending = resolver.resolve(&pending_ctx).await.unwrap().unwrap();
        assert_eq!(pending.status, RelayStatus::Relaying);
        assert_eq!(pending.progress, 50);

        let mut unknown_ctx = ctx(10, 42161);
        unknown_ctx.relay_id = "relay-3".into();
        let unknown = resolver.resolve(&unknown_ctx).await.unwrap().unwrap();
        assert_eq!(unknown.status, RelayStatus::Relaying);
        assert_eq!(unknown.progress, 95);
        assert!(unknown.destination_tx_hash.is_none());
    }

    #[tokio::test]
    async fn test_bridge_resolver_maps_vendor_record() {
        let api = Arc::new(MemoryBridgeApi::new());
        api.set_status(vendor("bridging", None));
        let resolver = BridgeApiResolver::new(api);

        let record = resolver.resolve(&ctx(10, 8453)).await.unwrap().unwrap();
        assert_eq!(record.status, RelayStatus::Relaying);
        assert_eq!(record.progress, 50);
        assert_eq!(record.token_symbol.as_deref(), Some("USDC"));
        assert_eq!(record.destination_amount.as_deref(), Some("990"));
    }

    #[tokio::test]
    async fn test_bridge_resolver_rejects_blank_status() {
        let api = Arc::new(MemoryBridgeApi::new());
        let mut record = vendor("completed", Some(100));
        record.status = "  ".into();
        api.set_status(record);
        let resolver = BridgeApiResolver::new(api);
        assert!(resolver.resolve(&ctx(10, 8453)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fallback_uses_heuristic_when_api_errors() {
        let api = Arc::new(MemoryBridgeApi::new());
        api.set_unavailable(true);
        let clock = Arc::new(ManualClock::new(CONFIRMED_AT + 10_000));
        let resolver = FallbackResolver::new(
            Arc::new(BridgeApiResolver::new(api.clone())),
            Arc::new(heuristic(
                Arc::new(MemoryReceiptSource::new()),
                Arc::new(MemoryDestinationResolver::new()),
                clock,
            )),
        );

        let record = resolver.resolve(&ctx(10, 42161)).await.unwrap().unwrap();
        assert_eq!(record.status, RelayStatus::Relaying);
        assert_eq!(api.calls(), 1);

        api.set_unavailable(false);
        api.set_status(vendor("success", None));
        let record = resolver.resolve(&ctx(10, 42161)).await.unwrap().unwrap();
        assert_eq!(record.status, RelayStatus::Completed);
        assert_eq!(record.progress, 100);
    }
}
