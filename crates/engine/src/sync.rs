//! Sync-Committee Transitions
//!
//! When verification needs a committee period the store does not hold, the
//! gateway walks forward one light-client update at a time: fetch the
//! update for the stored period, validate it against the committee it was
//! signed by, persist the next committee, repeat. Cryptographic validation
//! sits behind [`SyncVerifier`]; the built-in implementation performs the
//! structural checks and leaves BLS to the verifier library plugged in at
//! construction.

use crate::core::Engine;
use crate::error::GatewayError;
use crate::period_store::PeriodStore;
use crate::request::{BodyEncoding, DataRequest};
use serde_json::Value;
use std::sync::Arc;

/// Members of one sync committee.
pub const SYNC_COMMITTEE_SIZE: usize = 512;
/// Compressed BLS public key length.
pub const PUBKEY_LEN: usize = 48;
/// Slots per sync-committee period (256 epochs × 32 slots).
pub const SLOTS_PER_PERIOD: u64 = 8192;

/// A validated light-client update, reduced to what the store needs.
#[derive(Debug, Clone)]
pub struct VerifiedUpdate {
    /// Period of the attested header the update was signed over.
    pub attested_period: u64,
    /// Concatenated compressed pubkeys of the next committee.
    pub next_committee: Vec<u8>,
}

/// Validates one light-client update against the committee that signed it.
pub trait SyncVerifier: Send + Sync {
    /// `current_committee` is the stored pubkey blob for `period`; it is
    /// empty when the store holds nothing yet (trusted bootstrap).
    ///
    /// # Errors
    /// Any structural or cryptographic defect in the update.
    fn verify_update(
        &self,
        period: u64,
        update: &[u8],
        current_committee: &[u8],
    ) -> Result<VerifiedUpdate, GatewayError>;
}

/// Structural validation only: shape, participation quorum, committee
/// extraction. Signature checking is the verifier library's concern.
#[derive(Debug, Default)]
pub struct StructuralVerifier;

impl SyncVerifier for StructuralVerifier {
    fn verify_update(
        &self,
        period: u64,
        update: &[u8],
        current_committee: &[u8],
    ) -> Result<VerifiedUpdate, GatewayError> {
        if !current_committee.is_empty()
            && current_committee.len() != SYNC_COMMITTEE_SIZE * PUBKEY_LEN
        {
            return Err(GatewayError::Fatal(format!(
                "stored committee for period {period} has invalid length {}",
                current_committee.len()
            )));
        }

        let value: Value = serde_json::from_slice(update)
            .map_err(|e| update_error(period, format!("malformed JSON: {e}")))?;
        let data = value
            .as_array()
            .and_then(|a| a.first())
            .and_then(|u| u.get("data"))
            .ok_or_else(|| update_error(period, "no update in response".into()))?;

        let attested_slot: u64 = data["attested_header"]["beacon"]["slot"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| update_error(period, "missing attested slot".into()))?;
        let attested_period = attested_slot / SLOTS_PER_PERIOD;
        if attested_period != period {
            return Err(update_error(
                period,
                format!("update attests period {attested_period}"),
            ));
        }

        let bits = data["sync_aggregate"]["sync_committee_bits"]
            .as_str()
            .ok_or_else(|| update_error(period, "missing sync committee bits".into()))?;
        let participation = decode_hex(bits)
            .map_err(|e| update_error(period, e))?
            .iter()
            .map(|b| u32::from(b.count_ones()))
            .sum::<u32>() as usize;
        if participation * 3 < SYNC_COMMITTEE_SIZE * 2 {
            return Err(update_error(
                period,
                format!("participation {participation}/{SYNC_COMMITTEE_SIZE} below quorum"),
            ));
        }

        let branch = data["next_sync_committee_branch"]
            .as_array()
            .ok_or_else(|| update_error(period, "missing committee branch".into()))?;
        if branch.is_empty() {
            return Err(update_error(period, "empty committee branch".into()));
        }

        let pubkeys = data["next_sync_committee"]["pubkeys"]
            .as_array()
            .ok_or_else(|| update_error(period, "missing next committee".into()))?;
        if pubkeys.len() != SYNC_COMMITTEE_SIZE {
            return Err(update_error(
                period,
                format!("next committee has {} members", pubkeys.len()),
            ));
        }
        let mut blob = Vec::with_capacity(SYNC_COMMITTEE_SIZE * PUBKEY_LEN);
        for key in pubkeys {
            let key = key
                .as_str()
                .ok_or_else(|| update_error(period, "non-string pubkey".into()))?;
            let bytes = decode_hex(key).map_err(|e| update_error(period, e))?;
            if bytes.len() != PUBKEY_LEN {
                return Err(update_error(period, "pubkey length mismatch".into()));
            }
            blob.extend_from_slice(&bytes);
        }

        Ok(VerifiedUpdate {
            attested_period,
            next_committee: blob,
        })
    }
}

fn update_error(period: u64, detail: String) -> GatewayError {
    GatewayError::UpstreamServer {
        status: 200,
        message: format!("light client update for period {period} rejected: {detail}"),
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| format!("invalid hex: {e}"))
}

/// Walks the store forward through missing committee periods.
pub struct SyncTransitionRunner {
    engine: Arc<Engine>,
    store: Arc<PeriodStore>,
    verifier: Arc<dyn SyncVerifier>,
}

impl SyncTransitionRunner {
    #[must_use]
    pub fn new(engine: Arc<Engine>, store: Arc<PeriodStore>, verifier: Arc<dyn SyncVerifier>) -> Self {
        Self {
            engine,
            store,
            verifier,
        }
    }

    /// Latest period the store holds.
    pub async fn stored_period(&self) -> Result<Option<u64>, GatewayError> {
        self.store.latest_period().await
    }

    /// Advance from period `from` (stored) up to `to` (needed), persisting
    /// each intermediate committee.
    #[tracing::instrument(skip(self))]
    pub async fn advance(&self, from: u64, to: u64) -> Result<(), GatewayError> {
        for period in from..to {
            let dr = DataRequest::beacon_get(
                &format!("eth/v1/beacon/light_client/updates?start_period={period}&count=1"),
                BodyEncoding::Json,
            );
            let body = self.engine.fetch(&dr).await?;
            let current = match self.store.sync_state(period).await {
                Ok(blob) => blob,
                Err(GatewayError::NotFound(_)) => Vec::new(),
                Err(e) => return Err(e),
            };
            let update = self.verifier.verify_update(period, &body, &current)?;
            self.store
                .store_sync_state(period + 1, &update.next_committee)
                .await?;
            tracing::info!(period = period + 1, "sync committee stored");
            metrics::counter!("gateway_sync_transitions_total").increment(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CoalescingCache};
    use crate::dispatch::{DispatchConfig, Dispatcher};
    use crate::period_store::PeriodStoreConfig;
    use crate::registry::{RegistryConfig, Upstream, UpstreamRegistry};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn update_json(attested_slot: u64) -> String {
        let pubkeys: Vec<String> = (0..SYNC_COMMITTEE_SIZE)
            .map(|i| format!("0x{:096x}", i + 1))
            .collect();
        // all 512 bits set
        let bits = format!("0x{}", "ff".repeat(SYNC_COMMITTEE_SIZE / 8));
        serde_json::json!([{
            "version": "deneb",
            "data": {
                "attested_header": { "beacon": { "slot": attested_slot.to_string() } },
                "next_sync_committee": {
                    "pubkeys": pubkeys,
                    "aggregate_pubkey": "0x00"
                },
                "next_sync_committee_branch": ["0x11", "0x22"],
                "sync_aggregate": {
                    "sync_committee_bits": bits,
                    "sync_committee_signature": "0x00"
                },
                "signature_slot": (attested_slot + 1).to_string()
            }
        }])
        .to_string()
    }

    #[test]
    fn structural_verifier_accepts_well_formed_update() {
        let update = update_json(100 * SLOTS_PER_PERIOD + 5);
        let verified = StructuralVerifier
            .verify_update(100, update.as_bytes(), &[])
            .unwrap();
        assert_eq!(verified.attested_period, 100);
        assert_eq!(verified.next_committee.len(), SYNC_COMMITTEE_SIZE * PUBKEY_LEN);
    }

    #[test]
    fn structural_verifier_rejects_wrong_period() {
        let update = update_json(99 * SLOTS_PER_PERIOD);
        assert!(StructuralVerifier
            .verify_update(100, update.as_bytes(), &[])
            .is_err());
    }

    #[test]
    fn structural_verifier_rejects_low_participation() {
        let mut value: Value =
            serde_json::from_str(&update_json(100 * SLOTS_PER_PERIOD)).unwrap();
        // 256 of 512 bits: below the 2/3 quorum
        value[0]["data"]["sync_aggregate"]["sync_committee_bits"] =
            Value::String(format!("0x{}{}", "ff".repeat(32), "00".repeat(32)));
        let raw = value.to_string();
        let err = StructuralVerifier
            .verify_update(100, raw.as_bytes(), &[])
            .unwrap_err();
        assert!(err.to_string().contains("participation"));
    }

    #[test]
    fn structural_verifier_rejects_short_committee() {
        let mut value: Value =
            serde_json::from_str(&update_json(100 * SLOTS_PER_PERIOD)).unwrap();
        value[0]["data"]["next_sync_committee"]["pubkeys"] =
            serde_json::json!(["0x00"]);
        assert!(StructuralVerifier
            .verify_update(100, value.to_string().as_bytes(), &[])
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn advance_walks_two_periods() {
        let server = MockServer::start().await;
        for period in [100u64, 101] {
            Mock::given(method("GET"))
                .and(path("/eth/v1/beacon/light_client/updates"))
                .and(query_param("start_period", period.to_string()))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(update_json(period * SLOTS_PER_PERIOD + 1)),
                )
                .expect(1)
                .mount(&server)
                .await;
        }

        let registry_config = RegistryConfig::default();
        let beacon = vec![Upstream::new(server.uri(), 0, &registry_config)];
        let registry = Arc::new(UpstreamRegistry::new(
            registry_config,
            Vec::new(),
            beacon,
            Vec::new(),
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), DispatchConfig::default()).unwrap();
        let engine = Engine::new(
            registry,
            CoalescingCache::new(CacheConfig::default()),
            dispatcher,
            None,
        );

        let dir = tempfile::tempdir().unwrap();
        let store = PeriodStore::open(PeriodStoreConfig {
            dir: dir.path().to_path_buf(),
            max_sync_states: 8,
            master_url: None,
        })
        .await
        .unwrap();
        store
            .store_sync_state(100, &vec![0u8; SYNC_COMMITTEE_SIZE * PUBKEY_LEN])
            .await
            .unwrap();

        let runner = SyncTransitionRunner::new(engine, Arc::clone(&store), Arc::new(StructuralVerifier));
        assert_eq!(runner.stored_period().await.unwrap(), Some(100));
        runner.advance(100, 102).await.unwrap();

        assert_eq!(runner.stored_period().await.unwrap(), Some(102));
        assert_eq!(
            store.sync_state(102).await.unwrap().len(),
            SYNC_COMMITTEE_SIZE * PUBKEY_LEN
        );
    }

    #[test]
    fn query_paths_are_cache_distinct() {
        let a = DataRequest::beacon_get(
            "eth/v1/beacon/light_client/updates?start_period=100&count=1",
            BodyEncoding::Json,
        );
        let b = DataRequest::beacon_get(
            "eth/v1/beacon/light_client/updates?start_period=101&count=1",
            BodyEncoding::Json,
        );
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
