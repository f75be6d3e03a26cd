//! # `lookup`
//!
//! Read-through resolution of transaction details.
//!
//! A lookup tries, in order:
//!
//! 1. the in-process [`TxResultCache`], serving any unexpired entry verbatim,
//! 2. the [`EntityStore`](crate::store::EntityStore), if one is configured,
//! 3. the chain: receipt, `EntityPushed` logs of the registry contract, and
//!    the current state of the first pushed entity.
//!
//! Every resolution, including not-found and errors, is cached. Successes live
//! for [`SUCCESS_TTL`], failures for [`FAILURE_TTL`] so that hashes that are
//! not yet confirmed get retried soon.

use alloy::{
    primitives::{
        Address,
        B256,
        Log,
        TxHash,
    },
    sol_types::SolEvent,
};
use hyper::body::Bytes;
use metrics::counter;
use moka::{
    Expiry,
    sync::Cache,
};
use registry_core::{
    EventSummary,
    TxDetailResponse,
};
use std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};
use tracing::{
    debug,
    trace,
    warn,
};

use crate::{
    chain::{
        ChainError,
        ProvenanceRegistry::EntityPushed,
        SharedChainClient,
    },
    explorer::ExplorerLinks,
    store::{
        PersistedEntityRecord,
        SharedEntityStore,
        persist_best_effort,
    },
};

/// Lifetime of a successful resolution.
pub const SUCCESS_TTL: Duration = Duration::from_secs(5 * 60);
/// Lifetime of a not-found or failed resolution.
pub const FAILURE_TTL: Duration = Duration::from_secs(15);

pub const NOT_FOUND_MESSAGE: &str = "Transaction not found";

/// Event name reported in [`EventSummary::name`].
pub const ENTITY_PUSHED: &str = "EntityPushed";

const ENCODE_FAILURE_BODY: &[u8] = br#"{"success":false,"error":"Failed to encode response"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupTtls {
    pub success: Duration,
    pub failure: Duration,
}

impl Default for LookupTtls {
    fn default() -> Self {
        Self {
            success: SUCCESS_TTL,
            failure: FAILURE_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    Found,
    NotFound,
    Failed,
}

/// A cached resolution. `body` is the exact JSON payload served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedTxResult {
    pub status: LookupStatus,
    pub body: Bytes,
    pub expires_at: Instant,
}

impl CachedTxResult {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    fn outcome(&self) -> LookupOutcome {
        LookupOutcome {
            status: self.status,
            body: self.body.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupOutcome {
    pub status: LookupStatus,
    pub body: Bytes,
}

impl LookupOutcome {
    pub fn response(&self) -> serde_json::Result<TxDetailResponse> {
        serde_json::from_slice(&self.body)
    }
}

/// Process-wide map from transaction hash to its latest resolution.
pub trait TxResultCache: Send + Sync {
    /// Returns the entry only while it is fresh.
    fn get(&self, tx_hash: &TxHash) -> Option<CachedTxResult>;
    /// Inserts or replaces the entry for `tx_hash`.
    fn insert(&self, tx_hash: TxHash, entry: CachedTxResult);
}

/// Per-entry expiry taken from [`CachedTxResult::expires_at`].
struct UntilExpiresAt;

impl Expiry<TxHash, CachedTxResult> for UntilExpiresAt {
    fn expire_after_create(
        &self,
        _key: &TxHash,
        value: &CachedTxResult,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &TxHash,
        value: &CachedTxResult,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

/// [`TxResultCache`] on a `moka` cache without a capacity bound.
#[derive(Clone)]
pub struct MokaTxResultCache {
    entries: Cache<TxHash, CachedTxResult>,
}

impl std::fmt::Debug for MokaTxResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaTxResultCache")
            .field("entry_count", &self.entries.entry_count())
            .finish()
    }
}

impl Default for MokaTxResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MokaTxResultCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().expire_after(UntilExpiresAt).build(),
        }
    }
}

impl TxResultCache for MokaTxResultCache {
    fn get(&self, tx_hash: &TxHash) -> Option<CachedTxResult> {
        self.entries
            .get(tx_hash)
            .filter(|entry| entry.is_fresh(Instant::now()))
    }

    fn insert(&self, tx_hash: TxHash, entry: CachedTxResult) {
        self.entries.insert(tx_hash, entry);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("Failed to decode EntityPushed log: {0}")]
    Decode(#[from] alloy::sol_types::Error),
}

/// An `EntityPushed` event emitted by the registry contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntityEvent {
    pub id: B256,
    pub summary: EventSummary,
}

/// Decodes the `EntityPushed` logs emitted by `contract`, in log order.
///
/// Logs from other addresses or with another topic0 are skipped.
pub fn decode_entity_events(
    contract: Address,
    logs: &[Log],
) -> Result<Vec<DecodedEntityEvent>, alloy::sol_types::Error> {
    logs.iter()
        .filter(|log| log.address == contract)
        .filter(|log| log.data.topics().first() == Some(&EntityPushed::SIGNATURE_HASH))
        .map(|log| {
            let event = EntityPushed::decode_log_data(&log.data)?;
            Ok(DecodedEntityEvent {
                id: event.id,
                summary: EventSummary {
                    name: ENTITY_PUSHED.to_string(),
                    id: event.id.to_string(),
                    entity_type: event.entityType,
                    submitter: event.submitter.to_string(),
                    version: event.version.to_string(),
                },
            })
        })
        .collect()
}

enum Resolution {
    Resolved {
        response: TxDetailResponse,
        source: &'static str,
    },
    NotFound,
}

/// Memory, store and chain resolution of transaction details.
pub struct TxLookupCache {
    cache: Arc<dyn TxResultCache>,
    store: Option<SharedEntityStore>,
    chain: SharedChainClient,
    links: ExplorerLinks,
    ttls: LookupTtls,
}

impl TxLookupCache {
    pub fn new(
        cache: Arc<dyn TxResultCache>,
        store: Option<SharedEntityStore>,
        chain: SharedChainClient,
        links: ExplorerLinks,
        ttls: LookupTtls,
    ) -> Self {
        Self {
            cache,
            store,
            chain,
            links,
            ttls,
        }
    }

    /// Resolves `tx_hash`. Never fails: errors become cached failure payloads.
    #[tracing::instrument(level = "debug", skip(self), fields(tx_hash = %tx_hash))]
    pub async fn resolve(&self, tx_hash: TxHash) -> LookupOutcome {
        if let Some(entry) = self.cache.get(&tx_hash) {
            counter!("tx_lookup_resolutions_total", "source" => "memory").increment(1);
            trace!(target: "lookup", status = ?entry.status, "Served from memory cache");
            return entry.outcome();
        }

        let (status, response, ttl, source) = match self.resolve_uncached(tx_hash).await {
            Ok(Resolution::Resolved { response, source }) => {
                (LookupStatus::Found, response, self.ttls.success, source)
            }
            Ok(Resolution::NotFound) => {
                (
                    LookupStatus::NotFound,
                    TxDetailResponse::failed(NOT_FOUND_MESSAGE),
                    self.ttls.failure,
                    "not_found",
                )
            }
            Err(err) => {
                warn!(target: "lookup", error = %err, "Transaction lookup failed");
                (
                    LookupStatus::Failed,
                    TxDetailResponse::failed(err.to_string()),
                    self.ttls.failure,
                    "error",
                )
            }
        };
        counter!("tx_lookup_resolutions_total", "source" => source).increment(1);
        debug!(target: "lookup", ?status, source, "Resolved transaction");

        let entry = CachedTxResult {
            status,
            body: encode_response(&response),
            expires_at: Instant::now() + ttl,
        };
        self.cache.insert(tx_hash, entry.clone());
        entry.outcome()
    }

    async fn resolve_uncached(&self, tx_hash: TxHash) -> Result<Resolution, LookupError> {
        if let Some(record) = self.read_store(&tx_hash).await {
            return Ok(Resolution::Resolved {
                response: TxDetailResponse::found(
                    tx_hash,
                    record.tx_url.clone().unwrap_or_default(),
                    record.chain_name.clone().unwrap_or_default(),
                    Vec::new(),
                    Some(record.to_detail()),
                ),
                source: "store",
            });
        }

        let Some(receipt) = self.chain.get_receipt(tx_hash).await? else {
            return Ok(Resolution::NotFound);
        };
        if !receipt.status {
            debug!(target: "lookup", %tx_hash, "Transaction reverted, no registry events");
        }

        let events = decode_entity_events(self.chain.contract_address(), &receipt.logs)?;
        let entity = match events.first() {
            Some(first) => {
                let entity = self.chain.get_entity(first.id).await?;
                if let Some(store) = &self.store {
                    let record = PersistedEntityRecord::from_entity(
                        tx_hash,
                        &entity,
                        self.links.tx_url(&tx_hash),
                        &self.links.chain_name,
                    );
                    persist_best_effort(store.as_ref(), &record).await;
                }
                Some(entity.to_detail())
            }
            None => None,
        };

        Ok(Resolution::Resolved {
            response: TxDetailResponse::found(
                tx_hash,
                self.links.tx_url(&tx_hash),
                self.links.chain_name.clone(),
                events.into_iter().map(|event| event.summary).collect(),
                entity,
            ),
            source: "chain",
        })
    }

    /// Store read errors fall through to the chain.
    async fn read_store(&self, tx_hash: &TxHash) -> Option<PersistedEntityRecord> {
        let store = self.store.as_ref()?;
        match store.get_by_tx(tx_hash).await {
            Ok(record) => record,
            Err(err) => {
                warn!(target: "lookup", error = %err, "Store read failed, falling back to chain");
                None
            }
        }
    }
}

fn encode_response(response: &TxDetailResponse) -> Bytes {
    match serde_json::to_vec(response) {
        Ok(body) => Bytes::from(body),
        Err(err) => {
            warn!(target: "lookup", error = %err, "Failed to encode lookup response");
            Bytes::from_static(ENCODE_FAILURE_BODY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{
            ChainClient,
            EntityInput,
        },
        store::EntityStore,
        test_utils::{
            FakeChain,
            RecordingStore,
        },
    };
    use alloy::primitives::U256;
    use registry_core::TxDetail;

    const SHORT: Duration = Duration::from_millis(100);

    fn lookup_with(
        chain: Arc<FakeChain>,
        store: Option<Arc<RecordingStore>>,
        ttls: LookupTtls,
    ) -> TxLookupCache {
        TxLookupCache::new(
            Arc::new(MokaTxResultCache::new()),
            store.map(|store| store as SharedEntityStore),
            chain,
            ExplorerLinks::new("https://scan.example/tx/", "testnet"),
            ttls,
        )
    }

    fn found(outcome: &LookupOutcome) -> TxDetail {
        match outcome.response().unwrap() {
            TxDetailResponse::Found(detail) => detail,
            TxDetailResponse::Failed(body) => panic!("expected success, got {body:?}"),
        }
    }

    fn widget(id: u8) -> EntityInput {
        EntityInput {
            id: B256::repeat_byte(id),
            entity_type: "Widget".to_string(),
            data_json: r#"{"name":"X"}"#.to_string(),
            previous_id: B256::ZERO,
        }
    }

    #[tokio::test]
    async fn fresh_entry_is_served_without_backend_calls() {
        let chain = Arc::new(FakeChain::new());
        let store = Arc::new(RecordingStore::new());
        let tx = chain.submit_entity(widget(1)).await.unwrap();
        let lookup = lookup_with(chain.clone(), Some(store.clone()), LookupTtls::default());

        let first = lookup.resolve(tx.tx_hash).await;
        let receipt_calls = chain.receipt_calls();
        let store_reads = store.reads();

        let second = lookup.resolve(tx.tx_hash).await;
        let third = lookup.resolve(tx.tx_hash).await;

        assert_eq!(first.status, LookupStatus::Found);
        assert_eq!(first.body, second.body);
        assert_eq!(second.body, third.body);
        assert_eq!(chain.receipt_calls(), receipt_calls);
        assert_eq!(store.reads(), store_reads);
    }

    #[tokio::test]
    async fn chain_resolution_decodes_entity_and_warms_store() {
        let chain = Arc::new(FakeChain::new());
        let store = Arc::new(RecordingStore::new());
        let tx = chain.submit_entity(widget(2)).await.unwrap();
        let lookup = lookup_with(chain.clone(), Some(store.clone()), LookupTtls::default());

        let outcome = lookup.resolve(tx.tx_hash).await;
        let detail = found(&outcome);

        let entity = detail.entity.unwrap();
        assert_eq!(entity.entity_type, "Widget");
        assert_eq!(entity.version, "1");
        assert_eq!(detail.events.len(), 1);
        assert_eq!(detail.events[0].name, "EntityPushed");
        assert_eq!(detail.chain_name, "testnet");
        assert!(detail.tx_url.ends_with(&tx.tx_hash.to_string()));

        let stored = store.get_by_tx(&tx.tx_hash).await.unwrap().unwrap();
        assert_eq!(stored.entity_type.as_deref(), Some("Widget"));
        assert_eq!(stored.tx_url.as_deref(), Some(detail.tx_url.as_str()));
    }

    #[tokio::test]
    async fn stored_row_short_circuits_chain() {
        let chain = Arc::new(FakeChain::new());
        let store = Arc::new(RecordingStore::new());
        let tx_hash = B256::repeat_byte(0x33);
        store
            .save_by_tx(&PersistedEntityRecord {
                tx_hash: crate::store::tx_key(&tx_hash),
                entity_type: Some("Gadget".to_string()),
                data_json: Some("{}".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let lookup = lookup_with(chain.clone(), Some(store), LookupTtls::default());

        let detail = found(&lookup.resolve(tx_hash).await);

        assert_eq!(chain.receipt_calls(), 0);
        assert_eq!(chain.entity_calls(), 0);
        let entity = detail.entity.unwrap();
        assert_eq!(entity.entity_type, "Gadget");
        assert_eq!(entity.submitter, "");
        assert_eq!(detail.tx_url, "");
        assert!(detail.events.is_empty());
    }

    #[tokio::test]
    async fn not_found_is_retried_after_failure_ttl() {
        let chain = Arc::new(FakeChain::new());
        let ttls = LookupTtls {
            success: Duration::from_secs(60),
            failure: SHORT,
        };
        let lookup = lookup_with(chain.clone(), None, ttls);
        let tx_hash = B256::repeat_byte(0x44);

        let first = lookup.resolve(tx_hash).await;
        assert_eq!(first.status, LookupStatus::NotFound);
        assert_eq!(
            first.response().unwrap(),
            TxDetailResponse::failed(NOT_FOUND_MESSAGE)
        );

        // Still cached.
        lookup.resolve(tx_hash).await;
        assert_eq!(chain.receipt_calls(), 1);

        chain.insert_receipt(
            tx_hash,
            vec![FakeChain::entity_pushed_log(
                chain.contract_address(),
                B256::repeat_byte(0x45),
                "Widget",
                U256::from(1u64),
            )],
        );
        chain.insert_entity(FakeChain::entity(B256::repeat_byte(0x45), "Widget", 1));

        tokio::time::sleep(SHORT * 2).await;
        let retried = lookup.resolve(tx_hash).await;

        assert_eq!(chain.receipt_calls(), 2);
        assert_eq!(retried.status, LookupStatus::Found);
    }

    #[tokio::test]
    async fn chain_errors_are_cached_briefly_with_message() {
        let chain = Arc::new(FakeChain::new());
        chain.fail_receipts(Some("rpc unavailable"));
        let ttls = LookupTtls {
            success: Duration::from_secs(60),
            failure: SHORT,
        };
        let lookup = lookup_with(chain.clone(), None, ttls);
        let tx_hash = B256::repeat_byte(0x55);

        let outcome = lookup.resolve(tx_hash).await;
        assert_eq!(outcome.status, LookupStatus::Failed);
        assert_eq!(
            outcome.response().unwrap(),
            TxDetailResponse::failed("rpc unavailable")
        );

        lookup.resolve(tx_hash).await;
        assert_eq!(chain.receipt_calls(), 1);

        chain.fail_receipts(None);
        tokio::time::sleep(SHORT * 2).await;
        let retried = lookup.resolve(tx_hash).await;
        assert_eq!(retried.status, LookupStatus::NotFound);
        assert_eq!(chain.receipt_calls(), 2);
    }

    #[tokio::test]
    async fn entity_read_failure_is_a_failed_lookup() {
        let chain = Arc::new(FakeChain::new());
        let tx = chain.submit_entity(widget(6)).await.unwrap();
        chain.fail_entities(Some("execution reverted"));
        let lookup = lookup_with(chain, None, LookupTtls::default());

        let outcome = lookup.resolve(tx.tx_hash).await;
        assert_eq!(outcome.status, LookupStatus::Failed);
        assert_eq!(
            outcome.response().unwrap(),
            TxDetailResponse::failed("execution reverted")
        );
    }

    #[tokio::test]
    async fn persistence_failure_does_not_fail_lookup() {
        let chain = Arc::new(FakeChain::new());
        let store = Arc::new(RecordingStore::new());
        store.fail_writes(true);
        let tx = chain.submit_entity(widget(7)).await.unwrap();
        let lookup = lookup_with(chain, Some(store.clone()), LookupTtls::default());

        let outcome = lookup.resolve(tx.tx_hash).await;

        assert_eq!(outcome.status, LookupStatus::Found);
        assert_eq!(store.writes(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn store_read_failure_falls_back_to_chain() {
        let chain = Arc::new(FakeChain::new());
        let store = Arc::new(RecordingStore::new());
        store.fail_reads(true);
        let tx = chain.submit_entity(widget(8)).await.unwrap();
        let lookup = lookup_with(chain.clone(), Some(store), LookupTtls::default());

        let outcome = lookup.resolve(tx.tx_hash).await;

        assert_eq!(outcome.status, LookupStatus::Found);
        assert_eq!(chain.receipt_calls(), 1);
    }

    #[tokio::test]
    async fn only_first_matching_event_is_resolved() {
        let chain = Arc::new(FakeChain::new());
        let tx = chain
            .submit_batch(vec![widget(9), widget(10)])
            .await
            .unwrap();
        let lookup = lookup_with(chain.clone(), None, LookupTtls::default());

        let detail = found(&lookup.resolve(tx.tx_hash).await);

        assert_eq!(detail.events.len(), 2);
        assert_eq!(chain.entity_calls(), 1);
        assert_eq!(
            detail.entity.unwrap().id,
            B256::repeat_byte(9).to_string()
        );
    }

    #[tokio::test]
    async fn receipt_without_registry_events_has_no_entity() {
        let chain = Arc::new(FakeChain::new());
        let tx_hash = B256::repeat_byte(0x66);
        chain.insert_receipt(
            tx_hash,
            vec![FakeChain::entity_pushed_log(
                Address::repeat_byte(0x99),
                B256::repeat_byte(0x67),
                "Foreign",
                U256::from(1u64),
            )],
        );
        let lookup = lookup_with(chain.clone(), None, LookupTtls::default());

        let detail = found(&lookup.resolve(tx_hash).await);

        assert!(detail.events.is_empty());
        assert!(detail.entity.is_none());
        assert_eq!(chain.entity_calls(), 0);
    }

    #[tokio::test]
    async fn reverted_transaction_resolves_without_events() {
        let chain = Arc::new(FakeChain::new());
        let tx_hash = B256::repeat_byte(0x68);
        chain.insert_reverted_receipt(tx_hash);
        let lookup = lookup_with(chain.clone(), None, LookupTtls::default());

        let outcome = lookup.resolve(tx_hash).await;
        let detail = found(&outcome);

        assert_eq!(outcome.status, LookupStatus::Found);
        assert!(detail.events.is_empty());
        assert!(detail.entity.is_none());
        assert_eq!(chain.entity_calls(), 0);
    }

    #[test]
    fn decode_skips_foreign_topics() {
        let contract = Address::repeat_byte(0x01);
        let foreign = Log::new_unchecked(
            contract,
            vec![B256::repeat_byte(0xee)],
            alloy::primitives::Bytes::from(vec![0u8; 32]),
        );
        let ours = FakeChain::entity_pushed_log(
            contract,
            B256::repeat_byte(0x02),
            "Widget",
            U256::from(4u64),
        );

        let events = decode_entity_events(contract, &[foreign, ours]).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, B256::repeat_byte(0x02));
        assert_eq!(events[0].summary.version, "4");
    }

    #[test]
    fn moka_cache_hides_expired_entries() {
        let cache = MokaTxResultCache::new();
        let tx_hash = B256::repeat_byte(0x77);
        cache.insert(
            tx_hash,
            CachedTxResult {
                status: LookupStatus::NotFound,
                body: Bytes::from_static(b"{}"),
                expires_at: Instant::now(),
            },
        );

        assert!(cache.get(&tx_hash).is_none());
    }
}
