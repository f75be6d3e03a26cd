//! In-process fakes for the chain and the store, plus helpers that run the
//! API on a random local port.

use crate::{
    api::{
        ApiState,
        serve,
    },
    chain::{
        ChainClient,
        ChainError,
        EntityInput,
        OnchainEntity,
        ProvenanceRegistry::EntityPushed,
        SubmittedTx,
        TxReceipt,
    },
    explorer::ExplorerLinks,
    lookup::LookupTtls,
    store::{
        EntityStore,
        MemoryEntityStore,
        PersistedEntityRecord,
        SharedEntityStore,
        StoreError,
    },
};
use alloy::{
    primitives::{
        Address,
        B256,
        Log,
        TxHash,
        U256,
        address,
        keccak256,
    },
    sol_types::SolEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
    },
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const FAKE_CONTRACT: Address = address!("0x00000000000000000000000000000000c0ffee00");
pub const FAKE_SUBMITTER: Address = address!("0x00000000000000000000000000000000000000aa");
pub const FAKE_EXPLORER: &str = "https://scan.example/tx/";
pub const FAKE_CHAIN_NAME: &str = "testnet";

/// Timestamp of the first fake block.
const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

#[derive(Debug, Default)]
struct FakeChainState {
    entities: HashMap<B256, OnchainEntity>,
    receipts: HashMap<TxHash, TxReceipt>,
    nonce: u64,
    receipt_error: Option<String>,
    entity_error: Option<String>,
    submit_error: Option<String>,
}

/// A registry contract simulated in memory.
///
/// Submissions are confirmed immediately and produce receipts carrying
/// `EntityPushed` logs, so lookups see the same shape as on a real chain.
#[derive(Debug)]
pub struct FakeChain {
    contract_address: Address,
    state: Mutex<FakeChainState>,
    submit_calls: AtomicUsize,
    receipt_calls: AtomicUsize,
    entity_calls: AtomicUsize,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            contract_address: FAKE_CONTRACT,
            state: Mutex::new(FakeChainState::default()),
            submit_calls: AtomicUsize::new(0),
            receipt_calls: AtomicUsize::new(0),
            entity_calls: AtomicUsize::new(0),
        }
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn receipt_calls(&self) -> usize {
        self.receipt_calls.load(Ordering::SeqCst)
    }

    pub fn entity_calls(&self) -> usize {
        self.entity_calls.load(Ordering::SeqCst)
    }

    pub fn fail_receipts(&self, message: Option<&str>) {
        self.state.lock().receipt_error = message.map(str::to_string);
    }

    pub fn fail_entities(&self, message: Option<&str>) {
        self.state.lock().entity_error = message.map(str::to_string);
    }

    pub fn fail_submissions(&self, message: Option<&str>) {
        self.state.lock().submit_error = message.map(str::to_string);
    }

    pub fn insert_receipt(&self, tx_hash: TxHash, logs: Vec<Log>) {
        self.state
            .lock()
            .receipts
            .insert(tx_hash, TxReceipt { status: true, logs });
    }

    /// Records a reverted transaction, which carries no logs.
    pub fn insert_reverted_receipt(&self, tx_hash: TxHash) {
        self.state.lock().receipts.insert(
            tx_hash,
            TxReceipt {
                status: false,
                logs: Vec::new(),
            },
        );
    }

    pub fn insert_entity(&self, entity: OnchainEntity) {
        self.state.lock().entities.insert(entity.id, entity);
    }

    pub fn entity(id: B256, entity_type: &str, version: u64) -> OnchainEntity {
        OnchainEntity {
            id,
            entity_type: entity_type.to_string(),
            data_json: "{}".to_string(),
            version: U256::from(version),
            previous_id: B256::ZERO,
            timestamp: U256::from(GENESIS_TIMESTAMP),
            submitter: FAKE_SUBMITTER,
        }
    }

    pub fn entity_pushed_log(
        emitter: Address,
        id: B256,
        entity_type: &str,
        version: U256,
    ) -> Log {
        let event = EntityPushed {
            id,
            entityType: entity_type.to_string(),
            submitter: FAKE_SUBMITTER,
            version,
        };
        Log {
            address: emitter,
            data: event.encode_log_data(),
        }
    }

    fn apply(&self, entities: Vec<EntityInput>) -> Result<SubmittedTx, ChainError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if let Some(message) = &state.submit_error {
            return Err(ChainError::Rpc(message.clone()));
        }

        state.nonce += 1;
        let nonce = state.nonce;
        let tx_hash = keccak256(nonce.to_be_bytes());

        let mut logs = Vec::with_capacity(entities.len());
        for input in entities {
            let version = state
                .entities
                .get(&input.id)
                .map_or(U256::from(1u64), |existing| existing.version + U256::from(1u64));
            logs.push(Self::entity_pushed_log(
                self.contract_address,
                input.id,
                &input.entity_type,
                version,
            ));
            state.entities.insert(
                input.id,
                OnchainEntity {
                    id: input.id,
                    entity_type: input.entity_type,
                    data_json: input.data_json,
                    version,
                    previous_id: input.previous_id,
                    timestamp: U256::from(GENESIS_TIMESTAMP + nonce),
                    submitter: FAKE_SUBMITTER,
                },
            );
        }

        state
            .receipts
            .insert(tx_hash, TxReceipt { status: true, logs });

        Ok(SubmittedTx { tx_hash })
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn contract_address(&self) -> Address {
        self.contract_address
    }

    async fn submit_entity(&self, entity: EntityInput) -> Result<SubmittedTx, ChainError> {
        self.apply(vec![entity])
    }

    async fn submit_batch(&self, entities: Vec<EntityInput>) -> Result<SubmittedTx, ChainError> {
        self.apply(entities)
    }

    async fn get_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock();
        if let Some(message) = &state.receipt_error {
            return Err(ChainError::Rpc(message.clone()));
        }
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn get_entity(&self, id: B256) -> Result<OnchainEntity, ChainError> {
        self.entity_calls.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock();
        if let Some(message) = &state.entity_error {
            return Err(ChainError::Rpc(message.clone()));
        }
        state
            .entities
            .get(&id)
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("Entity {id} does not exist")))
    }
}

/// [`MemoryEntityStore`] that counts calls and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryEntityStore,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl EntityStore for RecordingStore {
    async fn get_by_tx(
        &self,
        tx_hash: &B256,
    ) -> Result<Option<PersistedEntityRecord>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        self.inner.get_by_tx(tx_hash).await
    }

    async fn save_by_tx(&self, record: &PersistedEntityRecord) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        self.inner.save_by_tx(record).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }
}

/// Fully configured state over the given fakes.
pub fn fake_state(
    chain: Arc<FakeChain>,
    store: Option<Arc<RecordingStore>>,
    ttls: LookupTtls,
) -> Arc<ApiState> {
    Arc::new(ApiState::new(
        chain,
        store.map(|store| store as SharedEntityStore),
        ExplorerLinks::new(FAKE_EXPLORER, FAKE_CHAIN_NAME),
        ttls,
    ))
}

/// Serves `state` on a random local port. Returns the base url and the
/// token that stops the server.
pub async fn spawn_api(state: Arc<ApiState>) -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel_token = CancellationToken::new();

    let server_token = cancel_token.clone();
    tokio::spawn(async move {
        serve(listener, state, server_token).await.unwrap();
    });

    (format!("http://{addr}"), cancel_token)
}
