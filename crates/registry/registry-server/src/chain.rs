//! # `chain`
//!
//! Access to the deployed `ProvenanceRegistry` contract.
//!
//! [`ChainClient`] is the seam used by the push endpoint and the tx lookup
//! cache. [`AlloyChainClient`] implements it over a JSON-RPC HTTP endpoint.

use alloy::{
    primitives::{
        Address,
        B256,
        Log,
        TxHash,
        U256,
    },
    providers::{
        DynProvider,
        PendingTransactionError,
        Provider,
        ProviderBuilder,
    },
    signers::local::PrivateKeySigner,
    sol,
    transports::TransportError,
};
use async_trait::async_trait;
use registry_core::EntityDetail;
use std::sync::Arc;
use tracing::debug;
use url::Url;

sol! {
    #[sol(rpc)]
    #[derive(Debug)]
    contract ProvenanceRegistry {
        struct Entity {
            bytes32 id;
            string entityType;
            string dataJson;
            uint256 version;
            bytes32 previousId;
            uint256 timestamp;
            address submitter;
        }

        event EntityPushed(bytes32 indexed id, string entityType, address indexed submitter, uint256 version);

        function pushEntity(bytes32 id, string calldata entityType, string calldata dataJson, bytes32 previousId) external;
        function pushBatchEntities(bytes32[] calldata ids, string[] calldata entityTypes, string[] calldata dataJsons, bytes32[] calldata previousIds) external;
        function getEntity(bytes32 id) external view returns (Entity memory);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error(transparent)]
    Contract(#[from] alloy::contract::Error),
    #[error(transparent)]
    PendingTransaction(#[from] PendingTransactionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Transaction {0} reverted")]
    Reverted(TxHash),
    #[error("No signer configured for write operations")]
    MissingSigner,
    #[error("{0}")]
    Rpc(String),
}

/// A validated entity ready to be written to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInput {
    pub id: B256,
    pub entity_type: String,
    pub data_json: String,
    pub previous_id: B256,
}

/// Entity state as stored by the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnchainEntity {
    pub id: B256,
    pub entity_type: String,
    pub data_json: String,
    pub version: U256,
    pub previous_id: B256,
    pub timestamp: U256,
    pub submitter: Address,
}

impl OnchainEntity {
    /// Renders the entity for responses. Numbers become decimal strings.
    pub fn to_detail(&self) -> EntityDetail {
        EntityDetail {
            id: self.id.to_string(),
            entity_type: self.entity_type.clone(),
            data_json: self.data_json.clone(),
            version: self.version.to_string(),
            previous_id: self.previous_id.to_string(),
            timestamp: self.timestamp.to_string(),
            submitter: self.submitter.to_string(),
        }
    }
}

impl From<ProvenanceRegistry::Entity> for OnchainEntity {
    fn from(entity: ProvenanceRegistry::Entity) -> Self {
        Self {
            id: entity.id,
            entity_type: entity.entityType,
            data_json: entity.dataJson,
            version: entity.version,
            previous_id: entity.previousId,
            timestamp: entity.timestamp,
            submitter: entity.submitter,
        }
    }
}

/// A confirmed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedTx {
    pub tx_hash: TxHash,
}

/// The parts of a transaction receipt the gateway reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    /// `false` when the transaction reverted.
    pub status: bool,
    pub logs: Vec<Log>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Address of the registry contract, used to filter receipt logs.
    fn contract_address(&self) -> Address;
    async fn submit_entity(&self, entity: EntityInput) -> Result<SubmittedTx, ChainError>;
    async fn submit_batch(&self, entities: Vec<EntityInput>) -> Result<SubmittedTx, ChainError>;
    async fn get_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError>;
    async fn get_entity(&self, id: B256) -> Result<OnchainEntity, ChainError>;
}

pub type SharedChainClient = Arc<dyn ChainClient>;

/// Number of confirmations waited for after a write.
const REQUIRED_CONFIRMATIONS: u64 = 1;

pub struct AlloyChainClient {
    contract: ProvenanceRegistry::ProvenanceRegistryInstance<DynProvider>,
    has_signer: bool,
}

impl std::fmt::Debug for AlloyChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlloyChainClient")
            .field("contract", self.contract.address())
            .field("has_signer", &self.has_signer)
            .finish()
    }
}

impl AlloyChainClient {
    /// Connects to `rpc_url`. Without a signer the client can only read.
    pub fn new(rpc_url: Url, contract_address: Address, signer: Option<PrivateKeySigner>) -> Self {
        let has_signer = signer.is_some();
        let provider = match signer {
            Some(signer) => ProviderBuilder::new()
                .wallet(signer)
                .connect_http(rpc_url)
                .erased(),
            None => ProviderBuilder::new().connect_http(rpc_url).erased(),
        };

        Self {
            contract: ProvenanceRegistry::new(contract_address, provider),
            has_signer,
        }
    }

    fn ensure_signer(&self) -> Result<(), ChainError> {
        if self.has_signer {
            Ok(())
        } else {
            Err(ChainError::MissingSigner)
        }
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    fn contract_address(&self) -> Address {
        *self.contract.address()
    }

    async fn submit_entity(&self, entity: EntityInput) -> Result<SubmittedTx, ChainError> {
        self.ensure_signer()?;

        let pending = self
            .contract
            .pushEntity(
                entity.id,
                entity.entity_type,
                entity.data_json,
                entity.previous_id,
            )
            .send()
            .await?;
        let tx_hash = *pending.tx_hash();
        debug!(target: "chain", %tx_hash, entity_id = %entity.id, "Sent pushEntity");

        let receipt = pending
            .with_required_confirmations(REQUIRED_CONFIRMATIONS)
            .get_receipt()
            .await?;
        if !receipt.status() {
            return Err(ChainError::Reverted(tx_hash));
        }

        Ok(SubmittedTx { tx_hash })
    }

    async fn submit_batch(&self, entities: Vec<EntityInput>) -> Result<SubmittedTx, ChainError> {
        self.ensure_signer()?;

        let count = entities.len();
        let mut ids = Vec::with_capacity(count);
        let mut entity_types = Vec::with_capacity(count);
        let mut data_jsons = Vec::with_capacity(count);
        let mut previous_ids = Vec::with_capacity(count);
        for entity in entities {
            ids.push(entity.id);
            entity_types.push(entity.entity_type);
            data_jsons.push(entity.data_json);
            previous_ids.push(entity.previous_id);
        }

        let pending = self
            .contract
            .pushBatchEntities(ids, entity_types, data_jsons, previous_ids)
            .send()
            .await?;
        let tx_hash = *pending.tx_hash();
        debug!(target: "chain", %tx_hash, count, "Sent pushBatchEntities");

        let receipt = pending
            .with_required_confirmations(REQUIRED_CONFIRMATIONS)
            .get_receipt()
            .await?;
        if !receipt.status() {
            return Err(ChainError::Reverted(tx_hash));
        }

        Ok(SubmittedTx { tx_hash })
    }

    async fn get_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        let Some(receipt) = self
            .contract
            .provider()
            .get_transaction_receipt(tx_hash)
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(TxReceipt {
            status: receipt.status(),
            logs: receipt
                .inner
                .logs()
                .iter()
                .map(|log| log.inner.clone())
                .collect(),
        }))
    }

    async fn get_entity(&self, id: B256) -> Result<OnchainEntity, ChainError> {
        let entity = self.contract.getEntity(id).call().await?;
        Ok(entity.into())
    }
}
