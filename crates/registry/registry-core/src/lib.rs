use alloy::primitives::B256;
use serde::{
    Deserialize,
    Serialize,
};

/// A single entity submission.
///
/// Every field is optional on the wire so the server can report which
/// required field is missing instead of failing deserialization.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PushEntityBody {
    /// Explicit bytes32 identifier, or a string hashed into one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Hashed into the identifier when `id` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_json: Option<String>,
    /// Identifier of the version this entity supersedes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
}

impl PushEntityBody {
    pub fn new(entity_type: impl Into<String>, data_json: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            data_json: Some(data_json.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_base_key(mut self, base_key: impl Into<String>) -> Self {
        self.base_key = Some(base_key.into());
        self
    }

    pub fn with_previous_id(mut self, previous_id: impl Into<String>) -> Self {
        self.previous_id = Some(previous_id.into());
        self
    }
}

/// Several entities pushed in one transaction.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PushBatchBody {
    pub batch: bool,
    #[serde(default)]
    pub items: Vec<PushEntityBody>,
}

impl PushBatchBody {
    pub fn new(items: Vec<PushEntityBody>) -> Self {
        Self { batch: true, items }
    }
}

/// The response of the push endpoint.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushResponse {
    pub fn submitted(tx_hash: B256, tx_url: String, chain_name: String) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash),
            tx_url: Some(tx_url),
            chain_name: Some(chain_name),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A decoded `EntityPushed` event.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub name: String,
    pub id: String,
    pub entity_type: String,
    pub submitter: String,
    pub version: String,
}

/// Entity state with every field rendered as a string.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntityDetail {
    pub id: String,
    pub entity_type: String,
    pub data_json: String,
    pub version: String,
    pub previous_id: String,
    pub timestamp: String,
    pub submitter: String,
}

/// Successful transaction detail.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxDetail {
    pub success: bool,
    pub tx_hash: B256,
    pub tx_url: String,
    pub chain_name: String,
    pub events: Vec<EventSummary>,
    pub entity: Option<EntityDetail>,
}

/// `{success: false, error}` body shared by every failing endpoint.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// The response of the tx detail endpoint.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum TxDetailResponse {
    Found(TxDetail),
    Failed(ErrorBody),
}

impl TxDetailResponse {
    pub fn found(
        tx_hash: B256,
        tx_url: String,
        chain_name: String,
        events: Vec<EventSummary>,
        entity: Option<EntityDetail>,
    ) -> Self {
        Self::Found(TxDetail {
            success: true,
            tx_hash,
            tx_url,
            chain_name,
            events,
            entity,
        })
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed(ErrorBody::new(error))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}
