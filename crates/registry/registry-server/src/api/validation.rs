use alloy::primitives::{
    B256,
    TxHash,
    keccak256,
};
use registry_core::{
    PushBatchBody,
    PushEntityBody,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;

use crate::chain::EntityInput;

/// Maximum accepted request body (1MB).
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Minimum number of items in a batch submission.
pub const MIN_BATCH_ITEMS: usize = 2;

static BYTES32_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("bytes32 pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid JSON body")]
    InvalidJson,
    #[error("Invalid request body: {0}")]
    InvalidBody(String),
    #[error("Request body too large")]
    BodyTooLarge,
    #[error("Batch mode requires at least two items")]
    BatchTooSmall,
    #[error("Missing entityType in batch item")]
    BatchItemMissingEntityType,
    #[error("Missing dataJson in batch item")]
    BatchItemMissingDataJson,
    #[error("Missing entityType or dataJson")]
    MissingFields,
    #[error("Invalid transaction hash")]
    InvalidTxHash,
}

/// A parsed push body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushRequest {
    Single(PushEntityBody),
    Batch(PushBatchBody),
}

impl PushRequest {
    /// A body with a truthy `batch` is a batch, anything else a single entity.
    ///
    /// Null or absent `items` count as an empty batch.
    pub fn from_slice(body: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(body).map_err(|_| ValidationError::InvalidJson)?;

        let parsed = if value.get("batch").is_some_and(is_truthy) {
            let items = match value.get("items") {
                None | Some(Value::Null) => Ok(Vec::new()),
                Some(items) => Vec::<PushEntityBody>::deserialize(items),
            };
            items.map(|items| Self::Batch(PushBatchBody::new(items)))
        } else {
            serde_json::from_value(value).map(Self::Single)
        };
        parsed.map_err(|err| ValidationError::InvalidBody(err.to_string()))
    }

    /// Validates every item and derives its identifiers.
    pub fn into_inputs(self) -> Result<Vec<EntityInput>, ValidationError> {
        match self {
            Self::Single(body) => {
                let (Some(entity_type), Some(data_json)) =
                    (non_empty(&body.entity_type), non_empty(&body.data_json))
                else {
                    return Err(ValidationError::MissingFields);
                };
                Ok(vec![entity_input(&body, entity_type, data_json)])
            }
            Self::Batch(batch) => {
                if batch.items.len() < MIN_BATCH_ITEMS {
                    return Err(ValidationError::BatchTooSmall);
                }
                batch
                    .items
                    .iter()
                    .map(|item| {
                        let entity_type = non_empty(&item.entity_type)
                            .ok_or(ValidationError::BatchItemMissingEntityType)?;
                        let data_json = non_empty(&item.data_json)
                            .ok_or(ValidationError::BatchItemMissingDataJson)?;
                        Ok(entity_input(item, entity_type, data_json))
                    })
                    .collect()
            }
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }
}

/// `false`, `null`, `0` and `""` are falsy; every other value is truthy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|number| number != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|value| !value.is_empty())
}

fn entity_input(body: &PushEntityBody, entity_type: &str, data_json: &str) -> EntityInput {
    EntityInput {
        id: derive_entity_id(body, entity_type),
        entity_type: entity_type.to_string(),
        data_json: data_json.to_string(),
        previous_id: canonical_previous_id(body.previous_id.as_deref()),
    }
}

/// `0x` followed by exactly 64 hex digits.
pub fn is_bytes32(value: &str) -> bool {
    BYTES32_RE.is_match(value)
}

fn parse_bytes32(value: &str) -> Option<B256> {
    if !is_bytes32(value) {
        return None;
    }
    value.parse().ok()
}

/// The identifier an entity is registered under.
///
/// A canonical bytes32 `id` is used as is. Otherwise the first present of
/// `id`, `baseKey` and `entityType` is hashed with keccak256.
pub fn derive_entity_id(body: &PushEntityBody, entity_type: &str) -> B256 {
    if let Some(id) = body.id.as_deref().and_then(parse_bytes32) {
        return id;
    }

    let base = body
        .id
        .as_deref()
        .or(body.base_key.as_deref())
        .unwrap_or(entity_type);
    keccak256(base.as_bytes())
}

/// The given previous id when canonical, the zero hash otherwise.
pub fn canonical_previous_id(previous_id: Option<&str>) -> B256 {
    previous_id.and_then(parse_bytes32).unwrap_or(B256::ZERO)
}

pub fn parse_tx_hash(value: &str) -> Result<TxHash, ValidationError> {
    parse_bytes32(value).ok_or(ValidationError::InvalidTxHash)
}
