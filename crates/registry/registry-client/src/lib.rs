use alloy::primitives::B256;
use http::header;
use reqwest::{
    Client,
    Response,
    StatusCode,
};
use serde::de::DeserializeOwned;

use url::Url;

pub use registry_core::{
    EntityDetail,
    ErrorBody,
    EventSummary,
    PushBatchBody,
    PushEntityBody,
    PushResponse,
    TxDetail,
};

/// A client for the provenance registry gateway.
///
/// ``` no_run
/// use registry_client::{PushEntityBody, RegistryClient};
///
/// #[tokio::main]
/// async fn main() {
///     let client = RegistryClient::new("http://localhost:3000").unwrap();
///     let pushed = client
///         .push_entity(&PushEntityBody::new("Widget", r#"{"name":"X"}"#))
///         .await
///         .unwrap();
///     let detail = client.tx_detail(pushed.tx_hash.unwrap()).await.unwrap();
/// }
/// ```
#[derive(Debug)]
pub struct RegistryClient {
    client: Client,
    base_url: Url,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryClientError {
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Registry error {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RegistryClient {
    /// Create a new registry client
    pub fn new(base_url: &str) -> Result<Self, RegistryClientError> {
        let base_url = Url::parse(base_url)?;
        let client = Client::builder().use_rustls_tls().build()?;

        Ok(Self { client, base_url })
    }

    /// Create a new registry client that sends an `Authorization` header
    pub fn new_with_auth(base_url: &str, auth: &str) -> Result<Self, RegistryClientError> {
        let base_url = Url::parse(base_url)?;
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            auth.parse().map_err(|_| {
                RegistryClientError::InvalidResponse("Invalid authorization header".to_string())
            })?,
        );

        let client = Client::builder()
            .use_rustls_tls()
            .default_headers(headers)
            .build()?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RegistryClientError> {
        Ok(self.base_url.join(path)?)
    }

    /// Maps non-2xx responses to [`RegistryClientError::Api`] when the body
    /// has the registry error shape.
    async fn parse_response<R>(response: Response) -> Result<R, RegistryClientError>
    where
        R: DeserializeOwned,
    {
        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            return Ok(serde_json::from_slice(&body)?);
        }

        match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(error) => {
                Err(RegistryClientError::Api {
                    status,
                    message: error.error,
                })
            }
            Err(_) => Err(RegistryClientError::InvalidResponse(format!("HTTP error: {status}"))),
        }
    }

    /// Submit a single entity
    pub async fn push_entity(
        &self,
        entity: &PushEntityBody,
    ) -> Result<PushResponse, RegistryClientError> {
        let response = self
            .client
            .post(self.endpoint("/api/push")?)
            .json(entity)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Submit several entities in one transaction
    pub async fn push_batch(
        &self,
        items: Vec<PushEntityBody>,
    ) -> Result<PushResponse, RegistryClientError> {
        let response = self
            .client
            .post(self.endpoint("/api/push")?)
            .json(&PushBatchBody::new(items))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Fetch the events and entity recorded by a transaction
    pub async fn tx_detail(&self, tx_hash: B256) -> Result<TxDetail, RegistryClientError> {
        let response = self
            .client
            .get(self.endpoint(&format!("/api/tx/{tx_hash}"))?)
            .send()
            .await?;
        Self::parse_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use registry_server::{
        lookup::LookupTtls,
        test_utils::{
            FakeChain,
            RecordingStore,
            fake_state,
            spawn_api,
        },
    };
    use serde_json::json;
    use wiremock::{
        Mock,
        MockServer,
        ResponseTemplate,
        matchers::{
            body_json,
            header,
            method,
            path,
        },
    };

    use super::*;

    #[tokio::test]
    async fn test_client_push_and_fetch() {
        let store = Arc::new(RecordingStore::new());
        let state = fake_state(
            Arc::new(FakeChain::new()),
            Some(store),
            LookupTtls::default(),
        );
        let (url, cancel_token) = spawn_api(state).await;
        let client = RegistryClient::new(&url).unwrap();

        let pushed = client
            .push_entity(&PushEntityBody::new("Widget", r#"{"name":"X"}"#))
            .await
            .unwrap();
        assert!(pushed.success);

        let detail = client.tx_detail(pushed.tx_hash.unwrap()).await.unwrap();
        let entity = detail.entity.unwrap();
        assert_eq!(entity.entity_type, "Widget");
        let data: serde_json::Value = serde_json::from_str(&entity.data_json).unwrap();
        assert_eq!(data["name"], "X");

        cancel_token.cancel();
    }

    #[tokio::test]
    async fn test_client_batch_and_validation_errors() {
        let state = fake_state(Arc::new(FakeChain::new()), None, LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;
        let client = RegistryClient::new(&url).unwrap();

        let pushed = client
            .push_batch(vec![
                PushEntityBody::new("A", "{}"),
                PushEntityBody::new("B", "{}"),
            ])
            .await
            .unwrap();
        let detail = client.tx_detail(pushed.tx_hash.unwrap()).await.unwrap();
        assert_eq!(detail.events.len(), 2);

        let err = client
            .push_batch(vec![PushEntityBody::new("A", "{}")])
            .await
            .unwrap_err();
        match err {
            RegistryClientError::Api { status, message } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(message, "Batch mode requires at least two items");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        cancel_token.cancel();
    }

    #[tokio::test]
    async fn test_get_nonexistent_transaction() {
        let state = fake_state(Arc::new(FakeChain::new()), None, LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;
        let client = RegistryClient::new(&url).unwrap();

        let result = client.tx_detail(B256::repeat_byte(0x11)).await;

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Transaction not found")
        );

        cancel_token.cancel();
    }

    #[tokio::test]
    async fn test_push_sends_camel_case_body() {
        let mock_server = MockServer::start().await;
        let tx_hash = B256::repeat_byte(0x01);

        Mock::given(method("POST"))
            .and(path("/api/push"))
            .and(body_json(json!({
                "entityType": "Widget",
                "dataJson": "{}",
                "baseKey": "sku-1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "txHash": tx_hash,
                "txUrl": format!("https://scan.example/tx/{tx_hash}"),
                "chainName": "testnet"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = RegistryClient::new(&mock_server.uri()).unwrap();
        let response = client
            .push_entity(&PushEntityBody::new("Widget", "{}").with_base_key("sku-1"))
            .await
            .unwrap();

        assert_eq!(response.tx_hash, Some(tx_hash));
        assert_eq!(response.chain_name.as_deref(), Some("testnet"));
    }

    #[tokio::test]
    async fn test_unexpected_error_body_is_invalid_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&mock_server)
            .await;

        let client = RegistryClient::new(&mock_server.uri()).unwrap();
        let err = client.tx_detail(B256::ZERO).await.unwrap_err();

        assert!(matches!(err, RegistryClientError::InvalidResponse(_)));
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn test_client_with_auth() {
        // Test that the auth header is set correctly
        let auth_token = "Bearer test_token";

        // Use wiremock to verify the header is set correctly
        let mock_server = MockServer::start().await;

        // Create a client with auth token pointing to our mock server
        let client = RegistryClient::new_with_auth(&mock_server.uri(), auth_token).unwrap();

        // Set up a mock to expect the Authorization header
        Mock::given(method("GET"))
            .and(header("Authorization", auth_token))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "success": false,
                "error": "Transaction not found"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        // Make a request that will trigger the header to be sent
        let err = client.tx_detail(B256::ZERO).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryClientError::Api { status, .. } if status == StatusCode::NOT_FOUND
        ));
    }
}
