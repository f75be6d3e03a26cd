use http_body_util::{
    BodyExt,
    Full,
};
use hyper::{
    Error,
    Request,
    Response,
    StatusCode,
    body::Bytes,
};
use metrics::counter;
use registry_core::PushResponse;
use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    api::{
        ApiState,
        accept::{
            error_response,
            json_value_response,
        },
        validation::{
            MAX_BODY_SIZE,
            PushRequest,
            ValidationError,
        },
    },
    chain::{
        ChainClient,
        EntityInput,
    },
    store::{
        PersistedEntityRecord,
        persist_best_effort,
    },
};

/// `POST /api/push`.
///
/// Configuration is checked before the body is read, and the body is fully
/// validated before anything reaches the chain.
#[tracing::instrument(level = "debug", skip_all, target = "api::push")]
pub async fn handle_push<B>(req: Request<B>, state: &ApiState) -> Response<Full<Bytes>>
where
    B: hyper::body::Body<Error = Error>,
{
    let chain = match state.writer() {
        Ok(chain) => chain.clone(),
        Err(message) => {
            warn!(target: "api::push", %message, "Submission endpoint is not configured");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &message);
        }
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(target: "api::push", error = %err, "Failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };
    if body.len() > MAX_BODY_SIZE {
        warn!(target: "api::push", size = body.len(), "Request payload too large");
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            &ValidationError::BodyTooLarge.to_string(),
        );
    }

    let request = match PushRequest::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return rejected(&err),
    };
    let batch = request.is_batch();
    let inputs = match request.into_inputs() {
        Ok(inputs) => inputs,
        Err(err) => return rejected(&err),
    };

    submit(chain.as_ref(), state, inputs, batch).await
}

fn rejected(err: &ValidationError) -> Response<Full<Bytes>> {
    debug!(target: "api::push", error = %err, "Rejected submission");
    counter!("push_rejections_total").increment(1);
    error_response(StatusCode::BAD_REQUEST, &err.to_string())
}

async fn submit(
    chain: &dyn ChainClient,
    state: &ApiState,
    inputs: Vec<EntityInput>,
    batch: bool,
) -> Response<Full<Bytes>> {
    let Some(first_id) = inputs.first().map(|input| input.id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &ValidationError::MissingFields.to_string(),
        );
    };
    let count = inputs.len();

    let submitted = if batch {
        chain.submit_batch(inputs).await
    } else {
        match inputs.into_iter().next() {
            Some(input) => chain.submit_entity(input).await,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &ValidationError::MissingFields.to_string(),
                );
            }
        }
    };

    let tx_hash = match submitted {
        Ok(submitted) => submitted.tx_hash,
        Err(err) => {
            warn!(target: "api::push", error = %err, batch, count, "Submission failed");
            return json_value_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &PushResponse::failed(err.to_string()),
            );
        }
    };

    let links = state.links();
    let tx_url = links.tx_url(&tx_hash);
    info!(target: "api::push", %tx_hash, batch, count, "Submission confirmed");

    if let Some(store) = state.store() {
        match chain.get_entity(first_id).await {
            Ok(entity) => {
                let record =
                    PersistedEntityRecord::from_entity(tx_hash, &entity, &tx_url, &links.chain_name);
                persist_best_effort(store.as_ref(), &record).await;
            }
            Err(err) => {
                counter!("store_persist_failures_total").increment(1);
                warn!(target: "api::push", %tx_hash, error = %err, "Failed to read back entity for persistence");
            }
        }
    }

    json_value_response(
        StatusCode::OK,
        &PushResponse::submitted(tx_hash, tx_url, links.chain_name.clone()),
    )
}

#[cfg(test)]
mod tests {
    use crate::{
        api::validation::MAX_BODY_SIZE,
        lookup::LookupTtls,
        test_utils::{
            FakeChain,
            RecordingStore,
            fake_state,
            spawn_api,
        },
    };
    use alloy::primitives::keccak256;
    use registry_core::PushResponse;
    use serde_json::{
        Value,
        json,
    };
    use std::sync::Arc;

    async fn post(url: &str, body: Value) -> (u16, Value) {
        let response = reqwest::Client::new()
            .post(format!("{url}/api/push"))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn single_push_returns_tx_and_persists() {
        let chain = Arc::new(FakeChain::new());
        let store = Arc::new(RecordingStore::new());
        let state = fake_state(chain.clone(), Some(store.clone()), LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;

        let (status, body) = post(
            &url,
            json!({"entityType": "Widget", "dataJson": "{\"name\":\"X\"}", "baseKey": "sku-1"}),
        )
        .await;

        assert_eq!(status, 200);
        let response: PushResponse = serde_json::from_value(body).unwrap();
        assert!(response.success);
        let tx_hash = response.tx_hash.unwrap();
        assert_eq!(
            response.tx_url.unwrap(),
            format!("https://scan.example/tx/{tx_hash}")
        );
        assert_eq!(response.chain_name.as_deref(), Some("testnet"));

        assert_eq!(chain.submit_calls(), 1);
        assert_eq!(store.len(), 1);
        let stored = crate::store::EntityStore::get_by_tx(store.as_ref(), &tx_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, Some(keccak256("sku-1").to_string()));

        cancel_token.cancel();
    }

    #[tokio::test]
    async fn batch_of_one_is_rejected_before_chain() {
        let chain = Arc::new(FakeChain::new());
        let state = fake_state(chain.clone(), None, LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;

        let (status, body) = post(
            &url,
            json!({"batch": true, "items": [{"entityType": "A", "dataJson": "{}"}]}),
        )
        .await;

        assert_eq!(status, 400);
        assert_eq!(
            body,
            json!({"success": false, "error": "Batch mode requires at least two items"})
        );
        assert_eq!(chain.submit_calls(), 0);

        cancel_token.cancel();
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_before_chain() {
        let chain = Arc::new(FakeChain::new());
        let state = fake_state(chain.clone(), None, LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;

        let (status, body) = post(&url, json!({"entityType": "Widget"})).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Missing entityType or dataJson");

        let (status, body) = post(
            &url,
            json!({"batch": true, "items": [
                {"entityType": "A", "dataJson": "{}"},
                {"entityType": "B"}
            ]}),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Missing dataJson in batch item");

        assert_eq!(chain.submit_calls(), 0);
        cancel_token.cancel();
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_chain() {
        let chain = Arc::new(FakeChain::new());
        let state = fake_state(chain.clone(), None, LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;

        let data_json = "x".repeat(MAX_BODY_SIZE);
        let (status, body) = post(&url, json!({"entityType": "W", "dataJson": data_json})).await;

        assert_eq!(status, 413);
        assert_eq!(
            body,
            json!({"success": false, "error": "Request body too large"})
        );
        assert_eq!(chain.submit_calls(), 0);

        cancel_token.cancel();
    }

    #[tokio::test]
    async fn truthy_batch_flag_uses_batch_validation() {
        let chain = Arc::new(FakeChain::new());
        let state = fake_state(chain.clone(), None, LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;

        let (status, body) = post(
            &url,
            json!({"batch": 1, "items": [{"entityType": "A", "dataJson": "{}"}]}),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Batch mode requires at least two items");

        let (status, body) = post(&url, json!({"batch": true, "items": null})).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Batch mode requires at least two items");

        assert_eq!(chain.submit_calls(), 0);
        cancel_token.cancel();
    }

    #[tokio::test]
    async fn invalid_json_is_rejected() {
        let state = fake_state(Arc::new(FakeChain::new()), None, LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;

        let response = reqwest::Client::new()
            .post(format!("{url}/api/push"))
            .body("{oops")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Invalid JSON body");

        cancel_token.cancel();
    }

    #[tokio::test]
    async fn chain_failure_is_a_server_error() {
        let chain = Arc::new(FakeChain::new());
        chain.fail_submissions(Some("insufficient funds"));
        let state = fake_state(chain, None, LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;

        let (status, body) = post(&url, json!({"entityType": "Widget", "dataJson": "{}"})).await;

        assert_eq!(status, 500);
        assert_eq!(body, json!({"success": false, "error": "insufficient funds"}));

        cancel_token.cancel();
    }

    #[tokio::test]
    async fn persistence_failure_keeps_push_successful() {
        let chain = Arc::new(FakeChain::new());
        let store = Arc::new(RecordingStore::new());
        store.fail_writes(true);
        let state = fake_state(chain, Some(store.clone()), LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;

        let (status, body) = post(&url, json!({"entityType": "Widget", "dataJson": "{}"})).await;

        assert_eq!(status, 200);
        assert_eq!(body["success"], true);
        assert_eq!(store.writes(), 1);
        assert!(store.is_empty());

        cancel_token.cancel();
    }

    #[tokio::test]
    async fn batch_push_persists_first_entity() {
        let chain = Arc::new(FakeChain::new());
        let store = Arc::new(RecordingStore::new());
        let state = fake_state(chain.clone(), Some(store.clone()), LookupTtls::default());
        let (url, cancel_token) = spawn_api(state).await;

        let (status, body) = post(
            &url,
            json!({"batch": true, "items": [
                {"entityType": "A", "dataJson": "{}", "baseKey": "first"},
                {"entityType": "B", "dataJson": "{}", "baseKey": "second"}
            ]}),
        )
        .await;

        assert_eq!(status, 200);
        let response: PushResponse = serde_json::from_value(body).unwrap();
        let stored = crate::store::EntityStore::get_by_tx(
            store.as_ref(),
            &response.tx_hash.unwrap(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(stored.entity_type.as_deref(), Some("A"));
        assert_eq!(chain.submit_calls(), 1);

        cancel_token.cancel();
    }
}
