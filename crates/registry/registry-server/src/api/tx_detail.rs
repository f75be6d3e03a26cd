use http_body_util::Full;
use hyper::{
    Response,
    StatusCode,
    body::Bytes,
};
use tracing::warn;

use crate::{
    api::{
        ApiState,
        accept::{
            CACHE_NONE,
            CACHE_SUCCESS,
            error_response,
            json_response,
        },
        validation::parse_tx_hash,
    },
    lookup::LookupStatus,
};

/// `GET /api/tx/{hash}`.
///
/// The body comes straight from the lookup cache. Only successful lookups
/// are publicly cacheable.
#[tracing::instrument(level = "debug", skip(state), target = "api::tx_detail")]
pub async fn handle_tx_detail(raw_hash: &str, state: &ApiState) -> Response<Full<Bytes>> {
    let lookup = match state.reader() {
        Ok(lookup) => lookup,
        Err(message) => {
            warn!(target: "api::tx_detail", %message, "Lookup endpoint is not configured");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &message);
        }
    };

    let tx_hash = match parse_tx_hash(raw_hash) {
        Ok(tx_hash) => tx_hash,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let outcome = lookup.resolve(tx_hash).await;
    let (status, cache_control) = match outcome.status {
        LookupStatus::Found => (StatusCode::OK, CACHE_SUCCESS),
        LookupStatus::NotFound => (StatusCode::NOT_FOUND, CACHE_NONE),
        LookupStatus::Failed => (StatusCode::INTERNAL_SERVER_ERROR, CACHE_NONE),
    };

    json_response(status, outcome.body, cache_control)
}
