use crate::api::{
    ApiState,
    push::handle_push,
    tx_detail::handle_tx_detail,
};

use core::convert::Infallible;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use http_body_util::Full;
use hyper::{
    Error,
    Method,
    Request,
    Response,
    StatusCode,
    body::Bytes,
    header::{
        CACHE_CONTROL,
        CONTENT_TYPE,
        HeaderValue,
    },
};
use metrics::{
    counter,
    histogram,
};
use registry_core::ErrorBody;
use serde::Serialize;
use tracing::{
    debug,
    info,
    warn,
};
use uuid::Uuid;

/// Cache policy for successful transaction lookups.
pub const CACHE_SUCCESS: &str = "public, s-maxage=60, stale-while-revalidate=300";
/// Cache policy for every other response.
pub const CACHE_NONE: &str = "no-store";

const READINESS_TIMEOUT: Duration = Duration::from_secs(1);

/// `route` label of failures of the accept loop itself.
pub const SERVER_LOOP_ROUTE: &str = "server";

/// Counts a server error under `route`.
pub fn count_server_error(route: &'static str) {
    counter!("api_server_errors_counts", "route" => route).increment(1);
}

/// Routes served under `/api`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    Push,
    TxDetail(&'a str),
    MethodNotAllowed,
    NotFound,
}

impl<'a> Route<'a> {
    pub fn resolve(method: &Method, path: &'a str) -> Self {
        if path == "/api/push" {
            return if method == Method::POST {
                Self::Push
            } else {
                Self::MethodNotAllowed
            };
        }

        match path.strip_prefix("/api/tx/") {
            Some(hash) if !hash.is_empty() && !hash.contains('/') => {
                if method == Method::GET {
                    Self::TxDetail(hash)
                } else {
                    Self::MethodNotAllowed
                }
            }
            _ => Self::NotFound,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::TxDetail(_) => "tx_detail",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::NotFound => "not_found",
        }
    }
}

/// Builds a JSON response around an already encoded body.
pub fn json_response(
    status: StatusCode,
    body: Bytes,
    cache_control: &'static str,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
    response
}

/// Serializes `value` into an uncacheable JSON response.
pub fn json_value_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(status, Bytes::from(body), CACHE_NONE),
        Err(err) => {
            warn!(target: "api::accept_request", error = %err, "Failed to encode response");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode response")
        }
    }
}

/// `{"success":false,"error":message}` with the given status.
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&ErrorBody::new(message))
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::from_static(br#"{"success":false,"error":"Internal error"}"#));
    json_response(status, body, CACHE_NONE)
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Accepts an incoming HTTP request, which it responds with
/// the appropriate api call.
#[tracing::instrument(
    level = "info",
    skip_all,
    target = "api::accept_request",
    fields(request_id, client_addr = %client_addr)
)]
pub async fn accept_request<B>(
    req: Request<B>,
    state: Arc<ApiState>,
    client_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Error = Error>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if path == "/health" && method == Method::GET {
        return Ok(text_response(StatusCode::OK, "ok"));
    }

    if path == "/ready" && method == Method::GET {
        return Ok(if check_store_readiness(&state).await {
            text_response(StatusCode::OK, "ready")
        } else {
            text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
        });
    }

    // Generate unique request ID for correlation
    let request_id = Uuid::new_v4();
    tracing::Span::current().record("request_id", tracing::field::display(&request_id));

    let route = Route::resolve(&method, &path);
    let labels = [("route", route.label())];
    counter!("api_requests_count", &labels).increment(1);
    debug!(target: "api::accept_request", %method, %path, "Incoming request");

    let started = Instant::now();
    let response = match route {
        Route::Push => handle_push(req, &state).await,
        Route::TxDetail(hash) => handle_tx_detail(hash, &state).await,
        Route::MethodNotAllowed => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
        }
        Route::NotFound => error_response(StatusCode::NOT_FOUND, "Not found"),
    };

    let status = response.status();
    histogram!("api_request_duration_seconds", &labels).record(started.elapsed().as_secs_f64());
    if status.is_server_error() {
        count_server_error(route.label());
    }
    info!(
        target: "api::accept_request",
        %method,
        %path,
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis(),
        "Handled request"
    );

    Ok(response)
}

/// Ready when no store is configured, or when it answers a ping in time.
async fn check_store_readiness(state: &ApiState) -> bool {
    let Some(store) = state.store() else {
        return true;
    };

    match tokio::time::timeout(READINESS_TIMEOUT, store.ping()).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(target: "api::accept_request", error = %err, "Store readiness check failed");
            false
        }
        Err(_) => false,
    }
}


/// Macros for accepting requests
#[macro_export]
macro_rules! accept {
    (
        $io:expr,
        $state:expr,
        $client_addr:expr
    ) => {
        let state = $state.clone();
        let client_addr = $client_addr;
        // Bind the incoming connection to our service
        if let Err(err) = hyper::server::conn::http1::Builder::new()
            // `service_fn` converts our function in a `Service`
            .serve_connection(
                $io,
                hyper::service::service_fn(move |req| {
                    let state = state.clone();
                    async move { $crate::api::accept::accept_request(req, state, client_addr).await }
                }),
            )
            .await
        {
            tracing::error!(?err, "Error serving connection");
        }
    };
}
