//! # `api`
//!
//! HTTP surface of the provenance registry.
//!
//! ## `POST /api/push`
//!
//! Registers one entity, or several in one transaction when the body carries
//! `"batch": true`.
//!
//! ```json
//! { "entityType": "Widget", "dataJson": "{\"name\":\"X\"}", "baseKey": "sku-42" }
//! ```
//!
//! ```json
//! { "batch": true, "items": [ { "entityType": "A", "dataJson": "{}" }, { "entityType": "B", "dataJson": "{}" } ] }
//! ```
//!
//! Success response:
//!
//! ```json
//! { "success": true, "txHash": "0x…", "txUrl": "https://scan/tx/0x…", "chainName": "testnet" }
//! ```
//!
//! ## `GET /api/tx/{hash}`
//!
//! Returns the registry events and entity recorded by a transaction. Served
//! through the [`TxLookupCache`], so repeated requests return identical bodies.
//!
//! ## Status codes
//!
//! - 400: Invalid body, failed validation or malformed hash
//! - 404: Unknown route or transaction not found
//! - 500: Missing configuration, chain failure
//!
//! Every error body has the shape `{ "success": false, "error": "…" }`.

pub mod accept;
pub mod push;
pub mod tx_detail;
pub mod validation;

use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Result;
use hyper_util::rt::TokioIo;
use tokio::net::{
    TcpListener,
    TcpStream,
};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::SharedChainClient,
    config::MissingConfig,
    explorer::ExplorerLinks,
    lookup::{
        LookupTtls,
        MokaTxResultCache,
        TxLookupCache,
    },
    store::SharedEntityStore,
};

/// Everything a request handler needs, shared by all connections.
pub struct ApiState {
    chain: Option<SharedChainClient>,
    store: Option<SharedEntityStore>,
    lookup: Option<TxLookupCache>,
    links: ExplorerLinks,
    missing: MissingConfig,
}

impl ApiState {
    /// State with every required setting present.
    pub fn new(
        chain: SharedChainClient,
        store: Option<SharedEntityStore>,
        links: ExplorerLinks,
        ttls: LookupTtls,
    ) -> Self {
        Self::with_missing(Some(chain), store, links, ttls, MissingConfig::default())
    }

    /// State for a partially configured process. Endpoints whose settings are
    /// listed in `missing` answer with a configuration error.
    pub fn with_missing(
        chain: Option<SharedChainClient>,
        store: Option<SharedEntityStore>,
        links: ExplorerLinks,
        ttls: LookupTtls,
        missing: MissingConfig,
    ) -> Self {
        let lookup = chain.clone().map(|chain| {
            TxLookupCache::new(
                Arc::new(MokaTxResultCache::new()),
                store.clone(),
                chain,
                links.clone(),
                ttls,
            )
        });

        Self {
            chain,
            store,
            lookup,
            links,
            missing,
        }
    }

    pub fn links(&self) -> &ExplorerLinks {
        &self.links
    }

    pub fn store(&self) -> Option<&SharedEntityStore> {
        self.store.as_ref()
    }

    /// The chain client, if submissions are fully configured.
    pub fn writer(&self) -> Result<&SharedChainClient, String> {
        if let Some(message) = self.missing.write_error() {
            return Err(message);
        }
        self.chain
            .as_ref()
            .ok_or_else(|| MissingConfig::message(&self.missing.write))
    }

    /// The lookup cache, if reads are fully configured.
    pub fn reader(&self) -> Result<&TxLookupCache, String> {
        if let Some(message) = self.missing.read_error() {
            return Err(message);
        }
        self.lookup
            .as_ref()
            .ok_or_else(|| MissingConfig::message(&self.missing.read))
    }
}

/// Start the API server
pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    cancel_token: CancellationToken,
) -> Result<()> {
    // We start a loop to continuously accept incoming connections
    loop {
        tokio::select! {
                () = cancel_token.cancelled() => {
                    tracing::info!("Api received cancellation signal, shutting down...");
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, socketaddr)) => {
                            serve_connection(socketaddr, state.clone(), stream);
                        }
                        Err(err) => {
                            tracing::error!(?err, "Error accepting connection");
                        }
                    }
                }
        }
    }

    Ok(())
}

fn serve_connection(socketaddr: SocketAddr, state: Arc<ApiState>, stream: TcpStream) {
    tracing::debug!("Connection from: {}", socketaddr);

    // Use an adapter to access something implementing `tokio::io` traits as if they implement
    // `hyper::rt` IO traits.
    let io = TokioIo::new(stream);

    // Spawn a tokio task to serve multiple connections concurrently
    tokio::task::spawn(async move {
        crate::accept!(io, state, socketaddr);
    });
}
