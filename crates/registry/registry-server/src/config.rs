use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use alloy::{
    primitives::Address,
    signers::local::PrivateKeySigner,
};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{
    info,
    level_filters::LevelFilter,
    warn,
};
use url::Url;

use crate::{
    api::ApiState,
    chain::{
        AlloyChainClient,
        SharedChainClient,
    },
    explorer::ExplorerLinks,
    lookup::LookupTtls,
    server::RegistryServer,
    store::{
        PgEntityStore,
        SharedEntityStore,
        StoreError,
        StoreSettings,
    },
};

pub const RPC_URL: &str = "RPC_URL";
pub const CONTRACT_ADDRESS: &str = "CONTRACT_ADDRESS";
pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
pub const CHAIN_EXPLORER_TX_URL: &str = "CHAIN_EXPLORER_TX_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid RPC_URL: {0}")]
    RpcUrl(#[from] url::ParseError),
    #[error("Invalid CONTRACT_ADDRESS: {0}")]
    ContractAddress(String),
    #[error("Invalid PRIVATE_KEY: {0}")]
    PrivateKey(String),
    #[error("Invalid DATABASE_URL: {0}")]
    Store(#[from] StoreError),
}

/// Required settings that are absent, per endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingConfig {
    /// Missing for the tx detail endpoint.
    pub read: Vec<&'static str>,
    /// Missing for the push endpoint.
    pub write: Vec<&'static str>,
}

impl MissingConfig {
    pub fn message(vars: &[&str]) -> String {
        format!("Missing required env vars: {}", vars.join(", "))
    }

    pub fn read_error(&self) -> Option<String> {
        (!self.read.is_empty()).then(|| Self::message(&self.read))
    }

    pub fn write_error(&self) -> Option<String> {
        (!self.write.is_empty()).then(|| Self::message(&self.write))
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// JSON-RPC endpoint of the chain hosting the registry contract
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: Option<String>,
    /// Address of the registry contract
    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub contract_address: Option<String>,
    /// Private key used to sign submissions
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,
    /// Explorer transaction url, either a prefix or a template with `{txHash}`
    #[arg(long, env = "CHAIN_EXPLORER_TX_URL")]
    pub explorer_tx_url: Option<String>,
    /// Display name of the chain
    #[arg(long, env = "CHAIN_NAME", default_value = "")]
    pub chain_name: String,
    /// Postgres connection string. The store is disabled when unset
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
    /// Maximum number of pooled Postgres connections
    #[arg(long, env = "PGPOOL_MAX", default_value = "10")]
    pub pg_pool_max: u32,
    /// Idle timeout of pooled connections, in milliseconds
    #[arg(long, env = "PGPOOL_IDLE_TIMEOUT_MS", default_value = "30000")]
    pub pg_idle_timeout_ms: u64,
    /// Timeout for acquiring a pooled connection, in milliseconds
    #[arg(long, env = "PGPOOL_CONN_TIMEOUT_MS", default_value = "5000")]
    pub pg_conn_timeout_ms: u64,
    /// Require TLS for Postgres connections
    #[arg(long, env = "PGSSL")]
    pub pg_ssl: bool,
    /// Api server address
    #[arg(long, env = "REGISTRY_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: SocketAddr,
    /// Lifetime of cached successful lookups, in seconds
    #[arg(long, env = "REGISTRY_CACHE_TTL_SECS", default_value = "300")]
    pub cache_ttl_secs: u64,
    /// Lifetime of cached not-found and failed lookups, in seconds
    #[arg(long, env = "REGISTRY_ERROR_CACHE_TTL_SECS", default_value = "15")]
    pub error_cache_ttl_secs: u64,
    /// Log level
    #[arg(long, env = "REGISTRY_LOG_LEVEL", default_value = "info")]
    pub log_level: LevelFilter,
}

/// Treats empty values like absent ones.
fn present(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|value| !value.trim().is_empty())
}

fn missing_names(vars: &[(&'static str, bool)]) -> Vec<&'static str> {
    vars.iter()
        .filter(|(_, missing)| *missing)
        .map(|(name, _)| *name)
        .collect()
}

impl Config {
    /// Build the registry server
    pub async fn build(self) -> anyhow::Result<RegistryServer> {
        let state = self.api_state()?;

        // Bind to an address
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = ?self.listen_addr, "Listening on address");

        Ok(RegistryServer {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn ttls(&self) -> LookupTtls {
        LookupTtls {
            success: Duration::from_secs(self.cache_ttl_secs),
            failure: Duration::from_secs(self.error_cache_ttl_secs),
        }
    }

    /// Required settings that are absent.
    pub fn missing(&self) -> MissingConfig {
        let rpc_url = present(self.rpc_url.as_ref()).is_none();
        let contract_address = present(self.contract_address.as_ref()).is_none();
        let private_key = present(self.private_key.as_ref()).is_none();
        let explorer = present(self.explorer_tx_url.as_ref()).is_none();

        let read = [
            (RPC_URL, rpc_url),
            (CONTRACT_ADDRESS, contract_address),
            (CHAIN_EXPLORER_TX_URL, explorer),
        ];
        let write = [
            (RPC_URL, rpc_url),
            (CONTRACT_ADDRESS, contract_address),
            (PRIVATE_KEY, private_key),
            (CHAIN_EXPLORER_TX_URL, explorer),
        ];

        MissingConfig {
            read: missing_names(&read),
            write: missing_names(&write),
        }
    }

    pub fn links(&self) -> ExplorerLinks {
        ExplorerLinks::new(
            present(self.explorer_tx_url.as_ref()).unwrap_or_default(),
            self.chain_name.clone(),
        )
    }

    pub fn store_settings(&self) -> Option<StoreSettings> {
        present(self.database_url.as_ref()).map(|database_url| {
            StoreSettings {
                database_url: database_url.to_string(),
                max_connections: self.pg_pool_max,
                idle_timeout: Duration::from_millis(self.pg_idle_timeout_ms),
                acquire_timeout: Duration::from_millis(self.pg_conn_timeout_ms),
                ssl: self.pg_ssl,
            }
        })
    }

    /// The chain client, when both the RPC url and the contract address are set.
    pub fn chain_client(&self) -> Result<Option<SharedChainClient>, ConfigError> {
        let (Some(rpc_url), Some(contract_address)) = (
            present(self.rpc_url.as_ref()),
            present(self.contract_address.as_ref()),
        ) else {
            return Ok(None);
        };

        let rpc_url: Url = rpc_url.parse()?;
        let contract_address = contract_address
            .trim()
            .parse::<Address>()
            .map_err(|err| ConfigError::ContractAddress(err.to_string()))?;
        let signer = present(self.private_key.as_ref())
            .map(|key| {
                key.trim()
                    .parse::<PrivateKeySigner>()
                    .map_err(|err| ConfigError::PrivateKey(err.to_string()))
            })
            .transpose()?;

        if let Some(signer) = &signer {
            info!(submitter = %signer.address(), "Loaded submission signer");
        }

        Ok(Some(Arc::new(AlloyChainClient::new(
            rpc_url,
            contract_address,
            signer,
        ))))
    }

    /// Assembles the request handler state. Absent settings only disable the
    /// endpoints that need them.
    pub fn api_state(&self) -> Result<ApiState, ConfigError> {
        let missing = self.missing();
        if !missing.write.is_empty() {
            warn!(missing = ?missing.write, "Submission endpoint is not fully configured");
        }
        if !missing.read.is_empty() {
            warn!(missing = ?missing.read, "Lookup endpoint is not fully configured");
        }

        let store = match self.store_settings() {
            Some(settings) => {
                Some(Arc::new(PgEntityStore::connect_lazy(&settings)?) as SharedEntityStore)
            }
            None => {
                warn!("DATABASE_URL is not set. Postgres features will be disabled.");
                None
            }
        };

        Ok(ApiState::with_missing(
            self.chain_client()?,
            store,
            self.links(),
            self.ttls(),
            missing,
        ))
    }
}
