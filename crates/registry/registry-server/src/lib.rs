#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::similar_names)]
#![allow(clippy::unreadable_literal)]

pub mod api;
pub mod chain;
mod config;
pub mod explorer;
pub mod lookup;
mod server;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{
    Config,
    ConfigError,
    MissingConfig,
};
pub use server::RegistryServer;
