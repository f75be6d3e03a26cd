use anyhow::Result;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{
    ApiState,
    accept::{
        SERVER_LOOP_ROUTE,
        count_server_error,
    },
};

pub struct RegistryServer {
    pub listener: TcpListener,
    pub state: Arc<ApiState>,
}

// Type alias for boxed future
pub type BoxedFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

impl RegistryServer {
    /// Start the API server.
    pub fn start(self, cancel_token: CancellationToken) -> BoxedFuture {
        let api_handle = crate::api::serve(self.listener, self.state, cancel_token);
        tracing::info!("Started API server");
        Box::pin(api_handle)
    }

    /// Run the server until the cancellation token is cancelled.
    pub async fn run(self, cancel_token: CancellationToken) -> Result<()> {
        match self.start(cancel_token).await {
            Ok(()) => {
                tracing::info!("Api stopped.");
                Ok(())
            }
            Err(e) => {
                count_server_error(SERVER_LOOP_ROUTE);
                tracing::error!("API server encountered an error: {:?}", e);
                Err(e)
            }
        }
    }
}
