use std::sync::Arc;

use tracing::info;

use crate::api::{HttpTransport, OfflineTransport, Transport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::Store;

/// Shared handles every component is constructed from.
#[derive(Clone)]
pub struct Context {
    pub store: Store,
    pub transport: Arc<dyn Transport>,
    pub config: Arc<Config>,
}

impl Context {
    pub fn new(store: Store, transport: Arc<dyn Transport>, config: Config) -> Self {
        Self {
            store,
            transport,
            config: Arc::new(config),
        }
    }

    /// Open the store under the configured data directory and build the
    /// transport. In offline mode no request ever leaves the process.
    pub fn from_config(config: Config) -> Result<Self> {
        let dir = config.data_dir().map_err(Error::store)?;
        let store = Store::open_dir(dir)?;

        let transport: Arc<dyn Transport> = if config.offline_mode {
            info!("Offline mode, network disabled");
            Arc::new(OfflineTransport)
        } else {
            Arc::new(HttpTransport::new(&config.api_base_url, config.request_timeout())?)
        };

        Ok(Self::new(store, transport, config))
    }

    /// In-memory store with the given transport and default config.
    pub fn in_memory(transport: Arc<dyn Transport>) -> Result<Self> {
        Ok(Self::new(Store::in_memory()?, transport, Config::default()))
    }
}
