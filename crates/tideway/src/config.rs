//! Client configuration

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tideway_common::{Result, TidewayError};
use url::Url;

use crate::driver::{Connector, MemoryServer};
use crate::pool::PoolConfig;

const MEMORY_SCHEME: &str = "memory";

/// Everything a client needs to reach one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Endpoint URI without query options, e.g. `memory://default`
    pub endpoint: String,
    pub pool: PoolConfig,
    /// Blocking calls allowed to run at once (`None` = CPU count)
    pub max_workers: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "memory://default".to_string(),
            pool: PoolConfig::default(),
            max_workers: None,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn max_workers(mut self, workers: Option<usize>) -> Self {
        self.max_workers = workers;
        self
    }

    /// Parse `memory://<name>[?option=value&...]`
    ///
    /// Recognized options: `maxPoolSize`, `waitQueueTimeoutMS` (0 disables
    /// waiting), `maxIdleTimeMS`, `maxWorkers` and `appName`.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)?;
        if url.scheme() != MEMORY_SCHEME {
            return Err(TidewayError::Configuration(format!(
                "unsupported scheme '{}': only {}:// endpoints are built in",
                url.scheme(),
                MEMORY_SCHEME
            )));
        }
        let name = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TidewayError::Configuration(format!("no server name in '{}'", uri)))?;

        let mut config = Self::new(format!("{}://{}", MEMORY_SCHEME, name));
        for (key, value) in url.query_pairs() {
            match &*key {
                "maxPoolSize" => config.pool.max_pool_size = parse_option(&key, &value)?,
                "waitQueueTimeoutMS" => {
                    let ms: u64 = parse_option(&key, &value)?;
                    config.pool.wait_queue_timeout = (ms > 0).then(|| Duration::from_millis(ms));
                }
                "maxIdleTimeMS" => {
                    let ms: u64 = parse_option(&key, &value)?;
                    config.pool.max_idle_time = (ms > 0).then(|| Duration::from_millis(ms));
                }
                "maxWorkers" => config.max_workers = Some(parse_option(&key, &value)?),
                "appName" => config.pool.app_name = Some(value.into_owned()),
                other => tracing::warn!(option = %other, "ignoring unknown connection option"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_pool_size == 0 {
            return Err(TidewayError::Configuration(
                "maxPoolSize must be at least 1".to_string(),
            ));
        }
        if self.max_workers == Some(0) {
            return Err(TidewayError::Configuration(
                "maxWorkers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Connector for the configured endpoint
    pub(crate) fn connector(&self) -> Result<Arc<dyn Connector>> {
        let url = Url::parse(&self.endpoint)?;
        match (url.scheme(), url.host_str()) {
            (MEMORY_SCHEME, Some(name)) if !name.is_empty() => Ok(Arc::new(MemoryServer::named(name))),
            (scheme, _) => Err(TidewayError::Configuration(format!(
                "cannot connect to '{}' ({} endpoints need an external driver)",
                self.endpoint, scheme
            ))),
        }
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        TidewayError::Configuration(format!("invalid value '{}' for {}", value, key))
    })
}
