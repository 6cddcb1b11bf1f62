//! Gateway delivery over HTTP
//!
//! The dispatcher issues a single GET per chunk and only looks at the status
//! code; the response body is discarded.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::DeliveryError;

/// Sends a fully built gateway URL and reports the HTTP status
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn deliver(&self, url: &str) -> Result<u16, DeliveryError>;
}

/// 2xx means the gateway accepted the chunk
pub fn is_accepted(status: u16) -> bool {
    (200..300).contains(&status)
}

#[derive(Debug, Clone)]
pub struct HttpDeliveryConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpDeliveryConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            user_agent: concat!("relay-dispatch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

pub struct HttpDeliveryClient {
    client: Client,
}

impl HttpDeliveryClient {
    pub fn new(config: HttpDeliveryConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn deliver(&self, url: &str) -> Result<u16, DeliveryError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(e.to_string())
            } else if e.is_connect() {
                DeliveryError::Unreachable(e.to_string())
            } else {
                DeliveryError::Http(e)
            }
        })?;

        let status = response.status().as_u16();
        debug!(status, "Gateway responded");
        Ok(status)
    }
}
