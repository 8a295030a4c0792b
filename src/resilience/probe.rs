use crate::client::{endpoint, ApiRequest, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CACHE_CONTROL};
use std::sync::Arc;
use url::Url;

/// Lightweight liveness check, distinct from the data fetches
#[async_trait]
pub trait Probe: Send + Sync {
    /// `Ok` when the cluster currently answering us is alive
    async fn check(&self) -> Result<()>;

    /// Get the name of this probe
    fn name(&self) -> &str;
}

/// `GET /health` against the gateway
pub struct HttpProbe {
    transport: Arc<dyn Transport>,
    url: Url,
}

impl HttpProbe {
    pub fn new(transport: Arc<dyn Transport>, base_url: &Url) -> Result<Self> {
        Ok(Self {
            transport,
            url: endpoint(base_url, "/health")?,
        })
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> Result<()> {
        let request = ApiRequest::get(self.url.clone())
            .with_header(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let response = self.transport.send(&request).await?;

        if response.is_success() {
            Ok(())
        } else {
            Err(Error::UpstreamStatus {
                status: response.status.as_u16(),
                url: self.url.to_string(),
            })
        }
    }

    fn name(&self) -> &str {
        "http-health"
    }
}
