//! HTTPS kubelet client authenticated with the service account token.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use tracing::info;

use super::KubeletConnector;
use super::KubeletEndpoint;
use super::KubeletStub;
use crate::error::KubeletError;

/// Body of the kubelet `/pods` response. Only the items are of interest.
#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

pub struct HttpKubeletStub {
    http: Client,
    pods_url: String,
    token: String,
}

impl HttpKubeletStub {
    /// # Errors
    ///
    /// - [`KubeletError::ClientBuild`] if the HTTP client cannot be created
    pub fn new(
        endpoint: &KubeletEndpoint,
        timeout: Duration,
        token: impl Into<String>,
    ) -> Result<Self, Report<KubeletError>> {
        // kubelet serving certificates are self-signed by default
        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .change_context(KubeletError::ClientBuild)?;

        let pods_url = format!("https://{endpoint}/pods/");
        info!(url = %pods_url, "kubelet stub created");

        Ok(Self {
            http,
            pods_url,
            token: token.into(),
        })
    }
}

#[async_trait::async_trait]
impl KubeletStub for HttpKubeletStub {
    async fn get_all_pods(&self) -> Result<Vec<Pod>, Report<KubeletError>> {
        let response = self
            .http
            .get(&self.pods_url)
            .bearer_auth(&self.token)
            .send()
            .await
            .change_context_lazy(|| KubeletError::Request {
                url: self.pods_url.clone(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Report::new(KubeletError::Status {
                url: self.pods_url.clone(),
                status: status.as_u16(),
            }));
        }

        let list: PodList = response
            .json()
            .await
            .change_context(KubeletError::Decode)?;
        debug!(count = list.items.len(), "fetched pods from kubelet");
        Ok(list.items)
    }
}

/// Connects to the kubelet over HTTPS with the token read from `token_path`.
pub struct HttpKubeletConnector {
    token_path: PathBuf,
    timeout: Duration,
}

impl HttpKubeletConnector {
    pub fn new(token_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            token_path: token_path.into(),
            timeout,
        }
    }

    fn read_token(&self) -> Result<String, Report<KubeletError>> {
        let token = std::fs::read_to_string(&self.token_path).change_context_lazy(|| {
            KubeletError::TokenRead {
                path: self.token_path.display().to_string(),
            }
        })?;
        Ok(token.trim().to_string())
    }
}

impl KubeletConnector for HttpKubeletConnector {
    fn connect(
        &self,
        endpoint: &KubeletEndpoint,
    ) -> Result<Arc<dyn KubeletStub>, Report<KubeletError>> {
        let token = self.read_token()?;
        Ok(Arc::new(HttpKubeletStub::new(endpoint, self.timeout, token)?))
    }
}
