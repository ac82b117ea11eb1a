//! HTTP remote store client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use groundsync_common::{Error, Feature, Mutation, Observation, Result};

use crate::remote::{DeliveryOutcome, RemoteItem, RemoteStore};
use crate::schema::{decode_feature, decode_observation, MutationDocument};

/// Request timeout for remote calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote store speaking JSON over HTTP.
///
/// Routes, relative to the base URL:
/// - `GET projects/{project}/features`
/// - `GET projects/{project}/features/{feature}/observations`
/// - `POST projects/{project}/mutations`
pub struct HttpRemoteStore {
    http: Client,
    base_url: Url,
}

impl HttpRemoteStore {
    /// Create a client for the server at `base_url`.
    ///
    /// # Errors
    /// - `Validation` if the URL cannot carry path segments
    /// - `Network` if the HTTP client cannot be built
    pub fn new(base_url: Url) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(Error::Validation(format!("Invalid base URL: {}", base_url)));
        }
        let http = Client::builder()
            .user_agent(concat!("groundsync/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Validation(format!("Invalid base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_documents(&self, url: Url) -> Result<Vec<Value>> {
        debug!("GET {}", url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to load documents: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::NOT_FOUND {
            Ok(Vec::new())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Network(format!("API error: {} - {}", status, body)))
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn load_features(&self, project_id: &str) -> Result<Vec<RemoteItem<Feature>>> {
        let url = self.endpoint(&["projects", project_id, "features"])?;
        let documents = self.get_documents(url).await?;
        Ok(documents
            .into_iter()
            .map(|doc| decode_feature(project_id, doc))
            .collect())
    }

    async fn load_observations(&self, feature: &Feature) -> Result<Vec<RemoteItem<Observation>>> {
        let url = self.endpoint(&[
            "projects",
            feature.project_id(),
            "features",
            feature.id(),
            "observations",
        ])?;
        let documents = self.get_documents(url).await?;
        Ok(documents
            .into_iter()
            .map(|doc| decode_observation(feature, doc))
            .collect())
    }

    async fn apply_mutation(&self, mutation: &Mutation) -> Result<DeliveryOutcome> {
        let url = self.endpoint(&["projects", &mutation.project_id, "mutations"])?;
        let response = self
            .http
            .post(url)
            .json(&MutationDocument::from(mutation))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to push mutation: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(DeliveryOutcome::Accepted)
        } else if status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            warn!("Server rejected mutation {:?}: {} {}", mutation.id, status, body);
            Ok(DeliveryOutcome::Rejected(format!("{} {}", status, body)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Network(format!("API error: {} - {}", status, body)))
        }
    }
}
