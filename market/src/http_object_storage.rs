use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use tracing::{debug, warn};

use common::config::StorageConfig;
use fulfillment::{error::MarketError, object_store::ObjectStorage};

/// Object storage REST API (`/storage/v1/object/...`).
#[derive(Clone)]
pub struct HttpObjectStorage {
    client: Client,
    base_url: String,
    service_key: String,
}

impl HttpObjectStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
        }
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path)
    }

    fn request_error(err: reqwest::Error) -> MarketError {
        MarketError::ObjectStore(err.to_string())
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), MarketError> {
        let size = bytes.len();
        let response = self
            .client
            .post(self.object_url(bucket, path))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, "max-age=3600")
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(Self::request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketError::ObjectStore(format!(
                "Upload of {}/{} failed with {}: {}",
                bucket, path, status, body
            )));
        }
        debug!(bucket, path, size, "Stored object");
        Ok(())
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<bool, MarketError> {
        let response = self
            .client
            .delete(self.object_url(bucket, path))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .send()
            .await
            .map_err(Self::request_error)?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                // The storage API reports missing objects as 400 with a not_found body
                if status == StatusCode::BAD_REQUEST && body.contains("not_found") {
                    return Ok(false);
                }
                warn!(bucket, path, %status, "Object delete rejected");
                Err(MarketError::ObjectStore(format!(
                    "Delete of {}/{} failed with {}: {}",
                    bucket, path, status, body
                )))
            }
        }
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, path)
    }
}
