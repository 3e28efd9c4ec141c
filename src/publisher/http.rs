//! Publishing by HTTP upload.

use crate::publisher::{join_url, Publisher};
use crate::utils::error::KciError;
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug)]
pub struct HttpPublisher {
    destination: String,
    baseurl: String,
    http: reqwest::Client,
}

impl HttpPublisher {
    pub fn new(destination: &str, baseurl: &str) -> Self {
        Self {
            destination: destination.to_string(),
            baseurl: baseurl.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, path: &Path) -> Result<String, KciError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| KciError::parse(format!("Bad artifact path: {}", path.display())))?;
        let target = join_url(&self.destination, name);
        tracing::info!("uploading {} to {}", path.display(), target);

        let body = tokio::fs::read(path).await?;
        self.http
            .put(&target)
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        Ok(self.geturl(name))
    }

    fn geturl(&self, name: &str) -> String {
        join_url(&self.baseurl, name)
    }
}
