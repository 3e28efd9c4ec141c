// Copyright (c) 2025-2026 the kci contributors
// SPDX-License-Identifier: Apache-2.0

//! Artifact publishers.
//!
//! A publisher uploads a local file to the configured destination and
//! answers the canonical retrieval URL for any artifact name. No retry, no
//! chunking: a failure propagates to the stage.

pub mod http;
pub mod scp;

pub use http::HttpPublisher;
pub use scp::ScpPublisher;

use crate::utils::error::KciError;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait Publisher: Send + Sync + std::fmt::Debug {
    /// Upload a local file; returns its retrieval URL.
    async fn publish(&self, path: &Path) -> Result<String, KciError>;

    /// Construct the retrieval URL for an artifact name without uploading.
    fn geturl(&self, name: &str) -> String;
}

/// Transport selector: `{kind, destination, base_url}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PublisherDescriptor {
    pub kind: String,
    pub destination: String,
    pub baseurl: String,
}

/// Get the publisher for a descriptor.
pub fn get_publisher(descriptor: &PublisherDescriptor) -> Result<Box<dyn Publisher>, KciError> {
    match descriptor.kind.to_lowercase().as_str() {
        "scp" => Ok(Box::new(ScpPublisher::new(
            &descriptor.destination,
            &descriptor.baseurl,
        ))),
        "http" => Ok(Box::new(HttpPublisher::new(
            &descriptor.destination,
            &descriptor.baseurl,
        ))),
        other => Err(KciError::invalid_publisher(other)),
    }
}

pub(crate) fn join_url(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selects_by_kind() {
        let descriptor = PublisherDescriptor {
            kind: "scp".to_string(),
            destination: "user@host:/srv/artifacts".to_string(),
            baseurl: "https://artifacts.example.org".to_string(),
        };
        assert!(get_publisher(&descriptor).is_ok());

        let descriptor = PublisherDescriptor {
            kind: "ftp".to_string(),
            ..descriptor
        };
        let err = get_publisher(&descriptor).expect_err("unknown kind");
        assert!(err.to_string().contains("Unknown publisher type 'ftp'"));
    }

    #[test]
    fn test_geturl_under_base() {
        let publisher = ScpPublisher::new("user@host:/srv", "https://artifacts.example.org/");
        assert_eq!(
            publisher.geturl("abc123_x86_64.tar.gz"),
            "https://artifacts.example.org/abc123_x86_64.tar.gz"
        );
    }
}
