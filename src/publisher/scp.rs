//! Publishing through the scp binary.

use crate::publisher::{join_url, Publisher};
use crate::utils::error::KciError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug)]
pub struct ScpPublisher {
    destination: String,
    baseurl: String,
}

impl ScpPublisher {
    pub fn new(destination: &str, baseurl: &str) -> Self {
        Self {
            destination: destination.to_string(),
            baseurl: baseurl.to_string(),
        }
    }
}

#[async_trait]
impl Publisher for ScpPublisher {
    async fn publish(&self, path: &Path) -> Result<String, KciError> {
        let argv = vec![
            "scp".to_string(),
            path.display().to_string(),
            self.destination.clone(),
        ];
        tracing::info!("publishing: {}", argv.join(" "));

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            tracing::debug!("scp output:\n{}", String::from_utf8_lossy(&output.stderr));
            return Err(KciError::command(&argv, output.status.code()));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| KciError::parse(format!("Bad artifact path: {}", path.display())))?;
        Ok(self.geturl(name))
    }

    fn geturl(&self, name: &str) -> String {
        join_url(&self.baseurl, name)
    }
}
