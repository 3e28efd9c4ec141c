// Copyright (c) 2025-2026 the kci contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware test scheduler clients.
//!
//! A runner submits jobs built from the published kernel package, watches
//! them to a terminal state and aggregates the outcome. Scheduler
//! communication failures propagate; individual test failures only feed
//! the aggregate return code.

pub mod beaker;

pub use beaker::BeakerRunner;

use crate::utils::error::KciError;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait Runner: Send + std::fmt::Debug {
    /// Render the job template for one build and submit it; returns the job
    /// id, which also becomes `lastsubmitted`.
    async fn prepare_and_submit(
        &mut self,
        buildurl: &str,
        krelease: &str,
        uid: &str,
        arch: &str,
    ) -> Result<String, KciError>;

    fn lastsubmitted(&self) -> Option<&str>;

    fn add_to_watchlist(&mut self, jobid: &str);

    /// Poll every watched job until each reaches a terminal state.
    async fn watchloop(&mut self) -> Result<(), KciError>;

    /// Aggregate return code over all watched jobs: 0 iff everything
    /// passed.
    fn getresults(&self) -> i32;

    /// Host owning the recipe set that contributed most to a non-zero
    /// result.
    fn get_mfhost(&self) -> Option<String>;

    fn hostarch(&self, host: &str) -> Option<String>;

    /// One-shot submission bound to a specific host, used for the baseline
    /// retest. Returns the job's own return code (0 when not waiting).
    async fn run(
        &mut self,
        buildurl: &str,
        krelease: &str,
        wait: bool,
        host: &str,
        uid: &str,
        reschedule: bool,
    ) -> Result<i32, KciError>;

    /// Persist a structured result document for a single job.
    async fn dumpjunitresults(&mut self, jobid: &str, outdir: &Path) -> Result<(), KciError>;

    fn jobs(&self) -> &[String];
}

/// Runner selector: a kind plus an options map, arriving either as rc-file
/// section key/values or as a JSON literal on the command line.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RunnerDescriptor {
    pub kind: String,
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Get the runner for a descriptor.
pub fn get_runner(descriptor: &RunnerDescriptor) -> Result<Box<dyn Runner>, KciError> {
    match descriptor.kind.to_lowercase().as_str() {
        "beaker" => Ok(Box::new(BeakerRunner::from_options(&descriptor.options)?)),
        other => Err(KciError::invalid_runner(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_unknown_kind() {
        let descriptor = RunnerDescriptor {
            kind: "jenkins".to_string(),
            options: serde_json::Map::new(),
        };
        let err = get_runner(&descriptor).expect_err("unknown kind");
        assert!(err.to_string().contains("Unknown runner type 'jenkins'"));
    }

    #[test]
    fn test_factory_builds_beaker() {
        let mut options = serde_json::Map::new();
        options.insert(
            "jobtemplate".to_string(),
            serde_json::Value::String("/etc/kci/job.xml".to_string()),
        );
        let descriptor = RunnerDescriptor {
            kind: "beaker".to_string(),
            options,
        };
        assert!(get_runner(&descriptor).is_ok());
    }
}
