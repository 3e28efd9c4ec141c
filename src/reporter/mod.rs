// Copyright (c) 2025-2026 the kci contributors
// SPDX-License-Identifier: Apache-2.0

//! Run reporters.
//!
//! A reporter consumes the final state snapshot (live, or reloaded from
//! persisted state files) and emits a human-readable summary. It never
//! aborts the pipeline.

pub mod stdio;

pub use stdio::StdioReporter;

use crate::utils::error::KciError;
use crate::utils::state::RunState;
use async_trait::async_trait;

/// Run classification, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunOutcome {
    Passed,
    TestFailed,
    BuildFailed,
    MergeFailed,
}

/// Classify a run by the presence of specific state keys.
pub fn classify(state: &RunState) -> RunOutcome {
    if state.mergelog.is_some() {
        RunOutcome::MergeFailed
    } else if state.has_buildlog() {
        RunOutcome::BuildFailed
    } else if state.retcode.unwrap_or(0) != 0 {
        RunOutcome::TestFailed
    } else {
        RunOutcome::Passed
    }
}

#[async_trait]
pub trait Reporter: Send + std::fmt::Debug {
    async fn report(&mut self, state: &RunState) -> Result<(), KciError>;
}

/// Reporter selector: a kind plus an options map.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReporterDescriptor {
    pub kind: String,
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Get the reporter for a descriptor.
pub fn get_reporter(descriptor: &ReporterDescriptor) -> Result<Box<dyn Reporter>, KciError> {
    match descriptor.kind.to_lowercase().as_str() {
        "stdio" => Ok(Box::new(StdioReporter::from_options(&descriptor.options)?)),
        other => Err(KciError::invalid_reporter(other)),
    }
}
