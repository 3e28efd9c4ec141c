//! Plain-text report on standard output.

use crate::reporter::{classify, Reporter, RunOutcome};
use crate::utils::error::KciError;
use crate::utils::state::RunState;
use async_trait::async_trait;
use configparser::ini::Ini;
use std::fmt::Write as _;
use std::path::Path;

/// How many trailing log lines a report attaches.
const LOG_TAIL_LINES: usize = 50;

#[derive(Debug)]
pub struct StdioReporter {
    /// Additional per-arch state files to aggregate (multi-report mode).
    result_paths: Vec<String>,
}

impl StdioReporter {
    pub fn new() -> Self {
        Self {
            result_paths: Vec::new(),
        }
    }

    /// Options: `result_path`, a JSON array (or whitespace-joined string)
    /// of per-arch state files.
    pub fn from_options(
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, KciError> {
        let mut reporter = Self::new();
        match options.get("result_path") {
            Some(serde_json::Value::Array(paths)) => {
                for path in paths {
                    let path = path.as_str().ok_or_else(|| {
                        KciError::Config(format!("Bad result_path entry: {}", path))
                    })?;
                    reporter.result_paths.push(path.to_string());
                }
            }
            Some(serde_json::Value::String(joined)) => {
                reporter
                    .result_paths
                    .extend(joined.split_whitespace().map(|s| s.to_string()));
            }
            Some(other) => {
                return Err(KciError::Config(format!("Bad result_path option: {}", other)));
            }
            None => {}
        }
        Ok(reporter)
    }
}

impl Default for StdioReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Load a persisted per-arch state file back into a state snapshot.
pub fn load_state_file(path: &Path) -> Result<RunState, KciError> {
    let content = std::fs::read_to_string(path)?;
    let mut ini = Ini::new();
    ini.read(content)
        .map_err(|e| KciError::State(format!("Failed to parse {}: {}", path.display(), e)))?;
    let Some(items) = ini.get_map_ref().get("state") else {
        return Ok(RunState::default());
    };
    Ok(RunState::from_section(items))
}

fn repo_leaf(uri: &str) -> &str {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(uri)
        .trim_end_matches(".git")
}

/// Subject line for one or more aggregated state snapshots.
pub fn subject(states: &[&RunState]) -> String {
    let worst = states
        .iter()
        .map(|s| classify(s))
        .max()
        .unwrap_or(RunOutcome::Passed);

    match worst {
        RunOutcome::MergeFailed => "FAIL: Patch application failed".to_string(),
        RunOutcome::BuildFailed => "FAIL: Build failed".to_string(),
        RunOutcome::TestFailed | RunOutcome::Passed => {
            let verdict = if worst == RunOutcome::Passed { "PASS" } else { "FAIL" };
            let krelease = states.iter().find_map(|s| s.krelease.as_deref());
            match krelease {
                Some(krelease) => {
                    let repo = states
                        .iter()
                        .find_map(|s| s.baserepo.as_deref())
                        .map(repo_leaf)
                        .unwrap_or("unknown");
                    format!("{}: Test report for kernel {} ({})", verdict, krelease, repo)
                }
                None => format!("{}: Test report", verdict),
            }
        }
    }
}

fn attach_log(out: &mut String, label: &str, path: &str) {
    let _ = writeln!(out, "--- {} ---", label);
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let lines: Vec<&str> = content.lines().collect();
            let skip = lines.len().saturating_sub(LOG_TAIL_LINES);
            for line in &lines[skip..] {
                let _ = writeln!(out, "{}", line);
            }
        }
        Err(_) => {
            let _ = writeln!(out, "(log unavailable: {})", path);
        }
    }
}

fn render_one(out: &mut String, state: &RunState) {
    if let Some(baserepo) = &state.baserepo {
        let _ = writeln!(out, "baserepo: {}", baserepo);
    }
    if let Some(basehead) = &state.basehead {
        let _ = writeln!(out, "basehead: {}", basehead);
    }
    if let Some(krelease) = &state.krelease {
        let _ = writeln!(out, "kernel release: {}", krelease);
    }
    if let Some(uid) = &state.uid {
        let _ = writeln!(out, "flavor: {}", uid);
    }

    if !state.mergerepos.is_empty() {
        let _ = writeln!(out, "\nMerged refs:");
        for (idx, repo) in state.mergerepos.iter().enumerate() {
            match state.mergeheads.get(idx) {
                Some(head) => {
                    let _ = writeln!(out, "  {} ({})", repo, head);
                }
                // The target was recorded but the merge never finished.
                None => {
                    let _ = writeln!(out, "  {} (merge did not complete)", repo);
                }
            }
        }
    }
    if !state.localpatches.is_empty() {
        let _ = writeln!(out, "\nLocal patches:");
        for patch in &state.localpatches {
            let _ = writeln!(out, "  {}", patch);
        }
    }
    if !state.patchworks.is_empty() {
        let _ = writeln!(out, "\nPatchwork patches:");
        for url in &state.patchworks {
            let _ = writeln!(out, "  {}", url);
        }
    }

    if !state.jobs.is_empty() {
        let _ = writeln!(out, "\nJobs: {}", state.jobs.join(" "));
    }
    if let Some(baseretcode) = state.baseretcode {
        let outcome = if baseretcode == 0 { "passed" } else { "failed" };
        let _ = writeln!(out, "Baseline retest on {}: {}", state.mfhost.as_deref().unwrap_or("unknown host"), outcome);
    }

    if let Some(mergelog) = &state.mergelog {
        out.push('\n');
        attach_log(out, "merge log", mergelog);
    }
    for (arch, data) in &state.archdata {
        if let Some(buildlog) = &data.buildlog {
            out.push('\n');
            attach_log(out, &format!("build log ({})", arch), buildlog);
        }
    }
}

/// Render the full report for a set of state snapshots.
pub fn render(states: &[&RunState]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Subject: {}", subject(states));
    for state in states {
        out.push('\n');
        render_one(&mut out, state);
    }
    out
}

#[async_trait]
impl Reporter for StdioReporter {
    async fn report(&mut self, state: &RunState) -> Result<(), KciError> {
        let loaded: Vec<RunState> = self
            .result_paths
            .iter()
            .map(|path| load_state_file(Path::new(path)))
            .collect::<Result<_, _>>()?;

        let mut states: Vec<&RunState> = Vec::new();
        if loaded.is_empty() {
            states.push(state);
        } else {
            states.extend(loaded.iter());
        }

        println!("{}", render(&states));
        Ok(())
    }
}
