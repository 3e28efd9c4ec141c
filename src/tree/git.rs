//! Thin subprocess wrapper around the git binary.
//!
//! Every invocation pins `--work-tree`/`--git-dir` to the managed checkout,
//! so the wrapper never depends on the process working directory.

use crate::utils::error::KciError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub struct Git {
    workdir: PathBuf,
    gitdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        let gitdir = workdir.join(".git");
        Self { workdir, gitdir }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "git".to_string(),
            "--work-tree".to_string(),
            self.workdir.display().to_string(),
            "--git-dir".to_string(),
            self.gitdir.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| (*a).to_string()));
        argv
    }

    /// Run a git command, failing on non-zero exit. Output is captured and
    /// surfaced at debug level only.
    pub async fn run(&self, args: &[&str]) -> Result<(), KciError> {
        let (status, output) = self.status_output(args, None).await?;
        if status != 0 {
            tracing::debug!("git output:\n{}", output);
            return Err(KciError::command(&self.argv(args), Some(status)));
        }
        Ok(())
    }

    /// Run a git command and return its trimmed stdout, failing on non-zero
    /// exit.
    pub async fn output(&self, args: &[&str]) -> Result<String, KciError> {
        let argv = self.argv(args);
        tracing::debug!("executing: {}", argv.join(" "));

        let output = Command::new("git")
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(KciError::command(&argv, output.status.code()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    /// Run a git command without treating a non-zero exit as an error.
    ///
    /// Returns the exit status and the combined stdout+stderr, which is what
    /// the merge log captures on a failed application.
    pub async fn status_output(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<(i32, String), KciError> {
        let argv = self.argv(args);
        tracing::debug!("executing: {}", argv.join(" "));

        let mut command = Command::new("git");
        command
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input).await?;
            // Close the pipe so the child sees EOF.
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code().unwrap_or(-1), combined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_pins_work_tree_and_git_dir() {
        let git = Git::new("/tmp/tree");
        let argv = git.argv(&["fetch", "-n", "origin"]);
        assert_eq!(argv[0], "git");
        assert_eq!(argv[1], "--work-tree");
        assert_eq!(argv[2], "/tmp/tree");
        assert_eq!(argv[3], "--git-dir");
        assert_eq!(argv[4], "/tmp/tree/.git");
        assert_eq!(&argv[5..], ["fetch", "-n", "origin"]);
    }
}
