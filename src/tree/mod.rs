//! Source tree management: base checkout, ref merges, patch application,
//! provenance tracking and bisection over a single working kernel checkout.

pub mod git;
pub mod patchwork;

use crate::utils::error::KciError;
use git::Git;
use patchwork::{PatchworkClient, Value};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static BISECT_PROGRESS_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^Bisecting: (.*)$").expect("bisect regex is invalid"));
static BISECT_BAD_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^(.*) is the first bad commit$").expect("bisect regex is invalid")
});

/// One applied source, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvenanceEntry {
    Base { uri: String, head: String },
    Git { uri: String, head: String },
    Patch { path: String },
    Patchwork { uri: String, name: String },
}

impl ProvenanceEntry {
    fn to_csv_row(&self) -> String {
        match self {
            ProvenanceEntry::Base { uri, head } => format!("base,{},{}", uri, head),
            ProvenanceEntry::Git { uri, head } => format!("git,{},{}", uri, head),
            ProvenanceEntry::Patch { path } => format!("patch,{}", path),
            ProvenanceEntry::Patchwork { uri, name } => format!("patchwork,{},{}", uri, name),
        }
    }
}

/// A managed kernel checkout.
///
/// Not thread-safe: at most one tree operation may be in flight per
/// instance.
pub struct KernelTree {
    workdir: PathBuf,
    uri: String,
    reference: String,
    git: Git,
    info: Vec<ProvenanceEntry>,
    mergelog: PathBuf,
}

impl KernelTree {
    /// Create the working directory (a kept temp directory when
    /// unspecified), initialize the repo and point `origin` at the base
    /// URI.
    pub async fn new(
        uri: &str,
        reference: Option<&str>,
        workdir: Option<PathBuf>,
    ) -> Result<Self, KciError> {
        let workdir = match workdir {
            Some(dir) => dir,
            None => tempfile::Builder::new().prefix("kci-").tempdir()?.keep(),
        };
        std::fs::create_dir_all(&workdir)?;

        let mergelog = workdir.join("merge.log");
        if mergelog.exists() {
            std::fs::remove_file(&mergelog)?;
        }

        let git = Git::new(&workdir);
        git.run(&["init"]).await?;
        if git
            .run(&["remote", "set-url", "origin", uri])
            .await
            .is_err()
        {
            git.run(&["remote", "add", "origin", uri]).await?;
        }

        let tree = Self {
            workdir,
            uri: uri.to_string(),
            reference: reference.unwrap_or("master").to_string(),
            git,
            info: Vec::new(),
            mergelog,
        };

        tracing::info!("base repo url: {}", tree.uri);
        tracing::info!("base ref: {}", tree.reference);
        tracing::info!("work dir: {}", tree.workdir.display());
        Ok(tree)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn mergelog(&self) -> &Path {
        &self.mergelog
    }

    fn leaf(reference: &str) -> &str {
        reference.rsplit('/').next().unwrap_or(reference)
    }

    /// Fetch and check out the base ref, detached; returns the head commit.
    pub async fn checkout(&mut self) -> Result<String, KciError> {
        let dstref = format!("refs/remotes/origin/{}", Self::leaf(&self.reference));

        tracing::info!("fetching base repo");
        self.git
            .run(&["fetch", "-n", "origin", &format!("+{}:{}", self.reference, dstref)])
            .await?;

        tracing::info!("checking out {}", self.reference);
        self.git.run(&["checkout", "-q", "--detach", &dstref]).await?;
        self.git.run(&["reset", "--hard", &dstref]).await?;

        let head = self.get_commit(None).await?;
        self.info.push(ProvenanceEntry::Base {
            uri: self.uri.clone(),
            head: head.clone(),
        });
        tracing::info!("baserepo {}: {}", self.reference, head);
        Ok(head)
    }

    pub async fn get_commit(&self, reference: Option<&str>) -> Result<String, KciError> {
        let mut args = vec!["show", "--format=%H", "-s"];
        if let Some(r) = reference {
            args.push(r);
        }
        let out = self.git.output(&args).await?;
        Ok(out.lines().next().unwrap_or_default().to_string())
    }

    pub async fn get_commit_date(&self, reference: Option<&str>) -> Result<i64, KciError> {
        let mut args = vec!["show", "--format=%ct", "-s"];
        if let Some(r) = reference {
            args.push(r);
        }
        let out = self.git.output(&args).await?;
        out.lines()
            .next()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| KciError::parse(format!("Bad commit date: '{}'", out)))
    }

    async fn get_remote_url(&self, remote: &str) -> Option<String> {
        match self.git.status_output(&["remote", "get-url", remote], None).await {
            Ok((0, out)) => Some(out.trim().to_string()),
            _ => None,
        }
    }

    /// Derive a remote name from the URI's last path segment, bumping with
    /// trailing underscores while the name is taken by a different URI.
    async fn remote_name(&self, uri: &str) -> String {
        let trimmed = uri.trim_end_matches('/');
        let mut name = trimmed
            .rsplit('/')
            .next()
            .unwrap_or(trimmed)
            .trim_end_matches(".git")
            .to_string();
        while let Some(existing) = self.get_remote_url(&name).await
            && existing != uri
        {
            tracing::warn!("remote '{}' already exists with a different uri, adding '_'", name);
            name.push('_');
        }
        name
    }

    /// Merge a ref from another repository.
    ///
    /// A failed merge is not fatal here: the tree is hard-reset and
    /// `(1, None)` returned so the caller can stop merging and mark the
    /// stage. Fetch failures propagate.
    pub async fn merge_git_ref(
        &mut self,
        uri: &str,
        reference: Option<&str>,
    ) -> Result<(i32, Option<String>), KciError> {
        let reference = reference.unwrap_or("master");
        let rname = self.remote_name(uri).await;

        // The remote may already exist from a previous run.
        let _ = self.git.status_output(&["remote", "add", &rname, uri], None).await?;

        let dstref = format!("refs/remotes/{}/{}", rname, Self::leaf(reference));
        tracing::info!("fetching {}", dstref);
        self.git
            .run(&["fetch", "-n", &rname, &format!("+{}:{}", reference, dstref)])
            .await?;

        tracing::info!("merging {}: {}", rname, reference);
        let (status, output) = self
            .git
            .status_output(&["merge", "--no-edit", &dstref], None)
            .await?;
        if status != 0 {
            tracing::warn!("failed to merge '{}' from {}, skipping", reference, rname);
            std::fs::write(&self.mergelog, &output)?;
            self.git.run(&["reset", "--hard"]).await?;
            return Ok((1, None));
        }

        let head = self.get_commit(Some(&dstref)).await?;
        self.info.push(ProvenanceEntry::Git {
            uri: uri.to_string(),
            head: head.clone(),
        });
        tracing::info!("{} {}: {}", rname, reference, head);
        Ok((0, Some(head)))
    }

    async fn abort_apply(&self, output: &str, patch: &str) -> Result<(), KciError> {
        let _ = self.git.status_output(&["am", "--abort"], None).await;
        std::fs::write(&self.mergelog, output)?;
        Err(KciError::PatchFailed {
            patch: patch.to_string(),
        })
    }

    /// Apply a local mail-format patch.
    pub async fn merge_patch_file(&mut self, path: &str) -> Result<(), KciError> {
        tracing::info!("applying patch {}", path);
        let (status, output) = self.git.status_output(&["am", path], None).await?;
        if status != 0 {
            return self.abort_apply(&output, path).await;
        }
        self.info.push(ProvenanceEntry::Patch {
            path: path.to_string(),
        });
        Ok(())
    }

    /// Fetch a patch from a patchwork instance and apply it.
    pub async fn merge_patchwork_patch(&mut self, uri: &str) -> Result<(), KciError> {
        let (base_url, patch_id) = patchwork::parse_patch_url(uri)?;
        let client = PatchworkClient::connect(&base_url).await?;

        let info = client.patch_get(patch_id).await?;
        let name = info
            .field("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mbox = client.patch_get_mbox(patch_id).await?;

        tracing::info!("applying {}", uri);
        let (status, output) = self
            .git
            .status_output(&["am", "-"], Some(mbox.as_bytes()))
            .await?;
        if status != 0 {
            return self.abort_apply(&output, &patch_id.to_string()).await;
        }

        self.info.push(ProvenanceEntry::Patchwork {
            uri: uri.to_string(),
            // Commas delimit provenance CSV fields.
            name: name.replace(',', ";"),
        });
        Ok(())
    }

    /// Write the provenance list, one comma-joined row per applied source.
    pub fn dumpinfo(&self, filename: Option<&str>) -> Result<PathBuf, KciError> {
        let path = self.workdir.join(filename.unwrap_or("buildinfo.csv"));
        let mut content = String::new();
        for entry in &self.info {
            content.push_str(&entry.to_csv_row());
            content.push('\n');
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Start bisecting between `HEAD` (assumed bad) and `good`; returns the
    /// progress line when git reports one.
    pub async fn bisect_start(&mut self, good: &str) -> Result<Option<String>, KciError> {
        let (status, output) = self
            .git
            .status_output(&["bisect", "start", "HEAD", good], None)
            .await?;
        if status != 0 {
            return Err(KciError::parse(format!("bisect start failed:\n{}", output)));
        }

        let mut progress = None;
        for line in output.lines() {
            if let Some(caps) = BISECT_PROGRESS_RE.captures(line) {
                progress = Some(caps[1].to_string());
                tracing::info!("{}", &caps[1]);
            } else {
                tracing::info!("{}", line);
            }
        }
        Ok(progress)
    }

    /// Mark the current commit and step: `(0, progress)` while bisecting,
    /// `(1, commit)` once the first bad commit is isolated.
    pub async fn bisect_iter(&mut self, bad: bool) -> Result<(i32, Option<String>), KciError> {
        let verdict = if bad { "bad" } else { "good" };
        tracing::info!("git bisect {}", verdict);

        let (status, output) = self.git.status_output(&["bisect", verdict], None).await?;
        if status != 0 {
            return Err(KciError::parse(format!("bisect {} failed:\n{}", verdict, output)));
        }

        let mut ret = 0;
        let mut binfo = None;
        for line in output.lines() {
            if let Some(caps) = BISECT_PROGRESS_RE.captures(line) {
                binfo = Some(caps[1].to_string());
                tracing::info!("{}", &caps[1]);
            } else if let Some(caps) = BISECT_BAD_RE.captures(line) {
                binfo = Some(caps[1].to_string());
                ret = 1;
                tracing::warn!("Bisected, bad commit: {}", &caps[1]);
                break;
            } else {
                tracing::info!("{}", line);
            }
        }
        Ok((ret, binfo))
    }

    /// Remove the working tree.
    pub fn cleanup(&self) -> Result<(), KciError> {
        tracing::info!("cleaning up {}", self.workdir.display());
        std::fs::remove_dir_all(&self.workdir)?;
        Ok(())
    }

    #[cfg(test)]
    fn push_info(&mut self, entry: ProvenanceEntry) {
        self.info.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_leaf_of_qualified_ref() {
        assert_eq!(KernelTree::leaf("refs/heads/queue/4.17"), "4.17");
        assert_eq!(KernelTree::leaf("master"), "master");
    }

    #[test]
    fn test_provenance_csv_rows() {
        assert_eq!(
            ProvenanceEntry::Base {
                uri: "git://example.org/linux.git".to_string(),
                head: "abc123".to_string(),
            }
            .to_csv_row(),
            "base,git://example.org/linux.git,abc123"
        );
        assert_eq!(
            ProvenanceEntry::Patch {
                path: "/tmp/a.patch".to_string()
            }
            .to_csv_row(),
            "patch,/tmp/a.patch"
        );
        assert_eq!(
            ProvenanceEntry::Patchwork {
                uri: "https://pw.example.org/patch/42".to_string(),
                name: "net: fix a; then b".to_string(),
            }
            .to_csv_row(),
            "patchwork,https://pw.example.org/patch/42,net: fix a; then b"
        );
    }

    #[tokio::test]
    async fn test_dumpinfo_writes_rows_in_application_order() {
        let dir = TempDir::new().expect("tempdir");
        let workdir = dir.path().join("tree");
        let mut tree = KernelTree::new("git://example.org/linux.git", None, Some(workdir))
            .await
            .expect("tree");

        tree.push_info(ProvenanceEntry::Base {
            uri: "git://example.org/linux.git".to_string(),
            head: "aaa".to_string(),
        });
        tree.push_info(ProvenanceEntry::Git {
            uri: "https://example.org/net.git".to_string(),
            head: "bbb".to_string(),
        });
        tree.push_info(ProvenanceEntry::Patch {
            path: "/tmp/p.patch".to_string(),
        });

        let path = tree.dumpinfo(None).expect("dumpinfo");
        let content = std::fs::read_to_string(&path).expect("read");
        let rows: Vec<&str> = content.lines().collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with("base,"));
        assert!(rows[1].starts_with("git,"));
        assert!(rows[2].starts_with("patch,"));
    }

    #[tokio::test]
    async fn test_new_tree_initializes_repo_and_clears_mergelog() {
        let dir = TempDir::new().expect("tempdir");
        let workdir = dir.path().join("tree");
        std::fs::create_dir_all(&workdir).expect("mkdir");
        std::fs::write(workdir.join("merge.log"), "stale").expect("write");

        let tree = KernelTree::new("git://example.org/linux.git", Some("master"), Some(workdir.clone()))
            .await
            .expect("tree");

        assert!(workdir.join(".git").is_dir());
        assert!(!tree.mergelog().exists());
    }

    #[tokio::test]
    async fn test_commit_roundtrip_on_local_repo() {
        let dir = TempDir::new().expect("tempdir");
        let workdir = dir.path().join("tree");
        let tree = KernelTree::new("git://example.org/linux.git", None, Some(workdir.clone()))
            .await
            .expect("tree");

        // Author an initial commit directly through the wrapper.
        std::fs::write(workdir.join("README"), "kernel\n").expect("write");
        let git = Git::new(&workdir);
        git.run(&["add", "README"]).await.expect("add");
        git.run(&[
            "-c",
            "user.name=t",
            "-c",
            "user.email=t@example.org",
            "commit",
            "-m",
            "initial",
        ])
        .await
        .expect("commit");

        let head = tree.get_commit(None).await.expect("commit hash");
        assert_eq!(head.len(), 40);
        let date = tree.get_commit_date(None).await.expect("commit date");
        assert!(date > 0);
    }
}
