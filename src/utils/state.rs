//! Durable run state persisted to the `[state]` section of the rc file.
//!
//! The rc file is a sectioned INI document: `[config]` holds user-supplied
//! defaults and is never written by the pipeline, `[state]` is owned by the
//! pipeline and rewritten after every mutation. Lists are flattened into the
//! legacy indexed key shape (`mergerepo_00`, `jobid_01`, ...) and the
//! per-arch map into `{field}_{arch}` keys, so state files remain
//! interchangeable with existing tooling.

use crate::utils::error::KciError;
use configparser::ini::Ini;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const STATE_SECTION: &str = "state";

/// Per-architecture build and run artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchData {
    pub tarpkg: Option<String>,
    pub buildconf: Option<String>,
    pub buildurl: Option<String>,
    pub cfgurl: Option<String>,
    pub buildlog: Option<String>,
}

/// The pipeline's mutable state, persisted after each stage mutation.
///
/// `mergerepos` may legitimately be one element longer than `mergeheads`:
/// the target URL is recorded before a merge is attempted and the resulting
/// head only after it succeeds, so a crash mid-merge leaves the
/// repo-without-head signature the reporter recognizes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunState {
    pub baserepo: Option<String>,
    pub basehead: Option<String>,
    pub commitdate: Option<i64>,
    pub mergerepos: Vec<String>,
    pub mergeheads: Vec<String>,
    pub localpatches: Vec<String>,
    pub patchworks: Vec<String>,
    pub workdir: Option<String>,
    pub buildinfo: Option<String>,
    pub buildhead: Option<String>,
    pub uid: Option<String>,
    pub krelease: Option<String>,
    pub archdata: BTreeMap<String, ArchData>,
    pub infourl: Option<String>,
    pub jobs: Vec<String>,
    pub mfhost: Option<String>,
    pub mfarch: Option<String>,
    pub retcode: Option<i32>,
    pub baseretcode: Option<i32>,
    pub mergelog: Option<String>,
}

impl RunState {
    /// Flatten into the legacy key/value shape written to `[state]`.
    ///
    /// Indexed keys are zero-padded two-digit integers starting at `00`,
    /// contiguous within each category.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();

        let mut push_opt = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                pairs.push((key.to_string(), v.clone()));
            }
        };

        push_opt("baserepo", &self.baserepo);
        push_opt("basehead", &self.basehead);
        push_opt("workdir", &self.workdir);
        push_opt("buildinfo", &self.buildinfo);
        push_opt("buildhead", &self.buildhead);
        push_opt("uid", &self.uid);
        push_opt("krelease", &self.krelease);
        push_opt("infourl", &self.infourl);
        push_opt("mfhost", &self.mfhost);
        push_opt("mfarch", &self.mfarch);
        push_opt("mergelog", &self.mergelog);

        if let Some(date) = self.commitdate {
            pairs.push(("commitdate".to_string(), date.to_string()));
        }
        if let Some(code) = self.retcode {
            pairs.push(("retcode".to_string(), code.to_string()));
        }
        if let Some(code) = self.baseretcode {
            pairs.push(("baseretcode".to_string(), code.to_string()));
        }

        for (idx, repo) in self.mergerepos.iter().enumerate() {
            pairs.push((format!("mergerepo_{:02}", idx), repo.clone()));
        }
        for (idx, head) in self.mergeheads.iter().enumerate() {
            pairs.push((format!("mergehead_{:02}", idx), head.clone()));
        }
        for (idx, patch) in self.localpatches.iter().enumerate() {
            pairs.push((format!("localpatch_{:02}", idx), patch.clone()));
        }
        for (idx, url) in self.patchworks.iter().enumerate() {
            pairs.push((format!("patchwork_{:02}", idx), url.clone()));
        }
        for (idx, job) in self.jobs.iter().enumerate() {
            pairs.push((format!("jobid_{:02}", idx), job.clone()));
        }

        for (arch, data) in &self.archdata {
            let mut push_arch = |field: &str, value: &Option<String>| {
                if let Some(v) = value {
                    pairs.push((format!("{}_{}", field, arch), v.clone()));
                }
            };
            push_arch("tarpkg", &data.tarpkg);
            push_arch("buildconf", &data.buildconf);
            push_arch("buildurl", &data.buildurl);
            push_arch("cfgurl", &data.cfgurl);
            push_arch("buildlog", &data.buildlog);
        }

        pairs
    }

    /// Expand a flat `[state]` section back into semantic aggregates.
    ///
    /// Unknown keys are ignored with a debug log; indexed keys accept any
    /// numeric suffix (legacy files were not always padded) and are ordered
    /// by index.
    pub fn from_section<'a, I>(items: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Option<String>)>,
    {
        let mut state = RunState::default();
        let mut mergerepos: Vec<(usize, String)> = Vec::new();
        let mut mergeheads: Vec<(usize, String)> = Vec::new();
        let mut localpatches: Vec<(usize, String)> = Vec::new();
        let mut patchworks: Vec<(usize, String)> = Vec::new();
        let mut jobs: Vec<(usize, String)> = Vec::new();

        for (name, value) in items {
            let Some(value) = value.as_ref() else {
                continue;
            };
            match name.as_str() {
                "baserepo" => state.baserepo = Some(value.clone()),
                "basehead" => state.basehead = Some(value.clone()),
                "commitdate" => state.commitdate = value.parse().ok(),
                "workdir" => state.workdir = Some(value.clone()),
                "buildinfo" => state.buildinfo = Some(value.clone()),
                "buildhead" => state.buildhead = Some(value.clone()),
                "uid" => state.uid = Some(value.clone()),
                "krelease" => state.krelease = Some(value.clone()),
                "infourl" => state.infourl = Some(value.clone()),
                "mfhost" => state.mfhost = Some(value.clone()),
                "mfarch" => state.mfarch = Some(value.clone()),
                "mergelog" => state.mergelog = Some(value.clone()),
                "retcode" => state.retcode = value.parse().ok(),
                "baseretcode" => state.baseretcode = value.parse().ok(),
                _ => {
                    let Some((prefix, rest)) = name.split_once('_') else {
                        tracing::debug!("ignoring unknown state key: {}", name);
                        continue;
                    };
                    match prefix {
                        "mergerepo" | "mergehead" | "localpatch" | "patchwork" | "jobid" => {
                            let Ok(idx) = rest.parse::<usize>() else {
                                tracing::debug!("ignoring unindexed state key: {}", name);
                                continue;
                            };
                            let bucket = match prefix {
                                "mergerepo" => &mut mergerepos,
                                "mergehead" => &mut mergeheads,
                                "localpatch" => &mut localpatches,
                                "patchwork" => &mut patchworks,
                                _ => &mut jobs,
                            };
                            bucket.push((idx, value.clone()));
                        }
                        "tarpkg" | "buildconf" | "buildurl" | "cfgurl" | "buildlog" => {
                            let data = state.archdata.entry(rest.to_string()).or_default();
                            let slot = match prefix {
                                "tarpkg" => &mut data.tarpkg,
                                "buildconf" => &mut data.buildconf,
                                "buildurl" => &mut data.buildurl,
                                "cfgurl" => &mut data.cfgurl,
                                _ => &mut data.buildlog,
                            };
                            *slot = Some(value.clone());
                        }
                        _ => tracing::debug!("ignoring unknown state key: {}", name),
                    }
                }
            }
        }

        let strip = |mut bucket: Vec<(usize, String)>| -> Vec<String> {
            bucket.sort_by_key(|(idx, _)| *idx);
            bucket.into_iter().map(|(_, v)| v).collect()
        };
        state.mergerepos = strip(mergerepos);
        state.mergeheads = strip(mergeheads);
        state.localpatches = strip(localpatches);
        state.patchworks = strip(patchworks);
        state.jobs = strip(jobs);

        state
    }

    /// True when any per-arch build log was recorded (a build failed).
    pub fn has_buildlog(&self) -> bool {
        self.archdata.values().any(|d| d.buildlog.is_some())
    }
}

/// Write-through store for the `[state]` section of the rc file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    enabled: bool,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            path: path.into(),
            enabled,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the rc document. A missing file is an empty document, not an
    /// error.
    pub fn load_document(&self) -> Result<Ini, KciError> {
        let mut ini = Ini::new();
        if self.path.exists() {
            let content = std::fs::read_to_string(&self.path)?;
            ini.read(content)
                .map_err(|e| KciError::State(format!("Failed to parse {}: {}", self.path.display(), e)))?;
        }
        Ok(ini)
    }

    /// Load the persisted state section, if any.
    pub fn load_state(&self) -> Result<RunState, KciError> {
        if !self.enabled {
            return Ok(RunState::default());
        }
        let ini = self.load_document()?;
        let Some(items) = ini.get_map_ref().get(STATE_SECTION) else {
            return Ok(RunState::default());
        };
        Ok(RunState::from_section(items))
    }

    /// Rewrite the `[state]` section from the in-memory state.
    ///
    /// The whole section is replaced, so the on-disk file always reflects a
    /// completed mutation; other sections are preserved as parsed.
    pub fn persist(&self, state: &RunState) -> Result<(), KciError> {
        if !self.enabled {
            return Ok(());
        }
        let mut ini = self.load_document()?;
        let _ = ini.remove_section(STATE_SECTION);
        for (key, value) in state.to_pairs() {
            tracing::debug!("state: {} -> {}", key, value);
            ini.set(STATE_SECTION, &key, Some(value));
        }
        ini.write(&self.path)
            .map_err(|e| KciError::State(format!("Failed to write {}: {}", self.path.display(), e)))?;
        Ok(())
    }

    /// Drop the `[state]` section entirely.
    pub fn cleanup(&self) -> Result<(), KciError> {
        let mut ini = self.load_document()?;
        if ini.remove_section(STATE_SECTION).is_some() {
            ini.write(&self.path).map_err(|e| {
                KciError::State(format!("Failed to write {}: {}", self.path.display(), e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sample_state() -> RunState {
        let mut state = RunState {
            baserepo: Some("git://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git".to_string()),
            basehead: Some("4e3a25b2e6".to_string()),
            commitdate: Some(1526550000),
            mergerepos: vec!["https://git.example.org/net.git".to_string()],
            mergeheads: vec!["9f1bdea2ce".to_string()],
            localpatches: vec!["/tmp/fix.patch".to_string()],
            patchworks: vec!["https://patchwork.example.org/patch/42".to_string()],
            workdir: Some("/tmp/kci".to_string()),
            buildhead: Some("9f1bdea2ce".to_string()),
            uid: Some("[git] [local patch] [patchwork]".to_string()),
            krelease: Some("4.17.0-rc6+".to_string()),
            jobs: vec!["J:123456".to_string(), "J:123457".to_string()],
            retcode: Some(0),
            ..RunState::default()
        };
        state.archdata.insert(
            "x86_64".to_string(),
            ArchData {
                tarpkg: Some("/tmp/kci/9f1bdea2ce_x86_64.tar.gz".to_string()),
                buildconf: Some("/tmp/kci/9f1bdea2ce_x86_64.config".to_string()),
                ..ArchData::default()
            },
        );
        state
    }

    #[test]
    fn test_indexed_keys_zero_padded_and_contiguous() {
        let state = sample_state();
        let pairs = state.to_pairs();
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"jobid_00"), "keys: {:?}", keys);
        assert!(keys.contains(&"jobid_01"), "keys: {:?}", keys);
        assert!(keys.contains(&"mergerepo_00"), "keys: {:?}", keys);
        assert!(!keys.iter().any(|k| k.starts_with("jobid_2")));
    }

    #[test]
    fn test_arch_keys_encode_field_and_arch() {
        let pairs = sample_state().to_pairs();
        assert!(pairs.iter().any(|(k, v)| k == "tarpkg_x86_64" && v.contains("tar.gz")));
        assert!(pairs.iter().any(|(k, _)| k == "buildconf_x86_64"));
    }

    #[test]
    fn test_state_roundtrip_through_store() {
        let dir = TempDir::new().expect("tempdir");
        let rc = dir.path().join("rc");
        let store = StateStore::new(&rc, true);
        let state = sample_state();

        store.persist(&state).expect("persist");
        let loaded = store.load_state().expect("load");
        assert_eq!(state, loaded);
    }

    #[test]
    fn test_persist_preserves_config_section() {
        let dir = TempDir::new().expect("tempdir");
        let rc = dir.path().join("rc");
        std::fs::write(&rc, "[config]\nbaserepo = git://example.org/linux.git\n").expect("write rc");

        let store = StateStore::new(&rc, true);
        store.persist(&sample_state()).expect("persist");

        let ini = store.load_document().expect("reload");
        assert_eq!(
            ini.get("config", "baserepo").as_deref(),
            Some("git://example.org/linux.git")
        );
    }

    #[test]
    fn test_repo_without_head_pair_survives_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path().join("rc"), true);

        // Crash signature: second merge recorded its target but never its head.
        let mut state = sample_state();
        state.mergerepos.push("https://git.example.org/broken.git".to_string());
        store.persist(&state).expect("persist");

        let loaded = store.load_state().expect("load");
        assert_eq!(loaded.mergerepos.len(), 2);
        assert_eq!(loaded.mergeheads.len(), 1);
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path().join("absent"), true);
        assert_eq!(store.load_state().expect("load"), RunState::default());
    }

    #[test]
    fn test_disabled_store_never_writes() {
        let dir = TempDir::new().expect("tempdir");
        let rc = dir.path().join("rc");
        let store = StateStore::new(&rc, false);
        store.persist(&sample_state()).expect("persist");
        assert!(!rc.exists());
    }

    #[test]
    fn test_cleanup_removes_state_section_only() {
        let dir = TempDir::new().expect("tempdir");
        let rc = dir.path().join("rc");
        std::fs::write(&rc, "[config]\nwait = true\n").expect("write rc");

        let store = StateStore::new(&rc, true);
        store.persist(&sample_state()).expect("persist");
        store.cleanup().expect("cleanup");

        let ini = store.load_document().expect("reload");
        assert!(ini.get_map_ref().get("state").is_none());
        assert_eq!(ini.get("config", "wait").as_deref(), Some("true"));
    }

    #[test]
    fn test_legacy_unpadded_indices_load_in_order() {
        let mut items: HashMap<String, Option<String>> = HashMap::new();
        items.insert("jobid_2".to_string(), Some("J:3".to_string()));
        items.insert("jobid_0".to_string(), Some("J:1".to_string()));
        items.insert("jobid_1".to_string(), Some("J:2".to_string()));

        let state = RunState::from_section(&items);
        assert_eq!(state.jobs, vec!["J:1", "J:2", "J:3"]);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let mut items: HashMap<String, Option<String>> = HashMap::new();
        items.insert("foo".to_string(), Some("bar".to_string()));
        items.insert("retcode".to_string(), Some("1".to_string()));

        let state = RunState::from_section(&items);
        assert_eq!(state.retcode, Some(1));
    }
}
