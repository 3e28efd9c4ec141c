//! Rc-file loading and flag merging.
//!
//! Configuration arrives from three places with fixed precedence: CLI flags
//! win, the persisted `[state]` section comes next (when `--state` is
//! given), and the `[config]` section supplies defaults. A CLI-provided
//! value is never overwritten by either file layer.

use crate::cli::args::{Args, BuildArgs, Command, MergeArgs, PublishArgs, ReportArgs, RunArgs};
use crate::publisher::PublisherDescriptor;
use crate::reporter::ReporterDescriptor;
use crate::runner::RunnerDescriptor;
use crate::utils::error::KciError;
use crate::utils::expand_home;
use crate::utils::state::StateStore;
use crate::{ArchOptions, Context, MergeSource, RunConfig};
use configparser::ini::Ini;
use std::collections::BTreeMap;

struct FlagView<'a> {
    merge: Option<&'a MergeArgs>,
    build: Option<&'a BuildArgs>,
    publish: Option<&'a PublishArgs>,
    run: Option<&'a RunArgs>,
    report: Option<&'a ReportArgs>,
}

impl<'a> FlagView<'a> {
    fn of(command: &'a Command) -> Self {
        let mut view = Self {
            merge: None,
            build: None,
            publish: None,
            run: None,
            report: None,
        };
        match command {
            Command::Merge(merge) => view.merge = Some(merge),
            Command::Build(build) => view.build = Some(build),
            Command::Publish(publish) => view.publish = Some(publish),
            Command::Run(run) => view.run = Some(run),
            Command::Report(report) => view.report = Some(report),
            Command::Cleanup => {}
            Command::All(all) => {
                view.merge = Some(&all.merge);
                view.build = Some(&all.build);
                view.publish = Some(&all.publish);
                view.run = Some(&all.run);
                view.report = Some(&all.report);
            }
        }
        view
    }
}

fn get_bool(ini: &Ini, section: &str, key: &str) -> Result<bool, KciError> {
    ini.getbool(section, key)
        .map_err(|e| KciError::Config(format!("Bad boolean for {}.{}: {}", section, key, e)))
        .map(|v| v.unwrap_or(false))
}

/// Parse a descriptor options payload: a JSON object literal from the CLI.
fn parse_cli_options(
    kind: &str,
    raw: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, KciError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| KciError::Config(format!("Bad {} options '{}': {}", kind, raw, e)))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(KciError::Config(format!(
            "{} options must be a JSON object, got: {}",
            kind, other
        ))),
    }
}

/// Collect a descriptor options map from an rc-file section: every key but
/// `type` becomes a string-valued option.
fn section_options(ini: &Ini, section: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut options = serde_json::Map::new();
    if let Some(items) = ini.get_map_ref().get(section) {
        for (key, value) in items {
            if key.as_str() == "type" {
                continue;
            }
            if let Some(value) = value {
                options.insert(key.clone(), serde_json::Value::String(value.clone()));
            }
        }
    }
    options
}

fn load_publisher(
    ini: &Ini,
    flags: Option<&PublishArgs>,
) -> Result<Option<PublisherDescriptor>, KciError> {
    if let Some(values) = flags.and_then(|f| f.publisher.as_ref()) {
        let [kind, destination, baseurl] = values.as_slice() else {
            return Err(KciError::Config(
                "Publisher needs 'type destination baseurl'".to_string(),
            ));
        };
        return Ok(Some(PublisherDescriptor {
            kind: kind.clone(),
            destination: destination.clone(),
            baseurl: baseurl.clone(),
        }));
    }

    if ini.get_map_ref().contains_key("publisher") {
        let field = |key: &str| {
            ini.get("publisher", key).ok_or_else(|| {
                KciError::Config(format!("Publisher section needs a '{}' key", key))
            })
        };
        return Ok(Some(PublisherDescriptor {
            kind: field("type")?,
            destination: field("destination")?,
            baseurl: field("baseurl")?,
        }));
    }
    Ok(None)
}

fn load_runner(ini: &Ini, flags: Option<&RunArgs>) -> Result<Option<RunnerDescriptor>, KciError> {
    if let Some(values) = flags.and_then(|f| f.runner.as_ref()) {
        let [kind, options] = values.as_slice() else {
            return Err(KciError::Config("Runner needs 'type options'".to_string()));
        };
        return Ok(Some(RunnerDescriptor {
            kind: kind.clone(),
            options: parse_cli_options("runner", options)?,
        }));
    }

    if ini.get_map_ref().contains_key("runner") {
        let kind = ini
            .get("runner", "type")
            .ok_or_else(|| KciError::Config("Runner section needs a 'type' key".to_string()))?;
        return Ok(Some(RunnerDescriptor {
            kind,
            options: section_options(ini, "runner"),
        }));
    }
    Ok(None)
}

fn load_reporter(
    ini: &Ini,
    flags: Option<&ReportArgs>,
) -> Result<Option<ReporterDescriptor>, KciError> {
    if let Some(values) = flags.and_then(|f| f.reporter.as_ref()) {
        let [kind, options] = values.as_slice() else {
            return Err(KciError::Config("Reporter needs 'type options'".to_string()));
        };
        return Ok(Some(ReporterDescriptor {
            kind: kind.clone(),
            options: parse_cli_options("reporter", options)?,
        }));
    }

    if ini.get_map_ref().contains_key("reporter") {
        let kind = ini
            .get("reporter", "type")
            .ok_or_else(|| KciError::Config("Reporter section needs a 'type' key".to_string()))?;
        return Ok(Some(ReporterDescriptor {
            kind,
            options: section_options(ini, "reporter"),
        }));
    }
    Ok(None)
}

fn load_arches(ini: &Ini) -> Result<BTreeMap<String, ArchOptions>, KciError> {
    let mut arches: BTreeMap<String, ArchOptions> = BTreeMap::new();
    if let Some(items) = ini.get_map_ref().get("arches") {
        for (key, value) in items {
            let Some((arch, field)) = key.rsplit_once('_') else {
                return Err(KciError::Config(format!(
                    "Bad arches key '{}': expected '{{arch}}_{{config|makeopts}}'",
                    key
                )));
            };
            let entry = arches.entry(arch.to_string()).or_default();
            match field {
                "config" => entry.config = value.clone(),
                "makeopts" => entry.makeopts = value.clone(),
                _ => {
                    return Err(KciError::Config(format!(
                        "Bad arches key '{}': unknown field '{}'",
                        key, field
                    )));
                }
            }
        }
    }
    Ok(arches)
}

fn load_merge_refs(ini: &Ini, flags: Option<&MergeArgs>) -> Result<Vec<MergeSource>, KciError> {
    let mut refs = Vec::new();
    if let Some(merge) = flags {
        for entry in &merge.merge_ref {
            let url = entry
                .first()
                .ok_or_else(|| KciError::Config("Empty merge ref".to_string()))?;
            refs.push(MergeSource {
                url: url.clone(),
                reference: entry.get(1).cloned(),
            });
        }
    }

    // merge-* sections extend whatever the command line gave, in
    // declaration order.
    for section in ini.sections() {
        if !section.starts_with("merge-") {
            continue;
        }
        let url = ini.get(&section, "url").ok_or_else(|| {
            KciError::Config(format!("Section [{}] needs a 'url' key", section))
        })?;
        refs.push(MergeSource {
            url,
            reference: ini.get(&section, "ref"),
        });
    }
    Ok(refs)
}

/// Load the rc file, overlay it under the CLI flags and assemble the run
/// context.
pub fn load(args: &Args) -> Result<Context, KciError> {
    let rc_path = expand_home(&args.rc);
    let store = StateStore::new(rc_path, args.state);
    let ini = store.load_document()?;
    let mut state = store.load_state()?;

    let flags = FlagView::of(&args.command);
    let config_get = |key: &str| ini.get("config", key);

    // CLI resume overrides beat the persisted state.
    if let Some(workdir) = &args.workdir {
        state.workdir = Some(workdir.display().to_string());
    }
    if let Some(krelease) = flags.run.and_then(|f| f.krelease.clone()) {
        state.krelease = Some(krelease);
    }
    if let Some(buildinfo) = flags.publish.and_then(|f| f.buildinfo.clone()) {
        state.buildinfo = Some(buildinfo);
    }

    let config = RunConfig {
        baserepo: flags
            .merge
            .and_then(|f| f.baserepo.clone())
            .or_else(|| config_get("baserepo")),
        reference: flags
            .merge
            .and_then(|f| f.reference.clone())
            .or_else(|| config_get("ref")),
        merge_refs: load_merge_refs(&ini, flags.merge)?,
        patchlist: flags.merge.map(|f| f.patchlist.clone()).unwrap_or_default(),
        pw: flags.merge.map(|f| f.pw.clone()).unwrap_or_default(),
        arches: load_arches(&ini)?,
        baseconfig: flags
            .build
            .and_then(|f| f.baseconfig.clone())
            .or_else(|| config_get("baseconfig")),
        cfgtype: flags
            .build
            .and_then(|f| f.cfgtype.clone())
            .or_else(|| config_get("cfgtype")),
        makeopts: flags
            .build
            .and_then(|f| f.makeopts.clone())
            .or_else(|| config_get("makeopts")),
        rh_configs_glob: flags
            .build
            .and_then(|f| f.rh_configs_glob.clone())
            .or_else(|| config_get("rh_configs_glob")),
        enable_debuginfo: flags.build.is_some_and(|f| f.enable_debuginfo)
            || get_bool(&ini, "config", "enable_debuginfo")?,
        localversion: flags
            .build
            .and_then(|f| f.localversion.clone())
            .or_else(|| config_get("localversion")),
        packaging: flags
            .build
            .and_then(|f| f.packaging.clone())
            .or_else(|| config_get("packaging")),
        publisher: load_publisher(&ini, flags.publish)?,
        runner: load_runner(&ini, flags.run)?,
        reporter: load_reporter(&ini, flags.report)?,
        wait: flags.run.is_some_and(|f| f.wait) || get_bool(&ini, "config", "wait")?,
        wipe: args.wipe,
        junit: args.junit.clone(),
        // The CLI workdir was folded into the state above; this is the rc
        // default only.
        workdir: config_get("workdir").map(|w| expand_home(&w)),
        tarpkg: flags.publish.and_then(|f| f.tarpkg.clone()),
        buildurl: flags.run.and_then(|f| f.buildurl.clone()),
    };

    Ok(Context::new(config, state, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::Args;
    use clap::Parser;
    use tempfile::TempDir;

    fn write_rc(dir: &TempDir, content: &str) -> String {
        let path = dir.path().join("rc");
        std::fs::write(&path, content).expect("write rc");
        path.display().to_string()
    }

    const RC: &str = "\
[config]
baserepo = git://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git
ref = master
wait = true
workdir = /srv/kci

[publisher]
type = scp
destination = user@host:/srv/artifacts
baseurl = https://artifacts.example.org

[runner]
type = beaker
jobtemplate = /etc/kci/job.xml
watchdelay = 30

[reporter]
type = stdio

[arches]
x86_64_config = /boot/config-x86_64
x86_64_makeopts = W=1
s390x_config = /boot/config-s390x

[merge-net]
url = https://git.example.org/net.git
ref = net-next

[merge-fixes]
url = https://git.example.org/fixes.git
";

    #[test]
    fn test_config_section_supplies_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let rc = write_rc(&dir, RC);
        let args = Args::parse_from(["kci", "--rc", &rc, "merge"]);
        let ctx = load(&args).expect("load");

        assert!(ctx.config.baserepo.as_deref().is_some_and(|b| b.contains("torvalds")));
        assert_eq!(ctx.config.reference.as_deref(), Some("master"));
        assert!(ctx.config.wait);
        assert_eq!(ctx.config.workdir.as_deref(), Some(std::path::Path::new("/srv/kci")));
    }

    #[test]
    fn test_cli_wins_over_config() {
        let dir = TempDir::new().expect("tempdir");
        let rc = write_rc(&dir, RC);
        let args = Args::parse_from([
            "kci",
            "--rc",
            &rc,
            "-d",
            "/tmp/elsewhere",
            "merge",
            "-b",
            "git://example.org/other.git",
        ]);
        let ctx = load(&args).expect("load");

        assert_eq!(ctx.config.baserepo.as_deref(), Some("git://example.org/other.git"));
        // -d takes effect through the state layer, beating the rc default.
        assert_eq!(ctx.state.workdir.as_deref(), Some("/tmp/elsewhere"));
    }

    #[test]
    fn test_merge_sections_follow_cli_refs_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let rc = write_rc(&dir, RC);
        let args = Args::parse_from([
            "kci", "--rc", &rc, "merge", "-m", "https://cli.example.org/first.git", "topic",
        ]);
        let ctx = load(&args).expect("load");

        let urls: Vec<&str> = ctx.config.merge_refs.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://cli.example.org/first.git",
                "https://git.example.org/net.git",
                "https://git.example.org/fixes.git",
            ]
        );
        assert_eq!(ctx.config.merge_refs[0].reference.as_deref(), Some("topic"));
        assert_eq!(ctx.config.merge_refs[1].reference.as_deref(), Some("net-next"));
        assert_eq!(ctx.config.merge_refs[2].reference, None);
    }

    #[test]
    fn test_descriptors_from_sections() {
        let dir = TempDir::new().expect("tempdir");
        let rc = write_rc(&dir, RC);
        let args = Args::parse_from(["kci", "--rc", &rc, "run"]);
        let ctx = load(&args).expect("load");

        let publisher = ctx.config.publisher.expect("publisher");
        assert_eq!(publisher.kind, "scp");
        assert_eq!(publisher.baseurl, "https://artifacts.example.org");

        let runner = ctx.config.runner.expect("runner");
        assert_eq!(runner.kind, "beaker");
        assert_eq!(
            runner.options.get("jobtemplate").and_then(|v| v.as_str()),
            Some("/etc/kci/job.xml")
        );
        assert_eq!(
            runner.options.get("watchdelay").and_then(|v| v.as_str()),
            Some("30")
        );

        assert_eq!(ctx.config.reporter.expect("reporter").kind, "stdio");
    }

    #[test]
    fn test_runner_descriptor_from_cli_json() {
        let dir = TempDir::new().expect("tempdir");
        let rc = write_rc(&dir, "");
        let args = Args::parse_from([
            "kci",
            "--rc",
            &rc,
            "run",
            "-r",
            "beaker",
            r#"{"jobtemplate": "/tmp/job.xml", "watchdelay": 5}"#,
        ]);
        let ctx = load(&args).expect("load");

        let runner = ctx.config.runner.expect("runner");
        assert_eq!(runner.kind, "beaker");
        assert_eq!(
            runner.options.get("watchdelay").and_then(serde_json::Value::as_u64),
            Some(5)
        );
    }

    #[test]
    fn test_bad_cli_json_is_config_error() {
        let dir = TempDir::new().expect("tempdir");
        let rc = write_rc(&dir, "");
        let args = Args::parse_from(["kci", "--rc", &rc, "run", "-r", "beaker", "not json"]);
        let err = load(&args).expect_err("bad json");
        assert!(matches!(err, KciError::Config(_)));
    }

    #[test]
    fn test_arches_keys_split_on_last_underscore() {
        let dir = TempDir::new().expect("tempdir");
        let rc = write_rc(&dir, RC);
        let args = Args::parse_from(["kci", "--rc", &rc, "build"]);
        let ctx = load(&args).expect("load");

        let x86 = ctx.config.arches.get("x86_64").expect("x86_64");
        assert_eq!(x86.config.as_deref(), Some("/boot/config-x86_64"));
        assert_eq!(x86.makeopts.as_deref(), Some("W=1"));
        assert!(ctx.config.arches.contains_key("s390x"));
    }

    #[test]
    fn test_state_loaded_and_cli_resume_overrides() {
        let dir = TempDir::new().expect("tempdir");
        let rc = write_rc(
            &dir,
            "[state]\nkrelease = 4.16.0\nbuildhead = abc\nworkdir = /srv/kci/run1\n",
        );
        let args = Args::parse_from([
            "kci", "--rc", &rc, "--state", "run", "--krelease", "4.17.0-rc6+",
        ]);
        let ctx = load(&args).expect("load");

        assert_eq!(ctx.state.buildhead.as_deref(), Some("abc"));
        assert_eq!(ctx.state.workdir.as_deref(), Some("/srv/kci/run1"));
        // The CLI flag beats the persisted value.
        assert_eq!(ctx.state.krelease.as_deref(), Some("4.17.0-rc6+"));
    }

    #[test]
    fn test_state_ignored_without_flag() {
        let dir = TempDir::new().expect("tempdir");
        let rc = write_rc(&dir, "[state]\nkrelease = 4.16.0\n");
        let args = Args::parse_from(["kci", "--rc", &rc, "run"]);
        let ctx = load(&args).expect("load");
        assert_eq!(ctx.state.krelease, None);
    }
}
