//! # kci pipeline
//!
//! kci drives a kernel CI pipeline over five stages:
//!
//! 1. **Merge** - check out the base tree, merge extra refs, apply local
//!    and patchwork patches, record provenance
//! 2. **Build** - produce a kernel package per architecture
//! 3. **Publish** - upload artifacts to the configured destination
//! 4. **Run** - submit hardware test jobs and watch them to completion,
//!    with a baseline retest to separate patch regressions from
//!    pre-existing breakage
//! 5. **Report** - emit a human-readable summary
//!
//! followed by cleanup of run state and transient artifacts. Every stage
//! persists its mutations to the run-state store, so any stage can be
//! resumed independently with `--state`.

pub mod builder;
pub mod cli;
pub mod publisher;
pub mod reporter;
pub mod runner;
pub mod tree;
pub mod utils;

use crate::builder::{build_arch, BuilderOptions, KernelBuilder};
use crate::cli::args::{Args, Command};
use crate::publisher::{get_publisher, PublisherDescriptor};
use crate::reporter::{get_reporter, ReporterDescriptor};
use crate::runner::{get_runner, RunnerDescriptor};
use crate::tree::KernelTree;
use crate::utils::error::KciError;
use crate::utils::junit::{write_report, StageResult};
use crate::utils::state::{RunState, StateStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

/// Initialize logging based on verbosity level.
/// This should be called once at application startup.
///
/// # Arguments
/// * `verbose` - Verbosity level (0 = INFO, 1 = DEBUG, 2+ = TRACE)
pub fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    // Logs go to stderr; stdout belongs to the build tail and the report.
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();
}

/// One additional repository to merge: `{url, optional ref}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeSource {
    pub url: String,
    pub reference: Option<String>,
}

/// Per-architecture build options from the `[arches]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchOptions {
    pub config: Option<String>,
    pub makeopts: Option<String>,
}

/// Resolved run configuration, immutable within a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunConfig {
    pub baserepo: Option<String>,
    pub reference: Option<String>,
    pub merge_refs: Vec<MergeSource>,
    pub patchlist: Vec<String>,
    pub pw: Vec<String>,
    pub arches: BTreeMap<String, ArchOptions>,
    pub baseconfig: Option<String>,
    pub cfgtype: Option<String>,
    pub makeopts: Option<String>,
    pub rh_configs_glob: Option<String>,
    pub enable_debuginfo: bool,
    pub localversion: Option<String>,
    /// Package format: `targz` (default) or `rpm`.
    pub packaging: Option<String>,
    pub publisher: Option<PublisherDescriptor>,
    pub runner: Option<RunnerDescriptor>,
    pub reporter: Option<ReporterDescriptor>,
    pub wait: bool,
    pub wipe: bool,
    pub junit: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    /// Standalone artifact for `publish` without per-arch state.
    pub tarpkg: Option<String>,
    /// Standalone build URL for `run` without per-arch state.
    pub buildurl: Option<String>,
}

/// Pipeline context: configuration, mutable state and the store backing
/// it.
#[derive(Debug)]
pub struct Context {
    pub config: RunConfig,
    pub state: RunState,
    pub store: StateStore,
    pub retcode: i32,
    pub results: Vec<StageResult>,
}

impl Context {
    pub fn new(config: RunConfig, state: RunState, store: StateStore) -> Self {
        Self {
            config,
            state,
            store,
            retcode: 0,
            results: Vec::new(),
        }
    }

    fn persist(&self) -> Result<(), KciError> {
        self.store.persist(&self.state)
    }

    /// Working tree location. The state layer carries both the CLI value
    /// and whatever MERGE recorded; the rc default is the fallback.
    fn effective_workdir(&self) -> Option<PathBuf> {
        self.state
            .workdir
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.config.workdir.clone())
    }

    fn snapshot(&self) -> String {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            config: &'a RunConfig,
            state: &'a RunState,
            retcode: i32,
        }
        serde_json::to_string(&Snapshot {
            config: &self.config,
            state: &self.state,
            retcode: self.retcode,
        })
        .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Merge,
    Build,
    Publish,
    Run,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Merge => "merge",
            Stage::Build => "build",
            Stage::Publish => "publish",
            Stage::Run => "run",
        }
    }
}

async fn execute(ctx: &mut Context, stage: Stage) -> Result<(), KciError> {
    match stage {
        Stage::Merge => stage_merge(ctx).await,
        Stage::Build => stage_build(ctx).await,
        Stage::Publish => stage_publish(ctx).await,
        Stage::Run => stage_run(ctx).await,
    }
}

/// Run one stage under the result wrapper. Returns false when the stage
/// raised, so `all` stops before the next stage.
async fn run_stage(ctx: &mut Context, stage: Stage) -> bool {
    tracing::info!("Pipeline stage: {}", stage.name());
    let start = Instant::now();
    let outcome = execute(ctx, stage).await;

    let mut ok = true;
    let mut failure = None;
    if let Err(e) = &outcome {
        tracing::error!("Exception caught: {}", e);
        failure = Some(e.to_string());
        ctx.retcode = 1;
        ok = false;
    } else if ctx.retcode != 0 {
        // No exception but a non-zero return code, probably failed tests.
        failure = Some(format!("Step finished with retcode: {}", ctx.retcode));
    }

    if ctx.config.junit.is_some() {
        ctx.results.push(StageResult {
            name: stage.name().to_string(),
            elapsed: start.elapsed(),
            snapshot: ctx.snapshot(),
            failure,
        });
    }
    ok
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Canonical tarball name: `{buildhead}_{arch}.tar.gz`, falling back to the
/// timestamp-prefixed form when the build head is unknown.
fn tarball_name(buildhead: Option<&str>, tstamp: &str, arch: &str, original: &str) -> String {
    match buildhead {
        Some(head) => format!("{}_{}.tar.gz", head, arch),
        None => format!("{}-{}_{}", tstamp, arch, original),
    }
}

fn config_name(buildhead: Option<&str>, tstamp: &str, arch: &str) -> String {
    match buildhead {
        Some(head) => format!("{}_{}.config", head, arch),
        None => format!("{}-{}.config", tstamp, arch),
    }
}

fn provenance_name(buildhead: Option<&str>, tstamp: &str) -> String {
    match buildhead {
        Some(head) => format!("{}.csv", head),
        None => format!("{}-buildinfo.csv", tstamp),
    }
}

fn repo_name(buildhead: Option<&str>, tstamp: &str, arch: &str) -> String {
    match buildhead {
        Some(head) => format!("{}_{}.repo", head, arch),
        None => format!("{}-{}.repo", tstamp, arch),
    }
}

async fn stage_merge(ctx: &mut Context) -> Result<(), KciError> {
    let baserepo = ctx
        .config
        .baserepo
        .clone()
        .ok_or_else(|| KciError::Config("No base repo URL configured".to_string()))?;

    // A fresh merge re-derives the whole source identity.
    ctx.state.mergerepos.clear();
    ctx.state.mergeheads.clear();
    ctx.state.localpatches.clear();
    ctx.state.patchworks.clear();
    ctx.state.mergelog = None;
    ctx.state.buildhead = None;
    ctx.state.uid = None;

    let mut tree = KernelTree::new(
        &baserepo,
        ctx.config.reference.as_deref(),
        ctx.effective_workdir(),
    )
    .await?;

    let basehead = tree.checkout().await?;
    ctx.state.baserepo = Some(baserepo);
    ctx.state.commitdate = Some(tree.get_commit_date(Some(&basehead)).await?);
    ctx.state.basehead = Some(basehead);
    ctx.persist()?;

    let mut utypes: Vec<&str> = Vec::new();
    let merged = merge_sources(ctx, &mut tree, &mut utypes).await;
    if let Err(e) = merged {
        ctx.state.mergelog = Some(tree.mergelog().display().to_string());
        ctx.persist()?;
        return Err(e);
    }

    let uid = if utypes.is_empty() {
        "[baseline]".to_string()
    } else {
        utypes.join(" ")
    };

    let buildinfo = tree.dumpinfo(None)?;
    ctx.state.workdir = Some(tree.workdir().display().to_string());
    ctx.state.buildinfo = Some(buildinfo.display().to_string());
    ctx.state.buildhead = Some(tree.get_commit(None).await?);
    ctx.state.uid = Some(uid);
    ctx.persist()?;
    Ok(())
}

/// Apply merge refs, local patches and patchwork patches, in declaration
/// order. The target of each merge is persisted before the attempt, its
/// head only after success.
async fn merge_sources<'a>(
    ctx: &mut Context,
    tree: &mut KernelTree,
    utypes: &mut Vec<&'a str>,
) -> Result<(), KciError> {
    let sources = ctx.config.merge_refs.clone();
    for source in &sources {
        if !utypes.contains(&"[git]") {
            utypes.push("[git]");
        }
        ctx.state.mergerepos.push(source.url.clone());
        ctx.persist()?;

        let (code, head) = tree
            .merge_git_ref(&source.url, source.reference.as_deref())
            .await?;
        if code != 0 {
            // Stop merging; the failed merge output is in the merge log.
            ctx.state.mergelog = Some(tree.mergelog().display().to_string());
            ctx.retcode = 1;
            ctx.persist()?;
            return Ok(());
        }
        if let Some(head) = head {
            ctx.state.mergeheads.push(head);
        }
        ctx.persist()?;
    }

    let patchlist = ctx.config.patchlist.clone();
    if !patchlist.is_empty() {
        utypes.push("[local patch]");
        for patch in &patchlist {
            ctx.state.localpatches.push(patch.clone());
            ctx.persist()?;
            tree.merge_patch_file(patch).await?;
        }
    }

    let pw = ctx.config.pw.clone();
    if !pw.is_empty() {
        utypes.push("[patchwork]");
        for url in &pw {
            ctx.state.patchworks.push(url.clone());
            ctx.persist()?;
            tree.merge_patchwork_patch(url).await?;
        }
    }
    Ok(())
}

async fn stage_build(ctx: &mut Context) -> Result<(), KciError> {
    let workdir = ctx.effective_workdir().ok_or_else(|| {
        KciError::Config("No work dir known; run merge first or pass --workdir".to_string())
    })?;

    let mut arches = ctx.config.arches.clone();
    if arches.is_empty() {
        arches.insert(
            build_arch(),
            ArchOptions {
                config: ctx.config.baseconfig.clone(),
                makeopts: ctx.config.makeopts.clone(),
            },
        );
    }

    let tstamp = timestamp();
    let buildhead = ctx.state.buildhead.clone();

    // Rename the provenance CSV once, before the arch fan-out, and track
    // the renamed path so repeated runs and CLEANUP see the real file.
    if let Some(buildinfo) = ctx.state.buildinfo.clone() {
        let target = workdir.join(provenance_name(buildhead.as_deref(), &tstamp));
        if PathBuf::from(&buildinfo) != target {
            std::fs::rename(&buildinfo, &target)?;
            ctx.state.buildinfo = Some(target.display().to_string());
            ctx.persist()?;
        }
    }

    let rpm = match ctx.config.packaging.as_deref() {
        None | Some("targz") => false,
        Some("rpm") => true,
        Some(other) => {
            return Err(KciError::Config(format!(
                "Unknown packaging '{}'. Valid values are: targz, rpm",
                other
            )));
        }
    };

    for (arch, opts) in &arches {
        let options = BuilderOptions {
            basecfg: opts.config.clone().or_else(|| ctx.config.baseconfig.clone()),
            cfgtype: ctx.config.cfgtype.clone(),
            makeopts: opts.makeopts.clone().or_else(|| ctx.config.makeopts.clone()),
            enable_debuginfo: ctx.config.enable_debuginfo,
            rh_configs_glob: ctx.config.rh_configs_glob.clone(),
            localversion: ctx.config.localversion.clone(),
            ..BuilderOptions::default()
        };
        let mut builder = KernelBuilder::new(&workdir, arch, options).await?;

        let built = if rpm {
            builder.mkrpm(ctx.config.wipe).await
        } else {
            builder.mktgz(ctx.config.wipe).await
        };
        let artifact = match built {
            Ok(artifact) => artifact,
            Err(e) => {
                let entry = ctx.state.archdata.entry(arch.clone()).or_default();
                entry.buildlog = Some(builder.buildlog().display().to_string());
                ctx.persist()?;
                return Err(e);
            }
        };

        let target = if rpm {
            workdir.join(repo_name(buildhead.as_deref(), &tstamp, arch))
        } else {
            let original = artifact
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("kernel.tar.gz")
                .to_string();
            workdir.join(tarball_name(buildhead.as_deref(), &tstamp, arch, &original))
        };
        std::fs::rename(&artifact, &target)?;
        tracing::info!("package path: {}", target.display());

        let confpath = workdir.join(config_name(buildhead.as_deref(), &tstamp, arch));
        std::fs::copy(builder.cfgpath(), &confpath)?;

        let krelease = builder.getrelease().await?;

        let entry = ctx.state.archdata.entry(arch.clone()).or_default();
        entry.tarpkg = Some(target.display().to_string());
        entry.buildconf = Some(confpath.display().to_string());
        ctx.state.krelease = Some(krelease);
        ctx.persist()?;
    }
    Ok(())
}

async fn stage_publish(ctx: &mut Context) -> Result<(), KciError> {
    let descriptor = ctx
        .config
        .publisher
        .clone()
        .ok_or_else(|| KciError::Config("No publisher configured".to_string()))?;
    let publisher = get_publisher(&descriptor)?;

    // A standalone tar package binds to the host architecture.
    if let Some(tarpkg) = ctx.config.tarpkg.clone() {
        ctx.state.archdata.entry(build_arch()).or_default().tarpkg = Some(tarpkg);
    }

    for (arch, data) in ctx.state.archdata.clone() {
        let Some(tarpkg) = data.tarpkg else {
            continue;
        };

        let tarpkg = PathBuf::from(tarpkg);
        if tarpkg.is_dir() {
            // Package repositories are synced out of band.
            tracing::warn!("skipping directory artifact {}", tarpkg.display());
            continue;
        }
        let buildconf = data.buildconf.clone().map(PathBuf::from);
        let (buildurl, cfgurl) = futures::try_join!(publisher.publish(&tarpkg), async {
            match &buildconf {
                Some(conf) => publisher.publish(conf).await.map(Some),
                None => Ok(None),
            }
        })?;
        tracing::info!("published url: {}", buildurl);

        let entry = ctx.state.archdata.entry(arch).or_default();
        entry.buildurl = Some(buildurl);
        entry.cfgurl = cfgurl;
        ctx.persist()?;
    }

    if let Some(buildinfo) = ctx.state.buildinfo.clone() {
        let infourl = publisher.publish(&PathBuf::from(buildinfo)).await?;
        ctx.state.infourl = Some(infourl);
        ctx.persist()?;
    }
    Ok(())
}

async fn stage_run(ctx: &mut Context) -> Result<(), KciError> {
    let descriptor = ctx
        .config
        .runner
        .clone()
        .ok_or_else(|| KciError::Config("No runner configured".to_string()))?;
    let mut runner = get_runner(&descriptor)?;

    // A standalone build URL binds to the host architecture.
    if let Some(buildurl) = ctx.config.buildurl.clone() {
        ctx.state.archdata.entry(build_arch()).or_default().buildurl = Some(buildurl);
    }

    let krelease = ctx
        .state
        .krelease
        .clone()
        .ok_or_else(|| KciError::Config("Kernel release unknown; run build first".to_string()))?;
    let uid = ctx.state.uid.clone().unwrap_or_default();

    for (arch, data) in ctx.state.archdata.clone() {
        let Some(buildurl) = data.buildurl else {
            continue;
        };
        let jobid = runner
            .prepare_and_submit(&buildurl, &krelease, &uid, &arch)
            .await?;
        runner.add_to_watchlist(&jobid);
    }

    if !ctx.config.wait {
        ctx.state.jobs = runner.jobs().to_vec();
        ctx.persist()?;
        return Ok(());
    }

    runner.watchloop().await?;
    let mut retcode = runner.getresults();

    for jobid in runner.jobs().to_vec() {
        if let Some(junitdir) = ctx.config.junit.clone() {
            runner.dumpjunitresults(&jobid, &junitdir).await?;
        }
    }
    ctx.state.jobs = runner.jobs().to_vec();
    ctx.persist()?;

    if retcode != 0
        && let Some(mfhost) = runner.get_mfhost()
    {
        let mfarch = runner.hostarch(&mfhost);
        ctx.state.mfhost = Some(mfhost.clone());
        ctx.state.mfarch = mfarch.clone();
        ctx.persist()?;

        let basehead = ctx.state.basehead.clone();
        if let Some(basehead) = basehead
            && let Some(pub_descriptor) = ctx.config.publisher.clone()
            && ctx.state.basehead != ctx.state.buildhead
            && let Some(mfarch) = mfarch
        {
            // The baseline may report a different kernel release; the
            // patched one is used here and runner-side mismatches are
            // tolerated.
            let publisher = get_publisher(&pub_descriptor)?;
            let baseurl = publisher.geturl(&format!("{}_{}.tar.gz", basehead, mfarch));
            let mut baserunner = get_runner(&descriptor)?;
            let baseres = baserunner
                .run(
                    &baseurl,
                    &krelease,
                    ctx.config.wait,
                    &mfhost,
                    "baseline check",
                    false,
                )
                .await?;
            ctx.state.baseretcode = Some(baseres);
            ctx.persist()?;

            // If the baseline also fails the breakage predates the
            // patches.
            if baseres != 0 {
                retcode = 0;
            }
        }
    }

    ctx.state.retcode = Some(retcode);
    ctx.persist()?;
    ctx.retcode = retcode;
    Ok(())
}

async fn stage_report(ctx: &mut Context) -> Result<(), KciError> {
    let Some(descriptor) = ctx.config.reporter.clone() else {
        return Ok(());
    };
    let mut reporter = get_reporter(&descriptor)?;
    reporter.report(&ctx.state).await
}

async fn stage_cleanup(ctx: &mut Context) -> Result<(), KciError> {
    ctx.store.cleanup()?;

    if let Some(buildinfo) = &ctx.state.buildinfo {
        let _ = std::fs::remove_file(buildinfo);
    }
    for data in ctx.state.archdata.values() {
        if let Some(tarpkg) = &data.tarpkg {
            let path = PathBuf::from(tarpkg);
            if path.is_dir() {
                let _ = std::fs::remove_dir_all(&path);
            } else {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    if let Some(tarpkg) = &ctx.config.tarpkg {
        let _ = std::fs::remove_file(tarpkg);
    }

    if ctx.config.wipe
        && let Some(workdir) = ctx.effective_workdir()
        && workdir.exists()
    {
        tracing::info!("removing work dir {}", workdir.display());
        std::fs::remove_dir_all(&workdir)?;
    }
    Ok(())
}

/// Dispatch one CLI invocation; returns the process exit code.
pub async fn run_command(args: Args) -> anyhow::Result<i32> {
    let mut ctx = cli::config::load(&args)?;
    let subcommand = args.command.name();

    match &args.command {
        Command::Merge(_) => {
            run_stage(&mut ctx, Stage::Merge).await;
        }
        Command::Build(_) => {
            run_stage(&mut ctx, Stage::Build).await;
        }
        Command::Publish(_) => {
            run_stage(&mut ctx, Stage::Publish).await;
        }
        Command::Run(_) => {
            run_stage(&mut ctx, Stage::Run).await;
        }
        Command::Report(_) => {
            if let Err(e) = stage_report(&mut ctx).await {
                tracing::error!("Exception caught: {}", e);
                ctx.retcode = 1;
            }
        }
        Command::Cleanup => {
            if let Err(e) = stage_cleanup(&mut ctx).await {
                tracing::error!("Exception caught: {}", e);
                ctx.retcode = 1;
            }
        }
        Command::All(_) => {
            for stage in [Stage::Merge, Stage::Build, Stage::Publish, Stage::Run] {
                if !run_stage(&mut ctx, stage).await || ctx.retcode != 0 {
                    break;
                }
            }
            // The reporter consumes the merge/build logs, so it runs
            // before cleanup unlinks them.
            if ctx.config.wait
                && let Err(e) = stage_report(&mut ctx).await
            {
                tracing::warn!("reporter failed: {}", e);
            }
            if let Err(e) = stage_cleanup(&mut ctx).await {
                tracing::warn!("cleanup failed: {}", e);
            }
        }
    }

    if let Some(junitdir) = &ctx.config.junit {
        write_report(&ctx.results, junitdir, subcommand)?;
    }
    Ok(ctx.retcode)
}
