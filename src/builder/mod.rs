//! Per-architecture kernel builds.
//!
//! Each builder owns a `{workdir}/build_{arch}` object directory and drives
//! the tree's own make targets through it. The build itself is supervised
//! by a watchdog; on expiry the subprocess is terminated and a distinct
//! timeout error raised.

use crate::utils::error::KciError;
use crate::utils::expand_home;
use globset::{Glob, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

static TARBALL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)^Tarball successfully created in (.*)$")
        .expect("tarball regex is invalid")
});
static WROTE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?m)^Wrote: (.*)$").expect("wrote regex is invalid"));
static KRELEASE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^\d+\.\d+\.\d+.*$").expect("krelease regex is invalid"));

const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 12);

/// The architecture builds run for when none is configured: the `ARCH`
/// environment variable when cross-compiling, the host otherwise.
pub fn build_arch() -> String {
    std::env::var("ARCH").unwrap_or_else(|_| std::env::consts::ARCH.to_string())
}

/// Builder knobs beyond the source tree and architecture.
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Base config: a local path or an HTTP URL fetched once. Unused for
    /// generated config types.
    pub basecfg: Option<String>,
    /// Config processing mode (default `olddefconfig`).
    pub cfgtype: Option<String>,
    /// Extra make options, split shell-style.
    pub makeopts: Option<String>,
    pub enable_debuginfo: bool,
    /// Glob selecting the generated config when `cfgtype` is `rh-configs`.
    pub rh_configs_glob: Option<String>,
    pub localversion: Option<String>,
    pub timeout: Duration,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            basecfg: None,
            cfgtype: None,
            makeopts: None,
            enable_debuginfo: false,
            rh_configs_glob: None,
            localversion: None,
            timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }
}

pub struct KernelBuilder {
    source_dir: PathBuf,
    objdir: PathBuf,
    basecfg: Option<PathBuf>,
    cfgtype: String,
    extra_make_args: Vec<String>,
    enable_debuginfo: bool,
    rh_configs_glob: Option<String>,
    localversion: Option<String>,
    cross_compiler_prefix: Option<String>,
    buildlog: PathBuf,
    timeout: Duration,
    ready: bool,
}

impl KernelBuilder {
    pub async fn new(
        source_dir: impl Into<PathBuf>,
        arch: &str,
        options: BuilderOptions,
    ) -> Result<Self, KciError> {
        let source_dir = source_dir.into();
        let objdir = source_dir.join(format!("build_{}", arch));
        if !objdir.is_dir() {
            // A stale file may shadow the build directory.
            let _ = std::fs::remove_file(&objdir);
            std::fs::create_dir_all(&objdir)?;
        }

        let buildlog = objdir.join("build.log");
        if buildlog.exists() {
            std::fs::remove_file(&buildlog)?;
        }

        let basecfg = match options.basecfg {
            Some(source) if is_url(&source) => {
                let target = objdir.join(".config.base");
                tracing::info!("fetching base config from {}", source);
                let body = reqwest::get(&source).await?.error_for_status()?.text().await?;
                std::fs::write(&target, body)?;
                Some(target)
            }
            Some(source) => Some(expand_home(&source)),
            None => None,
        };

        let extra_make_args = match options.makeopts.as_deref() {
            Some(opts) if !opts.is_empty() => shell_words::split(opts)
                .map_err(|e| KciError::Config(format!("Bad make options '{}': {}", opts, e)))?,
            _ => Vec::new(),
        };

        let builder = Self {
            source_dir,
            objdir,
            basecfg,
            cfgtype: options.cfgtype.unwrap_or_else(|| "olddefconfig".to_string()),
            extra_make_args,
            enable_debuginfo: options.enable_debuginfo,
            rh_configs_glob: options.rh_configs_glob,
            localversion: options.localversion,
            cross_compiler_prefix: std::env::var("CROSS_COMPILE").ok(),
            buildlog,
            timeout: options.timeout,
            ready: false,
        };

        tracing::info!("basecfg: {:?}", builder.basecfg);
        tracing::info!("cfgtype: {}", builder.cfgtype);
        Ok(builder)
    }

    pub fn buildlog(&self) -> &Path {
        &self.buildlog
    }

    pub fn cfgpath(&self) -> PathBuf {
        self.objdir.join(".config")
    }

    pub fn cross_compiler_prefix(&self) -> Option<&str> {
        self.cross_compiler_prefix.as_deref()
    }

    fn make_argv(&self, targets: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "make".to_string(),
            "-C".to_string(),
            self.source_dir.display().to_string(),
            format!("O={}", self.objdir.display()),
        ];
        argv.extend(self.extra_make_args.iter().cloned());
        argv.extend(targets.iter().map(|t| (*t).to_string()));
        argv
    }

    /// Run a command, appending its combined output to the build log.
    /// Non-zero exit is an error.
    async fn run_logged(&self, argv: &[String], strip_cross: bool) -> Result<String, KciError> {
        tracing::info!("executing: {}", argv.join(" "));
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if strip_cross {
            // rh-configs mishandles cross compile arguments in some cases
            command.env_remove("CROSS_COMPILE");
        }

        let output = command.output().await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        append_log(&self.buildlog, &combined)?;

        if !output.status.success() {
            return Err(KciError::command(argv, output.status.code()));
        }
        Ok(combined)
    }

    async fn adjust_config_option(&self, action: &str, options: &[&str]) -> Result<(), KciError> {
        let script = self.source_dir.join("scripts").join("config");
        let mut argv = vec![
            script.display().to_string(),
            "--file".to_string(),
            self.cfgpath().display().to_string(),
            format!("--{}", action),
        ];
        argv.extend(options.iter().map(|o| (*o).to_string()));
        self.run_logged(&argv, false).await?;
        Ok(())
    }

    async fn make_redhat_config(&self) -> Result<(), KciError> {
        self.run_logged(&self.make_argv(&["rh-configs"]), true).await?;

        let pattern = self.rh_configs_glob.as_deref().ok_or_else(|| {
            KciError::Config("rh-configs requires a config glob".to_string())
        })?;
        let mut set = GlobSetBuilder::new();
        set.add(
            Glob::new(pattern)
                .map_err(|e| KciError::Config(format!("Bad rh-configs glob '{}': {}", pattern, e)))?,
        );
        let set = set
            .build()
            .map_err(|e| KciError::Config(format!("Bad rh-configs glob '{}': {}", pattern, e)))?;

        let mut matches = Vec::new();
        collect_matches(&self.source_dir, &self.source_dir, &set, &mut matches)?;
        matches.sort();

        let Some(config) = matches.first() else {
            return Err(KciError::Config(
                "The rh-configs glob did not match any of the generated kernel configuration files"
                    .to_string(),
            ));
        };
        tracing::info!("copying Red Hat config: {}", config.display());
        std::fs::copy(config, self.cfgpath())?;
        Ok(())
    }

    /// Prepare the build configuration.
    ///
    /// With `clean` the object tree is `mrproper`'d first; resumed runs skip
    /// it to reuse the previous build.
    pub async fn prepare(&mut self, clean: bool) -> Result<(), KciError> {
        if clean {
            tracing::info!("cleaning up tree");
            self.run_logged(&self.make_argv(&["mrproper"]), false).await?;
        }

        match self.cfgtype.as_str() {
            "rh-configs" => self.make_redhat_config().await?,
            "tinyconfig" | "allyesconfig" | "allmodconfig" => {
                let target = self.cfgtype.clone();
                self.run_logged(&self.make_argv(&[&target]), false).await?;
            }
            _ => {
                let basecfg = self.basecfg.as_ref().ok_or_else(|| {
                    KciError::Config(format!("Config type '{}' needs a base config", self.cfgtype))
                })?;
                std::fs::copy(basecfg, self.cfgpath())?;
                let target = self.cfgtype.clone();
                tracing::info!("prepare config: {}", target);
                self.run_logged(&self.make_argv(&[&target]), false).await?;
            }
        }

        // Debug symbols inflate the tarball several times over; only keep
        // them when explicitly requested.
        if !self.enable_debuginfo {
            self.adjust_config_option("disable", &["DEBUG_INFO"]).await?;
        }
        if let Some(localversion) = self.localversion.clone() {
            self.adjust_config_option("set-str", &["LOCALVERSION", &format!(".{}", localversion)])
                .await?;
        }

        self.ready = true;
        Ok(())
    }

    /// Run the packaging build, streaming output to the build log while
    /// tailing it to standard output. Returns the captured stdout.
    async fn run_build(&self, targets: &[&str]) -> Result<String, KciError> {
        let argv = self.make_argv(targets);
        tracing::info!("building kernel: {}", argv.join(" "));

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KciError::parse("Build process has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| KciError::parse("Build process has no stderr"))?;

        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buildlog)
            .await?;
        let stderr_log = log.try_clone().await?;
        let stderr_task = tokio::spawn(async move {
            let mut stderr_log = stderr_log;
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stderr_log.write_all(line.as_bytes()).await;
                let _ = stderr_log.write_all(b"\n").await;
            }
        });

        let mut captured = String::new();
        let drain = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                log.write_all(line.as_bytes()).await?;
                log.write_all(b"\n").await?;
                println!("{}", line);
                captured.push_str(&line);
                captured.push('\n');
            }
            let status = child.wait().await?;
            Ok::<i32, KciError>(status.code().unwrap_or(-1))
        };

        let status = match tokio::time::timeout(self.timeout, drain).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(KciError::CommandTimeout {
                    command: argv.join(" "),
                    timeout: self.timeout,
                });
            }
        };
        let _ = stderr_task.await;

        if status != 0 {
            return Err(KciError::command(&argv, Some(status)));
        }
        Ok(captured)
    }

    /// Build the kernel and pack it into a compressed tarball; returns its
    /// absolute path.
    pub async fn mktgz(&mut self, clean: bool) -> Result<PathBuf, KciError> {
        self.prepare(clean).await?;

        let jobs = format!("-j{}", num_cpus::get());
        let stdout = self
            .run_build(&["INSTALL_MOD_STRIP=1", &jobs, "targz-pkg"])
            .await?;

        let tgz = TARBALL_RE
            .captures(&stdout)
            .map(|caps| caps[1].trim().to_string())
            .ok_or_else(|| KciError::parse("Failed to find tgz path in stdout"))?;

        let path = self.objdir.join(tgz);
        if !path.is_file() {
            return Err(KciError::FileSystem(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Built kernel tarball {} not found", path.display()),
            )));
        }
        Ok(path.canonicalize()?)
    }

    /// Build binary packages and assemble them into a package repository;
    /// returns the repository directory.
    pub async fn mkrpm(&mut self, clean: bool) -> Result<PathBuf, KciError> {
        self.prepare(clean).await?;

        let jobs = format!("-j{}", num_cpus::get());
        let stdout = self.run_build(&[&jobs, "binrpm-pkg"]).await?;

        let packages: Vec<String> = WROTE_RE
            .captures_iter(&stdout)
            .map(|caps| caps[1].trim().to_string())
            .collect();
        if packages.is_empty() {
            return Err(KciError::parse("Failed to find any written packages in stdout"));
        }

        let repodir = self.objdir.join("repo");
        std::fs::create_dir_all(&repodir)?;
        for package in &packages {
            let source = PathBuf::from(package);
            let name = source
                .file_name()
                .ok_or_else(|| KciError::parse(format!("Bad package path: {}", package)))?;
            std::fs::rename(&source, repodir.join(name))?;
        }

        let argv = vec!["createrepo_c".to_string(), repodir.display().to_string()];
        self.run_logged(&argv, false).await?;
        Ok(repodir)
    }

    /// Extract the kernel release string from the prepared tree.
    pub async fn getrelease(&mut self) -> Result<String, KciError> {
        if !self.ready {
            self.prepare(false).await?;
        }

        let stdout = self.run_logged(&self.make_argv(&["kernelrelease"]), false).await?;
        stdout
            .lines()
            .find_map(|line| KRELEASE_RE.find(line).map(|m| m.as_str().to_string()))
            .ok_or_else(|| KciError::parse("Failed to find kernel release in stdout"))
    }
}

fn is_url(source: &str) -> bool {
    static URL_RE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"^[^:]+://").expect("url regex is invalid"));
    URL_RE.is_match(source)
}

fn append_log(path: &Path, content: &str) -> Result<(), KciError> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

fn collect_matches(
    root: &Path,
    dir: &Path,
    set: &globset::GlobSet,
    matches: &mut Vec<PathBuf>,
) -> Result<(), KciError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_matches(root, &path, set, matches)?;
        } else if let Ok(relative) = path.strip_prefix(root)
            && set.is_match(relative)
        {
            matches.push(path);
        }
    }
    Ok(())
}
