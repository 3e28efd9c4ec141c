//! Beaker scheduler client, driving the bkr command line.

use crate::runner::Runner;
use crate::utils::error::KciError;
use async_trait::async_trait;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

static SUBMITTED_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"Submitted: \['([^']+)'\]").expect("submitted regex is invalid")
});

const DEFAULT_WATCHDELAY: Duration = Duration::from_secs(60);

/// Parsed outcome of one scheduler job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResult {
    pub status: String,
    pub result: String,
    pub recipes: Vec<RecipeResult>,
}

/// One host-bound recipe execution within a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipeResult {
    pub id: String,
    pub system: String,
    pub arch: String,
    pub status: String,
    pub result: String,
    pub tasks: Vec<TaskResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskResult {
    pub name: String,
    pub status: String,
    pub result: String,
}

impl JobResult {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "Completed" | "Aborted" | "Cancelled")
    }

    /// Number of recipes that did not pass.
    pub fn failures(&self) -> i32 {
        self.recipes
            .iter()
            .filter(|r| r.result != "Pass")
            .count() as i32
    }
}

impl RecipeResult {
    fn failed_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.result != "Pass").count()
    }
}

fn attr(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Result<Option<String>, KciError> {
    for attribute in e.attributes() {
        let attribute = attribute
            .map_err(|err| KciError::parse(format!("Bad attribute in scheduler XML: {}", err)))?;
        if attribute.key.as_ref() == name {
            let value = attribute.unescape_value().map_err(|err| {
                KciError::parse(format!("Bad attribute value in scheduler XML: {}", err))
            })?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Parse a `bkr job-results` document.
pub fn parse_job_results(xml: &str) -> Result<JobResult, KciError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut job = JobResult::default();
    let mut current: Option<RecipeResult> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| KciError::parse(format!("Bad scheduler XML: {}", e)))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => match e.name().as_ref() {
                b"job" => {
                    job.status = attr(e, b"status")?.unwrap_or_default();
                    job.result = attr(e, b"result")?.unwrap_or_default();
                }
                b"recipe" | b"guestrecipe" => {
                    if let Some(done) = current.take() {
                        job.recipes.push(done);
                    }
                    current = Some(RecipeResult {
                        id: attr(e, b"id")?.unwrap_or_default(),
                        system: attr(e, b"system")?.unwrap_or_default(),
                        arch: attr(e, b"arch")?.unwrap_or_default(),
                        status: attr(e, b"status")?.unwrap_or_default(),
                        result: attr(e, b"result")?.unwrap_or_default(),
                        tasks: Vec::new(),
                    });
                }
                b"task" => {
                    if let Some(recipe) = current.as_mut() {
                        recipe.tasks.push(TaskResult {
                            name: attr(e, b"name")?.unwrap_or_default(),
                            status: attr(e, b"status")?.unwrap_or_default(),
                            result: attr(e, b"result")?.unwrap_or_default(),
                        });
                    }
                }
                _ => {}
            },
            Event::End(ref e) if matches!(e.name().as_ref(), b"recipe" | b"guestrecipe") => {
                if let Some(done) = current.take() {
                    job.recipes.push(done);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if let Some(done) = current.take() {
        job.recipes.push(done);
    }

    if job.status.is_empty() {
        return Err(KciError::parse("Scheduler XML carries no job element"));
    }
    Ok(job)
}

/// Substitute the job template placeholders.
pub fn render_template(
    template: &str,
    buildurl: &str,
    krelease: &str,
    uid: &str,
    arch: &str,
    host: Option<&str>,
) -> String {
    template
        .replace("##KPKG_URL##", buildurl)
        .replace("##KVER##", krelease)
        .replace("##UID##", uid)
        .replace("##ARCH##", arch)
        .replace("##HOSTNAME##", host.unwrap_or(""))
}

#[derive(Debug)]
pub struct BeakerRunner {
    template: PathBuf,
    jobowner: Option<String>,
    watchdelay: Duration,
    jobs: Vec<String>,
    lastsubmitted: Option<String>,
    watchlist: Vec<String>,
    results: HashMap<String, JobResult>,
}

impl BeakerRunner {
    pub fn new(template: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            jobowner: None,
            watchdelay: DEFAULT_WATCHDELAY,
            jobs: Vec::new(),
            lastsubmitted: None,
            watchlist: Vec::new(),
            results: HashMap::new(),
        }
    }

    /// Build a runner from a descriptor options map: `jobtemplate`
    /// (required), `jobowner`, `watchdelay` (seconds).
    pub fn from_options(
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, KciError> {
        let template = options
            .get("jobtemplate")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                KciError::Config("Beaker runner needs a 'jobtemplate' option".to_string())
            })?;

        let mut runner = Self::new(template);
        runner.jobowner = options
            .get("jobowner")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if let Some(delay) = options.get("watchdelay") {
            let seconds = delay
                .as_u64()
                .or_else(|| delay.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| {
                    KciError::Config(format!("Bad watchdelay option: {}", delay))
                })?;
            runner.watchdelay = Duration::from_secs(seconds);
        }
        Ok(runner)
    }

    async fn bkr(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<String, KciError> {
        let mut argv = vec!["bkr".to_string()];
        argv.extend(args.iter().map(|a| (*a).to_string()));
        tracing::debug!("executing: {}", argv.join(" "));

        let mut command = Command::new(&argv[0]);
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
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(KciError::Scheduler(format!(
                "{} failed: {}",
                argv.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn submit(&mut self, jobxml: &str) -> Result<String, KciError> {
        let mut args = vec!["job-submit"];
        if let Some(owner) = &self.jobowner {
            args.push("--job-owner");
            args.push(owner);
        }
        args.push("-");

        let stdout = self.bkr(&args, Some(jobxml.as_bytes())).await?;
        let jobid = SUBMITTED_RE
            .captures(&stdout)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| {
                KciError::Scheduler(format!("No job id in submission output: {}", stdout.trim()))
            })?;

        tracing::info!("submitted job {}", jobid);
        self.jobs.push(jobid.clone());
        self.lastsubmitted = Some(jobid.clone());
        Ok(jobid)
    }

    async fn fetch_results(&self, jobid: &str) -> Result<JobResult, KciError> {
        let stdout = self.bkr(&["job-results", jobid], None).await?;
        parse_job_results(&stdout)
    }

    async fn render_and_submit(
        &mut self,
        buildurl: &str,
        krelease: &str,
        uid: &str,
        arch: &str,
        host: Option<&str>,
    ) -> Result<String, KciError> {
        let template = tokio::fs::read_to_string(&self.template).await?;
        let jobxml = render_template(&template, buildurl, krelease, uid, arch, host);
        self.submit(&jobxml).await
    }

    /// Poll one job until terminal, caching the final result.
    async fn watch_one(&mut self, jobid: &str) -> Result<JobResult, KciError> {
        loop {
            let result = self.fetch_results(jobid).await?;
            if result.is_terminal() {
                tracing::info!(
                    "job {} finished: {} ({})",
                    jobid,
                    result.status,
                    result.result
                );
                self.results.insert(jobid.to_string(), result.clone());
                return Ok(result);
            }
            tracing::debug!("job {} still {}", jobid, result.status);
            tokio::time::sleep(self.watchdelay).await;
        }
    }
}

#[async_trait]
impl Runner for BeakerRunner {
    async fn prepare_and_submit(
        &mut self,
        buildurl: &str,
        krelease: &str,
        uid: &str,
        arch: &str,
    ) -> Result<String, KciError> {
        self.render_and_submit(buildurl, krelease, uid, arch, None).await
    }

    fn lastsubmitted(&self) -> Option<&str> {
        self.lastsubmitted.as_deref()
    }

    fn add_to_watchlist(&mut self, jobid: &str) {
        if !self.watchlist.iter().any(|j| j == jobid) {
            self.watchlist.push(jobid.to_string());
        }
    }

    async fn watchloop(&mut self) -> Result<(), KciError> {
        while let Some(jobid) = self.watchlist.first().cloned() {
            self.watch_one(&jobid).await?;
            self.watchlist.retain(|j| j != &jobid);
        }
        Ok(())
    }

    fn getresults(&self) -> i32 {
        self.results.values().map(JobResult::failures).sum()
    }

    fn get_mfhost(&self) -> Option<String> {
        self.results
            .values()
            .flat_map(|job| job.recipes.iter())
            .filter(|recipe| recipe.result != "Pass")
            .max_by_key(|recipe| recipe.failed_tasks())
            .map(|recipe| recipe.system.clone())
    }

    fn hostarch(&self, host: &str) -> Option<String> {
        self.results
            .values()
            .flat_map(|job| job.recipes.iter())
            .find(|recipe| recipe.system == host)
            .map(|recipe| recipe.arch.clone())
    }

    async fn run(
        &mut self,
        buildurl: &str,
        krelease: &str,
        wait: bool,
        host: &str,
        uid: &str,
        reschedule: bool,
    ) -> Result<i32, KciError> {
        let jobid = self
            .render_and_submit(buildurl, krelease, uid, "", Some(host))
            .await?;
        if !wait {
            return Ok(0);
        }

        let mut result = self.watch_one(&jobid).await?;
        if reschedule && result.status == "Aborted" {
            // Infrastructure abort, not a test verdict: one more try.
            tracing::warn!("job {} aborted, resubmitting", jobid);
            let retry = self
                .render_and_submit(buildurl, krelease, uid, "", Some(host))
                .await?;
            result = self.watch_one(&retry).await?;
        }
        Ok(result.failures())
    }

    async fn dumpjunitresults(&mut self, jobid: &str, outdir: &Path) -> Result<(), KciError> {
        let result = match self.results.get(jobid) {
            Some(cached) => cached.clone(),
            None => self.fetch_results(jobid).await?,
        };

        let mut report = Report::new(jobid);
        for recipe in &result.recipes {
            let mut suite = TestSuite::new(format!("{} {}", recipe.id, recipe.system));
            for task in &recipe.tasks {
                let status = if task.result == "Pass" {
                    TestCaseStatus::success()
                } else {
                    let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
                    status.set_message(format!("{} ({})", task.result, task.status));
                    status
                };
                suite.add_test_case(TestCase::new(task.name.clone(), status));
            }
            report.add_test_suite(suite);
        }

        std::fs::create_dir_all(outdir)?;
        let path = outdir.join(format!("{}.xml", jobid.replace(':', "_")));
        let serialized = report
            .to_string()
            .map_err(|e| KciError::parse(format!("Failed to serialize job results: {}", e)))?;
        std::fs::write(&path, serialized)?;
        Ok(())
    }

    fn jobs(&self) -> &[String] {
        &self.jobs
    }
}
