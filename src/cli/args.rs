use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kci")]
#[command(about = "Kernel CI pipeline driver - merge, build, publish, test and report")]
#[command(version)]
pub struct Args {
    /// Path to work dir
    #[arg(short = 'd', long, global = true)]
    pub workdir: Option<PathBuf>,

    /// Clean build (make mrproper before building), remove workdir when finished
    #[arg(short = 'w', long, global = true)]
    pub wipe: bool,

    /// Path to dir to store junit results in
    #[arg(long, global = true)]
    pub junit: Option<PathBuf>,

    /// Increase verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to rc file
    #[arg(long, default_value = "~/.sktrc", global = true)]
    pub rc: String,

    /// Save/read state from the 'state' section of the rc file
    #[arg(long, global = true)]
    pub state: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check out the base tree and apply the additional sources
    Merge(MergeArgs),
    /// Build the kernel package for each configured architecture
    Build(BuildArgs),
    /// Upload build artifacts to the configured destination
    Publish(PublishArgs),
    /// Submit and watch hardware test jobs
    Run(RunArgs),
    /// Emit the run report
    Report(ReportArgs),
    /// Drop run state and transient artifacts
    Cleanup,
    /// Run the whole pipeline
    All(AllArgs),
}

impl Command {
    /// Subcommand name, used for the junit document file name.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Merge(_) => "merge",
            Command::Build(_) => "build",
            Command::Publish(_) => "publish",
            Command::Run(_) => "run",
            Command::Report(_) => "report",
            Command::Cleanup => "cleanup",
            Command::All(_) => "all",
        }
    }
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct MergeArgs {
    /// Base repo URL
    #[arg(short = 'b', long)]
    pub baserepo: Option<String>,

    /// Base repo ref (default: master)
    #[arg(long = "ref")]
    pub reference: Option<String>,

    /// List of patch paths to apply
    #[arg(long, num_args = 1..)]
    pub patchlist: Vec<String>,

    /// Patchwork urls
    #[arg(long, num_args = 1..)]
    pub pw: Vec<String>,

    /// Merge ref format: 'url [ref]'
    #[arg(short = 'm', long = "merge-ref", num_args = 1..=2, action = ArgAction::Append, value_names = ["URL", "REF"])]
    pub merge_ref: Vec<Vec<String>>,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct BuildArgs {
    /// Path or URL of the kernel config to use
    #[arg(short = 'c', long)]
    pub baseconfig: Option<String>,

    /// How to process the default config (default: olddefconfig)
    #[arg(long)]
    pub cfgtype: Option<String>,

    /// Additional options to pass to make
    #[arg(long)]
    pub makeopts: Option<String>,

    /// Glob matching the config produced by 'make rh-configs'
    #[arg(long)]
    pub rh_configs_glob: Option<String>,

    /// Keep debug symbols in the built kernel
    #[arg(long)]
    pub enable_debuginfo: bool,

    /// LOCALVERSION suffix for the build
    #[arg(long)]
    pub localversion: Option<String>,

    /// Package format to build: targz (default) or rpm
    #[arg(long)]
    pub packaging: Option<String>,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct PublishArgs {
    /// Publisher config in 'type destination baseurl' format
    #[arg(short = 'p', long, num_args = 3, value_names = ["TYPE", "DESTINATION", "BASEURL"])]
    pub publisher: Option<Vec<String>>,

    /// Path to tar pkg to publish
    #[arg(long)]
    pub tarpkg: Option<String>,

    /// Path to accompanying buildinfo
    #[arg(long)]
    pub buildinfo: Option<String>,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Runner config in 'type {"key": "val", ...}' format
    #[arg(short = 'r', long, num_args = 2, value_names = ["TYPE", "OPTIONS"])]
    pub runner: Option<Vec<String>>,

    /// Build tarpkg url
    #[arg(long)]
    pub buildurl: Option<String>,

    /// Kernel release version of the build
    #[arg(long)]
    pub krelease: Option<String>,

    /// Do not exit until tests are finished
    #[arg(long)]
    pub wait: bool,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct ReportArgs {
    /// Reporter config in 'type {"key": "val", ...}' format
    #[arg(long, num_args = 2, value_names = ["TYPE", "OPTIONS"])]
    pub reporter: Option<Vec<String>>,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct AllArgs {
    #[command(flatten)]
    pub merge: MergeArgs,

    #[command(flatten)]
    pub build: BuildArgs,

    #[command(flatten)]
    pub publish: PublishArgs,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(flatten)]
    pub report: ReportArgs,
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_flags_parse() {
        let args = Args::parse_from([
            "kci",
            "--rc",
            "/tmp/rc",
            "--state",
            "merge",
            "-b",
            "git://example.org/linux.git",
            "--ref",
            "queue/4.17",
            "-m",
            "https://example.org/net.git",
            "net-next",
            "-m",
            "https://example.org/fixes.git",
            "--patchlist",
            "/tmp/a.patch",
            "/tmp/b.patch",
            "--pw",
            "https://pw.example.org/patch/42",
        ]);

        assert!(args.state);
        assert_eq!(args.rc, "/tmp/rc");
        let Command::Merge(merge) = args.command else {
            panic!("expected merge subcommand");
        };
        assert_eq!(merge.baserepo.as_deref(), Some("git://example.org/linux.git"));
        assert_eq!(merge.reference.as_deref(), Some("queue/4.17"));
        assert_eq!(
            merge.merge_ref,
            vec![
                vec!["https://example.org/net.git".to_string(), "net-next".to_string()],
                vec!["https://example.org/fixes.git".to_string()],
            ]
        );
        assert_eq!(merge.patchlist.len(), 2);
        assert_eq!(merge.pw.len(), 1);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from(["kci", "build", "-c", "/boot/config", "-w", "-d", "/tmp/kci"]);
        assert!(args.wipe);
        assert_eq!(args.workdir.as_deref(), Some(std::path::Path::new("/tmp/kci")));
    }

    #[test]
    fn test_run_descriptor_takes_two_values() {
        let args = Args::parse_from([
            "kci",
            "run",
            "-r",
            "beaker",
            r#"{"jobtemplate": "/etc/kci/job.xml"}"#,
            "--wait",
        ]);
        let Command::Run(run) = args.command else {
            panic!("expected run subcommand");
        };
        assert!(run.wait);
        let runner = run.runner.expect("runner");
        assert_eq!(runner[0], "beaker");
        assert!(runner[1].contains("jobtemplate"));
    }

    #[test]
    fn test_all_accepts_union_of_flags() {
        let args = Args::parse_from([
            "kci",
            "all",
            "-b",
            "git://example.org/linux.git",
            "-c",
            "/boot/config",
            "-p",
            "scp",
            "user@host:/srv",
            "https://artifacts.example.org",
            "--wait",
        ]);
        let Command::All(all) = args.command else {
            panic!("expected all subcommand");
        };
        assert!(all.run.wait);
        assert_eq!(all.publish.publisher.as_ref().map(Vec::len), Some(3));
    }
}
