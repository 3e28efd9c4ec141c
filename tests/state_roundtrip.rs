//! End-to-end behavior of the rc-file state layer: persistence round-trip,
//! resume, and cleanup postconditions.

use clap::Parser;
use kci::cli::args::Args;
use kci::utils::state::{ArchData, RunState, StateStore};

fn full_state() -> RunState {
    let mut state = RunState {
        baserepo: Some("git://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git".to_string()),
        basehead: Some("2f47e7e14e21".to_string()),
        commitdate: Some(1527000000),
        mergerepos: vec!["https://git.example.org/net.git".to_string()],
        mergeheads: vec!["77aa11cc33".to_string()],
        localpatches: vec!["/tmp/0001-fix.patch".to_string()],
        patchworks: vec!["https://patchwork.example.org/patch/42".to_string()],
        workdir: Some("/srv/kci/run1".to_string()),
        buildinfo: Some("/srv/kci/run1/77aa11cc33.csv".to_string()),
        buildhead: Some("77aa11cc33".to_string()),
        uid: Some("[git] [local patch] [patchwork]".to_string()),
        krelease: Some("4.17.0-rc6+".to_string()),
        infourl: Some("https://artifacts.example.org/77aa11cc33.csv".to_string()),
        jobs: vec!["J:123456".to_string(), "J:123457".to_string()],
        mfhost: Some("host1.example.org".to_string()),
        mfarch: Some("x86_64".to_string()),
        retcode: Some(1),
        baseretcode: Some(0),
        ..RunState::default()
    };
    state.archdata.insert(
        "x86_64".to_string(),
        ArchData {
            tarpkg: Some("/srv/kci/run1/77aa11cc33_x86_64.tar.gz".to_string()),
            buildconf: Some("/srv/kci/run1/77aa11cc33_x86_64.config".to_string()),
            buildurl: Some("https://artifacts.example.org/77aa11cc33_x86_64.tar.gz".to_string()),
            cfgurl: Some("https://artifacts.example.org/77aa11cc33_x86_64.config".to_string()),
            buildlog: None,
        },
    );
    state.archdata.insert(
        "s390x".to_string(),
        ArchData {
            buildlog: Some("/srv/kci/run1/build_s390x/build.log".to_string()),
            ..ArchData::default()
        },
    );
    state
}

#[test]
fn state_round_trips_through_rc_file() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let rc = dir.path().join("rc");
    std::fs::write(&rc, "[config]\nbaserepo = git://example.org/linux.git\n").expect("seed rc");

    let store = StateStore::new(&rc, true);
    let state = full_state();
    store.persist(&state).expect("persist");

    // The round-trip law: reloading yields exactly what was persisted.
    let reloaded = store.load_state().expect("load");
    assert_eq!(state, reloaded);

    // And the file keeps the legacy flat key shape.
    let content = std::fs::read_to_string(&rc).expect("read rc");
    assert!(content.contains("jobid_00"));
    assert!(content.contains("jobid_01"));
    assert!(content.contains("mergerepo_00"));
    assert!(content.contains("tarpkg_x86_64"));
    assert!(content.contains("buildlog_s390x"));
}

#[test]
fn resume_sees_merge_results_through_cli_load() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let rc = dir.path().join("rc");
    std::fs::write(&rc, "").expect("seed rc");

    // A merge run persisted its state, then the process died.
    let store = StateStore::new(&rc, true);
    let state = full_state();
    store.persist(&state).expect("persist");

    // A fresh `build --state` invocation reconstructs the run context.
    let rc_arg = rc.display().to_string();
    let args = Args::parse_from(["kci", "--rc", &rc_arg, "--state", "build"]);
    let ctx = kci::cli::config::load(&args).expect("load");

    assert_eq!(ctx.state.workdir.as_deref(), Some("/srv/kci/run1"));
    assert_eq!(ctx.state.buildhead.as_deref(), Some("77aa11cc33"));
    assert_eq!(
        ctx.state.buildinfo.as_deref(),
        Some("/srv/kci/run1/77aa11cc33.csv")
    );
    assert_eq!(ctx.state.uid.as_deref(), Some("[git] [local patch] [patchwork]"));
}

#[test]
fn cleanup_leaves_no_state_section() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let rc = dir.path().join("rc");
    std::fs::write(&rc, "[config]\nwait = true\n").expect("seed rc");

    let store = StateStore::new(&rc, true);
    store.persist(&full_state()).expect("persist");
    store.cleanup().expect("cleanup");

    let content = std::fs::read_to_string(&rc).expect("read rc");
    assert!(!content.contains("[state]"));
    assert!(!content.contains("jobid_00"));
    // Config defaults survive.
    assert!(content.contains("[config]"));

    // Reloading after cleanup yields an empty state.
    assert_eq!(store.load_state().expect("load"), RunState::default());
}
