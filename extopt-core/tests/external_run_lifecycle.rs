//! Exercises `ExternalRun` against real (shell-script) subprocesses in a
//! throwaway directory, covering initialize/run/poll/retry and the
//! scheduler's dependency ordering across two chained runs.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::rc::Rc;
use std::time::Duration;

use extopt_core::run::{ExternalRun, FileLocation};
use extopt_core::scheduler::run_graph;
use extopt_core::graph::EvalGraph;

fn write_script(path: &std::path::Path, body: &str) {
    fs::write(path, body).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

#[test]
fn run_completes_and_produces_output() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("solve.sh");
    write_script(&script, "#!/bin/sh\necho 1.0 > result.txt\n");

    let work_dir = dir.path().join("run1");
    let mut run = ExternalRun::new(&work_dir, script.display().to_string());
    run.add_expected("result.txt");

    run.initialize().unwrap();
    run.run().unwrap();

    assert!(run.is_run());
    assert!(work_dir.join("result.txt").exists());
}

#[test]
fn run_retries_until_expected_file_appears() {
    let dir = tempfile::tempdir().unwrap();
    // Writes the marker only on the second invocation (counter file persists across retries).
    let script = dir.path().join("flaky.sh");
    write_script(
        &script,
        "#!/bin/sh\n\
         if [ -f tries.txt ]; then\n\
         echo done > result.txt\n\
         else\n\
         echo 1 > tries.txt\n\
         fi\n",
    );

    let work_dir = dir.path().join("run_flaky");
    let mut run = ExternalRun::new(&work_dir, script.display().to_string());
    run.add_expected("result.txt");
    run.set_max_tries(3);

    run.initialize().unwrap();
    for _ in 0..3 {
        run.run().unwrap();
        if run.is_run() {
            break;
        }
    }
    assert!(run.is_run());
}

#[test]
fn run_fails_after_exhausting_retries() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("never.sh");
    write_script(&script, "#!/bin/sh\ntrue\n");

    let work_dir = dir.path().join("run_never");
    let mut run = ExternalRun::new(&work_dir, script.display().to_string());
    run.add_expected("result.txt");
    run.set_max_tries(2);

    run.initialize().unwrap();
    let mut last_err = None;
    for _ in 0..4 {
        if let Err(e) = run.run() {
            last_err = Some(e);
            break;
        }
    }
    let err = last_err.expect("run should eventually exhaust its retries");
    assert!(err.to_string().contains("failed after"));
}

#[test]
fn scheduler_runs_chained_dependency_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let upstream_script = dir.path().join("upstream.sh");
    write_script(&upstream_script, "#!/bin/sh\necho up > up.txt\n");

    let downstream_script = dir.path().join("downstream.sh");
    write_script(
        &downstream_script,
        "#!/bin/sh\n\
         if [ -f ../upstream/up.txt ]; then\n\
         echo down > down.txt\n\
         fi\n",
    );

    let upstream = ExternalRun::new(dir.path().join("upstream"), upstream_script.display().to_string())
        .into_handle();
    upstream.borrow_mut().add_expected("up.txt");

    let downstream = ExternalRun::new(dir.path().join("downstream"), downstream_script.display().to_string())
        .into_handle();
    downstream.borrow_mut().add_expected("down.txt");

    let pipeline = vec![upstream.clone(), downstream.clone()];
    let graph = EvalGraph::build(&[pipeline]);
    let active = graph.nodes().into_iter().map(|n| (n, true)).collect();

    run_graph(&graph, active, Duration::from_millis(20)).unwrap();

    assert!(upstream.borrow().is_run());
    assert!(downstream.borrow().is_run());
    assert!(dir.path().join("downstream").join("down.txt").exists());
}

#[test]
fn add_data_auto_location_falls_back_to_relative_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let work_dir = dir.path().join("run_data");
    let mut run = ExternalRun::new(&work_dir, "true".to_string());
    // No such file exists anywhere: Auto must not error, just mark it relative.
    run.add_data("does-not-exist.dat", FileLocation::Auto).unwrap();
    let _ = Rc::new(run);
}
