//! Tests for pipeline construction, wiring and reaping

use std::io::{Read, Write};

use ricecoder_popen::{
    pipeline, pipeline_r, pipeline_r_with, pipeline_rw, pipeline_rw_with, pipeline_start,
    pipeline_start_with, pipeline_w, pipeline_w_with, Command, PopenError, ProcessGuard,
    Redirect,
};
use tempfile::TempDir;

#[test]
fn test_two_stage_transform() {
    // B(A(input)): drop every 'a', then count the remaining bytes
    let stages = [Command::new("tr").args(["-d", "a"]), Command::new("wc").arg("-c")];
    let mut pipeline = pipeline_rw(&stages).unwrap();

    pipeline.take_stdin().unwrap().write_all(b"banana\n").unwrap();
    let mut out = String::new();
    pipeline.take_stdout().unwrap().read_to_string(&mut out).unwrap();

    assert_eq!(out.trim(), "4");
    let statuses = pipeline.wait_all().unwrap();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.success()));
}

#[test]
fn test_three_stages_in_order() {
    let stages = [
        Command::new("tr").args(["a-z", "A-Z"]),
        Command::new("sort"),
        Command::new("uniq"),
    ];
    let ((), statuses) = pipeline_rw_with(&stages, |p| {
        p.take_stdin().unwrap().write_all(b"b\na\nb\n")?;
        let mut out = String::new();
        p.take_stdout().unwrap().read_to_string(&mut out)?;
        assert_eq!(out, "A\nB\n");
        Ok::<_, PopenError>(())
    })
    .unwrap();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.iter().all(|s| s.success()));
}

#[test]
fn test_early_exit_downstream_signals_upstream() {
    let stages = [Command::new("yes"), Command::new("head").args(["-n", "1"])];
    let mut pipeline = pipeline_r(&stages).unwrap();

    let mut out = String::new();
    pipeline.take_stdout().unwrap().read_to_string(&mut out).unwrap();
    assert_eq!(out, "y\n");

    let statuses = pipeline.wait_all().unwrap();
    assert_eq!(statuses[0].signal(), Some(libc::SIGPIPE));
    assert!(!statuses[0].success());
    assert!(statuses[1].success());
}

#[test]
fn test_failing_middle_stage_keeps_own_status() {
    let stages = [
        Command::new("echo").arg("x"),
        Command::shell("cat >/dev/null; exit 2"),
        Command::new("cat"),
    ];
    let (out, statuses) = pipeline_r_with(&stages, |p| {
        let mut out = Vec::new();
        p.take_stdout().unwrap().read_to_end(&mut out)?;
        Ok::<_, PopenError>(out)
    })
    .unwrap();
    assert!(out.is_empty());
    assert!(statuses[0].success());
    assert_eq!(statuses[1].code(), Some(2));
    assert!(statuses[2].success());
}

#[test]
fn test_pipeline_r_first_stage_reads_eof() {
    let stages = [Command::new("cat"), Command::new("wc").arg("-c")];
    let (count, _statuses) = pipeline_r_with(&stages, |p| {
        let mut out = String::new();
        p.stdout_mut().unwrap().read_to_string(&mut out)?;
        Ok::<_, PopenError>(out)
    })
    .unwrap();
    assert_eq!(count.trim(), "0");
}

#[test]
fn test_pipeline_with_file_redirects() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.txt");
    let output = dir.path().join("out.txt");
    std::fs::write(&input, "c\na\nb\n").unwrap();

    let stages = [
        Command::new("cat").stdin(Redirect::path(&input)),
        Command::new("sort").stdout(Redirect::path(&output)),
    ];
    let statuses = pipeline(&stages).unwrap();
    assert!(statuses.iter().all(|s| s.success()));
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "a\nb\nc\n");
}

#[test]
fn test_pipeline_w_into_file() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.txt");
    let stages = [
        Command::new("tr").args(["a-z", "A-Z"]),
        Command::new("cat").stdout(Redirect::path(&output)),
    ];
    let ((), statuses) = pipeline_w_with(&stages, |p| {
        assert!(p.stdout_mut().is_none());
        p.stdin_mut().unwrap().write_all(b"quiet\n")?;
        Ok::<_, PopenError>(())
    })
    .unwrap();
    assert!(statuses.iter().all(|s| s.success()));
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "QUIET\n");
}

#[test]
fn test_pipeline_w_closes_last_stdout() {
    let stages = [Command::new("cat")];
    let mut pipeline = pipeline_w(&stages).unwrap();
    assert!(pipeline.stdout_mut().is_none());
    assert!(pipeline.stdin_mut().is_some());
    let statuses = ProcessGuard::new(pipeline).finish().unwrap();
    assert!(statuses[0].success());
}

#[test]
fn test_pipeline_start_exposes_nothing() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.txt");
    let stages = [
        Command::new("echo").arg("hello").stdin(Redirect::Null),
        Command::new("tr")
            .args(["a-z", "A-Z"])
            .stdout(Redirect::path(&output)),
    ];
    let mut pipeline = pipeline_start(&stages).unwrap();
    assert!(pipeline.take_stdin().is_none());
    assert!(pipeline.take_stdout().is_none());
    assert_eq!(pipeline.pids().len(), 2);
    assert!(pipeline.wait_all().unwrap().iter().all(|s| s.success()));
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "HELLO\n");
}

#[test]
fn test_pipeline_start_with_reaps_after_block() {
    let stages = [
        Command::new("true").stdin(Redirect::Null),
        Command::new("true").stdout(Redirect::Null),
    ];
    let (pids, statuses) =
        pipeline_start_with(&stages, |p| Ok::<_, PopenError>(p.pids())).unwrap();
    assert_eq!(pids.len(), 2);
    assert_eq!(statuses.len(), 2);
}

#[test]
fn test_block_error_propagates_after_cleanup() {
    let stages = [Command::new("cat"), Command::new("cat")];
    let mut killers = Vec::new();
    let result: Result<((), _), PopenError> = pipeline_rw_with(&stages, |p| {
        killers = p.processes().iter().map(|h| h.killer()).collect();
        Err(PopenError::InvalidConfig("caller failure".to_string()))
    });
    assert!(matches!(result, Err(PopenError::InvalidConfig(_))));
    assert_eq!(killers.len(), 2);
    for killer in &killers {
        assert!(killer.is_reaped());
        assert!(killer.wait().unwrap().success());
    }
}

#[test]
fn test_per_stage_environment() {
    let stages = [
        Command::shell("echo $WORD").env("WORD", "first"),
        Command::shell("cat; echo $WORD").env("WORD", "second"),
    ];
    let (out, _) = pipeline_r_with(&stages, |p| {
        let mut out = String::new();
        p.take_stdout().unwrap().read_to_string(&mut out)?;
        Ok::<_, PopenError>(out)
    })
    .unwrap();
    assert_eq!(out, "first\nsecond\n");
}

#[test]
fn test_stage_stdout_override_feeds_null_downstream() {
    let stages = [
        Command::new("echo").arg("elsewhere").stdout(Redirect::Null),
        Command::new("wc").arg("-c"),
    ];
    let (out, _) = pipeline_r_with(&stages, |p| {
        let mut out = String::new();
        p.take_stdout().unwrap().read_to_string(&mut out)?;
        Ok::<_, PopenError>(out)
    })
    .unwrap();
    assert_eq!(out.trim(), "0");
}

#[test]
fn test_stage_stderr_merge_into_pipe() {
    let stages = [
        Command::shell("echo err 1>&2").stderr(Redirect::Merge),
        Command::new("tr").args(["a-z", "A-Z"]),
    ];
    let (out, _) = pipeline_r_with(&stages, |p| {
        let mut out = String::new();
        p.take_stdout().unwrap().read_to_string(&mut out)?;
        Ok::<_, PopenError>(out)
    })
    .unwrap();
    assert_eq!(out, "ERR\n");
}

#[test]
fn test_spawn_failure_mid_pipeline() {
    let stages = [
        Command::new("sleep").arg("10"),
        Command::new("nosuchcommand-ricecoder"),
    ];
    let err = pipeline_rw(&stages).unwrap_err();
    assert!(matches!(err, PopenError::Spawn { .. }));
}
