//! End-to-end tests driving the public API with stand-in tool scripts on
//! the native backend. Container runs need a Docker daemon and are
//! exercised separately.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use veribench::{
    BackendSpec, CancellationToken, Job, JobConfig, Orchestrator, Outcome, ProgramRecord,
    ResourceLimits, RunContext, RunState, ToolKind,
};

/// Writes an executable shell script posing as a verification tool.
fn fake_tool(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn sample_program(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("prog.bpl");
    fs::write(&path, "procedure {:entry_point} main(x : int);\n").unwrap();
    path
}

fn quick_poll(config: JobConfig) -> JobConfig {
    config.with_backend(BackendSpec::Native { poll_period_ms: 50 })
}

async fn build_job(
    config: JobConfig,
    ctx: &RunContext,
    cancel: &CancellationToken,
) -> (Job, TempDir) {
    let workdir = TempDir::new().unwrap();
    let job = Job::new(config, workdir.path().to_path_buf(), ctx, cancel.clone())
        .await
        .unwrap();
    (job, workdir)
}

#[tokio::test]
async fn bug_report_flows_from_log_to_outcome() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(
        &dir,
        "boogie.sh",
        "echo 'prog.bpl(2,3): Error BP5001: This assertion might not hold.'\n\
         echo 'Boogie program verifier finished with 3 verified, 1 error'",
    );

    let ctx = RunContext::new();
    let cancel = CancellationToken::new();
    let config = JobConfig::new(ToolKind::Boogie, sample_program(&dir), tool);
    let (job, workdir) = build_job(config, &ctx, &cancel).await;

    let result = job.run().await.unwrap();
    assert_eq!(result.bug_found, Some(true));
    assert!(!result.failed);
    assert!(!result.timeout_hit);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.outcome(), Outcome::BugFound);

    let log = fs::read_to_string(workdir.path().join("log.txt")).unwrap();
    assert!(log.contains("BP5001"));
}

#[tokio::test]
async fn clean_verification_is_fully_explored() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(
        &dir,
        "boogie.sh",
        "echo 'Boogie program verifier finished with 3 verified, 0 errors'",
    );

    let ctx = RunContext::new();
    let cancel = CancellationToken::new();
    let config = JobConfig::new(ToolKind::Boogie, sample_program(&dir), tool);
    let (job, _workdir) = build_job(config, &ctx, &cancel).await;

    let result = job.run().await.unwrap();
    assert_eq!(result.outcome(), Outcome::FullyExplored);
    assert!(result.total_time > 0.0);
}

#[tokio::test]
async fn wall_clock_kill_is_timed_out() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(&dir, "slow.sh", "sleep 30");

    let ctx = RunContext::new();
    let cancel = CancellationToken::new();
    let config = JobConfig::new(ToolKind::Boogie, sample_program(&dir), tool).with_limits(
        ResourceLimits {
            time_limit: 1,
            ..Default::default()
        },
    );
    let (job, _workdir) = build_job(config, &ctx, &cancel).await;

    let start = Instant::now();
    let result = job.run().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(15));

    assert_eq!(result.exit_code, None);
    assert!(result.backend_timeout);
    assert!(!result.failed);
    assert_eq!(result.outcome(), Outcome::TimedOut);
}

#[tokio::test]
async fn memory_monitor_kills_runaway_tool() {
    let dir = TempDir::new().unwrap();
    // tail of an endless stream accumulates memory without bound
    let tool = fake_tool(&dir, "hog.sh", "exec tail /dev/zero");

    let ctx = RunContext::new();
    let cancel = CancellationToken::new();
    let mut env = HashMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    let config = quick_poll(
        JobConfig::new(ToolKind::Boogie, sample_program(&dir), tool)
            .with_limits(ResourceLimits {
                time_limit: 60,
                memory_limit_mib: 64,
                ..Default::default()
            })
            .with_env(env),
    );
    let (job, _workdir) = build_job(config, &ctx, &cancel).await;

    let result = job.run().await.unwrap();
    assert!(result.out_of_memory);
    assert!(result.failed);
    assert!(!result.backend_timeout);
    assert_eq!(result.outcome(), Outcome::OutOfMemory);
}

#[tokio::test]
async fn staged_program_copy_never_outlives_the_job() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(
        &dir,
        "boogie.sh",
        "echo 'Boogie program verifier finished with 1 verified, 0 errors'",
    );

    let ctx = RunContext::new();
    let cancel = CancellationToken::new();
    let config =
        JobConfig::new(ToolKind::Boogie, sample_program(&dir), tool).with_copy_program(true);
    let (job, workdir) = build_job(config, &ctx, &cancel).await;

    let result = job.run().await.unwrap();
    assert_eq!(result.outcome(), Outcome::FullyExplored);

    // only the log remains; the staged copy is gone
    assert!(!workdir.path().join("prog.bpl").exists());
    assert!(workdir.path().join("log.txt").exists());
}

#[tokio::test]
async fn parallel_batch_collects_every_record() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(
        &dir,
        "boogie.sh",
        "echo 'Boogie program verifier finished with 1 verified, 0 errors'",
    );

    let ctx = RunContext::new();
    let cancel = CancellationToken::new();
    let mut jobs = Vec::new();
    let mut workdirs = Vec::new();
    for index in 0..4 {
        let program = dir.path().join(format!("prog-{index}.bpl"));
        fs::write(&program, "procedure {:entry_point} main(x : int);\n").unwrap();
        let config = JobConfig::new(ToolKind::Boogie, program, tool.clone());
        let (job, workdir) = build_job(config, &ctx, &cancel).await;
        jobs.push(job);
        workdirs.push(workdir);
    }

    let batch = Orchestrator::new(jobs, 2, cancel).unwrap().run().await;
    assert_eq!(batch.state, RunState::Completed);
    assert_eq!(batch.report.len(), 4);
    assert_eq!(batch.report.error_count(), 0);
    assert_eq!(batch.exit_code(), 0);
    for record in &batch.report.records {
        assert_eq!(record.outcome(), Some(Outcome::FullyExplored));
    }
}

#[tokio::test]
async fn cancellation_kills_in_flight_job_and_skips_the_rest() {
    let dir = TempDir::new().unwrap();
    let slow = fake_tool(&dir, "slow.sh", "sleep 30");

    let ctx = RunContext::new();
    let cancel = CancellationToken::new();
    let mut jobs = Vec::new();
    let mut workdirs = Vec::new();
    for index in 0..2 {
        let program = dir.path().join(format!("prog-{index}.bpl"));
        fs::write(&program, "procedure {:entry_point} main(x : int);\n").unwrap();
        let config = JobConfig::new(ToolKind::Boogie, program, slow.clone());
        let (job, workdir) = build_job(config, &ctx, &cancel).await;
        jobs.push(job);
        workdirs.push(workdir);
    }

    let orchestrator = Orchestrator::new(jobs, 1, cancel).unwrap();
    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });

    let start = Instant::now();
    let batch = orchestrator.run().await;
    assert!(start.elapsed() < Duration::from_secs(15));

    assert_eq!(batch.state, RunState::Cancelled);
    assert_eq!(batch.exit_code(), 2);
    // the in-flight job is recorded; the unstarted one never appears
    assert_eq!(batch.report.len(), 1);
    assert!(batch.report.records[0].is_error());
}

#[tokio::test]
async fn failing_job_becomes_an_error_record() {
    let dir = TempDir::new().unwrap();
    // exists, so presence checks pass, but is not executable
    let broken = dir.path().join("broken.sh");
    fs::write(&broken, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&broken, fs::Permissions::from_mode(0o644)).unwrap();

    let ctx = RunContext::new();
    let cancel = CancellationToken::new();
    let config = JobConfig::new(ToolKind::Boogie, sample_program(&dir), broken);
    let (job, _workdir) = build_job(config, &ctx, &cancel).await;

    let batch = Orchestrator::new(vec![job], 1, cancel).unwrap().run().await;
    assert_eq!(batch.state, RunState::Completed);
    assert_eq!(batch.report.error_count(), 1);
    assert_eq!(batch.exit_code(), 1);
    match &batch.report.records[0] {
        ProgramRecord::Error { error, .. } => assert!(error.contains("spawn")),
        other => panic!("expected an error record, got {other:?}"),
    }
}

#[tokio::test]
async fn report_round_trips_through_yaml() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let tool = fake_tool(
        &dir,
        "boogie.sh",
        "echo 'Boogie program verifier finished with 2 verified, 1 error'",
    );

    let ctx = RunContext::new();
    let cancel = CancellationToken::new();
    let config = JobConfig::new(ToolKind::Boogie, sample_program(&dir), tool);
    let (job, _workdir) = build_job(config, &ctx, &cancel).await;

    let batch = Orchestrator::new(vec![job], 1, cancel)?.run().await;
    let report_path = dir.path().join("report.yml");
    batch.report.write_yaml(&report_path)?;

    let written = fs::read_to_string(&report_path)?;
    assert!(written.contains("result: BUG_FOUND"));
    assert!(written.contains("prog.bpl"));

    // a second write must not clobber the first
    assert!(batch.report.write_yaml(&report_path).is_err());
    Ok(())
}
