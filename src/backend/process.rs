//! Resource-limited child processes for the native backend.
//!
//! Spawns one external command with stdout/stderr redirected to a log
//! file, applies an optional stack limit in the child before the tool's
//! code runs, and optionally polls the resident memory of the whole
//! process tree, killing it when the limit is exceeded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{positive_secs, procinfo, sleep_or_pending, BackendResult};
use crate::cancel::CancellationToken;
use crate::error::BackendError;

/// Grace period between the polite SIGTERM and the forceful SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Memory enforcement strategy for a native run.
#[derive(Debug, Clone, Copy)]
pub enum MemoryEnforcement {
    /// No limit, or the limit is enforced elsewhere (e.g. a managed
    /// runtime heap cap passed through the environment).
    None,
    /// Sample resident memory of the process tree every `poll_period`
    /// and kill the tree when it exceeds `limit_mib`.
    Monitor {
        limit_mib: u64,
        poll_period: Duration,
    },
}

enum WaitOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// One resource-limited child process.
///
/// `kill` may be called from any task at any time, including while `run`
/// is waiting; the timeout path, the memory monitor and external
/// cancellation all funnel through the same tree-termination routine.
pub struct LimitedProcess {
    working_dir: PathBuf,
    time_limit: Option<Duration>,
    memory: MemoryEnforcement,
    stack_limit_kib: Option<u64>,
    pid: Arc<AtomicI32>,
    out_of_memory: Arc<AtomicBool>,
}

impl LimitedProcess {
    pub fn new(
        working_dir: PathBuf,
        time_limit: Option<Duration>,
        memory: MemoryEnforcement,
        stack_limit_kib: Option<u64>,
    ) -> Self {
        Self {
            working_dir,
            time_limit,
            memory,
            stack_limit_kib,
            pid: Arc::new(AtomicI32::new(0)),
            out_of_memory: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run(
        &self,
        cmd_line: &[String],
        log_file: &Path,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<BackendResult, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let program = cmd_line.first().ok_or(BackendError::EmptyCommandLine)?;
        self.out_of_memory.store(false, Ordering::SeqCst);

        let log = std::fs::File::create(log_file)?;
        let log_err = log.try_clone()?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(&cmd_line[1..])
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(kib) = self.stack_limit_kib {
            // runs in the forked child before exec; must not allocate
            unsafe {
                command.pre_exec(move || set_stack_limit(kib));
            }
        }

        debug!(?cmd_line, working_dir = %self.working_dir.display(), "spawning tool");
        let mut child = command.spawn().map_err(|source| BackendError::Spawn {
            command: program.clone(),
            source,
        })?;
        let pid = child.id().map(|raw| raw as i32).unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);

        let monitor = self.spawn_monitor(pid);
        let start = Instant::now();

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = sleep_or_pending(self.time_limit) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        let run_time = positive_secs(start.elapsed());
        // sweep on every path: stray children must not outlive the run
        self.stop(&mut child, monitor).await;

        let out_of_memory = self.out_of_memory.load(Ordering::SeqCst);
        match outcome {
            WaitOutcome::Exited(status) => {
                BackendResult::new(Some(exit_code_of(status?)), run_time, false, out_of_memory)
            }
            WaitOutcome::TimedOut => {
                info!(pid, limit = ?self.time_limit, "wall-clock limit reached, tool killed");
                BackendResult::new(None, run_time, true, out_of_memory)
            }
            WaitOutcome::Cancelled => {
                info!(pid, "run cancelled, tool killed");
                Err(BackendError::Cancelled)
            }
        }
    }

    /// Terminates the process tree if it is still alive. Idempotent.
    pub async fn kill(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid <= 0 || !procinfo::is_running(pid) {
            return;
        }
        terminate_tree(pid, TERMINATE_GRACE).await;
    }

    /// Kills the tree, reaps the child and shuts the monitor down.
    async fn stop(
        &self,
        child: &mut tokio::process::Child,
        monitor: Option<(Arc<Notify>, JoinHandle<()>)>,
    ) {
        self.kill().await;
        let _ = child.wait().await;
        if let Some((stop, handle)) = monitor {
            stop.notify_waiters();
            let _ = handle.await;
        }
        self.pid.store(0, Ordering::SeqCst);
    }

    fn spawn_monitor(&self, pid: i32) -> Option<(Arc<Notify>, JoinHandle<()>)> {
        let MemoryEnforcement::Monitor {
            limit_mib,
            poll_period,
        } = self.memory
        else {
            return None;
        };
        let stop = Arc::new(Notify::new());
        let stop_rx = Arc::clone(&stop);
        let flag = Arc::clone(&self.out_of_memory);

        let handle = tokio::spawn(async move {
            debug!(pid, limit_mib, period = ?poll_period, "memory monitor started");
            loop {
                tokio::select! {
                    _ = stop_rx.notified() => break,
                    _ = tokio::time::sleep(poll_period) => {}
                }
                if !procinfo::is_running(pid) {
                    break;
                }
                let Some(usage_mib) = procinfo::tree_rss_mib(pid) else {
                    warn!(pid, "memory monitor could not sample the process tree");
                    break;
                };
                debug!(pid, usage_mib, "sampled process tree");
                if usage_mib > limit_mib as f64 {
                    warn!(pid, usage_mib, limit_mib, "memory limit exceeded, killing tool");
                    flag.store(true, Ordering::SeqCst);
                    terminate_tree(pid, TERMINATE_GRACE).await;
                    break;
                }
            }
            debug!(pid, "memory monitor stopped");
        });
        Some((stop, handle))
    }
}

/// Polite SIGTERM to the process and its recursively discovered children,
/// a bounded grace period, then SIGKILL to the re-discovered tree. The
/// second discovery pass catches children forked during the grace period.
pub(crate) async fn terminate_tree(pid: i32, grace: Duration) {
    debug!(pid, "terminating process tree");
    let children = procinfo::descendants(pid);
    signal_tree(pid, &children, Signal::SIGTERM);

    if !grace.is_zero() && procinfo::is_running(pid) {
        tokio::time::sleep(grace).await;
    }

    let children = procinfo::descendants(pid);
    signal_tree(pid, &children, Signal::SIGKILL);
}

fn signal_tree(pid: i32, children: &[i32], signal: Signal) {
    // "no such process" races are expected here
    let _ = kill(Pid::from_raw(pid), signal);
    for &child in children {
        let _ = kill(Pid::from_raw(child), signal);
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .map(i64::from)
        .or_else(|| status.signal().map(|sig| -i64::from(sig)))
        .unwrap_or(-1)
}

/// Runs in the forked child before exec. `kib == 0` lifts the limit.
fn set_stack_limit(kib: u64) -> std::io::Result<()> {
    let limit = if kib == 0 {
        libc::RLIM_INFINITY
    } else {
        kib.saturating_mul(1024) as libc::rlim_t
    };
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_STACK, &rlim) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
