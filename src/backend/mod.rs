//! Execution backends: resource-limited tool invocation.
//!
//! A backend runs exactly one external command per call, redirects its
//! combined stdout/stderr to a log file, enforces the configured limits
//! and reports what happened as a [`BackendResult`]. Two backends exist:
//! [`native::NativeBackend`] runs the tool directly on the host and
//! [`docker::DockerBackend`] runs it inside a container.

pub mod docker;
pub mod native;
pub mod process;
mod procinfo;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cancel::CancellationToken;
use crate::error::BackendError;

/// Default period between resident-memory samples for the native backend.
pub const DEFAULT_POLL_PERIOD_MS: u64 = 500;

/// Per-image cache of tool-presence probes.
///
/// Probing a container image for a tool costs a full container round
/// trip, so the result is shared across every job of a run.
pub type ToolPresenceCache = Arc<Mutex<HashMap<String, HashSet<PathBuf>>>>;

/// Resource limits applied to one tool invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock limit in seconds. Zero means unlimited.
    pub time_limit: u64,
    /// Memory limit in MiB, covering the whole process tree. Zero means
    /// unlimited.
    pub memory_limit_mib: u64,
    /// Stack limit in KiB. `Some(0)` means unlimited; `None` leaves the
    /// inherited limit untouched.
    pub stack_limit_kib: Option<u64>,
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_limit_mib as i64).saturating_mul(1024 * 1024)
    }

    pub fn time_limit_duration(&self) -> Option<Duration> {
        (self.time_limit > 0).then(|| Duration::from_secs(self.time_limit))
    }
}

/// Backend selection plus backend-specific options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSpec {
    /// Run directly on the host.
    Native {
        /// Milliseconds between resident-memory samples.
        #[serde(default = "default_poll_period_ms")]
        poll_period_ms: u64,
    },
    /// Run inside a container created from `image`. The reference must
    /// match exactly one locally available image.
    Docker { image: String },
}

fn default_poll_period_ms() -> u64 {
    DEFAULT_POLL_PERIOD_MS
}

impl Default for BackendSpec {
    fn default() -> Self {
        BackendSpec::Native {
            poll_period_ms: DEFAULT_POLL_PERIOD_MS,
        }
    }
}

/// What happened when a backend ran a tool. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResult {
    /// Exit code of the tool. Negative values are the negated signal
    /// number for signal-killed processes. `None` exactly when the
    /// backend killed the tool for exceeding the wall-clock limit.
    pub exit_code: Option<i64>,
    /// Wall-clock runtime in seconds, always strictly positive.
    pub run_time: f64,
    /// The backend killed the tool because the wall-clock limit fired.
    pub out_of_time: bool,
    /// The tool was killed for exceeding the memory limit.
    pub out_of_memory: bool,
    /// CPU time in user mode, when the backend can observe it.
    pub user_cpu_time: Option<f64>,
    /// CPU time in kernel mode, when the backend can observe it.
    pub sys_cpu_time: Option<f64>,
}

impl BackendResult {
    /// Builds a result, rejecting combinations that violate the field
    /// invariants (non-positive runtime, or an exit code that disagrees
    /// with the timeout flag).
    pub fn new(
        exit_code: Option<i64>,
        run_time: f64,
        out_of_time: bool,
        out_of_memory: bool,
    ) -> Result<Self, BackendError> {
        if !(run_time > 0.0) {
            return Err(BackendError::InvalidResult(format!(
                "run_time must be positive, got {run_time}"
            )));
        }
        if exit_code.is_none() != out_of_time {
            return Err(BackendError::InvalidResult(format!(
                "exit_code {exit_code:?} inconsistent with out_of_time {out_of_time}"
            )));
        }
        Ok(Self {
            exit_code,
            run_time,
            out_of_time,
            out_of_memory,
            user_cpu_time: None,
            sys_cpu_time: None,
        })
    }

    pub fn with_cpu_times(mut self, user: Option<f64>, sys: Option<f64>) -> Self {
        self.user_cpu_time = user;
        self.sys_cpu_time = sys;
        self
    }
}

/// Capability surface shared by the native and container backends.
///
/// `kill` must be idempotent, callable from any task at any time, and
/// tolerate the process or container already being gone.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Maps a host path into the filesystem the tool sees at runtime.
    /// Identity for the native backend; the container backend rewrites
    /// paths that fall under its mounted directories.
    fn resolve_path(&self, host_path: &Path) -> PathBuf;

    /// Checks that `tool_path` exists in the environment the tool will
    /// run in, before anything is spawned for the benchmark itself.
    async fn verify_tool_present(&self, tool_path: &Path) -> Result<(), BackendError>;

    /// Runs `cmd_line` with stdout/stderr redirected to `log_file` and
    /// the environment replaced wholesale by `env`. Timeouts and memory
    /// kills surface through `BackendResult` fields; only cancellation
    /// and infrastructure problems produce an `Err`.
    async fn run(
        &self,
        cmd_line: &[String],
        log_file: &Path,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<BackendResult, BackendError>;

    /// Stops whatever the backend has running and cleans up.
    async fn kill(&self);
}

/// Sleeps for `limit` when set, otherwise never resolves. Lets a single
/// `select!` handle both limited and unlimited runs.
pub(crate) async fn sleep_or_pending(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Elapsed seconds clamped to a strictly positive value, so even an
/// instantly-exiting tool satisfies the runtime invariant.
pub(crate) fn positive_secs(elapsed: Duration) -> f64 {
    elapsed.max(Duration::from_nanos(1)).as_secs_f64()
}
