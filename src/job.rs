//! One configured invocation of a verification tool against one program.
//!
//! A job is built in two phases. Construction validates everything that
//! can fail before spawning: paths, limits, reserved flags, the working
//! directory, entry-point resolution and tool presence. Running then
//! executes the tool through the chosen backend and interprets its
//! output. Tool failures land inside the result; only cancellation and
//! infrastructure problems surface as errors.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analyser::{run_analysis, AnalysisResult};
use crate::backend::docker::DockerBackend;
use crate::backend::native::NativeBackend;
use crate::backend::{Backend, BackendSpec, ResourceLimits};
use crate::cancel::CancellationToken;
use crate::entry_point;
use crate::error::{ConfigError, JobError};
use crate::orchestrator::RunContext;
use crate::tools::{ToolInvocation, ToolKind};

/// File inside the working directory receiving the tool's combined
/// stdout/stderr.
pub const LOG_FILE_NAME: &str = "log.txt";

/// Environment variable the Mono runtime reads its GC options from.
const MONO_GC_PARAM: &str = "MONO_GC_PARAM";

/// Rule for choosing the procedure the tool starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryPointRule {
    /// Use this procedure name directly.
    Named(String),
    /// Scan the program for the first procedure carrying this boolean
    /// attribute.
    BoolAttribute(String),
}

/// Configuration for one job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub tool: ToolKind,
    /// Absolute path to the input program.
    pub program: PathBuf,
    /// Absolute path to the tool, in the backend's filesystem for
    /// container runs.
    pub tool_path: PathBuf,
    pub entry_point: EntryPointRule,
    pub limits: ResourceLimits,
    /// Extra tool arguments, inserted where the tool expects them.
    pub extra_args: Vec<String>,
    /// Complete environment for the tool; nothing is inherited.
    pub env: HashMap<String, String>,
    pub backend: BackendSpec,
    /// Copy the program into the working directory and run against the
    /// copy, for tools that write artifacts next to their input.
    pub copy_program_to_working_dir: bool,
    /// Launch the tool through this Mono runtime. `None` runs the tool
    /// binary directly.
    pub mono_path: Option<PathBuf>,
}

impl JobConfig {
    pub fn new(tool: ToolKind, program: impl Into<PathBuf>, tool_path: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            program: program.into(),
            tool_path: tool_path.into(),
            entry_point: EntryPointRule::Named("main".to_string()),
            limits: ResourceLimits::default(),
            extra_args: Vec::new(),
            env: HashMap::new(),
            backend: BackendSpec::default(),
            copy_program_to_working_dir: false,
            mono_path: None,
        }
    }

    pub fn with_entry_point(mut self, rule: EntryPointRule) -> Self {
        self.entry_point = rule;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_backend(mut self, backend: BackendSpec) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_copy_program(mut self, copy: bool) -> Self {
        self.copy_program_to_working_dir = copy;
        self
    }

    pub fn with_mono_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mono_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.program.is_absolute() {
            return Err(ConfigError::ProgramPathNotAbsolute(self.program.clone()));
        }
        if !self.program.is_file() {
            return Err(ConfigError::ProgramNotFound(self.program.clone()));
        }
        if !self.tool_path.is_absolute() {
            return Err(ConfigError::ToolPathNotAbsolute(self.tool_path.clone()));
        }
        if let Some(mono) = &self.mono_path {
            if !mono.is_absolute() {
                return Err(ConfigError::MonoPathNotAbsolute(mono.clone()));
            }
        }
        for reserved in self.tool.reserved_args() {
            if let Some(arg) = self
                .extra_args
                .iter()
                .find(|arg| arg.starts_with(reserved))
            {
                return Err(ConfigError::ReservedArgument {
                    tool: self.tool.name().to_string(),
                    arg: arg.clone(),
                });
            }
        }
        if let Some(grace) = self.tool.soft_timeout_grace() {
            match self.limits.time_limit {
                0 => {
                    return Err(ConfigError::UnlimitedTimeWithGrace {
                        tool: self.tool.name().to_string(),
                    })
                }
                hard if hard <= grace => {
                    return Err(ConfigError::SoftTimeoutTooSmall {
                        tool: self.tool.name().to_string(),
                        hard,
                        grace,
                    })
                }
                _ => {}
            }
        }
        if let BackendSpec::Native { poll_period_ms } = &self.backend {
            if *poll_period_ms == 0 {
                return Err(ConfigError::InvalidPollPeriod);
            }
        }
        Ok(())
    }

    /// Deadline handed to the tool itself: the hard limit minus the
    /// tool's grace period. Validation guarantees it is positive.
    fn soft_timeout(&self) -> Option<u64> {
        self.tool
            .soft_timeout_grace()
            .map(|grace| self.limits.time_limit - grace)
    }

    /// Mono caps its own heap when asked; no polling monitor is needed
    /// for tools running under it.
    fn heap_capped(&self) -> bool {
        self.mono_path.is_some() && self.tool.runs_on_mono() && self.limits.memory_limit_mib > 0
    }
}

/// A validated, ready-to-run unit of work.
pub struct Job {
    config: JobConfig,
    working_dir: PathBuf,
    log_file: PathBuf,
    entry_point: String,
    soft_timeout: Option<u64>,
    backend: Arc<dyn Backend>,
    cancel: CancellationToken,
    id: u64,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("working_dir", &self.working_dir)
            .field("log_file", &self.log_file)
            .field("entry_point", &self.entry_point)
            .field("soft_timeout", &self.soft_timeout)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Validates the configuration, claims the working directory,
    /// resolves the entry point, builds the backend and checks the tool
    /// is actually present — all before anything runs for the benchmark
    /// itself.
    pub async fn new(
        config: JobConfig,
        working_dir: PathBuf,
        ctx: &RunContext,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        check_working_dir(&working_dir)?;

        let log_file = working_dir.join(LOG_FILE_NAME);
        fs::File::create(&log_file)?;

        let entry_point = resolve_entry_point(&config)?;
        let soft_timeout = config.soft_timeout();
        let id = ctx.next_job_id();

        let backend: Arc<dyn Backend> = match &config.backend {
            BackendSpec::Native { poll_period_ms } => Arc::new(NativeBackend::new(
                working_dir.clone(),
                config.limits,
                Duration::from_millis(*poll_period_ms),
                config.heap_capped(),
            )),
            BackendSpec::Docker { image } => {
                let name = format!("{}-vb-{}-{}", config.tool.name(), std::process::id(), id);
                Arc::new(
                    DockerBackend::new(
                        image.clone(),
                        name,
                        &config.program,
                        working_dir.clone(),
                        config.limits,
                        ctx.tool_presence(),
                    )
                    .await?,
                )
            }
        };

        backend
            .verify_tool_present(&config.tool_path)
            .await
            .map_err(|err| ConfigError::ToolUnavailable {
                tool: config.tool_path.clone(),
                reason: err.to_string(),
            })?;

        debug!(
            job = id,
            tool = %config.tool,
            program = %config.program.display(),
            entry_point = %entry_point,
            "job ready"
        );
        Ok(Self {
            config,
            working_dir,
            log_file,
            entry_point,
            soft_timeout,
            backend,
            cancel,
            id,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn program(&self) -> &Path {
        &self.config.program
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Runs the tool once and interprets its output.
    pub async fn run(&self) -> Result<AnalysisResult, JobError> {
        let staged = self.stage_program()?.map(StagedCopy);
        let staged_path = staged.as_ref().map(|copy| copy.0.as_path());
        self.run_staged(staged_path).await
    }

    /// Stops the backend's process or container, if any. Idempotent.
    pub async fn kill(&self) {
        self.backend.kill().await
    }

    async fn run_staged(&self, staged: Option<&Path>) -> Result<AnalysisResult, JobError> {
        let program_on_host = staged.unwrap_or(&self.config.program);
        let program_arg = self.backend.resolve_path(program_on_host);
        let tool_arg = self.backend.resolve_path(&self.config.tool_path);

        let mut env = self.config.env.clone();
        if self.config.heap_capped() {
            env.insert(
                MONO_GC_PARAM.to_string(),
                format!("-max-heap-size={}m", self.config.limits.memory_limit_mib),
            );
        }

        let sbx_dir = matches!(self.config.tool, ToolKind::Symbooglix)
            .then(|| self.working_dir.join("sbx"));
        let output_dir = sbx_dir
            .as_ref()
            .map(|dir| self.backend.resolve_path(dir).display().to_string());
        let runtime = self
            .config
            .mono_path
            .as_ref()
            .filter(|_| self.config.tool.runs_on_mono())
            .map(|mono| mono.display().to_string());

        let invocation = ToolInvocation {
            tool_path: tool_arg.display().to_string(),
            runtime,
            program: program_arg.display().to_string(),
            entry_point: &self.entry_point,
            soft_timeout: self.soft_timeout,
            output_dir,
            extra_args: &self.config.extra_args,
        };
        let cmd_line = self.config.tool.command_line(&invocation);

        info!(
            job = self.id,
            tool = %self.config.tool,
            program = %self.config.program.display(),
            backend = self.backend.name(),
            "running job"
        );
        let backend_result = self
            .backend
            .run(&cmd_line, &self.log_file, &env, &self.cancel)
            .await?;
        debug!(job = self.id, ?backend_result, "backend finished");

        let mut result = AnalysisResult {
            program: self.config.program.clone(),
            total_time: backend_result.run_time,
            working_directory: self.working_dir.clone(),
            exit_code: backend_result.exit_code,
            out_of_memory: backend_result.out_of_memory,
            log_file: self.log_file.clone(),
            backend_timeout: backend_result.out_of_time,
            soft_timeout: self.soft_timeout.map(|secs| secs as f64),
            sbx_dir,
            bug_found: None,
            failed: false,
            timeout_hit: backend_result.out_of_time,
            extra: Default::default(),
        };
        run_analysis(self.config.tool, &mut result)?;
        info!(job = self.id, outcome = %result.outcome(), "job finished");
        Ok(result)
    }

    /// Copies the program into the working directory when configured,
    /// returning the copy's host path.
    fn stage_program(&self) -> Result<Option<PathBuf>, JobError> {
        if !self.config.copy_program_to_working_dir {
            return Ok(None);
        }
        let name = self
            .config
            .program
            .file_name()
            .ok_or_else(|| ConfigError::ProgramNotFound(self.config.program.clone()))?;
        let dest = self.working_dir.join(name);
        fs::copy(&self.config.program, &dest)?;
        debug!(job = self.id, copy = %dest.display(), "program staged into working directory");
        Ok(Some(dest))
    }
}

/// Deletes the staged program copy when dropped, so the copy never
/// survives the job, even when a panic unwinds out of the run.
struct StagedCopy(PathBuf);

impl Drop for StagedCopy {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.0) {
            warn!(copy = %self.0.display(), error = %err, "failed to remove staged program");
        }
    }
}

fn resolve_entry_point(config: &JobConfig) -> Result<String, ConfigError> {
    match &config.entry_point {
        EntryPointRule::Named(name) => Ok(name.clone()),
        EntryPointRule::BoolAttribute(attribute) => {
            entry_point::find_with_bool_attribute(attribute, &config.program)?.ok_or_else(|| {
                ConfigError::EntryPointNotFound {
                    program: config.program.clone(),
                    attribute: attribute.clone(),
                }
            })
        }
    }
}

/// The working directory must be an absolute path to an existing, empty
/// directory; jobs never share or reuse one.
fn check_working_dir(dir: &Path) -> Result<(), ConfigError> {
    let fail = |reason: &str| {
        Err(ConfigError::WorkingDirectory {
            path: dir.to_path_buf(),
            reason: reason.to_string(),
        })
    };
    if !dir.is_absolute() {
        return fail("must be absolute");
    }
    if !dir.is_dir() {
        return fail("does not exist or is not a directory");
    }
    if fs::read_dir(dir)?.next().is_some() {
        return fail("is not empty");
    }
    Ok(())
}
