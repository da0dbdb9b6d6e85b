//! Backend that runs the tool inside a Docker container.
//!
//! Each run creates one fresh container from a pre-resolved image with
//! two bind mounts: the directory holding the input program (read-only)
//! and the job working directory (read-write, also the container's
//! working directory). Resource limits map onto the container's cgroup
//! settings, so no polling monitor is needed; the daemon reports memory
//! kills through the `OOMKilled` inspection flag.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::ListImagesOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{positive_secs, sleep_or_pending, Backend, BackendResult, ResourceLimits, ToolPresenceCache};
use crate::cancel::CancellationToken;
use crate::error::{BackendError, ConfigError};

/// Mount point of the input program's directory (read-only).
pub const PROGRAM_MOUNT: &str = "/data";
/// Mount point of the job working directory (read-write).
pub const WORK_MOUNT: &str = "/work";

struct RunState {
    container_id: Option<String>,
    log_file: Option<PathBuf>,
    oom_killed: bool,
}

/// One container-backed executor, bound to one job.
pub struct DockerBackend {
    docker: Docker,
    /// Canonical image id, resolved once at construction.
    image: String,
    /// Configured reference, kept for messages and the presence cache.
    image_ref: String,
    container_name: String,
    program_dir: PathBuf,
    working_dir: PathBuf,
    limits: ResourceLimits,
    tool_presence: ToolPresenceCache,
    state: Mutex<RunState>,
}

impl DockerBackend {
    /// Connects to the local daemon and resolves `image_ref` to exactly
    /// one image. Ambiguous or missing references are configuration
    /// errors; nothing may run against a guessed image.
    pub async fn new(
        image_ref: String,
        container_name: String,
        program: &Path,
        working_dir: PathBuf,
        limits: ResourceLimits,
        tool_presence: ToolPresenceCache,
    ) -> Result<Self, ConfigError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| ConfigError::DaemonUnavailable(err.to_string()))?;
        let image = resolve_image(&docker, &image_ref).await?;
        let program_dir = program
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ConfigError::ProgramNotFound(program.to_path_buf()))?;

        Ok(Self {
            docker,
            image,
            image_ref,
            container_name,
            program_dir,
            working_dir,
            limits,
            tool_presence,
            state: Mutex::new(RunState {
                container_id: None,
                log_file: None,
                oom_killed: false,
            }),
        })
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn resolve_path(&self, host_path: &Path) -> PathBuf {
        map_into_mounts(host_path, &self.program_dir, &self.working_dir)
    }

    async fn verify_tool_present(&self, tool_path: &Path) -> Result<(), BackendError> {
        {
            let cache = self.tool_presence.lock().await;
            if cache
                .get(&self.image_ref)
                .is_some_and(|tools| tools.contains(tool_path))
            {
                debug!(image = %self.image_ref, tool = %tool_path.display(), "tool presence cache hit");
                return Ok(());
            }
        }

        info!(image = %self.image_ref, tool = %tool_path.display(), "probing image for tool");
        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "test".to_string(),
                "-e".to_string(),
                tool_path.to_string_lossy().into_owned(),
            ]),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: format!("{}-probe", self.container_name),
            platform: None,
        };
        let created = self.docker.create_container(Some(options), config).await?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        let status = wait_exit_code(&self.docker, &created.id).await;
        remove_container(&self.docker, &created.id).await;

        match status? {
            0 => {
                let mut cache = self.tool_presence.lock().await;
                cache
                    .entry(self.image_ref.clone())
                    .or_default()
                    .insert(tool_path.to_path_buf());
                Ok(())
            }
            _ => Err(BackendError::ToolMissing {
                tool: tool_path.to_path_buf(),
                location: format!("image '{}'", self.image_ref),
            }),
        }
    }

    async fn run(
        &self,
        cmd_line: &[String],
        log_file: &Path,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<BackendResult, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        if cmd_line.is_empty() {
            return Err(BackendError::EmptyCommandLine);
        }
        // created eagerly: kill() appends the container logs to it
        std::fs::File::create(log_file)?;

        let memory = (self.limits.memory_limit_mib > 0).then(|| self.limits.memory_bytes());
        let host_config = HostConfig {
            binds: Some(vec![
                format!("{}:{}:ro", self.program_dir.display(), PROGRAM_MOUNT),
                format!("{}:{}:rw", self.working_dir.display(), WORK_MOUNT),
            ]),
            memory,
            // same value as `memory`: the limit covers swap too
            memory_swap: memory,
            ulimits: self.limits.stack_limit_kib.map(|kib| {
                let limit = stack_ulimit(kib);
                vec![ResourcesUlimits {
                    name: Some("stack".to_string()),
                    soft: Some(limit),
                    hard: Some(limit),
                }]
            }),
            ..Default::default()
        };
        let env_pairs: Vec<String> = env.iter().map(|(key, val)| format!("{key}={val}")).collect();
        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(cmd_line.to_vec()),
            env: (!env_pairs.is_empty()).then_some(env_pairs),
            working_dir: Some(WORK_MOUNT.to_string()),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            // keeps tools from block-buffering their output
            tty: Some(true),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: self.container_name.clone(),
            platform: None,
        };
        let created = self.docker.create_container(Some(options), config).await?;
        {
            let mut state = self.state.lock().await;
            state.container_id = Some(created.id.clone());
            state.log_file = Some(log_file.to_path_buf());
            state.oom_killed = false;
        }

        info!(container = %self.container_name, image = %self.image_ref, "starting container");
        let start = Instant::now();
        if let Err(err) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.kill().await;
            return Err(err.into());
        }

        enum Waited {
            Exited(Result<i64, BackendError>),
            TimedOut,
            Cancelled,
        }
        let waited = tokio::select! {
            code = wait_exit_code(&self.docker, &created.id) => Waited::Exited(code),
            _ = sleep_or_pending(self.limits.time_limit_duration()) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };
        let run_time = positive_secs(start.elapsed());

        // logs, OOM inspection and removal all happen in kill()
        self.kill().await;
        let out_of_memory = self.state.lock().await.oom_killed;

        match waited {
            Waited::Exited(code) => BackendResult::new(Some(code?), run_time, false, out_of_memory),
            Waited::TimedOut => {
                info!(container = %self.container_name, "wall-clock limit reached, container killed");
                BackendResult::new(None, run_time, true, out_of_memory)
            }
            Waited::Cancelled => {
                info!(container = %self.container_name, "run cancelled, container killed");
                Err(BackendError::Cancelled)
            }
        }
    }

    /// Fetches the container's logs, records whether the kernel OOM
    /// killer fired, and force-removes the container. Exactly-once: the
    /// container id is taken out of the shared state under the lock.
    async fn kill(&self) {
        let mut state = self.state.lock().await;
        let Some(id) = state.container_id.take() else {
            return;
        };

        match fetch_logs(&self.docker, &id).await {
            Ok(logs) => {
                if let Some(path) = &state.log_file {
                    if let Err(err) = append_to_log(path, &logs) {
                        warn!(error = %err, container = %id, "failed to write container logs");
                    }
                }
            }
            Err(err) => warn!(error = %err, container = %id, "failed to fetch container logs"),
        }

        match self
            .docker
            .inspect_container(&id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                state.oom_killed = info
                    .state
                    .and_then(|container| container.oom_killed)
                    .unwrap_or(false);
            }
            Err(err) => warn!(error = %err, container = %id, "failed to inspect container state"),
        }

        remove_container(&self.docker, &id).await;
        debug!(container = %id, "container cleaned up");
    }
}

/// Resolves an image reference to exactly one local image id.
async fn resolve_image(docker: &Docker, reference: &str) -> Result<String, ConfigError> {
    let mut filters = HashMap::new();
    filters.insert("reference".to_string(), vec![reference.to_string()]);
    let images = docker
        .list_images(Some(ListImagesOptions::<String> {
            filters,
            ..Default::default()
        }))
        .await
        .map_err(|err| ConfigError::DaemonUnavailable(err.to_string()))?;

    if images.len() != 1 {
        return Err(ConfigError::ImageResolution {
            reference: reference.to_string(),
            found: images.len(),
        });
    }
    Ok(images[0].id.clone())
}

/// Waits for the container to stop and extracts its exit code. The
/// daemon reports non-zero exits as a dedicated error variant rather
/// than a status, so both shapes map to a code here.
async fn wait_exit_code(docker: &Docker, id: &str) -> Result<i64, BackendError> {
    let options = WaitContainerOptions {
        condition: "not-running",
    };
    let mut stream = docker.wait_container(id, Some(options));
    match stream.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(err)) => Err(err.into()),
        None => Err(BackendError::InvalidResult(
            "container wait stream ended without a status".to_string(),
        )),
    }
}

async fn fetch_logs(docker: &Docker, id: &str) -> Result<String, BackendError> {
    let options = LogsOptions::<String> {
        stdout: true,
        stderr: true,
        ..Default::default()
    };
    let mut stream = docker.logs(id, Some(options));
    let mut output = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                output.push_str(&String::from_utf8_lossy(&message));
            }
            // tty-attached containers multiplex everything onto Console
            LogOutput::Console { message } => {
                output.push_str(&String::from_utf8_lossy(&message));
            }
            LogOutput::StdIn { .. } => {}
        }
    }
    Ok(output)
}

fn append_to_log(path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
    file.write_all(content.as_bytes())
}

async fn remove_container(docker: &Docker, id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    if let Err(err) = docker.remove_container(id, Some(options)).await {
        warn!(error = %err, container = %id, "failed to remove container");
    }
}

/// Docker ulimits are in bytes; 0 KiB means unlimited (-1).
fn stack_ulimit(kib: u64) -> i64 {
    if kib == 0 {
        -1
    } else {
        (kib as i64).saturating_mul(1024)
    }
}

/// Rewrites a host path under either mounted directory to its in-container
/// location. Paths outside both mounts pass through unchanged.
fn map_into_mounts(host_path: &Path, program_dir: &Path, working_dir: &Path) -> PathBuf {
    if let Ok(rest) = host_path.strip_prefix(working_dir) {
        return Path::new(WORK_MOUNT).join(rest);
    }
    if let Ok(rest) = host_path.strip_prefix(program_dir) {
        return Path::new(PROGRAM_MOUNT).join(rest);
    }
    host_path.to_path_buf()
}
