//! Backend that runs the tool directly on the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::process::{LimitedProcess, MemoryEnforcement};
use super::{Backend, BackendResult, ResourceLimits};
use crate::cancel::CancellationToken;
use crate::error::BackendError;

/// Runs tools as ordinary host processes under a wall-clock limit, an
/// optional polled memory limit and an optional stack rlimit.
pub struct NativeBackend {
    process: LimitedProcess,
}

impl NativeBackend {
    /// `heap_capped` marks tools whose managed runtime enforces the
    /// memory limit itself (configured through the environment by the
    /// caller); for those no polling monitor is started.
    pub fn new(
        working_dir: PathBuf,
        limits: ResourceLimits,
        poll_period: Duration,
        heap_capped: bool,
    ) -> Self {
        let memory = if limits.memory_limit_mib == 0 || heap_capped {
            MemoryEnforcement::None
        } else {
            MemoryEnforcement::Monitor {
                limit_mib: limits.memory_limit_mib,
                poll_period,
            }
        };
        Self {
            process: LimitedProcess::new(
                working_dir,
                limits.time_limit_duration(),
                memory,
                limits.stack_limit_kib,
            ),
        }
    }
}

#[async_trait]
impl Backend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn resolve_path(&self, host_path: &Path) -> PathBuf {
        host_path.to_path_buf()
    }

    async fn verify_tool_present(&self, tool_path: &Path) -> Result<(), BackendError> {
        if tool_path.exists() {
            Ok(())
        } else {
            Err(BackendError::ToolMissing {
                tool: tool_path.to_path_buf(),
                location: "host filesystem".to_string(),
            })
        }
    }

    async fn run(
        &self,
        cmd_line: &[String],
        log_file: &Path,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<BackendResult, BackendError> {
        self.process.run(cmd_line, log_file, env, cancel).await
    }

    async fn kill(&self) {
        self.process.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_paths_resolve_to_themselves() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(
            dir.path().to_path_buf(),
            ResourceLimits::default(),
            Duration::from_millis(100),
            false,
        );
        let path = Path::new("/usr/local/bin/verifier");
        assert_eq!(backend.resolve_path(path), path);
    }

    #[tokio::test]
    async fn test_verify_tool_present() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(
            dir.path().to_path_buf(),
            ResourceLimits::default(),
            Duration::from_millis(100),
            false,
        );

        backend
            .verify_tool_present(Path::new("/bin/sh"))
            .await
            .unwrap();

        let err = backend
            .verify_tool_present(Path::new("/no/such/tool"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ToolMissing { .. }));
    }
}
