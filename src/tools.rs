//! The closed set of supported verification tools.
//!
//! Each tool contributes its command-line shape, the flags it reserves
//! for the harness, the shutdown grace period it needs (if any) and the
//! analyser that interprets its output. Adding a tool means extending
//! [`ToolKind`] and every match below; the compiler enforces coverage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::analyser::boogie::BoogieAnalyser;
use crate::analyser::corral::CorralAnalyser;
use crate::analyser::symbooglix::SymbooglixAnalyser;
use crate::analyser::{AnalysisResult, Analyser};
use crate::error::{ConfigError, JobError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Boogie,
    Corral,
    Symbooglix,
}

/// Everything a tool needs to assemble one invocation. All paths are
/// already resolved into the backend's filesystem.
#[derive(Debug)]
pub struct ToolInvocation<'a> {
    pub tool_path: String,
    /// Runtime to launch the tool with, prepended when present.
    pub runtime: Option<String>,
    pub program: String,
    pub entry_point: &'a str,
    /// Deadline in seconds handed to tools that manage their own
    /// timeout.
    pub soft_timeout: Option<u64>,
    /// Directory for tool-produced artifacts, for tools that take one.
    pub output_dir: Option<String>,
    pub extra_args: &'a [String],
}

impl ToolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Boogie => "boogie",
            ToolKind::Corral => "corral",
            ToolKind::Symbooglix => "symbooglix",
        }
    }

    /// All currently supported tools ship as CIL assemblies and run on
    /// the Mono runtime.
    pub fn runs_on_mono(&self) -> bool {
        match self {
            ToolKind::Boogie | ToolKind::Corral | ToolKind::Symbooglix => true,
        }
    }

    /// Seconds reserved between the deadline handed to the tool and the
    /// hard wall-clock limit, so the tool can write its logs and shut
    /// down before the backend kills it.
    pub fn soft_timeout_grace(&self) -> Option<u64> {
        match self {
            ToolKind::Symbooglix => Some(180),
            ToolKind::Boogie | ToolKind::Corral => None,
        }
    }

    /// Flag prefixes owned by the harness. Configurations passing any of
    /// these as extra arguments are rejected up front.
    pub fn reserved_args(&self) -> &'static [&'static str] {
        match self {
            ToolKind::Boogie => &["/proc:"],
            ToolKind::Corral => &["/main:"],
            ToolKind::Symbooglix => &["--timeout=", "--output-dir=", "--entry-points="],
        }
    }

    /// Assembles the full command line for one invocation. Argument
    /// order follows what each tool expects.
    pub fn command_line(&self, inv: &ToolInvocation<'_>) -> Vec<String> {
        let mut cmd = Vec::new();
        if let Some(runtime) = &inv.runtime {
            cmd.push(runtime.clone());
        }
        cmd.push(inv.tool_path.clone());
        match self {
            ToolKind::Boogie => {
                cmd.push(format!("/proc:{}", inv.entry_point));
                cmd.extend(inv.extra_args.iter().cloned());
                cmd.push(inv.program.clone());
            }
            ToolKind::Corral => {
                cmd.push(inv.program.clone());
                cmd.push(format!("/main:{}", inv.entry_point));
                cmd.extend(inv.extra_args.iter().cloned());
            }
            ToolKind::Symbooglix => {
                cmd.extend(inv.extra_args.iter().cloned());
                if let Some(dir) = &inv.output_dir {
                    cmd.push(format!("--output-dir={dir}"));
                }
                cmd.push(format!("--entry-points={}", inv.entry_point));
                if let Some(soft) = inv.soft_timeout {
                    cmd.push(format!("--timeout={soft}"));
                }
                cmd.push(inv.program.clone());
            }
        }
        cmd
    }

    /// Builds the analyser matching this tool over a finished run.
    pub fn analyser<'a>(
        &self,
        result: &'a AnalysisResult,
    ) -> Result<Box<dyn Analyser + 'a>, JobError> {
        Ok(match self {
            ToolKind::Boogie => Box::new(BoogieAnalyser::new(result)),
            ToolKind::Corral => Box::new(CorralAnalyser::new(result)),
            ToolKind::Symbooglix => Box::new(SymbooglixAnalyser::new(result)?),
        })
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ToolKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "boogie" => Ok(ToolKind::Boogie),
            "corral" => Ok(ToolKind::Corral),
            "symbooglix" => Ok(ToolKind::Symbooglix),
            other => Err(ConfigError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation<'a>(extra: &'a [String]) -> ToolInvocation<'a> {
        ToolInvocation {
            tool_path: "/opt/tool.exe".to_string(),
            runtime: Some("mono".to_string()),
            program: "/data/prog.bpl".to_string(),
            entry_point: "main",
            soft_timeout: Some(720),
            output_dir: Some("/work/sbx".to_string()),
            extra_args: extra,
        }
    }

    #[test]
    fn test_boogie_command_line() {
        let extra = vec!["/errorLimit:1".to_string()];
        let cmd = ToolKind::Boogie.command_line(&invocation(&extra));
        assert_eq!(
            cmd,
            vec![
                "mono",
                "/opt/tool.exe",
                "/proc:main",
                "/errorLimit:1",
                "/data/prog.bpl",
            ]
        );
    }

    #[test]
    fn test_corral_command_line() {
        let extra = vec!["/recursionBound:4".to_string()];
        let cmd = ToolKind::Corral.command_line(&invocation(&extra));
        assert_eq!(
            cmd,
            vec![
                "mono",
                "/opt/tool.exe",
                "/data/prog.bpl",
                "/main:main",
                "/recursionBound:4",
            ]
        );
    }

    #[test]
    fn test_symbooglix_command_line() {
        let extra = vec!["--max-depth=100".to_string()];
        let cmd = ToolKind::Symbooglix.command_line(&invocation(&extra));
        assert_eq!(
            cmd,
            vec![
                "mono",
                "/opt/tool.exe",
                "--max-depth=100",
                "--output-dir=/work/sbx",
                "--entry-points=main",
                "--timeout=720",
                "/data/prog.bpl",
            ]
        );
    }

    #[test]
    fn test_runtime_is_optional() {
        let inv = ToolInvocation {
            runtime: None,
            ..invocation(&[])
        };
        let cmd = ToolKind::Boogie.command_line(&inv);
        assert_eq!(cmd[0], "/opt/tool.exe");
    }

    #[test]
    fn test_grace_periods() {
        assert_eq!(ToolKind::Boogie.soft_timeout_grace(), None);
        assert_eq!(ToolKind::Corral.soft_timeout_grace(), None);
        assert_eq!(ToolKind::Symbooglix.soft_timeout_grace(), Some(180));
    }

    #[test]
    fn test_parse_round_trip() {
        for tool in [ToolKind::Boogie, ToolKind::Corral, ToolKind::Symbooglix] {
            assert_eq!(tool.name().parse::<ToolKind>().unwrap(), tool);
        }
        assert!("cbmc".parse::<ToolKind>().is_err());
    }
}
