//! Runtime configuration shared by the CLI and embedding callers.
//!
//! `AppConfig` is the clap surface (flags with `SHELLPOOL_*` env fallbacks). The
//! library itself only consumes the plain structs derived from it, so embedding
//! code can build those directly without going through argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{Result, ShellError};
use crate::registry::RegistryConfig;
use crate::shell::PromptConfig;
use crate::supervisor::SupervisorConfig;

pub const DEFAULT_PROMPT_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_POLL_WINDOW_MS: u64 = 500;
pub const DEFAULT_TRIGGER_RETRIES: u32 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_TERM_VALUE: &str = "dumb";

/// How bulk file copies reach a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum CopyMode {
    /// Interactive `sftp` batch channel reused across transfers.
    #[default]
    Sftp,
    /// One `scp` process per transfer; the transferred-file list is not recoverable.
    Scp,
}

impl std::fmt::Display for CopyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CopyMode::Sftp => "sftp",
            CopyMode::Scp => "scp",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Parser, Clone)]
pub struct AppConfig {
    /// Overall deadline for prompt negotiation and prompt changes (seconds)
    #[arg(
        long = "prompt-timeout",
        env = "SHELLPOOL_PROMPT_TIMEOUT",
        default_value_t = DEFAULT_PROMPT_TIMEOUT_SECS
    )]
    pub prompt_timeout_secs: f64,

    /// Quiet window before a synchronization trigger is sent (ms)
    #[arg(
        long = "poll-window-ms",
        env = "SHELLPOOL_POLL_WINDOW_MS",
        default_value_t = DEFAULT_POLL_WINDOW_MS
    )]
    pub poll_window_ms: u64,

    /// Maximum synchronization triggers sent while negotiating a prompt
    #[arg(long = "trigger-retries", default_value_t = DEFAULT_TRIGGER_RETRIES)]
    pub trigger_retries: u32,

    /// Idle time after which master connections and sessions are finalized (seconds)
    #[arg(
        long = "idle-timeout",
        env = "SHELLPOOL_IDLE_TIMEOUT",
        default_value_t = DEFAULT_IDLE_TIMEOUT_SECS
    )]
    pub idle_timeout_secs: u64,

    /// Interval between idle sweeps (seconds)
    #[arg(long = "sweep-interval", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,

    /// Initialize attempts per revival of an idle-finalized object
    #[arg(long = "revive-attempts", default_value_t = 1)]
    pub revive_attempts: u32,

    /// Copy mechanism for remote file transfers
    #[arg(long = "copy-mode", env = "SHELLPOOL_COPY_MODE", value_enum, default_value_t = CopyMode::Sftp)]
    pub copy_mode: CopyMode,

    /// Disable ssh connection sharing (every session authenticates on its own)
    #[arg(long = "no-connection-sharing", default_value_t = false)]
    pub no_connection_sharing: bool,

    /// Command used for local shells (defaults to an rc-less interactive bash or sh)
    #[arg(long = "local-shell", env = "SHELLPOOL_LOCAL_SHELL")]
    pub local_shell: Option<String>,

    /// Directory for ssh control sockets (defaults to $TMPDIR/shellpool-<uid>)
    #[arg(long = "control-dir", env = "SHELLPOOL_CONTROL_DIR")]
    pub control_dir: Option<PathBuf>,

    /// TERM value exported to spawned programs
    #[arg(long = "term", env = "SHELLPOOL_TERM", default_value = DEFAULT_TERM_VALUE)]
    pub term_value: String,

    /// Enable tracing output
    #[arg(long = "logs", default_value_t = false)]
    pub logs: bool,

    /// Tracing filter directive used when logs are enabled (e.g. `debug`, `shellpool=trace`)
    #[arg(long = "log-level", env = "SHELLPOOL_LOG", default_value = "info")]
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig::parse_from(["shellpool"])
    }
}

impl AppConfig {
    /// Reject settings that would make every wait degenerate.
    pub fn validated(self) -> Result<Self> {
        if !self.prompt_timeout_secs.is_finite() || self.prompt_timeout_secs <= 0.0 {
            return Err(ShellError::InvalidArgument(format!(
                "--prompt-timeout must be positive, got {}",
                self.prompt_timeout_secs
            )));
        }
        if self.poll_window_ms == 0 {
            return Err(ShellError::InvalidArgument(
                "--poll-window-ms must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ShellError::InvalidArgument(
                "--sweep-interval must be greater than zero".to_string(),
            ));
        }
        if self.revive_attempts == 0 {
            return Err(ShellError::InvalidArgument(
                "--revive-attempts must be at least 1".to_string(),
            ));
        }
        if let Some(shell) = &self.local_shell {
            if shell.trim().is_empty() {
                return Err(ShellError::InvalidArgument(
                    "--local-shell must not be empty".to_string(),
                ));
            }
        }
        Ok(self)
    }

    #[must_use]
    pub fn prompt_config(&self) -> PromptConfig {
        PromptConfig {
            timeout: Duration::from_secs_f64(self.prompt_timeout_secs),
            poll_window: Duration::from_millis(self.poll_window_ms),
            max_triggers: self.trigger_retries,
        }
    }

    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            revive_attempts: self.revive_attempts,
        }
    }

    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        let mut config = RegistryConfig {
            prompt: self.prompt_config(),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            copy_mode: self.copy_mode,
            connection_sharing: !self.no_connection_sharing,
            term_value: self.term_value.clone(),
            ..RegistryConfig::default()
        };
        if let Some(shell) = &self.local_shell {
            config.local_shell = shell.clone();
        }
        if let Some(dir) = &self.control_dir {
            config.control_dir = dir.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_and_validate() {
        let config = AppConfig::default().validated().expect("defaults are valid");
        assert_eq!(config.copy_mode, CopyMode::Sftp);
        assert!(!config.no_connection_sharing);
        assert_eq!(config.term_value, DEFAULT_TERM_VALUE);
        assert_eq!(config.prompt_config().max_triggers, DEFAULT_TRIGGER_RETRIES);
    }

    #[test]
    fn flags_flow_into_derived_configs() {
        let config = AppConfig::parse_from([
            "shellpool",
            "--prompt-timeout",
            "2.5",
            "--copy-mode",
            "scp",
            "--no-connection-sharing",
            "--local-shell",
            "/bin/sh -i",
            "--control-dir",
            "/tmp/sp-ctl",
            "--idle-timeout",
            "7",
        ]);
        let registry = config.registry_config();
        assert_eq!(registry.prompt.timeout, Duration::from_millis(2500));
        assert_eq!(registry.copy_mode, CopyMode::Scp);
        assert!(!registry.connection_sharing);
        assert_eq!(registry.local_shell, "/bin/sh -i");
        assert_eq!(registry.control_dir, PathBuf::from("/tmp/sp-ctl"));
        assert_eq!(registry.idle_timeout, Duration::from_secs(7));
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let mut config = AppConfig::default();
        config.prompt_timeout_secs = 0.0;
        assert!(matches!(
            config.validated(),
            Err(ShellError::InvalidArgument(_))
        ));

        let mut config = AppConfig::default();
        config.local_shell = Some("   ".to_string());
        assert!(config.validated().is_err());

        let mut config = AppConfig::default();
        config.revive_attempts = 0;
        assert!(config.validated().is_err());
    }
}
