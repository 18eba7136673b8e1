//! Pseudo-terminal shell sessions with idle supervision and pooled, connection-sharing masters.

pub mod config;
pub mod error;
pub mod lifecycle;
mod lock;
mod process_signal;
pub mod pty_session;
pub mod registry;
pub mod shell;
pub mod supervisor;
pub mod telemetry;

pub use config::{AppConfig, CopyMode};
pub use error::{classify_diagnostic, Result, ShellError};
pub use lifecycle::Lifecycle;
pub use pty_session::{ExitReason, LaunchSpec, PtyProcess, Timeout};
pub use registry::{ConnectionFamily, ConnectionKey, ConnectionRegistry, Credential, MasterConnection, RegistryConfig};
pub use shell::{
    CommandOutput, CopyDirection, CopyFlags, IoMode, PromptConfig, Secrets, SessionOptions,
    ShellSession,
};
pub use supervisor::{ActivityScope, IdleSupervisor, SupervisorConfig};
