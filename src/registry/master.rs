use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::command::{control_path, SshCommands};
use super::endpoint::{AuthPlan, ConnectionKey, Endpoint};
use super::RegistryConfig;
use crate::config::CopyMode;
use crate::error::{Result, ShellError};
use crate::pty_session::LaunchSpec;
use crate::shell::{CopyDirection, CopyFlags, IoMode, Secrets, SessionOptions, ShellSession};
use crate::supervisor::IdleSupervisor;

/// One authenticated connection per (host, user, family) that slave shells
/// and copy channels ride on.
///
/// Local endpoints have no master process; remote ones own an interactive
/// `ssh` login holding the control socket, unless connection sharing is off.
#[derive(Debug)]
pub struct MasterConnection {
    key: ConnectionKey,
    endpoint: Endpoint,
    auth: AuthPlan,
    commands: Option<SshCommands>,
    shell: Option<Arc<ShellSession>>,
    latency: Duration,
    config: RegistryConfig,
}

impl MasterConnection {
    pub(crate) fn connect(
        key: ConnectionKey,
        endpoint: Endpoint,
        auth: AuthPlan,
        config: &RegistryConfig,
        supervisor: &Arc<IdleSupervisor>,
    ) -> Result<Self> {
        let mut master = Self {
            key,
            endpoint,
            auth,
            commands: None,
            shell: None,
            latency: Duration::ZERO,
            config: config.clone(),
        };
        if !master.endpoint.family.is_remote() {
            debug!(key = %master.key, "local endpoint needs no master process");
            return Ok(master);
        }

        let socket = if config.connection_sharing {
            ensure_private_dir(&config.control_dir)?;
            Some(control_path(&config.control_dir, &master.auth.user, &master.endpoint))
        } else {
            None
        };
        let commands = SshCommands::new(&master.endpoint, &master.auth, socket, &config.term_value);
        if config.connection_sharing {
            let shell = ShellSession::spawn(
                commands.master_shell(),
                SessionOptions {
                    label: Some(format!("master {}", master.key)),
                    secrets: master.auth.secrets.clone(),
                    prompt: config.prompt,
                    supervisor: Some(Arc::clone(supervisor)),
                    idle_timeout: config.idle_timeout,
                    copy_mode: None,
                },
            )?;
            let started = Instant::now();
            let probe = shell.run_sync("true", IoMode::Ignore)?;
            if !probe.success() {
                return Err(ShellError::ConnectionFailed(format!(
                    "master {} cannot run commands (status {})",
                    master.key, probe.status
                )));
            }
            master.latency = started.elapsed();
            master.shell = Some(shell);
        }
        info!(
            key = %master.key,
            sharing = config.connection_sharing,
            latency_ms = master.latency.as_millis() as u64,
            "master connection ready"
        );
        master.commands = Some(commands);
        Ok(master)
    }

    #[must_use]
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Round-trip time of one `true` through the master shell; zero without one.
    #[must_use]
    pub fn latency(&self) -> Duration {
        self.latency
    }

    #[must_use]
    pub fn control_path(&self) -> Option<&Path> {
        self.commands.as_ref().and_then(SshCommands::control_path)
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.endpoint.family.is_remote()
    }

    /// Configured copy transport; a shell opened through an `scp://` or
    /// `sftp://` URL overrides it.
    #[must_use]
    pub fn copy_mode(&self) -> CopyMode {
        self.config.copy_mode
    }

    #[must_use]
    pub fn secrets(&self) -> &Secrets {
        &self.auth.secrets
    }

    /// The login shell holding the control socket, when there is one.
    #[must_use]
    pub fn shell(&self) -> Option<&Arc<ShellSession>> {
        self.shell.as_ref()
    }

    /// Count as activity on the master so it is not swept while slaves work.
    pub(crate) fn touch(&self) {
        if let Some(shell) = &self.shell {
            shell.touch();
        }
    }

    /// Whether the master can carry new slaves. A dead master is never revived
    /// in place; the registry replaces it with a fresh connection.
    pub(crate) fn is_alive(&self) -> bool {
        self.shell.as_ref().map_or(true, |shell| shell.alive(false))
    }

    fn remote_commands(&self) -> Result<&SshCommands> {
        self.commands.as_ref().ok_or_else(|| {
            ShellError::BadParameter(format!("{} is a local endpoint", self.key))
        })
    }

    /// Launch spec for a new interactive shell behind this connection.
    pub(crate) fn slave_spec(&self) -> Result<LaunchSpec> {
        match &self.commands {
            Some(commands) => Ok(commands.slave_shell()),
            None => Ok(LaunchSpec::from_command_line(&self.config.local_shell)?
                .term(self.config.term_value.clone())),
        }
    }

    pub(crate) fn sftp_spec(&self) -> Result<LaunchSpec> {
        Ok(self.remote_commands()?.sftp())
    }

    pub(crate) fn scp_spec(
        &self,
        direction: CopyDirection,
        local: &str,
        remote: &str,
        flags: CopyFlags,
    ) -> Result<LaunchSpec> {
        Ok(self.remote_commands()?.scp(direction, local, remote, flags))
    }

    pub(crate) fn session_options(&self, label: String, supervisor: &Arc<IdleSupervisor>) -> SessionOptions {
        SessionOptions {
            label: Some(label),
            secrets: self.auth.secrets.clone(),
            prompt: self.config.prompt,
            supervisor: Some(Arc::clone(supervisor)),
            idle_timeout: self.config.idle_timeout,
            copy_mode: None,
        }
    }

    /// Stop the master process; slaves riding it lose their transport.
    pub(crate) fn shutdown(&self) {
        if let Some(shell) = &self.shell {
            if let Err(err) = shell.finalize(true) {
                debug!(key = %self.key, error = %err, "master finalize reported an error");
            }
        }
    }
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|err| {
            ShellError::InvalidArgument(format!(
                "cannot create control directory {}: {err}",
                dir.display()
            ))
        })
}
