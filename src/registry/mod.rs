//! Pooled master connections keyed by (host, user, family).
//!
//! The first caller for a key performs the handshake while holding that key's
//! slot lock; concurrent callers for the same key wait on the slot and reuse
//! the result. Callers for other keys only contend on the short-held map lock.

mod command;
mod endpoint;
mod master;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

pub use endpoint::{AuthPlan, ConnectionFamily, ConnectionKey, Credential, Endpoint};
pub use master::MasterConnection;

use crate::config::{CopyMode, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_TERM_VALUE};
use crate::error::Result;
use crate::lock::lock_or_recover;
use crate::shell::{
    run_one_shot, CopyDirection, CopyFlags, PromptConfig, SessionOptions, SftpChannel,
    ShellSession,
};
use crate::supervisor::IdleSupervisor;

/// Interactive shell used for local endpoints: an rc-less bash when present.
#[must_use]
pub fn default_local_shell() -> String {
    if Path::new("/bin/bash").exists() {
        "/bin/bash --norc --noprofile --noediting -i".to_string()
    } else {
        "/bin/sh -i".to_string()
    }
}

/// Per-user directory for ssh control sockets.
#[must_use]
pub fn default_control_dir() -> PathBuf {
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!("shellpool-{uid}"))
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub prompt: PromptConfig,
    /// Idle period before masters and sessions are finalized; zero disables.
    pub idle_timeout: Duration,
    pub copy_mode: CopyMode,
    /// Share one authenticated ssh master per key through a control socket.
    pub connection_sharing: bool,
    pub term_value: String,
    /// Command line for local shells.
    pub local_shell: String,
    pub control_dir: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prompt: PromptConfig::default(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            copy_mode: CopyMode::default(),
            connection_sharing: true,
            term_value: DEFAULT_TERM_VALUE.to_string(),
            local_shell: default_local_shell(),
            control_dir: default_control_dir(),
        }
    }
}

type Slot = Arc<Mutex<Option<Arc<MasterConnection>>>>;

/// Hands out shells and copy channels over shared master connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    config: RegistryConfig,
    supervisor: Arc<IdleSupervisor>,
    slots: Mutex<HashMap<ConnectionKey, Slot>>,
    handshakes: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig, supervisor: Arc<IdleSupervisor>) -> Self {
        Self {
            config,
            supervisor,
            slots: Mutex::new(HashMap::new()),
            handshakes: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<IdleSupervisor> {
        &self.supervisor
    }

    /// Find or establish the master connection for `url`.
    ///
    /// A live master is reused; a dead one is shut down and replaced by a new
    /// handshake.
    ///
    /// # Errors
    ///
    /// `BadParameter` for malformed URLs or unsupported schemes, plus whatever
    /// the master's prompt negotiation reports.
    pub fn initialize(&self, url: &str, credentials: &[Credential]) -> Result<Arc<MasterConnection>> {
        self.initialize_endpoint(Endpoint::parse(url)?, credentials)
    }

    fn initialize_endpoint(
        &self,
        endpoint: Endpoint,
        credentials: &[Credential],
    ) -> Result<Arc<MasterConnection>> {
        let auth = AuthPlan::resolve(&endpoint, credentials)?;
        let key = ConnectionKey::new(&endpoint, &auth.user);
        let slot = {
            let mut slots = lock_or_recover(&self.slots, "registry slots");
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let mut current = lock_or_recover(&slot, "registry slot");
        if let Some(master) = current.as_ref() {
            if master.is_alive() {
                debug!(key = %key, "reusing master connection");
                return Ok(Arc::clone(master));
            }
            warn!(key = %key, "master connection is dead; replacing it");
            master.shutdown();
            *current = None;
        }

        let master = Arc::new(MasterConnection::connect(
            key,
            endpoint,
            auth,
            &self.config,
            &self.supervisor,
        )?);
        self.handshakes.fetch_add(1, Ordering::AcqRel);
        *current = Some(Arc::clone(&master));
        Ok(master)
    }

    /// Start a shell riding `master`: a slave ssh session for remote endpoints,
    /// a fresh local shell otherwise.
    pub fn run_shell(&self, master: &Arc<MasterConnection>) -> Result<Arc<ShellSession>> {
        self.spawn_slave(master, None)
    }

    /// `initialize` followed by `run_shell`. An `scp://` or `sftp://` scheme
    /// also fixes how the shell's `copy_to`/`copy_from` move files.
    pub fn open_shell(&self, url: &str, credentials: &[Credential]) -> Result<Arc<ShellSession>> {
        let endpoint = Endpoint::parse(url)?;
        let copy_mode = endpoint.copy_mode;
        let master = self.initialize_endpoint(endpoint, credentials)?;
        self.spawn_slave(&master, copy_mode)
    }

    fn spawn_slave(
        &self,
        master: &Arc<MasterConnection>,
        copy_mode: Option<CopyMode>,
    ) -> Result<Arc<ShellSession>> {
        let launch = master.slave_spec()?;
        let options = SessionOptions {
            copy_mode,
            ..master.session_options(format!("shell {}", master.key()), &self.supervisor)
        };
        ShellSession::spawn_with_master(launch, options, Some(Arc::clone(master)))
    }

    /// An interactive `sftp` channel over `master`'s control socket.
    pub fn copy_channel(&self, master: &MasterConnection) -> Result<SftpChannel> {
        master.touch();
        SftpChannel::open(master.sftp_spec()?, master.secrets(), &self.config.prompt)
    }

    /// Run one `scp` over `master` and wait for it.
    pub fn one_shot_copy(
        &self,
        master: &MasterConnection,
        direction: CopyDirection,
        local: &str,
        remote: &str,
        flags: CopyFlags,
    ) -> Result<()> {
        master.touch();
        run_one_shot(master.scp_spec(direction, local, remote, flags)?, master.secrets())
    }

    #[must_use]
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<MasterConnection>> {
        let slot = lock_or_recover(&self.slots, "registry slots").get(key).cloned()?;
        let master = lock_or_recover(&slot, "registry slot").clone();
        master
    }

    /// Number of keys with an established master.
    #[must_use]
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = lock_or_recover(&self.slots, "registry slots")
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .filter(|slot| lock_or_recover(slot, "registry slot").is_some())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Masters established so far, replacements included.
    #[must_use]
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::Acquire)
    }

    /// Stop every master connection and forget them.
    pub fn shutdown(&self) {
        let slots: Vec<(ConnectionKey, Slot)> = lock_or_recover(&self.slots, "registry slots")
            .drain()
            .collect();
        for (key, slot) in slots {
            if let Some(master) = lock_or_recover(&slot, "registry slot").take() {
                debug!(key = %key, "shutting down master connection");
                master.shutdown();
            }
        }
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
