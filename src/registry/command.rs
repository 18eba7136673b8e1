//! Launch templates for the ssh family of programs.

use std::path::{Path, PathBuf};

use super::endpoint::{AuthPlan, ConnectionFamily, Endpoint};
use crate::pty_session::LaunchSpec;
use crate::shell::{CopyDirection, CopyFlags};

const DEFAULT_SSH_PORT: u16 = 22;

/// Socket shared by a master and its slaves.
pub(crate) fn control_path(dir: &Path, user: &str, endpoint: &Endpoint) -> PathBuf {
    let port = endpoint.port.unwrap_or(DEFAULT_SSH_PORT);
    dir.join(format!("{user}@{}:{port}", endpoint.host))
}

/// Everything needed to build ssh, sftp and scp command lines for one endpoint.
#[derive(Debug, Clone)]
pub(crate) struct SshCommands {
    family: ConnectionFamily,
    host: String,
    port: Option<u16>,
    user: String,
    identity: Option<PathBuf>,
    proxy: Option<PathBuf>,
    control_path: Option<PathBuf>,
    term: String,
}

impl SshCommands {
    /// `control_path` is `None` when connection sharing is off; every program
    /// then authenticates on its own.
    pub(crate) fn new(
        endpoint: &Endpoint,
        auth: &AuthPlan,
        control_path: Option<PathBuf>,
        term: &str,
    ) -> Self {
        Self {
            family: endpoint.family,
            host: endpoint.host.clone(),
            port: endpoint.port,
            user: auth.user.clone(),
            identity: auth.identity.clone(),
            proxy: auth.proxy.clone(),
            control_path,
            term: term.to_string(),
        }
    }

    pub(crate) fn control_path(&self) -> Option<&Path> {
        self.control_path.as_deref()
    }

    fn launch(&self, argv: Vec<String>) -> LaunchSpec {
        let spec = LaunchSpec::new(argv).term(self.term.clone());
        match &self.proxy {
            Some(proxy) => spec.env("X509_USER_PROXY", proxy.display().to_string()),
            None => spec,
        }
    }

    fn sharing_options(&self, argv: &mut Vec<String>, master: bool) {
        let Some(path) = &self.control_path else {
            return;
        };
        let mode = if master { "yes" } else { "no" };
        argv.extend([
            "-o".to_string(),
            format!("ControlMaster={mode}"),
            "-o".to_string(),
            format!("ControlPath={}", path.display()),
        ]);
        if master {
            argv.extend(["-o".to_string(), "ControlPersist=no".to_string()]);
        }
    }

    fn identity_options(&self, argv: &mut Vec<String>) {
        if let Some(identity) = &self.identity {
            argv.extend([
                "-i".to_string(),
                identity.display().to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
            ]);
        }
    }

    fn shell(&self, master: bool) -> LaunchSpec {
        let mut argv = vec![self.family.shell_program().to_string(), "-t".to_string()];
        self.sharing_options(&mut argv, master);
        if let Some(port) = self.port {
            argv.extend(["-p".to_string(), port.to_string()]);
        }
        argv.extend(["-l".to_string(), self.user.clone()]);
        self.identity_options(&mut argv);
        argv.push(self.host.clone());
        self.launch(argv)
    }

    /// The interactive login that owns the control socket.
    pub(crate) fn master_shell(&self) -> LaunchSpec {
        self.shell(true)
    }

    /// An interactive shell riding the master's socket.
    pub(crate) fn slave_shell(&self) -> LaunchSpec {
        self.shell(false)
    }

    fn copy_prefix(&self, program: &str) -> Vec<String> {
        let mut argv = vec![program.to_string()];
        self.sharing_options(&mut argv, false);
        if let Some(port) = self.port {
            argv.extend(["-P".to_string(), port.to_string()]);
        }
        self.identity_options(&mut argv);
        argv
    }

    fn remote_target(&self, path: &str) -> String {
        format!("{}@{}:{path}", self.user, bracket_host(&self.host))
    }

    pub(crate) fn sftp(&self) -> LaunchSpec {
        let mut argv = self.copy_prefix(self.family.sftp_program());
        argv.push(format!("{}@{}", self.user, bracket_host(&self.host)));
        self.launch(argv)
    }

    pub(crate) fn scp(
        &self,
        direction: CopyDirection,
        local: &str,
        remote: &str,
        flags: CopyFlags,
    ) -> LaunchSpec {
        let mut argv = self.copy_prefix(self.family.scp_program());
        if flags.recursive {
            argv.push("-r".to_string());
        }
        let remote = self.remote_target(remote);
        match direction {
            CopyDirection::Upload => argv.extend([local.to_string(), remote]),
            CopyDirection::Download => argv.extend([remote, local.to_string()]),
        }
        self.launch(argv)
    }
}

fn bracket_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Credential;

    fn commands(url: &str, credentials: &[Credential], sharing: bool) -> SshCommands {
        let endpoint = Endpoint::parse(url).unwrap();
        let auth = AuthPlan::resolve(&endpoint, credentials).unwrap();
        let path = sharing.then(|| control_path(Path::new("/tmp/shellpool-1000"), &auth.user, &endpoint));
        SshCommands::new(&endpoint, &auth, path, "dumb")
    }

    fn words(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn master_owns_the_control_socket() {
        let key = Credential::SshKey {
            private_key: "/k/id".into(),
            passphrase: None,
        };
        let spec = commands("ssh://alice@host:2222", &[key], true).master_shell();
        assert_eq!(
            spec.argv,
            words(
                "ssh -t -o ControlMaster=yes -o ControlPath=/tmp/shellpool-1000/alice@host:2222 \
                 -o ControlPersist=no -p 2222 -l alice -i /k/id -o IdentitiesOnly=yes host"
            )
        );
    }

    #[test]
    fn slaves_and_copies_reuse_the_socket() {
        let cmds = commands("ssh://alice@host", &[], true);
        assert_eq!(
            cmds.slave_shell().argv,
            words("ssh -t -o ControlMaster=no -o ControlPath=/tmp/shellpool-1000/alice@host:22 -l alice host")
        );
        assert_eq!(
            cmds.sftp().argv,
            words("sftp -o ControlMaster=no -o ControlPath=/tmp/shellpool-1000/alice@host:22 alice@host")
        );
        assert_eq!(
            cmds.scp(CopyDirection::Download, "/l", "/r/x", CopyFlags { recursive: true }).argv,
            words("scp -o ControlMaster=no -o ControlPath=/tmp/shellpool-1000/alice@host:22 -r alice@host:/r/x /l")
        );
    }

    #[test]
    fn without_sharing_there_is_no_socket() {
        let cmds = commands("ssh://alice@host:2200", &[], false);
        assert!(cmds.control_path().is_none());
        assert_eq!(cmds.slave_shell().argv, words("ssh -t -p 2200 -l alice host"));
        assert_eq!(
            cmds.scp(CopyDirection::Upload, "/l", "r", CopyFlags::default()).argv,
            words("scp -P 2200 /l alice@host:r")
        );
    }

    #[test]
    fn grid_family_exports_the_proxy() {
        let proxy = Credential::X509Proxy {
            path: "/tmp/x509up_u1000".into(),
        };
        let spec = commands("gsissh://bob@grid", &[proxy], true).master_shell();
        assert_eq!(spec.argv[0], "gsissh");
        assert!(spec
            .env
            .contains(&("X509_USER_PROXY".to_string(), "/tmp/x509up_u1000".to_string())));
        assert_eq!(commands("gsissh://bob@grid", &[], true).sftp().argv[0], "gsisftp");
    }
}
