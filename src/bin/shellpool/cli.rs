use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use shellpool::config::AppConfig;
use shellpool::{Credential, IoMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputMode {
    Ignore,
    Merge,
    Separate,
    Stdout,
    Stderr,
}

impl From<OutputMode> for IoMode {
    fn from(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Ignore => IoMode::Ignore,
            OutputMode::Merge => IoMode::Merge,
            OutputMode::Separate => IoMode::Separate,
            OutputMode::Stdout => IoMode::StdoutOnly,
            OutputMode::Stderr => IoMode::StderrOnly,
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[command(about = "Run commands through pooled pty shell sessions", author, version)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) app: AppConfig,

    /// Endpoint such as fork://localhost or ssh://user@host:port
    pub(crate) url: String,

    /// Commands to run, one shell round trip each
    pub(crate) commands: Vec<String>,

    /// How command output streams are collected
    #[arg(long = "io-mode", value_enum, default_value_t = OutputMode::Separate)]
    pub(crate) io_mode: OutputMode,

    /// Print one JSON object per command instead of raw output
    #[arg(long = "json", default_value_t = false)]
    pub(crate) json: bool,

    /// Write stdin to this path on the endpoint before running commands
    #[arg(long = "stage-to")]
    pub(crate) stage_to: Option<String>,

    /// Print this file from the endpoint after running commands
    #[arg(long = "stage-from")]
    pub(crate) stage_from: Option<String>,

    /// Private key for ssh endpoints
    #[arg(long = "identity")]
    pub(crate) identity: Option<PathBuf>,

    /// X.509 proxy certificate for gsissh endpoints
    #[arg(long = "x509-proxy", env = "X509_USER_PROXY")]
    pub(crate) x509_proxy: Option<PathBuf>,

    /// Environment variable holding the login password
    #[arg(long = "password-env")]
    pub(crate) password_env: Option<String>,

    /// Environment variable holding the key passphrase
    #[arg(long = "passphrase-env")]
    pub(crate) passphrase_env: Option<String>,
}

fn secret_from_env(var: Option<&str>) -> Result<Option<String>> {
    var.map(|name| env::var(name).map_err(|_| anyhow!("environment variable {name} is not set")))
        .transpose()
}

impl Cli {
    /// Credentials in precedence order: key, proxy, password.
    pub(crate) fn credentials(&self) -> Result<Vec<Credential>> {
        let mut credentials = Vec::new();
        if let Some(private_key) = &self.identity {
            credentials.push(Credential::SshKey {
                private_key: private_key.clone(),
                passphrase: secret_from_env(self.passphrase_env.as_deref())?,
            });
        }
        if let Some(path) = &self.x509_proxy {
            credentials.push(Credential::X509Proxy { path: path.clone() });
        }
        let password = secret_from_env(self.password_env.as_deref())?;
        if password.is_some() {
            credentials.push(Credential::UserPass {
                user: None,
                password,
            });
        }
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_url_commands_and_flags() {
        let cli = Cli::parse_from([
            "shellpool",
            "--json",
            "--io-mode",
            "merge",
            "--identity",
            "/k/id",
            "fork://localhost",
            "echo hi",
            "false",
        ]);
        assert!(cli.json);
        assert_eq!(IoMode::from(cli.io_mode), IoMode::Merge);
        assert_eq!(cli.url, "fork://localhost");
        assert_eq!(cli.commands, vec!["echo hi".to_string(), "false".to_string()]);
        let credentials = cli.credentials().unwrap();
        assert!(matches!(credentials.as_slice(), [Credential::SshKey { passphrase: None, .. }, ..]));
    }

    #[test]
    fn missing_secret_variable_is_an_error() {
        let cli = Cli::parse_from([
            "shellpool",
            "--password-env",
            "SHELLPOOL_TEST_SURELY_UNSET_PASSWORD",
            "ssh://host",
        ]);
        assert!(cli.credentials().is_err());
    }
}
