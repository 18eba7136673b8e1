//! `shellpool`: run commands on an endpoint through a pooled pty shell.
//!
//! Each positional command is one synchronous round trip on the same session,
//! so shell state (cwd, variables) carries over between them.

mod cli;

use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use shellpool::telemetry::init_tracing;
use shellpool::{CommandOutput, ConnectionRegistry, IdleSupervisor, IoMode, ShellSession};
use tracing::debug;

use crate::cli::Cli;

#[derive(Serialize)]
struct CommandReport<'a> {
    command: &'a str,
    #[serde(flatten)]
    output: &'a CommandOutput,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let app = cli.app.clone().validated()?;
    init_tracing(&app);

    let supervisor = Arc::new(IdleSupervisor::new(app.supervisor_config()));
    let registry = ConnectionRegistry::new(app.registry_config(), Arc::clone(&supervisor));
    let credentials = cli.credentials()?;
    let shell = registry
        .open_shell(&cli.url, &credentials)
        .with_context(|| format!("cannot open a shell on {}", cli.url))?;
    debug!(url = %cli.url, pid = ?shell.pid(), "session open");

    let outcome = drive(&cli, &shell);

    if let Err(err) = shell.finalize(false) {
        debug!(error = %err, "session finalize reported an error");
    }
    registry.shutdown();
    supervisor.shutdown();
    outcome
}

fn drive(cli: &Cli, shell: &ShellSession) -> Result<ExitCode> {
    if let Some(path) = &cli.stage_to {
        let mut data = Vec::new();
        io::stdin()
            .read_to_end(&mut data)
            .context("cannot read stdin for --stage-to")?;
        shell
            .stage_to_remote(&data, path)
            .with_context(|| format!("cannot stage {} bytes to {path}", data.len()))?;
    }

    let mode = IoMode::from(cli.io_mode);
    let mut last_status = 0;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for command in &cli.commands {
        let output = shell
            .run_sync(command, mode)
            .with_context(|| format!("`{command}` failed"))?;
        if cli.json {
            let report = CommandReport {
                command,
                output: &output,
            };
            serde_json::to_writer(&mut out, &report)?;
            writeln!(out)?;
        } else {
            out.write_all(output.stdout.as_bytes())?;
            eprint!("{}", output.stderr);
            if !output.success() {
                eprintln!("[{command}: exit status {}]", output.status);
            }
        }
        last_status = output.status;
    }

    if let Some(path) = &cli.stage_from {
        let data = shell
            .stage_from_remote(path)
            .with_context(|| format!("cannot read {path}"))?;
        out.write_all(&data)?;
    }
    out.flush()?;

    Ok(ExitCode::from(u8::try_from(last_status).unwrap_or(1)))
}
