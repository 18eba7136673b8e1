//! Tracing subscriber setup for the CLI and embedding applications.

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

const TRACE_LOG_ENV: &str = "SHELLPOOL_TRACE_LOG";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// JSON trace file requested through the environment, if any.
pub fn trace_log_path() -> Option<PathBuf> {
    env::var(TRACE_LOG_ENV)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

fn init_tracing_once(config: &AppConfig, once: &OnceLock<()>) {
    if !config.logs {
        return;
    }

    let _ = once.get_or_init(|| {
        let filter = EnvFilter::try_new(&config.log_level)
            .unwrap_or_else(|_| EnvFilter::new("info"));
        if let Some(path) = trace_log_path() {
            let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
                return;
            };
            let subscriber = tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(file)
                .with_current_span(false)
                .with_span_list(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
            return;
        }
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(std::io::stderr)
            .with_target(true)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Install the global subscriber once; later calls are no-ops.
pub fn init_tracing(config: &AppConfig) {
    init_tracing_once(config, &TRACING_INIT);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn trace_log_path_reads_env_override() {
        let _guard = env_lock().lock().expect("env lock");
        unsafe {
            env::set_var(TRACE_LOG_ENV, "  /tmp/shellpool-trace.jsonl ");
        }
        assert_eq!(
            trace_log_path(),
            Some(PathBuf::from("/tmp/shellpool-trace.jsonl"))
        );
        unsafe {
            env::set_var(TRACE_LOG_ENV, "");
        }
        assert_eq!(trace_log_path(), None);
        unsafe {
            env::remove_var(TRACE_LOG_ENV);
        }
    }

    #[test]
    fn disabled_logging_does_not_create_trace_file() {
        let _guard = env_lock().lock().expect("env lock");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.jsonl");
        unsafe {
            env::set_var(TRACE_LOG_ENV, &path);
        }
        let once = OnceLock::new();
        let config = AppConfig::default();
        assert!(!config.logs);
        init_tracing_once(&config, &once);
        assert!(!path.exists());
        assert!(once.get().is_none());
        unsafe {
            env::remove_var(TRACE_LOG_ENV);
        }
        let _ = fs::remove_file(path);
    }

    #[test]
    fn enabled_logging_creates_trace_file() {
        let _guard = env_lock().lock().expect("env lock");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.jsonl");
        unsafe {
            env::set_var(TRACE_LOG_ENV, &path);
        }
        let once = OnceLock::new();
        let mut config = AppConfig::default();
        config.logs = true;
        init_tracing_once(&config, &once);
        assert!(path.exists(), "enabled config should create the trace file");
        unsafe {
            env::remove_var(TRACE_LOG_ENV);
        }
    }
}
