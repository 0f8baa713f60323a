//! Log setup for backup-vm.
//!
//! Everything the operator must see about a run (freeze problems, pivot
//! retries, disks left on overlays, archiver failures) is a `warn!` or
//! `error!` event printed on stderr. `RUST_LOG` replaces the default filter.
//!
//! Backups usually run from cron, where stderr is easily lost. With
//! `BACKUP_VM_LOG=1` the same events, plus `info` level progress of the
//! snapshot and archiver steps, are appended to `backup-vm.log` under
//! `$XDG_DATA_HOME/backup-vm/` (or `~/.local/share/backup-vm/`).

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const FILE_LOG_ENV: &str = "BACKUP_VM_LOG";
const FILE_NAME: &str = "backup-vm.log";

/// Flushes the file log when dropped.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Hold the guard until `main` returns.
pub fn init() -> LogGuard {
    let to_file = std::env::var(FILE_LOG_ENV).as_deref() == Ok("1");
    let default_level = if to_file { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_writer, guard) = if to_file {
        let dir = log_dir(std::env::var("XDG_DATA_HOME").ok(), std::env::var("HOME").ok());
        let _ = std::fs::create_dir_all(&dir);
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, FILE_NAME));
        (Some(writer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_writer.map(|w| fmt::layer().with_writer(w).with_ansi(false)))
        .init();

    LogGuard { _file: guard }
}

fn log_dir(xdg_data_home: Option<String>, home: Option<String>) -> PathBuf {
    match (xdg_data_home.filter(|d| !d.is_empty()), home) {
        (Some(data), _) => PathBuf::from(data).join("backup-vm"),
        (None, Some(home)) => PathBuf::from(home).join(".local/share/backup-vm"),
        (None, None) => std::env::temp_dir().join("backup-vm"),
    }
}
