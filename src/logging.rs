use std::{
    cmp::Reverse,
    fs,
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::SystemTime,
};

use anyhow::{Context, Result};
use std::ffi::OsStr;
use tracing::warn;
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_DIR_ENV: &str = "STREAMCQRS_LOG_DIR";
const LOG_PREFIX: &str = "streamcqrs.log";
const MAX_RETAINED_LOGS: usize = 14;

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static PANIC_HOOK: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber: human output on stderr and a daily
/// rolling file under the log directory. Stdout is left to command output.
pub fn init() -> Result<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    let log_dir = resolve_log_dir()?;
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    if let Err(err) = enforce_retention(&log_dir) {
        eprintln!(
            "failed to enforce log retention in {}: {err:?}",
            log_dir.display()
        );
    }

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_PREFIX);
    let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_target(false).with_writer(io::stderr);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);

    match subscriber.try_init() {
        Ok(_) => {
            let _ = FILE_GUARD.set(guard);
            install_panic_hook();
        }
        Err(_) => {
            // Subscriber already installed elsewhere; drop guard so the worker thread exits.
            drop(guard);
        }
    }

    Ok(())
}

fn resolve_log_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(LOG_DIR_ENV) {
        let path = PathBuf::from(dir);
        if path.is_absolute() {
            return Ok(path);
        }
        let base =
            std::env::current_dir().context("failed to resolve current working directory")?;
        return Ok(base.join(path));
    }

    let home = dirs::home_dir().context("unable to locate user home directory")?;
    Ok(home.join(".streamcqrs").join("logs"))
}

/// Keeps the newest rolled files. The appender names them
/// `streamcqrs.log.YYYY-MM-DD`.
fn enforce_retention(log_dir: &Path) -> Result<usize> {
    let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(log_dir)
        .with_context(|| format!("failed to inspect log directory {}", log_dir.display()))?
    {
        let entry = entry.with_context(|| {
            format!(
                "failed to inspect log directory entry in {}",
                log_dir.display()
            )
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        if !file_name.starts_with(LOG_PREFIX) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, path));
    }

    entries.sort_by_key(|(modified, _)| Reverse(*modified));
    let mut removed = 0;
    while entries.len() > MAX_RETAINED_LOGS {
        if let Some((_, path)) = entries.pop() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => warn!("failed to remove expired log {}: {}", path.display(), err),
            }
        }
    }
    Ok(removed)
}

fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                tracing::error!(
                    target: "panic",
                    file = location.file(),
                    line = location.line(),
                    message = %info
                );
            } else {
                tracing::error!(target: "panic", message = %info);
            }
            default_hook(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn retention_keeps_newest_logs_only() {
        let temp = tempdir().unwrap();
        for day in 1..=16 {
            let name = format!("{LOG_PREFIX}.2025-01-{day:02}");
            fs::write(temp.path().join(name), b"line\n").unwrap();
        }
        fs::write(temp.path().join("unrelated.txt"), b"keep\n").unwrap();

        let removed = enforce_retention(temp.path()).unwrap();
        assert_eq!(removed, 2);
        let remaining = fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(remaining, MAX_RETAINED_LOGS + 1);
    }
}
