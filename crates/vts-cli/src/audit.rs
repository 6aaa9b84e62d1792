//! Audit log
//!
//! Store activity is written to stderr and appended to `<data>/audit.txt`.
//! Each invocation starts a new block separated from the previous one by a
//! blank line.

use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};
use vts_store::StorePaths;

/// Open the audit log for appending
///
/// Returns the file and whether it existed before.
pub(crate) fn open_audit_log(data: &Path) -> anyhow::Result<(File, bool)> {
    std::fs::create_dir_all(data)
        .with_context(|| format!("creating data directory {}", data.display()))?;
    let path = StorePaths::new(data).audit_log();
    let existed = path.is_file();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening audit log {}", path.display()))?;
    if existed {
        file.write_all(b"\n\n")
            .with_context(|| format!("writing audit log {}", path.display()))?;
    }
    Ok((file, existed))
}

/// Install the global subscriber
///
/// `RUST_LOG` controls the stderr output and defaults to `info`. The audit
/// file always receives `info` and above.
pub(crate) fn init(data: &Path) -> anyhow::Result<()> {
    let (file, existed) = open_audit_log(data)?;

    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);
    let audit_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_filter(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(audit_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    if !existed {
        tracing::info!("Creating audit log");
    }
    Ok(())
}
