//! Shared logging initialization for agent-ctl binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level() -> tracing::Level {
    match std::env::var("ACTL_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing output from `ACTL_LOG`.
///
/// Safe to call multiple times; only the first call installs the subscriber.
/// Best-effort and never returns an error.
pub fn init() {
    init_with_level(None);
}

/// Like [`init`], but an explicit `level` takes precedence over `ACTL_LOG`.
/// Used by binaries whose flags (e.g. `--verbose`) override the environment.
pub fn init_with_level(level: Option<tracing::Level>) {
    if INIT.get().is_some() {
        return;
    }
    let level = level.unwrap_or_else(parse_level);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
    let _ = INIT.set(());
}
