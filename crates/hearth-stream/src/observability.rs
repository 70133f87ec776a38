use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INSTALLED: OnceCell<()> = OnceCell::new();

const FALLBACK_FILE_NAME: &str = "hearth-stream.logs.jsonl";

/// Where log records go. Stdout is reserved for the streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogSink {
    Off,
    Stderr,
    JsonFile { dir: PathBuf, file_name: String },
}

impl LogSink {
    fn from_vars(enabled: Option<&str>, json_path: Option<&str>) -> Self {
        if enabled.and_then(switch_value) == Some(false) {
            return Self::Off;
        }
        match json_path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(raw) => {
                let (dir, file_name) = split_log_path(Path::new(raw));
                Self::JsonFile { dir, file_name }
            }
            None => Self::Stderr,
        }
    }

    fn from_env() -> Self {
        let enabled = std::env::var("HEARTH_OBSERVABILITY_ENABLED").ok();
        let json_path = std::env::var("HEARTH_JSON_LOG_PATH").ok();
        Self::from_vars(enabled.as_deref(), json_path.as_deref())
    }
}

/// Reads an on/off switch; anything unrecognised is `None`.
fn switch_value(raw: &str) -> Option<bool> {
    let lowered = raw.trim().to_ascii_lowercase();
    if ["1", "true", "yes", "on", "enabled"].contains(&lowered.as_str()) {
        Some(true)
    } else if ["0", "false", "no", "off", "disabled"].contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .map_or_else(|| FALLBACK_FILE_NAME.to_string(), ToOwned::to_owned);
    (dir, file_name)
}

/// `HEARTH_LOG_LEVEL` wins over `RUST_LOG`; both fall back to `warn`.
fn level_filter() -> EnvFilter {
    std::env::var("HEARTH_LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

fn install(sink: LogSink) {
    let registry = tracing_subscriber::registry().with(level_filter());
    match sink {
        LogSink::Off => {}
        LogSink::Stderr => {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = registry.with(layer).try_init();
        }
        LogSink::JsonFile { dir, file_name } => {
            let _ = std::fs::create_dir_all(&dir);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(tracing_appender::rolling::never(dir, file_name));
            let _ = registry.with(layer).try_init();
        }
    }
}

/// Sets up the global tracing subscriber; later calls do nothing.
///
/// `HEARTH_OBSERVABILITY_ENABLED=off` silences logging entirely.
/// `HEARTH_JSON_LOG_PATH` sends JSON lines to that file instead of stderr.
/// The level comes from `HEARTH_LOG_LEVEL`, then `RUST_LOG`.
pub fn init_observability() {
    INSTALLED.get_or_init(|| install(LogSink::from_env()));
}
