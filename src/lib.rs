pub mod mcp_host;

use std::fs::File;
use std::io::LineWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::fmt::MakeWriter;

/// Default log filter when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "mcp_bridge=info,warn";

/// Log files kept besides the current one.
const LOG_ROTATIONS: u32 = 3;

/// Return the platform-standard data directory for the bridge.
///
/// - macOS: `~/Library/Application Support/mcp-bridge/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-bridge\`
/// - Linux: `$XDG_DATA_HOME/mcp-bridge/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-bridge/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-bridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-bridge")
}

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// `bridge.log` in [`data_dir`].
    DataDir,
    File(PathBuf),
}

/// Initialize the tracing subscriber.
///
/// A file target is rotated before it is opened, keeping three older
/// generations (`bridge.log.1` is the newest). Returns the log file path,
/// if any.
pub fn init_tracing(target: LogTarget, json: bool) -> anyhow::Result<Option<PathBuf>> {
    let log_path = match target {
        LogTarget::Stderr => None,
        LogTarget::DataDir => Some(data_dir().join("bridge.log")),
        LogTarget::File(path) => Some(path),
    };

    match &log_path {
        None => install_subscriber(std::io::stderr, json, true)?,
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, LOG_ROTATIONS)
                .map_err(|e| anyhow::anyhow!("failed to rotate {}: {e}", path.display()))?;

            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("failed to open {}: {e}", path.display()))?;
            install_subscriber(log_writer(file), json, false)?;
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "=== MCP Bridge starting ==="
    );

    Ok(log_path)
}

fn install_subscriber<W>(writer: W, json: bool, ansi: bool) -> anyhow::Result<()>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.with_ansi(ansi).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Path of the `n`th older generation of `base`; generation 0 is `base` itself.
fn generation(base: &Path, n: u32) -> PathBuf {
    if n == 0 {
        return base.to_path_buf();
    }
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Age every existing generation of `base` by one, keeping at most `keep`
/// older files. Gaps in the chain are left as they are.
fn rotate_log_file(base: &Path, keep: u32) -> std::io::Result<()> {
    match std::fs::remove_file(generation(base, keep)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    for n in (0..keep).rev() {
        let current = generation(base, n);
        if current.exists() {
            std::fs::rename(&current, generation(base, n + 1))?;
        }
    }
    Ok(())
}

/// File sink for the subscriber. Each event is one line, so the line
/// buffer hands it to the OS as soon as it is formatted.
fn log_writer(file: File) -> Mutex<LineWriter<File>> {
    Mutex::new(LineWriter::new(file))
}
