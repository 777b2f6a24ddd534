use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use hs_types::HsResult;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Open the debug log, appending to it when a study is being reloaded.
pub fn open_log_file(path: &Path, append: bool) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options.open(path)
}

/// Install the global subscriber: INFO to stdout (`RUST_LOG` overrides),
/// plus everything from DEBUG up to `log_file` when given.
pub fn init_logging(log_file: Option<&Path>, append: bool) -> HsResult<()> {
    let stdout = fmt::layer().with_target(false).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );

    let file = match log_file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(open_log_file(path, append)?))
                .with_filter(LevelFilter::DEBUG),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(stdout)
        .with(file)
        .try_init()
        .map_err(|e| hs_types::internal_error!("could not install the logger: {e}"))?;

    if let Some(path) = log_file {
        tracing::info!("Logging to {}", path.display());
    }
    Ok(())
}
