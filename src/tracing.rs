//! Provide tracing, tailored to this program.
//!
//! The binary calls [`init`] once at startup to install a tracing subscriber.
//! The rest of the program includes `use crate::tracing::prelude::*` for
//! convenient access to the `trace!()` through `error!()` macros.

use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

/// Initialize logging.
///
/// When stderr is connected to the systemd journal, log there; otherwise log
/// to stdout, filtered by `RUST_LOG` with a default level of INFO.
pub fn init() {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            if let Ok(layer) = tracing_journald::layer() {
                tracing_subscriber::registry().with(layer).init();
                return;
            }
        }
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Check whether stderr is the systemd journal socket.
///
/// systemd sets JOURNAL_STREAM to "<device>:<inode>" of the stream it
/// attached; comparing against fstat(2) of stderr detects redirection.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    use std::os::unix::fs::MetadataExt;

    let Ok(value) = std::env::var("JOURNAL_STREAM") else {
        return false;
    };

    let Some((dev, ino)) = value.split_once(':') else {
        return false;
    };
    let (Ok(dev), Ok(ino)) = (dev.parse::<u64>(), ino.parse::<u64>()) else {
        return false;
    };

    match std::fs::metadata("/proc/self/fd/2") {
        Ok(meta) => meta.dev() == dev && meta.ino() == ino,
        Err(_) => false,
    }
}
