//! Ambient logging sink selection: stderr while running in the
//! foreground, the systemd journal while daemonized — the modern
//! equivalent of the original's syslog-vs-stdout split.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Verbosity requested on the command line. `-v` raises the default
/// directive to info, `-d` to debug, a second `-d` additionally enables
/// `trace`-level wire dumps (raw control messages and packet contents).
#[derive(Debug, Clone, Copy, Default)]
pub struct Verbosity {
    pub verbose: bool,
    pub debug: u8,
}

impl Verbosity {
    fn default_directive(&self) -> LevelFilter {
        match self.debug {
            0 if self.verbose => LevelFilter::INFO,
            0 => LevelFilter::WARN,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Whether the second `-d` (dump mode) is active: callers gate
    /// expensive wire-format formatting behind this so it costs nothing
    /// when disabled.
    pub fn dump_enabled(&self) -> bool {
        self.debug >= 2
    }
}

/// Initialize the global `tracing` subscriber. `daemon` selects the sink;
/// the env filter still lets `RUST_LOG` override the computed default.
pub fn init(verbosity: Verbosity, daemon: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.default_directive().into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);

    if daemon {
        match tracing_journald::layer() {
            Ok(journald) => {
                registry.with(journald).init();
                return;
            }
            Err(error) => {
                // Journal unavailable (e.g. not running under systemd); fall
                // back to stderr rather than losing logs entirely.
                eprintln!("campagnol: could not connect to the systemd journal: {error}");
            }
        }
    }

    registry
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
