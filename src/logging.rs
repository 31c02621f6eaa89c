use std::sync::Once;

use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable consulted for log verbosity when no explicit
/// level is given.
pub const LOG_LEVEL_ENV: &str = "OK_LOGGING_LEVEL";

/// Initialize tracing output to stderr.
///
/// The filter comes from `level` when given, else `$OK_LOGGING_LEVEL`,
/// else warnings only; it accepts anything `tracing_subscriber`'s
/// `EnvFilter` does (`debug`, `okserial=trace`, ...). Only the first call
/// has any effect, so tests and embedders may call this freely.
pub fn init(level: Option<&str>) {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let directives = level
            .map(str::to_owned)
            .or_else(|| std::env::var(LOG_LEVEL_ENV).ok())
            .unwrap_or_else(|| "warn".to_owned());
        let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
            eprintln!("bad log level {directives:?} ({e}), using `warn`");
            EnvFilter::new("warn")
        });

        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
            .init();

        debug!("logging initialized");
    });
}
