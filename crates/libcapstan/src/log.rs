//! Caller-visible log callback.
//!
//! `tracing` carries the structured diagnostics; this is the separate,
//! embedder-facing hook: a plain callback receiving formatted lines at or
//! below a chosen verbosity. Applications that do not install one pay only
//! an `Option` check per event.

use std::fmt;
use std::sync::Arc;

/// Severity ladder for the callback. Lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Ceiling that delivers nothing. No event is emitted at this level.
    Never,
    Fatal,
    Error,
    Info,
    Debug,
    /// Per-packet tracing. Noisy.
    Crazy,
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verbosity::Never => "never",
            Verbosity::Fatal => "fatal",
            Verbosity::Error => "error",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Crazy => "crazy",
        };
        f.write_str(name)
    }
}

/// Callback signature: formatted line plus its verbosity.
pub type LogFn = dyn Fn(&str, Verbosity) + Send + Sync;

/// Installed callback plus its verbosity ceiling. Cloning shares the
/// callback, which is what a cloned client wants.
#[derive(Clone)]
pub(crate) struct LogSink {
    callback: Arc<LogFn>,
    max: Verbosity,
}

impl LogSink {
    pub fn new(callback: Arc<LogFn>, max: Verbosity) -> Self {
        Self { callback, max }
    }

    pub fn wants(&self, verbosity: Verbosity) -> bool {
        verbosity <= self.max
    }

    pub fn emit(&self, verbosity: Verbosity, line: &str) {
        if self.wants(verbosity) {
            (self.callback)(line, verbosity);
        }
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink").field("max", &self.max).finish()
    }
}
