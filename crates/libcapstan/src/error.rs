//! Client error taxonomy.
//!
//! Callers branch on the variant, never on the message. Transport failures
//! are attached to the tasks they affect and surface as the call's error only
//! when the caller is synchronously waiting on one of those tasks.

use bytes::Bytes;
use capstan_core::packet::JobHandle;
use capstan_core::wire::WireError;

/// Every way a client call can fail.
///
/// Variants are cloneable so one endpoint failure can be fanned out to every
/// task bound to that endpoint; transport causes are captured as text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapstanError {
    /// Malformed frame. Poisons the connection it arrived on.
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// Host name resolution failed.
    #[error("failed to resolve {host}: {detail}")]
    Resolve { host: String, detail: String },

    /// TCP connect failed. Recoverable — the endpoint is retried lazily on
    /// the next send.
    #[error("could not connect to {addr}: {detail}")]
    CouldNotConnect { addr: String, detail: String },

    /// An established connection dropped mid-exchange.
    #[error("connection to {addr} lost")]
    ConnectionLost { addr: String },

    /// The configured deadline passed. In-flight job handles stay valid.
    #[error("operation timed out")]
    Timeout,

    /// No endpoint has been configured.
    #[error("no servers configured")]
    NoServers,

    /// Task creation is locked by the `no_new` option.
    #[error("new task creation is locked")]
    NoNewTasks,

    /// The worker reported failure. A server-side outcome, not a client bug.
    #[error("job {handle} failed")]
    WorkFail { handle: JobHandle },

    /// The worker raised an exception.
    #[error("job {handle} raised an exception")]
    WorkException { handle: JobHandle, payload: Bytes },

    /// A client-supplied field exceeds a protocol size bound; nothing was
    /// sent.
    #[error("{what} is {len} bytes, limit {max}")]
    ArgumentTooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },

    /// The server answered with an ERROR frame.
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },
}

impl CapstanError {
    pub(crate) fn resolve(host: &str, err: &std::io::Error) -> Self {
        CapstanError::Resolve {
            host: host.to_string(),
            detail: err.to_string(),
        }
    }

    pub(crate) fn could_not_connect(addr: &str, err: &std::io::Error) -> Self {
        CapstanError::CouldNotConnect {
            addr: addr.to_string(),
            detail: err.to_string(),
        }
    }

    /// True for transport-level failures that fail only the tasks bound to
    /// one endpoint, never the whole run.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            CapstanError::Resolve { .. }
                | CapstanError::CouldNotConnect { .. }
                | CapstanError::ConnectionLost { .. }
        )
    }
}
