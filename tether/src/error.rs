//! Error types for host agent operations.

/// Alias for `Result<T, tether::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the host agent.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The guest connection failed or sent something undecodable.
    #[error(transparent)]
    Proto(#[from] tether_proto::Error),

    /// An external command (`ssh`, `bash`) exited unsuccessfully.
    #[error("failed to run {cmd}: {detail}")]
    Command {
        /// The command line that was run.
        cmd: String,
        /// Exit status and captured output.
        detail: String,
    },

    /// A DNS message could not be decoded or encoded.
    #[error("dns: {0}")]
    Dns(#[from] hickory_proto::error::ProtoError),

    /// The host resolver failed.
    #[error("resolve: {0}")]
    Resolve(#[from] hickory_resolver::error::ResolveError),

    /// The configuration is unusable.
    #[error("invalid config: {0}")]
    Config(String),

    /// The configuration file is not valid JSON.
    #[error("config: {0}")]
    Json(#[from] serde_json::Error),

    /// One or more readiness requirements were not satisfied.
    #[error("{}", .0.join("; "))]
    Requirements(Vec<String>),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
