use crate::protocol::parts::{ResourceKind, ServerError, Severity};
use thiserror::Error;

/// A list specifying categories of [`RelayError`](crate::RelayError).
///
/// The kinds are stable and appear on the wire; every error that crosses the
/// proxy boundary is tagged with exactly one of them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The back-end returned an error; SQL state and vendor code are preserved.
    BackendSql,
    /// Acquiring a pooled connection timed out.
    PoolExhausted,
    /// The session id is unknown to the server.
    SessionNotFound,
    /// The handle uuid is unknown within its session.
    HandleNotFound,
    /// No admission-lane slot became available in time.
    SegregatorTimeout,
    /// The XA permit acquire timed out.
    XaLimitReached,
    /// Illegal XA verb sequence or unbound xid.
    XaProtocol,
    /// Bad URL, unknown placeholder, malformed CIDR, or other invalid configuration.
    ConfigInvalid,
    /// IP not whitelisted or invalid placeholder name.
    SecurityDenied,
    /// Connection-level RPC failure.
    TransportFailure,
    /// The caller cancelled the operation.
    Cancelled,
    /// Everything that has no wire-relevant classification.
    Internal,
}

impl ErrorKind {
    pub(crate) fn from_u8(i: u8) -> Self {
        match i {
            1 => Self::BackendSql,
            2 => Self::PoolExhausted,
            3 => Self::SessionNotFound,
            4 => Self::HandleNotFound,
            5 => Self::SegregatorTimeout,
            6 => Self::XaLimitReached,
            7 => Self::XaProtocol,
            8 => Self::ConfigInvalid,
            9 => Self::SecurityDenied,
            10 => Self::TransportFailure,
            11 => Self::Cancelled,
            _ => Self::Internal,
        }
    }

    /// Returns the number encoding of the kind.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::BackendSql => 1,
            Self::PoolExhausted => 2,
            Self::SessionNotFound => 3,
            Self::HandleNotFound => 4,
            Self::SegregatorTimeout => 5,
            Self::XaLimitReached => 6,
            Self::XaProtocol => 7,
            Self::ConfigInvalid => 8,
            Self::SecurityDenied => 9,
            Self::TransportFailure => 10,
            Self::Cancelled => 11,
            Self::Internal => 0,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::BackendSql => "backend-sql-error",
            Self::PoolExhausted => "pool-exhausted",
            Self::SessionNotFound => "session-not-found",
            Self::HandleNotFound => "handle-not-found",
            Self::SegregatorTimeout => "segregator-timeout",
            Self::XaLimitReached => "xa-limit-reached",
            Self::XaProtocol => "xa-protocol-error",
            Self::ConfigInvalid => "config-invalid",
            Self::SecurityDenied => "security-denied",
            Self::TransportFailure => "transport-failure",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// The error type used across driver, server, and wire protocol.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    /// Erroneous connection parameters, e.g. from a malformed connection URL.
    #[error("Erroneous connection parameters")]
    ConnParams {
        /// The causing error.
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {}", _0)]
    ConfigInvalid(String),

    /// A security rule rejected the request before any connection was opened.
    #[error("Security violation: {}", _0)]
    SecurityDenied(String),

    /// The back-end database responded with an error; the contained
    /// `ServerError` preserves SQL state and vendor code.
    #[error("Back-end database responded with an error")]
    Backend {
        /// The causing error.
        #[from]
        source: ServerError,
    },

    /// No pooled connection became free within the acquire timeout.
    #[error("Connection pool \"{}\" exhausted after {} ms", datasource, waited_ms)]
    PoolExhausted {
        datasource: String,
        waited_ms: u64,
    },

    /// The session id is not (or no longer) known to the server.
    #[error("Session {} not found", _0)]
    SessionNotFound(uuid::Uuid),

    /// The handle uuid is not known within the session.
    #[error("No {} handle {} in session", kind, id)]
    HandleNotFound {
        kind: ResourceKind,
        id: uuid::Uuid,
    },

    /// No lane slot became available within the configured slot timeout.
    #[error("No {} lane slot became available within {} ms", lane, waited_ms)]
    SegregatorTimeout {
        lane: &'static str,
        waited_ms: u64,
    },

    /// The per-datasource XA branch limit is reached.
    #[error("XA transaction limit reached, no permit within {} ms", waited_ms)]
    XaLimitReached { waited_ms: u64 },

    /// Illegal XA verb sequence or unbound xid.
    #[error("XA protocol error: {}", _0)]
    XaProtocol(String),

    /// Connection-level RPC failure.
    #[error("Transport failure: {}", _0)]
    TransportFailure(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled by the caller")]
    Cancelled,

    /// Error occured in thread synchronization.
    #[error("Error occured in thread synchronization")]
    Poison,

    /// Implementation error.
    #[error("Implementation error: {}", _0)]
    Impl(&'static str),

    /// Implementation error.
    #[error("Implementation error: {}", _0)]
    ImplDetailed(String),

    /// Error caused by wrong usage.
    #[error("Wrong usage: {}", _0)]
    Usage(&'static str),

    /// Error caused by wrong usage.
    #[error("Wrong usage: {}", _0)]
    UsageDetailed(String),

    /// Error occured in communication.
    #[error(transparent)]
    Io {
        /// The causing error.
        #[from]
        source: std::io::Error,
    },

    /// (De)serialization of a property map failed.
    #[error("Error occured in (de)serialization")]
    Serialization {
        /// The causing error.
        #[from]
        source: serde_json::Error,
    },
}

/// Abbreviation of `Result<T, RelayError>`.
pub type RelayResult<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Returns the wire-level kind of this error.
    ///
    /// Errors received over the wire keep the kind they were sent with.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend { source } => source.kind(),
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::HandleNotFound { .. } => ErrorKind::HandleNotFound,
            Self::SegregatorTimeout { .. } => ErrorKind::SegregatorTimeout,
            Self::XaLimitReached { .. } => ErrorKind::XaLimitReached,
            Self::XaProtocol(_) => ErrorKind::XaProtocol,
            Self::ConnParams { .. } | Self::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Self::SecurityDenied(_) => ErrorKind::SecurityDenied,
            Self::TransportFailure(_) | Self::Io { .. } => ErrorKind::TransportFailure,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    /// Returns the contained `ServerError`, if any.
    ///
    /// This method helps in case you need programmatic access to e.g. the
    /// vendor code or the SQL state.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Backend {
                source: server_error,
            } => Some(server_error),
            _ => None,
        }
    }

    /// Translates this error into its wire representation.
    ///
    /// Back-end errors pass through unchanged; every other error is wrapped
    /// with its kind, the default SQL state `HY000`, and vendor code 0.
    pub fn to_server_error(&self) -> ServerError {
        match self {
            Self::Backend { source } => source.clone(),
            other => ServerError::new(
                other.kind(),
                0,
                Severity::Error,
                ServerError::SQLSTATE_GENERAL.to_vec(),
                other.to_string(),
                chain_summary(other),
            ),
        }
    }

    pub(crate) fn conn_params(error: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Self::ConnParams { source: error }
    }

    /// True if the error indicates that the underlying physical connection is
    /// no longer usable (SQL-state class `08`, or a transport failure).
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Io { .. } | Self::TransportFailure(_) => true,
            Self::Backend { source } => source.is_connection_failure(),
            _ => false,
        }
    }
}

fn chain_summary(error: &RelayError) -> Option<String> {
    std::error::Error::source(error).map(|source| {
        let mut summary = String::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(source);
        while let Some(e) = current {
            if !summary.is_empty() {
                summary.push_str(": ");
            }
            summary.push_str(&e.to_string());
            current = e.source();
        }
        summary
    })
}

impl<G> From<std::sync::PoisonError<G>> for RelayError {
    fn from(_error: std::sync::PoisonError<G>) -> Self {
        Self::Poison
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, RelayError};

    #[test]
    fn kinds_round_trip_through_u8() {
        for kind in [
            ErrorKind::BackendSql,
            ErrorKind::PoolExhausted,
            ErrorKind::SessionNotFound,
            ErrorKind::HandleNotFound,
            ErrorKind::SegregatorTimeout,
            ErrorKind::XaLimitReached,
            ErrorKind::XaProtocol,
            ErrorKind::ConfigInvalid,
            ErrorKind::SecurityDenied,
            ErrorKind::TransportFailure,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ] {
            assert_eq!(kind, ErrorKind::from_u8(kind.to_u8()));
        }
    }

    #[test]
    fn translator_keeps_the_kind() {
        let e = RelayError::PoolExhausted {
            datasource: "default".to_string(),
            waited_ms: 200,
        };
        let se = e.to_server_error();
        assert_eq!(se.kind(), ErrorKind::PoolExhausted);
        assert_eq!(se.sqlstate(), b"HY000");
    }
}
