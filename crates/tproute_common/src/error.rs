use thiserror::Error;

use crate::types::{PoolName, TxnId};

/// Convenience alias for `Result<T, CallerError>`.
pub type CallerResult<T> = Result<T, CallerError>;

/// Error classification for failover and escalation decisions.
///
/// - `UserError`  : bad input or an unsupported operation
/// - `Retryable`  : the pool is unusable right now; another pool MAY serve the call
/// - `Fatal`      : the in-flight work is rollback-only; no other pool may be tried
/// - `InternalBug`: invariant violation; should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Fatal,
    InternalBug,
}

/// What went wrong at the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// A connection could not be established.
    Unreachable,
    /// The remote domain announced it is going away.
    DomainDisconnecting,
    /// The pool is out of connections.
    ResourceExhausted,
    /// The connection broke while a call was in flight.
    ConnectionLost,
    /// The peer sent something we could not interpret.
    Protocol,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Unreachable => write!(f, "unreachable"),
            TransportErrorKind::DomainDisconnecting => write!(f, "domain_disconnecting"),
            TransportErrorKind::ResourceExhausted => write!(f, "resource_exhausted"),
            TransportErrorKind::ConnectionLost => write!(f, "connection_lost"),
            TransportErrorKind::Protocol => write!(f, "protocol"),
        }
    }
}

/// Error raised by a connection factory or connection.
///
/// Carries an explicit retryable/non-retryable tag via its kind. A
/// non-retryable failure happened mid-call and leaves the operation
/// rollback-only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transport error ({kind}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unreachable, message)
    }

    pub fn domain_disconnecting(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::DomainDisconnecting, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionLost, message)
    }

    /// Returns true if another pool may be tried after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Unreachable
                | TransportErrorKind::DomainDisconnecting
                | TransportErrorKind::ResourceExhausted
        )
    }
}

/// Top-level error type of the router.
#[derive(Error, Debug)]
pub enum CallerError {
    /// A call failed with a connection-level fault; the operation is
    /// rollback-only and no other pool was tried.
    #[error("call to service={service} on pool={pool} failed because of a network connection error, retries not possible: {source}")]
    RollbackOnly {
        service: String,
        pool: PoolName,
        #[source]
        source: TransportError,
    },

    /// Every candidate pool failed with a retryable error.
    #[error("call to service={service} failed on all {attempted} available pools{}", last_cause_suffix(.last))]
    AllPoolsFailed {
        service: String,
        attempted: usize,
        last: Option<TransportError>,
    },

    /// A transaction tried to stick to a second pool.
    #[error("transaction {txn} is already sticky to pool {existing}, refusing to stick it to {requested}")]
    StickyConflict {
        txn: TxnId,
        existing: PoolName,
        requested: PoolName,
    },

    #[error("no pools configured under search root '{0}'")]
    NoPoolsConfigured(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Internal bug: should never occur in production.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

fn last_cause_suffix(last: &Option<TransportError>) -> String {
    match last {
        Some(e) => format!(", last error: {e}"),
        None => String::new(),
    }
}

impl CallerError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallerError::AllPoolsFailed { .. } => ErrorKind::Retryable,
            CallerError::Transport(e) if e.is_retryable() => ErrorKind::Retryable,
            CallerError::Transport(_) => ErrorKind::Fatal,
            CallerError::RollbackOnly { .. } => ErrorKind::Fatal,
            CallerError::NoPoolsConfigured(_) => ErrorKind::UserError,
            CallerError::Config(_) => ErrorKind::UserError,
            CallerError::Unsupported(_) => ErrorKind::UserError,
            CallerError::StickyConflict { .. } => ErrorKind::InternalBug,
            CallerError::InternalBug { .. } => ErrorKind::InternalBug,
            CallerError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// Returns true if the caller may retry the whole operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if the in-flight operation must be rolled back.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// The transport error underneath this one, if any.
    pub fn transport_cause(&self) -> Option<&TransportError> {
        match self {
            CallerError::RollbackOnly { source, .. } => Some(source),
            CallerError::AllPoolsFailed { last, .. } => last.as_ref(),
            CallerError::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Construct an internal bug error with error code and context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        CallerError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_retryability() {
        assert!(TransportError::unreachable("no route").is_retryable());
        assert!(TransportError::domain_disconnecting("bye").is_retryable());
        assert!(TransportError::new(TransportErrorKind::ResourceExhausted, "pool empty").is_retryable());
        assert!(!TransportError::connection_lost("reset").is_retryable());
        assert!(!TransportError::new(TransportErrorKind::Protocol, "garbage").is_retryable());
    }

    #[test]
    fn test_caller_error_kinds() {
        let rollback = CallerError::RollbackOnly {
            service: "echo".into(),
            pool: PoolName::new("eis/a"),
            source: TransportError::connection_lost("reset"),
        };
        assert!(rollback.is_fatal());
        assert!(!rollback.is_retryable());

        let exhausted = CallerError::AllPoolsFailed {
            service: "echo".into(),
            attempted: 2,
            last: Some(TransportError::unreachable("refused")),
        };
        assert!(exhausted.is_retryable());
        assert_eq!(exhausted.transport_cause().map(|e| e.kind), Some(TransportErrorKind::Unreachable));

        let conflict = CallerError::StickyConflict {
            txn: TxnId(7),
            existing: PoolName::new("eis/a"),
            requested: PoolName::new("eis/b"),
        };
        assert!(conflict.is_internal_bug());

        assert!(CallerError::Unsupported("service_details".into()).is_user_error());
    }

    #[test]
    fn test_all_pools_failed_message_mentions_last_cause() {
        let err = CallerError::AllPoolsFailed {
            service: "echo".into(),
            attempted: 3,
            last: Some(TransportError::unreachable("connection refused")),
        };
        let msg = err.to_string();
        assert!(msg.contains("all 3 available pools"));
        assert!(msg.contains("connection refused"));

        let bare = CallerError::AllPoolsFailed {
            service: "echo".into(),
            attempted: 0,
            last: None,
        };
        assert!(!bare.to_string().contains("last error"));
    }

    #[test]
    fn test_transport_error_converts() {
        let err: CallerError = TransportError::connection_lost("reset").into();
        assert!(err.is_fatal());
        let err: CallerError = TransportError::unreachable("refused").into();
        assert!(err.is_retryable());
    }
}
