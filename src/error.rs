use std::fmt;

use thiserror::Error;

/// The four-kind error taxonomy the runner classifies every tick's outcome by.
///
/// Callers branch on the variant, never on a downcast — the exchange, the fault
/// injector, and the circuit breaker all raise directly into this type.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// A breach of the trading engine's safety invariant. Counted, and must be
    /// surfaced: a passing episode records zero of these.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Timeouts, 5xx, 429, breaker-open. Counted as a failed tick, then the run
    /// continues.
    #[error("operational error: {0}")]
    Operational(#[from] OperationalError),

    /// Malformed data, rejected orders, bad symbols. Counted as a failed tick, then
    /// the run continues.
    #[error("data error: {0}")]
    Data(String),

    /// A programming bug (e.g. an injected "attribute error" fault). This is the one
    /// kind the taxonomy does not try to make recoverable: it must propagate and
    /// terminate the run.
    #[error("unclassified error: {0}")]
    Other(#[from] OtherError),
}

/// Rejections and transient failures classed as operational: the trading engine is
/// expected to retry or back off, never to treat these as data corruption.
#[derive(Debug, Error)]
pub enum OperationalError {
    #[error("rate limit exceeded")]
    RateLimit,

    #[error("circuit breaker open, cooldown remaining")]
    CircuitOpen,

    #[error("request timed out: {0}")]
    Timeout(String),
}

/// A bug-class condition: an injected fault simulating a programming error, or a
/// genuine internal inconsistency. Carries a message rather than a typed payload so
/// the taxonomy doesn't grow a variant every time a new bug shape is injected.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct OtherError(pub String);

impl ReplayError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(OtherError(msg.into()))
    }

    /// The classification the runner files this error under, matching spec §7's
    /// `exceptions_by_type` bucketing.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invariant(_) => ErrorKind::Invariant,
            Self::Operational(_) => ErrorKind::Operational,
            Self::Data(_) => ErrorKind::Data,
            Self::Other(_) => ErrorKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Invariant,
    Operational,
    Data,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invariant => "InvariantError",
            Self::Operational => "OperationalError",
            Self::Data => "DataError",
            Self::Other => "Other",
        };
        f.write_str(s)
    }
}

pub type ReplayResult<T> = Result<T, ReplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_each_variant() {
        assert_eq!(ReplayError::invariant("k").kind(), ErrorKind::Invariant);
        assert_eq!(
            ReplayError::from(OperationalError::RateLimit).kind(),
            ErrorKind::Operational
        );
        assert_eq!(ReplayError::data("bad symbol").kind(), ErrorKind::Data);
        assert_eq!(ReplayError::other("bug").kind(), ErrorKind::Other);
    }
}
