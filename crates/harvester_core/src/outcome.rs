use std::fmt;

use crate::UnitSummary;

/// Per-unit failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Network,
    /// The proxy itself refused or dropped the connection.
    ProxyUnreachable,
    Timeout,
    /// An anti-bot challenge was met and not passed.
    Blocked,
    /// Selection found no eligible proxy; nothing was sent to the target.
    NoProxyAvailable,
}

impl FailureKind {
    /// Whether the proxy's failure counter is charged.
    pub fn counts_against_proxy(self) -> bool {
        matches!(
            self,
            FailureKind::Network | FailureKind::ProxyUnreachable | FailureKind::Timeout
        )
    }

    /// Whether the proxy should be taken out of rotation for a while.
    pub fn condemns_proxy(self) -> bool {
        self == FailureKind::ProxyUnreachable
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Network => write!(f, "network failure"),
            FailureKind::ProxyUnreachable => write!(f, "proxy unreachable"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Blocked => write!(f, "blocked"),
            FailureKind::NoProxyAvailable => write!(f, "no proxy available"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl UnitFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// What an executor reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success {
        summary: UnitSummary,
        response_time_ms: u64,
        cookie_verified: bool,
    },
    Failure {
        failure: UnitFailure,
        response_time_ms: u64,
    },
    Blocked {
        reason: String,
    },
}

impl AttemptOutcome {
    /// The collected summary, or the failure this outcome stands for.
    /// `Blocked` becomes a failure of kind [`FailureKind::Blocked`].
    pub fn into_result(self) -> Result<UnitSummary, UnitFailure> {
        match self {
            AttemptOutcome::Success { summary, .. } => Ok(summary),
            AttemptOutcome::Failure { failure, .. } => Err(failure),
            AttemptOutcome::Blocked { reason } => {
                Err(UnitFailure::new(FailureKind::Blocked, reason))
            }
        }
    }
}
