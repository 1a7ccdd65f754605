use std::time::Duration;

use crate::keypool::FailureReason;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    #[error("invalid: missing entry point (expected a `{0}` function or a full program)")]
    MissingEntryPoint(String),

    #[error("invalid: {0} program entry points after assembly")]
    ConflictingEntryPoints(usize),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("Safety margin must be in (0, 1] (given: {0})")]
    InvalidSafetyMargin(f64),

    #[error("Per-case time budget must be non-zero")]
    ZeroBudget,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("No credential with remaining quota is available")]
    NoneAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("Failed to decrypt secret of credential {0}")]
    Decrypt(String),
}

/// Failures talking to the judge. Judge-reported verdicts (compile error,
/// TLE, ...) are not errors; they come back inside `RemoteResult`.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("Judge rejected the credential (HTTP {0})")]
    AuthInvalid(u16),

    #[error("Judge reported the credential's quota as exceeded")]
    QuotaExceeded,

    #[error("Timed out after {0:?} waiting for the judge")]
    PollTimeout(Duration),

    #[error("Transient judge failure: {0}")]
    Transient(String),

    #[error("Http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected judge response: {0}")]
    Protocol(String),

    /// The judge accepted the submission before this failure; the attempt
    /// counts against the credential's quota
    #[error("Submission {token}: {source}")]
    AfterSubmit {
        token: String,
        #[source]
        source: Box<JudgeError>,
    },
}

impl JudgeError {
    /// How the key pool should account for this failure
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            JudgeError::AuthInvalid(_) => FailureReason::AuthInvalid,
            JudgeError::QuotaExceeded => FailureReason::QuotaExceeded,
            JudgeError::PollTimeout(_)
            | JudgeError::Transient(_)
            | JudgeError::Http(_)
            | JudgeError::Protocol(_) => FailureReason::Transient,
            JudgeError::AfterSubmit { source, .. } => source.failure_reason(),
        }
    }

    /// Whether a remote submission exists for this attempt
    pub fn was_submitted(&self) -> bool {
        matches!(self, JudgeError::AfterSubmit { .. })
    }

    /// The underlying failure, without the submission wrapper
    pub fn root(&self) -> &JudgeError {
        match self {
            JudgeError::AfterSubmit { source, .. } => source.root(),
            other => other,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Plan(#[from] PlanError),
}
