use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: u32,
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_public: bool,
}

impl TestCase {
    pub fn new(id: u32, input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            id,
            input: input.into(),
            expected_output: expected_output.into(),
            is_public: false,
        }
    }
}

/// Per-test-case outcome kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    Accepted,
    WrongAnswer,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    /// Judge produced fewer output lines than the batch had cases
    MissingOutput,
    /// No credential could be reserved for the batch
    CredentialExhausted,
    /// Network/5xx/poll timeout persisted through every retry
    RemoteTransient,
    Cancelled,
}

impl StatusKind {
    pub fn is_passed(self) -> bool {
        self == StatusKind::Accepted
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusKind::Accepted => "accepted",
            StatusKind::WrongAnswer => "wrong_answer",
            StatusKind::CompileError => "compile_error",
            StatusKind::RuntimeError => "runtime_error",
            StatusKind::TimeLimitExceeded => "time_limit_exceeded",
            StatusKind::MemoryLimitExceeded => "memory_limit_exceeded",
            StatusKind::MissingOutput => "missing_output",
            StatusKind::CredentialExhausted => "credential_exhausted",
            StatusKind::RemoteTransient => "remote_transient",
            StatusKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub test_case_id: u32,
    pub actual_output: String,
    pub passed: bool,
    pub status_kind: StatusKind,
    pub execution_time_ms: Option<u64>,
    pub memory_used_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Verdict {
    /// Verdict for a case that produced no output of its own
    pub fn failed(test_case_id: u32, status_kind: StatusKind, detail: Option<String>) -> Self {
        Self {
            test_case_id,
            actual_output: String::new(),
            passed: false,
            status_kind,
            execution_time_ms: None,
            memory_used_kb: None,
            detail,
        }
    }
}

pub type CredentialId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialStatus {
    #[default]
    Active,
    Exhausted,
    Invalid,
}

/// A judge API key registered by a user, with its daily quota
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default = "Uuid::new_v4")]
    pub id: CredentialId,
    pub owner_ref: String,
    pub encrypted_secret: String,
    #[serde(default)]
    pub status: CredentialStatus,
    #[serde(default)]
    pub daily_usage: u32,
    pub daily_limit: u32,
    #[serde(default = "Utc::now")]
    pub last_reset: DateTime<Utc>,
}

impl Credential {
    pub fn new(owner_ref: impl Into<String>, encrypted_secret: impl Into<String>, daily_limit: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_ref: owner_ref.into(),
            encrypted_secret: encrypted_secret.into(),
            status: CredentialStatus::Active,
            daily_usage: 0,
            daily_limit,
            last_reset: Utc::now(),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.daily_limit.saturating_sub(self.daily_usage)
    }
}

/// Hard limits advertised by the judge; submitted limits never exceed these
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCeilings {
    pub max_cpu_time_ms: u64,
    pub max_wall_time_ms: u64,
    pub max_memory_kb: u64,
}

impl PlatformCeilings {
    pub fn max_cpu_time(&self) -> Duration {
        Duration::from_millis(self.max_cpu_time_ms)
    }

    pub fn max_wall_time(&self) -> Duration {
        Duration::from_millis(self.max_wall_time_ms)
    }
}

impl Default for PlatformCeilings {
    // Judge0 CE defaults for max_cpu_time_limit / max_wall_time_limit / max_memory_limit
    fn default() -> Self {
        Self {
            max_cpu_time_ms: 15_000,
            max_wall_time_ms: 20_000,
            max_memory_kb: 512_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Complete,
    PartialFailure,
    Cancelled,
}

/// Aggregated result of one orchestration call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    /// One entry per input test case, in input order
    pub verdicts: Vec<Verdict>,
    pub calls_used: usize,
    pub calls_saved_vs_naive: i64,
    pub outcome: RunOutcome,
    pub warnings: Vec<String>,
    pub wall_time_ms: u64,
}

impl ExecutionReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == RunOutcome::Complete
    }

    pub fn passed_count(&self) -> usize {
        self.verdicts.iter().filter(|v| v.passed).count()
    }
}
