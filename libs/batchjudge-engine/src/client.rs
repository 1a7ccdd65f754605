/// Execution Client - Judge0 Protocol
///
/// **Core Responsibility:**
/// Submit one batch (source + combined stdin) to the remote judge and wait
/// for a terminal status.
///
/// **Critical Architectural Boundary:**
/// - Client knows HOW to talk to the judge (create, poll, decode)
/// - Client does NOT know which credential to use or how to rotate them
/// - Client does NOT evaluate correctness
/// - Client returns the raw judge result for the parser to judge
///
/// **Protocol:**
/// 1. `POST /submissions?base64_encoded=true&wait=false` returns a token
/// 2. `GET /submissions/{token}` every poll interval until a terminal status,
///    bounded by `estimated_time_budget + overhead_margin` and the caller's
///    deadline
///
/// Once step 1 has produced a token, any failure comes back wrapped in
/// `JudgeError::AfterSubmit`: the judge has counted that submission.
///
/// Every `submit` call makes exactly one remote submission. Retries are
/// fresh submissions; the judge is not assumed to support resubmission.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use batchjudge_common::config::{JudgeSettings, PollingSettings};
use batchjudge_common::types::{PlatformCeilings, StatusKind};
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::JudgeError;
use crate::planner::Batch;

const RESULT_FIELDS: &str = "token,status,stdout,stderr,compile_output,message,time,memory";

/// Runtime error flavours reported by Judge0 (status ids 7-12)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Sigsegv,
    Sigxfsz,
    Sigfpe,
    Sigabrt,
    Nzec,
    Other,
}

/// Judge status, validated once at the protocol boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeStatus {
    InQueue,
    Processing,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    CompilationError,
    RuntimeError(RuntimeKind),
    InternalError,
    ExecFormatError,
    Unknown { id: u32, description: String },
}

impl JudgeStatus {
    pub fn from_wire(id: u32, description: &str) -> Self {
        match id {
            1 => JudgeStatus::InQueue,
            2 => JudgeStatus::Processing,
            3 => JudgeStatus::Accepted,
            4 => JudgeStatus::WrongAnswer,
            5 => JudgeStatus::TimeLimitExceeded,
            6 => JudgeStatus::CompilationError,
            7 => JudgeStatus::RuntimeError(RuntimeKind::Sigsegv),
            8 => JudgeStatus::RuntimeError(RuntimeKind::Sigxfsz),
            9 => JudgeStatus::RuntimeError(RuntimeKind::Sigfpe),
            10 => JudgeStatus::RuntimeError(RuntimeKind::Sigabrt),
            11 => JudgeStatus::RuntimeError(RuntimeKind::Nzec),
            12 => JudgeStatus::RuntimeError(RuntimeKind::Other),
            13 => JudgeStatus::InternalError,
            14 => JudgeStatus::ExecFormatError,
            _ => JudgeStatus::Unknown {
                id,
                description: description.to_string(),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JudgeStatus::InQueue | JudgeStatus::Processing)
    }
}

/// Limits sent with a submission, already capped to the judge's maxima
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionLimits {
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory_kb: u64,
}

impl SubmissionLimits {
    pub fn for_batch(batch: &Batch, memory_kb: u64, ceilings: &PlatformCeilings) -> Self {
        let cpu_time = batch.estimated_time_budget.min(ceilings.max_cpu_time());
        let wall_time = (batch.estimated_time_budget * 2)
            .min(ceilings.max_wall_time())
            .max(cpu_time.min(ceilings.max_wall_time()));
        Self {
            cpu_time,
            wall_time,
            memory_kb: memory_kb.min(ceilings.max_memory_kb),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionRequest<'a> {
    pub source_code: &'a str,
    pub stdin: &'a str,
    pub limits: SubmissionLimits,
    pub estimated_time_budget: Duration,
}

impl<'a> SubmissionRequest<'a> {
    pub fn for_batch(source_code: &'a str, batch: &'a Batch, limits: SubmissionLimits) -> Self {
        Self {
            source_code,
            stdin: &batch.combined_stdin,
            limits,
            estimated_time_budget: batch.estimated_time_budget,
        }
    }
}

/// Terminal judge result for one submission, payloads already decoded
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResult {
    pub token: String,
    pub status: JudgeStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub message: Option<String>,
    pub time: Option<Duration>,
    pub memory_kb: Option<u64>,
}

impl RemoteResult {
    /// Batch-level failure kind, or `None` when stdout should be parsed as-is
    pub fn failure_kind(&self, memory_limit_kb: u64) -> Option<StatusKind> {
        match &self.status {
            JudgeStatus::Accepted | JudgeStatus::WrongAnswer => None,
            JudgeStatus::CompilationError => Some(StatusKind::CompileError),
            JudgeStatus::TimeLimitExceeded => Some(StatusKind::TimeLimitExceeded),
            // Judge0 has no memory status; a killed run at the cap is the signal
            JudgeStatus::RuntimeError(_) if self.memory_kb.is_some_and(|m| m >= memory_limit_kb) => {
                Some(StatusKind::MemoryLimitExceeded)
            }
            JudgeStatus::RuntimeError(_)
            | JudgeStatus::ExecFormatError
            | JudgeStatus::InternalError
            | JudgeStatus::Unknown { .. }
            | JudgeStatus::InQueue
            | JudgeStatus::Processing => Some(StatusKind::RuntimeError),
        }
    }

    /// Human-readable diagnostics for failed verdicts
    pub fn diagnostics(&self) -> Option<String> {
        self.compile_output
            .as_deref()
            .or(self.stderr.as_deref())
            .or(self.message.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
pub trait JudgeApi: Send + Sync {
    /// The judge's advertised maxima; implementations query once and cache
    async fn ceilings(&self, secret: &str) -> Result<PlatformCeilings, JudgeError>;

    async fn submit(
        &self,
        request: &SubmissionRequest<'_>,
        secret: &str,
        deadline: Option<Instant>,
    ) -> Result<RemoteResult, JudgeError>;
}

// ---------------------------------------------------------------------------
// Wire types

#[derive(Debug, Serialize)]
struct CreateSubmission {
    source_code: String,
    language_id: u32,
    stdin: String,
    cpu_time_limit: f64,
    wall_time_limit: f64,
    memory_limit: u64,
}

#[derive(Debug, Deserialize)]
struct CreatedSubmission {
    token: String,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    id: u32,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireSeconds {
    Number(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct SubmissionState {
    #[serde(default)]
    token: Option<String>,
    status: WireStatus,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    compile_output: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    time: Option<WireSeconds>,
    #[serde(default)]
    memory: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ConfigInfo {
    max_cpu_time_limit: f64,
    max_wall_time_limit: f64,
    max_memory_limit: u64,
}

fn encode(text: &str) -> String {
    general_purpose::STANDARD.encode(text)
}

/// Judge0 wraps base64 output at 60 columns; strip line breaks before decoding
fn decode(field: Option<String>) -> Result<Option<String>, JudgeError> {
    let Some(raw) = field else {
        return Ok(None);
    };
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| JudgeError::Protocol(format!("invalid base64 payload: {}", e)))?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

fn seconds_to_duration(value: Option<WireSeconds>) -> Option<Duration> {
    let secs = match value? {
        WireSeconds::Number(n) => n,
        WireSeconds::Text(s) => s.trim().parse().ok()?,
    };
    Duration::try_from_secs_f64(secs).ok()
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs * 1000.0).round().max(0.0) as u64
}

impl SubmissionState {
    fn into_result(self, token: &str) -> Result<RemoteResult, JudgeError> {
        Ok(RemoteResult {
            token: self.token.unwrap_or_else(|| token.to_string()),
            status: JudgeStatus::from_wire(self.status.id, &self.status.description),
            stdout: decode(self.stdout)?,
            stderr: decode(self.stderr)?,
            compile_output: decode(self.compile_output)?,
            message: decode(self.message)?,
            time: seconds_to_duration(self.time),
            memory_kb: self.memory,
        })
    }
}

/// Map a non-success HTTP status onto the failure taxonomy
fn classify_http(status: StatusCode, body: &str) -> JudgeError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => JudgeError::AuthInvalid(status.as_u16()),
        StatusCode::TOO_MANY_REQUESTS => JudgeError::QuotaExceeded,
        s if s.is_server_error() => JudgeError::Transient(format!("HTTP {}: {}", s.as_u16(), body.trim())),
        s => JudgeError::Protocol(format!("HTTP {}: {}", s.as_u16(), body.trim())),
    }
}

// ---------------------------------------------------------------------------

/// HTTP client for a Judge0-compatible service
pub struct Judge0Client {
    http: reqwest::Client,
    settings: JudgeSettings,
    polling: PollingSettings,
    ceilings: OnceCell<PlatformCeilings>,
}

impl Judge0Client {
    pub fn new(settings: JudgeSettings, polling: PollingSettings) -> Result<Self, JudgeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            settings,
            polling,
            ceilings: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: RequestBuilder, secret: &str) -> RequestBuilder {
        let builder = builder.header(self.settings.auth_header.as_str(), secret);
        match &self.settings.host_header {
            Some((name, value)) => builder.header(name.as_str(), value.as_str()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<String, JudgeError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                JudgeError::Transient(e.to_string())
            } else {
                JudgeError::Http(e)
            }
        })?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_http(status, &body));
        }
        Ok(body)
    }

    async fn create(&self, request: &SubmissionRequest<'_>, secret: &str) -> Result<String, JudgeError> {
        let payload = CreateSubmission {
            source_code: encode(request.source_code),
            language_id: self.settings.language_id,
            stdin: encode(request.stdin),
            cpu_time_limit: request.limits.cpu_time.as_secs_f64(),
            wall_time_limit: request.limits.wall_time.as_secs_f64(),
            memory_limit: request.limits.memory_kb,
        };

        let builder = self
            .http
            .post(self.url("/submissions"))
            .query(&[("base64_encoded", "true"), ("wait", "false")])
            .json(&payload);
        let body = self.send(self.authorize(builder, secret)).await?;

        let created: CreatedSubmission = serde_json::from_str(&body)
            .map_err(|e| JudgeError::Protocol(format!("invalid create response: {}", e)))?;
        Ok(created.token)
    }

    async fn fetch(&self, token: &str, secret: &str) -> Result<RemoteResult, JudgeError> {
        let builder = self
            .http
            .get(self.url(&format!("/submissions/{}", token)))
            .query(&[("base64_encoded", "true"), ("fields", RESULT_FIELDS)]);
        let body = self.send(self.authorize(builder, secret)).await?;

        let state: SubmissionState = serde_json::from_str(&body)
            .map_err(|e| JudgeError::Protocol(format!("invalid status response: {}", e)))?;
        state.into_result(token)
    }

    async fn poll(&self, token: &str, secret: &str, deadline: Instant, budget: Duration) -> Result<RemoteResult, JudgeError> {
        let mut consecutive_errors = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(token = %token, budget_ms = budget.as_millis() as u64, "Poll deadline reached");
                return Err(JudgeError::PollTimeout(budget));
            }
            tokio::time::sleep_until((now + self.polling.interval()).min(deadline)).await;

            match self.fetch(token, secret).await {
                Ok(result) if result.status == JudgeStatus::InternalError => {
                    return Err(JudgeError::Transient(format!(
                        "judge internal error for {}: {}",
                        token,
                        result.message.unwrap_or_default()
                    )));
                }
                Ok(result) if result.status.is_terminal() => {
                    debug!(token = %token, status = ?result.status, "Submission finished");
                    return Ok(result);
                }
                Ok(result) => {
                    consecutive_errors = 0;
                    debug!(token = %token, status = ?result.status, "Submission pending");
                }
                Err(e @ (JudgeError::AuthInvalid(_) | JudgeError::QuotaExceeded)) => return Err(e),
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(token = %token, error = %e, attempt = consecutive_errors, "Poll failed");
                    if consecutive_errors > self.polling.max_poll_errors {
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl JudgeApi for Judge0Client {
    async fn ceilings(&self, secret: &str) -> Result<PlatformCeilings, JudgeError> {
        let ceilings = self
            .ceilings
            .get_or_try_init(|| async {
                let builder = self.http.get(self.url("/config_info"));
                let body = self.send(self.authorize(builder, secret)).await?;
                let info: ConfigInfo = serde_json::from_str(&body)
                    .map_err(|e| JudgeError::Protocol(format!("invalid config_info: {}", e)))?;
                let ceilings = PlatformCeilings {
                    max_cpu_time_ms: secs_to_ms(info.max_cpu_time_limit),
                    max_wall_time_ms: secs_to_ms(info.max_wall_time_limit),
                    max_memory_kb: info.max_memory_limit,
                };
                info!(?ceilings, "Discovered judge limits");
                Ok::<_, JudgeError>(ceilings)
            })
            .await?;
        Ok(*ceilings)
    }

    async fn submit(
        &self,
        request: &SubmissionRequest<'_>,
        secret: &str,
        deadline: Option<Instant>,
    ) -> Result<RemoteResult, JudgeError> {
        let token = self.create(request, secret).await?;
        info!(
            token = %token,
            stdin_bytes = request.stdin.len(),
            cpu_limit_ms = request.limits.cpu_time.as_millis() as u64,
            "Submission created"
        );

        let budget = request.estimated_time_budget + self.polling.overhead_margin();
        let poll_deadline = Instant::now() + budget;
        let deadline = deadline.map_or(poll_deadline, |d| d.min(poll_deadline));

        self.poll(&token, secret, deadline, budget)
            .await
            .map_err(|e| JudgeError::AfterSubmit {
                token: token.clone(),
                source: Box::new(e),
            })
    }
}
