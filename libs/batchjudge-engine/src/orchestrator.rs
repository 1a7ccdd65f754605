/// Execution Orchestrator - High-Level Orchestration
///
/// **Responsibility:**
/// Turn one user's solve code and a problem's test cases into one verdict
/// per test case, using as few judge submissions as possible.
///
/// **Architecture:**
/// 1. CodeTransformer builds the multi-case harness once (transformer.rs)
/// 2. BatchPlanner splits the cases under the judge's CPU ceiling (planner.rs)
/// 3. Per batch: KeyPool reserves a credential (keypool.rs), the judge client
///    submits and polls (client.rs), ResultParser produces verdicts (parser.rs)
/// 4. Verdicts are re-assembled in input order with call metrics
///
/// **Per-batch state machine:**
/// `CREDENTIAL_PENDING → SUBMITTING → POLLING → PARSING`, with a
/// `RETRY_WITH_NEW_CREDENTIAL` edge back to `CREDENTIAL_PENDING` on auth,
/// quota or transient failures. Retries share one budget across the whole
/// call; when it runs out, or the pool has nothing left, the call ends in
/// `PARTIAL_FAILURE` with whatever verdicts were obtained.
///
/// This module is the glue layer - it knows nothing about:
/// - How the judge protocol works (client's job)
/// - How outputs are compared (parser's job)

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use batchjudge_common::config::Settings;
use batchjudge_common::types::{
    CredentialId, ExecutionReport, PlatformCeilings, RunOutcome, StatusKind, TestCase, Verdict,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cipher::{PlainCipher, SecretCipher};
use crate::client::{JudgeApi, RemoteResult, SubmissionLimits, SubmissionRequest};
use crate::error::{OrchestrationError, PlanError};
use crate::keypool::{FailureReason, KeyPool};
use crate::parser;
use crate::planner::{self, Batch, BatchPlanner, Framing};
use crate::transformer::{CodeTransformer, TransformedProgram};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub safety_margin: f64,
    pub memory_limit_kb: u64,
    /// Known judge maxima; `None` asks the judge once per orchestrator
    pub ceilings: Option<PlatformCeilings>,
    /// Defaults to the pool size
    pub max_retries: Option<usize>,
    /// Defaults to the number of active credentials
    pub max_parallel_batches: Option<usize>,
    /// Base delay before retrying after a transient failure
    pub retry_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            safety_margin: planner::DEFAULT_SAFETY_MARGIN,
            memory_limit_kb: 256_000,
            ceilings: None,
            max_retries: None,
            max_parallel_batches: None,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            safety_margin: settings.batching.safety_margin,
            memory_limit_kb: settings.batching.memory_limit_kb,
            ceilings: settings.ceilings,
            max_retries: settings.orchestration.max_retries,
            max_parallel_batches: settings.orchestration.max_parallel_batches,
            ..Self::default()
        }
    }
}

/// One judge call, alive only while the batch is in flight
#[derive(Debug, Clone)]
struct SubmissionAttempt {
    batch_index: usize,
    credential: CredentialId,
    remote_token: Option<String>,
    submitted_at: DateTime<Utc>,
}

impl SubmissionAttempt {
    fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.submitted_at).num_milliseconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchStatus {
    Done,
    /// Pool or retry budget ran out before the batch got a judge result
    Unresolved,
    Cancelled,
}

#[derive(Debug)]
struct BatchOutcome {
    index: usize,
    status: BatchStatus,
    verdicts: Vec<Verdict>,
}

impl BatchOutcome {
    fn failed(batch: &Batch, status: BatchStatus, kind: StatusKind, detail: Option<&str>) -> Self {
        Self {
            index: batch.index,
            status,
            verdicts: parser::failed_batch(batch, kind, detail),
        }
    }
}

/// Counters shared by every batch of one call
struct RunState {
    calls_used: AtomicUsize,
    retries_left: AtomicUsize,
}

impl RunState {
    fn take_retry(&self) -> bool {
        self.retries_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

pub struct ExecutionOrchestrator {
    judge: Arc<dyn JudgeApi>,
    pool: KeyPool,
    cipher: Arc<dyn SecretCipher>,
    transformer: CodeTransformer,
    planner: BatchPlanner,
    config: OrchestratorConfig,
}

impl ExecutionOrchestrator {
    pub fn new(judge: Arc<dyn JudgeApi>, pool: KeyPool, config: OrchestratorConfig) -> Result<Self, PlanError> {
        Ok(Self {
            judge,
            pool,
            cipher: Arc::new(PlainCipher),
            transformer: CodeTransformer::default(),
            planner: BatchPlanner::new(config.safety_margin)?,
            config,
        })
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn SecretCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_transformer(mut self, transformer: CodeTransformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    pub async fn execute(
        &self,
        user_code: &str,
        test_cases: &[TestCase],
        per_case_budget: Duration,
    ) -> Result<ExecutionReport, OrchestrationError> {
        self.execute_until(user_code, test_cases, per_case_budget, None).await
    }

    /// Like `execute`, but gives up at `deadline`: in-flight polls are
    /// abandoned and every case without a verdict is reported `Cancelled`
    pub async fn execute_until(
        &self,
        user_code: &str,
        test_cases: &[TestCase],
        per_case_budget: Duration,
        deadline: Option<Instant>,
    ) -> Result<ExecutionReport, OrchestrationError> {
        self.execute_cancellable(user_code, test_cases, per_case_budget, deadline, std::future::pending())
            .await
    }

    /// `cancel` completing has the same effect as reaching `deadline`
    #[instrument(skip(self, user_code, test_cases, cancel), fields(test_count = test_cases.len()))]
    pub async fn execute_cancellable<C>(
        &self,
        user_code: &str,
        test_cases: &[TestCase],
        per_case_budget: Duration,
        deadline: Option<Instant>,
        cancel: C,
    ) -> Result<ExecutionReport, OrchestrationError>
    where
        C: Future<Output = ()>,
    {
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        // Code errors surface before any remote call
        let program = self.transformer.transform(user_code)?;

        if test_cases.is_empty() {
            info!(run_id = %run_id, "No test cases; nothing to submit");
            return Ok(ExecutionReport {
                run_id,
                verdicts: Vec::new(),
                outcome: RunOutcome::Complete,
                calls_used: 0,
                calls_saved_vs_naive: 0,
                warnings: Vec::new(),
                wall_time_ms: started.elapsed().as_millis() as u64,
            });
        }

        // PLANNING
        let ceilings = self.resolve_ceilings().await;
        let batches = if program.single_case_only {
            self.planner.plan_single_case(test_cases, per_case_budget, &ceilings)?
        } else {
            self.planner.plan(test_cases, per_case_budget, &ceilings)?
        };

        let warnings: Vec<String> = planner::warnings(&batches, per_case_budget, &ceilings)
            .iter()
            .map(ToString::to_string)
            .collect();
        for warning in &warnings {
            warn!(run_id = %run_id, "{}", warning);
        }

        info!(
            run_id = %run_id,
            test_count = test_cases.len(),
            batch_count = batches.len(),
            single_case_only = program.single_case_only,
            "Planned batches"
        );

        let state = RunState {
            calls_used: AtomicUsize::new(0),
            retries_left: AtomicUsize::new(self.config.max_retries.unwrap_or(self.pool.len().max(1))),
        };
        let parallelism = self
            .config
            .max_parallel_batches
            .unwrap_or_else(|| self.pool.active_count())
            .max(1);

        let mut outcomes: Vec<Option<BatchOutcome>> = (0..batches.len()).map(|_| None).collect();
        let mut cancelled = false;
        {
            let mut pending = stream::iter(batches.iter())
                .map(|batch| self.run_batch(&program, batch, &ceilings, &state, deadline))
                .buffer_unordered(parallelism);

            tokio::pin!(cancel);

            loop {
                let next = tokio::select! {
                    item = pending.next() => Some(item),
                    _ = &mut cancel => None,
                    _ = wait_for(deadline) => None,
                };
                match next {
                    Some(Some(outcome)) => {
                        let index = outcome.index;
                        outcomes[index] = Some(outcome);
                    }
                    Some(None) => break,
                    None => {
                        warn!(run_id = %run_id, "Run cancelled; abandoning in-flight batches");
                        cancelled = true;
                        break;
                    }
                }
            }
            // dropping `pending` abandons in-flight polls and releases their reservations
        }

        // AGGREGATING
        let mut verdicts = Vec::with_capacity(test_cases.len());
        let mut partial = false;
        for (batch, outcome) in batches.iter().zip(outcomes) {
            match outcome {
                Some(outcome) => {
                    match outcome.status {
                        BatchStatus::Done => {}
                        BatchStatus::Unresolved => partial = true,
                        BatchStatus::Cancelled => cancelled = true,
                    }
                    verdicts.extend(outcome.verdicts);
                }
                None => verdicts.extend(parser::failed_batch(batch, StatusKind::Cancelled, None)),
            }
        }

        let outcome = if cancelled {
            RunOutcome::Cancelled
        } else if partial {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Complete
        };
        let calls_used = state.calls_used.load(Ordering::SeqCst);

        let report = ExecutionReport {
            run_id,
            calls_saved_vs_naive: test_cases.len() as i64 - calls_used as i64,
            calls_used,
            verdicts,
            outcome,
            warnings,
            wall_time_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            run_id = %run_id,
            outcome = ?report.outcome,
            passed = report.passed_count(),
            total = report.verdicts.len(),
            calls_used = report.calls_used,
            calls_saved = report.calls_saved_vs_naive,
            wall_time_ms = report.wall_time_ms,
            "Orchestration finished"
        );

        Ok(report)
    }

    /// Configured ceilings, else the judge's advertised ones, else defaults
    async fn resolve_ceilings(&self) -> PlatformCeilings {
        if let Some(ceilings) = self.config.ceilings {
            return ceilings;
        }

        let mut tried: HashSet<CredentialId> = HashSet::new();
        loop {
            let reservation = match self.pool.reserve_excluding(&tried) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "Cannot query judge limits; using defaults");
                    return PlatformCeilings::default();
                }
            };
            tried.insert(reservation.id());

            let secret = match self.cipher.decrypt(reservation.credential()) {
                Ok(secret) => secret,
                Err(e) => {
                    warn!(credential = %reservation.id(), error = %e, "Unusable credential secret");
                    self.pool.record_failure(reservation, FailureReason::AuthInvalid);
                    continue;
                }
            };

            match self.judge.ceilings(&secret).await {
                // the limits query is not a submission; the reservation is released uncharged
                Ok(ceilings) => return ceilings,
                Err(e) => {
                    let reason = e.failure_reason();
                    self.pool.record_failure(reservation, reason);
                    if reason == FailureReason::Transient {
                        warn!(error = %e, "Failed to query judge limits; using defaults");
                        return PlatformCeilings::default();
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(batch = batch.index, cases = batch.len()))]
    async fn run_batch(
        &self,
        program: &TransformedProgram,
        batch: &Batch,
        ceilings: &PlatformCeilings,
        state: &RunState,
        deadline: Option<Instant>,
    ) -> BatchOutcome {
        let limits = SubmissionLimits::for_batch(batch, self.config.memory_limit_kb, ceilings);
        let request = SubmissionRequest::for_batch(&program.source, batch, limits);
        let mut tried: HashSet<CredentialId> = HashSet::new();
        let mut last_error: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            if deadline_passed(deadline) {
                return BatchOutcome::failed(batch, BatchStatus::Cancelled, StatusKind::Cancelled, None);
            }

            // CREDENTIAL_PENDING
            let mut reservation = match self
                .pool
                .reserve_excluding(&tried)
                .or_else(|_| self.pool.reserve())
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "No credential for batch");
                    return BatchOutcome::failed(
                        batch,
                        BatchStatus::Unresolved,
                        StatusKind::CredentialExhausted,
                        last_error.as_deref(),
                    );
                }
            };
            let credential_id = reservation.id();
            tried.insert(credential_id);

            let secret = match self.cipher.decrypt(reservation.credential()) {
                Ok(secret) => secret,
                Err(e) => {
                    warn!(credential = %credential_id, error = %e, "Unusable credential secret");
                    self.pool.record_failure(reservation, FailureReason::AuthInvalid);
                    last_error = Some(e.to_string());
                    if !state.take_retry() {
                        return BatchOutcome::failed(
                            batch,
                            BatchStatus::Unresolved,
                            StatusKind::CredentialExhausted,
                            last_error.as_deref(),
                        );
                    }
                    continue;
                }
            };

            // SUBMITTING / POLLING
            let mut submission = SubmissionAttempt {
                batch_index: batch.index,
                credential: credential_id,
                remote_token: None,
                submitted_at: Utc::now(),
            };
            state.calls_used.fetch_add(1, Ordering::SeqCst);
            attempt += 1;
            reservation.begin_submission();

            match self.judge.submit(&request, &secret, deadline).await {
                Ok(result) => {
                    self.pool.record_success(reservation);
                    submission.remote_token = Some(result.token.clone());
                    debug!(
                        batch = submission.batch_index,
                        credential = %submission.credential,
                        token = submission.remote_token.as_deref().unwrap_or(""),
                        elapsed_ms = submission.elapsed_ms(),
                        status = ?result.status,
                        "Judge result received"
                    );

                    // PARSING
                    return BatchOutcome {
                        index: batch.index,
                        status: BatchStatus::Done,
                        verdicts: self.verdicts_for(batch, &result, &limits),
                    };
                }
                Err(e) => {
                    let reason = e.failure_reason();
                    warn!(
                        batch = submission.batch_index,
                        credential = %submission.credential,
                        elapsed_ms = submission.elapsed_ms(),
                        error = %e,
                        reason = ?reason,
                        attempt = attempt,
                        submitted = e.was_submitted(),
                        "Submission failed"
                    );
                    if e.was_submitted() {
                        self.pool.record_failure_after_submit(reservation, reason);
                    } else {
                        self.pool.record_failure(reservation, reason);
                    }

                    if deadline_passed(deadline) {
                        return BatchOutcome::failed(batch, BatchStatus::Cancelled, StatusKind::Cancelled, None);
                    }

                    last_error = Some(e.to_string());
                    if !state.take_retry() {
                        let kind = match reason {
                            FailureReason::Transient => StatusKind::RemoteTransient,
                            FailureReason::AuthInvalid | FailureReason::QuotaExceeded => {
                                StatusKind::CredentialExhausted
                            }
                        };
                        return BatchOutcome::failed(batch, BatchStatus::Unresolved, kind, last_error.as_deref());
                    }

                    // RETRY_WITH_NEW_CREDENTIAL
                    if reason == FailureReason::Transient && !self.config.retry_backoff.is_zero() {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
            }
        }
    }

    fn verdicts_for(&self, batch: &Batch, result: &RemoteResult, limits: &SubmissionLimits) -> Vec<Verdict> {
        let detail = result.diagnostics();
        let stdout = result.stdout.as_deref().unwrap_or("");

        let mut verdicts = match result.failure_kind(limits.memory_kb) {
            None => parser::parse(stdout, batch),
            Some(StatusKind::CompileError) => {
                parser::failed_batch(batch, StatusKind::CompileError, detail.as_deref())
            }
            Some(kind) if batch.framing == Framing::MultiCase && !stdout.trim().is_empty() => {
                let mut verdicts = parser::parse(stdout, batch);
                parser::mark_unresolved(&mut verdicts, kind, detail.as_deref());
                verdicts
            }
            Some(kind) => parser::failed_batch(batch, kind, detail.as_deref()),
        };

        // Judge measures the whole batch; spread time evenly, memory is the batch peak
        let per_case_ms = result
            .time
            .map(|t| t.as_millis() as u64 / batch.len().max(1) as u64);
        for verdict in &mut verdicts {
            verdict.execution_time_ms = per_case_ms;
            verdict.memory_used_kb = result.memory_kb;
        }
        verdicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::JudgeStatus;
    use crate::error::{JudgeError, TransformError};
    use async_trait::async_trait;
    use batchjudge_common::types::{Credential, CredentialStatus};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    const SOLVE_SUM: &str = r#"
#include <bits/stdc++.h>
using namespace std;

void solve() {
    long long a, b;
    cin >> a >> b;
    cout << a + b << "\n";
}
"#;

    const FULL_PROGRAM: &str = r#"
#include <iostream>
int main() {
    long long a, b;
    std::cin >> a >> b;
    std::cout << a + b << std::endl;
}
"#;

    #[derive(Debug, Clone, Copy)]
    enum Fail {
        Auth,
        Quota,
        Transient,
        /// Created remotely, then polling timed out
        Stalled,
        /// Created remotely, then the result fetch was rejected for the key
        RevokedWhilePolling,
    }

    impl Fail {
        fn into_error(self) -> JudgeError {
            match self {
                Fail::Auth => JudgeError::AuthInvalid(401),
                Fail::Quota => JudgeError::QuotaExceeded,
                Fail::Transient => JudgeError::Transient("502 Bad Gateway".to_string()),
                Fail::Stalled => JudgeError::AfterSubmit {
                    token: "tok".to_string(),
                    source: Box::new(JudgeError::PollTimeout(Duration::from_secs(1))),
                },
                Fail::RevokedWhilePolling => JudgeError::AfterSubmit {
                    token: "tok".to_string(),
                    source: Box::new(JudgeError::AuthInvalid(401)),
                },
            }
        }
    }

    type Behavior = Box<dyn Fn(&SubmissionRequest<'_>) -> RemoteResult + Send + Sync>;

    /// In-process judge that "runs" an a+b program over the submitted stdin
    struct FakeJudge {
        behavior: Behavior,
        failing_secrets: HashMap<String, Fail>,
        one_shot: Mutex<VecDeque<Fail>>,
        delay: Duration,
        submissions: Mutex<Vec<(String, String)>>,
        ceilings_calls: AtomicUsize,
    }

    impl FakeJudge {
        fn new() -> Self {
            Self {
                behavior: Box::new(|req| accepted(&run_sum(req))),
                failing_secrets: HashMap::new(),
                one_shot: Mutex::new(VecDeque::new()),
                delay: Duration::ZERO,
                submissions: Mutex::new(Vec::new()),
                ceilings_calls: AtomicUsize::new(0),
            }
        }

        fn with_behavior(mut self, behavior: Behavior) -> Self {
            self.behavior = behavior;
            self
        }

        fn failing(mut self, secret: &str, fail: Fail) -> Self {
            self.failing_secrets.insert(secret.to_string(), fail);
            self
        }

        fn fail_next(self, fail: Fail) -> Self {
            self.one_shot.lock().unwrap().push_back(fail);
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn submitted_secrets(&self) -> Vec<String> {
            self.submissions.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
        }

        fn submitted_stdins(&self) -> Vec<String> {
            self.submissions.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
        }
    }

    #[async_trait]
    impl JudgeApi for FakeJudge {
        async fn ceilings(&self, _secret: &str) -> Result<PlatformCeilings, JudgeError> {
            self.ceilings_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ceilings())
        }

        async fn submit(
            &self,
            request: &SubmissionRequest<'_>,
            secret: &str,
            _deadline: Option<Instant>,
        ) -> Result<RemoteResult, JudgeError> {
            self.submissions
                .lock()
                .unwrap()
                .push((secret.to_string(), request.stdin.to_string()));

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            if let Some(fail) = self.failing_secrets.get(secret) {
                return Err(fail.into_error());
            }
            let one_shot = self.one_shot.lock().unwrap().pop_front();
            if let Some(fail) = one_shot {
                return Err(fail.into_error());
            }
            Ok((self.behavior)(request))
        }
    }

    fn sum_line(line: &str) -> String {
        let total: i64 = line
            .split_whitespace()
            .filter_map(|tok| tok.parse::<i64>().ok())
            .sum();
        total.to_string()
    }

    /// Output an a+b program would print for the request's stdin
    fn run_sum(request: &SubmissionRequest<'_>) -> String {
        let mut lines = request.stdin.lines();
        if request.source_code.contains("while (T-- > 0)") {
            let t: usize = lines.next().and_then(|l| l.trim().parse().ok()).unwrap_or(0);
            lines.take(t).map(sum_line).collect::<Vec<_>>().join("\n")
        } else {
            lines.next().map(sum_line).unwrap_or_default()
        }
    }

    fn accepted(stdout: &str) -> RemoteResult {
        RemoteResult {
            token: "tok".to_string(),
            status: JudgeStatus::Accepted,
            stdout: Some(stdout.to_string()),
            stderr: None,
            compile_output: None,
            message: None,
            time: Some(Duration::from_millis(50)),
            memory_kb: Some(3_000),
        }
    }

    fn ceilings() -> PlatformCeilings {
        PlatformCeilings {
            max_cpu_time_ms: 10_000,
            max_wall_time_ms: 20_000,
            max_memory_kb: 512_000,
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            ceilings: Some(ceilings()),
            retry_backoff: Duration::ZERO,
            ..OrchestratorConfig::default()
        }
    }

    fn key(secret: &str, usage: u32, limit: u32) -> Credential {
        let mut c = Credential::new(format!("owner-{}", secret), secret, limit);
        c.daily_usage = usage;
        c
    }

    fn sum_cases(inputs: &[(i64, i64)]) -> Vec<TestCase> {
        inputs
            .iter()
            .enumerate()
            .map(|(i, (a, b))| TestCase::new(i as u32 + 1, format!("{} {}", a, b), (a + b).to_string()))
            .collect()
    }

    fn orchestrator(judge: FakeJudge, keys: Vec<Credential>, config: OrchestratorConfig) -> (Arc<FakeJudge>, ExecutionOrchestrator) {
        let judge = Arc::new(judge);
        let orch = ExecutionOrchestrator::new(judge.clone(), KeyPool::new(keys), config).unwrap();
        (judge, orch)
    }

    #[tokio::test]
    async fn test_five_cases_one_submission() {
        let judge = FakeJudge::new().with_behavior(Box::new(|_| accepted("3\n12\n30\n300\n10")));
        let (judge, orch) = orchestrator(judge, vec![key("k1", 0, 100)], config());
        let cases: Vec<TestCase> = ["1 2", "5 7", "10 20", "100 200", "-5 15"]
            .iter()
            .zip(["3", "12", "30", "300", "10"])
            .enumerate()
            .map(|(i, (input, expected))| TestCase::new(i as u32 + 1, *input, expected))
            .collect();

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.verdicts.len(), 5);
        assert!(report.verdicts.iter().all(|v| v.passed));
        assert_eq!(report.calls_used, 1);
        assert_eq!(report.calls_saved_vs_naive, 4);
        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(
            judge.submitted_stdins(),
            vec!["5\n1 2\n5 7\n10 20\n100 200\n-5 15\n".to_string()]
        );
        assert_eq!(report.verdicts[0].execution_time_ms, Some(10));
        assert_eq!(report.verdicts[0].memory_used_kb, Some(3_000));
    }

    #[tokio::test]
    async fn test_twenty_cases_three_submissions() {
        let (_judge, orch) = orchestrator(FakeJudge::new(), vec![key("k1", 0, 100)], config());
        let cases = sum_cases(&(0..20).map(|i| (i, i * 3)).collect::<Vec<_>>());

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.calls_used, 3);
        assert_eq!(report.calls_saved_vs_naive, 17);
        assert_eq!(report.verdicts.len(), 20);
        assert!(report.verdicts.iter().all(|v| v.passed));
        let ids: Vec<u32> = report.verdicts.iter().map(|v| v.test_case_id).collect();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
        assert_eq!(orch.pool().snapshot()[0].daily_usage, 3);
    }

    #[tokio::test]
    async fn test_parallel_batches_spread_over_keys() {
        let keys = vec![key("k1", 0, 100), key("k2", 0, 100), key("k3", 0, 100)];
        let (judge, orch) = orchestrator(FakeJudge::new(), keys, config());
        let cases = sum_cases(&(0..24).map(|i| (i, 1)).collect::<Vec<_>>());

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.passed_count(), 24);
        let used: u32 = orch.pool().snapshot().iter().map(|c| c.daily_usage).sum();
        assert_eq!(used, 3);
        assert_eq!(judge.submitted_secrets().len(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_rotates_credential() {
        let judge = FakeJudge::new().failing("bad", Fail::Auth);
        let (judge, orch) = orchestrator(judge, vec![key("bad", 0, 100), key("good", 1, 100)], config());
        let cases = sum_cases(&[(1, 2), (3, 4)]);

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.passed_count(), 2);
        assert_eq!(report.calls_used, 2);
        assert_eq!(judge.submitted_secrets(), vec!["bad".to_string(), "good".to_string()]);

        let snapshot = orch.pool().snapshot();
        let bad = snapshot.iter().find(|c| c.encrypted_secret == "bad").unwrap();
        assert_eq!(bad.status, CredentialStatus::Invalid);
        let good = snapshot.iter().find(|c| c.encrypted_secret == "good").unwrap();
        assert_eq!(good.daily_usage, 2);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_elsewhere() {
        let judge = FakeJudge::new().fail_next(Fail::Transient);
        let (judge, orch) = orchestrator(judge, vec![key("a", 0, 100), key("b", 1, 100)], config());
        let cases = sum_cases(&[(1, 1)]);

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(judge.submitted_secrets(), vec!["a".to_string(), "b".to_string()]);
        let a = orch.pool().snapshot().into_iter().find(|c| c.encrypted_secret == "a").unwrap();
        assert_eq!(a.status, CredentialStatus::Active);
        assert_eq!(a.daily_usage, 0);
    }

    #[tokio::test]
    async fn test_poll_timeout_after_create_is_charged() {
        let judge = FakeJudge::new().fail_next(Fail::Stalled);
        let (judge, orch) = orchestrator(judge, vec![key("a", 0, 100), key("b", 1, 100)], config());
        let cases = sum_cases(&[(1, 1)]);

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.calls_used, 2);
        assert_eq!(judge.submitted_secrets(), vec!["a".to_string(), "b".to_string()]);

        let snapshot = orch.pool().snapshot();
        let a = snapshot.iter().find(|c| c.encrypted_secret == "a").unwrap();
        assert_eq!(a.status, CredentialStatus::Active);
        assert_eq!(a.daily_usage, 1);
        let used: u32 = snapshot.iter().map(|c| c.daily_usage).sum();
        assert_eq!(used as usize, report.calls_used + 1);
    }

    #[tokio::test]
    async fn test_key_rejected_while_polling_rotates_and_charges() {
        let judge = FakeJudge::new().failing("revoked", Fail::RevokedWhilePolling);
        let (_judge, orch) = orchestrator(judge, vec![key("revoked", 0, 100), key("good", 5, 100)], config());
        let cases = sum_cases(&[(2, 3)]);

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.passed_count(), 1);
        let snapshot = orch.pool().snapshot();
        let revoked = snapshot.iter().find(|c| c.encrypted_secret == "revoked").unwrap();
        assert_eq!(revoked.status, CredentialStatus::Invalid);
        assert_eq!(revoked.daily_usage, 1);
        let good = snapshot.iter().find(|c| c.encrypted_secret == "good").unwrap();
        assert_eq!(good.daily_usage, 6);
    }

    #[tokio::test]
    async fn test_persistent_transient_exhausts_retry_budget() {
        let judge = FakeJudge::new().failing("only", Fail::Transient);
        let (_judge, orch) = orchestrator(judge, vec![key("only", 0, 100)], config());
        let cases = sum_cases(&[(1, 1), (2, 2)]);

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::PartialFailure);
        assert_eq!(report.calls_used, 2);
        assert!(report
            .verdicts
            .iter()
            .all(|v| v.status_kind == StatusKind::RemoteTransient && !v.passed));
    }

    #[tokio::test]
    async fn test_all_keys_over_quota_is_partial_failure() {
        let judge = FakeJudge::new().failing("a", Fail::Quota).failing("b", Fail::Quota);
        let (_judge, orch) = orchestrator(judge, vec![key("a", 0, 100), key("b", 0, 100)], config());
        let cases = sum_cases(&[(1, 1), (2, 2), (3, 3)]);

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::PartialFailure);
        assert_eq!(report.verdicts.len(), 3);
        assert!(report
            .verdicts
            .iter()
            .all(|v| v.status_kind == StatusKind::CredentialExhausted));
        assert!(orch
            .pool()
            .snapshot()
            .iter()
            .all(|c| c.status == CredentialStatus::Exhausted));
    }

    #[tokio::test]
    async fn test_empty_pool_reports_every_case() {
        let (judge, orch) = orchestrator(FakeJudge::new(), Vec::new(), config());
        let cases = sum_cases(&[(1, 1), (2, 2)]);

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::PartialFailure);
        assert_eq!(report.calls_used, 0);
        assert_eq!(report.verdicts.len(), 2);
        assert!(judge.submitted_secrets().is_empty());
    }

    #[tokio::test]
    async fn test_quota_runs_out_mid_call() {
        let cfg = OrchestratorConfig {
            max_parallel_batches: Some(1),
            ..config()
        };
        let (_judge, orch) = orchestrator(FakeJudge::new(), vec![key("k", 0, 2)], cfg);
        let cases = sum_cases(&(0..20).map(|i| (i, i)).collect::<Vec<_>>());

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::PartialFailure);
        assert_eq!(report.calls_used, 2);
        assert_eq!(report.calls_saved_vs_naive, 18);
        assert_eq!(report.verdicts.len(), 20);
        assert!(report.verdicts[..16].iter().all(|v| v.passed));
        assert!(report.verdicts[16..]
            .iter()
            .all(|v| v.status_kind == StatusKind::CredentialExhausted));
    }

    #[tokio::test]
    async fn test_compile_error_fails_every_case_without_retry() {
        let judge = FakeJudge::new().with_behavior(Box::new(|_| RemoteResult {
            status: JudgeStatus::CompilationError,
            stdout: None,
            compile_output: Some("main.cpp:6:5: error: expected ';'".to_string()),
            ..accepted("")
        }));
        let (_judge, orch) = orchestrator(judge, vec![key("k", 0, 100)], config());
        let cases = sum_cases(&[(1, 1), (2, 2)]);

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.calls_used, 1);
        assert!(report.is_complete());
        for v in &report.verdicts {
            assert_eq!(v.status_kind, StatusKind::CompileError);
            assert!(v.detail.as_deref().unwrap().contains("expected ';'"));
        }
    }

    #[tokio::test]
    async fn test_time_limit_with_partial_output() {
        let judge = FakeJudge::new().with_behavior(Box::new(|_| RemoteResult {
            status: JudgeStatus::TimeLimitExceeded,
            ..accepted("2\n4\n")
        }));
        let (_judge, orch) = orchestrator(judge, vec![key("k", 0, 100)], config());
        let cases = sum_cases(&[(1, 1), (2, 2), (3, 3), (4, 4)]);

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        let kinds: Vec<StatusKind> = report.verdicts.iter().map(|v| v.status_kind).collect();
        assert_eq!(
            kinds,
            vec![
                StatusKind::Accepted,
                StatusKind::Accepted,
                StatusKind::TimeLimitExceeded,
                StatusKind::TimeLimitExceeded
            ]
        );
    }

    #[tokio::test]
    async fn test_transform_error_makes_no_remote_call() {
        let (judge, orch) = orchestrator(FakeJudge::new(), vec![key("k", 0, 100)], config());
        let cases = sum_cases(&[(1, 1)]);

        let err = orch
            .execute("int helper() { return 1; }", &cases, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestrationError::Transform(TransformError::MissingEntryPoint(_))
        ));
        assert!(judge.submitted_secrets().is_empty());
    }

    #[tokio::test]
    async fn test_full_program_falls_back_to_single_case() {
        let (judge, orch) = orchestrator(FakeJudge::new(), vec![key("k", 0, 100)], config());
        let cases = sum_cases(&[(1, 2), (3, 4), (5, 6)]);

        let report = orch.execute(FULL_PROGRAM, &cases, Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.calls_used, 3);
        assert_eq!(report.calls_saved_vs_naive, 0);
        assert_eq!(report.passed_count(), 3);
        let mut stdins = judge.submitted_stdins();
        stdins.sort();
        assert_eq!(stdins, vec!["1 2", "3 4", "5 6"]);
    }

    #[tokio::test]
    async fn test_no_test_cases() {
        let cfg = OrchestratorConfig {
            ceilings: None,
            ..config()
        };
        let (judge, orch) = orchestrator(FakeJudge::new(), vec![key("k", 0, 100)], cfg);

        let report = orch.execute(SOLVE_SUM, &[], Duration::from_secs(1)).await.unwrap();

        assert!(report.verdicts.is_empty());
        assert_eq!(report.calls_used, 0);
        assert_eq!(report.calls_saved_vs_naive, 0);
        assert_eq!(report.outcome, RunOutcome::Complete);
        assert!(judge.submitted_secrets().is_empty());
        assert_eq!(judge.ceilings_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deadline_returns_cancelled_verdicts() {
        let judge = FakeJudge::new().delayed(Duration::from_secs(5));
        let (_judge, orch) = orchestrator(judge, vec![key("k", 0, 100)], config());
        let cases = sum_cases(&[(1, 1), (2, 2)]);

        let deadline = Instant::now() + Duration::from_millis(50);
        let report = orch
            .execute_until(SOLVE_SUM, &cases, Duration::from_secs(1), Some(deadline))
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.verdicts.len(), 2);
        assert!(report.verdicts.iter().all(|v| v.status_kind == StatusKind::Cancelled));

        // the abandoned submission already reached the judge, so it counts
        let snapshot = orch.pool().snapshot();
        assert_eq!(snapshot[0].daily_usage, report.calls_used as u32);
        assert_eq!(report.calls_used, 1);
        assert!(orch.pool().reserve().is_ok());
    }

    #[tokio::test]
    async fn test_ceilings_discovered_from_judge() {
        let cfg = OrchestratorConfig {
            ceilings: None,
            ..config()
        };
        let (judge, orch) = orchestrator(FakeJudge::new(), vec![key("k", 0, 100)], cfg);
        let cases = sum_cases(&(0..20).map(|i| (i, 1)).collect::<Vec<_>>());

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.calls_used, 3);
        assert_eq!(judge.ceilings_calls.load(Ordering::SeqCst), 1);
        // the limits query is not charged against the key
        assert_eq!(orch.pool().snapshot()[0].daily_usage, 3);
    }

    #[tokio::test]
    async fn test_oversized_budget_warns_but_submits() {
        let (_judge, orch) = orchestrator(FakeJudge::new(), vec![key("k", 0, 100)], config());
        let cases = sum_cases(&[(1, 1), (2, 2)]);

        let report = orch.execute(SOLVE_SUM, &cases, Duration::from_secs(12)).await.unwrap();

        assert_eq!(report.calls_used, 2);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_external_cancel_keeps_finished_batches() {
        let cfg = OrchestratorConfig {
            max_parallel_batches: Some(1),
            ..config()
        };
        let judge = FakeJudge::new().delayed(Duration::from_millis(100));
        let (_judge, orch) = orchestrator(judge, vec![key("k", 0, 100)], cfg);
        let cases = sum_cases(&(0..24).map(|i| (i, i)).collect::<Vec<_>>());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = tx.send(());
        });
        let cancel = async {
            let _ = rx.await;
        };

        let report = orch
            .execute_cancellable(SOLVE_SUM, &cases, Duration::from_secs(1), None, cancel)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.verdicts.len(), 24);
        assert!(report.verdicts[..8].iter().all(|v| v.passed));
        assert!(report.verdicts[16..]
            .iter()
            .all(|v| v.status_kind == StatusKind::Cancelled));
    }
}
