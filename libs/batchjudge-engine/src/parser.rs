/// Result Parser - Combined Output to Per-Case Verdicts
///
/// **Core Responsibility:**
/// Split the judge's combined stdout for a batch and compare each case's
/// line with its expected output.
///
/// **Critical Properties:**
/// - Knows nothing about HTTP, credentials or the judge
/// - Pure function: (stdout, batch) → verdicts, one per case, in order
///
/// **Alignment Rules:**
/// - The i-th non-empty stdout line belongs to the i-th case of the batch
/// - Cases left without a line are `MissingOutput`, never dropped
/// - Single-case batches compare the whole stdout
///
/// **Normalization Rules:**
/// - Trim leading/trailing whitespace: YES
/// - Ignore newline differences (\n vs \r\n): YES
/// - Collapse internal whitespace: NO (deliberate; `1  2` != `1 2`)
/// - Case sensitivity: YES

use batchjudge_common::types::{StatusKind, TestCase, Verdict};

use crate::planner::{Batch, Framing};

fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Judge one case's actual output against its expectation
pub fn evaluate_output(test_case: &TestCase, actual: &str) -> Verdict {
    let passed = normalize_output(actual) == normalize_output(&test_case.expected_output);
    Verdict {
        test_case_id: test_case.id,
        actual_output: actual.to_string(),
        passed,
        status_kind: if passed {
            StatusKind::Accepted
        } else {
            StatusKind::WrongAnswer
        },
        execution_time_ms: None,
        memory_used_kb: None,
        detail: None,
    }
}

pub fn parse(raw_stdout: &str, batch: &Batch) -> Vec<Verdict> {
    match batch.framing {
        Framing::SingleCase => batch
            .test_cases
            .iter()
            .map(|tc| evaluate_output(tc, raw_stdout))
            .collect(),
        Framing::MultiCase => {
            let mut lines = raw_stdout.lines().filter(|line| !line.trim().is_empty());
            batch
                .test_cases
                .iter()
                .map(|tc| match lines.next() {
                    Some(line) => evaluate_output(tc, line),
                    None => Verdict::failed(tc.id, StatusKind::MissingOutput, None),
                })
                .collect()
        }
    }
}

/// Same verdict kind for every case in the batch
pub fn failed_batch(batch: &Batch, kind: StatusKind, detail: Option<&str>) -> Vec<Verdict> {
    batch
        .test_cases
        .iter()
        .map(|tc| Verdict::failed(tc.id, kind, detail.map(str::to_string)))
        .collect()
}

/// After a batch-level failure with partial stdout, cases the output never
/// reached take the batch's failure kind
pub fn mark_unresolved(verdicts: &mut [Verdict], kind: StatusKind, detail: Option<&str>) {
    for verdict in verdicts
        .iter_mut()
        .filter(|v| v.status_kind == StatusKind::MissingOutput)
    {
        verdict.status_kind = kind;
        verdict.detail = detail.map(str::to_string);
    }
}
