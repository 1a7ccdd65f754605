/// Batch Planner
///
/// Splits an ordered list of test cases into contiguous batches that fit the
/// judge's CPU ceiling:
///
/// `max_cases_per_batch = floor(safety_margin * max_cpu_time / per_case_budget)`
///
/// clamped to at least one. The margin absorbs judge start-up and scheduling
/// overhead, which inflates wall time beyond reported CPU time.
///
/// Batches never reorder or duplicate cases; concatenating them reproduces
/// the input exactly.

use std::time::Duration;

use batchjudge_common::types::{PlatformCeilings, TestCase};

use crate::error::PlanError;

pub const DEFAULT_SAFETY_MARGIN: f64 = 0.8;

/// How a batch's stdin is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `T` on the first line, then every case's input
    MultiCase,
    /// The raw input of the batch's only case
    SingleCase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub index: usize,
    pub test_cases: Vec<TestCase>,
    pub combined_stdin: String,
    pub estimated_time_budget: Duration,
    /// A single case whose budget alone exceeds the CPU ceiling
    pub may_exceed_limit: bool,
    pub framing: Framing,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.test_cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.test_cases.is_empty()
    }
}

/// Non-fatal planning findings; the batches are still submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    PlanningDegenerate {
        batch_index: usize,
        test_case_id: u32,
        budget: Duration,
        ceiling: Duration,
    },
}

impl std::fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanWarning::PlanningDegenerate {
                batch_index,
                test_case_id,
                budget,
                ceiling,
            } => write!(
                f,
                "batch {} (test case {}): per-case budget {:?} exceeds the judge CPU ceiling {:?}; likely timeout",
                batch_index, test_case_id, budget, ceiling
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    safety_margin: f64,
}

impl Default for BatchPlanner {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }
}

impl BatchPlanner {
    pub fn new(safety_margin: f64) -> Result<Self, PlanError> {
        if !(safety_margin > 0.0 && safety_margin <= 1.0) {
            return Err(PlanError::InvalidSafetyMargin(safety_margin));
        }
        Ok(Self { safety_margin })
    }

    pub fn safety_margin(&self) -> f64 {
        self.safety_margin
    }

    pub fn max_cases_per_batch(
        &self,
        per_case_budget: Duration,
        ceilings: &PlatformCeilings,
    ) -> Result<usize, PlanError> {
        if per_case_budget.is_zero() {
            return Err(PlanError::ZeroBudget);
        }
        let usable = self.safety_margin * ceilings.max_cpu_time().as_secs_f64();
        // epsilon keeps exact ratios like 0.8 * 15 / 1.2 from flooring one short
        let fits = (usable / per_case_budget.as_secs_f64() + 1e-9).floor() as usize;
        Ok(fits.max(1))
    }

    pub fn plan(
        &self,
        test_cases: &[TestCase],
        per_case_budget: Duration,
        ceilings: &PlatformCeilings,
    ) -> Result<Vec<Batch>, PlanError> {
        let max_cases = self.max_cases_per_batch(per_case_budget, ceilings)?;
        let may_exceed = per_case_budget > ceilings.max_cpu_time();

        let batches = test_cases
            .chunks(max_cases)
            .enumerate()
            .map(|(index, chunk)| Batch {
                index,
                test_cases: chunk.to_vec(),
                combined_stdin: combine_stdin(chunk),
                estimated_time_budget: per_case_budget * chunk.len() as u32,
                may_exceed_limit: may_exceed,
                framing: Framing::MultiCase,
            })
            .collect();

        Ok(batches)
    }

    /// One batch per case, stdin passed through unframed
    pub fn plan_single_case(
        &self,
        test_cases: &[TestCase],
        per_case_budget: Duration,
        ceilings: &PlatformCeilings,
    ) -> Result<Vec<Batch>, PlanError> {
        if per_case_budget.is_zero() {
            return Err(PlanError::ZeroBudget);
        }
        let may_exceed = per_case_budget > ceilings.max_cpu_time();

        Ok(test_cases
            .iter()
            .enumerate()
            .map(|(index, tc)| Batch {
                index,
                test_cases: vec![tc.clone()],
                combined_stdin: tc.input.clone(),
                estimated_time_budget: per_case_budget,
                may_exceed_limit: may_exceed,
                framing: Framing::SingleCase,
            })
            .collect())
    }
}

pub fn warnings(batches: &[Batch], per_case_budget: Duration, ceilings: &PlatformCeilings) -> Vec<PlanWarning> {
    batches
        .iter()
        .filter(|b| b.may_exceed_limit)
        .filter_map(|b| {
            b.test_cases.first().map(|tc| PlanWarning::PlanningDegenerate {
                batch_index: b.index,
                test_case_id: tc.id,
                budget: per_case_budget,
                ceiling: ceilings.max_cpu_time(),
            })
        })
        .collect()
}

fn combine_stdin(cases: &[TestCase]) -> String {
    let mut parts = Vec::with_capacity(cases.len() + 1);
    parts.push(cases.len().to_string());
    parts.extend(cases.iter().map(|tc| tc.input.trim_end_matches(['\n', '\r']).to_string()));
    let mut stdin = parts.join("\n");
    stdin.push('\n');
    stdin
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceilings(cpu_secs: u64) -> PlatformCeilings {
        PlatformCeilings {
            max_cpu_time_ms: cpu_secs * 1000,
            max_wall_time_ms: cpu_secs * 2000,
            max_memory_kb: 256_000,
        }
    }

    fn cases(n: u32) -> Vec<TestCase> {
        (1..=n)
            .map(|i| TestCase::new(i, format!("{} {}", i, i + 1), (2 * i + 1).to_string()))
            .collect()
    }

    #[test]
    fn test_max_cases_per_batch() {
        let planner = BatchPlanner::default();
        let n = planner
            .max_cases_per_batch(Duration::from_secs(1), &ceilings(10))
            .unwrap();
        assert_eq!(n, 8);
    }

    #[test]
    fn test_max_cases_clamped_to_one() {
        let planner = BatchPlanner::default();
        let n = planner
            .max_cases_per_batch(Duration::from_secs(30), &ceilings(10))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_five_cases_single_batch() {
        let planner = BatchPlanner::default();
        let batches = planner
            .plan(&cases(5), Duration::from_secs(1), &ceilings(10))
            .unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
        assert_eq!(batches[0].estimated_time_budget, Duration::from_secs(5));
        assert!(!batches[0].may_exceed_limit);
    }

    #[test]
    fn test_twenty_cases_split_8_8_4() {
        let planner = BatchPlanner::default();
        let batches = planner
            .plan(&cases(20), Duration::from_secs(1), &ceilings(10))
            .unwrap();

        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![8, 8, 4]);
        let indices: Vec<usize> = batches.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_batches_partition_input_in_order() {
        let planner = BatchPlanner::default();
        for n in [1u32, 7, 8, 9, 16, 17, 33] {
            let input = cases(n);
            let batches = planner
                .plan(&input, Duration::from_secs(1), &ceilings(10))
                .unwrap();

            let k = 8usize;
            assert_eq!(batches.len(), (n as usize + k - 1) / k, "n = {}", n);
            let flattened: Vec<TestCase> = batches.into_iter().flat_map(|b| b.test_cases).collect();
            assert_eq!(flattened, input, "n = {}", n);
        }
    }

    #[test]
    fn test_zero_cases_empty_plan() {
        let planner = BatchPlanner::default();
        let batches = planner
            .plan(&[], Duration::from_secs(1), &ceilings(10))
            .unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_combined_stdin_layout() {
        let planner = BatchPlanner::default();
        let input = vec![
            TestCase::new(1, "1 2", "3"),
            TestCase::new(2, "5 7\n", "12"),
        ];
        let batches = planner
            .plan(&input, Duration::from_secs(1), &ceilings(10))
            .unwrap();

        assert_eq!(batches[0].combined_stdin, "2\n1 2\n5 7\n");
        assert_eq!(batches[0].framing, Framing::MultiCase);
    }

    #[test]
    fn test_oversized_case_flagged() {
        let planner = BatchPlanner::default();
        let budget = Duration::from_secs(12);
        let limits = ceilings(10);
        let batches = planner.plan(&cases(2), budget, &limits).unwrap();

        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 1 && b.may_exceed_limit));

        let found = warnings(&batches, budget, &limits);
        assert_eq!(found.len(), 2);
        assert!(found[0].to_string().contains("likely timeout"));
    }

    #[test]
    fn test_single_case_plan_uses_raw_input() {
        let planner = BatchPlanner::default();
        let batches = planner
            .plan_single_case(&cases(3), Duration::from_secs(1), &ceilings(10))
            .unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].combined_stdin, "2 3");
        assert_eq!(batches[1].framing, Framing::SingleCase);
    }

    #[test]
    fn test_invalid_safety_margin() {
        assert_eq!(
            BatchPlanner::new(0.0).unwrap_err(),
            PlanError::InvalidSafetyMargin(0.0)
        );
        assert!(BatchPlanner::new(1.5).is_err());
        assert!(BatchPlanner::new(f64::NAN).is_err());
        assert!(BatchPlanner::new(1.0).is_ok());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let planner = BatchPlanner::default();
        let err = planner
            .plan(&cases(3), Duration::ZERO, &ceilings(10))
            .unwrap_err();
        assert_eq!(err, PlanError::ZeroBudget);
    }
}
