use serde::{Deserialize, Serialize};

/// Outcome of a single registered test (or a synthetic failure standing in for a file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunResult {
    pub name: String,
    pub file: String,
    pub passed: bool,
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl TestRunResult {
    pub fn passed(name: impl Into<String>, file: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            passed: true,
            message: None,
            duration_ms,
        }
    }

    pub fn failed(
        name: impl Into<String>,
        file: impl Into<String>,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            passed: false,
            message: Some(message.into()),
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSummary {
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    pub duration_ms: u64,
    pub results: Vec<TestRunResult>,
}

impl RunnerSummary {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a summary whose counts are derived from `results`, so `total == passed + failed`.
    pub fn from_results(results: Vec<TestRunResult>, duration_ms: u64) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = results.len() - passed;
        Self {
            passed,
            failed,
            total: results.len(),
            duration_ms,
            results,
        }
    }

    /// Sum counts and durations, concatenating results (`self` first).
    pub fn merge(mut self, other: RunnerSummary) -> Self {
        self.passed += other.passed;
        self.failed += other.failed;
        self.total += other.total;
        self.duration_ms += other.duration_ms;
        self.results.extend(other.results);
        self
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(passed: usize, failed: usize, duration_ms: u64) -> RunnerSummary {
        let mut results = Vec::new();
        for i in 0..passed {
            results.push(TestRunResult::passed(format!("ok {i}"), "a.tdb", 1));
        }
        for i in 0..failed {
            results.push(TestRunResult::failed(format!("bad {i}"), "a.tdb", "boom", 1));
        }
        RunnerSummary::from_results(results, duration_ms)
    }

    fn counts(s: &RunnerSummary) -> (usize, usize, usize, u64) {
        (s.passed, s.failed, s.total, s.duration_ms)
    }

    #[test]
    fn from_results_keeps_total_consistent() {
        let s = summary(3, 2, 10);
        assert_eq!(s.total, s.passed + s.failed);
        assert_eq!(counts(&s), (3, 2, 5, 10));
    }

    #[test]
    fn merge_sums_counts_and_concatenates_results() {
        let merged = summary(1, 1, 5).merge(summary(2, 0, 7));
        assert_eq!(counts(&merged), (3, 1, 4, 12));
        let names: Vec<_> = merged.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["ok 0", "bad 0", "ok 0", "ok 1"]);
    }

    #[test]
    fn merge_is_associative_and_commutative_on_counts() {
        let (a, b, c) = (summary(1, 2, 3), summary(4, 0, 1), summary(0, 3, 9));

        let left = a.clone().merge(b.clone()).merge(c.clone());
        let right = a.clone().merge(b.clone().merge(c.clone()));
        assert_eq!(counts(&left), counts(&right));

        assert_eq!(
            counts(&a.clone().merge(b.clone())),
            counts(&b.merge(a))
        );
    }

    #[test]
    fn empty_summary_is_identity() {
        let s = summary(2, 1, 4);
        assert_eq!(RunnerSummary::empty().merge(s.clone()), s);
        assert!(!RunnerSummary::empty().has_failures());
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let json = serde_json::to_value(summary(1, 0, 2)).unwrap();
        assert_eq!(json["durationMs"], 2);
        assert_eq!(json["results"][0]["durationMs"], 1);
        assert!(json["results"][0]["message"].is_null());
    }
}
