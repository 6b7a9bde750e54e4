//! Built-in checker for problems without a custom one

use async_trait::async_trait;

use super::{Checker, CheckerInput, CheckerResult, Percentage, PrepareOutcome};
use crate::error::{PrepareError, Result};

/// Accepts output equal to the answer up to trailing whitespace on each line
/// and trailing empty lines
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffChecker;

#[async_trait]
impl Checker for DiffChecker {
    async fn prepare(&self) -> std::result::Result<PrepareOutcome, PrepareError> {
        Ok(PrepareOutcome::NotRequired)
    }

    async fn run_checker(&self, input: CheckerInput<'_>) -> CheckerResult {
        let actual = String::from_utf8_lossy(input.output);
        let expected = String::from_utf8_lossy(input.answer);
        if compare_output(&actual, &expected) {
            CheckerResult::new(Percentage::HUNDRED, "Correct")
        } else {
            CheckerResult::new(Percentage::ZERO, "Wrong answer")
        }
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Compare outputs line by line, ignoring trailing whitespace
pub fn compare_output(actual: &str, expected: &str) -> bool {
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s.lines().map(|line| line.trim_end().to_string()).collect();
        while lines.last().map(|s| s.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        lines
    };

    normalize(actual) == normalize(expected)
}
