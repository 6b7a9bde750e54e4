//! Checker module - Scoring contestant output
//!
//! This module provides:
//! - The `Checker` lifecycle (`prepare`, `run_checker`, `cleanup`)
//! - Custom checkers compiled once per problem and cached on disk
//! - The standard (testlib) and legacy invocation protocols
//! - A built-in whitespace-tolerant diff checker
//!
//! The checker module does NOT:
//! - Aggregate scores across tests or subtasks
//! - Decide verdicts such as TLE or MLE for the contestant's own run

pub mod custom;
pub mod diff;
pub mod protocol;
pub mod score;

use async_trait::async_trait;

use crate::error::{PrepareError, Result};

pub use custom::{purge_checker_cache, CheckerEngine, CheckerSettings, CheckerSource, CompileLock, CustomChecker, PurgeReport};
pub use diff::DiffChecker;
pub use protocol::CheckerKind;
pub use score::Percentage;

/// Message reported when a checker could not be run at all
pub const CHECKER_FAILED: &str = "Error running checker";

/// Score and message of one checker run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerResult {
    pub percentage: Percentage,
    pub message: String,
    /// The checker itself failed; the percentage is zero but says nothing
    /// about the contestant
    pub failed: bool,
}

impl CheckerResult {
    pub fn new(percentage: Percentage, message: impl Into<String>) -> Self {
        Self {
            percentage,
            message: message.into(),
            failed: false,
        }
    }

    pub fn failure() -> Self {
        Self {
            percentage: Percentage::ZERO,
            message: CHECKER_FAILED.to_string(),
            failed: true,
        }
    }
}

/// The three streams a checker compares
#[derive(Debug, Clone, Copy)]
pub struct CheckerInput<'a> {
    /// Test input given to the contestant
    pub input: &'a [u8],
    /// What the contestant printed
    pub output: &'a [u8],
    /// The problem's reference output
    pub answer: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// A fresh compiled checker was already cached
    Cached,
    Compiled { time_ms: u64 },
    /// The checker has nothing to compile
    NotRequired,
}

#[async_trait]
pub trait Checker: Send + Sync {
    /// Make the checker runnable; must finish before any `run_checker`
    async fn prepare(&self) -> std::result::Result<PrepareOutcome, PrepareError>;

    /// Score one test. Never fails: infrastructure problems yield
    /// `CheckerResult::failure()`.
    async fn run_checker(&self, input: CheckerInput<'_>) -> CheckerResult;

    async fn cleanup(&self) -> Result<()>;
}
