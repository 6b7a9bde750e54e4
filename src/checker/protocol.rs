//! Checker invocation protocols
//!
//! Both protocols run the same cached binary on the same three files. They
//! differ only in argument order and in how the checker reports its score:
//!
//! - Standard (testlib): `checker <input> <output> <answer>`. The first
//!   token on stdout, if any, is a ratio in [0, 1]; otherwise the testlib
//!   exit code decides. The message is whatever the checker wrote to stderr.
//! - Legacy: `checker <output> <answer> <input>`. Must exit 0 and print
//!   `<score 0..100> <message>` on stdout.

use std::path::PathBuf;
use std::time::Duration;

use super::score::Percentage;
use super::CheckerResult;
use crate::error::{EvalError, Result};
use crate::sandbox::{ExecLimits, ExecStatus};
use crate::task::{BoxJob, BoxOutput, Task};

const INPUT_FILE: &str = "input.txt";
const OUTPUT_FILE: &str = "contestant.txt";
const ANSWER_FILE: &str = "answer.txt";
const STDOUT_FILE: &str = "checker.out";
const STDERR_FILE: &str = "checker.err";

/// testlib exit codes
mod testlib_exit_codes {
    pub const OK: i32 = 0;
    pub const WRONG_ANSWER: i32 = 1;
    pub const PRESENTATION_ERROR: i32 = 2;
    pub const FAIL: i32 = 3;
    pub const DIRT: i32 = 4;
    pub const POINTS: i32 = 5;
    pub const UNEXPECTED_EOF: i32 = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerKind {
    Standard,
    Legacy,
}

impl CheckerKind {
    fn arguments(&self) -> [&'static str; 3] {
        match self {
            CheckerKind::Standard => [INPUT_FILE, OUTPUT_FILE, ANSWER_FILE],
            CheckerKind::Legacy => [OUTPUT_FILE, ANSWER_FILE, INPUT_FILE],
        }
    }

    fn interpret(&self, output: &BoxOutput) -> Result<CheckerResult> {
        match self {
            CheckerKind::Standard => interpret_standard(output),
            CheckerKind::Legacy => interpret_legacy(output),
        }
    }
}

fn interpret_standard(output: &BoxOutput) -> Result<CheckerResult> {
    let code = match output.outcome.status {
        ExecStatus::Exited(code) => code,
        status => {
            return Err(EvalError::MalformedOutput(format!(
                "checker did not exit normally: {:?}",
                status
            )))
        }
    };
    let message = output.stderr_lossy().trim().to_string();

    let stdout = output.stdout_lossy();
    if let Some(token) = stdout.split_whitespace().next() {
        let percentage = Percentage::parse_ratio(token).ok_or_else(|| {
            EvalError::MalformedOutput(format!("checker printed a non-numeric score {:?}", token))
        })?;
        return Ok(CheckerResult::new(percentage, message));
    }

    match code {
        testlib_exit_codes::OK => Ok(CheckerResult::new(Percentage::HUNDRED, message)),
        testlib_exit_codes::WRONG_ANSWER
        | testlib_exit_codes::PRESENTATION_ERROR
        | testlib_exit_codes::DIRT
        | testlib_exit_codes::UNEXPECTED_EOF => Ok(CheckerResult::new(Percentage::ZERO, message)),
        testlib_exit_codes::FAIL => Err(EvalError::MalformedOutput(format!(
            "checker reported failure: {}",
            message
        ))),
        testlib_exit_codes::POINTS => Err(EvalError::MalformedOutput(
            "checker exited with points but printed no score".into(),
        )),
        code => Err(EvalError::MalformedOutput(format!(
            "unknown checker exit code {}",
            code
        ))),
    }
}

fn interpret_legacy(output: &BoxOutput) -> Result<CheckerResult> {
    if !output.outcome.status.is_success() {
        return Err(EvalError::MalformedOutput(format!(
            "legacy checker did not exit cleanly: {:?}",
            output.outcome.status
        )));
    }

    let stdout = output.stdout_lossy();
    let stdout = stdout.trim_start();
    let (score, message) = stdout
        .split_once(char::is_whitespace)
        .unwrap_or((stdout, ""));
    let percentage = Percentage::parse_percent(score).ok_or_else(|| {
        EvalError::MalformedOutput(format!("legacy checker printed a non-numeric score {:?}", score))
    })?;

    Ok(CheckerResult::new(percentage, message.trim()))
}

/// Everything one checker run needs
#[derive(Debug, Clone)]
pub struct CheckerRun {
    /// Cached checker artifact on the host
    pub binary: PathBuf,
    /// Name of the artifact inside the box
    pub artifact: String,
    pub run_command: Vec<String>,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub answer: Vec<u8>,
}

pub struct CheckerTask {
    kind: CheckerKind,
    time: Duration,
    memory_kb: u64,
}

impl CheckerTask {
    pub fn new(kind: CheckerKind, time: Duration, memory_kb: u64) -> Self {
        Self {
            kind,
            time,
            memory_kb,
        }
    }
}

impl Task for CheckerTask {
    type Request = CheckerRun;
    type Response = CheckerResult;

    fn name(&self) -> &str {
        match self.kind {
            CheckerKind::Standard => "standard-checker",
            CheckerKind::Legacy => "legacy-checker",
        }
    }

    fn default_memory_limit_kb(&self) -> Option<u64> {
        Some(self.memory_kb)
    }

    fn translate(&self, run: &CheckerRun, memory_limit_kb: u64) -> Result<BoxJob> {
        let mut command = run.run_command.clone();
        command.extend(self.kind.arguments().iter().map(|arg| arg.to_string()));

        Ok(BoxJob::new(command, ExecLimits::new(self.time, memory_limit_kb))
            .with_host_file(&run.binary, run.artifact.clone(), true)
            .with_file(INPUT_FILE, run.input.clone())
            .with_file(OUTPUT_FILE, run.output.clone())
            .with_file(ANSWER_FILE, run.answer.clone())
            .with_stdout(STDOUT_FILE)
            .with_stderr(STDERR_FILE))
    }

    fn parse(&self, _run: &CheckerRun, output: BoxOutput) -> Result<CheckerResult> {
        self.kind.interpret(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecOutcome;
    use std::collections::HashMap;

    fn output(status: ExecStatus, stdout: &str, stderr: &str) -> BoxOutput {
        BoxOutput {
            box_id: 0,
            outcome: ExecOutcome {
                status,
                ..ExecOutcome::skipped()
            },
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            files: HashMap::new(),
            persisted: Vec::new(),
        }
    }

    #[test]
    fn test_argument_order() {
        let task = CheckerTask::new(CheckerKind::Legacy, Duration::from_secs(1), 1024);
        let run = CheckerRun {
            binary: PathBuf::from("/cache/1.bin"),
            artifact: "main".into(),
            run_command: vec!["./main".into()],
            input: Vec::new(),
            output: Vec::new(),
            answer: Vec::new(),
        };
        let job = task.translate(&run, 1024).unwrap();
        assert_eq!(job.command, vec!["./main", OUTPUT_FILE, ANSWER_FILE, INPUT_FILE]);

        let task = CheckerTask::new(CheckerKind::Standard, Duration::from_secs(1), 1024);
        let job = task.translate(&run, 1024).unwrap();
        assert_eq!(job.command, vec!["./main", INPUT_FILE, OUTPUT_FILE, ANSWER_FILE]);
        assert_eq!(job.files.len(), 4);
    }

    #[test]
    fn test_standard_ratio_on_stdout() {
        let result = interpret_standard(&output(ExecStatus::Exited(7), "0.25\n", "partial")).unwrap();
        assert_eq!(result.percentage, Percentage::from_percent(25));
        assert_eq!(result.message, "partial");
    }

    #[test]
    fn test_standard_exit_codes() {
        let ok = interpret_standard(&output(ExecStatus::Exited(0), "", "ok 3 numbers\n")).unwrap();
        assert_eq!(ok.percentage, Percentage::HUNDRED);
        assert_eq!(ok.message, "ok 3 numbers");

        for code in [1, 2, 4, 8] {
            let wa = interpret_standard(&output(ExecStatus::Exited(code), "", "wrong answer")).unwrap();
            assert_eq!(wa.percentage, Percentage::ZERO);
            assert!(!wa.failed);
        }

        assert!(interpret_standard(&output(ExecStatus::Exited(3), "", "fail")).is_err());
        assert!(interpret_standard(&output(ExecStatus::Exited(5), "", "")).is_err());
        assert!(interpret_standard(&output(ExecStatus::TimeLimitExceeded, "", "")).is_err());
    }

    #[test]
    fn test_legacy_output() {
        let result = interpret_legacy(&output(ExecStatus::Exited(0), "50 half right\n", "")).unwrap();
        assert_eq!(result.percentage, Percentage::from_percent(50));
        assert_eq!(result.message, "half right");

        let bare = interpret_legacy(&output(ExecStatus::Exited(0), "100", "")).unwrap();
        assert_eq!(bare.percentage, Percentage::HUNDRED);
        assert_eq!(bare.message, "");

        assert!(interpret_legacy(&output(ExecStatus::Exited(1), "100 ok", "")).is_err());
        assert!(interpret_legacy(&output(ExecStatus::Exited(0), "great job", "")).is_err());
    }

    #[test]
    fn test_protocols_agree_on_scale() {
        let standard = interpret_standard(&output(ExecStatus::Exited(0), "0.5", "")).unwrap();
        let legacy = interpret_legacy(&output(ExecStatus::Exited(0), "50", "")).unwrap();
        assert_eq!(standard.percentage, legacy.percentage);

        let standard = interpret_standard(&output(ExecStatus::Exited(0), "1", "")).unwrap();
        let legacy = interpret_legacy(&output(ExecStatus::Exited(0), "100", "")).unwrap();
        assert_eq!(standard.percentage, legacy.percentage);
    }
}
