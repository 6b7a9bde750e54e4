//! Execute task - run a compiled artifact against one test

use std::sync::Arc;
use std::time::Duration;

use super::{BoxJob, BoxOutput, Task};
use crate::artifacts::ArtifactStore;
use crate::error::{EvalError, Result};
use crate::languages::LanguageRegistry;
use crate::protocol::{RunStats, Test, TestResponse};
use crate::sandbox::{box_file_name, ExecLimits};

const CONSOLE_INPUT: &str = "input.txt";
const CONSOLE_OUTPUT: &str = "output.txt";
const STDERR_FILE: &str = "stderr.txt";

/// Largest base limits a test may ask for
const MAX_TIME_LIMIT_SECS: f64 = 3600.0;
const MAX_MEMORY_LIMIT_KB: u64 = 64 * 1024 * 1024;

pub struct ExecuteTask {
    languages: Arc<LanguageRegistry>,
    store: ArtifactStore,
    processes: u32,
}

impl ExecuteTask {
    pub fn new(languages: Arc<LanguageRegistry>, store: ArtifactStore) -> Self {
        Self {
            languages,
            store,
            processes: 1,
        }
    }

    /// Allow programs to spawn threads or subprocesses (JVM needs this)
    pub fn with_processes(mut self, processes: u32) -> Self {
        self.processes = processes;
        self
    }

    fn file_names(test: &Test) -> Result<(String, String)> {
        if test.console_input {
            return Ok((CONSOLE_INPUT.to_string(), CONSOLE_OUTPUT.to_string()));
        }
        let input = format!("{}.in", test.test_name);
        let output = format!("{}.out", test.test_name);
        box_file_name(&input)?;
        box_file_name(&output)?;
        if test.test_name.is_empty() {
            return Err(EvalError::InvalidRequest(
                "file-based test without a test name".into(),
            ));
        }
        Ok((input, output))
    }
}

impl Task for ExecuteTask {
    type Request = Test;
    type Response = TestResponse;

    fn name(&self) -> &str {
        "execute"
    }

    fn translate(&self, test: &Test, memory_limit_kb: u64) -> Result<BoxJob> {
        let lang = self
            .languages
            .get(&test.lang)
            .ok_or_else(|| EvalError::UnknownLanguage(test.lang.clone()))?;
        if !test.time_limit.is_finite()
            || test.time_limit <= 0.0
            || test.time_limit > MAX_TIME_LIMIT_SECS
        {
            return Err(EvalError::InvalidRequest(format!(
                "invalid time limit {}",
                test.time_limit
            )));
        }
        if memory_limit_kb > MAX_MEMORY_LIMIT_KB {
            return Err(EvalError::InvalidRequest(format!(
                "memory limit of {} KB is too large",
                memory_limit_kb
            )));
        }

        let base_ms = (test.time_limit * 1000.0).round() as u64;
        let time_ms = lang.calculate_time_limit(base_ms).ok_or_else(|| {
            EvalError::InvalidRequest(format!("time limit {} overflows", test.time_limit))
        })?;
        let memory_kb = lang.calculate_memory_limit(memory_limit_kb).ok_or_else(|| {
            EvalError::InvalidRequest(format!("memory limit {} KB overflows", memory_limit_kb))
        })?;
        let limits = ExecLimits::new(Duration::from_millis(time_ms), memory_kb)
            .with_processes(self.processes);

        let (input, output) = Self::file_names(test)?;
        let job = BoxJob::new(lang.run_command.clone(), limits)
            .with_host_file(self.store.path_for(test.id), lang.artifact.clone(), true)
            .with_file(input.clone(), test.input.clone())
            .with_stderr(STDERR_FILE);

        Ok(if test.console_input {
            job.with_stdin(input).with_stdout(output)
        } else {
            job.collect(output)
        })
    }

    fn parse(&self, test: &Test, mut output: BoxOutput) -> Result<TestResponse> {
        let stats = RunStats::from_outcome(&output.outcome);
        let produced = if test.console_input {
            std::mem::take(&mut output.stdout)
        } else {
            let (_, name) = Self::file_names(test)?;
            output.files.remove(&name).unwrap_or_default()
        };

        Ok(TestResponse {
            output: produced,
            stats: Some(stats),
        })
    }
}
