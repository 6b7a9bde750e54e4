//! Compile task - CompileRequest in, CompileResponse out
//!
//! A failed compile is a normal response (`success = false` with the
//! compiler's diagnostics), never an error. The artifact is either persisted
//! and reported, or any stale artifact of the same id is removed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{run_task, BoxJob, BoxOutput, Task};
use crate::artifacts::ArtifactStore;
use crate::error::{EvalError, Result};
use crate::languages::LanguageRegistry;
use crate::protocol::{CompileRequest, CompileResponse, RunStats};
use crate::sandbox::{ExecLimits, ExecStatus};
use crate::scheduler::BoxScheduler;

const COMPILE_STDOUT: &str = "compile.out";
const COMPILE_STDERR: &str = "compile.err";

/// Resource limits for compilers
#[derive(Debug, Clone)]
pub struct CompileLimits {
    pub time: Duration,
    pub memory_kb: u64,
    /// Compilers fork (cc1plus, as, ld), so they get more than one process
    pub processes: u32,
}

impl Default for CompileLimits {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(30),
            memory_kb: 2048 * 1024,
            processes: 64,
        }
    }
}

pub struct CompileTask {
    languages: Arc<LanguageRegistry>,
    store: ArtifactStore,
    limits: CompileLimits,
}

impl CompileTask {
    pub fn new(languages: Arc<LanguageRegistry>, store: ArtifactStore, limits: CompileLimits) -> Self {
        Self {
            languages,
            store,
            limits,
        }
    }

    /// Compile on a box from the scheduler, dropping any stale artifact of
    /// the same id when the compile fails
    pub async fn compile(
        &self,
        scheduler: &BoxScheduler,
        request: &CompileRequest,
    ) -> Result<CompileResponse> {
        let response = run_task(scheduler, self, 0, request).await?;
        if response.success {
            info!(id = request.id, lang = %request.lang, "Compilation succeeded");
        } else {
            debug!(id = request.id, "Compilation failed");
            self.store.remove(request.id).await?;
        }
        Ok(response)
    }
}

impl Task for CompileTask {
    type Request = CompileRequest;
    type Response = CompileResponse;

    fn name(&self) -> &str {
        "compile"
    }

    fn default_memory_limit_kb(&self) -> Option<u64> {
        Some(self.limits.memory_kb)
    }

    fn translate(&self, request: &CompileRequest, memory_limit_kb: u64) -> Result<BoxJob> {
        request.validate()?;
        let lang = self
            .languages
            .get(&request.lang)
            .ok_or_else(|| EvalError::UnknownLanguage(request.lang.clone()))?;

        // Interpreted languages only stage the source, which becomes the artifact
        let command = lang.compile_command.clone().unwrap_or_default();
        let limits = ExecLimits::new(self.limits.time, memory_limit_kb)
            .with_processes(self.limits.processes);

        let mut job = BoxJob::new(command, limits)
            .with_stdout(COMPILE_STDOUT)
            .with_stderr(COMPILE_STDERR);
        for (name, data) in request.code_files.iter().chain(request.header_files.iter()) {
            job = job.with_file(name.clone(), data.clone());
        }

        Ok(job.persist(lang.artifact.clone(), self.store.path_for(request.id)))
    }

    fn parse(&self, _request: &CompileRequest, output: BoxOutput) -> Result<CompileResponse> {
        let stats = RunStats::from_outcome(&output.outcome);
        let stdout = output.stdout_lossy();
        let mut other = output.stderr_lossy();

        let success = output.outcome.status.is_success() && !output.persisted.is_empty();
        if !success && stdout.is_empty() && other.is_empty() {
            other = match output.outcome.status {
                ExecStatus::TimeLimitExceeded => "Compilation timed out".to_string(),
                ExecStatus::MemoryLimitExceeded => "Compiler ran out of memory".to_string(),
                ExecStatus::Signaled(_) | ExecStatus::RuntimeError => {
                    "Compiler crashed".to_string()
                }
                ExecStatus::Exited(0) => "Compiler produced no executable".to_string(),
                ExecStatus::Exited(code) => {
                    format!("Compilation failed with exit code {}", code)
                }
                ExecStatus::InternalError => "Compilation failed".to_string(),
            };
        }

        Ok(CompileResponse {
            success,
            output: stdout,
            other,
            stats: Some(stats),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::{FakeFactory, FakeRun};
    use crate::scheduler::SchedulerConfig;

    fn setup(factory: FakeFactory) -> (tempfile::TempDir, CompileTask, BoxScheduler) {
        let dir = tempfile::tempdir().unwrap();
        let task = CompileTask::new(
            Arc::new(LanguageRegistry::builtin().unwrap()),
            ArtifactStore::new(dir.path()),
            CompileLimits::default(),
        );
        let scheduler = BoxScheduler::new(SchedulerConfig::default(), Arc::new(factory));
        (dir, task, scheduler)
    }

    fn cpp_request(id: i64) -> CompileRequest {
        let mut req = CompileRequest {
            id,
            lang: "cpp17".into(),
            ..Default::default()
        };
        req.code_files
            .insert("main.cpp".into(), b"#include \"testlib.h\"\nint main(){}".to_vec());
        req.header_files
            .insert("/box/testlib.h".into(), b"#pragma once".to_vec());
        req
    }

    #[tokio::test]
    async fn test_successful_compile_persists_artifact() {
        let factory = FakeFactory::new(|inv| {
            assert_eq!(inv.command[0], "g++");
            assert_eq!(inv.read("testlib.h"), b"#pragma once");
            assert_eq!(inv.limits.memory_kb, 2048 * 1024);
            assert_eq!(inv.limits.processes, 64);
            FakeRun::exited(0).with_file("main", "ELF")
        });
        let (dir, task, scheduler) = setup(factory);

        let resp = task.compile(&scheduler, &cpp_request(-42)).await.unwrap();
        assert!(resp.success, "{}", resp.other);
        assert!(resp.stats.is_some());

        let artifact = dir.path().join("checker_cache").join("42.bin");
        assert_eq!(std::fs::read(artifact).unwrap(), b"ELF");
    }

    #[tokio::test]
    async fn test_failed_compile_reports_diagnostics() {
        let factory = FakeFactory::new(|_| {
            FakeRun::exited(1)
                .with_stdout("")
                .with_stderr("main.cpp:2:11: error: expected ';'")
        });
        let (dir, task, scheduler) = setup(factory);
        std::fs::write(dir.path().join("5.bin"), b"stale").unwrap();

        let resp = task.compile(&scheduler, &cpp_request(5)).await.unwrap();
        assert!(!resp.success);
        assert!(resp.other.contains("expected ';'"));
        assert!(!dir.path().join("5.bin").exists());
    }

    #[tokio::test]
    async fn test_missing_executable_is_failure() {
        let (_dir, task, scheduler) = setup(FakeFactory::succeeding());

        let resp = task.compile(&scheduler, &cpp_request(1)).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.other, "Compiler produced no executable");
    }

    #[tokio::test]
    async fn test_compile_timeout_message() {
        let factory = FakeFactory::new(|_| FakeRun {
            status: ExecStatus::TimeLimitExceeded,
            ..FakeRun::exited(0)
        });
        let (_dir, task, scheduler) = setup(factory);

        let resp = task.compile(&scheduler, &cpp_request(1)).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.other, "Compilation timed out");
    }

    #[tokio::test]
    async fn test_interpreted_language_stages_source() {
        let factory = Arc::new(FakeFactory::succeeding());
        let dir = tempfile::tempdir().unwrap();
        let task = CompileTask::new(
            Arc::new(LanguageRegistry::builtin().unwrap()),
            ArtifactStore::new(dir.path()),
            CompileLimits::default(),
        );
        let scheduler = BoxScheduler::new(SchedulerConfig::default(), factory.clone());

        let mut req = CompileRequest {
            id: 9,
            lang: "python3".into(),
            ..Default::default()
        };
        req.code_files.insert("main.py".into(), b"print(1)".to_vec());

        let resp = task.compile(&scheduler, &req).await.unwrap();
        assert!(resp.success);
        assert!(factory.invocations().is_empty());
        assert_eq!(std::fs::read(dir.path().join("9.bin")).unwrap(), b"print(1)");
    }

    #[tokio::test]
    async fn test_unknown_language_is_user_error() {
        let (_dir, task, scheduler) = setup(FakeFactory::succeeding());
        let mut req = cpp_request(1);
        req.lang = "brainfuck".into();

        let err = task.compile(&scheduler, &req).await.unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(scheduler.submitted(), 0);
    }
}
