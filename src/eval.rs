//! Evaluator - the three contract operations behind one trait
//!
//! `LocalEvaluator` runs them on this process's box scheduler;
//! `RemoteEvaluator` forwards them to a worker over the wire. Callers do not
//! care which one they hold.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::artifacts::ArtifactStore;
use crate::checker::CompileLock;
use crate::error::{EvalError, Result};
use crate::languages::LanguageRegistry;
use crate::protocol::{CleanArgs, CompileRequest, CompileResponse, Empty, Test, TestResponse};
use crate::scheduler::BoxScheduler;
use crate::task::compile::{CompileLimits, CompileTask};
use crate::task::execute::ExecuteTask;
use crate::task::run_task;

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Compile code files into an artifact. A failed compile is
    /// `Ok(success = false)`, not an error.
    async fn compile(&self, request: CompileRequest) -> Result<CompileResponse>;

    /// Run a compiled artifact against one test. A nonzero exit is a
    /// normal result.
    async fn execute(&self, test: Test) -> Result<TestResponse>;

    /// Drop the artifact of an id; cleaning an unknown id succeeds
    async fn clean(&self, args: CleanArgs) -> Result<Empty>;
}

pub struct LocalEvaluator {
    scheduler: BoxScheduler,
    store: ArtifactStore,
    compiler: CompileTask,
    executor: ExecuteTask,
    checker_lock: Option<CompileLock>,
}

impl LocalEvaluator {
    pub fn new(
        scheduler: BoxScheduler,
        languages: Arc<LanguageRegistry>,
        store: ArtifactStore,
        compile_limits: CompileLimits,
    ) -> Self {
        Self {
            compiler: CompileTask::new(languages.clone(), store.clone(), compile_limits),
            executor: ExecuteTask::new(languages, store.clone()),
            scheduler,
            store,
            checker_lock: None,
        }
    }

    /// Guard checker artifacts (negative ids) with the checker cache's lock:
    /// compiling and cleaning them is exclusive, running them is shared
    pub fn with_checker_lock(mut self, lock: CompileLock) -> Self {
        self.checker_lock = Some(lock);
        self
    }

    fn checker_lock(&self, id: i64) -> Option<&CompileLock> {
        self.checker_lock.as_ref().filter(|_| id < 0)
    }

    /// Processes a program under test may use
    pub fn with_run_processes(mut self, processes: u32) -> Self {
        self.executor = self.executor.with_processes(processes);
        self
    }

    pub fn scheduler(&self) -> &BoxScheduler {
        &self.scheduler
    }
}

#[async_trait]
impl Evaluator for LocalEvaluator {
    async fn compile(&self, request: CompileRequest) -> Result<CompileResponse> {
        let _guard = match self.checker_lock(request.id) {
            Some(lock) => Some(lock.exclusive().await),
            None => None,
        };
        self.compiler.compile(&self.scheduler, &request).await
    }

    async fn execute(&self, test: Test) -> Result<TestResponse> {
        let memory_limit_kb = u64::try_from(test.memory_limit).map_err(|_| {
            EvalError::InvalidRequest(format!("negative memory limit {}", test.memory_limit))
        })?;
        let _guard = match self.checker_lock(test.id) {
            Some(lock) => Some(lock.shared().await),
            None => None,
        };
        run_task(&self.scheduler, &self.executor, memory_limit_kb, &test).await
    }

    async fn clean(&self, args: CleanArgs) -> Result<Empty> {
        let _guard = match self.checker_lock(args.id) {
            Some(lock) => Some(lock.exclusive().await),
            None => None,
        };
        if !self.store.remove(args.id).await? {
            debug!(id = args.id, "Nothing to clean");
        }
        Ok(Empty {})
    }
}
