//! Custom checkers compiled per problem and cached on disk
//!
//! The cached binary of problem `P` lives at `<cache>/<P>.bin` and is reused
//! while its modification time is not older than the checker source's
//! last-updated timestamp. A single `CompileLock` per engine guards the
//! cache: compiling holds it exclusively, running checkers shares it, so no
//! run ever sees a binary that is still being written.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::protocol::{CheckerKind, CheckerRun, CheckerTask};
use super::{Checker, CheckerInput, CheckerResult, PrepareOutcome};
use crate::artifacts::{checker_artifact_id, ArtifactStore};
use crate::error::{EvalError, PrepareError, Result};
use crate::languages::LanguageRegistry;
use crate::protocol::CompileRequest;
use crate::scheduler::BoxScheduler;
use crate::task::compile::{CompileLimits, CompileTask};
use crate::task::run_task;

/// Where the verification library header lands inside the box
const TESTLIB_BOX_PATH: &str = "/box/testlib.h";

/// Compile-exclusive / run-shared lock over the checker cache
#[derive(Debug, Clone, Default)]
pub struct CompileLock(Arc<RwLock<()>>);

impl CompileLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.0.write().await
    }

    pub async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.0.read().await
    }
}

/// Limits applied to checker compiles and runs
#[derive(Debug, Clone)]
pub struct CheckerSettings {
    /// Memory ceiling for checker runs, independent of the problem's limit
    pub memory_kb: u64,
    pub time: Duration,
    pub compile: CompileLimits,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            memory_kb: 512 * 1024,
            time: Duration::from_secs(20),
            compile: CompileLimits::default(),
        }
    }
}

/// Checker source as stored with the problem
#[derive(Debug, Clone)]
pub struct CheckerSource {
    pub problem_id: i64,
    /// Source file name; its extension selects the language
    pub filename: String,
    pub code: Vec<u8>,
    pub last_updated_at: SystemTime,
    pub kind: CheckerKind,
}

/// Shared state behind every custom checker: scheduler, cache and lock
#[derive(Clone)]
pub struct CheckerEngine {
    scheduler: BoxScheduler,
    languages: Arc<LanguageRegistry>,
    store: ArtifactStore,
    compiler: Arc<CompileTask>,
    testlib: Arc<[u8]>,
    lock: CompileLock,
    settings: CheckerSettings,
}

impl CheckerEngine {
    pub fn new(
        scheduler: BoxScheduler,
        languages: Arc<LanguageRegistry>,
        store: ArtifactStore,
        testlib: Vec<u8>,
        settings: CheckerSettings,
    ) -> Self {
        let compiler = CompileTask::new(languages.clone(), store.clone(), settings.compile.clone());
        Self {
            scheduler,
            languages,
            store,
            compiler: Arc::new(compiler),
            testlib: testlib.into(),
            lock: CompileLock::new(),
            settings,
        }
    }

    /// Share a compile lock with other engines over the same cache
    pub fn with_compile_lock(mut self, lock: CompileLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn compile_lock(&self) -> &CompileLock {
        &self.lock
    }

    /// Cached binary of a problem's checker; problem ids start at 1
    pub fn cache_path(&self, problem_id: i64) -> Result<PathBuf> {
        self.store.checker_path(problem_id)
    }

    pub fn checker(&self, source: CheckerSource) -> CustomChecker {
        CustomChecker {
            engine: self.clone(),
            source,
        }
    }

    /// Delete every cached checker binary
    pub async fn purge_cache(&self) -> Result<PurgeReport> {
        purge_checker_cache(&self.store.checker_cache_dir(), &self.lock).await
    }
}

pub struct CustomChecker {
    engine: CheckerEngine,
    source: CheckerSource,
}

impl CustomChecker {
    async fn is_fresh(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await.and_then(|meta| meta.modified()) {
            Ok(modified) => modified >= self.source.last_updated_at,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(problem_id = self.source.problem_id, "Checker stat error: {}", e);
                }
                false
            }
        }
    }

    fn compile_request(&self) -> std::result::Result<CompileRequest, PrepareError> {
        let id = checker_artifact_id(self.source.problem_id).map_err(invalid_problem)?;
        let lang = self
            .engine
            .languages
            .by_filename(&self.source.filename)
            .ok_or_else(|| {
                PrepareError::new(
                    format!("Unsupported checker language: {}", self.source.filename),
                    EvalError::UnknownLanguage(self.source.filename.clone()),
                )
            })?;

        Ok(CompileRequest {
            id,
            code_files: HashMap::from([(lang.source_file.clone(), self.source.code.clone())]),
            header_files: HashMap::from([(TESTLIB_BOX_PATH.to_string(), self.engine.testlib.to_vec())]),
            lang: lang.name.clone(),
        })
    }
}

#[async_trait]
impl Checker for CustomChecker {
    async fn prepare(&self) -> std::result::Result<PrepareOutcome, PrepareError> {
        let problem_id = self.source.problem_id;
        let path = self.engine.cache_path(problem_id).map_err(invalid_problem)?;
        if self.is_fresh(&path).await {
            info!(problem_id, "Using cached checker");
            return Ok(PrepareOutcome::Cached);
        }

        let _guard = self.engine.lock.exclusive().await;
        // Someone else may have compiled it while we waited
        if self.is_fresh(&path).await {
            info!(problem_id, "Using cached checker");
            return Ok(PrepareOutcome::Cached);
        }

        info!(problem_id, "Compiling checker for problem {}", problem_id);
        let request = self.compile_request()?;
        let response = self
            .engine
            .compiler
            .compile(&self.engine.scheduler, &request)
            .await
            .map_err(|e| PrepareError::new("Couldn't compile checker", e))?;

        if !response.success {
            return Err(PrepareError::new(
                format!("Output:\n{}\nOther:\n{}", response.output, response.other),
                EvalError::InvalidHelperCode {
                    diagnostics: response.other,
                },
            ));
        }

        let time_ms = response
            .stats
            .map(|stats| (stats.time * 1000.0) as u64)
            .unwrap_or_default();
        info!(problem_id, "Checker compilation time: {} ms", time_ms);
        Ok(PrepareOutcome::Compiled { time_ms })
    }

    async fn run_checker(&self, input: CheckerInput<'_>) -> CheckerResult {
        let _guard = self.engine.lock.shared().await;

        let Some(lang) = self.engine.languages.by_filename(&self.source.filename) else {
            warn!(problem_id = self.source.problem_id, "No language for checker {}", self.source.filename);
            return CheckerResult::failure();
        };
        let binary = match self.engine.cache_path(self.source.problem_id) {
            Ok(path) => path,
            Err(e) => {
                warn!(problem_id = self.source.problem_id, "Checker run failed: {}", e);
                return CheckerResult::failure();
            }
        };
        let run = CheckerRun {
            binary,
            artifact: lang.artifact.clone(),
            run_command: lang.run_command.clone(),
            input: input.input.to_vec(),
            output: input.output.to_vec(),
            answer: input.answer.to_vec(),
        };
        let settings = &self.engine.settings;
        let task = CheckerTask::new(self.source.kind, settings.time, settings.memory_kb);

        match run_task(&self.engine.scheduler, &task, settings.memory_kb, &run).await {
            Ok(result) => result,
            Err(e) => {
                warn!(problem_id = self.source.problem_id, "Checker run failed: {}", e);
                CheckerResult::failure()
            }
        }
    }

    async fn cleanup(&self) -> Result<()> {
        // Compiled checkers outlive submissions; eviction is `purge_cache`
        Ok(())
    }
}

fn invalid_problem(error: EvalError) -> PrepareError {
    PrepareError::new("Invalid problem id for checker", error)
}

/// What a cache purge did
#[derive(Debug, Default, Clone, Serialize)]
pub struct PurgeReport {
    pub removed: Vec<String>,
    pub warnings: Vec<String>,
}

/// Best-effort removal of every file in the checker cache; per-file
/// failures are logged and reported, not returned as errors
pub async fn purge_checker_cache(dir: &Path, lock: &CompileLock) -> Result<PurgeReport> {
    let _guard = lock.exclusive().await;
    purge_dir(dir, |path| async move { tokio::fs::remove_file(path).await }).await
}

async fn purge_dir<F, Fut>(dir: &Path, mut remove: F) -> Result<PurgeReport>
where
    F: FnMut(PathBuf) -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    let mut report = PurgeReport::default();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Checker cache {} does not exist", dir.display());
            return Ok(report);
        }
        Err(e) => return Err(e.into()),
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Couldn't list checker cache: {}", e);
                report.warnings.push(format!("listing {}: {}", dir.display(), e));
                break;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        match remove(entry.path()).await {
            Ok(()) => report.removed.push(name),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Couldn't remove file from checker cache: {} {}", name, e);
                report.warnings.push(format!("{}: {}", name, e));
            }
        }
    }

    info!(
        removed = report.removed.len(),
        warnings = report.warnings.len(),
        "Purged checker cache"
    );
    Ok(report)
}
