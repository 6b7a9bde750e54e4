//! In-process box used by the test suites
//!
//! Each fake box is a temporary directory. Running a command calls a
//! test-supplied behavior that decides the outcome and the bytes written to
//! the redirected streams.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::fs;

use super::{ExecLimits, ExecOutcome, ExecStatus, Sandbox, SandboxFactory, StdioSpec};
use crate::error::{EvalError, Result};

/// What a fake run sees
#[derive(Debug, Clone)]
pub struct FakeInvocation {
    pub box_id: u32,
    pub command: Vec<String>,
    pub limits: ExecLimits,
    pub work_dir: PathBuf,
    pub stdin: Vec<u8>,
}

impl FakeInvocation {
    pub fn read(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.work_dir.join(name)).unwrap_or_default()
    }
}

/// What a fake run produces
#[derive(Debug, Clone)]
pub struct FakeRun {
    pub status: ExecStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Extra files left in the box after the run
    pub files: Vec<(String, Vec<u8>)>,
}

impl FakeRun {
    pub fn exited(code: i32) -> Self {
        Self {
            status: ExecStatus::Exited(code),
            stdout: Vec::new(),
            stderr: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_file(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.push((name.to_string(), data.into()));
        self
    }
}

pub type Behavior = Arc<dyn Fn(&FakeInvocation) -> FakeRun + Send + Sync>;

/// Factory handing out fake boxes; counts creations and cleanups
pub struct FakeFactory {
    behavior: Behavior,
    run_delay: Duration,
    hanging_cleanup: Mutex<HashSet<u32>>,
    pub created: AtomicUsize,
    pub cleaned: Arc<AtomicUsize>,
    pub invocations: Arc<Mutex<Vec<FakeInvocation>>>,
}

impl FakeFactory {
    pub fn new(behavior: impl Fn(&FakeInvocation) -> FakeRun + Send + Sync + 'static) -> Self {
        Self {
            behavior: Arc::new(behavior),
            run_delay: Duration::ZERO,
            hanging_cleanup: Mutex::new(HashSet::new()),
            created: AtomicUsize::new(0),
            cleaned: Arc::new(AtomicUsize::new(0)),
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every run exits 0 with empty output
    pub fn succeeding() -> Self {
        Self::new(|_| FakeRun::exited(0))
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Cleanup of this box never completes
    pub fn with_hanging_cleanup(self, box_id: u32) -> Self {
        self.hanging_cleanup.lock().unwrap().insert(box_id);
        self
    }

    pub fn invocations(&self) -> Vec<FakeInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxFactory for FakeFactory {
    async fn create(&self, box_id: u32) -> Result<Arc<dyn Sandbox>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let dir = tempfile::tempdir().map_err(|e| EvalError::BoxStart {
            box_id,
            reason: e.to_string(),
        })?;
        Ok(Arc::new(FakeBox {
            box_id,
            dir,
            behavior: self.behavior.clone(),
            run_delay: self.run_delay,
            hang_on_cleanup: self.hanging_cleanup.lock().unwrap().contains(&box_id),
            cleaned: self.cleaned.clone(),
            invocations: self.invocations.clone(),
        }))
    }
}

pub struct FakeBox {
    box_id: u32,
    dir: TempDir,
    behavior: Behavior,
    run_delay: Duration,
    hang_on_cleanup: bool,
    cleaned: Arc<AtomicUsize>,
    invocations: Arc<Mutex<Vec<FakeInvocation>>>,
}

impl FakeBox {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

#[async_trait]
impl Sandbox for FakeBox {
    fn id(&self) -> u32 {
        self.box_id
    }

    async fn write_file(&self, name: &str, data: &[u8], _executable: bool) -> Result<()> {
        let dest = self.path(name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(dest, data).await?;
        Ok(())
    }

    async fn copy_in(&self, source: &Path, name: &str, _executable: bool) -> Result<()> {
        let data = fs::read(source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EvalError::MissingArtifact(source.to_path_buf())
            } else {
                EvalError::Io(e)
            }
        })?;
        self.write_file(name, &data, true).await
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.path(name)).await?)
    }

    async fn copy_out(&self, name: &str, dest: &Path) -> Result<()> {
        fs::copy(self.path(name), dest).await?;
        Ok(())
    }

    async fn run(
        &self,
        command: &[String],
        limits: &ExecLimits,
        io: &StdioSpec,
    ) -> Result<ExecOutcome> {
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }

        let stdin = match &io.stdin {
            Some(name) => self.read_file(name).await?,
            None => Vec::new(),
        };
        let invocation = FakeInvocation {
            box_id: self.box_id,
            command: command.to_vec(),
            limits: limits.clone(),
            work_dir: self.dir.path().to_path_buf(),
            stdin,
        };
        self.invocations.lock().unwrap().push(invocation.clone());

        let run = (self.behavior)(&invocation);

        if let Some(name) = &io.stdout {
            self.write_file(name, &run.stdout, false).await?;
        }
        if let Some(name) = &io.stderr {
            self.write_file(name, &run.stderr, false).await?;
        }
        for (name, data) in &run.files {
            self.write_file(name, data, false).await?;
        }

        Ok(ExecOutcome {
            status: run.status,
            time_ms: 10,
            wall_time_ms: 12,
            memory_kb: 1024,
            message: String::new(),
        })
    }

    async fn cleanup(&self) -> Result<()> {
        if self.hang_on_cleanup {
            std::future::pending::<()>().await;
        }
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
