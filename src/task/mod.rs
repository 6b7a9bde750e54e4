//! Task module - Generic request/response binding over a box
//!
//! This module provides the dispatch machinery shared by every job shape:
//! - `Task`: translate a typed request into box operations, parse the box
//!   output back into a typed response
//! - `FnTask`: a task assembled from two closures
//! - `run_task`: acquire a box, execute, release, parse
//!
//! The task module does NOT:
//! - Know which language, checker or protocol a job belongs to
//! - Retry anything (callers decide based on the error kind)

pub mod compile;
pub mod execute;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{EvalError, Result};
use crate::sandbox::{box_file_name, ExecLimits, ExecOutcome, StdioSpec};
use crate::scheduler::{BoxLease, BoxScheduler};

pub use compile::CompileTask;
pub use execute::ExecuteTask;

/// Where the content of a staged file comes from
#[derive(Debug, Clone)]
pub enum FileSource {
    Bytes(Vec<u8>),
    /// A file on the host, e.g. a cached artifact
    Host(PathBuf),
}

/// A file written into the box before the command runs
#[derive(Debug, Clone)]
pub struct BoxFile {
    pub name: String,
    pub source: FileSource,
    pub executable: bool,
}

/// A box file copied out to the host when the command succeeds
#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: String,
    pub dest: PathBuf,
}

/// Box operations for one job
#[derive(Debug, Clone, Default)]
pub struct BoxJob {
    pub files: Vec<BoxFile>,
    /// Command to run; empty stages the files without running anything
    pub command: Vec<String>,
    pub stdio: StdioSpec,
    pub limits: ExecLimits,
    /// Box files read back after the run
    pub collect: Vec<String>,
    pub artifacts: Vec<Artifact>,
}

impl BoxJob {
    pub fn new(command: Vec<String>, limits: ExecLimits) -> Self {
        Self {
            command,
            limits,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.files.push(BoxFile {
            name: name.into(),
            source: FileSource::Bytes(data.into()),
            executable: false,
        });
        self
    }

    pub fn with_host_file(
        mut self,
        source: impl Into<PathBuf>,
        name: impl Into<String>,
        executable: bool,
    ) -> Self {
        self.files.push(BoxFile {
            name: name.into(),
            source: FileSource::Host(source.into()),
            executable,
        });
        self
    }

    pub fn with_stdin(mut self, name: impl Into<String>) -> Self {
        self.stdio.stdin = Some(name.into());
        self
    }

    pub fn with_stdout(mut self, name: impl Into<String>) -> Self {
        self.stdio.stdout = Some(name.into());
        self
    }

    pub fn with_stderr(mut self, name: impl Into<String>) -> Self {
        self.stdio.stderr = Some(name.into());
        self
    }

    pub fn collect(mut self, name: impl Into<String>) -> Self {
        self.collect.push(name.into());
        self
    }

    pub fn persist(mut self, name: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        self.artifacts.push(Artifact {
            name: name.into(),
            dest: dest.into(),
        });
        self
    }
}

/// Everything a job left behind
#[derive(Debug, Clone)]
pub struct BoxOutput {
    pub box_id: u32,
    pub outcome: ExecOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Collected files that existed after the run
    pub files: HashMap<String, Vec<u8>>,
    /// Host paths of the artifacts that were persisted
    pub persisted: Vec<PathBuf>,
}

impl BoxOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A typed job shape
pub trait Task: Send + Sync {
    type Request: Send + Sync;
    type Response: Send;

    /// Short name used in logs
    fn name(&self) -> &str;

    /// Memory ceiling used when the caller passes 0
    fn default_memory_limit_kb(&self) -> Option<u64> {
        None
    }

    fn translate(&self, request: &Self::Request, memory_limit_kb: u64) -> Result<BoxJob>;

    fn parse(&self, request: &Self::Request, output: BoxOutput) -> Result<Self::Response>;
}

/// Task assembled from a translate closure and a parse closure
pub struct FnTask<Req, Resp, T, P> {
    name: String,
    translate: T,
    parse: P,
    _marker: PhantomData<fn(&Req) -> Resp>,
}

impl<Req, Resp, T, P> FnTask<Req, Resp, T, P>
where
    T: Fn(&Req, u64) -> Result<BoxJob> + Send + Sync,
    P: Fn(&Req, BoxOutput) -> Result<Resp> + Send + Sync,
{
    pub fn new(name: impl Into<String>, translate: T, parse: P) -> Self {
        Self {
            name: name.into(),
            translate,
            parse,
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp, T, P> Task for FnTask<Req, Resp, T, P>
where
    Req: Send + Sync,
    Resp: Send,
    T: Fn(&Req, u64) -> Result<BoxJob> + Send + Sync,
    P: Fn(&Req, BoxOutput) -> Result<Resp> + Send + Sync,
{
    type Request = Req;
    type Response = Resp;

    fn name(&self) -> &str {
        &self.name
    }

    fn translate(&self, request: &Req, memory_limit_kb: u64) -> Result<BoxJob> {
        (self.translate)(request, memory_limit_kb)
    }

    fn parse(&self, request: &Req, output: BoxOutput) -> Result<Resp> {
        (self.parse)(request, output)
    }
}

/// Run one task on a box from the scheduler.
///
/// `memory_limit_kb` of 0 selects the task default, then the scheduler
/// default. The box is released on every exit path: explicitly here, or by
/// the lease's `Drop` when this future is cancelled or the job panics.
pub async fn run_task<T>(
    scheduler: &BoxScheduler,
    task: &T,
    memory_limit_kb: u64,
    request: &T::Request,
) -> Result<T::Response>
where
    T: Task + ?Sized,
{
    let requested = match memory_limit_kb {
        0 => task.default_memory_limit_kb().unwrap_or(0),
        kb => kb,
    };
    let memory_limit_kb = scheduler.resolve_memory_limit(requested);
    let job = task.translate(request, memory_limit_kb)?;

    let mut lease = scheduler.acquire(memory_limit_kb).await?;
    debug!(task = task.name(), box_id = lease.box_id(), "Running task");

    let result = execute_job(&mut lease, &job).await;
    lease.release().await;

    task.parse(request, result?)
}

/// Apply a job's operations to a leased box
pub async fn execute_job(lease: &mut BoxLease, job: &BoxJob) -> Result<BoxOutput> {
    let sandbox = lease.sandbox()?;

    for file in &job.files {
        let name = box_file_name(&file.name)?;
        match &file.source {
            FileSource::Bytes(data) => sandbox.write_file(name, data, file.executable).await?,
            FileSource::Host(path) => sandbox.copy_in(path, name, file.executable).await?,
        }
    }

    let outcome = if job.command.is_empty() {
        ExecOutcome::skipped()
    } else {
        match sandbox.run(&job.command, &job.limits, &job.stdio).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, EvalError::BoxUnresponsive { .. }) {
                    lease.mark_unhealthy();
                }
                return Err(e);
            }
        }
    };

    let stdout = match &job.stdio.stdout {
        Some(name) => read_optional(sandbox.read_file(name).await)?.unwrap_or_default(),
        None => Vec::new(),
    };
    let stderr = match &job.stdio.stderr {
        Some(name) => read_optional(sandbox.read_file(name).await)?.unwrap_or_default(),
        None => Vec::new(),
    };

    let mut files = HashMap::new();
    for name in &job.collect {
        if let Some(data) = read_optional(sandbox.read_file(box_file_name(name)?).await)? {
            files.insert(name.clone(), data);
        }
    }

    let mut persisted = Vec::new();
    if outcome.status.is_success() {
        for artifact in &job.artifacts {
            if persist_artifact(sandbox.as_ref(), artifact).await? {
                persisted.push(artifact.dest.clone());
            }
        }
    }

    Ok(BoxOutput {
        box_id: sandbox.id(),
        outcome,
        stdout,
        stderr,
        files,
        persisted,
    })
}

fn read_optional(result: Result<Vec<u8>>) -> Result<Option<Vec<u8>>> {
    match result {
        Ok(data) => Ok(Some(data)),
        Err(EvalError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Copy an artifact out through a temporary file so readers never see a
/// partially written binary. Returns false when the box has no such file.
async fn persist_artifact(sandbox: &dyn crate::sandbox::Sandbox, artifact: &Artifact) -> Result<bool> {
    let dir = artifact.dest.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let staging = tempfile::NamedTempFile::new_in(dir)?;
    match sandbox
        .copy_out(box_file_name(&artifact.name)?, staging.path())
        .await
    {
        Ok(()) => {}
        Err(EvalError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(artifact = %artifact.name, "Expected artifact was not produced");
            return Ok(false);
        }
        Err(e) => return Err(e),
    }

    tokio::fs::set_permissions(staging.path(), std::fs::Permissions::from_mode(0o755)).await?;
    staging
        .persist(&artifact.dest)
        .map_err(|e| EvalError::Io(e.error))?;
    Ok(true)
}
