//! Sandbox module - Box primitive abstraction
//!
//! This module provides the single-tenant execution slot ("box") the
//! scheduler hands out. It handles:
//! - The `Sandbox` trait every box implementation provides
//! - Raw execution limits and outcomes (no verdict interpretation)
//! - The isolate-backed implementation
//!
//! The sandbox module does NOT:
//! - Decide which job gets which box (that's the scheduler's job)
//! - Know about languages, checkers or scores

pub mod isolate_box;

#[cfg(test)]
pub mod fake;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EvalError, Result};

pub use isolate_box::{ensure_cgroups_available, is_cgroups_available, IsolateBox, IsolateFactory};

/// Resource limits for one run inside a box
#[derive(Debug, Clone, PartialEq)]
pub struct ExecLimits {
    /// CPU time limit
    pub time: Duration,
    /// Wall clock limit
    pub wall_time: Duration,
    /// Memory limit in KB
    pub memory_kb: u64,
    /// Maximum number of processes
    pub processes: u32,
    /// Maximum file size in KB
    pub fsize_kb: u64,
}

impl ExecLimits {
    /// Limits derived from a CPU time and memory ceiling, with the wall
    /// clock at twice the CPU time plus one second
    pub fn new(time: Duration, memory_kb: u64) -> Self {
        Self {
            time,
            wall_time: time * 2 + Duration::from_secs(1),
            memory_kb,
            ..Default::default()
        }
    }

    pub fn with_processes(mut self, processes: u32) -> Self {
        self.processes = processes;
        self
    }
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(1),
            wall_time: Duration::from_secs(3),
            memory_kb: 256 * 1024,
            processes: 1,
            fsize_kb: 262_144, // 256MB
        }
    }
}

/// Standard stream redirection, as file names inside the box
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StdioSpec {
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Raw execution status (no verdict interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Time limit exceeded (CPU or wall clock)
    TimeLimitExceeded,
    /// Memory limit exceeded
    MemoryLimitExceeded,
    /// Killed by signal
    Signaled(i32),
    /// Runtime error reported by the sandbox without an exit code
    RuntimeError,
    /// Sandbox internal error
    InternalError,
}

impl ExecStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecStatus::Exited(0))
    }
}

/// Outcome of running a program in a box
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    /// CPU time used in milliseconds
    pub time_ms: u64,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u64,
    /// Peak memory in KB
    pub memory_kb: u64,
    /// Diagnostic message from the sandbox, if any
    pub message: String,
}

impl ExecOutcome {
    /// Outcome of a job that stages files without running anything
    pub fn skipped() -> Self {
        Self {
            status: ExecStatus::Exited(0),
            time_ms: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            message: String::new(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            ExecStatus::Exited(code) => code,
            _ => -1,
        }
    }
}

/// One isolated, single-tenant execution slot
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> u32;

    /// Write a file into the box working directory
    async fn write_file(&self, name: &str, data: &[u8], executable: bool) -> Result<()>;

    /// Copy a host file into the box working directory
    async fn copy_in(&self, source: &Path, name: &str, executable: bool) -> Result<()>;

    /// Read a file from the box working directory
    async fn read_file(&self, name: &str) -> Result<Vec<u8>>;

    /// Copy a file out of the box working directory
    async fn copy_out(&self, name: &str, dest: &Path) -> Result<()>;

    /// Run a command inside the box
    async fn run(&self, command: &[String], limits: &ExecLimits, io: &StdioSpec)
        -> Result<ExecOutcome>;

    /// Discard all box state so the slot can serve the next tenant
    async fn cleanup(&self) -> Result<()>;
}

/// Creates boxes for the scheduler, each starting from a clean filesystem
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, box_id: u32) -> Result<Arc<dyn Sandbox>>;
}

/// Validate a file name for use inside a box.
///
/// Names are relative to the box working directory; a leading `/box/` is
/// accepted and stripped.
pub fn box_file_name(name: &str) -> Result<&str> {
    let name = name.strip_prefix("/box/").unwrap_or(name);
    let valid = !name.is_empty()
        && !name.starts_with('/')
        && Path::new(name)
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
    if valid {
        Ok(name)
    } else {
        Err(EvalError::InvalidRequest(format!(
            "invalid file name for box: {:?}",
            name
        )))
    }
}
