//! Isolate box management
//!
//! Low-level wrapper around the isolate sandbox for secure code execution.
//! Manages box initialization, cleanup, and command execution.
//!
//! See: https://github.com/ioi/isolate

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ExecLimits, ExecOutcome, ExecStatus, Sandbox, SandboxFactory, StdioSpec};
use crate::error::{EvalError, Result};

/// Cached cgroup availability
static USE_CGROUPS: OnceLock<bool> = OnceLock::new();

/// Box id used only for probing cgroup support
const PROBE_BOX_ID: &str = "999";

/// Check if isolate cgroups are available
pub async fn is_cgroups_available() -> bool {
    if let Some(value) = USE_CGROUPS.get() {
        return *value;
    }

    // Try to initialize a test box with cgroups
    let test_result = Command::new("isolate")
        .args(["--box-id", PROBE_BOX_ID, "--cg", "--init"])
        .output()
        .await;

    // Cleanup
    let _ = Command::new("isolate")
        .args(["--box-id", PROBE_BOX_ID, "--cg", "--cleanup"])
        .output()
        .await;

    let available = match test_result {
        Ok(r) => r.status.success(),
        Err(_) => false,
    };

    let _ = USE_CGROUPS.set(available);
    available
}

/// Ensure cgroups are available; return an error otherwise
pub async fn ensure_cgroups_available() -> anyhow::Result<()> {
    if is_cgroups_available().await {
        Ok(())
    } else {
        anyhow::bail!("Isolate cgroup support is required but not available. Install isolate with cgroup support and ensure cgroups are enabled.")
    }
}

/// Creates isolate boxes for the scheduler
#[derive(Debug, Clone)]
pub struct IsolateFactory {
    use_cgroups: bool,
    kill_grace: Duration,
}

impl IsolateFactory {
    pub fn new(use_cgroups: bool, kill_grace: Duration) -> Self {
        Self {
            use_cgroups,
            kill_grace,
        }
    }
}

#[async_trait]
impl SandboxFactory for IsolateFactory {
    async fn create(&self, box_id: u32) -> Result<Arc<dyn Sandbox>> {
        let isolate_box = IsolateBox::new(box_id, self.use_cgroups, self.kill_grace).await?;
        Ok(Arc::new(isolate_box))
    }
}

/// Isolate box manager
#[derive(Debug)]
pub struct IsolateBox {
    box_id: u32,
    box_path: PathBuf,
    use_cgroups: bool,
    kill_grace: Duration,
}

impl IsolateBox {
    /// Create and initialize a new isolate box
    pub async fn new(box_id: u32, use_cgroups: bool, kill_grace: Duration) -> Result<Self> {
        let box_id_str = box_id.to_string();

        // Clean up any state a previous tenant left behind
        let _ = Command::new("isolate")
            .args(cgroup_args(use_cgroups, &box_id_str, "--cleanup"))
            .output()
            .await;

        let output = Command::new("isolate")
            .args(cgroup_args(use_cgroups, &box_id_str, "--init"))
            .output()
            .await
            .map_err(|e| EvalError::BoxStart {
                box_id,
                reason: format!("failed to run isolate --init: {}", e),
            })?;

        if !output.status.success() {
            return Err(EvalError::BoxStart {
                box_id,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        info!(
            "Initialized isolate box {} at {} (cgroups: {})",
            box_id,
            box_path.display(),
            use_cgroups
        );

        Ok(Self {
            box_id,
            box_path,
            use_cgroups,
            kill_grace,
        })
    }

    /// Get the path to the box/box subdirectory (working directory for programs)
    pub fn work_dir(&self) -> PathBuf {
        self.box_path.join("box")
    }

    fn box_file(&self, name: &str) -> PathBuf {
        self.work_dir().join(name)
    }

    fn build_args(&self, command: &[String], limits: &ExecLimits, io: &StdioSpec, meta_file: &Path) -> Vec<String> {
        let mut args = vec!["--box-id".to_string(), self.box_id.to_string()];

        if self.use_cgroups {
            args.push("--cg".to_string());
            args.push(format!("--cg-mem={}", limits.memory_kb));
        } else {
            args.push(format!("--mem={}", limits.memory_kb));
        }

        args.extend([
            format!("--time={}", limits.time.as_secs_f64()),
            format!("--wall-time={}", limits.wall_time.as_secs_f64()),
            format!("--meta={}", meta_file.display()),
            format!("--processes={}", limits.processes),
            format!("--fsize={}", limits.fsize_kb),
            // Mount directories needed for runtime
            "--dir=/usr".to_string(),
            "--dir=/lib".to_string(),
            "--dir=/lib64:maybe".to_string(),
            "--dir=/etc:noexec".to_string(),
            // Environment variables
            "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
            "--env=HOME=/box".to_string(),
        ]);

        if let Some(stdin) = &io.stdin {
            args.push(format!("--stdin={}", stdin));
        }
        if let Some(stdout) = &io.stdout {
            args.push(format!("--stdout={}", stdout));
        }
        if let Some(stderr) = &io.stderr {
            args.push(format!("--stderr={}", stderr));
        }

        args.push("--run".to_string());
        args.push("--".to_string());

        // Prepend /usr/bin/ to the command if it's not an absolute path
        let mut cmd_iter = command.iter();
        if let Some(cmd) = cmd_iter.next() {
            if cmd.starts_with('/') || cmd.starts_with("./") {
                args.push(cmd.clone());
            } else {
                args.push(format!("/usr/bin/{}", cmd));
            }
            args.extend(cmd_iter.cloned());
        }

        args
    }
}

#[async_trait]
impl Sandbox for IsolateBox {
    fn id(&self) -> u32 {
        self.box_id
    }

    async fn write_file(&self, name: &str, data: &[u8], executable: bool) -> Result<()> {
        let dest = self.box_file(name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&dest, data).await?;
        set_mode(&dest, executable).await
    }

    async fn copy_in(&self, source: &Path, name: &str, executable: bool) -> Result<()> {
        let dest = self.box_file(name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(source, &dest).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EvalError::MissingArtifact(source.to_path_buf())
            } else {
                EvalError::Sandbox(format!(
                    "failed to copy {} into box {}: {}",
                    source.display(),
                    self.box_id,
                    e
                ))
            }
        })?;
        set_mode(&dest, executable).await
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.box_file(name)).await?)
    }

    async fn copy_out(&self, name: &str, dest: &Path) -> Result<()> {
        fs::copy(self.box_file(name), dest).await?;
        Ok(())
    }

    async fn run(
        &self,
        command: &[String],
        limits: &ExecLimits,
        io: &StdioSpec,
    ) -> Result<ExecOutcome> {
        let meta_file = std::env::temp_dir().join(format!("isolate_meta_{}.txt", self.box_id));
        let args = self.build_args(command, limits, io, &meta_file);

        debug!("Running isolate with args: {:?}", args);

        let mut child = Command::new("isolate")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EvalError::Sandbox(format!("failed to run isolate: {}", e)))?;

        // isolate enforces the wall clock itself; the extra grace covers a
        // keeper process that hangs on teardown
        let deadline = limits.wall_time + self.kill_grace;
        if tokio::time::timeout(deadline, child.wait()).await.is_err() {
            warn!(
                "Box {} exceeded its wall clock by more than {:?}, terminating",
                self.box_id, self.kill_grace
            );
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
                let _ = child.start_kill();
            }
            return Err(EvalError::BoxUnresponsive {
                box_id: self.box_id,
            });
        }

        let meta_content = fs::read_to_string(&meta_file).await.unwrap_or_default();
        let _ = fs::remove_file(&meta_file).await;

        if meta_content.is_empty() {
            return Err(EvalError::Sandbox(format!(
                "isolate produced no meta file for box {}",
                self.box_id
            )));
        }

        Ok(outcome_from_meta(&meta_content, limits.memory_kb))
    }

    async fn cleanup(&self) -> Result<()> {
        let output = Command::new("isolate")
            .args(cgroup_args(self.use_cgroups, &self.box_id.to_string(), "--cleanup"))
            .output()
            .await?;
        if !output.status.success() {
            return Err(EvalError::Sandbox(format!(
                "isolate --cleanup failed for box {}: {}",
                self.box_id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("Cleaned up isolate box {}", self.box_id);
        Ok(())
    }
}

fn cgroup_args(use_cgroups: bool, box_id: &str, action: &str) -> Vec<String> {
    let mut args = vec!["--box-id".to_string(), box_id.to_string()];
    if use_cgroups {
        args.push("--cg".to_string());
    }
    args.push(action.to_string());
    args
}

async fn set_mode(path: &Path, executable: bool) -> Result<()> {
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

/// Turn isolate's `--meta` report into a raw execution outcome.
///
/// The report is `key:value` lines. `status` is missing on a clean exit, `RE`
/// on a nonzero exit code, `SG` on a fatal signal, `TO` on a timeout and `XX`
/// when isolate itself failed.
fn outcome_from_meta(report: &str, memory_limit_kb: u64) -> ExecOutcome {
    let mut outcome = ExecOutcome::skipped();
    let mut status = None;
    let mut exit_code = 0;
    let mut exit_signal = None;
    let mut oom_killed = false;

    for (key, value) in report.lines().filter_map(|line| line.split_once(':')) {
        let value = value.trim();
        match key.trim() {
            "time" => outcome.time_ms = seconds_to_ms(value).unwrap_or(outcome.time_ms),
            "time-wall" => {
                outcome.wall_time_ms = seconds_to_ms(value).unwrap_or(outcome.wall_time_ms)
            }
            // cg-mem with cgroups, max-rss without; keep the peak
            "cg-mem" | "max-rss" => {
                if let Ok(kb) = value.parse::<u64>() {
                    outcome.memory_kb = outcome.memory_kb.max(kb);
                }
            }
            "cg-oom-killed" => oom_killed = value == "1",
            "exitcode" => exit_code = value.parse().unwrap_or(-1),
            "exitsig" => exit_signal = value.parse::<i32>().ok(),
            "status" => status = Some(value.to_string()),
            "message" => outcome.message = value.to_string(),
            _ => {}
        }
    }

    // A timed-out program is killed by isolate, so TO wins over exitsig
    let status = match (status.as_deref(), exit_signal) {
        (Some("TO"), _) => ExecStatus::TimeLimitExceeded,
        (Some("XX"), _) => ExecStatus::InternalError,
        (_, Some(signal)) => ExecStatus::Signaled(signal),
        (Some("SG"), None) => ExecStatus::Signaled(0),
        (Some("RE"), _) if exit_code != 0 => ExecStatus::Exited(exit_code),
        (None, _) => ExecStatus::Exited(exit_code),
        (Some(_), _) => ExecStatus::RuntimeError,
    };

    outcome.status = match status {
        ExecStatus::InternalError | ExecStatus::TimeLimitExceeded => status,
        _ if oom_killed || outcome.memory_kb > memory_limit_kb => ExecStatus::MemoryLimitExceeded,
        _ => status,
    };
    outcome
}

fn seconds_to_ms(value: &str) -> Option<u64> {
    let seconds = value.parse::<f64>().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| (seconds * 1000.0).round() as u64)
}
