//! Remote execution contract messages
//!
//! Generated from `proto/eval.proto`, together with the `eval_server` and
//! `eval_client` modules for the `eval.Eval` service.

use crate::sandbox::{ExecOutcome, ExecStatus};

tonic::include_proto!("eval");

impl CompileRequest {
    /// Reject requests that would write the same box file twice
    pub fn validate(&self) -> crate::error::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for name in self.code_files.keys().chain(self.header_files.keys()) {
            let name = crate::sandbox::box_file_name(name)?;
            if !seen.insert(name) {
                return Err(crate::error::EvalError::InvalidRequest(format!(
                    "file {:?} appears more than once",
                    name
                )));
            }
        }
        if self.code_files.is_empty() {
            return Err(crate::error::EvalError::InvalidRequest(
                "no code files to compile".into(),
            ));
        }
        Ok(())
    }
}

impl RunStats {
    pub fn from_outcome(outcome: &ExecOutcome) -> Self {
        let status = match outcome.status {
            ExecStatus::Exited(_) => RunStatus::Exited,
            ExecStatus::TimeLimitExceeded => RunStatus::TimeLimitExceeded,
            ExecStatus::MemoryLimitExceeded => RunStatus::MemoryLimitExceeded,
            ExecStatus::Signaled(_) => RunStatus::Signaled,
            ExecStatus::RuntimeError => RunStatus::RuntimeError,
            ExecStatus::InternalError => RunStatus::InternalError,
        };
        let exit_code = match outcome.status {
            ExecStatus::Exited(code) | ExecStatus::Signaled(code) => code,
            _ => -1,
        };

        Self {
            time: outcome.time_ms as f64 / 1000.0,
            wall_time: outcome.wall_time_ms as f64 / 1000.0,
            memory: outcome.memory_kb as i64,
            exit_code,
            status: status as i32,
            message: outcome.message.clone(),
        }
    }

    pub fn run_status(&self) -> RunStatus {
        RunStatus::try_from(self.status).unwrap_or(RunStatus::InternalError)
    }

    /// Exited normally with code 0
    pub fn is_success(&self) -> bool {
        self.run_status() == RunStatus::Exited && self.exit_code == 0
    }
}
