//! Worker configuration, read from the environment (and `.env`)

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::artifacts::ArtifactStore;
use crate::checker::CheckerSettings;
use crate::languages::LanguageRegistry;
use crate::scheduler::SchedulerConfig;
use crate::task::compile::CompileLimits;

#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Root of compiled artifacts; the checker cache lives under it
    pub compile_path: PathBuf,
    pub scheduler: SchedulerConfig,
    /// Grace period for killing a runaway box and for cleaning it up
    pub kill_grace: Duration,
    pub compile: CompileLimits,
    pub checker: CheckerSettings,
    /// Processes a program under test may use
    pub run_processes: u32,
    pub listen_addr: String,
    pub testlib_path: PathBuf,
    /// Replaces the built-in language registry when set
    pub languages_config: Option<PathBuf>,
}

impl EvalConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let kill_grace = Duration::from_millis(env_or("EVAL_KILL_GRACE_MS", 5000)?);
        let acquire_timeout = match std::env::var("EVAL_ACQUIRE_TIMEOUT_SECS") {
            Ok(value) => Some(Duration::from_secs(parse_var("EVAL_ACQUIRE_TIMEOUT_SECS", &value)?)),
            Err(_) => None,
        };

        let scheduler = SchedulerConfig {
            first_box_id: env_or("EVAL_FIRST_BOX_ID", 0)?,
            num_boxes: env_or("EVAL_NUM_BOXES", 4)?,
            default_memory_kb: env_or("EVAL_DEFAULT_MEMORY_KB", 256 * 1024)?,
            acquire_timeout,
            release_grace: kill_grace,
        };
        if scheduler.num_boxes == 0 {
            return Err(anyhow!("EVAL_NUM_BOXES must be at least 1"));
        }

        let compile = CompileLimits {
            time: Duration::from_millis(env_or("EVAL_COMPILE_TIME_LIMIT_MS", 30_000)?),
            memory_kb: env_or::<u64>("EVAL_COMPILE_MEMORY_LIMIT_MB", 2048)? * 1024,
            ..Default::default()
        };
        let checker = CheckerSettings {
            memory_kb: env_or("EVAL_CHECKER_MEMORY_KB", 512 * 1024)?,
            time: Duration::from_millis(env_or("EVAL_CHECKER_TIME_LIMIT_MS", 20_000)?),
            compile: compile.clone(),
        };

        Ok(Self {
            compile_path: std::env::var("EVAL_COMPILE_PATH")
                .unwrap_or_else(|_| "./data/compiled".into())
                .into(),
            scheduler,
            kill_grace,
            compile,
            checker,
            run_processes: env_or("EVAL_RUN_PROCESSES", 1)?,
            listen_addr: std::env::var("EVAL_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".into()),
            testlib_path: std::env::var("TESTLIB_PATH")
                .unwrap_or_else(|_| "./files/testlib.h".into())
                .into(),
            languages_config: std::env::var("LANGUAGES_CONFIG").ok().map(PathBuf::from),
        })
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.compile_path)
    }

    pub fn load_languages(&self) -> anyhow::Result<LanguageRegistry> {
        match &self.languages_config {
            Some(path) => LanguageRegistry::from_file(path),
            None => LanguageRegistry::builtin(),
        }
    }

    pub fn load_testlib(&self) -> anyhow::Result<Vec<u8>> {
        std::fs::read(&self.testlib_path)
            .with_context(|| format!("Failed to read testlib header {}", self.testlib_path.display()))
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(value) => parse_var(key, &value),
        Err(_) => Ok(default),
    }
}

fn parse_var<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("Invalid {}={:?}: {}", key, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(parse_var::<u32>("EVAL_NUM_BOXES", " 8 ").unwrap(), 8);
        let err = parse_var::<u32>("EVAL_NUM_BOXES", "eight").unwrap_err();
        assert!(err.to_string().contains("EVAL_NUM_BOXES"));
    }

    #[test]
    fn test_defaults() {
        // Assumes the EVAL_* variables are unset in the test environment
        let config = EvalConfig::from_env().unwrap();
        assert_eq!(config.checker.memory_kb, 512 * 1024);
        assert_eq!(config.scheduler.release_grace, config.kill_grace);
        assert_eq!(config.artifact_store().checker_cache_dir(), config.compile_path.join("checker_cache"));
        assert!(config.load_languages().unwrap().get("cpp17").is_some());
    }

    #[test]
    fn test_load_testlib() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EvalConfig::from_env().unwrap();

        config.testlib_path = dir.path().join("testlib.h");
        let err = config.load_testlib().unwrap_err();
        assert!(err.to_string().contains("testlib.h"));

        std::fs::write(&config.testlib_path, b"#ifndef _TESTLIB_H_").unwrap();
        assert_eq!(config.load_testlib().unwrap(), b"#ifndef _TESTLIB_H_");
    }
}
