//! Compiled artifact layout on the host
//!
//! Ordinary submissions live at `<root>/<id>.bin`. Negative ids belong to
//! checkers and graders; those live in the checker cache as
//! `<root>/checker_cache/<problem-id>.bin`. Problem ids start at 1, so the
//! two namespaces never meet.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{EvalError, Result};

const CHECKER_CACHE_DIR: &str = "checker_cache";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checker_cache_dir(&self) -> PathBuf {
        self.root.join(CHECKER_CACHE_DIR)
    }

    /// Host path of the artifact compiled for `id`
    pub fn path_for(&self, id: i64) -> PathBuf {
        if id < 0 {
            self.checker_cache_dir()
                .join(format!("{}.bin", id.unsigned_abs()))
        } else {
            self.root.join(format!("{}.bin", id))
        }
    }

    /// Cached checker binary of a problem
    pub fn checker_path(&self, problem_id: i64) -> Result<PathBuf> {
        Ok(self.path_for(checker_artifact_id(problem_id)?))
    }

    /// Remove the artifact of `id`; removing a missing artifact succeeds
    pub async fn remove(&self, id: i64) -> Result<bool> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(id, "Removed artifact {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Artifact id a problem's checker is compiled under
pub fn checker_artifact_id(problem_id: i64) -> Result<i64> {
    if problem_id <= 0 {
        return Err(EvalError::InvalidRequest(format!(
            "invalid problem id {}",
            problem_id
        )));
    }
    Ok(-problem_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let store = ArtifactStore::new("/var/judge");
        assert_eq!(store.path_for(15), PathBuf::from("/var/judge/15.bin"));
        assert_eq!(
            store.path_for(-42),
            PathBuf::from("/var/judge/checker_cache/42.bin")
        );
        assert_eq!(store.checker_path(42).unwrap(), store.path_for(-42));
        assert_eq!(
            store.path_for(i64::MIN),
            PathBuf::from(format!("/var/judge/checker_cache/{}.bin", 1u64 << 63))
        );
    }

    #[test]
    fn test_checker_ids_stay_out_of_submission_slots() {
        let store = ArtifactStore::new("/var/judge");
        assert_eq!(checker_artifact_id(1).unwrap(), -1);
        assert_eq!(checker_artifact_id(i64::MAX).unwrap(), -i64::MAX);

        for problem_id in [0, -5, i64::MIN] {
            let err = store.checker_path(problem_id).unwrap_err();
            assert!(matches!(err, EvalError::InvalidRequest(_)));
        }
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        std::fs::write(store.path_for(3), b"bin").unwrap();

        assert!(store.remove(3).await.unwrap());
        assert!(!store.remove(3).await.unwrap());
        assert!(!store.remove(-9).await.unwrap());
    }
}
