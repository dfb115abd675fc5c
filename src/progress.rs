//! Job progress checkpoints for resuming interrupted bursts.
//!
//! A checkpoint carries the job identity, the tokens still to process, the
//! quality-assurance flags of the original invocation and the counters
//! accumulated so far. Resuming from it reproduces the remaining work of an
//! uninterrupted run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::Counters;
use crate::error::BurstError;

/// Interval between attempts when the checkpoint file cannot be written.
const SAVE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_type: String,
    pub source_path: String,
    pub config_path: String,
    /// Unprocessed tokens in discovery order.
    pub remaining_tokens: Vec<String>,

    pub test_all: bool,
    pub test_tokens: String,
    pub random_test_count: usize,

    /// Counters before the first remaining token.
    #[serde(default)]
    pub counters: Counters,

    #[serde(default)]
    pub current_date: String,
    #[serde(default)]
    pub last_token_processed: Option<String>,
    #[serde(default)]
    pub last_token_in_document: Option<String>,
    #[serde(default)]
    pub tokens_count: usize,
    #[serde(default)]
    pub pages_count: usize,
    #[serde(default)]
    pub index_of_last_token_processed: Option<usize>,
    #[serde(default)]
    pub number_of_remaining_tokens: usize,
}

impl JobProgress {
    /// Check that this checkpoint belongs to the job being resumed.
    pub fn validate_for(&self, source_path: &Path, tokens: &[String]) -> Result<(), BurstError> {
        if Path::new(&self.source_path) != source_path {
            return Err(BurstError::Configuration(format!(
                "checkpoint was written for '{}', not '{}'",
                self.source_path,
                source_path.display()
            )));
        }
        if let Some(unknown) = self.remaining_tokens.iter().find(|t| !tokens.contains(t)) {
            return Err(BurstError::Configuration(format!(
                "checkpoint token '{unknown}' is not present in '{}'",
                source_path.display()
            )));
        }
        Ok(())
    }

    pub fn is_remaining(&self, token: &str) -> bool {
        self.remaining_tokens.iter().any(|t| t == token)
    }
}

/// Checkpoint file for one source document.
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store under `temp_dir`, named after a hash of the source path so
    /// concurrent jobs on different documents never collide.
    pub fn for_source(temp_dir: &Path, source_path: &Path) -> Self {
        let digest = Sha256::digest(source_path.to_string_lossy().as_bytes());
        let short: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        let stem = source_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".into());
        Self::new(temp_dir.join(format!("{stem}-{short}.progress.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write the checkpoint, retrying until the write succeeds.
    ///
    /// The write goes to a sibling file first and is renamed into place.
    /// There is no attempt cap; the job blocks here until the write lands.
    pub fn save(&self, progress: &JobProgress) -> Result<(), BurstError> {
        let json = serde_json::to_string_pretty(progress)?;
        let staging = self.path.with_extension("json.partial");
        let mut attempt: u64 = 0;
        loop {
            match self.write_once(&staging, &json) {
                Ok(()) => {
                    tracing::debug!(
                        path = %self.path.display(),
                        remaining = progress.remaining_tokens.len(),
                        "Checkpoint saved"
                    );
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "Checkpoint write failed, retrying"
                    );
                    std::thread::sleep(SAVE_RETRY_INTERVAL);
                }
            }
        }
    }

    fn write_once(&self, staging: &Path, json: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(staging, json)?;
        std::fs::rename(staging, &self.path)
    }

    pub fn load(&self) -> Result<Option<JobProgress>, BurstError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| BurstError::resource(&self.path, e))?;
        let progress = serde_json::from_str(&raw).map_err(|e| {
            BurstError::Configuration(format!(
                "corrupt checkpoint '{}': {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(progress))
    }

    /// Load and delete; a consumed checkpoint is not reused.
    pub fn take(&self) -> Result<Option<JobProgress>, BurstError> {
        let progress = self.load()?;
        if progress.is_some() {
            self.clear();
        }
        Ok(progress)
    }

    pub fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove checkpoint");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JobProgress {
        JobProgress {
            job_type: "burst".into(),
            source_path: "/in/Payslips.pdf".into(),
            config_path: "config/settings.json".into(),
            remaining_tokens: vec!["beta".into(), "gamma".into()],
            test_all: false,
            test_tokens: "alpha,beta,gamma".into(),
            random_test_count: 0,
            counters: Counters { extracted: 1, distributed: 1, ..Default::default() },
            current_date: "2024-05-07 10:00:00".into(),
            last_token_processed: Some("alpha".into()),
            last_token_in_document: Some("gamma".into()),
            tokens_count: 3,
            pages_count: 3,
            index_of_last_token_processed: Some(0),
            number_of_remaining_tokens: 2,
        }
    }

    #[test]
    fn checkpoint_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("job.progress.json"));
        let progress = sample();
        store.save(&progress).unwrap();
        assert_eq!(store.load().unwrap(), Some(progress));
    }

    #[test]
    fn take_consumes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("job.progress.json"));
        store.save(&sample()).unwrap();
        assert!(store.take().unwrap().is_some());
        assert!(!store.exists());
        assert!(store.take().unwrap().is_none());
    }

    #[test]
    fn save_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("a").join("b").join("p.json"));
        store.save(&sample()).unwrap();
        assert!(store.exists());
    }

    #[test]
    fn store_name_depends_on_source_path() {
        let dir = Path::new("/tmp/t");
        let a = ProgressStore::for_source(dir, Path::new("/in/a/report.pdf"));
        let b = ProgressStore::for_source(dir, Path::new("/in/b/report.pdf"));
        assert_ne!(a.path(), b.path());
        assert!(a.path().to_string_lossy().contains("report-"));
    }

    #[test]
    fn validate_rejects_other_source() {
        let tokens: Vec<String> = vec!["alpha".into(), "beta".into(), "gamma".into()];
        let progress = sample();
        assert!(progress.validate_for(Path::new("/in/Payslips.pdf"), &tokens).is_ok());
        assert!(matches!(
            progress.validate_for(Path::new("/in/Other.pdf"), &tokens),
            Err(BurstError::Configuration(_))
        ));
    }

    #[test]
    fn validate_rejects_unknown_token() {
        let tokens: Vec<String> = vec!["alpha".into(), "beta".into()];
        let err = sample().validate_for(Path::new("/in/Payslips.pdf"), &tokens).unwrap_err();
        assert!(err.to_string().contains("gamma"));
    }

    #[test]
    fn older_checkpoint_without_counters_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        std::fs::write(
            &path,
            r#"{"job_type":"burst","source_path":"a.pdf","config_path":"c.json",
                "remaining_tokens":["x"],"test_all":false,"test_tokens":"","random_test_count":0}"#,
        )
        .unwrap();
        let progress = ProgressStore::new(path).load().unwrap().unwrap();
        assert_eq!(progress.counters, Counters::default());
        assert!(progress.is_remaining("x"));
    }

    #[test]
    fn clear_missing_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        ProgressStore::new(dir.path().join("none.json")).clear();
    }
}
