//! Historical unit durations.
//!
//! Expected durations drive [`by_duration`](crate::orchestrator::partitioner::by_duration)
//! partitioning; actual durations of passed units are sent back after every
//! run. Statistics are best effort: callers log errors and carry on as if no
//! statistics were configured.
//!
//! The bundled backend keeps the history in a JSON file:
//!
//! ```json
//! {
//!   "shop/staging": {
//!     "tests/LoginCest.php:signIn": [12, 14, 11]
//!   }
//! }
//! ```
//!
//! Scopes are `<project>/<environment>`, with `_` standing in for an empty
//! name. The expected duration of a unit is the median of its history.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Durations kept per unit; older ones are dropped first.
pub const HISTORY_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum StatisticsError {
    #[error("cannot access statistics file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed statistics file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Source and sink of per-unit durations in seconds.
#[async_trait]
pub trait StatisticsBackend: Send + Sync {
    /// Expected durations of the known units among `ids`.
    async fn fetch_expected_durations(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, u64>, StatisticsError>;

    async fn send_actual_durations(
        &self,
        durations: &BTreeMap<String, u64>,
    ) -> Result<(), StatisticsError>;
}

type History = BTreeMap<String, BTreeMap<String, Vec<u64>>>;

/// Statistics stored in a local JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStatistics {
    path: PathBuf,
    scope: String,
}

impl JsonFileStatistics {
    pub fn new(path: impl Into<PathBuf>, project: &str, environment: &str) -> Self {
        let name = |s: &str| if s.is_empty() { "_".to_string() } else { s.to_string() };
        Self {
            path: path.into(),
            scope: format!("{}/{}", name(project), name(environment)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<History, StatisticsError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No statistics at {}", self.path.display());
                return Ok(History::new());
            }
            Err(source) => {
                return Err(StatisticsError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        if contents.trim().is_empty() {
            return Ok(History::new());
        }
        serde_json::from_str(&contents).map_err(|source| StatisticsError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    async fn store(&self, history: &History) -> Result<(), StatisticsError> {
        let io_error = |source| StatisticsError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let contents = serde_json::to_string_pretty(history).map_err(|source| StatisticsError::Parse {
            path: self.path.clone(),
            source,
        })?;
        tokio::fs::write(&self.path, contents).await.map_err(io_error)
    }
}

#[async_trait]
impl StatisticsBackend for JsonFileStatistics {
    async fn fetch_expected_durations(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, u64>, StatisticsError> {
        let history = self.load().await?;
        let Some(scope) = history.get(&self.scope) else {
            return Ok(HashMap::new());
        };

        let durations: HashMap<String, u64> = ids
            .iter()
            .filter_map(|id| Some((id.clone(), median(scope.get(id)?)?)))
            .collect();
        debug!("Fetched {} expected durations from {}", durations.len(), self.path.display());
        Ok(durations)
    }

    async fn send_actual_durations(
        &self,
        durations: &BTreeMap<String, u64>,
    ) -> Result<(), StatisticsError> {
        if durations.is_empty() {
            return Ok(());
        }

        let mut history = self.load().await?;
        let scope = history.entry(self.scope.clone()).or_default();
        for (id, secs) in durations {
            debug!("{}: {}", id, secs);
            let runs = scope.entry(id.clone()).or_default();
            runs.push(*secs);
            if runs.len() > HISTORY_LEN {
                let excess = runs.len() - HISTORY_LEN;
                runs.drain(..excess);
            }
        }
        self.store(&history).await
    }
}

/// Upper median.
fn median(values: &[u64]) -> Option<u64> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted.get(sorted.len() / 2).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[7]), Some(7));
        assert_eq!(median(&[9, 1, 5]), Some(5));
        assert_eq!(median(&[4, 1, 3, 2]), Some(3));
    }

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let stats = JsonFileStatistics::new(dir.path().join("stats/durations.json"), "shop", "");

        assert!(
            stats
                .fetch_expected_durations(&["a".to_string()])
                .await
                .unwrap()
                .is_empty()
        );

        for secs in [10, 30, 20] {
            stats
                .send_actual_durations(&BTreeMap::from([("a".to_string(), secs)]))
                .await
                .unwrap();
        }
        stats
            .send_actual_durations(&BTreeMap::from([("b".to_string(), 4)]))
            .await
            .unwrap();

        let fetched = stats
            .fetch_expected_durations(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(fetched, HashMap::from([("a".to_string(), 20), ("b".to_string(), 4)]));

        let raw = std::fs::read_to_string(stats.path()).unwrap();
        assert!(raw.contains("\"shop/_\""));
    }

    #[tokio::test]
    async fn test_scopes_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("durations.json");
        let staging = JsonFileStatistics::new(&path, "shop", "staging");
        let prod = JsonFileStatistics::new(&path, "shop", "prod");

        staging
            .send_actual_durations(&BTreeMap::from([("a".to_string(), 5)]))
            .await
            .unwrap();

        let ids = ["a".to_string()];
        assert!(prod.fetch_expected_durations(&ids).await.unwrap().is_empty());
        assert_eq!(staging.fetch_expected_durations(&ids).await.unwrap().get("a"), Some(&5));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let stats = JsonFileStatistics::new(dir.path().join("durations.json"), "", "");

        for secs in 0..(HISTORY_LEN as u64 + 10) {
            stats
                .send_actual_durations(&BTreeMap::from([("a".to_string(), secs)]))
                .await
                .unwrap();
        }

        let history = stats.load().await.unwrap();
        let runs = &history["_/_"]["a"];
        assert_eq!(runs.len(), HISTORY_LEN);
        assert_eq!(runs[0], 10);
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("durations.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStatistics::new(&path, "", "")
            .fetch_expected_durations(&["a".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StatisticsError::Parse { .. }));
    }
}
