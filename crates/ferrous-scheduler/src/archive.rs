//! Storage for finished runs.

use async_trait::async_trait;
use ferrous_core::Result;
use ferrous_core::ids::{GroupKey, RunId};
use ferrous_core::ports::RunArchive;
use ferrous_core::run::Run;
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Runs kept by [`InMemoryRunArchive::new`].
pub const DEFAULT_IN_MEMORY_RUNS: usize = 1000;

/// Keeps the most recent finished runs in memory, evicting the oldest once
/// `capacity` is reached.
pub struct InMemoryRunArchive {
    runs: RwLock<VecDeque<Run>>,
    capacity: usize,
}

impl Default for InMemoryRunArchive {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_IN_MEMORY_RUNS)
    }
}

impl InMemoryRunArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            runs: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[async_trait]
impl RunArchive for InMemoryRunArchive {
    async fn store(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.write().await;
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => {
                if runs.len() >= self.capacity
                    && let Some(evicted) = runs.pop_front()
                {
                    debug!(run_id = %evicted.id, "Evicting oldest archived run");
                }
                runs.push_back(run.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<Run>> {
        Ok(self.runs.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, group: Option<&GroupKey>, limit: usize) -> Result<Vec<Run>> {
        let runs = self.runs.read().await;
        Ok(newest_first(runs.iter().cloned(), group, limit))
    }
}

/// Writes each finished run to `<dir>/<run_id>.json`.
pub struct JsonFileRunArchive {
    dir: PathBuf,
}

impl JsonFileRunArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: RunId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl RunArchive for JsonFileRunArchive {
    async fn store(&self, run: &Run) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(run.id);
        let content = serde_json::to_vec_pretty(run)?;
        tokio::fs::write(&path, content).await?;
        debug!(run_id = %run.id, path = %path.display(), "Run archived");
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<Run>> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, group: Option<&GroupKey>, limit: usize) -> Result<Vec<Run>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Run>(&content) {
                Ok(run) => runs.push(run),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run file"),
            }
        }

        Ok(newest_first(runs.into_iter(), group, limit))
    }
}

fn newest_first(
    runs: impl Iterator<Item = Run>,
    group: Option<&GroupKey>,
    limit: usize,
) -> Vec<Run> {
    let mut runs: Vec<Run> = runs
        .filter(|r| group.is_none_or(|g| &r.group == g))
        .collect();
    runs.sort_by(|a, b| b.queued_at.cmp(&a.queued_at).then(b.id.cmp(&a.id)));
    runs.truncate(limit);
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ferrous_core::run::RunPhase;
    use ferrous_core::trigger::TriggerEvent;

    fn finished_run(group: &str, number: u32, age_secs: i64) -> Run {
        let mut run = Run::new(
            RunId::new(),
            "ci",
            GroupKey::new(group),
            number,
            TriggerEvent::push("main", ["src/lib.rs"]),
        );
        run.queued_at = Utc::now() - Duration::seconds(age_secs);
        run.transition(RunPhase::Building).unwrap();
        run.transition(RunPhase::Testing).unwrap();
        run.transition(RunPhase::Succeeded).unwrap();
        run
    }

    #[tokio::test]
    async fn test_in_memory_list_is_newest_first() {
        let archive = InMemoryRunArchive::new();
        let old = finished_run("ci", 1, 60);
        let new = finished_run("ci", 2, 1);
        let other = finished_run("docs", 1, 30);

        archive.store(&old).await.unwrap();
        archive.store(&new).await.unwrap();
        archive.store(&other).await.unwrap();

        let all = archive.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, new.id);

        let ci = archive.list(Some(&GroupKey::new("ci")), 10).await.unwrap();
        let numbers: Vec<u32> = ci.iter().map(|r| r.run_number).collect();
        assert_eq!(numbers, vec![2, 1]);

        let limited = archive.list(None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_store_replaces_existing() {
        let archive = InMemoryRunArchive::new();
        let mut run = finished_run("ci", 1, 0);
        archive.store(&run).await.unwrap();

        run.failure = Some("edited".to_string());
        archive.store(&run).await.unwrap();

        assert_eq!(archive.len().await, 1);
        let stored = archive.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.failure.as_deref(), Some("edited"));
    }

    #[tokio::test]
    async fn test_in_memory_evicts_oldest_past_capacity() {
        let archive = InMemoryRunArchive::with_capacity(2);
        let runs: Vec<Run> = (1..=3).map(|n| finished_run("ci", n, 0)).collect();
        for run in &runs {
            archive.store(run).await.unwrap();
        }

        assert_eq!(archive.len().await, 2);
        assert!(archive.get(runs[0].id).await.unwrap().is_none());
        assert!(archive.get(runs[2].id).await.unwrap().is_some());

        // Updating a kept run does not evict anything
        archive.store(&runs[1]).await.unwrap();
        assert_eq!(archive.len().await, 2);
    }

    #[tokio::test]
    async fn test_json_file_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = JsonFileRunArchive::new(dir.path().join("runs"));

        assert!(archive.list(None, 10).await.unwrap().is_empty());

        let run = finished_run("ci", 1, 0);
        archive.store(&run).await.unwrap();

        let loaded = archive.get(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, RunPhase::Succeeded);
        assert!(archive.get(RunId::new()).await.unwrap().is_none());

        std::fs::write(dir.path().join("runs").join("notes.txt"), "ignored").unwrap();
        let listed = archive.list(Some(&GroupKey::new("ci")), 10).await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
