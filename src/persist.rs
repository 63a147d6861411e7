use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::artifact::{self, ArtifactPaths};
use crate::formats::Item;

/// Writes complete snapshots of a topic's collection every `save_interval`
/// accepted items and once more at the end.
#[derive(Debug)]
pub struct IncrementalPersister {
    dir: PathBuf,
    topic: String,
    save_interval: usize,
    pending: usize,
    flushes: usize,
}

impl IncrementalPersister {
    pub fn new(dir: impl Into<PathBuf>, topic: impl Into<String>, save_interval: usize) -> Self {
        Self {
            dir: dir.into(),
            topic: topic.into(),
            save_interval: save_interval.max(1),
            pending: 0,
            flushes: 0,
        }
    }

    pub fn incremental_paths(&self) -> ArtifactPaths {
        artifact::incremental_paths(&self.dir, &self.topic)
    }

    /// Number of successful flushes so far.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Items accepted since the last successful flush.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Counts one newly accepted item and flushes once the interval is reached.
    /// A failed flush keeps the pending count, so the next call retries it.
    pub fn note_accepted(&mut self, items: &[Item]) -> anyhow::Result<bool> {
        self.pending += 1;
        if self.pending < self.save_interval {
            return Ok(false);
        }
        self.flush(items)?;
        Ok(true)
    }

    /// Rewrites the incremental snapshot with every item in `items`.
    pub fn flush(&mut self, items: &[Item]) -> anyhow::Result<ArtifactPaths> {
        let paths = self.incremental_paths();
        artifact::write_snapshot(&paths, items)?;
        self.pending = 0;
        self.flushes += 1;
        tracing::info!(
            topic = %self.topic,
            items = items.len(),
            path = %paths.json.display(),
            "saved incremental snapshot"
        );
        Ok(paths)
    }

    /// Final flush: refreshes the incremental snapshot and writes a
    /// timestamped one next to it.
    pub fn finalize(&mut self, items: &[Item], at: DateTime<Utc>) -> anyhow::Result<ArtifactPaths> {
        self.flush(items)?;
        let paths = artifact::timestamped_paths(&self.dir, &self.topic, at);
        artifact::write_snapshot(&paths, items)?;
        tracing::info!(
            topic = %self.topic,
            items = items.len(),
            json = %paths.json.display(),
            csv = %paths.csv.display(),
            "saved final snapshot"
        );
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactForm, ArtifactKind, ArtifactRef};

    fn item(id: &str) -> Item {
        Item {
            stable_id: id.to_owned(),
            title: format!("title {id}"),
            author: "a".to_owned(),
            source_label: "diabetes".to_owned(),
            created_utc: String::new(),
            engagement_score: 0,
            reply_count: 0,
            canonical_url: String::new(),
            body: String::new(),
            upvote_ratio: 0.0,
            replies: Vec::new(),
            collected_at: String::new(),
        }
    }

    fn load(path: PathBuf) -> anyhow::Result<Vec<Item>> {
        artifact::load_items(&ArtifactRef {
            path,
            form: ArtifactForm::Full,
            kind: ArtifactKind::Incremental,
        })
    }

    #[test]
    fn flushes_every_interval_with_full_snapshot() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let mut persister = IncrementalPersister::new(temp.path(), "diabetes", 2);
        let mut items = Vec::new();

        items.push(item("t1"));
        assert!(!persister.note_accepted(&items)?);
        assert!(!persister.incremental_paths().json.exists());

        items.push(item("t2"));
        assert!(persister.note_accepted(&items)?);
        assert_eq!(persister.flushes(), 1);
        assert_eq!(persister.pending(), 0);

        items.push(item("t3"));
        assert!(!persister.note_accepted(&items)?);

        let saved = load(persister.incremental_paths().json)?;
        let ids: Vec<_> = saved.iter().map(|i| i.stable_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert!(persister.incremental_paths().csv.exists());
        Ok(())
    }

    #[test]
    fn finalize_writes_incremental_and_timestamped() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let mut persister = IncrementalPersister::new(temp.path(), "diabetes", 25);
        let items = vec![item("t1"), item("t2"), item("t3")];

        let paths = persister.finalize(&items, Utc::now())?;

        assert!(paths.json.exists());
        assert!(paths.csv.exists());
        assert_eq!(load(paths.json)?.len(), 3);
        assert_eq!(load(persister.incremental_paths().json)?.len(), 3);
        Ok(())
    }

    #[test]
    fn failed_flush_keeps_pending_count() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        // A regular file where the data directory should be makes every write fail.
        let blocked = temp.path().join("blocked");
        std::fs::write(&blocked, "")?;
        let mut persister = IncrementalPersister::new(&blocked, "diabetes", 1);

        assert!(persister.note_accepted(&[item("t1")]).is_err());
        assert_eq!(persister.pending(), 1);
        assert_eq!(persister.flushes(), 0);
        Ok(())
    }
}
