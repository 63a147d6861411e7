use std::collections::{HashMap, HashSet};

use anyhow::Context as _;
use chrono::Utc;

use crate::artifact::{self, ArtifactKind, ArtifactPaths, ArtifactRef};
use crate::cli::FetchRepliesArgs;
use crate::config;
use crate::fetcher::Fetcher;
use crate::formats::{Item, Reply};
use crate::normalize::{self, ReplyBounds};
use crate::source::{ListingSource, RedditSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyPassStats {
    pub artifacts: usize,
    pub unreadable: usize,
    pub threads: usize,
    pub fetched: usize,
    pub copied: usize,
    pub already_had_replies: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Replies known for one topic during a pass, by stable id. A thread is
/// requested at most once however many artifacts hold it.
#[derive(Debug, Default)]
pub struct ReplyCache {
    replies: HashMap<String, Vec<Reply>>,
    requested: HashSet<String>,
}

impl ReplyCache {
    /// Remembers replies that some artifact already carries.
    pub fn seed_from(&mut self, items: &[Item]) {
        for item in items.iter().filter(|i| i.has_replies()) {
            self.replies
                .entry(item.stable_id.clone())
                .or_insert_with(|| item.replies.clone());
        }
    }
}

struct LoadedArtifact {
    paths: ArtifactPaths,
    items: Vec<Item>,
}

/// Fills in replies across every artifact in `targets`. Each reply-less
/// thread is fetched once; the result is copied into every artifact that
/// holds it. Artifacts are written back every `save_interval` changed items
/// and once at the end.
pub async fn fill_topic<S: ListingSource + ?Sized>(
    source: &S,
    targets: &[ArtifactRef],
    bounds: ReplyBounds,
    save_interval: usize,
) -> anyhow::Result<ReplyPassStats> {
    let mut stats = ReplyPassStats::default();
    let mut loaded = Vec::with_capacity(targets.len());
    for found in targets {
        match artifact::load_items(found) {
            Ok(items) => loaded.push(LoadedArtifact {
                paths: ArtifactPaths::siblings_of(&found.path),
                items,
            }),
            Err(err) => {
                stats.unreadable += 1;
                tracing::warn!(
                    path = %found.path.display(),
                    error = %format!("{err:#}"),
                    "skipping unreadable artifact"
                );
            }
        }
    }

    let mut cache = ReplyCache::default();
    for artifact in &loaded {
        cache.seed_from(&artifact.items);
    }

    for artifact in &mut loaded {
        stats.artifacts += 1;
        stats.threads += artifact.items.len();
        let interval = save_interval.max(1);
        fill_artifact(source, &mut cache, artifact, bounds, interval, &mut stats).await?;
    }
    Ok(stats)
}

async fn fill_artifact<S: ListingSource + ?Sized>(
    source: &S,
    cache: &mut ReplyCache,
    artifact: &mut LoadedArtifact,
    bounds: ReplyBounds,
    save_interval: usize,
    stats: &mut ReplyPassStats,
) -> anyhow::Result<()> {
    let items = &mut artifact.items;
    let mut unsaved = 0_usize;

    for index in 0..items.len() {
        let item = &items[index];
        if item.has_replies() {
            stats.already_had_replies += 1;
            continue;
        }

        if let Some(replies) = cache.replies.get(&item.stable_id) {
            items[index].replies = replies.clone();
            stats.copied += 1;
        } else {
            // Threads the remote reports as reply-less are not worth a request.
            if item.canonical_url.is_empty() || item.reply_count == 0 {
                stats.skipped += 1;
                continue;
            }
            // Already tried earlier in this pass and came back empty or failed.
            if !cache.requested.insert(item.stable_id.clone()) {
                stats.skipped += 1;
                continue;
            }

            let canonical_url = item.canonical_url.clone();
            match source
                .fetch_replies(&canonical_url, bounds.max_breadth, bounds.max_depth)
                .await
            {
                Ok(nodes) => {
                    let replies = normalize::normalize_replies(&nodes, bounds, Utc::now());
                    stats.fetched += 1;
                    tracing::debug!(
                        id = %items[index].stable_id,
                        replies = replies.len(),
                        "fetched replies"
                    );
                    if replies.is_empty() {
                        continue;
                    }
                    cache
                        .replies
                        .insert(items[index].stable_id.clone(), replies.clone());
                    items[index].replies = replies;
                }
                Err(failure) => {
                    stats.failed += 1;
                    tracing::warn!(url = %canonical_url, error = %failure, "reply fetch failed");
                    continue;
                }
            }
        }

        unsaved += 1;
        if unsaved >= save_interval {
            save(&artifact.paths, items)?;
            unsaved = 0;
            tracing::info!(
                path = %artifact.paths.json.display(),
                fetched = stats.fetched,
                remaining = items.len() - index - 1,
                "saved reply progress"
            );
        }
    }

    if unsaved > 0 {
        save(&artifact.paths, items)?;
    }
    Ok(())
}

fn save(paths: &ArtifactPaths, items: &[Item]) -> anyhow::Result<()> {
    artifact::write_snapshot(paths, items)
        .with_context(|| format!("save replies into {}", paths.json.display()))
}

/// Artifacts the reply pass works on: the full form of every timestamped or
/// incremental snapshot. Merge output is rebuilt from these, so it is skipped.
pub fn reply_targets(found: Vec<ArtifactRef>) -> Vec<ArtifactRef> {
    found
        .into_iter()
        .filter(|a| a.kind != ArtifactKind::Combined)
        .filter(|a| a.form == artifact::ArtifactForm::Full)
        .collect()
}

pub async fn run(args: FetchRepliesArgs) -> anyhow::Result<()> {
    let topics = config::select_topics(config::load_topics(args.sources.as_deref())?, &args.topics)?;
    let data_dir = std::path::PathBuf::from(&args.data);

    let remote = args.remote.remote_config();
    let fetcher = Fetcher::new(args.remote.fetch_policy(), remote.user_agent.clone())?;
    let source = RedditSource::new(fetcher, &remote.base_url)?;
    let bounds = args.reply_bounds();

    let mut total = ReplyPassStats::default();
    for topic in &topics {
        let targets = reply_targets(
            artifact::discover(&data_dir, &topic.topic)
                .with_context(|| format!("discover artifacts for {}", topic.topic))?,
        );
        if targets.is_empty() {
            tracing::warn!(topic = %topic.topic, dir = %data_dir.display(), "no artifacts to fill");
            continue;
        }

        let stats = fill_topic(&source, &targets, bounds, args.save_interval)
            .await
            .with_context(|| format!("fetch replies for {}", topic.topic))?;
        tracing::info!(
            topic = %topic.topic,
            artifacts = stats.artifacts,
            unreadable = stats.unreadable,
            threads = stats.threads,
            fetched = stats.fetched,
            copied = stats.copied,
            already_had_replies = stats.already_had_replies,
            skipped = stats.skipped,
            failed = stats.failed,
            "reply pass finished"
        );
        total.threads += stats.threads;
        total.fetched += stats.fetched;
        total.copied += stats.copied;
        total.failed += stats.failed;
    }

    tracing::info!(
        threads = total.threads,
        fetched = total.fetched,
        copied = total.copied,
        failed = total.failed,
        requests = source.fetcher().requests_issued(),
        "reply fetch complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone as _;

    use super::*;
    use crate::artifact::ArtifactForm;
    use crate::fetcher::FetchFailure;
    use crate::persist::IncrementalPersister;
    use crate::source::{Page, SortVariant};

    struct ReplyStub {
        calls: Mutex<Vec<String>>,
        fail_for: Option<String>,
    }

    impl ReplyStub {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_for: None,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock calls").clone()
        }
    }

    #[async_trait]
    impl ListingSource for ReplyStub {
        fn site_root(&self) -> &str {
            "https://forum.test"
        }

        async fn fetch_page(
            &self,
            _sub_source: &str,
            _variant: &SortVariant,
            _after: Option<&str>,
            _page_size: usize,
        ) -> Result<Page, FetchFailure> {
            Ok(Page::default())
        }

        async fn fetch_replies(
            &self,
            canonical_url: &str,
            limit: usize,
            _depth: usize,
        ) -> Result<Vec<serde_json::Value>, FetchFailure> {
            self.calls
                .lock()
                .expect("lock calls")
                .push(canonical_url.to_owned());
            if self.fail_for.as_deref() == Some(canonical_url) {
                return Err(FetchFailure::Status(500));
            }
            Ok((0..limit + 5)
                .map(|n| {
                    serde_json::json!({
                        "kind": "t1",
                        "data": {"author": "r", "body": format!("reply {n}"), "score": 1},
                    })
                })
                .collect())
        }
    }

    fn item(id: &str, reply_count: u64) -> Item {
        Item {
            stable_id: id.to_owned(),
            title: format!("title {id}"),
            author: "a".to_owned(),
            source_label: "diabetes".to_owned(),
            created_utc: String::new(),
            engagement_score: 0,
            reply_count,
            canonical_url: format!("https://forum.test/r/diabetes/comments/{id}/x/"),
            body: String::new(),
            upvote_ratio: 0.0,
            replies: Vec::new(),
            collected_at: String::new(),
        }
    }

    fn full(path: std::path::PathBuf) -> ArtifactRef {
        ArtifactRef {
            path,
            form: ArtifactForm::Full,
            kind: ArtifactKind::Incremental,
        }
    }

    #[tokio::test]
    async fn fills_only_items_without_replies() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let paths = artifact::incremental_paths(temp.path(), "diabetes");
        let mut done = item("t1", 4);
        done.replies = vec![Reply {
            author: "r".to_owned(),
            body: "kept".to_owned(),
            score: 0,
            created_utc: String::new(),
            replies: Vec::new(),
        }];
        let mut no_url = item("t3", 2);
        no_url.canonical_url.clear();
        artifact::write_snapshot(&paths, &[done, item("t2", 7), no_url, item("t4", 0)])?;

        let stub = ReplyStub::new();
        let stats = fill_topic(&stub, &[full(paths.json.clone())], ReplyBounds::default(), 25).await?;

        assert_eq!(stub.calls(), vec!["https://forum.test/r/diabetes/comments/t2/x/"]);
        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.already_had_replies, 1);
        assert_eq!(stats.skipped, 2);

        let saved = artifact::load_items(&full(paths.json))?;
        assert_eq!(saved[0].replies[0].body, "kept");
        assert_eq!(saved[1].replies.len(), ReplyBounds::default().max_breadth);
        Ok(())
    }

    #[tokio::test]
    async fn failed_fetch_leaves_item_for_next_pass() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let paths = artifact::incremental_paths(temp.path(), "diabetes");
        artifact::write_snapshot(&paths, &[item("t1", 1), item("t2", 1)])?;

        let mut stub = ReplyStub::new();
        stub.fail_for = Some("https://forum.test/r/diabetes/comments/t1/x/".to_owned());
        let stats = fill_topic(&stub, &[full(paths.json.clone())], ReplyBounds::default(), 1).await?;
        assert_eq!((stats.fetched, stats.failed), (1, 1));

        let saved = artifact::load_items(&full(paths.json.clone()))?;
        assert!(!saved[0].has_replies());
        assert!(saved[1].has_replies());

        // A second pass only retries the failed item.
        let again = ReplyStub::new();
        fill_topic(&again, &[full(paths.json)], ReplyBounds::default(), 1).await?;
        assert_eq!(again.calls(), vec!["https://forum.test/r/diabetes/comments/t1/x/"]);
        Ok(())
    }

    #[tokio::test]
    async fn each_thread_is_requested_once_across_snapshots() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut persister = IncrementalPersister::new(temp.path(), "diabetes", 25);
        persister.finalize(&[item("t1", 2), item("t2", 3)], at)?;
        // A later run carries both forward and adds one more.
        let later = at + chrono::Duration::hours(1);
        persister.finalize(&[item("t1", 2), item("t2", 3), item("t3", 1)], later)?;

        let targets = reply_targets(artifact::discover(temp.path(), "diabetes")?);
        assert_eq!(targets.len(), 3);

        let stub = ReplyStub::new();
        let stats = fill_topic(&stub, &targets, ReplyBounds::default(), 25).await?;

        let mut calls = stub.calls();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                "https://forum.test/r/diabetes/comments/t1/x/",
                "https://forum.test/r/diabetes/comments/t2/x/",
                "https://forum.test/r/diabetes/comments/t3/x/",
            ]
        );
        assert_eq!(stats.fetched, 3);
        assert_eq!(stats.copied, 5);
        for found in &targets {
            assert!(artifact::load_items(found)?.iter().all(Item::has_replies));
        }
        Ok(())
    }

    #[tokio::test]
    async fn replies_already_saved_elsewhere_are_copied_without_a_request() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut answered = item("t1", 2);
        answered.replies = vec![Reply {
            author: "r".to_owned(),
            body: "saved earlier".to_owned(),
            score: 0,
            created_utc: String::new(),
            replies: Vec::new(),
        }];
        let timestamped = artifact::timestamped_paths(temp.path(), "diabetes", at);
        artifact::write_snapshot(&timestamped, &[item("t1", 2)])?;
        artifact::write_snapshot(&artifact::incremental_paths(temp.path(), "diabetes"), &[answered])?;

        let targets = reply_targets(artifact::discover(temp.path(), "diabetes")?);
        let stub = ReplyStub::new();
        let stats = fill_topic(&stub, &targets, ReplyBounds::default(), 25).await?;

        assert!(stub.calls().is_empty());
        assert_eq!((stats.copied, stats.already_had_replies), (1, 1));
        let timestamped = artifact::load_items(&targets[0])?;
        assert_eq!(timestamped[0].replies[0].body, "saved earlier");
        Ok(())
    }

    #[tokio::test]
    async fn failed_thread_is_not_retried_in_another_artifact() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        IncrementalPersister::new(temp.path(), "diabetes", 25).finalize(&[item("t1", 1)], at)?;

        let mut stub = ReplyStub::new();
        stub.fail_for = Some("https://forum.test/r/diabetes/comments/t1/x/".to_owned());
        let targets = reply_targets(artifact::discover(temp.path(), "diabetes")?);
        let stats = fill_topic(&stub, &targets, ReplyBounds::default(), 25).await?;

        assert_eq!(stub.calls().len(), 1);
        assert_eq!((stats.failed, stats.skipped), (1, 1));
        Ok(())
    }

    #[test]
    fn reply_targets_skip_merge_output_and_tabular_copies() {
        let found = vec![
            ArtifactRef {
                path: "a.json".into(),
                form: ArtifactForm::Full,
                kind: ArtifactKind::Timestamped,
            },
            ArtifactRef {
                path: "b.csv".into(),
                form: ArtifactForm::Tabular,
                kind: ArtifactKind::Timestamped,
            },
            ArtifactRef {
                path: "c.json".into(),
                form: ArtifactForm::Full,
                kind: ArtifactKind::Combined,
            },
            ArtifactRef {
                path: "d.json".into(),
                form: ArtifactForm::Full,
                kind: ArtifactKind::Incremental,
            },
        ];
        let kept: Vec<_> = reply_targets(found).into_iter().map(|a| a.path).collect();
        assert_eq!(kept, vec![std::path::PathBuf::from("a.json"), "d.json".into()]);
    }
}
