use std::path::PathBuf;

use anyhow::Context as _;
use chrono::Utc;

use crate::artifact::{self, ArtifactKind, ArtifactPaths};
use crate::cli::CollectArgs;
use crate::config::{self, SourceDescriptor, SweepLimits};
use crate::fetcher::{FetchFailure, Fetcher};
use crate::formats::{Item, Reply};
use crate::ledger::DedupLedger;
use crate::normalize::{self, ReplyBounds, SourceContext};
use crate::persist::IncrementalPersister;
use crate::source::{self, ListingSource, RedditSource, SortVariant};

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub out_dir: PathBuf,
    pub limits: SweepLimits,
    pub save_interval: usize,
    /// Fetch replies right after acceptance; `None` defers them to a later pass.
    pub inline_replies: Option<ReplyBounds>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Init,
    Sweeping {
        sub_source: String,
        variant: SortVariant,
    },
    Done,
}

/// Per-topic counters. Relevance is checked before the ledger, so
/// `dropped_irrelevant` includes items that would also have been duplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub pages: usize,
    pub fetched: usize,
    pub dropped_malformed: usize,
    pub dropped_irrelevant: usize,
    pub duplicates: usize,
    pub accepted: usize,
    pub skipped_sub_sources: usize,
}

#[derive(Debug)]
pub struct TopicOutcome {
    pub topic: String,
    pub stats: SweepStats,
    /// Every item this run's collection holds, carried-forward items included.
    pub items: Vec<Item>,
    /// Distinct ids known for the topic: prior artifacts plus this run.
    pub known: usize,
    pub snapshot: Option<ArtifactPaths>,
    pub target_reached: bool,
}

enum SweepEnd {
    Exhausted,
    TargetReached,
    SubSourceUnavailable(FetchFailure),
}

/// Live state of one topic; owned exclusively by the driver while it runs.
struct TopicRun<'t> {
    topic: &'t SourceDescriptor,
    state: DriverState,
    ledger: DedupLedger,
    items: Vec<Item>,
    persister: IncrementalPersister,
    stats: SweepStats,
}

impl TopicRun<'_> {
    fn transition(&mut self, next: DriverState) {
        tracing::debug!(topic = %self.topic.topic, from = ?self.state, to = ?next, "driver state");
        self.state = next;
    }

    fn target_reached(&self) -> bool {
        self.stats.accepted >= self.topic.target_count
    }
}

pub struct CollectionDriver<'a, S: ListingSource + ?Sized> {
    source: &'a S,
    options: &'a CollectOptions,
}

impl<'a, S: ListingSource + ?Sized> CollectionDriver<'a, S> {
    pub fn new(source: &'a S, options: &'a CollectOptions) -> Self {
        Self { source, options }
    }

    /// Collects each topic in turn. A failing topic is reported and does not
    /// stop the ones after it.
    pub async fn collect_all(
        &self,
        topics: &[SourceDescriptor],
    ) -> Vec<(String, anyhow::Result<TopicOutcome>)> {
        let mut outcomes = Vec::with_capacity(topics.len());
        for topic in topics {
            let outcome = self.collect_topic(topic).await;
            if let Err(err) = &outcome {
                tracing::warn!(topic = %topic.topic, error = %format!("{err:#}"), "topic collection failed");
            }
            outcomes.push((topic.topic.clone(), outcome));
        }
        outcomes
    }

    pub async fn collect_topic(&self, topic: &SourceDescriptor) -> anyhow::Result<TopicOutcome> {
        let mut run = self.resume(topic)?;
        tracing::info!(
            topic = %topic.topic,
            target = topic.target_count,
            known = run.ledger.len(),
            carried = run.items.len(),
            "collecting topic"
        );

        let plan = source::sweep_plan(topic, &self.options.limits);
        let mut target_reached = run.target_reached();

        'sub_sources: for sub_source in &topic.sub_sources {
            if target_reached {
                break;
            }
            for (variant, limit) in &plan {
                run.transition(DriverState::Sweeping {
                    sub_source: sub_source.clone(),
                    variant: variant.clone(),
                });
                let end = self.sweep(&mut run, sub_source, variant, *limit).await;
                tracing::info!(
                    topic = %topic.topic,
                    sub_source = %sub_source,
                    variant = %variant,
                    accepted = run.stats.accepted,
                    total = run.items.len(),
                    "sweep finished"
                );
                match end {
                    SweepEnd::Exhausted => {}
                    SweepEnd::TargetReached => {
                        target_reached = true;
                        break 'sub_sources;
                    }
                    SweepEnd::SubSourceUnavailable(failure) => {
                        tracing::warn!(
                            topic = %topic.topic,
                            sub_source = %sub_source,
                            error = %failure,
                            "sub-source unavailable; skipping"
                        );
                        run.stats.skipped_sub_sources += 1;
                        continue 'sub_sources;
                    }
                }
            }
        }
        run.transition(DriverState::Done);

        let snapshot = if run.stats.accepted > 0 {
            Some(
                run.persister
                    .finalize(&run.items, Utc::now())
                    .with_context(|| format!("save final snapshot for {}", topic.topic))?,
            )
        } else {
            None
        };

        let stats = run.stats;
        tracing::info!(
            topic = %topic.topic,
            pages = stats.pages,
            fetched = stats.fetched,
            accepted = stats.accepted,
            duplicates = stats.duplicates,
            dropped_malformed = stats.dropped_malformed,
            dropped_irrelevant = stats.dropped_irrelevant,
            skipped_sub_sources = stats.skipped_sub_sources,
            known = run.ledger.len(),
            "topic done"
        );

        Ok(TopicOutcome {
            topic: topic.topic.clone(),
            stats,
            known: run.ledger.len(),
            items: run.items,
            snapshot,
            target_reached,
        })
    }

    /// Seeds the ledger from every prior artifact of the topic and carries the
    /// rolling incremental snapshot forward, so rewriting it never drops
    /// earlier work.
    fn resume<'t>(&self, topic: &'t SourceDescriptor) -> anyhow::Result<TopicRun<'t>> {
        let mut ledger = DedupLedger::new();
        let mut items = Vec::new();

        let prior = artifact::discover(&self.options.out_dir, &topic.topic)
            .with_context(|| format!("discover artifacts for {}", topic.topic))?;
        for found in &prior {
            let loaded = match artifact::load_items(found) {
                Ok(loaded) => loaded,
                Err(err) => {
                    tracing::warn!(
                        path = %found.path.display(),
                        error = %format!("{err:#}"),
                        "unreadable artifact; not used for resume"
                    );
                    continue;
                }
            };
            if found.kind == ArtifactKind::Incremental {
                let mut carried = DedupLedger::new();
                items.extend(
                    loaded
                        .iter()
                        .filter(|item| carried.record(&item.stable_id))
                        .cloned(),
                );
            }
            let added = ledger.seed_from(&loaded);
            tracing::debug!(path = %found.path.display(), added, "seeded ledger");
        }

        Ok(TopicRun {
            topic,
            state: DriverState::Init,
            ledger,
            items,
            persister: IncrementalPersister::new(
                &self.options.out_dir,
                &topic.topic,
                self.options.save_interval,
            ),
            stats: SweepStats::default(),
        })
    }

    async fn sweep(
        &self,
        run: &mut TopicRun<'_>,
        sub_source: &str,
        variant: &SortVariant,
        limit: usize,
    ) -> SweepEnd {
        let mut after: Option<String> = None;
        let mut read = 0_usize;

        loop {
            if read >= limit {
                return SweepEnd::Exhausted;
            }
            let page_size = (limit - read).min(self.options.limits.page_size);
            let page = match self
                .source
                .fetch_page(sub_source, variant, after.as_deref(), page_size)
                .await
            {
                Ok(page) => page,
                Err(failure) if failure.is_access_error() => {
                    return SweepEnd::SubSourceUnavailable(failure);
                }
                Err(failure) => {
                    tracing::warn!(
                        sub_source = %sub_source,
                        variant = %variant,
                        error = %failure,
                        "page fetch failed; ending sweep"
                    );
                    return SweepEnd::Exhausted;
                }
            };
            run.stats.pages += 1;
            if page.records.is_empty() {
                return SweepEnd::Exhausted;
            }

            let ctx = SourceContext {
                sub_source,
                site_root: self.source.site_root(),
                now: Utc::now(),
            };
            for raw in &page.records {
                if read >= limit {
                    break;
                }
                read += 1;
                run.stats.fetched += 1;

                let Some(item) = normalize::normalize(raw, &ctx) else {
                    run.stats.dropped_malformed += 1;
                    continue;
                };
                if !run.topic.is_relevant(&item.title, &item.body) {
                    run.stats.dropped_irrelevant += 1;
                    continue;
                }
                if run.ledger.seen(&item.stable_id) {
                    run.stats.duplicates += 1;
                    continue;
                }

                let canonical_url = item.canonical_url.clone();
                run.ledger.accept(item, &mut run.items);
                run.stats.accepted += 1;

                if let Some(bounds) = self.options.inline_replies {
                    let replies = self.fetch_replies(&canonical_url, bounds).await;
                    if let Some(accepted) = run.items.last_mut() {
                        accepted.replies = replies;
                    }
                }

                tracing::debug!(
                    topic = %run.topic.topic,
                    accepted = run.stats.accepted,
                    total = run.items.len(),
                    "accepted item"
                );
                if let Err(err) = run.persister.note_accepted(&run.items) {
                    tracing::warn!(error = %format!("{err:#}"), "incremental save failed; will retry");
                }
                if run.target_reached() {
                    return SweepEnd::TargetReached;
                }
            }

            match page.after {
                Some(cursor) => after = Some(cursor),
                None => return SweepEnd::Exhausted,
            }
        }
    }

    async fn fetch_replies(&self, canonical_url: &str, bounds: ReplyBounds) -> Vec<Reply> {
        if canonical_url.is_empty() {
            return Vec::new();
        }
        match self
            .source
            .fetch_replies(canonical_url, bounds.max_breadth, bounds.max_depth)
            .await
        {
            Ok(nodes) => normalize::normalize_replies(&nodes, bounds, Utc::now()),
            Err(failure) => {
                tracing::warn!(url = %canonical_url, error = %failure, "reply fetch failed");
                Vec::new()
            }
        }
    }
}

pub async fn run(args: CollectArgs) -> anyhow::Result<()> {
    let topics = config::select_topics(config::load_topics(args.sources.as_deref())?, &args.topics)?;
    let topics: Vec<SourceDescriptor> = match args.target {
        Some(target) => topics
            .into_iter()
            .map(|topic| SourceDescriptor {
                target_count: target,
                ..topic
            })
            .collect(),
        None => topics,
    };

    let out_dir = PathBuf::from(&args.out);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("create data dir: {}", out_dir.display()))?;

    let remote = args.remote.remote_config();
    let fetcher = Fetcher::new(args.remote.fetch_policy(), remote.user_agent.clone())?;
    let source = RedditSource::new(fetcher, &remote.base_url)?;

    let options = CollectOptions {
        out_dir,
        limits: args.sweep_limits(),
        save_interval: args.save_interval,
        inline_replies: args.inline_reply_bounds(),
    };
    let driver = CollectionDriver::new(&source, &options);
    let outcomes = driver.collect_all(&topics).await;

    let mut total = 0_usize;
    for (topic, outcome) in &outcomes {
        match outcome {
            Ok(outcome) => {
                total += outcome.known;
                tracing::info!(
                    topic = %topic,
                    accepted = outcome.stats.accepted,
                    known = outcome.known,
                    json = ?outcome.snapshot.as_ref().map(|p| p.json.display().to_string()),
                    "collection summary"
                );
            }
            Err(err) => {
                tracing::warn!(topic = %topic, error = %format!("{err:#}"), "collection summary: failed");
            }
        }
    }
    tracing::info!(
        total,
        requests = source.fetcher().requests_issued(),
        "collection complete"
    );

    if total < args.min_total {
        anyhow::bail!(
            "collected {total} items across all topics, below the minimum of {}",
            args.min_total
        );
    }
    Ok(())
}
