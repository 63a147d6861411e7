use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::artifact::{self, ArtifactKind, ArtifactPaths};
use crate::cli::CombineArgs;
use crate::config;
use crate::formats::Item;
use crate::ledger::DedupLedger;

#[derive(Debug)]
pub struct CombineOutcome {
    pub items: Vec<Item>,
    pub inputs: usize,
    pub unreadable: usize,
    pub duplicates: usize,
    /// `None` when the topic had no artifacts to combine.
    pub paths: Option<ArtifactPaths>,
}

/// Re-applies the ledger across item sets in the order given. The first copy
/// of an id is kept; when it has no replies and a later copy does, the later
/// replies are moved onto it. Returns the merged items and the number of
/// duplicates skipped.
pub fn combine_items(sets: impl IntoIterator<Item = Vec<Item>>) -> (Vec<Item>, usize) {
    let mut ledger = DedupLedger::new();
    let mut merged: Vec<Item> = Vec::new();
    let mut positions = std::collections::HashMap::new();
    let mut duplicates = 0_usize;

    for set in sets {
        for item in set {
            if item.stable_id.is_empty() {
                continue;
            }
            if !ledger.seen(&item.stable_id) {
                positions.insert(item.stable_id.clone(), merged.len());
                ledger.accept(item, &mut merged);
                continue;
            }

            duplicates += 1;
            tracing::info!(id = %item.stable_id, "skipped duplicate");
            let Some(&position) = positions.get(&item.stable_id) else {
                continue;
            };
            let kept = &mut merged[position];
            if !kept.has_replies() && item.has_replies() {
                kept.replies = item.replies;
            }
        }
    }

    (merged, duplicates)
}

/// Merges every non-combined artifact of `topic` in `dir` into the topic's
/// combined artifact. Unreadable inputs are reported and left out.
pub fn combine_topic(dir: &Path, topic: &str) -> anyhow::Result<CombineOutcome> {
    let inputs: Vec<_> = artifact::discover(dir, topic)
        .with_context(|| format!("discover artifacts for {topic}"))?
        .into_iter()
        .filter(|a| a.kind != ArtifactKind::Combined)
        .collect();

    let mut sets = Vec::with_capacity(inputs.len());
    let mut unreadable = 0_usize;
    for input in &inputs {
        match artifact::load_items(input) {
            Ok(items) => {
                tracing::info!(path = %input.path.display(), items = items.len(), "combine input");
                sets.push(items);
            }
            Err(err) => {
                unreadable += 1;
                tracing::warn!(
                    path = %input.path.display(),
                    error = %format!("{err:#}"),
                    "skipping unreadable artifact"
                );
            }
        }
    }

    if sets.is_empty() {
        return Ok(CombineOutcome {
            items: Vec::new(),
            inputs: inputs.len(),
            unreadable,
            duplicates: 0,
            paths: None,
        });
    }

    let (items, duplicates) = combine_items(sets);
    let paths = artifact::combined_paths(dir, topic);
    artifact::write_snapshot(&paths, &items)
        .with_context(|| format!("write combined artifact for {topic}"))?;

    Ok(CombineOutcome {
        items,
        inputs: inputs.len(),
        unreadable,
        duplicates,
        paths: Some(paths),
    })
}

pub fn run(args: CombineArgs) -> anyhow::Result<()> {
    let topics = config::select_topics(config::load_topics(args.sources.as_deref())?, &args.topics)?;
    let dir = PathBuf::from(&args.data);

    for topic in &topics {
        let outcome = combine_topic(&dir, &topic.topic)?;
        match &outcome.paths {
            Some(paths) => tracing::info!(
                topic = %topic.topic,
                inputs = outcome.inputs,
                unreadable = outcome.unreadable,
                duplicates = outcome.duplicates,
                items = outcome.items.len(),
                json = %paths.json.display(),
                "combined"
            ),
            None => tracing::warn!(topic = %topic.topic, dir = %dir.display(), "nothing to combine"),
        }
    }
    Ok(())
}
