use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};

use crate::formats::{Item, SummaryRow};

const INCREMENTAL_MARKER: &str = "incremental";
const COMBINED_MARKER: &str = "combined";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArtifactKind {
    Timestamped,
    Incremental,
    Combined,
}

/// Full structured JSON, or the flattened CSV summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactForm {
    Full,
    Tabular,
}

/// The two files written for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub json: PathBuf,
    pub csv: PathBuf,
}

impl ArtifactPaths {
    fn from_stem(dir: &Path, stem: &str) -> Self {
        Self {
            json: dir.join(format!("{stem}.json")),
            csv: dir.join(format!("{stem}.csv")),
        }
    }

    /// Paths for the snapshot that `path` (either form) belongs to.
    pub fn siblings_of(path: &Path) -> Self {
        Self {
            json: path.with_extension("json"),
            csv: path.with_extension("csv"),
        }
    }
}

/// A discovered artifact on disk. When both forms of a snapshot exist only
/// the full form is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub form: ArtifactForm,
    pub kind: ArtifactKind,
}

fn topic_prefix(topic: &str) -> String {
    format!("{topic}_threads_")
}

pub fn timestamped_paths(dir: &Path, topic: &str, at: DateTime<Utc>) -> ArtifactPaths {
    let stamp = at.format("%Y%m%d_%H%M%S");
    ArtifactPaths::from_stem(dir, &format!("{}{stamp}", topic_prefix(topic)))
}

pub fn incremental_paths(dir: &Path, topic: &str) -> ArtifactPaths {
    ArtifactPaths::from_stem(dir, &format!("{}{INCREMENTAL_MARKER}", topic_prefix(topic)))
}

pub fn combined_paths(dir: &Path, topic: &str) -> ArtifactPaths {
    ArtifactPaths::from_stem(dir, &format!("{}{COMBINED_MARKER}", topic_prefix(topic)))
}

fn classify(suffix: &str) -> ArtifactKind {
    if suffix.contains(COMBINED_MARKER) {
        ArtifactKind::Combined
    } else if suffix.contains(INCREMENTAL_MARKER) {
        ArtifactKind::Incremental
    } else {
        ArtifactKind::Timestamped
    }
}

/// Lists every artifact of `topic` in `dir`, sorted by file name. A missing
/// directory has no artifacts.
pub fn discover(dir: &Path, topic: &str) -> anyhow::Result<Vec<ArtifactRef>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let prefix = topic_prefix(topic);
    let mut by_stem: BTreeMap<String, ArtifactRef> = BTreeMap::new();

    for entry in
        std::fs::read_dir(dir).with_context(|| format!("read data dir: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(suffix) = stem.strip_prefix(&prefix) else {
            continue;
        };
        let form = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => ArtifactForm::Full,
            Some("csv") => ArtifactForm::Tabular,
            _ => continue,
        };
        let candidate = ArtifactRef {
            kind: classify(suffix),
            path: path.clone(),
            form,
        };
        match by_stem.get(stem) {
            Some(existing) if existing.form == ArtifactForm::Full => {}
            _ => {
                by_stem.insert(stem.to_owned(), candidate);
            }
        }
    }

    Ok(by_stem.into_values().collect())
}

pub fn load_items(artifact: &ArtifactRef) -> anyhow::Result<Vec<Item>> {
    match artifact.form {
        ArtifactForm::Full => load_json(&artifact.path),
        ArtifactForm::Tabular => load_csv(&artifact.path),
    }
}

fn load_json(path: &Path) -> anyhow::Result<Vec<Item>> {
    let file = File::open(path).with_context(|| format!("open artifact: {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parse artifact json: {}", path.display()))
}

fn load_csv(path: &Path) -> anyhow::Result<Vec<Item>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("open artifact csv: {}", path.display()))?;
    let mut items = Vec::new();
    for row in reader.deserialize::<SummaryRow>() {
        let row = row.with_context(|| format!("parse artifact csv row: {}", path.display()))?;
        items.push(row.into_item());
    }
    Ok(items)
}

/// Writes both forms of a snapshot from the same items. Each file is written
/// to a temporary sibling first and renamed into place, so an interrupted
/// write leaves the previous snapshot intact.
pub fn write_snapshot(paths: &ArtifactPaths, items: &[Item]) -> anyhow::Result<()> {
    let parent = paths
        .json
        .parent()
        .ok_or_else(|| anyhow::anyhow!("artifact path has no parent: {}", paths.json.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create data dir: {}", parent.display()))?;

    let mut json_tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    {
        let mut writer = BufWriter::new(json_tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, items).context("serialize artifact json")?;
        writer.write_all(b"\n").context("write artifact json newline")?;
        writer.flush().context("flush artifact json")?;
    }

    let mut csv_tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    {
        let mut writer = csv::Writer::from_writer(csv_tmp.as_file_mut());
        for item in items {
            writer
                .serialize(SummaryRow::from(item))
                .context("serialize artifact csv row")?;
        }
        writer.flush().context("flush artifact csv")?;
    }

    json_tmp
        .persist(&paths.json)
        .map_err(|err| err.error)
        .with_context(|| format!("write artifact: {}", paths.json.display()))?;
    csv_tmp
        .persist(&paths.csv)
        .map_err(|err| err.error)
        .with_context(|| format!("write artifact: {}", paths.csv.display()))?;

    Ok(())
}
