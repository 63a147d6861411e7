use std::path::{Component, Path, PathBuf};

use anyhow::Context as _;

use crate::artifact::{self, ArtifactForm, ArtifactKind, ArtifactRef};
use crate::cli::PrepareArgs;
use crate::formats::{ArticleMetadata, DocumentKind, Item, ManifestEntry, Reply};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ARTICLES_METADATA_FILE: &str = "articles_metadata.json";
const COMBINED_SUFFIX: &str = "_threads_combined.json";
const HEADER_RULE_WIDTH: usize = 79;

/// Lines containing any of these (case-insensitive) are site chrome, not
/// article text.
const NOISE_PATTERNS: &[&str] = &[
    "there is a problem with",
    "from mayo clinic to your inbox",
    "sign up for free and stay up to date",
    "thank you for subscribing",
    "sorry something went wrong",
    "errorinclude a valid email address",
    "erroremail field is required",
];

pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for ch in text.trim().to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "unknown".to_owned()
    } else {
        slug
    }
}

pub fn remove_noise<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    lines
        .into_iter()
        .filter(|line| {
            let lower = line.trim().to_lowercase();
            !NOISE_PATTERNS.iter().any(|pattern| lower.contains(pattern))
        })
        .collect()
}

/// Trims trailing whitespace and folds runs of blank lines into one.
pub fn collapse_blank_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut previous_blank = false;
    for line in lines {
        let line = line.trim_end();
        if line.is_empty() {
            if !previous_blank {
                out.push("");
            }
            previous_blank = true;
        } else {
            out.push(line);
            previous_blank = false;
        }
    }
    out
}

pub fn sanitize_article(raw: &str) -> String {
    collapse_blank_lines(remove_noise(raw.lines()))
        .join("\n")
        .trim()
        .to_owned()
}

/// Collapses all whitespace (newlines included) to single spaces.
pub fn sanitize_block(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn header_rule() -> String {
    "=".repeat(HEADER_RULE_WIDTH)
}

pub fn article_header(meta: &ArticleMetadata) -> String {
    let mut lines = vec![
        format!("Title: {}", meta.title),
        format!("Source: {}", meta.source),
        format!("URL: {}", meta.url),
        format!("Canonical URL: {}", meta.url),
        format!("Filename: {}", meta.filename),
    ];
    if let Some(collected_at) = meta.collected_at.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("Collected: {collected_at}"));
    }
    if let Some(topic) = meta.topic.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("Topic: {topic}"));
    }
    lines.push(header_rule());
    lines.join("\n")
}

/// Renders one thread as a flat text document. Top-level replies are
/// numbered `1.`, `2.`; nested replies extend the number (`1.1.`) and are
/// indented two spaces per level.
pub fn format_forum_thread(item: &Item) -> String {
    let header = [
        format!("Thread ID: {}", item.stable_id),
        format!("Subreddit: {}", item.source_label),
        format!("Title: {}", item.title),
        format!("Author: {}", item.author),
        format!("Created UTC: {}", item.created_utc),
        format!("Score: {}", item.engagement_score),
        format!("Num Comments: {}", item.reply_count),
        format!("URL: {}", item.canonical_url),
        format!("Canonical URL: {}", item.canonical_url),
        format!("Collected: {}", item.collected_at),
        header_rule(),
    ]
    .join("\n");

    let body = match sanitize_block(&item.body) {
        body if body.is_empty() => "(No selftext provided.)".to_owned(),
        body => body,
    };

    let mut comments = String::from("## Comments\n");
    if item.replies.is_empty() {
        comments.push_str("No comments captured.\n");
    }
    let mut stack: Vec<(String, usize, &Reply)> = item
        .replies
        .iter()
        .enumerate()
        .rev()
        .map(|(i, reply)| (format!("{}.", i + 1), 0, reply))
        .collect();
    while let Some((number, level, reply)) = stack.pop() {
        let text = match sanitize_block(&reply.body) {
            text if text.is_empty() => "(empty comment)".to_owned(),
            text => text,
        };
        comments.push_str(&format!(
            "{indent}{number} u/{author} [score={score}, created={created}]: {text}\n",
            indent = "  ".repeat(level),
            author = reply.author,
            score = reply.score,
            created = reply.created_utc,
        ));
        for (i, child) in reply.replies.iter().enumerate().rev() {
            stack.push((format!("{number}{}.", i + 1), level + 1, child));
        }
    }

    format!("{header}\n\n{body}\n\n---\n{comments}")
}

#[derive(Debug, Default)]
pub struct Prepared {
    pub manifest: Vec<ManifestEntry>,
    pub articles_written: usize,
    pub articles_skipped: usize,
    pub threads_written: usize,
}

fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

/// Rejects names that could escape the directory they are joined onto.
fn plain_relative(name: &str) -> Option<&Path> {
    let path = Path::new(name);
    let plain = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    plain.then_some(path)
}

fn key_for(out_dir: &Path, path: &Path) -> anyhow::Result<String> {
    let rel = path
        .strip_prefix(out_dir)
        .with_context(|| format!("{} is outside {}", path.display(), out_dir.display()))?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn write_document(path: &Path, text: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }
    std::fs::write(path, text).with_context(|| format!("write document: {}", path.display()))
}

pub fn prepare_articles(
    articles_dir: &Path,
    out_dir: &Path,
    prepared: &mut Prepared,
) -> anyhow::Result<()> {
    let metadata_path = articles_dir.join(ARTICLES_METADATA_FILE);
    let raw = std::fs::read_to_string(&metadata_path)
        .with_context(|| format!("read article metadata: {}", metadata_path.display()))?;
    let entries: Vec<ArticleMetadata> = serde_json::from_str(&raw)
        .with_context(|| format!("parse article metadata: {}", metadata_path.display()))?;

    for meta in entries {
        let Some(filename) = plain_relative(&meta.filename) else {
            tracing::warn!(filename = %meta.filename, "skipping article with unsafe filename");
            prepared.articles_skipped += 1;
            continue;
        };
        let src = articles_dir.join(filename);
        let text = match std::fs::read_to_string(&src) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(path = %src.display(), error = %err, "missing article file");
                prepared.articles_skipped += 1;
                continue;
            }
        };
        let cleaned = sanitize_article(&text);
        if cleaned.is_empty() {
            tracing::warn!(path = %src.display(), "skipping empty article");
            prepared.articles_skipped += 1;
            continue;
        }

        let dst = out_dir
            .join("authoritative")
            .join(slugify(&meta.source))
            .join(filename);
        write_document(&dst, &format!("{}\n\n{cleaned}\n", article_header(&meta)))?;

        prepared.manifest.push(ManifestEntry {
            canonical_url: meta.url.clone(),
            collected_at: meta.collected_at.clone(),
            key: key_for(out_dir, &dst)?,
            source: meta.source.clone(),
            thread_id: None,
            title: meta.title.clone(),
            topic: meta.topic.clone(),
            kind: DocumentKind::Authoritative,
        });
        prepared.articles_written += 1;
    }
    Ok(())
}

pub fn prepare_threads(items: &[Item], out_dir: &Path, prepared: &mut Prepared) -> anyhow::Result<()> {
    for item in items {
        if plain_relative(&item.stable_id).is_none() {
            tracing::warn!(id = %item.stable_id, "skipping thread with unusable id");
            continue;
        }
        let dst = out_dir
            .join("forums")
            .join(slugify(&item.source_label))
            .join(format!("{}.txt", item.stable_id));
        write_document(&dst, &format_forum_thread(item))?;

        prepared.manifest.push(ManifestEntry {
            canonical_url: item.canonical_url.clone(),
            collected_at: optional(&item.collected_at),
            key: key_for(out_dir, &dst)?,
            source: item.source_label.clone(),
            thread_id: Some(item.stable_id.clone()),
            title: item.title.clone(),
            topic: None,
            kind: DocumentKind::Forum,
        });
        prepared.threads_written += 1;
    }
    Ok(())
}

/// Every `{topic}_threads_combined.json` in `data_dir`, sorted by name.
pub fn combined_artifacts(data_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(data_dir)
        .with_context(|| format!("read data dir: {}", data_dir.display()))?
    {
        let path = entry?.path();
        let is_combined = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(COMBINED_SUFFIX));
        if is_combined && path.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

pub fn write_manifest(out_dir: &Path, manifest: &[ManifestEntry]) -> anyhow::Result<PathBuf> {
    let path = out_dir.join(MANIFEST_FILE);
    let mut json = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
    json.push('\n');
    std::fs::write(&path, json).with_context(|| format!("write manifest: {}", path.display()))?;
    Ok(path)
}

pub fn run(args: PrepareArgs) -> anyhow::Result<()> {
    let data_dir = PathBuf::from(&args.data);
    let out_dir = PathBuf::from(&args.out);

    if out_dir.exists() {
        let non_empty = std::fs::read_dir(&out_dir)
            .with_context(|| format!("read output dir: {}", out_dir.display()))?
            .next()
            .is_some();
        if non_empty && !args.force {
            anyhow::bail!(
                "output directory is not empty (use --force to overwrite): {}",
                out_dir.display()
            );
        }
    }
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("create output dir: {}", out_dir.display()))?;
    let stale_manifest = out_dir.join(MANIFEST_FILE);
    if stale_manifest.exists() {
        std::fs::remove_file(&stale_manifest)
            .with_context(|| format!("remove old manifest: {}", stale_manifest.display()))?;
    }

    let mut prepared = Prepared::default();
    if let Some(articles) = &args.articles {
        prepare_articles(Path::new(articles), &out_dir, &mut prepared)?;
        tracing::info!(
            written = prepared.articles_written,
            skipped = prepared.articles_skipped,
            "prepared articles"
        );
    }

    let combined = combined_artifacts(&data_dir)?;
    if combined.is_empty() {
        tracing::warn!(dir = %data_dir.display(), "no combined artifacts found");
    }
    for path in combined {
        let items = artifact::load_items(&ArtifactRef {
            path: path.clone(),
            form: ArtifactForm::Full,
            kind: ArtifactKind::Combined,
        })?;
        let before = prepared.threads_written;
        prepare_threads(&items, &out_dir, &mut prepared)?;
        tracing::info!(
            path = %path.display(),
            threads = prepared.threads_written - before,
            "prepared threads"
        );
    }

    let manifest_path = write_manifest(&out_dir, &prepared.manifest)?;
    tracing::info!(
        entries = prepared.manifest.len(),
        path = %manifest_path.display(),
        "wrote manifest"
    );
    Ok(())
}
