use serde::{Deserialize, Serialize};

/// Maximum number of body characters carried into the tabular summary form.
pub const SUMMARY_BODY_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default = "deleted_author")]
    pub author: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub created_utc: String,
    #[serde(default)]
    pub replies: Vec<Reply>,
}

/// One collected thread or article.
///
/// Serialized field names follow the on-disk artifact format, so artifacts
/// written by earlier collector runs load without conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "id")]
    pub stable_id: String,
    pub title: String,
    #[serde(default = "deleted_author")]
    pub author: String,
    #[serde(rename = "subreddit", default)]
    pub source_label: String,
    #[serde(default)]
    pub created_utc: String,
    #[serde(rename = "score", default)]
    pub engagement_score: i64,
    #[serde(rename = "num_comments", default)]
    pub reply_count: u64,
    #[serde(rename = "url", default)]
    pub canonical_url: String,
    #[serde(rename = "selftext", default)]
    pub body: String,
    #[serde(default)]
    pub upvote_ratio: f64,
    #[serde(rename = "comments", default)]
    pub replies: Vec<Reply>,
    #[serde(default)]
    pub collected_at: String,
}

impl Item {
    pub fn has_replies(&self) -> bool {
        !self.replies.is_empty()
    }

    /// Counts replies across the whole tree, not just the top level.
    pub fn collected_reply_count(&self) -> u64 {
        let mut count = 0_u64;
        let mut stack: Vec<&Reply> = self.replies.iter().collect();
        while let Some(reply) = stack.pop() {
            count += 1;
            stack.extend(reply.replies.iter());
        }
        count
    }
}

pub(crate) fn deleted_author() -> String {
    "[deleted]".to_owned()
}

/// Flattened row of the tabular artifact form. Replies collapse to a count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub created_utc: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub upvote_ratio: f64,
    /// Absent from tables written before replies were fetched separately.
    #[serde(default)]
    pub num_collected_comments: u64,
}

impl From<&Item> for SummaryRow {
    fn from(item: &Item) -> Self {
        Self {
            id: item.stable_id.clone(),
            title: item.title.clone(),
            author: item.author.clone(),
            subreddit: item.source_label.clone(),
            created_utc: item.created_utc.clone(),
            score: item.engagement_score,
            num_comments: item.reply_count,
            url: item.canonical_url.clone(),
            selftext: item.body.chars().take(SUMMARY_BODY_CHARS).collect(),
            upvote_ratio: item.upvote_ratio,
            num_collected_comments: item.collected_reply_count(),
        }
    }
}

impl SummaryRow {
    /// Rebuilds a reply-less item. The body is whatever the row kept.
    pub fn into_item(self) -> Item {
        Item {
            stable_id: self.id,
            title: self.title,
            author: self.author,
            source_label: self.subreddit,
            created_utc: self.created_utc,
            engagement_score: self.score,
            reply_count: self.num_comments,
            canonical_url: self.url,
            body: self.selftext,
            upvote_ratio: self.upvote_ratio,
            replies: Vec::new(),
            collected_at: String::new(),
        }
    }
}

/// Metadata for one authoritative article, as listed in `articles_metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleMetadata {
    #[serde(default = "untitled")]
    pub title: String,
    #[serde(default = "unknown_source")]
    pub source: String,
    #[serde(default = "unknown_url")]
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub collected_at: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

fn untitled() -> String {
    "Untitled".to_owned()
}

fn unknown_source() -> String {
    "Unknown Source".to_owned()
}

fn unknown_url() -> String {
    "Unknown URL".to_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Authoritative,
    Forum,
}

/// One uploaded document. Fields are declared in key order so the manifest
/// serializes with sorted keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub canonical_url: String,
    pub collected_at: Option<String>,
    pub key: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
}
