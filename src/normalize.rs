use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use crate::formats::{Item, Reply, deleted_author};

/// Caps applied to every reply tree: `max_depth` levels below the item
/// (top-level replies are level 1) and `max_breadth` children per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyBounds {
    pub max_depth: usize,
    pub max_breadth: usize,
}

impl Default for ReplyBounds {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_breadth: 30,
        }
    }
}

/// Where a raw record came from.
#[derive(Debug, Clone)]
pub struct SourceContext<'a> {
    pub sub_source: &'a str,
    pub site_root: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPost {
    id: Option<String>,
    title: Option<String>,
    selftext: Option<String>,
    author: Option<String>,
    subreddit: Option<String>,
    created_utc: Option<f64>,
    score: Option<i64>,
    num_comments: Option<u64>,
    permalink: Option<String>,
    url: Option<String>,
    upvote_ratio: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawComment {
    author: Option<String>,
    body: Option<String>,
    score: Option<i64>,
    created_utc: Option<f64>,
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Epoch seconds to RFC 3339 UTC; falls back to `now` when absent or out of range.
fn epoch_or_now(epoch: Option<f64>, now: DateTime<Utc>) -> String {
    let at = epoch
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
        .unwrap_or(now);
    timestamp(at)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Structural extraction of one listing record. Returns `None` when the record
/// has no usable id, or neither a title nor a body.
pub fn normalize(raw: &serde_json::Value, ctx: &SourceContext<'_>) -> Option<Item> {
    let post = RawPost::deserialize(raw).ok()?;

    let stable_id = non_blank(post.id)?;
    let title = post.title.unwrap_or_default();
    let body = post.selftext.unwrap_or_default();
    if title.trim().is_empty() && body.trim().is_empty() {
        return None;
    }

    let canonical_url = match (non_blank(post.permalink), non_blank(post.url)) {
        (Some(permalink), _) if permalink.starts_with('/') => {
            format!("{}{permalink}", ctx.site_root)
        }
        (Some(permalink), _) => permalink,
        (None, Some(url)) => url,
        (None, None) => String::new(),
    };

    Some(Item {
        stable_id,
        title,
        author: non_blank(post.author).unwrap_or_else(deleted_author),
        source_label: non_blank(post.subreddit).unwrap_or_else(|| ctx.sub_source.to_owned()),
        created_utc: epoch_or_now(post.created_utc, ctx.now),
        engagement_score: post.score.unwrap_or(0),
        reply_count: post.num_comments.unwrap_or(0),
        canonical_url,
        body,
        upvote_ratio: post.upvote_ratio.unwrap_or(0.0),
        replies: Vec::new(),
        collected_at: timestamp(ctx.now),
    })
}

fn is_comment(node: &serde_json::Value) -> bool {
    node.get("kind").and_then(|kind| kind.as_str()) == Some("t1")
}

fn comment_children(node: &serde_json::Value) -> &[serde_json::Value] {
    node.pointer("/data/replies/data/children")
        .and_then(|children| children.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn parse_comment(node: &serde_json::Value, now: DateTime<Utc>) -> Option<Reply> {
    let comment = RawComment::deserialize(node.get("data")?).ok()?;
    Some(Reply {
        author: non_blank(comment.author).unwrap_or_else(deleted_author),
        body: comment.body?,
        score: comment.score.unwrap_or(0),
        created_utc: epoch_or_now(comment.created_utc, now),
        replies: Vec::new(),
    })
}

struct PendingReply {
    reply: Reply,
    parent: Option<usize>,
}

/// Builds a bounded reply tree from raw comment nodes without recursion.
///
/// Nodes are visited depth-first with an explicit stack and stored in
/// pre-order, so every child sits after its parent; the tree is then
/// assembled by walking that order backwards.
pub fn normalize_replies(
    nodes: &[serde_json::Value],
    bounds: ReplyBounds,
    now: DateTime<Utc>,
) -> Vec<Reply> {
    if bounds.max_depth == 0 || bounds.max_breadth == 0 {
        return Vec::new();
    }

    let mut pending: Vec<Option<PendingReply>> = Vec::new();
    let mut stack: Vec<(&serde_json::Value, Option<usize>, usize)> = nodes
        .iter()
        .filter(|node| is_comment(node))
        .take(bounds.max_breadth)
        .map(|node| (node, None, 1))
        .collect();
    stack.reverse();

    while let Some((node, parent, depth)) = stack.pop() {
        let Some(reply) = parse_comment(node, now) else {
            continue;
        };
        let index = pending.len();
        pending.push(Some(PendingReply { reply, parent }));

        if depth < bounds.max_depth {
            let children: Vec<_> = comment_children(node)
                .iter()
                .filter(|child| is_comment(child))
                .take(bounds.max_breadth)
                .collect();
            for child in children.into_iter().rev() {
                stack.push((child, Some(index), depth + 1));
            }
        }
    }

    let mut roots = Vec::new();
    for index in (0..pending.len()).rev() {
        let Some(PendingReply { mut reply, parent }) = pending[index].take() else {
            continue;
        };
        reply.replies.reverse();
        match parent.and_then(|p| pending[p].as_mut()) {
            Some(parent) => parent.reply.replies.push(reply),
            None => roots.push(reply),
        }
    }
    roots.reverse();
    roots
}
