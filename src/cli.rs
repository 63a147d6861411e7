use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{FetchPolicy, RemoteConfig, SweepLimits};
use crate::normalize::ReplyBounds;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sweep every topic's sub-sources and save new threads.
    Collect(CollectArgs),
    /// Fill in replies for saved threads that have none yet.
    FetchReplies(FetchRepliesArgs),
    /// Merge every saved snapshot of a topic into one combined artifact.
    Combine(CombineArgs),
    /// Turn combined artifacts and articles into flat text documents plus a manifest.
    Prepare(PrepareArgs),
    /// Copy prepared documents into an object store.
    Upload(UploadArgs),
}

#[derive(Debug, Args)]
pub struct RemoteArgs {
    /// Remote API root (default: $TRUSTMED_BASE_URL or https://www.reddit.com).
    #[arg(long)]
    pub base_url: Option<String>,

    /// Identification string sent as User-Agent (default: $TRUSTMED_USER_AGENT).
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Minimum randomized delay before each request (politeness).
    #[arg(long, default_value_t = 2000)]
    pub min_delay_ms: u64,

    /// Maximum randomized delay before each request (politeness).
    #[arg(long, default_value_t = 3000)]
    pub max_delay_ms: u64,

    /// Base backoff on rate limiting; multiplied by the attempt number.
    #[arg(long, default_value_t = 10_000)]
    pub backoff_ms: u64,

    /// Pause before the single retry after a forbidden response.
    #[arg(long, default_value_t = 5_000)]
    pub forbidden_backoff_ms: u64,

    /// Pause between retries of other transient failures.
    #[arg(long, default_value_t = 3_000)]
    pub retry_delay_ms: u64,

    /// Maximum attempts per request.
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Per-request timeout.
    #[arg(long, default_value_t = 15)]
    pub timeout_secs: u64,
}

impl RemoteArgs {
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_retries: self.max_retries,
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms)),
            rate_limit_backoff: Duration::from_millis(self.backoff_ms),
            forbidden_backoff: Duration::from_millis(self.forbidden_backoff_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    /// Flags win over the environment.
    pub fn remote_config(&self) -> RemoteConfig {
        let mut config = RemoteConfig::from_env();
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        config
    }
}

#[derive(Debug, Args)]
pub struct CollectArgs {
    /// Data directory for snapshots (read for resume, written incrementally).
    #[arg(long)]
    pub out: String,

    /// YAML file describing topics (default: built-in diabetes and heart_disease).
    #[arg(long)]
    pub sources: Option<String>,

    /// Only collect this topic (repeatable).
    #[arg(long = "topic")]
    pub topics: Vec<String>,

    /// Override every topic's target count of newly accepted items.
    #[arg(long)]
    pub target: Option<usize>,

    /// Results to read per listing sort.
    #[arg(long, default_value_t = 100)]
    pub listing_limit: usize,

    /// Results to read per search query.
    #[arg(long, default_value_t = 50)]
    pub search_limit: usize,

    /// Search queries to run per sub-source.
    #[arg(long, default_value_t = 3)]
    pub max_searches: usize,

    /// Records requested per page.
    #[arg(long, default_value_t = 100)]
    pub page_size: usize,

    /// Save a snapshot every N accepted items.
    #[arg(long, default_value_t = 25)]
    pub save_interval: usize,

    /// Fetch replies right after each accepted item instead of in a later pass.
    #[arg(long)]
    pub inline_replies: bool,

    /// Top-level replies (and children per reply) kept in inline mode.
    #[arg(long, default_value_t = 20)]
    pub reply_limit: usize,

    /// Reply nesting depth kept in inline mode.
    #[arg(long, default_value_t = 3)]
    pub reply_depth: usize,

    /// Exit with failure when fewer items than this are known across all topics (0 disables).
    #[arg(long, default_value_t = 500)]
    pub min_total: usize,

    #[command(flatten)]
    pub remote: RemoteArgs,
}

impl CollectArgs {
    pub fn sweep_limits(&self) -> SweepLimits {
        SweepLimits {
            listing_limit: self.listing_limit,
            search_limit: self.search_limit,
            max_searches: self.max_searches,
            page_size: self.page_size.max(1),
        }
    }

    pub fn inline_reply_bounds(&self) -> Option<ReplyBounds> {
        self.inline_replies.then_some(ReplyBounds {
            max_depth: self.reply_depth,
            max_breadth: self.reply_limit,
        })
    }
}

#[derive(Debug, Args)]
pub struct FetchRepliesArgs {
    /// Data directory holding saved snapshots.
    #[arg(long)]
    pub data: String,

    /// YAML file describing topics (default: built-in topics).
    #[arg(long)]
    pub sources: Option<String>,

    /// Only process this topic (repeatable).
    #[arg(long = "topic")]
    pub topics: Vec<String>,

    /// Top-level replies (and children per reply) to keep.
    #[arg(long, default_value_t = 30)]
    pub reply_limit: usize,

    /// Reply nesting depth to keep.
    #[arg(long, default_value_t = 3)]
    pub reply_depth: usize,

    /// Rewrite the snapshot every N processed threads.
    #[arg(long, default_value_t = 25)]
    pub save_interval: usize,

    #[command(flatten)]
    pub remote: RemoteArgs,
}

impl FetchRepliesArgs {
    pub fn reply_bounds(&self) -> ReplyBounds {
        ReplyBounds {
            max_depth: self.reply_depth,
            max_breadth: self.reply_limit,
        }
    }
}

#[derive(Debug, Args)]
pub struct CombineArgs {
    /// Data directory holding saved snapshots; combined artifacts are written here.
    #[arg(long)]
    pub data: String,

    /// YAML file describing topics (default: built-in topics).
    #[arg(long)]
    pub sources: Option<String>,

    /// Only combine this topic (repeatable).
    #[arg(long = "topic")]
    pub topics: Vec<String>,
}

#[derive(Debug, Args)]
pub struct PrepareArgs {
    /// Data directory holding combined artifacts.
    #[arg(long)]
    pub data: String,

    /// Directory with `articles_metadata.json` and the article text files.
    #[arg(long)]
    pub articles: Option<String>,

    /// Output directory for documents and `manifest.json`.
    #[arg(long)]
    pub out: String,

    /// Write into an existing output directory.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Directory produced by `prepare`.
    #[arg(long)]
    pub input: String,

    /// Object store root directory.
    #[arg(long)]
    pub dest: String,

    /// Key prefix for every uploaded object.
    #[arg(long, default_value = "")]
    pub prefix: String,
}
