use std::fmt;

use async_trait::async_trait;
use url::Url;

use crate::config::{SourceDescriptor, SweepLimits};
use crate::fetcher::{FetchFailure, Fetcher};

/// One ordering or query mode swept independently per sub-source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortVariant {
    Listing(String),
    Search(String),
}

impl fmt::Display for SortVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listing(sort) => write!(f, "{sort}"),
            Self::Search(query) => write!(f, "search:{query}"),
        }
    }
}

/// Variants to sweep for each sub-source of `topic`, in order, each with its
/// result limit: every listing sort, then the first `max_searches` queries.
pub fn sweep_plan(topic: &SourceDescriptor, limits: &SweepLimits) -> Vec<(SortVariant, usize)> {
    let listings = topic
        .sorts
        .iter()
        .map(|sort| (SortVariant::Listing(sort.clone()), limits.listing_limit));
    let searches = topic
        .search_queries
        .iter()
        .take(limits.max_searches)
        .map(|query| (SortVariant::Search(query.clone()), limits.search_limit));
    listings.chain(searches).collect()
}

/// One page of raw records plus the cursor for the next page, if any.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<serde_json::Value>,
    pub after: Option<String>,
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Absolute root that record permalinks are relative to.
    fn site_root(&self) -> &str;

    async fn fetch_page(
        &self,
        sub_source: &str,
        variant: &SortVariant,
        after: Option<&str>,
        page_size: usize,
    ) -> Result<Page, FetchFailure>;

    /// Raw top-level reply nodes for the thread at `canonical_url`.
    async fn fetch_replies(
        &self,
        canonical_url: &str,
        limit: usize,
        depth: usize,
    ) -> Result<Vec<serde_json::Value>, FetchFailure>;
}

/// Reddit's public JSON listing API.
#[derive(Debug)]
pub struct RedditSource {
    fetcher: Fetcher,
    base_url: Url,
    site_root: String,
}

impl RedditSource {
    pub fn new(fetcher: Fetcher, base_url: &str) -> anyhow::Result<Self> {
        let mut base_url =
            Url::parse(base_url).map_err(|err| anyhow::anyhow!("parse base url {base_url}: {err}"))?;
        if base_url.scheme() != "http" && base_url.scheme() != "https" {
            anyhow::bail!("base url must be http/https: {base_url}");
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let site_root = base_url.as_str().trim_end_matches('/').to_owned();
        Ok(Self {
            fetcher,
            base_url,
            site_root,
        })
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchFailure> {
        self.base_url
            .join(path)
            .map_err(|err| FetchFailure::InvalidRequest(format!("{path}: {err}")))
    }

    fn page_url(
        &self,
        sub_source: &str,
        variant: &SortVariant,
        after: Option<&str>,
        page_size: usize,
    ) -> Result<Url, FetchFailure> {
        let mut url = match variant {
            SortVariant::Listing(sort) => {
                let mut url = self.endpoint(&format!("r/{sub_source}/{sort}.json"))?;
                url.query_pairs_mut()
                    .append_pair("limit", &page_size.to_string());
                if sort == "top" {
                    url.query_pairs_mut().append_pair("t", "month");
                }
                url
            }
            SortVariant::Search(query) => {
                let mut url = self.endpoint(&format!("r/{sub_source}/search.json"))?;
                url.query_pairs_mut()
                    .append_pair("q", query)
                    .append_pair("restrict_sr", "1")
                    .append_pair("sort", "relevance")
                    .append_pair("limit", &page_size.to_string());
                url
            }
        };
        if let Some(after) = after {
            url.query_pairs_mut().append_pair("after", after);
        }
        Ok(url)
    }
}

#[async_trait]
impl ListingSource for RedditSource {
    fn site_root(&self) -> &str {
        &self.site_root
    }

    async fn fetch_page(
        &self,
        sub_source: &str,
        variant: &SortVariant,
        after: Option<&str>,
        page_size: usize,
    ) -> Result<Page, FetchFailure> {
        let url = self.page_url(sub_source, variant, after, page_size)?;
        self.fetcher
            .fetch_decoded(&url, |value| parse_listing(&value))
            .await
    }

    async fn fetch_replies(
        &self,
        canonical_url: &str,
        limit: usize,
        depth: usize,
    ) -> Result<Vec<serde_json::Value>, FetchFailure> {
        let Some(thread_id) = thread_id_from_url(canonical_url) else {
            return Err(FetchFailure::InvalidRequest(format!(
                "no thread id in url: {canonical_url}"
            )));
        };
        let mut url = self.endpoint(&format!("comments/{thread_id}.json"))?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("depth", &depth.to_string());

        self.fetcher.fetch_decoded(&url, parse_thread_replies).await
    }
}

/// Top-level reply nodes from a thread response: the second listing of the
/// two-element array.
pub fn parse_thread_replies(value: serde_json::Value) -> Result<Vec<serde_json::Value>, FetchFailure> {
    let serde_json::Value::Array(mut listings) = value else {
        return Err(FetchFailure::Decode("thread response is not an array".to_owned()));
    };
    if listings.len() < 2 {
        return Ok(Vec::new());
    }
    match listings.swap_remove(1).pointer_mut("/data/children").map(serde_json::Value::take) {
        Some(serde_json::Value::Array(children)) => Ok(children),
        _ => Ok(Vec::new()),
    }
}

/// Splits a listing envelope into the `data` of each child and the next cursor.
pub fn parse_listing(value: &serde_json::Value) -> Result<Page, FetchFailure> {
    let data = value
        .get("data")
        .ok_or_else(|| FetchFailure::Decode("listing has no `data`".to_owned()))?;
    let records = data
        .get("children")
        .and_then(|children| children.as_array())
        .map(|children| {
            children
                .iter()
                .filter_map(|child| child.get("data").cloned())
                .collect()
        })
        .unwrap_or_default();
    let after = data
        .get("after")
        .and_then(|after| after.as_str())
        .filter(|after| !after.is_empty())
        .map(str::to_owned);
    Ok(Page { records, after })
}

/// Extracts the thread id from a `.../comments/{id}/...` permalink.
pub fn thread_id_from_url(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("/comments/")?;
    let id = rest.split(['/', '?', '#']).next()?;
    if id.is_empty() { None } else { Some(id) }
}
