use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://www.reddit.com";
pub const DEFAULT_USER_AGENT: &str = "trustmed-collect/0.1 (health forum research collector)";

/// Static description of one topic: where to look, how to sweep, what counts
/// as relevant, and when to stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub topic: String,
    pub sub_sources: Vec<String>,
    #[serde(default = "default_sorts")]
    pub sorts: Vec<String>,
    #[serde(default)]
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_target_count")]
    pub target_count: usize,
}

impl SourceDescriptor {
    /// Case-insensitive substring match of any keyword against title and body.
    /// A descriptor without keywords accepts everything.
    pub fn is_relevant(&self, title: &str, body: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let text = format!("{title} {body}").to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| text.contains(&keyword.to_lowercase()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourcesFile {
    topics: Vec<SourceDescriptor>,
}

fn default_sorts() -> Vec<String> {
    vec!["hot".to_owned(), "top".to_owned(), "new".to_owned()]
}

fn default_target_count() -> usize {
    500
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

pub fn builtin_topics() -> Vec<SourceDescriptor> {
    vec![
        SourceDescriptor {
            topic: "diabetes".to_owned(),
            sub_sources: strings(&["diabetes", "diabetes_t2", "type2diabetes"]),
            sorts: default_sorts(),
            search_queries: strings(&[
                "type 2 diabetes",
                "T2 diabetes",
                "diabetes medication",
                "blood sugar management",
                "metformin",
                "diabetes symptoms",
            ]),
            keywords: strings(&[
                "type 2",
                "t2",
                "type ii",
                "diabetes",
                "blood sugar",
                "glucose",
                "insulin resistance",
                "metformin",
                "hba1c",
                "prediabetes",
            ]),
            target_count: default_target_count(),
        },
        SourceDescriptor {
            topic: "heart_disease".to_owned(),
            sub_sources: strings(&["hypertension", "HeartDisease"]),
            sorts: default_sorts(),
            search_queries: strings(&[
                "high blood pressure",
                "hypertension treatment",
                "heart disease",
                "cardiovascular",
                "blood pressure medication",
                "heart health",
            ]),
            keywords: strings(&[
                "heart disease",
                "hypertension",
                "high blood pressure",
                "cardiovascular",
                "cholesterol",
                "bp",
                "blood pressure",
                "heart attack",
                "cardiac",
            ]),
            target_count: default_target_count(),
        },
    ]
}

/// Loads topics from a YAML sources file, or the built-in set when no file is given.
pub fn load_topics(path: Option<&str>) -> anyhow::Result<Vec<SourceDescriptor>> {
    let Some(path) = path else {
        return Ok(builtin_topics());
    };

    let yaml = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("read sources file: {path}"))?;
    let file: SourcesFile =
        serde_yaml::from_str(&yaml).with_context(|| format!("parse sources file: {path}"))?;
    if file.topics.is_empty() {
        anyhow::bail!("sources file defines no topics: {path}");
    }
    for topic in &file.topics {
        if topic.topic.trim().is_empty() {
            anyhow::bail!("sources file contains a topic with an empty name: {path}");
        }
    }
    Ok(file.topics)
}

/// Narrows `topics` to the requested names, keeping configuration order.
/// An empty request selects every topic.
pub fn select_topics(
    topics: Vec<SourceDescriptor>,
    requested: &[String],
) -> anyhow::Result<Vec<SourceDescriptor>> {
    if requested.is_empty() {
        return Ok(topics);
    }
    for name in requested {
        if !topics.iter().any(|t| &t.topic == name) {
            anyhow::bail!("unknown topic: {name}");
        }
    }
    Ok(topics
        .into_iter()
        .filter(|t| requested.contains(&t.topic))
        .collect())
}

/// Retry and politeness tunables shared by every remote request.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub max_retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_backoff: Duration,
    pub forbidden_backoff: Duration,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(3000),
            rate_limit_backoff: Duration::from_secs(10),
            forbidden_backoff: Duration::from_secs(5),
            retry_delay: Duration::from_secs(3),
            timeout: Duration::from_secs(15),
        }
    }
}

impl FetchPolicy {
    /// A policy with every delay at zero.
    pub fn immediate() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            rate_limit_backoff: Duration::ZERO,
            forbidden_backoff: Duration::ZERO,
            retry_delay: Duration::ZERO,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub user_agent: String,
}

impl RemoteConfig {
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("TRUSTMED_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned());
        let user_agent =
            std::env::var("TRUSTMED_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_owned());
        Self {
            base_url,
            user_agent,
        }
    }
}

/// Per-variant result limits for one sub-source sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepLimits {
    pub listing_limit: usize,
    pub search_limit: usize,
    pub max_searches: usize,
    pub page_size: usize,
}

impl Default for SweepLimits {
    fn default() -> Self {
        Self {
            listing_limit: 100,
            search_limit: 50,
            max_searches: 3,
            page_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relevance_is_case_insensitive_substring() {
        let topic = &builtin_topics()[0];
        assert!(topic.is_relevant("My HbA1c went down", ""));
        assert!(topic.is_relevant("Question", "started METFORMIN last week"));
        assert!(!topic.is_relevant("Knee surgery", "recovery tips"));
    }

    #[test]
    fn descriptor_without_keywords_accepts_everything() {
        let topic = SourceDescriptor {
            topic: "misc".to_owned(),
            sub_sources: vec!["misc".to_owned()],
            sorts: default_sorts(),
            search_queries: Vec::new(),
            keywords: Vec::new(),
            target_count: 1,
        };
        assert!(topic.is_relevant("anything", ""));
    }

    #[test]
    fn sources_file_fills_defaults() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("sources.yaml");
        std::fs::write(
            &path,
            "topics:\n  - topic: asthma\n    sub_sources: [Asthma]\n    keywords: [inhaler]\n",
        )?;

        let topics = load_topics(path.to_str())?;
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].sorts, vec!["hot", "top", "new"]);
        assert_eq!(topics[0].target_count, 500);
        assert!(topics[0].search_queries.is_empty());
        Ok(())
    }

    #[test]
    fn select_topics_rejects_unknown_names() {
        let err = select_topics(builtin_topics(), &["gout".to_owned()])
            .unwrap_err()
            .to_string();
        assert!(err.contains("unknown topic"));
    }

    #[test]
    fn select_topics_keeps_requested_only() -> anyhow::Result<()> {
        let topics = select_topics(builtin_topics(), &["heart_disease".to_owned()])?;
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].topic, "heart_disease");
        Ok(())
    }
}
