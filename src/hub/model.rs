use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Body of `GET repositories/{namespace}/{name}/`.
#[derive(Deserialize, Debug)]
pub struct RepositoryResp {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    pub pull_count: i64,
    #[serde(default)]
    pub star_count: Option<i64>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

/// One page of `GET repositories/{namespace}/`.
#[derive(Deserialize, Debug)]
pub struct RepositoryPage {
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub results: Vec<RepositoryEntry>,
}

#[derive(Deserialize, Debug)]
pub struct RepositoryEntry {
    #[serde(default)]
    pub name: String,
}

/// Typed counters extracted from a repository response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub namespace: String,
    pub name: String,
    pub pull_count: i64,
    pub star_count: Option<i64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub is_private: bool,
}

impl From<RepositoryResp> for RepoInfo {
    fn from(resp: RepositoryResp) -> Self {
        // An unparseable upstream timestamp is dropped rather than failing the fetch.
        let last_updated = resp
            .last_updated
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        Self {
            namespace: resp.namespace,
            name: resp.name,
            pull_count: resp.pull_count,
            star_count: resp.star_count,
            last_updated,
            is_private: resp.is_private,
        }
    }
}
