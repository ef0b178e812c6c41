use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::is_valid_name;

pub mod model;

pub use model::RepoInfo;
use model::{RepositoryPage, RepositoryResp};

const PAGE_SIZE: &str = "100";
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rate limited by registry (429): {body}")]
    RateLimited { body: String },
    #[error("registry returned {status}: {body}")]
    Upstream { status: StatusCode, body: String },
    #[error("invalid registry response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("poll deadline exceeded")]
    DeadlineExceeded,
    #[error("invalid registry name {0:?}")]
    InvalidName(String),
    #[error("invalid registry url {0:?}")]
    InvalidUrl(String),
}

impl HubError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, HubError::RateLimited { .. })
    }

    /// Network-level failures, including the per-target deadline running out.
    pub fn is_transport(&self) -> bool {
        matches!(self, HubError::Transport(_) | HubError::DeadlineExceeded)
    }
}

/// Read access to the registry. The scheduler only talks to this trait.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Current counters for one repository plus the raw response body.
    async fn fetch_repository(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(RepoInfo, Vec<u8>), HubError>;

    /// Every repository name under `namespace`, following pagination to the end.
    /// Any failing page fails the whole listing.
    async fn list_repositories(&self, namespace: &str) -> Result<Vec<String>, HubError>;
}

#[derive(Clone)]
pub struct HubClient {
    http: Client,
    base_url: Url,
    user_agent: String,
    token: Option<String>,
}

impl fmt::Debug for HubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubClient")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HubClient {
    pub fn new(
        base_url: Url,
        user_agent: impl Into<String>,
        timeout: Duration,
        token: Option<String>,
    ) -> Result<Self, HubError> {
        let http = Client::builder().timeout(timeout).no_proxy().build()?;
        Ok(Self {
            http,
            base_url,
            user_agent: user_agent.into(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, HubError> {
        let base_url = Url::parse(&cfg.hub.base_url)
            .map_err(|_| HubError::InvalidUrl(cfg.hub.base_url.clone()))?;
        Self::new(
            base_url,
            cfg.hub.user_agent.clone(),
            cfg.http_timeout(),
            cfg.hub_token().map(str::to_string),
        )
    }

    pub fn repository_url(&self, namespace: &str, name: &str) -> Result<Url, HubError> {
        check_name(namespace)?;
        check_name(name)?;
        self.join(&format!("repositories/{namespace}/{name}/"))
    }

    pub fn listing_url(&self, namespace: &str) -> Result<Url, HubError> {
        check_name(namespace)?;
        let mut url = self.join(&format!("repositories/{namespace}/"))?;
        url.query_pairs_mut().append_pair("page_size", PAGE_SIZE);
        Ok(url)
    }

    fn join(&self, path: &str) -> Result<Url, HubError> {
        self.base_url
            .join(path)
            .map_err(|_| HubError::InvalidUrl(format!("{}{}", self.base_url, path)))
    }

    /// GET with the fixed User-Agent and, when configured, the bearer token.
    pub fn build_request(&self, url: Url) -> Result<reqwest::Request, HubError> {
        let mut builder = self
            .http
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder.build()?)
    }

    async fn get(&self, url: Url) -> Result<Vec<u8>, HubError> {
        let request = self.build_request(url)?;
        debug!(url = %request.url(), "registry request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.bytes().await?;
        check_status(status, &body)?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Registry for HubClient {
    async fn fetch_repository(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(RepoInfo, Vec<u8>), HubError> {
        let url = self.repository_url(namespace, name)?;
        let body = self.get(url).await?;
        let info = parse_repository(&body)?;
        Ok((info, body))
    }

    async fn list_repositories(&self, namespace: &str) -> Result<Vec<String>, HubError> {
        let mut next = Some(self.listing_url(namespace)?);
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        while let Some(url) = next.take() {
            if !seen.insert(url.clone()) {
                warn!(%url, namespace, "registry pagination revisited a page; stopping");
                break;
            }
            let body = self.get(url).await?;
            let (page, following) = parse_page(&body)?;
            names.extend(page);
            next = following;
        }
        debug!(namespace, count = names.len(), "listed repositories");
        Ok(names)
    }
}

fn check_name(name: &str) -> Result<(), HubError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(HubError::InvalidName(name.to_string()))
    }
}

/// Map a response status to an error, keeping a bounded slice of the body.
pub fn check_status(status: StatusCode, body: &[u8]) -> Result<(), HubError> {
    if status.is_success() {
        return Ok(());
    }
    let body: String = String::from_utf8_lossy(body)
        .chars()
        .take(MAX_ERROR_BODY)
        .collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(HubError::RateLimited { body });
    }
    Err(HubError::Upstream { status, body })
}

pub fn parse_repository(body: &[u8]) -> Result<RepoInfo, HubError> {
    let resp: RepositoryResp = serde_json::from_slice(body)?;
    Ok(resp.into())
}

/// Names on one listing page plus the next page, if any.
pub fn parse_page(body: &[u8]) -> Result<(Vec<String>, Option<Url>), HubError> {
    let page: RepositoryPage = serde_json::from_slice(body)?;
    let names = page
        .results
        .into_iter()
        .map(|r| r.name)
        .filter(|n| !n.is_empty())
        .collect();
    let next = match page.next.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(Url::parse(raw).map_err(|_| HubError::InvalidUrl(raw.to_string()))?),
    };
    Ok((names, next))
}
