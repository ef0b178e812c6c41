use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Interval applied when a target is saved with a non-positive one.
pub const DEFAULT_INTERVAL_SECS: i64 = 15 * 60;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("static regex"));

/// Whether `name` is safe to use as a namespace or repository path segment.
pub fn is_valid_name(name: &str) -> bool {
    name.len() <= 255 && NAME_RE.is_match(name)
}

/// Which repositories a target resolves to on each run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TargetMode {
    /// Every repository currently listed under the namespace.
    NamespaceWide,
    /// A fixed list of repository names within the namespace.
    ExplicitList(Vec<String>),
}

impl TargetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetMode::NamespaceWide => "namespace",
            TargetMode::ExplicitList(_) => "repos",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    /// `None` until the target has been persisted.
    pub id: Option<i64>,
    pub name: String,
    pub namespace: String,
    pub mode: TargetMode,
    pub interval_secs: i64,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Target {
    pub fn namespace_wide(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::with_mode(name.into(), namespace.into(), TargetMode::NamespaceWide)
    }

    pub fn explicit<I, S>(name: impl Into<String>, namespace: impl Into<String>, repos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let repos = repos.into_iter().map(Into::into).collect();
        Self::with_mode(name.into(), namespace.into(), TargetMode::ExplicitList(repos))
    }

    fn with_mode(name: String, namespace: String, mode: TargetMode) -> Self {
        Self {
            id: None,
            name,
            namespace,
            mode,
            interval_secs: DEFAULT_INTERVAL_SECS,
            enabled: true,
            last_run_at: None,
            last_error: None,
        }
    }

    pub fn normalized_interval_secs(&self) -> i64 {
        if self.interval_secs <= 0 {
            DEFAULT_INTERVAL_SECS
        } else {
            self.interval_secs
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(self.normalized_interval_secs())
    }

    /// Never run, or at least one interval has elapsed since the last run.
    /// Ignores `enabled`; the scheduler checks that separately.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run_at {
            None => true,
            Some(last) => now.signed_duration_since(last) >= self.interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub id: i64,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Counters captured for one repository at one instant, before persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub observed_at: DateTime<Utc>,
    pub pull_count: i64,
    pub star_count: Option<i64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub is_private: bool,
    /// Upstream response body, stored verbatim.
    pub raw_payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub repo_id: i64,
    pub observed_at: DateTime<Utc>,
    pub pull_count: i64,
    pub star_count: Option<i64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub is_private: bool,
    pub raw_payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delta {
    pub repo_id: i64,
    pub from_ts: DateTime<Utc>,
    pub to_ts: DateTime<Utc>,
    pub from_count: i64,
    pub to_count: i64,
    pub delta: i64,
    pub seconds: i64,
    pub per_hour: f64,
}

impl Delta {
    /// Rate between two observations of the same repository.
    /// Returns `None` unless `to_ts` is strictly after `from_ts`.
    pub fn between(
        repo_id: i64,
        from_ts: DateTime<Utc>,
        from_count: i64,
        to_ts: DateTime<Utc>,
        to_count: i64,
    ) -> Option<Self> {
        let seconds = to_ts.signed_duration_since(from_ts).num_seconds();
        if seconds <= 0 {
            return None;
        }
        // Upstream counters are occasionally recalculated downward; negative deltas are kept.
        let delta = to_count - from_count;
        let per_hour = delta as f64 / (seconds as f64 / 3600.0);
        Some(Self {
            repo_id,
            from_ts,
            to_ts,
            from_count,
            to_count,
            delta,
            seconds,
            per_hour,
        })
    }
}

/// What `record_observation` ended up writing.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// A snapshot already existed at that timestamp; nothing was written.
    Duplicate,
    /// First snapshot for the repository; no delta is possible.
    First,
    /// Snapshot stored, but it is not newer than the latest prior one.
    OutOfOrder,
    /// Snapshot stored along with the delta from the previous one.
    Delta(Delta),
}
