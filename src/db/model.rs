//! Row structs returned by queries, and their mapping into domain types.
//!
//! Keep these structs focused on what the tables hold. Scheduling logic
//! lives in higher layers.

use super::{parse_opt_ts, parse_ts, StoreError};
use crate::model::{Delta, Repository, Snapshot, Target, TargetMode};

#[derive(Debug, sqlx::FromRow)]
pub struct TargetRow {
    pub id: i64,
    pub name: String,
    pub mode: String,
    pub namespace: String,
    pub repos_csv: Option<String>,
    pub interval_seconds: i64,
    pub enabled: bool,
    pub last_run_at: Option<String>,
    pub last_error: Option<String>,
}

/// Split the stored repo list, trimming entries and dropping empties.
pub fn split_repos(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl TryFrom<TargetRow> for Target {
    type Error = StoreError;

    fn try_from(row: TargetRow) -> Result<Self, Self::Error> {
        let mode = match row.mode.as_str() {
            "namespace" => TargetMode::NamespaceWide,
            "repos" => TargetMode::ExplicitList(split_repos(row.repos_csv.as_deref().unwrap_or(""))),
            other => {
                return Err(StoreError::Corrupt(format!(
                    "target {} has unknown mode {:?}",
                    row.id, other
                )))
            }
        };
        Ok(Target {
            id: Some(row.id),
            name: row.name,
            namespace: row.namespace,
            mode,
            interval_secs: row.interval_seconds,
            enabled: row.enabled,
            last_run_at: parse_opt_ts(row.last_run_at)?,
            last_error: row.last_error.filter(|e| !e.is_empty()),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RepositoryRow {
    pub id: i64,
    pub namespace: String,
    pub name: String,
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        Repository {
            id: row.id,
            namespace: row.namespace,
            name: row.name,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct SnapshotRow {
    pub repo_id: i64,
    pub observed_at: String,
    pub pull_count: i64,
    pub star_count: Option<i64>,
    pub last_updated: Option<String>,
    pub is_private: bool,
    pub raw_payload: Option<Vec<u8>>,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(Snapshot {
            repo_id: row.repo_id,
            observed_at: parse_ts(&row.observed_at)?,
            pull_count: row.pull_count,
            star_count: row.star_count,
            last_updated: parse_opt_ts(row.last_updated)?,
            is_private: row.is_private,
            raw_payload: row.raw_payload.unwrap_or_default(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct DeltaRow {
    pub repo_id: i64,
    pub from_ts: String,
    pub to_ts: String,
    pub from_count: i64,
    pub to_count: i64,
    pub delta: i64,
    pub seconds: i64,
    pub per_hour: f64,
}

impl TryFrom<DeltaRow> for Delta {
    type Error = StoreError;

    fn try_from(row: DeltaRow) -> Result<Self, Self::Error> {
        Ok(Delta {
            repo_id: row.repo_id,
            from_ts: parse_ts(&row.from_ts)?,
            to_ts: parse_ts(&row.to_ts)?,
            from_count: row.from_count,
            to_count: row.to_count,
            delta: row.delta,
            seconds: row.seconds,
            per_hour: row.per_hour,
        })
    }
}
