use super::model::{DeltaRow, RepositoryRow, SnapshotRow};
use super::{format_ts, parse_ts, truncate_to_second, Store, StoreError};
use crate::model::{Delta, Observation, RecordOutcome, Repository, Snapshot};
use tracing::{debug, instrument};

impl Store {
    /// Get-or-create the repository row for `(namespace, name)`.
    #[instrument(skip(self))]
    pub async fn ensure_repository(&self, namespace: &str, name: &str) -> Result<i64, StoreError> {
        let _guard = self.write_lock().await;
        sqlx::query("INSERT OR IGNORE INTO repositories (namespace, name) VALUES (?, ?)")
            .bind(namespace)
            .bind(name)
            .execute(self.pool())
            .await?;
        let id: i64 =
            sqlx::query_scalar("SELECT id FROM repositories WHERE namespace = ? AND name = ?")
                .bind(namespace)
                .bind(name)
                .fetch_one(self.pool())
                .await?;
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn get_repository(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Repository>, StoreError> {
        let row: Option<RepositoryRow> = sqlx::query_as(
            "SELECT id, namespace, name FROM repositories WHERE namespace = ? AND name = ?",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Repository::from))
    }

    #[instrument(skip_all)]
    pub async fn list_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        let rows: Vec<RepositoryRow> =
            sqlx::query_as("SELECT id, namespace, name FROM repositories ORDER BY namespace, name")
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(Repository::from).collect())
    }

    /// Store one observation and, when it follows an older snapshot of the same
    /// repository, the delta between the two. Runs as a single transaction.
    #[instrument(skip(self, obs), fields(observed_at = %obs.observed_at))]
    pub async fn record_observation(
        &self,
        repo_id: i64,
        obs: &Observation,
    ) -> Result<RecordOutcome, StoreError> {
        let observed_at = truncate_to_second(obs.observed_at);
        let observed_text = format_ts(observed_at);

        let _guard = self.write_lock().await;
        let mut tx = self.pool().begin().await?;

        let prior: Option<(String, i64)> = sqlx::query_as(
            "SELECT observed_at, pull_count FROM snapshots WHERE repo_id = ? ORDER BY observed_at DESC LIMIT 1",
        )
        .bind(repo_id)
        .fetch_optional(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO snapshots (repo_id, observed_at, pull_count, star_count, last_updated, is_private, raw_payload) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(repo_id)
        .bind(&observed_text)
        .bind(obs.pull_count)
        .bind(obs.star_count)
        .bind(obs.last_updated.map(format_ts))
        .bind(obs.is_private)
        .bind(&obs.raw_payload)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            debug!(repo_id, "snapshot already recorded at this timestamp");
            return Ok(RecordOutcome::Duplicate);
        }

        let Some((prior_text, prior_count)) = prior else {
            tx.commit().await?;
            return Ok(RecordOutcome::First);
        };
        let prior_at = parse_ts(&prior_text)?;

        let Some(delta) = Delta::between(repo_id, prior_at, prior_count, observed_at, obs.pull_count)
        else {
            tx.commit().await?;
            debug!(repo_id, prior = %prior_text, "observation not newer than latest snapshot");
            return Ok(RecordOutcome::OutOfOrder);
        };

        sqlx::query(
            "INSERT OR IGNORE INTO deltas (repo_id, from_ts, to_ts, from_count, to_count, delta, seconds, per_hour) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(repo_id)
        .bind(&prior_text)
        .bind(&observed_text)
        .bind(delta.from_count)
        .bind(delta.to_count)
        .bind(delta.delta)
        .bind(delta.seconds)
        .bind(delta.per_hour)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RecordOutcome::Delta(delta))
    }

    /// Most recent `limit` snapshots, newest first.
    #[instrument(skip(self))]
    pub async fn list_snapshots(&self, repo_id: i64, limit: i64) -> Result<Vec<Snapshot>, StoreError> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT repo_id, observed_at, pull_count, star_count, last_updated, is_private, raw_payload FROM snapshots WHERE repo_id = ? ORDER BY observed_at DESC LIMIT ?",
        )
        .bind(repo_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Snapshot::try_from).collect()
    }

    /// Most recent `limit` deltas, newest first.
    #[instrument(skip(self))]
    pub async fn list_deltas(&self, repo_id: i64, limit: i64) -> Result<Vec<Delta>, StoreError> {
        let rows: Vec<DeltaRow> = sqlx::query_as(
            "SELECT repo_id, from_ts, to_ts, from_count, to_count, delta, seconds, per_hour FROM deltas WHERE repo_id = ? ORDER BY to_ts DESC LIMIT ?",
        )
        .bind(repo_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Delta::try_from).collect()
    }
}
