use super::model::TargetRow;
use super::{format_ts, Store, StoreError};
use crate::model::{is_valid_name, Target, TargetMode};
use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument};

const TARGET_COLUMNS: &str = "id, name, mode, namespace, repos_csv, interval_seconds, enabled, last_run_at, last_error";

fn validate(target: &Target) -> Result<(), StoreError> {
    if target.name.trim().is_empty() {
        return Err(StoreError::Invalid("name must be non-empty"));
    }
    if !is_valid_name(target.namespace.trim()) {
        return Err(StoreError::Invalid("namespace must be a valid registry name"));
    }
    if let TargetMode::ExplicitList(repos) = &target.mode {
        let mut any = false;
        for repo in repos.iter().map(|r| r.trim()).filter(|r| !r.is_empty()) {
            if !is_valid_name(repo) {
                return Err(StoreError::Invalid("repository names must be valid registry names"));
            }
            any = true;
        }
        if !any {
            return Err(StoreError::Invalid("explicit repository list must be non-empty"));
        }
    }
    Ok(())
}

fn repos_csv(mode: &TargetMode) -> Option<String> {
    match mode {
        TargetMode::NamespaceWide => None,
        TargetMode::ExplicitList(repos) => Some(
            repos
                .iter()
                .map(|r| r.trim())
                .filter(|r| !r.is_empty())
                .collect::<Vec<_>>()
                .join(","),
        ),
    }
}

impl Store {
    #[instrument(skip_all)]
    pub async fn list_targets(&self) -> Result<Vec<Target>, StoreError> {
        let rows: Vec<TargetRow> =
            sqlx::query_as(&format!("SELECT {TARGET_COLUMNS} FROM targets ORDER BY id"))
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(Target::try_from).collect()
    }

    #[instrument(skip(self))]
    pub async fn get_target(&self, id: i64) -> Result<Target, StoreError> {
        let row: Option<TargetRow> =
            sqlx::query_as(&format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?"))
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        row.ok_or(StoreError::NotFound { id })?.try_into()
    }

    /// Insert when `target.id` is `None`, otherwise update that row in place.
    /// Run bookkeeping (`last_run_at`, `last_error`) is never written here.
    #[instrument(skip_all)]
    pub async fn upsert_target(&self, target: &Target) -> Result<i64, StoreError> {
        validate(target)?;
        let interval = target.normalized_interval_secs();
        let csv = repos_csv(&target.mode);

        let _guard = self.write_lock().await;
        match target.id {
            None => {
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO targets (name, mode, namespace, repos_csv, interval_seconds, enabled) VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
                )
                .bind(target.name.trim())
                .bind(target.mode.as_str())
                .bind(target.namespace.trim())
                .bind(csv)
                .bind(interval)
                .bind(target.enabled)
                .fetch_one(self.pool())
                .await?;
                Ok(id)
            }
            Some(id) => {
                let res = sqlx::query(
                    "UPDATE targets SET name = ?, mode = ?, namespace = ?, repos_csv = ?, interval_seconds = ?, enabled = ? WHERE id = ?",
                )
                .bind(target.name.trim())
                .bind(target.mode.as_str())
                .bind(target.namespace.trim())
                .bind(csv)
                .bind(interval)
                .bind(target.enabled)
                .bind(id)
                .execute(self.pool())
                .await?;
                if res.rows_affected() == 0 {
                    return Err(StoreError::NotFound { id });
                }
                Ok(id)
            }
        }
    }

    /// Removes the definition only; repositories and their history stay.
    #[instrument(skip(self))]
    pub async fn delete_target(&self, id: i64) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        let res = sqlx::query("DELETE FROM targets WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    /// Best-effort: failures are logged, never returned.
    pub async fn record_run(&self, id: i64, ran_at: DateTime<Utc>, error: Option<&str>) {
        if let Err(err) = self.try_record_run(id, ran_at, error).await {
            error!(?err, target_id = id, "failed to record target run");
        }
    }

    #[instrument(skip(self))]
    async fn try_record_run(
        &self,
        id: i64,
        ran_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        let res = sqlx::query("UPDATE targets SET last_run_at = ?, last_error = ? WHERE id = ?")
            .bind(format_ts(ran_at))
            .bind(error.filter(|e| !e.is_empty()))
            .bind(id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            debug!(target_id = id, "target vanished before its run was recorded");
        }
        Ok(())
    }
}
