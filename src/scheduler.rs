//! Recurring poll loop: decides which targets are due, fetches their
//! repositories and records one snapshot per repository.
//!
//! Targets are evaluated sequentially within a tick, and repositories
//! sequentially within a target. A tick that overruns the period causes the
//! missed ticks to be skipped rather than queued.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{Store, StoreError};
use crate::hub::{HubError, RepoInfo, Registry};
use crate::model::{Observation, RecordOutcome, Target, TargetMode};

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_TARGET_TIMEOUT: Duration = Duration::from_secs(30);

/// Counts for one tick across all targets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub disabled: usize,
    pub not_due: usize,
    pub polled: usize,
    pub failed_targets: usize,
    pub repos_recorded: usize,
    pub repos_failed: usize,
}

/// Outcome of one target's poll pass that got past repository resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub captured_at: DateTime<Utc>,
    pub resolved: usize,
    pub recorded: usize,
    pub failed: usize,
}

pub struct Scheduler {
    store: Store,
    registry: Arc<dyn Registry>,
    tick_period: Duration,
    target_timeout: Duration,
}

/// Running background loop; dropping it leaves the loop running.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop ticking and wait for the loop to exit. A tick in progress finishes first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            error!(?err, "scheduler task ended abnormally");
        }
    }
}

impl Scheduler {
    pub fn new(store: Store, registry: Arc<dyn Registry>) -> Self {
        Self {
            store,
            registry,
            tick_period: DEFAULT_TICK_PERIOD,
            target_timeout: DEFAULT_TARGET_TIMEOUT,
        }
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    /// Budget for a single target's whole poll pass, listing included.
    pub fn with_target_timeout(mut self, timeout: Duration) -> Self {
        self.target_timeout = timeout;
        self
    }

    pub fn spawn(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        SchedulerHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            tick_secs = self.tick_period.as_secs(),
            target_timeout_secs = self.target_timeout.as_secs(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    if summary.polled > 0 {
                        info!(?summary, "tick finished");
                    }
                }
            }
        }
    }

    /// Evaluate every target once against the current time.
    pub async fn tick(&self) -> TickSummary {
        self.tick_with(Utc::now(), Utc::now).await
    }

    /// Evaluate every target once as if it were `now`; snapshots are stamped `now` too.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickSummary {
        self.tick_with(now, || now).await
    }

    async fn tick_with<F>(&self, now: DateTime<Utc>, capture_clock: F) -> TickSummary
    where
        F: Fn() -> DateTime<Utc>,
    {
        let mut summary = TickSummary::default();
        let targets = match self.store.list_targets().await {
            Ok(targets) => targets,
            Err(err) => {
                error!(?err, "failed to list targets; skipping tick");
                return summary;
            }
        };

        for target in targets {
            let Some(id) = target.id else { continue };
            if !target.enabled {
                summary.disabled += 1;
                continue;
            }
            if !target.is_due(now) {
                summary.not_due += 1;
                continue;
            }

            summary.polled += 1;
            match self.poll_target(&target, capture_clock()).await {
                Ok(poll) => {
                    summary.repos_recorded += poll.recorded;
                    summary.repos_failed += poll.failed;
                    self.store.record_run(id, now, None).await;
                }
                Err(err) => {
                    warn!(?err, target_id = id, namespace = %target.namespace, "target run failed");
                    summary.failed_targets += 1;
                    self.store.record_run(id, now, Some(&err.to_string())).await;
                }
            }
        }
        summary
    }

    /// Resolve the target's repositories and record a snapshot for each,
    /// all stamped with `captured_at`. Only resolution errors are returned;
    /// per-repository failures are logged and counted.
    #[instrument(skip_all, fields(target_id = ?target.id, namespace = %target.namespace))]
    pub async fn poll_target(
        &self,
        target: &Target,
        captured_at: DateTime<Utc>,
    ) -> Result<PollSummary, HubError> {
        let deadline = Instant::now() + self.target_timeout;
        let namespace = target.namespace.as_str();

        let repos = match &target.mode {
            TargetMode::NamespaceWide => {
                within(deadline, self.registry.list_repositories(namespace)).await?
            }
            TargetMode::ExplicitList(repos) => repos.clone(),
        };

        let mut summary = PollSummary {
            captured_at,
            resolved: repos.len(),
            recorded: 0,
            failed: 0,
        };

        for repo in &repos {
            let (info, raw) =
                match within(deadline, self.registry.fetch_repository(namespace, repo)).await {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        warn!(?err, repo = %repo, rate_limited = err.is_rate_limited(), "fetch failed; skipping repository");
                        summary.failed += 1;
                        continue;
                    }
                };

            match self.store_fetched(namespace, repo, captured_at, info, raw).await {
                Ok(outcome) => {
                    debug!(repo = %repo, ?outcome, "observation stored");
                    summary.recorded += 1;
                }
                Err(err) => {
                    warn!(?err, repo = %repo, "storing observation failed; skipping repository");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn store_fetched(
        &self,
        namespace: &str,
        repo: &str,
        captured_at: DateTime<Utc>,
        info: RepoInfo,
        raw: Vec<u8>,
    ) -> Result<RecordOutcome, StoreError> {
        let repo_id = self.store.ensure_repository(namespace, repo).await?;
        let obs = Observation {
            observed_at: captured_at,
            pull_count: info.pull_count,
            star_count: info.star_count,
            last_updated: info.last_updated,
            is_private: info.is_private,
            raw_payload: raw,
        };
        self.store.record_observation(repo_id, &obs).await
    }
}

/// Run a registry call against the pass deadline.
async fn within<T, F>(deadline: Instant, fut: F) -> Result<T, HubError>
where
    F: Future<Output = Result<T, HubError>>,
{
    timeout_at(deadline, fut)
        .await
        .unwrap_or(Err(HubError::DeadlineExceeded))
}
