use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use pullwatch::db::Store;
use pullwatch::hub::{HubError, RepoInfo, Registry};
use pullwatch::model::Target;
use pullwatch::scheduler::Scheduler;
use reqwest::StatusCode;

async fn setup_store() -> Store {
    Store::open("sqlite::memory:").await.unwrap()
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

#[derive(Debug, Clone)]
enum Reply {
    Pulls(i64),
    RateLimited,
    Status(u16),
}

#[derive(Clone, Default)]
struct RecordingRegistry {
    repos: Arc<Mutex<HashMap<String, Reply>>>,
    listings: Arc<Mutex<HashMap<String, Result<Vec<String>, u16>>>>,
    fetch_calls: Arc<Mutex<Vec<String>>>,
    list_calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingRegistry {
    async fn set(&self, full_name: &str, reply: Reply) {
        self.repos.lock().await.insert(full_name.to_string(), reply);
    }

    async fn set_listing(&self, namespace: &str, listing: Result<Vec<&str>, u16>) {
        let listing = listing.map(|names| names.into_iter().map(str::to_string).collect());
        self.listings
            .lock()
            .await
            .insert(namespace.to_string(), listing);
    }

    async fn fetch_calls(&self) -> Vec<String> {
        self.fetch_calls.lock().await.clone()
    }

    async fn list_calls(&self) -> Vec<String> {
        self.list_calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Registry for RecordingRegistry {
    async fn fetch_repository(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(RepoInfo, Vec<u8>), HubError> {
        let full_name = format!("{namespace}/{name}");
        self.fetch_calls.lock().await.push(full_name.clone());
        let reply = self.repos.lock().await.get(&full_name).cloned();
        match reply {
            Some(Reply::Pulls(pulls)) => {
                let raw = format!(r#"{{"name":"{name}","pull_count":{pulls}}}"#).into_bytes();
                Ok((
                    RepoInfo {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        pull_count: pulls,
                        star_count: Some(1),
                        last_updated: None,
                        is_private: false,
                    },
                    raw,
                ))
            }
            Some(Reply::RateLimited) => Err(HubError::RateLimited {
                body: "slow down".into(),
            }),
            Some(Reply::Status(code)) => Err(HubError::Upstream {
                status: StatusCode::from_u16(code).unwrap(),
                body: String::new(),
            }),
            None => Err(HubError::Upstream {
                status: StatusCode::NOT_FOUND,
                body: "unknown".into(),
            }),
        }
    }

    async fn list_repositories(&self, namespace: &str) -> Result<Vec<String>, HubError> {
        self.list_calls.lock().await.push(namespace.to_string());
        match self.listings.lock().await.get(namespace).cloned() {
            Some(Ok(names)) => Ok(names),
            Some(Err(code)) => Err(HubError::Upstream {
                status: StatusCode::from_u16(code).unwrap(),
                body: "listing failed".into(),
            }),
            None => Ok(Vec::new()),
        }
    }
}

async fn snapshot_count(store: &Store) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM snapshots")
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn explicit_list_tolerates_partial_failure() {
    let store = setup_store().await;
    let registry = RecordingRegistry::default();
    registry.set("library/nginx", Reply::Pulls(100)).await;
    registry.set("library/redis", Reply::RateLimited).await;
    registry.set("library/mysql", Reply::Pulls(300)).await;

    let id = store
        .upsert_target(&Target::explicit("db", "library", ["nginx", "redis", "mysql"]))
        .await
        .unwrap();

    let scheduler = Scheduler::new(store.clone(), Arc::new(registry.clone()));
    let summary = scheduler.tick_at(t0()).await;

    assert_eq!(summary.polled, 1);
    assert_eq!(summary.repos_recorded, 2);
    assert_eq!(summary.repos_failed, 1);
    assert_eq!(summary.failed_targets, 0);
    assert_eq!(snapshot_count(&store).await, 2);
    assert!(registry.list_calls().await.is_empty());
    assert_eq!(
        registry.fetch_calls().await,
        vec!["library/nginx", "library/redis", "library/mysql"]
    );

    let target = store.get_target(id).await.unwrap();
    assert_eq!(target.last_run_at, Some(t0()));
    assert_eq!(target.last_error, None);

    // The rate-limited repository was never stored.
    assert!(store.get_repository("library", "redis").await.unwrap().is_none());
}

#[tokio::test]
async fn failed_resolution_records_error_and_writes_nothing() {
    let store = setup_store().await;
    let registry = RecordingRegistry::default();
    registry.set_listing("bitnami", Err(503)).await;
    registry.set("bitnami/redis", Reply::Pulls(1)).await;

    let id = store
        .upsert_target(&Target::namespace_wide("all bitnami", "bitnami"))
        .await
        .unwrap();

    let scheduler = Scheduler::new(store.clone(), Arc::new(registry.clone()));
    let summary = scheduler.tick_at(t0()).await;

    assert_eq!(summary.polled, 1);
    assert_eq!(summary.failed_targets, 1);
    assert_eq!(snapshot_count(&store).await, 0);
    assert!(registry.fetch_calls().await.is_empty());

    let target = store.get_target(id).await.unwrap();
    assert_eq!(target.last_run_at, Some(t0()));
    let error = target.last_error.expect("resolution error recorded");
    assert!(error.contains("503"), "unexpected error text {error:?}");
}

#[tokio::test]
async fn namespace_wide_polls_every_listed_repository() {
    let store = setup_store().await;
    let registry = RecordingRegistry::default();
    registry
        .set_listing("bitnami", Ok(vec!["redis", "nginx"]))
        .await;
    registry.set("bitnami/redis", Reply::Pulls(10)).await;
    registry.set("bitnami/nginx", Reply::Pulls(20)).await;

    store
        .upsert_target(&Target::namespace_wide("all bitnami", "bitnami"))
        .await
        .unwrap();

    let scheduler = Scheduler::new(store.clone(), Arc::new(registry.clone()));
    let summary = scheduler.tick_at(t0()).await;
    assert_eq!(summary.repos_recorded, 2);
    assert_eq!(registry.list_calls().await, vec!["bitnami"]);

    // Every snapshot of one target run shares the capture timestamp.
    let stamps: Vec<String> = sqlx::query_scalar("SELECT DISTINCT observed_at FROM snapshots")
        .fetch_all(store.pool())
        .await
        .unwrap();
    assert_eq!(stamps, vec!["2024-06-01T12:00:00Z"]);
}

#[tokio::test]
async fn due_evaluation_across_ticks_builds_deltas() {
    let store = setup_store().await;
    let registry = RecordingRegistry::default();
    registry.set("library/nginx", Reply::Pulls(1_000)).await;

    let mut target = Target::explicit("web", "library", ["nginx"]);
    target.interval_secs = 900;
    store.upsert_target(&target).await.unwrap();

    let scheduler = Scheduler::new(store.clone(), Arc::new(registry.clone()));

    assert_eq!(scheduler.tick_at(t0()).await.polled, 1);

    // 899s later: not due, nothing fetched.
    let summary = scheduler.tick_at(t0() + Duration::seconds(899)).await;
    assert_eq!(summary.polled, 0);
    assert_eq!(summary.not_due, 1);
    assert_eq!(registry.fetch_calls().await.len(), 1);

    // 900s later: due again.
    registry.set("library/nginx", Reply::Pulls(1_030)).await;
    let summary = scheduler.tick_at(t0() + Duration::seconds(900)).await;
    assert_eq!(summary.polled, 1);

    let repo = store
        .get_repository("library", "nginx")
        .await
        .unwrap()
        .unwrap();
    let deltas = store.list_deltas(repo.id, 10).await.unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].from_count, 1_000);
    assert_eq!(deltas[0].to_count, 1_030);
    assert_eq!(deltas[0].seconds, 900);
    assert_eq!(deltas[0].per_hour, 120.0);
}

#[tokio::test]
async fn disabled_targets_are_skipped() {
    let store = setup_store().await;
    let registry = RecordingRegistry::default();
    registry.set("library/nginx", Reply::Pulls(5)).await;

    let mut target = Target::explicit("web", "library", ["nginx"]);
    target.enabled = false;
    let id = store.upsert_target(&target).await.unwrap();

    let scheduler = Scheduler::new(store.clone(), Arc::new(registry.clone()));
    let summary = scheduler.tick_at(t0()).await;

    assert_eq!(summary.disabled, 1);
    assert_eq!(summary.polled, 0);
    assert!(registry.fetch_calls().await.is_empty());
    assert_eq!(store.get_target(id).await.unwrap().last_run_at, None);
}

#[tokio::test]
async fn upstream_errors_do_not_stop_later_targets() {
    let store = setup_store().await;
    let registry = RecordingRegistry::default();
    registry.set("acme/api", Reply::Status(500)).await;
    registry.set("library/nginx", Reply::Pulls(5)).await;
    registry.set_listing("ghost", Err(404)).await;

    let first = store
        .upsert_target(&Target::explicit("acme", "acme", ["api"]))
        .await
        .unwrap();
    store
        .upsert_target(&Target::namespace_wide("ghost", "ghost"))
        .await
        .unwrap();
    let third = store
        .upsert_target(&Target::explicit("web", "library", ["nginx"]))
        .await
        .unwrap();

    let scheduler = Scheduler::new(store.clone(), Arc::new(registry.clone()));
    let summary = scheduler.tick_at(t0()).await;

    assert_eq!(summary.polled, 3);
    assert_eq!(summary.failed_targets, 1);
    assert_eq!(summary.repos_recorded, 1);
    assert_eq!(summary.repos_failed, 1);
    // A target whose only repository failed still counts as a successful run.
    assert_eq!(store.get_target(first).await.unwrap().last_error, None);
    assert_eq!(
        store.get_target(third).await.unwrap().last_run_at,
        Some(t0())
    );
}

#[tokio::test]
async fn repeating_a_tick_at_the_same_instant_is_harmless() {
    let store = setup_store().await;
    let registry = RecordingRegistry::default();
    registry.set("library/nginx", Reply::Pulls(5)).await;

    let mut target = Target::explicit("web", "library", ["nginx"]);
    target.interval_secs = 1;
    store.upsert_target(&target).await.unwrap();

    let scheduler = Scheduler::new(store.clone(), Arc::new(registry.clone()));
    scheduler.tick_at(t0()).await;
    // Not due yet (0s elapsed < 1s interval), so nothing is fetched.
    assert_eq!(scheduler.tick_at(t0()).await.polled, 0);

    // Force a second capture at the same timestamp through poll_target directly.
    let target = store.list_targets().await.unwrap().remove(0);
    let poll = scheduler.poll_target(&target, t0()).await.unwrap();
    assert_eq!(poll.recorded, 1);
    assert_eq!(snapshot_count(&store).await, 1);
}

#[tokio::test]
async fn spawned_scheduler_ticks_and_shuts_down() {
    let store = setup_store().await;
    let registry = RecordingRegistry::default();
    registry.set("library/nginx", Reply::Pulls(5)).await;
    store
        .upsert_target(&Target::explicit("web", "library", ["nginx"]))
        .await
        .unwrap();

    let handle = Scheduler::new(store.clone(), Arc::new(registry.clone()))
        .with_tick_period(std::time::Duration::from_millis(20))
        .spawn();

    // The first tick fires immediately.
    for _ in 0..100 {
        if snapshot_count(&store).await > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert_eq!(snapshot_count(&store).await, 1);
    assert_eq!(registry.fetch_calls().await.len(), 1);
    let target = store.list_targets().await.unwrap().remove(0);
    assert!(target.last_run_at.is_some());
}
