//! End-to-end tests of the scheduler service running on the tokio runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agent_scheduler::alias::AliasResolver;
use agent_scheduler::config::SchedulerConfig;
use agent_scheduler::plugin::{ExportContext, Exporter, Plugin, PluginRegistry, PluginResult, Runner};
use agent_scheduler::scheduler::{
    DIRECT_OWNER_ID, ItemResult, Manager, Request, ResultWriter, SchedulerHandle, SchedulerService,
    SendError,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Echo;

impl Plugin for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn as_exporter(&self) -> Option<&dyn Exporter> {
        Some(self)
    }
}

impl Exporter for Echo {
    fn export(&self, key: &str, params: &[String], _: &ExportContext) -> PluginResult<Option<Value>> {
        Ok(Some(match params.first() {
            Some(param) => Value::String(param.clone()),
            None => Value::String(key.to_string()),
        }))
    }
}

#[derive(Default)]
struct Service {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl Plugin for Service {
    fn name(&self) -> &str {
        "service"
    }

    fn as_runner(&self) -> Option<&dyn Runner> {
        Some(self)
    }
}

impl Runner for Service {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Results(Mutex<Vec<ItemResult>>);

impl ResultWriter for Results {
    fn write(&self, result: ItemResult) {
        self.0.lock().push(result);
    }
}

/// Starts a service with the echo and service plugins on a short tick.
fn spawn_scheduler(service_plugin: Arc<Service>) -> (SchedulerHandle, JoinHandle<()>) {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(Echo), &["echo"]).unwrap();
    registry.register(service_plugin, &["service.ping"]).unwrap();

    let config = SchedulerConfig {
        tick_interval_ms: 20,
        ..SchedulerConfig::default()
    };
    let aliases = Arc::new(AliasResolver::with_aliases(&["hello:echo[world]"]).unwrap());
    let manager = Manager::new(registry, &config, aliases).unwrap();

    let (service, handle) = SchedulerService::new(manager, &config, CancellationToken::new());
    (handle, tokio::spawn(service.run()))
}

/// Polls `condition` until it holds or two seconds pass.
async fn wait_for(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_direct_request_produces_value() {
    let (handle, task) = spawn_scheduler(Arc::new(Service::default()));
    let results = Arc::new(Results::default());

    handle
        .update_tasks(DIRECT_OWNER_ID, results.clone(), vec![Request::new(0, "hello", "")])
        .await
        .unwrap();

    assert!(wait_for(|| !results.0.lock().is_empty()).await);
    let result = results.0.lock()[0].clone();
    assert_eq!(result.itemid, 0);
    assert_eq!(result.value, Ok(json!("world")));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unknown_key_reports_error() {
    let (handle, task) = spawn_scheduler(Arc::new(Service::default()));
    let results = Arc::new(Results::default());

    handle
        .update_tasks(3, results.clone(), vec![Request::new(11, "nope[1]", "10")])
        .await
        .unwrap();

    assert!(wait_for(|| !results.0.lock().is_empty()).await);
    let result = results.0.lock()[0].clone();
    assert_eq!(result.itemid, 11);
    assert_eq!(result.value, Err("Unknown metric nope".to_string()));

    handle.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_stats_reflect_updates() {
    let (handle, task) = spawn_scheduler(Arc::new(Service::default()));
    let results = Arc::new(Results::default());

    handle
        .update_tasks(
            5,
            results.clone(),
            vec![Request::new(1, "echo[a]", "60"), Request::new(2, "echo[b]", "60")],
        )
        .await
        .unwrap();

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.plugins, 2);
    assert_eq!(stats.active_plugins, 1);
    assert_eq!(stats.owners, 1);
    assert_eq!(stats.items, 2);
    assert_eq!(stats.updates_processed, 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_runner_started_and_stopped_on_shutdown() {
    let service = Arc::new(Service::default());
    let (handle, task) = spawn_scheduler(service.clone());
    let results = Arc::new(Results::default());

    handle
        .update_tasks(9, results, vec![Request::new(1, "service.ping", "30")])
        .await
        .unwrap();

    assert!(wait_for(|| service.starts.load(Ordering::SeqCst) == 1).await);
    assert_eq!(service.stops.load(Ordering::SeqCst), 0);

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(service.stops.load(Ordering::SeqCst), 1);
    assert!(handle.is_closed());
    assert_eq!(handle.stats().await, Err(SendError::SchedulerStopped));
}

#[tokio::test]
async fn test_cancel_ends_service() {
    let service = Arc::new(Service::default());
    let (handle, task) = spawn_scheduler(service.clone());

    handle.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();

    // Cancellation skips the graceful runner shutdown.
    assert_eq!(service.stops.load(Ordering::SeqCst), 0);
    assert!(handle.is_cancelled());
}
