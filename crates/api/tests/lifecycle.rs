#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_api::{AppPlan, ClusterPlan, DeploymentPlan, EventStream, LifecycleClient, MockReadyNotify, MockSynchronizer, ReadyNotifyClient, SyncCall};
use fleet_appcontext::{AppContext, CompositeAppMeta};
use fleet_core::{Config, ContextStatus, FleetError, FleetResult, Scope};
use fleet_notify::{NotifyOutput, NotifyType, StateHelpers, StatusNotifyServer, StatusRegistration, StatusValue};
use fleet_persist::{ContextDb, MemStore};
use fleet_state::StateValue;
use fleet_status::{OutputMode, StatusQuery, StatusType};
use serde_json::json;

fn key() -> Scope {
    Scope::DeploymentIntentGroup { project: "p1".into(), composite_app: "ca".into(), version: "v1".into(), deployment_intent_group: "dig".into() }
}

fn manifest(name: &str) -> serde_json::Value {
    json!(format!("apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {}\n", name))
}

fn plan(resources: &[&str]) -> DeploymentPlan {
    DeploymentPlan {
        meta: CompositeAppMeta { project: "p1".into(), composite_app: "ca".into(), version: "v1".into(), deployment_intent_group: "dig".into(), ..Default::default() },
        apps: vec![AppPlan {
            name: "web".into(),
            clusters: vec![ClusterPlan { name: "p+east".into(), groups: vec!["1".into()], manifests: resources.iter().map(|r| manifest(r)).collect() }],
        }],
    }
}

struct Fixture {
    docs: Arc<MemStore>,
    contexts: Arc<MemStore>,
    sync: Arc<MockSynchronizer>,
    client: LifecycleClient,
}

fn fixture() -> Fixture {
    let docs = Arc::new(MemStore::new());
    let contexts = Arc::new(MemStore::new());
    let sync = Arc::new(MockSynchronizer::new(contexts.clone()));
    let client = LifecycleClient::new(docs.clone(), contexts.clone(), sync.clone(), &Config::default());
    client.create(&key()).unwrap();
    Fixture { docs, contexts, sync, client }
}

fn context_status(db: &Arc<MemStore>, id: &str) -> ContextStatus { AppContext::open(db.clone(), id).unwrap().status().unwrap().status }

#[tokio::test]
async fn instantiate_then_status() {
    let f = fixture();
    let ctx = f.client.instantiate(&key(), &plan(&["api"])).await.unwrap();
    assert_eq!(f.sync.calls(), vec![SyncCall::Install(ctx.clone())]);
    assert_eq!(context_status(&f.contexts, &ctx), ContextStatus::Instantiated);

    let s = f.client.state(&key()).get().unwrap();
    assert_eq!(s.current_state().unwrap(), StateValue::Instantiated);
    assert_eq!(s.status_context_id(), Some(ctx.as_str()));

    let r = f.client.status(&key(), &StatusQuery::new(StatusType::Deployed, OutputMode::All)).unwrap();
    assert_eq!(r.name, "dig");
    assert_eq!(r.deployed_status, Some(ContextStatus::Instantiated));
    assert_eq!(r.deployed_counts.get("Applied"), Some(&1));
    let cluster = &r.apps[0].clusters[0];
    assert_eq!((cluster.cluster_provider.as_str(), cluster.cluster.as_str()), ("p", "east"));
    assert_eq!(cluster.connectivity.as_deref(), Some("Available"));
    assert_eq!(cluster.resources[0].name, "api");

    let err = f.client.instantiate(&key(), &plan(&["api"])).await.unwrap_err();
    assert!(err.is_conflict(), "{err}");
    // the refused attempt leaves only the live context behind
    let ids: BTreeSet<String> = f.contexts.keys("/context/").unwrap().iter().filter_map(|k| k.split('/').nth(2).map(str::to_string)).collect();
    assert_eq!(ids, BTreeSet::from([ctx]));
}

#[tokio::test]
async fn update_moves_to_new_context() {
    let f = fixture();
    let a = f.client.instantiate(&key(), &plan(&["api"])).await.unwrap();
    let b = f.client.update(&key(), &plan(&["api", "worker"])).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(f.sync.calls().last(), Some(&SyncCall::Update { from: a.clone(), to: b.clone() }));

    let s = f.client.state(&key()).get().unwrap();
    assert_eq!(s.current_state().unwrap(), StateValue::Updated);
    assert_eq!(s.latest_revision().unwrap(), 2);
    assert_eq!(s.last_context_id(), Some(b.as_str()));

    let r = f.client.status(&key(), &StatusQuery::new(StatusType::Deployed, OutputMode::Summary)).unwrap();
    assert_eq!(r.deployed_counts.get("Applied"), Some(&2));
    assert!(r.apps.is_empty());
}

#[tokio::test]
async fn update_requires_live_instance() {
    let f = fixture();
    let err = f.client.update(&key(), &plan(&["api"])).await.unwrap_err();
    assert!(err.is_conflict(), "{err}");
    assert!(f.sync.calls().is_empty());
}

#[tokio::test]
async fn terminate_then_instantiate_again() {
    let f = fixture();
    f.client.terminate(&key()).await.unwrap();
    assert!(f.sync.calls().is_empty());

    let a = f.client.instantiate(&key(), &plan(&["api"])).await.unwrap();
    f.client.terminate(&key()).await.unwrap();
    assert_eq!(context_status(&f.contexts, &a), ContextStatus::Terminated);
    assert_eq!(f.client.state(&key()).get().unwrap().current_state().unwrap(), StateValue::Terminated);
    let err = f.client.terminate(&key()).await.unwrap_err();
    assert!(err.to_string().contains("already terminated"), "{err}");

    let b = f.client.instantiate(&key(), &plan(&["api"])).await.unwrap();
    assert_ne!(a, b);
    assert!(AppContext::open(f.contexts.clone(), &a).unwrap_err().is_not_found());
}

#[tokio::test]
async fn failed_install_is_recorded() {
    let f = fixture();
    f.sync.fail_next("cluster unreachable");
    let err = f.client.instantiate(&key(), &plan(&["api"])).await.unwrap_err();
    assert!(matches!(err, FleetError::Unknown(_)), "{err}");

    let s = f.client.state(&key()).get().unwrap();
    assert_eq!(s.current_state().unwrap(), StateValue::InstantiateFailed);
    let ctx = s.last_context_id().unwrap().to_string();
    assert_eq!(context_status(&f.contexts, &ctx), ContextStatus::InstantiateFailed);

    assert!(f.client.instantiate(&key(), &plan(&["api"])).await.unwrap_err().is_conflict());
    f.client.terminate(&key()).await.unwrap();
    assert_eq!(f.sync.calls().last(), Some(&SyncCall::Uninstall(ctx)));
}

#[tokio::test]
async fn bad_manifest_leaves_nothing_behind() {
    let f = fixture();
    let mut p = plan(&["api"]);
    p.apps[0].clusters[0].manifests.push(json!("kind: [unterminated"));
    let err = f.client.instantiate(&key(), &p).await.unwrap_err();
    assert!(matches!(err, FleetError::Unprocessable(_)), "{err}");
    assert!(f.contexts.is_empty());
    assert_eq!(f.client.state(&key()).get().unwrap().actions.len(), 1);

    let empty = DeploymentPlan::default();
    assert!(matches!(f.client.instantiate(&key(), &empty).await.unwrap_err(), FleetError::BadRequest(_)));
}

#[tokio::test]
async fn delete_refused_while_live() {
    let f = fixture();
    f.client.instantiate(&key(), &plan(&["api"])).await.unwrap();
    assert!(f.client.delete(&key()).unwrap_err().is_conflict());
    f.client.terminate(&key()).await.unwrap();
    f.client.delete(&key()).unwrap();
    assert!(f.client.state(&key()).get().unwrap_err().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn context_is_retrieved_after_retries() {
    let f = fixture();
    let err = f.client.retrieve_app_context("missing").await.err().unwrap();
    assert!(err.is_not_found());
    let ctx = f.client.instantiate(&key(), &plan(&["api"])).await.unwrap();
    assert_eq!(f.client.retrieve_app_context(&ctx).await.unwrap().context_id().unwrap(), ctx);
}

#[tokio::test]
async fn deployed_notifications_follow_lifecycle() {
    let f = fixture();
    let ctx = f.client.instantiate(&key(), &plan(&["api"])).await.unwrap();

    let contexts: Arc<dyn ContextDb> = f.contexts.clone();
    let helpers = Arc::new(StateHelpers::new(f.docs.clone(), contexts));
    let feed = Arc::new(MockReadyNotify::new());
    let cfg = Config { notify_debounce: Duration::from_millis(10), ..Config::default() };
    let server = StatusNotifyServer::new("dcm", helpers, feed.clone(), &cfg);

    let mut stream = server.register(StatusRegistration::new("c1", key(), NotifyType::Deployed, NotifyOutput::All)).await.unwrap();
    let first = stream.next().await.unwrap();
    assert_eq!(first.status_value, StatusValue::Deployed);
    assert_eq!(first.details.len(), 1);
    assert_eq!(server.watched_contexts(), vec![ctx.clone()]);
    assert_eq!(feed.subscribers(), 1);

    f.client.terminate(&key()).await.unwrap();
    assert_eq!(feed.publish(&ctx, "web", "p+east"), 1);
    let next = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.unwrap().unwrap();
    assert_eq!(next.status_value, StatusValue::NotDeployed);

    server.deregister("c1").await.unwrap();
    assert!(stream.next().await.is_none());
    assert_eq!(feed.subscribers(), 0);
}

fn notify_server(f: &Fixture, feed: Arc<dyn ReadyNotifyClient>) -> StatusNotifyServer {
    let contexts: Arc<dyn ContextDb> = f.contexts.clone();
    let helpers = Arc::new(StateHelpers::new(f.docs.clone(), contexts));
    let cfg = Config { notify_debounce: Duration::from_millis(10), ..Config::default() };
    StatusNotifyServer::new("dcm", helpers, feed, &cfg)
}

/// Feed whose unsubscribe takes a while to reach the upstream.
struct SlowUnsubscribe(MockReadyNotify);

#[async_trait::async_trait]
impl ReadyNotifyClient for SlowUnsubscribe {
    async fn alert(&self, client_name: &str, app_context_id: &str) -> FleetResult<EventStream> { self.0.alert(client_name, app_context_id).await }

    async fn unsubscribe(&self, client_name: &str, app_context_id: &str) -> FleetResult<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.0.unsubscribe(client_name, app_context_id).await
    }
}

#[tokio::test]
async fn register_during_feed_teardown_gets_new_feed() {
    let f = fixture();
    let ctx = f.client.instantiate(&key(), &plan(&["api"])).await.unwrap();
    let feed = Arc::new(SlowUnsubscribe(MockReadyNotify::new()));
    let server = notify_server(&f, feed.clone());

    let mut a = server.register(StatusRegistration::new("a", key(), NotifyType::Deployed, NotifyOutput::All)).await.unwrap();
    assert_eq!(a.next().await.unwrap().status_value, StatusValue::Deployed);
    let teardown = {
        let server = server.clone();
        tokio::spawn(async move { server.deregister("a").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut b = server.register(StatusRegistration::new("b", key(), NotifyType::Deployed, NotifyOutput::All)).await.unwrap();
    teardown.await.unwrap().unwrap();
    assert_eq!(b.next().await.unwrap().status_value, StatusValue::Deployed);
    assert_eq!(server.watched_contexts(), vec![ctx.clone()]);
    assert_eq!(feed.0.subscribers(), 1);

    f.client.terminate(&key()).await.unwrap();
    assert_eq!(feed.0.publish(&ctx, "web", "p+east"), 1);
    let next = tokio::time::timeout(Duration::from_secs(5), b.next()).await.unwrap().unwrap();
    assert_eq!(next.status_value, StatusValue::NotDeployed);
}

#[tokio::test]
async fn filter_on_unknown_app_does_not_silence_others() {
    let f = fixture();
    let ctx = f.client.instantiate(&key(), &plan(&["api"])).await.unwrap();
    let feed = Arc::new(MockReadyNotify::new());
    let server = notify_server(&f, feed.clone());

    let good = StatusRegistration { apps: vec!["web".into()], ..StatusRegistration::new("good", key(), NotifyType::Deployed, NotifyOutput::All) };
    let mut g = server.register(good).await.unwrap();
    assert_eq!(g.next().await.unwrap().status_value, StatusValue::Deployed);

    let bad = StatusRegistration { apps: vec!["nope".into()], ..StatusRegistration::new("bad", key(), NotifyType::Deployed, NotifyOutput::All) };
    let err = server.register(bad).await.err().unwrap();
    assert!(matches!(err, FleetError::BadRequest(_)), "{err}");

    f.client.terminate(&key()).await.unwrap();
    assert_eq!(feed.publish(&ctx, "web", "p+east"), 1);
    let next = tokio::time::timeout(Duration::from_secs(5), g.next()).await.unwrap().unwrap();
    assert_eq!(next.status_value, StatusValue::NotDeployed);
}
