#![forbid(unsafe_code)]

use std::sync::Arc;

use fleet_appcontext::{AppContext, CompositeAppMeta, ContextBuilder, Level};
use fleet_core::{ContextStatus, FleetError, Gvk};
use fleet_persist::{ContextDb, MemStore};
use fleet_state::{ActionEntry, StateInfo, StateValue};
use fleet_status::{record_cluster_status, Aggregator, OutputMode, ReadyChecker, ReadyState, ResourceBundleStatus, StatusQuery, StatusType};
use serde_json::{json, Value};

const DEPLOY_YAML: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 1\n";

fn db() -> Arc<dyn ContextDb> { Arc::new(MemStore::new()) }

/// One app on one cluster with a single deployment. The resource's status
/// reference points at `reference` (its own context by default).
fn plan(db: &Arc<dyn ContextDb>, reference: Option<&str>) -> AppContext {
    let meta = CompositeAppMeta { composite_app: "shop".into(), child_context_ids: vec!["child-1".into()], ..Default::default() };
    let b = ContextBuilder::begin(db.clone(), Some(&meta)).unwrap();
    let id = b.context_id().to_string();
    let reference = reference.map(str::to_string).unwrap_or_else(|| id.clone());
    let app = b.add_app("web").unwrap();
    let cl = b.add_cluster(&app, "prov+east").unwrap();
    b.add_level_value(&cl, Level::Reference, &json!(id)).unwrap();
    b.add_level_value(&cl, Level::ReadyStatus, &json!("Available")).unwrap();
    let res = b.add_resource(&cl, "web+Deployment", &json!(DEPLOY_YAML)).unwrap();
    b.add_level_value(&res, Level::Reference, &json!(reference)).unwrap();
    b.add_level_value(&res, Level::Status, &json!({"status": "Applied"})).unwrap();
    let ac = b.finish();
    ac.set_status(ContextStatus::Instantiated).unwrap();
    ac
}

fn log(entries: &[(StateValue, &str)]) -> StateInfo {
    let mut s = StateInfo::default();
    for (i, (st, c)) in entries.iter().enumerate() {
        s.actions.push(ActionEntry::new(*st, *c, i as i64));
        s.status_context_id = c.to_string();
    }
    s
}

fn live(deploy_ready: bool) -> ResourceBundleStatus {
    let available = if deploy_ready { 1 } else { 0 };
    serde_json::from_value(json!({
        "deploymentStatuses": [{"metadata": {"name": "web"}, "spec": {"replicas": 1, "selector": {}, "template": {}},
            "status": {"updatedReplicas": 1, "availableReplicas": available}}],
        "podStatuses": [{"metadata": {"name": "web-7d9"}, "status": {"conditions": [{"type": "Ready", "status": "True"}]}}]
    }))
    .unwrap()
}

fn ready_query() -> StatusQuery { StatusQuery::new(StatusType::Ready, OutputMode::All) }

#[test]
fn nothing_instantiated_returns_only_the_log() {
    let agg = Aggregator::new(db());
    let s = log(&[(StateValue::Created, "")]);
    let r = agg.status(&s, &ready_query()).unwrap();
    assert_eq!(r.state, s);
    assert!(r.apps.is_empty());
    assert_eq!(r.ready_status, None);
    assert!(agg.apps(&s, None).unwrap().apps.is_empty());
}

#[test]
fn plan_resource_not_present_until_reported() {
    let db = db();
    let ac = plan(&db, None);
    let id = ac.context_id().unwrap().to_string();
    let s = log(&[(StateValue::Created, ""), (StateValue::Instantiated, id.as_str())]);
    let agg = Aggregator::new(db.clone());

    let r = agg.status(&s, &ready_query()).unwrap();
    assert_eq!(r.deployed_status, Some(ContextStatus::Instantiated));
    assert_eq!(r.ready_status, Some(ReadyState::NotReady));
    assert_eq!(r.ready_counts.get("NotPresent"), Some(&1));
    assert_eq!(r.child_context_ids, vec!["child-1".to_string()]);
    let cluster = &r.apps[0].clusters[0];
    assert_eq!((cluster.cluster_provider.as_str(), cluster.cluster.as_str()), ("prov", "east"));
    assert_eq!(cluster.connectivity.as_deref(), Some("Available"));
    assert_eq!(cluster.resources[0].gvk, Gvk::new("apps", "v1", "Deployment"));
    assert_eq!(cluster.resources[0].ready_status.as_deref(), Some("NotPresent"));

    record_cluster_status(&ac, "web", "prov+east", &live(false), &ReadyChecker::default()).unwrap();
    let r = agg.status(&s, &ready_query()).unwrap();
    assert_eq!(r.ready_status, Some(ReadyState::NotReady));
    assert_eq!(r.ready_counts.get("NotPresent"), None);
    assert_eq!(r.ready_counts.get("NotReady"), Some(&1));

    record_cluster_status(&ac, "web", "prov+east", &live(true), &ReadyChecker::default()).unwrap();
    let r = agg.status(&s, &ready_query()).unwrap();
    assert_eq!(r.ready_status, Some(ReadyState::Ready));
    assert_eq!(r.ready_counts.get("Ready"), Some(&2));
    let resources = &r.apps[0].clusters[0].resources;
    // the plan deployment took the live verdict, the pod was appended
    assert_eq!(resources.len(), 2);
    assert!(r.apps[0].is_ready());
}

#[test]
fn deployed_axis_counts_apply_states() {
    let db = db();
    let ac = plan(&db, None);
    let id = ac.context_id().unwrap().to_string();
    let s = log(&[(StateValue::Instantiated, id.as_str())]);
    let r = Aggregator::new(db).status(&s, &StatusQuery::new(StatusType::Deployed, OutputMode::All)).unwrap();
    assert_eq!(r.deployed_counts.get("Applied"), Some(&1));
    assert_eq!(r.ready_status, None);
    assert!(r.apps[0].is_deployed());
    let v = serde_json::to_value(&r).unwrap();
    assert_eq!(v["apps"][0]["clusters"][0]["resources"][0]["deployedStatus"], "Applied");
    assert!(v.get("readyCounts").is_none());
}

#[test]
fn legacy_types_fill_legacy_fields() {
    let db = db();
    let ac = plan(&db, None);
    let id = ac.context_id().unwrap().to_string();
    let s = log(&[(StateValue::Instantiated, id.as_str())]);
    let agg = Aggregator::new(db);
    let r = agg.status(&s, &StatusQuery::new(StatusType::Rsync, OutputMode::All)).unwrap();
    assert_eq!(r.status, Some(ContextStatus::Instantiated));
    assert_eq!(r.deployed_status, None);
    assert_eq!(r.rsync_status.get("Applied"), Some(&1));
    assert_eq!(r.apps[0].clusters[0].ready_status.as_deref(), Some("Available"));
    let r = agg.status(&s, &StatusQuery::new(StatusType::Cluster, OutputMode::All)).unwrap();
    assert_eq!(r.cluster_status.get("NotPresent"), Some(&1));
    assert_eq!(r.apps[0].clusters[0].resources[0].cluster_status.as_deref(), Some("NotPresent"));
}

#[test]
fn output_modes_and_filters() {
    let db = db();
    let ac = plan(&db, None);
    let id = ac.context_id().unwrap().to_string();
    let s = log(&[(StateValue::Instantiated, id.as_str())]);
    let agg = Aggregator::new(db);

    let summary = agg.status(&s, &StatusQuery::new(StatusType::Ready, OutputMode::Summary)).unwrap();
    assert!(summary.apps.is_empty());
    assert_eq!(summary.ready_counts.get("NotPresent"), Some(&1));

    let detail = agg.status(&s, &StatusQuery::new(StatusType::Ready, OutputMode::Detail)).unwrap();
    assert_eq!(detail.apps[0].clusters[0].resources[0].detail.as_ref().unwrap()["kind"], "Deployment");

    let q = StatusQuery { apps: vec!["nope".into()], ..ready_query() };
    let err = agg.status(&s, &q).unwrap_err();
    assert!(matches!(err, FleetError::BadRequest(ref m) if m.contains("nope") && m.contains("shop")), "{err}");

    let q = StatusQuery { resources: vec!["other".into()], ..ready_query() };
    let r = agg.status(&s, &q).unwrap();
    assert!(r.apps.is_empty());
    assert_eq!(r.ready_status, Some(ReadyState::Ready));

    let q = StatusQuery { clusters: vec!["prov+west".into()], ..ready_query() };
    assert!(agg.status(&s, &q).unwrap().apps.is_empty());
}

#[test]
fn historical_instance_reads_older_status_context() {
    let db = db();
    let a = plan(&db, None);
    let a_id = a.context_id().unwrap().to_string();
    let b = plan(&db, Some(&a_id));
    let b_id = b.context_id().unwrap().to_string();
    let s = log(&[(StateValue::Instantiated, a_id.as_str()), (StateValue::Updated, b_id.as_str())]);
    let agg = Aggregator::new(db);

    let q = StatusQuery { instance: Some(b_id.clone()), ..StatusQuery::new(StatusType::Deployed, OutputMode::All) };
    let r = agg.status(&s, &q).unwrap();
    assert_eq!(r.apps[0].clusters[0].resources[0].name, "web");

    let q = StatusQuery { instance: Some("unknown".into()), ..ready_query() };
    assert!(agg.status(&s, &q).unwrap_err().is_not_found());
}

#[test]
fn resource_owned_by_older_plan_is_skipped_in_current_view() {
    let db = db();
    let a = plan(&db, None);
    let a_id = a.context_id().unwrap().to_string();
    let b = plan(&db, Some(&a_id));
    let b_id = b.context_id().unwrap().to_string();
    let s = log(&[(StateValue::Instantiated, a_id.as_str()), (StateValue::Instantiated, b_id.as_str())]);
    let r = Aggregator::new(db).status(&s, &StatusQuery::new(StatusType::Deployed, OutputMode::All)).unwrap();
    assert!(r.apps.is_empty());
    assert!(r.deployed_counts.is_empty());
}

#[test]
fn list_queries() {
    let db = db();
    let ac = plan(&db, None);
    let id = ac.context_id().unwrap().to_string();
    record_cluster_status(&ac, "web", "prov+east", &live(true), &ReadyChecker::default()).unwrap();
    let s = log(&[(StateValue::Instantiated, id.as_str())]);
    let agg = Aggregator::new(db);

    assert_eq!(agg.apps(&s, None).unwrap().apps, vec!["web".to_string()]);
    let by_app = agg.clusters_by_app(&s, None, &[]).unwrap();
    assert_eq!(by_app.clusters_by_app[0].app, "web");
    assert_eq!(by_app.clusters_by_app[0].clusters[0].cluster, "east");
    assert!(agg.clusters_by_app(&s, None, &["other".to_string()]).unwrap().clusters_by_app.is_empty());

    let res = agg.resources_by_app(&s, &ready_query()).unwrap();
    let names: Vec<&str> = res.resources_by_app[0].resources.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["web", "web-7d9"]);

    let cs = agg.cluster_status(&s, &ready_query()).unwrap();
    assert_eq!(cs.cluster.unwrap().cluster, "east");
    assert_eq!(cs.ready_status, Some(ReadyState::Ready));
}

#[test]
fn logical_cloud_summary_has_no_tree() {
    let db = db();
    let ac = plan(&db, None);
    let id = ac.context_id().unwrap().to_string();
    let s = log(&[(StateValue::Instantiated, id.as_str())]);
    let r = Aggregator::new(db).logical_cloud_status(&s).unwrap();
    assert!(r.apps.is_empty());
    assert!(r.child_context_ids.is_empty());
    assert_eq!(r.deployed_counts.get("Applied"), Some(&1));
    let v: Value = serde_json::to_value(&r).unwrap();
    assert_eq!(v["deployedStatus"], "Instantiated");
}
