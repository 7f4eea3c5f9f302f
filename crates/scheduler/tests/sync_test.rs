use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sluice_core::{
    parse_integration_whitelist, parse_trigger_type_whitelist, IngestionTrigger, IntegrationType, JobDefinition,
    JobDefinitionFilter, JobDefinitionParameters,
};
use sluice_scheduler::{
    Eligibility, HttpTriggerSource, StaticParameterSupplier, StaticTriggerSource, SupplierRegistry, SyncError,
    SyncRunner, TriggerSource, TriggerSynchronizer, Whitelists,
};
use sluice_storage::{InMemoryJobStore, JobDefinitionStore, StoreStats};

// ── Helpers ─────────────────────────────────────────────────────────

fn trigger(id: &str, tenant: &str, integration: &str, kind: &str, frequency: i32) -> IngestionTrigger {
    IngestionTrigger {
        trigger_id: id.to_string(),
        tenant_id: tenant.to_string(),
        integration_id: integration.to_string(),
        trigger_type: kind.into(),
        frequency,
    }
}

fn suppliers() -> SupplierRegistry {
    let mut registry = SupplierRegistry::new();
    registry.register(StaticParameterSupplier::new("jira", "jira_issues"));
    registry.register(StaticParameterSupplier::new("github", "github_prs"));
    registry
}

fn synchronizer(store: &Arc<InMemoryJobStore>, whitelists: Whitelists) -> TriggerSynchronizer {
    TriggerSynchronizer::new(store.clone(), suppliers(), whitelists)
}

async fn definitions(store: &InMemoryJobStore) -> Vec<JobDefinition> {
    store.list_definitions(&JobDefinitionFilter::default()).await.unwrap()
}

fn definition_for(trigger: &IngestionTrigger, active: bool) -> JobDefinition {
    let mut definition = JobDefinition::new(
        trigger.tenant_id.clone(),
        Some(trigger.integration_id.clone()),
        Some(trigger.trigger_type.clone()),
        "jira_issues",
        JobDefinitionParameters::default(),
    )
    .with_trigger(trigger.trigger_id.clone());
    definition.is_active = active;
    definition
}

// ── Reconciliation ──────────────────────────────────────────────────

#[tokio::test]
async fn creates_definitions_for_eligible_triggers() {
    let store = Arc::new(InMemoryJobStore::new());
    let sync = synchronizer(&store, Whitelists::default());

    let triggers = vec![
        trigger("t1", "acme", "10", "jira", 30),
        trigger("t2", "acme", "11", "GitHub", 60),
    ];
    let report = sync.sync(&triggers).await.unwrap();
    assert_eq!(report.inserted, 2);

    let defs = definitions(&store).await;
    assert_eq!(defs.len(), 2);
    assert!(defs.iter().all(|d| d.is_active));
    let github = defs
        .iter()
        .find(|d| d.ingestion_trigger_id.as_deref() == Some("t2"))
        .unwrap();
    assert_eq!(github.processor_name, "github_prs");
    assert_eq!(github.integration_type, Some(IntegrationType::new("github")));
    assert_eq!(github.integration_id.as_deref(), Some("11"));
}

#[tokio::test]
async fn second_pass_with_same_input_writes_nothing() {
    let store = Arc::new(InMemoryJobStore::new());
    let sync = synchronizer(&store, Whitelists::default());
    let triggers = vec![
        trigger("t1", "acme", "10", "jira", 30),
        trigger("t2", "acme", "11", "github", 60),
        trigger("t3", "acme", "12", "jira", 0),
    ];

    sync.sync(&triggers).await.unwrap();
    let before = store.stats();

    let report = sync.sync(&triggers).await.unwrap();
    assert_eq!(report.writes(), 0);
    assert_eq!(report.unchanged, 2);
    assert_eq!(store.stats(), before);
}

#[tokio::test]
async fn integration_whitelist_admits_only_listed_pairs() {
    let store = Arc::new(InMemoryJobStore::new());
    let whitelists = Whitelists {
        integrations: parse_integration_whitelist("1::i1"),
        integrations_enabled: true,
        ..Default::default()
    };
    let sync = synchronizer(&store, whitelists);

    let mut triggers = Vec::new();
    for tenant in 1..=5 {
        for integration in ["i1", "i2"] {
            triggers.push(trigger(
                &format!("t{tenant}-{integration}"),
                &tenant.to_string(),
                integration,
                "jira",
                15,
            ));
        }
    }

    let report = sync.sync(&triggers).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.ignored, 9);

    let defs = definitions(&store).await;
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].tenant_id, "1");
    assert_eq!(defs[0].integration_id.as_deref(), Some("i1"));
}

#[tokio::test]
async fn disabled_integration_whitelist_is_ignored() {
    let store = Arc::new(InMemoryJobStore::new());
    let whitelists = Whitelists {
        integrations: parse_integration_whitelist("1::i1"),
        integrations_enabled: false,
        ..Default::default()
    };
    let sync = synchronizer(&store, whitelists);

    let report = sync.sync(&[trigger("t", "2", "i9", "jira", 15)]).await.unwrap();
    assert_eq!(report.inserted, 1);
}

#[tokio::test]
async fn trigger_type_whitelist_filters_types() {
    let store = Arc::new(InMemoryJobStore::new());
    let whitelists = Whitelists {
        trigger_types: parse_trigger_type_whitelist("github"),
        trigger_types_enabled: true,
        ..Default::default()
    };
    let sync = synchronizer(&store, whitelists);

    let jira = trigger("t1", "acme", "1", "jira", 15);
    let github = trigger("t2", "acme", "2", "github", 15);
    assert_eq!(sync.eligibility(&jira), Eligibility::TypeNotWhitelisted);
    assert_eq!(sync.eligibility(&github), Eligibility::Eligible);

    let report = sync.sync(&[jira, github]).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(definitions(&store).await[0].ingestion_trigger_id.as_deref(), Some("t2"));
}

#[tokio::test]
async fn non_positive_frequency_never_creates_a_definition() {
    let store = Arc::new(InMemoryJobStore::new());
    let sync = synchronizer(&store, Whitelists::default());

    let off = trigger("t1", "acme", "1", "jira", -10);
    assert_eq!(sync.eligibility(&off), Eligibility::Disabled);

    let report = sync.sync(&[off]).await.unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.ignored, 1);
    assert!(definitions(&store).await.is_empty());
    assert_eq!(store.stats().definition_inserts, 0);
}

#[tokio::test]
async fn triggers_without_supplier_are_ignored() {
    let store = Arc::new(InMemoryJobStore::new());
    let sync = synchronizer(&store, Whitelists::default());

    let snyk = trigger("t1", "acme", "1", "snyk", 15);
    assert_eq!(sync.eligibility(&snyk), Eligibility::NoSupplier);
    let report = sync.sync(&[snyk]).await.unwrap();
    assert_eq!(report.ignored, 1);
    assert!(definitions(&store).await.is_empty());
}

#[tokio::test]
async fn vanished_trigger_deactivates_active_definition_once() {
    let store = Arc::new(InMemoryJobStore::new());
    let gone = trigger("gone", "acme", "1", "jira", 15);
    let also_gone = trigger("also-gone", "acme", "2", "jira", 15);
    store.insert_definition(&definition_for(&gone, true)).await.unwrap();
    store.insert_definition(&definition_for(&also_gone, false)).await.unwrap();

    let sync = synchronizer(&store, Whitelists::default());
    let report = sync.sync(&[]).await.unwrap();
    assert_eq!(report.deactivated, 1);
    assert_eq!(store.stats().definition_updates, 1);
    assert!(definitions(&store).await.iter().all(|d| !d.is_active));

    // Nothing left to deactivate.
    let report = sync.sync(&[]).await.unwrap();
    assert_eq!(report.writes(), 0);
    assert_eq!(store.stats().definition_updates, 1);
}

#[tokio::test]
async fn trigger_turned_off_deactivates_its_definition() {
    let store = Arc::new(InMemoryJobStore::new());
    let sync = synchronizer(&store, Whitelists::default());

    let mut t = trigger("t1", "acme", "1", "jira", 15);
    sync.sync(std::slice::from_ref(&t)).await.unwrap();

    t.frequency = 0;
    let report = sync.sync(std::slice::from_ref(&t)).await.unwrap();
    assert_eq!(report.deactivated, 1);
    assert_eq!(report.ignored, 0);
    assert!(!definitions(&store).await[0].is_active);
}

#[tokio::test]
async fn eligible_trigger_reactivates_inactive_definition() {
    let store = Arc::new(InMemoryJobStore::new());
    let t = trigger("t1", "acme", "1", "jira", 15);
    store.insert_definition(&definition_for(&t, false)).await.unwrap();

    let sync = synchronizer(&store, Whitelists::default());
    let report = sync.sync(std::slice::from_ref(&t)).await.unwrap();
    assert_eq!(report.activated, 1);
    assert_eq!(report.inserted, 0);

    let defs = definitions(&store).await;
    assert_eq!(defs.len(), 1);
    assert!(defs[0].is_active);
    assert_eq!(
        store.stats(),
        StoreStats {
            definition_inserts: 1,
            definition_updates: 1,
            instance_updates: 0,
        }
    );
}

#[tokio::test]
async fn duplicate_triggers_insert_once() {
    let store = Arc::new(InMemoryJobStore::new());
    let sync = synchronizer(&store, Whitelists::default());
    let t = trigger("t1", "acme", "1", "jira", 15);

    let report = sync.sync(&[t.clone(), t]).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(definitions(&store).await.len(), 1);
}

// ── Sources ─────────────────────────────────────────────────────────

#[tokio::test]
async fn runner_pass_uses_source() {
    let store = Arc::new(InMemoryJobStore::new());
    let source = Arc::new(StaticTriggerSource::new(vec![trigger("t1", "acme", "1", "jira", 15)]));
    let runner = SyncRunner::new(source, synchronizer(&store, Whitelists::default()), Duration::from_secs(60));

    let report = runner.run_once().await.unwrap();
    assert_eq!(report.inserted, 1);
}

#[tokio::test]
async fn runner_stops_on_shutdown() {
    let store = Arc::new(InMemoryJobStore::new());
    let source = Arc::new(StaticTriggerSource::default());
    let runner = SyncRunner::new(source, synchronizer(&store, Whitelists::default()), Duration::from_secs(3600));

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { runner.run(rx).await });
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("runner did not stop")
        .unwrap();
}

fn page(records: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "response": { "records": records } }))
}

#[tokio::test]
async fn http_source_reads_pages_until_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/control-plane/v1/triggers"))
        .and(query_param("page", "0"))
        .respond_with(page(json!([
            {"id": "t1", "tenant_id": "acme", "integration_id": "1", "type": "jira", "frequency": 15},
            {"id": "t2", "tenant_id": "acme", "integration_id": "2", "type": "github", "frequency": 30}
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/control-plane/v1/triggers"))
        .and(query_param("page", "1"))
        .respond_with(page(json!([
            {"id": "t3", "tenant_id": "beta", "integration_id": "9", "type": "jira", "frequency": -1}
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/control-plane/v1/triggers"))
        .and(query_param("page", "2"))
        .respond_with(page(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let source = HttpTriggerSource::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let triggers = source.fetch_triggers().await.unwrap();
    let ids: Vec<&str> = triggers.iter().map(|t| t.trigger_id.as_str()).collect();
    assert_eq!(ids, ["t1", "t2", "t3"]);
    assert_eq!(triggers[1].trigger_type, IntegrationType::new("github"));
    assert!(!triggers[2].is_enabled());
}

#[tokio::test]
async fn http_source_surfaces_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/control-plane/v1/triggers"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&server)
        .await;

    let source = HttpTriggerSource::new(&server.uri(), Duration::from_secs(5)).unwrap();
    match source.fetch_triggers().await {
        Err(SyncError::Status { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "down");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn http_source_keeps_base_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/control-plane/v1/triggers"))
        .and(query_param("page", "0"))
        .respond_with(page(json!([
            {"id": "t1", "tenant_id": "acme", "integration_id": "1", "type": "jira", "frequency": 15}
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/control-plane/v1/triggers"))
        .and(query_param("page", "1"))
        .respond_with(page(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let source = HttpTriggerSource::new(&format!("{}/api/", server.uri()), Duration::from_secs(5)).unwrap();
    let triggers = source.fetch_triggers().await.unwrap();
    assert_eq!(triggers.len(), 1);
}

#[tokio::test]
async fn http_source_fails_when_page_cap_is_hit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/control-plane/v1/triggers"))
        .respond_with(page(json!([
            {"id": "t1", "tenant_id": "acme", "integration_id": "1", "type": "jira", "frequency": 15}
        ])))
        .expect(3)
        .mount(&server)
        .await;

    let source = HttpTriggerSource::new(&server.uri(), Duration::from_secs(5))
        .unwrap()
        .with_max_pages(3);
    assert!(matches!(source.fetch_triggers().await, Err(SyncError::TooManyPages(3))));
}
