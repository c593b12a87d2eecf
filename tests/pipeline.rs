//! End-to-end coverage of the classify -> select -> execute pipeline
//! against an in-memory database, exercising the gate, registry, and
//! executor together the way a real caller would.

use std::collections::HashMap;
use std::sync::Arc;

use routewise::{
    audit::AuditStore,
    capability::CapabilityEngine,
    database::{ensure_schema, init_db},
    executor::{EchoAdapterFactory, Executor},
    gate::KeyStore,
    metrics::MetricsStore,
    models::{Constraints, Request},
    registry::{AuthRef, ModelSource, ProviderRecord, ProviderRegistry, StaticSource, Tier},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn test_harness() -> (Arc<Executor>, Arc<KeyStore>, Arc<AuditStore>) {
    let pool = Arc::new(init_db("sqlite::memory:").await.unwrap());
    ensure_schema(&pool).await.unwrap();

    let registry = Arc::new(ProviderRegistry::new());
    registry
        .reload(&StaticSource(vec![
            ProviderRecord {
                name: "OpenAI".to_string(),
                tier: Tier::Official,
                endpoint: "https://api.openai.com".to_string(),
                models: ModelSource::Inline(vec!["gpt-4".to_string()]),
                auth: AuthRef(None),
            },
            ProviderRecord {
                name: "StabilityAI".to_string(),
                tier: Tier::Official,
                endpoint: "https://api.stability.ai".to_string(),
                models: ModelSource::Inline(vec!["stable-diffusion-xl".to_string()]),
                auth: AuthRef(None),
            },
        ]))
        .await
        .unwrap();

    let executor = Arc::new(Executor::new(
        registry,
        Arc::new(CapabilityEngine::new()),
        Arc::new(MetricsStore::new()),
        Arc::new(EchoAdapterFactory),
        5,
    ));

    let keys = Arc::new(KeyStore::new(Arc::clone(&pool)));
    keys.load().await.unwrap();
    let audit = Arc::new(AuditStore::new(pool));

    (executor, keys, audit)
}

#[tokio::test]
async fn code_request_is_routed_and_dispatched() {
    let (executor, keys, audit) = test_harness().await;
    let (secret, _key) = keys.create_key("integration-test").await.unwrap();
    let validated = keys.validate(&secret, None, None, &audit).await.unwrap();
    let caller = validated.constraints();

    let request = Request {
        id: Uuid::new_v4(),
        caller_key: validated.id.clone(),
        prompt: "Write a Python function to compute the nth Fibonacci number".to_string(),
        context: HashMap::new(),
        constraints: Constraints::default(),
    };

    let plan = executor.build_plan(&request, &caller).await.unwrap();
    let report = executor
        .execute(plan, &request, caller, CancellationToken::new())
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.jobs.len(), 1);
}

#[tokio::test]
async fn image_request_prefers_the_image_capable_provider() {
    let (executor, keys, audit) = test_harness().await;
    let (secret, _key) = keys.create_key("integration-test").await.unwrap();
    let validated = keys.validate(&secret, None, None, &audit).await.unwrap();
    let caller = validated.constraints();

    let request = Request {
        id: Uuid::new_v4(),
        caller_key: validated.id.clone(),
        prompt: "Generate an image of a mountain at sunset".to_string(),
        context: HashMap::new(),
        constraints: Constraints::default(),
    };

    let plan = executor.build_plan(&request, &caller).await.unwrap();
    assert_eq!(plan.tasks[0].chosen_provider.as_deref(), Some("StabilityAI"));
}

#[tokio::test]
async fn disabled_key_is_rejected_before_any_selection() {
    let (executor, keys, audit) = test_harness().await;
    let (secret, key) = keys.create_key("integration-test").await.unwrap();
    keys.disable(&key.id);

    let err = keys.validate(&secret, None, None, &audit).await.unwrap_err();
    assert!(matches!(err, routewise::error::AppError::KeyDisabled));
    let _ = executor;
}
