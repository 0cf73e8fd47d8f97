//! Memory System Tests
//!
//! End-to-end behaviour of the orchestrator over the in-memory providers:
//! - Recall ranking with and without weighting, grouping
//! - Episode capping across every store
//! - Fact confidence bounds and graph cascade through `remember`
//! - Middleware aborts, lifecycle events and context deletion

use rexis_memory::contexts::ContextSnapshot;
use rexis_memory::error::ErrorKind;
use rexis_memory::prelude::*;
use rexis_memory::working::now_millis;
use serde_json::{json, Value};
use std::sync::Arc;

async fn setup_system(config: MemoryConfig) -> MemorySystem {
    let system = MemorySystem::new(config);
    system.initialize().await.expect("in-memory providers always start");
    system
}

#[tokio::test]
async fn test_plain_and_weighted_recall_ranking() {
    let system = setup_system(MemoryConfig::in_memory()).await;
    let now = now_millis();

    system
        .remember(
            "foo bar",
            RememberOptions::new()
                .with_id("stale")
                .with_metadata("salience", 0.0)
                .with_metadata("timestamp", now - 60_000),
        )
        .await
        .unwrap();
    system
        .remember(
            "foo bar baz",
            RememberOptions::new()
                .with_id("fresh")
                .with_metadata("salience", 1.0)
                .with_metadata("timestamp", now),
        )
        .await
        .unwrap();

    let plain = system
        .recall("foo bar", RecallOptions::new().with_types([ResultType::Vector]))
        .await
        .unwrap();
    assert_eq!(plain[0].id, "stale");

    let weighted = system
        .recall(
            "foo bar",
            RecallOptions::new()
                .with_types([ResultType::Vector])
                .with_weighting(RecallWeighting::new().with_salience(1.0).with_half_life(10_000.0))
                .explain(),
        )
        .await
        .unwrap();
    assert_eq!(weighted[0].id, "fresh");
    assert!(weighted.iter().all(|r| (0.0..=1.0).contains(&r.rank_score())));
    assert!(weighted[0].breakdown.is_some());
}

#[tokio::test]
async fn test_group_by_returns_best_member_per_group() {
    let system = setup_system(MemoryConfig::in_memory()).await;

    for (id, text, doc) in [
        ("c1", "alpha beta", "d1"),
        ("c2", "alpha beta gamma", "d1"),
        ("c3", "alpha delta", "d2"),
    ] {
        system
            .remember(text, RememberOptions::new().with_id(id).with_metadata("docId", doc))
            .await
            .unwrap();
    }

    let results = system
        .recall(
            "alpha beta",
            RecallOptions::new().with_types([ResultType::Vector]).group_by("docId"),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, "c1");
    assert_eq!(results[0].group_key.as_deref(), Some("d1"));
    assert_eq!(results[1].id, "c3");
}

#[tokio::test]
async fn test_episode_cap_evicts_oldest_everywhere() {
    let vector = Arc::new(InMemoryVectorProvider::new());
    let config = MemoryConfig::new(
        Arc::new(InMemoryKvProvider::new()),
        vector.clone(),
        Arc::new(InMemoryGraphProvider::new()),
    )
    .with_max_episodes_per_context(3);
    let system = setup_system(config).await;

    let mut ids = Vec::new();
    for i in 0..4 {
        let receipt = system
            .remember(
                format!("deployment review number {}", i),
                RememberOptions::new()
                    .with_kind(MemoryKind::Episode)
                    .with_context("ops")
                    .without_index(),
            )
            .await
            .unwrap();
        ids.push(receipt.episode.unwrap().id);
    }

    let episodes = system.episodes();
    assert_eq!(episodes.count("ops").await.unwrap(), 3);
    assert!(episodes.get(&ids[0]).await.unwrap().is_none());
    assert_eq!(vector.count(Some("episodes:ops")).await.unwrap(), 3);

    let timeline: Vec<String> = episodes
        .get_timeline("ops")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert!(!timeline.contains(&ids[0]));
    assert_eq!(timeline.len(), 3);

    let found = system
        .recall("deployment review", RecallOptions::new().with_context("ops"))
        .await
        .unwrap();
    assert!(found.iter().all(|r| r.result_type == ResultType::Episode && r.id != ids[0]));
}

#[tokio::test]
async fn test_fact_confidence_stays_in_unit_range() {
    let system = setup_system(MemoryConfig::in_memory()).await;
    let receipt = system
        .remember(json!({"statement": "the cache is warm", "confidence": 0.5}), RememberOptions::new())
        .await
        .unwrap();
    let id = receipt.fact.unwrap().id;

    for delta in [10.0, -0.2, -50.0, 0.7, f64::MAX, f64::MIN] {
        let confidence = system.facts().update_confidence(&id, delta).await.unwrap();
        assert!((0.0..=1.0).contains(&confidence), "delta {} gave {}", delta, confidence);
    }
}

#[tokio::test]
async fn test_graph_cascade_through_remember() {
    let system = setup_system(MemoryConfig::in_memory()).await;
    let receipt = system
        .remember(
            json!({
                "entities": [
                    {"name": "billing", "type": "service"},
                    {"name": "ledger", "type": "service"}
                ],
                "relationships": [{"from": "billing", "to": "ledger", "type": "depends_on"}]
            }),
            RememberOptions::new(),
        )
        .await
        .unwrap();

    let billing = receipt.entities[0].id.clone();
    let ledger = receipt.entities[1].id.clone();
    let graph = system.graph();

    assert_eq!(graph.find_related(&billing, None, Direction::Both).await.unwrap().len(), 1);

    assert!(graph.remove_entity(&ledger).await.unwrap());
    assert!(graph.find_related(&billing, None, Direction::Both).await.unwrap().is_empty());
    assert!(graph.find_path(&billing, &ledger).await.unwrap().is_none());
}

struct Redactor;

#[async_trait::async_trait]
impl Middleware for Redactor {
    fn name(&self) -> &str {
        "redactor"
    }

    async fn before_remember(&self, content: &Value, _options: &RememberOptions) -> RmemResult<()> {
        if content.as_str().is_some_and(|s| s.contains("password")) {
            return Err(RmemError::validation("content", "contains a credential", "<redacted>"));
        }
        Ok(())
    }

    async fn transform_store(&self, content: Value) -> RmemResult<Value> {
        Ok(match content {
            Value::String(s) => Value::String(s.to_uppercase()),
            other => other,
        })
    }
}

#[tokio::test]
async fn test_middleware_aborts_and_transforms() {
    let system = setup_system(MemoryConfig::in_memory().with_middleware(Arc::new(Redactor))).await;

    let err = system
        .remember("password is hunter2", RememberOptions::new().with_key("secret"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Middleware);
    assert!(system.get("secret").await.unwrap().is_none());

    system
        .remember("quiet", RememberOptions::new().with_key("note"))
        .await
        .unwrap();
    let stored = system.get("note").await.unwrap().unwrap();
    assert_eq!(stored.content, json!("QUIET"));
}

#[tokio::test]
async fn test_subscribers_see_ordered_events() {
    let system = setup_system(MemoryConfig::in_memory()).await;
    let mut events = system.subscribe();

    system
        .remember("ordered", RememberOptions::new().with_key("e1").without_index())
        .await
        .unwrap();
    system.recall("ordered", RecallOptions::new()).await.unwrap();
    system.forget(ForgetCriteria::new().matching("e*")).await.unwrap();
    system.close().await.unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec![
            "beforeRemember",
            "kv.stored",
            "afterRemember",
            "beforeRecall",
            "afterRecall",
            "beforeForget",
            "afterForget",
            "closed"
        ]
    );
}

#[tokio::test]
async fn test_deleting_a_context_clears_its_memory() {
    let system = setup_system(MemoryConfig::in_memory()).await;

    system
        .contexts()
        .save(ContextSnapshot::new("run-7", json!({"step": 2})).with_agent("planner"))
        .await
        .unwrap();
    system
        .log("run-7", LogEntry::input("summarize the incident"), PushOptions::new())
        .await
        .unwrap();
    system
        .log("run-7", LogEntry::output("incident summarized"), PushOptions::new())
        .await
        .unwrap();
    assert_eq!(system.episodes().count("run-7").await.unwrap(), 1);

    assert!(system.contexts().delete("run-7").await.unwrap());
    assert!(system.contexts().get("run-7").await.unwrap().is_none());
    assert!(system.contexts().list().await.unwrap().is_empty());
    assert_eq!(system.episodes().count("run-7").await.unwrap(), 0);
    assert!(system.working().get("run-7").await.unwrap().is_empty());
}
