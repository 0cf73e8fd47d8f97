//! # Agent Memory Tour
//!
//! Walks one agent session through every memory layer.
//!
//! ## What This Example Shows
//!
//! - **Working Memory**: logging inputs, actions and outputs under a FIFO policy
//! - **Episodic Memory**: episodes closed automatically by the default hooks
//! - **Semantic Memory**: patterns learned from action outcomes
//! - **Facts & Graph**: structured content classified by `remember`
//! - **Recall**: weighted, cross-store ranking
//! - **Forget**: pattern and age based deletion
//!
//! ## Run This Example
//!
//! ```bash
//! RUST_LOG=rexis_memory=debug cargo run --example agent_memory_tour
//! ```

use rexis_memory::prelude::*;
use rexis_memory::telemetry::{init_tracing, LogFormat};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogFormat::Pretty)?;

    info!("=== Agent Memory Tour ===");

    let memory = MemorySystem::new(MemoryConfig::in_memory());
    memory.initialize().await?;
    memory.on(|event| tracing::debug!(event = event.name(), "event"));

    // ========================================
    // 1. WORKING MEMORY + EPISODES + PATTERNS
    // ========================================
    let ctx = "session-42";
    let policy = PushOptions::new()
        .with_manager(Arc::new(fifo_manager(FifoOptions::new(50).preserve_inputs(5))))
        .with_agent("planner");

    for city in ["berlin", "paris"] {
        memory
            .log(ctx, LogEntry::input(format!("what is the weather in {}?", city)), policy.clone())
            .await?;
        memory
            .log(ctx, LogEntry::action_call("weather_lookup", json!(city)), policy.clone())
            .await?;
        memory
            .log(ctx, LogEntry::action_result("weather_lookup", "sunny, 21C"), policy.clone())
            .await?;
    }

    info!("Working memory: {}", memory.working().summarize(ctx).await?);
    for episode in memory.episodes().get_timeline(ctx).await? {
        info!("Episode [{}]: {}", episode.episode_type.as_str(), episode.summary);
    }
    for pattern in memory.semantic().get_relevant_patterns("weather_lookup").await? {
        info!(
            "Pattern '{}' -> '{}' (success {:.2}, seen {}x)",
            pattern.trigger, pattern.response, pattern.success_rate, pattern.occurrences
        );
    }

    // ========================================
    // 2. FACTS + GRAPH
    // ========================================
    let receipt = memory
        .remember(
            json!({
                "statement": "The payments service depends on the ledger service",
                "tags": ["architecture"],
                "entities": [
                    {"name": "payments", "type": "service"},
                    {"name": "ledger", "type": "service"}
                ],
                "relationships": [{"from": "payments", "to": "ledger", "type": "depends_on"}]
            }),
            RememberOptions::new().with_context(ctx),
        )
        .await?;
    info!(
        "Stored {} records ({} entities, {} relationships)",
        receipt.stored(),
        receipt.entities.len(),
        receipt.relationships.len()
    );

    if let Some(fact) = &receipt.fact {
        let verified = memory.facts().verify(&fact.id).await?;
        info!("Fact confidence after verification: {:.2}", verified.confidence);
    }

    if let Some(payments) = receipt.entities.first() {
        for related in memory
            .graph()
            .find_related(&payments.id, Some("depends_on"), Direction::Outgoing)
            .await?
        {
            info!("payments --{}--> {}", related.relationship.relation_type, related.entity.name);
        }
    }

    // ========================================
    // 3. RECALL
    // ========================================
    memory
        .remember(
            "Ledger reconciliation runs nightly at 02:00",
            RememberOptions::new().with_key("note:ledger").with_metadata("salience", 0.9),
        )
        .await?;

    let results = memory
        .recall(
            "ledger service",
            RecallOptions::new()
                .with_context(ctx)
                .with_limit(5)
                .with_weighting(RecallWeighting::new().with_salience(0.5).with_half_life(60_000.0))
                .explain(),
        )
        .await?;
    for result in &results {
        info!(
            "{:<8} {:.3} {}",
            result.result_type.as_str(),
            result.rank_score(),
            result.content
        );
    }

    // ========================================
    // 4. FORGET
    // ========================================
    let removed = memory.forget(ForgetCriteria::new().matching("note:*")).await?;
    info!("Forgot {} notes", removed);

    let removed = memory.forget(ForgetCriteria::new().episodes_of(ctx)).await?;
    info!("Forgot {} episodes", removed);

    let health = memory.health().await;
    info!("Health: {:?}", health.status);

    memory.close().await?;
    info!("=== Tour Complete ===");

    Ok(())
}
