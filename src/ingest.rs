//! Batch ingestion orchestration.
//!
//! Coordinates the full flow: extraction batch → entity resolution →
//! mention/connection writes → metric aggregation → deferred quality-score
//! recompute → cache invalidation. Sub-batches run on a bounded pool of
//! worker tasks; a failing sub-batch is reported and never blocks the rest.
//! Scores are recomputed once per dirty entity per cycle, not per mention,
//! to bound write amplification.

use anyhow::{anyhow, Context, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::TieredCache;
use crate::config::Config;
use crate::db;
use crate::metrics;
use crate::models::ExtractedMention;
use crate::query;
use crate::resolver;
use crate::score::{self, RecomputeReport};
use crate::store;

/// Summary of one ingestion cycle.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub batch_id: String,
    pub mentions_processed: u64,
    pub mentions_inserted: u64,
    pub mentions_deduplicated: u64,
    pub skipped: u64,
    pub flagged_for_review: u64,
    /// Items that failed with retryable errors, with context for requeueing.
    pub parked: Vec<String>,
    pub scores: RecomputeReport,
}

struct SubOutcome {
    processed: u64,
    inserted: u64,
    deduplicated: u64,
    skipped: u64,
    flagged: u64,
    parked: Vec<String>,
    dirty_entities: HashSet<String>,
    dirty_connections: HashSet<String>,
    dirty_metadata: HashSet<String>,
}

/// Ingest a batch of extracted mentions through the full pipeline.
///
/// Passing a cache drops the query-tier entries touched by this cycle's
/// dirty entities; the static tier is left alone (score churn must not
/// thrash it).
pub async fn ingest_batch(
    pool: &SqlitePool,
    cfg: &Config,
    cache: Option<&TieredCache>,
    mentions: Vec<ExtractedMention>,
) -> Result<IngestReport> {
    let batch_id = Uuid::new_v4().to_string();
    let mut report = IngestReport {
        batch_id: batch_id.clone(),
        ..Default::default()
    };

    // Fixed-size sub-batches bound lock contention; the semaphore bounds
    // parallelism.
    let chunks: Vec<Vec<ExtractedMention>> = mentions
        .chunks(cfg.ingest.batch_size.max(1))
        .map(|c| c.to_vec())
        .collect();
    let semaphore = Arc::new(Semaphore::new(cfg.ingest.workers.max(1)));

    let mut set: JoinSet<Result<SubOutcome>> = JoinSet::new();
    for (chunk_index, chunk) in chunks.into_iter().enumerate() {
        let pool = pool.clone();
        let cfg = cfg.clone();
        let semaphore = semaphore.clone();
        let batch_id = batch_id.clone();

        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| anyhow!("worker pool closed"))?;

            let outcome = resolver::resolve_batch(&pool, &cfg, &chunk).await?;

            // Aggregate metrics for every connection this chunk touched.
            // Recomputation is idempotent, so overlap with other chunks is
            // harmless.
            for connection_id in &outcome.dirty_connections {
                metrics::recompute_connection_metrics(
                    &pool,
                    &cfg.scoring,
                    connection_id,
                    cfg.ingest.write_retries,
                )
                .await?;
            }

            let inserted = outcome.outcomes.iter().filter(|o| o.mention_inserted).count() as u64;
            let processed = outcome.outcomes.len() as u64;
            let parked = outcome
                .parked
                .iter()
                .map(|p| {
                    format!(
                        "batch {} chunk {} item {}: {}",
                        batch_id, chunk_index, p.index, p.reason
                    )
                })
                .collect();

            Ok(SubOutcome {
                processed,
                inserted,
                deduplicated: processed - inserted,
                skipped: outcome.skipped,
                flagged: outcome.flagged_for_review,
                parked,
                dirty_entities: outcome.dirty_entities,
                dirty_connections: outcome.dirty_connections,
                dirty_metadata: outcome.dirty_metadata,
            })
        });
    }

    let mut dirty_entities: HashSet<String> = HashSet::new();
    let mut dirty_connections: HashSet<String> = HashSet::new();
    let mut dirty_metadata: HashSet<String> = HashSet::new();

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(sub)) => {
                report.mentions_processed += sub.processed;
                report.mentions_inserted += sub.inserted;
                report.mentions_deduplicated += sub.deduplicated;
                report.skipped += sub.skipped;
                report.flagged_for_review += sub.flagged;
                report.parked.extend(sub.parked);
                dirty_entities.extend(sub.dirty_entities);
                dirty_connections.extend(sub.dirty_connections);
                dirty_metadata.extend(sub.dirty_metadata);
            }
            Ok(Err(err)) => {
                warn!(batch_id = %batch_id, "sub-batch failed: {}", err);
                report.parked.push(format!("batch {}: sub-batch failed: {}", batch_id, err));
            }
            Err(err) => {
                warn!(batch_id = %batch_id, "worker panicked: {}", err);
                report.parked.push(format!("batch {}: worker failed: {}", batch_id, err));
            }
        }
    }

    // One score pass per cycle over the deduplicated dirty set.
    report.scores =
        score::recompute_dirty(pool, &cfg.scoring, &dirty_entities, &dirty_connections).await?;

    // Query-tier entries fall for every dirty entity, both by id and by the
    // unresolved-reference markers cached empty results carry (a new entity
    // or alias can turn those empties into hits). Static-tier entries fall
    // only for metadata/alias changes; score churn leaves them alone.
    if let Some(cache) = cache {
        for id in &dirty_entities {
            cache.invalidate_entity(id);
            if let Some(entity) = store::fetch_entity(pool, id).await? {
                cache.invalidate_entity(&query::unresolved_reference_tag(
                    entity.entity_type,
                    &entity.name,
                ));
                for alias in &entity.aliases {
                    cache.invalidate_entity(&query::unresolved_reference_tag(
                        entity.entity_type,
                        alias,
                    ));
                }
            }
        }
        for id in &dirty_metadata {
            cache.invalidate_static(id);
        }
    }

    info!(
        batch_id = %batch_id,
        processed = report.mentions_processed,
        inserted = report.mentions_inserted,
        skipped = report.skipped,
        parked = report.parked.len(),
        "ingestion cycle complete"
    );
    Ok(report)
}

/// Run the `ingest` command: read an extraction batch from a JSON file and
/// push it through the pipeline.
pub async fn run_ingest(config: &Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file: {}", path.display()))?;
    let mentions: Vec<ExtractedMention> =
        serde_json::from_str(&content).with_context(|| "Failed to parse batch file")?;

    let pool = db::connect(config).await?;
    let report = ingest_batch(&pool, config, None, mentions).await?;

    println!("ingest {}", path.display());
    println!("  batch id: {}", report.batch_id);
    println!("  mentions processed: {}", report.mentions_processed);
    println!("  mentions inserted: {}", report.mentions_inserted);
    println!("  duplicates skipped: {}", report.mentions_deduplicated);
    println!("  malformed skipped: {}", report.skipped);
    println!("  flagged for review: {}", report.flagged_for_review);
    println!(
        "  scores recomputed: {} connections, {} restaurants, {} dishes",
        report.scores.connections, report.scores.restaurants, report.scores.dishes
    );
    if !report.parked.is_empty() {
        println!("  parked for reprocessing:");
        for p in &report.parked {
            println!("    {}", p);
        }
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Run the `rebuild-metrics` command: replay the mention store over every
/// connection, then recompute all scores.
pub async fn run_rebuild(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let rebuilt =
        metrics::rebuild_all(&pool, &config.scoring, config.ingest.write_retries).await?;

    // Every entity and connection is dirty after a full rebuild.
    let dirty_connections: HashSet<String> = store::all_connection_ids(&pool)
        .await?
        .into_iter()
        .collect();
    let mut dirty_entities: HashSet<String> = HashSet::new();
    for ty in [
        crate::models::EntityType::Restaurant,
        crate::models::EntityType::DishOrCategory,
    ] {
        for e in store::entities_of_type(&pool, ty).await? {
            dirty_entities.insert(e.id);
        }
    }
    let scores =
        score::recompute_dirty(&pool, &config.scoring, &dirty_entities, &dirty_connections).await?;

    println!("rebuild-metrics");
    println!("  connections rebuilt: {}", rebuilt);
    println!(
        "  scores recomputed: {} connections, {} restaurants, {} dishes",
        scores.connections, scores.restaurants, scores.dishes
    );
    println!("ok");

    pool.close().await;
    Ok(())
}
