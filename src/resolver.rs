//! Entity resolution: maps freshly extracted mentions onto the deduplicated
//! entity/connection graph.
//!
//! Per mention: normalize surface strings, run the three-tier match (exact
//! name → alias set → bounded fuzzy), gate fuzzy hits on similarity, upsert
//! the connection, and write the evidence row idempotently. Malformed
//! mentions are skipped without aborting the batch; entity-creation races
//! converge through the store's insert-if-absent path.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Config, ResolverConfig};
use crate::error::{EngineError, EngineResult};
use crate::models::{Entity, EntityType, ExtractedMention, Mention, ResolutionOutcome};
use crate::normalize::{normalize, token_superset};
use crate::store;

/// A batch item that failed with a retryable error and should be reprocessed.
#[derive(Debug)]
pub struct ParkedMention {
    pub index: usize,
    pub reason: String,
}

/// Result of resolving one extraction batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub outcomes: Vec<ResolutionOutcome>,
    /// Malformed mentions skipped (batch continued).
    pub skipped: u64,
    /// Mid-confidence matches that fell through to creation and were flagged.
    pub flagged_for_review: u64,
    pub parked: Vec<ParkedMention>,
    pub dirty_entities: HashSet<String>,
    pub dirty_connections: HashSet<String>,
    /// Entities whose metadata or alias set changed (not just scores);
    /// these invalidate the long-TTL static cache tier.
    pub dirty_metadata: HashSet<String>,
}

/// Within-batch resolution cache: one storage round-trip per distinct
/// normalized `(name, type)` key, and no way to create the same entity twice
/// from one batch.
type ResolveCache = HashMap<(String, EntityType), String>;

/// Resolve a full extraction batch. Never fails on individual mentions;
/// storage-level errors on a mention park that item and continue.
pub async fn resolve_batch(
    pool: &SqlitePool,
    cfg: &Config,
    batch: &[ExtractedMention],
) -> Result<BatchOutcome> {
    let mut out = BatchOutcome::default();
    let mut cache: ResolveCache = HashMap::new();

    for (index, mention) in batch.iter().enumerate() {
        match process_mention(pool, cfg, &mut cache, &mut out, mention).await {
            Ok(outcome) => {
                out.dirty_entities.insert(outcome.restaurant_id.clone());
                if let Some(dish) = &outcome.dish_id {
                    out.dirty_entities.insert(dish.clone());
                }
                out.dirty_connections.insert(outcome.connection_id.clone());
                out.outcomes.push(outcome);
            }
            Err(EngineError::Resolution(msg)) => {
                warn!(index, source_id = %mention.source_id, "skipping mention: {}", msg);
                out.skipped += 1;
            }
            Err(err) => {
                warn!(index, source_id = %mention.source_id, "parking mention: {}", err);
                out.parked.push(ParkedMention {
                    index,
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok(out)
}

async fn process_mention(
    pool: &SqlitePool,
    cfg: &Config,
    cache: &mut ResolveCache,
    out: &mut BatchOutcome,
    mention: &ExtractedMention,
) -> EngineResult<ResolutionOutcome> {
    if mention.restaurant.trim().is_empty() {
        return Err(EngineError::Resolution("missing restaurant name".into()));
    }

    let restaurant_id = resolve_name(
        pool,
        &cfg.resolver,
        cache,
        out,
        &mention.restaurant,
        EntityType::Restaurant,
    )
    .await?;

    let dish_id = match mention.dish.as_deref() {
        Some(d) if !d.trim().is_empty() => Some(
            resolve_name(pool, &cfg.resolver, cache, out, d, EntityType::DishOrCategory).await?,
        ),
        _ => None,
    };
    if mention.general_praise && dish_id.is_some() {
        debug!(source_id = %mention.source_id, "general-praise flag on a dish mention, dish evidence wins");
    }

    let mut category_ids = Vec::new();
    for c in &mention.categories {
        if c.trim().is_empty() {
            continue;
        }
        let id =
            resolve_name(pool, &cfg.resolver, cache, out, c, EntityType::DishOrCategory).await?;
        if !category_ids.contains(&id) {
            category_ids.push(id);
        }
    }

    let mut attr_ids = Vec::new();
    if dish_id.is_some() {
        for a in &mention.dish_attributes {
            if a.trim().is_empty() {
                continue;
            }
            let id =
                resolve_name(pool, &cfg.resolver, cache, out, a, EntityType::DishAttribute).await?;
            if !attr_ids.contains(&id) {
                attr_ids.push(id);
            }
        }
    }

    for a in &mention.restaurant_attributes {
        if a.trim().is_empty() {
            continue;
        }
        let id = resolve_name(
            pool,
            &cfg.resolver,
            cache,
            out,
            a,
            EntityType::RestaurantAttribute,
        )
        .await?;
        store::add_restaurant_attribute(pool, &restaurant_id, &id).await?;
        out.dirty_entities.insert(id);
        out.dirty_metadata.insert(restaurant_id.clone());
    }

    // Restaurant-only mentions (general praise, category boosts) share one
    // sentinel connection per restaurant; they never synthesize dish entities.
    let connection_id = store::get_or_create_connection(
        pool,
        &restaurant_id,
        dish_id.as_deref(),
        &attr_ids,
        mention.is_menu_item,
        cfg.resolver.create_retries,
    )
    .await?;

    store::union_connection_tags(
        pool,
        &connection_id,
        &category_ids,
        &attr_ids,
        mention.is_menu_item,
        cfg.ingest.write_retries,
    )
    .await?;

    for cid in &category_ids {
        out.dirty_entities.insert(cid.clone());
    }

    let row = Mention {
        id: Uuid::new_v4().to_string(),
        connection_id: connection_id.clone(),
        source_type: mention.source_type,
        source_id: mention.source_id.clone(),
        source_url: mention.source_url.clone(),
        source: mention.source.clone(),
        excerpt: mention.excerpt.clone(),
        author: mention.author.clone(),
        upvotes: mention.upvotes,
        posted_at: mention.posted_at,
        processed_at: Utc::now().timestamp(),
    };
    let inserted = store::insert_mention(pool, &row).await?;

    let mention_id = if inserted {
        row.id
    } else {
        // Re-ingestion of a known source: reuse the stored row's id.
        sqlx::query_scalar::<_, String>(
            "SELECT id FROM mentions WHERE source_type = ? AND source_id = ? AND connection_id = ?",
        )
        .bind(mention.source_type.as_str())
        .bind(&mention.source_id)
        .bind(&connection_id)
        .fetch_one(pool)
        .await?
    };

    Ok(ResolutionOutcome {
        restaurant_id,
        dish_id,
        connection_id,
        mention_id,
        mention_inserted: inserted,
    })
}

/// Three-tier match plus confidence gating. Returns the canonical entity id
/// for one observed surface string.
async fn resolve_name(
    pool: &SqlitePool,
    cfg: &ResolverConfig,
    cache: &mut ResolveCache,
    out: &mut BatchOutcome,
    raw: &str,
    entity_type: EntityType,
) -> EngineResult<String> {
    let norm = normalize(raw);
    if norm.is_empty() {
        return Err(EngineError::Resolution(format!(
            "empty {} name after normalization: {:?}",
            entity_type.as_str(),
            raw
        )));
    }

    if let Some(id) = cache.get(&(norm.clone(), entity_type)) {
        return Ok(id.clone());
    }

    // Tier 1: exact canonical name.
    if let Some(entity) = store::find_entity(pool, &norm, entity_type).await? {
        cache.insert((norm, entity_type), entity.id.clone());
        return Ok(entity.id);
    }

    let peers = store::entities_of_type(pool, entity_type).await?;

    // Tier 2: alias set.
    if let Some(entity) = peers.iter().find(|e| e.aliases.iter().any(|a| a == &norm)) {
        cache.insert((norm, entity_type), entity.id.clone());
        return Ok(entity.id.clone());
    }

    // Tier 3: bounded fuzzy match against names and aliases of the same type.
    let candidates = fuzzy_candidates(&norm, &peers, cfg.max_edit_distance);
    if let Some((best, similarity)) = candidates.first() {
        if *similarity > cfg.merge_threshold {
            store::add_alias(pool, &best.id, &norm).await?;
            debug!(surface = %norm, entity = %best.name, similarity, "fuzzy merge");
            out.dirty_metadata.insert(best.id.clone());
            cache.insert((norm, entity_type), best.id.clone());
            return Ok(best.id.clone());
        }
        if *similarity >= cfg.review_threshold {
            // Deterministic heuristic: token superset with no competing
            // candidate merges; anything else is flagged and created.
            if candidates.len() == 1 && token_superset(&norm, &best.name) {
                store::add_alias(pool, &best.id, &norm).await?;
                debug!(surface = %norm, entity = %best.name, similarity, "heuristic merge");
                out.dirty_metadata.insert(best.id.clone());
                cache.insert((norm, entity_type), best.id.clone());
                return Ok(best.id.clone());
            }
            warn!(
                surface = %norm,
                closest = %best.name,
                similarity,
                "ambiguous match flagged for review, creating new entity"
            );
            out.flagged_for_review += 1;
        }
    }

    let (id, created) =
        store::get_or_create_entity(pool, &norm, entity_type, cfg.create_retries).await?;
    if created {
        debug!(name = %norm, entity_type = entity_type.as_str(), "created entity");
    }
    cache.insert((norm, entity_type), id.clone());
    Ok(id)
}

/// Entities within the edit-distance bound of the surface string, paired
/// with their best Jaro-Winkler similarity over name and aliases, sorted
/// best-first (ties by name for determinism).
fn fuzzy_candidates<'a>(
    norm: &str,
    peers: &'a [Entity],
    max_edit_distance: usize,
) -> Vec<(&'a Entity, f64)> {
    let mut candidates: Vec<(&Entity, f64)> = peers
        .iter()
        .filter_map(|e| {
            let mut best: Option<f64> = None;
            for candidate in std::iter::once(e.name.as_str()).chain(e.aliases.iter().map(|a| a.as_str())) {
                if strsim::levenshtein(norm, candidate) <= max_edit_distance {
                    let sim = strsim::jaro_winkler(norm, candidate);
                    best = Some(best.map_or(sim, |b: f64| b.max(sim)));
                }
            }
            best.map(|sim| (e, sim))
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.name.cmp(&b.0.name))
    });
    candidates
}
