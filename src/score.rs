//! Quality score computation.
//!
//! Evidence decays exponentially: a mention contributes
//! `upvotes * e^(-age_days / decay_days)`. One decay constant applies to all
//! evidence, including restaurant-level category boosts. Scores are clamped
//! to `[0, max_score]` before storage.
//!
//! Recomputation is snapshot-ordered: connection scores blend in the owning
//! restaurant's score as read *before* any restaurant update in the same
//! pass, so no fixed-point iteration is needed and feedback loops cannot
//! form.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::config::ScoringConfig;
use crate::models::{EntityType, Mention};
use crate::store;

const SECS_PER_DAY: f64 = 86_400.0;

/// Time-decayed score of a single mention.
pub fn mention_score(upvotes: i64, age_days: f64, decay_days: f64) -> f64 {
    upvotes as f64 * (-age_days / decay_days).exp()
}

/// Evidence base for a connection: saturating log blend of mention count,
/// decayed upvote mass, source diversity, plus a capped recent-mention
/// bonus. Strictly non-decreasing in every input.
pub fn connection_base(
    mention_count: i64,
    decayed_upvotes: f64,
    source_diversity: i64,
    recent_mention_count: i64,
    cfg: &ScoringConfig,
) -> f64 {
    let count_term = 2.2 * (1.0 + mention_count.max(0) as f64).ln();
    let upvote_term = 1.6 * (1.0 + decayed_upvotes.max(0.0)).ln();
    let diversity_term = 0.6 * (1.0 + source_diversity.max(0) as f64).ln();
    let recent_bonus = 0.4 * recent_mention_count.clamp(0, 5) as f64;
    (count_term + upvote_term + diversity_term + recent_bonus).clamp(0.0, cfg.max_score)
}

/// Blend a connection's evidence base with the owning restaurant's previous
/// score. The restaurant term is a tie-breaker, not a driver.
pub fn blend_connection_score(base: f64, restaurant_prev: f64, cfg: &ScoringConfig) -> f64 {
    let blended =
        (1.0 - cfg.restaurant_weight) * base + cfg.restaurant_weight * restaurant_prev;
    blended.clamp(0.0, cfg.max_score)
}

/// Restaurant score: 0.80-weighted mean of the top-k connection scores plus
/// a 0.20-weighted mean over all connections (breadth term).
pub fn restaurant_score(connection_scores: &[f64], cfg: &ScoringConfig) -> f64 {
    if connection_scores.is_empty() {
        return 0.0;
    }
    let mut sorted = connection_scores.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let k = cfg.top_k_connections.min(sorted.len());
    let top_mean: f64 = sorted[..k].iter().sum::<f64>() / k as f64;
    let all_mean: f64 = sorted.iter().sum::<f64>() / sorted.len() as f64;

    let score = (1.0 - cfg.breadth_weight) * top_mean + cfg.breadth_weight * all_mean;
    score.clamp(0.0, cfg.max_score)
}

fn decayed_upvote_sum(mentions: &[Mention], now: i64, cfg: &ScoringConfig) -> f64 {
    mentions
        .iter()
        .map(|m| {
            let age_days = ((now - m.posted_at).max(0)) as f64 / SECS_PER_DAY;
            mention_score(m.upvotes, age_days, cfg.decay_days)
        })
        .sum()
}

/// Counts of rows touched by one recompute pass.
#[derive(Debug, Default)]
pub struct RecomputeReport {
    pub connections: u64,
    pub restaurants: u64,
    pub dishes: u64,
}

/// Recompute scores for a deduplicated dirty set, once per ingestion cycle.
///
/// Order: restaurant snapshots are read first, then every dirty connection is
/// scored against the snapshot, then restaurants, then dish entities (max
/// over their connections' freshly stored scores).
pub async fn recompute_dirty(
    pool: &SqlitePool,
    cfg: &ScoringConfig,
    dirty_entities: &HashSet<String>,
    dirty_connections: &HashSet<String>,
) -> Result<RecomputeReport> {
    let now = Utc::now().timestamp();
    let mut report = RecomputeReport::default();

    // Load the dirty connections and collect every restaurant involved.
    let mut connections = Vec::new();
    let mut restaurant_ids: HashSet<String> = HashSet::new();
    for id in dirty_connections {
        if let Some(conn) = store::fetch_connection(pool, id).await? {
            restaurant_ids.insert(conn.restaurant_id.clone());
            connections.push(conn);
        }
    }

    let mut dish_ids: HashSet<String> = HashSet::new();
    for id in dirty_entities {
        if let Some(entity) = store::fetch_entity(pool, id).await? {
            match entity.entity_type {
                EntityType::Restaurant => {
                    restaurant_ids.insert(entity.id);
                }
                EntityType::DishOrCategory => {
                    dish_ids.insert(entity.id);
                }
                _ => {}
            }
        }
    }

    // Snapshot restaurant scores before any write in this pass.
    let mut snapshot: HashMap<String, f64> = HashMap::new();
    for rid in &restaurant_ids {
        if let Some(entity) = store::fetch_entity(pool, rid).await? {
            snapshot.insert(entity.id, entity.quality_score);
        }
    }

    // Connections first, against the snapshot.
    for conn in &connections {
        let mentions = store::mentions_for_connection(pool, &conn.id).await?;
        let decayed = decayed_upvote_sum(&mentions, now, cfg);
        let base = connection_base(
            conn.metrics.mention_count,
            decayed,
            conn.metrics.source_diversity,
            conn.metrics.recent_mention_count,
            cfg,
        );
        let prev = snapshot.get(&conn.restaurant_id).copied().unwrap_or(0.0);
        let score = blend_connection_score(base, prev, cfg);
        store::set_connection_score(pool, &conn.id, score).await?;
        report.connections += 1;
    }

    // Restaurants next, over stored connection scores. Dish connections
    // drive the score; restaurant-only connections count only when no dish
    // evidence exists yet.
    for rid in &restaurant_ids {
        let conns = store::connections_for_restaurant(pool, rid).await?;
        let dish_scores: Vec<f64> = conns
            .iter()
            .filter(|c| c.dish_id.is_some())
            .map(|c| c.quality_score)
            .collect();
        let scores = if dish_scores.is_empty() {
            conns.iter().map(|c| c.quality_score).collect()
        } else {
            dish_scores
        };
        let score = restaurant_score(&scores, cfg);
        store::set_entity_score(pool, rid, score).await?;
        report.restaurants += 1;
    }

    // Dish entities last: max over their connections' stored scores.
    for did in &dish_ids {
        let conns = store::connections_for_dish(pool, did).await?;
        let score = conns
            .iter()
            .map(|c| c.quality_score)
            .fold(0.0_f64, f64::max)
            .clamp(0.0, cfg.max_score);
        store::set_entity_score(pool, did, score).await?;
        report.dishes += 1;
    }

    debug!(
        connections = report.connections,
        restaurants = report.restaurants,
        dishes = report.dishes,
        "score recompute pass complete"
    );
    Ok(report)
}
