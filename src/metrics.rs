//! Metric aggregation for connections.
//!
//! Metrics are always recomputed from the full mention set of a connection
//! rather than incrementally patched, so applying the same mention twice (or
//! replaying the whole mention store) converges to identical state. The
//! `rebuild-metrics` command is exactly that replay.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::warn;

use crate::config::ScoringConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{ActivityLevel, Mention, Metrics, TopMention};
use crate::score::mention_score;
use crate::store;

const SECS_PER_DAY: i64 = 86_400;

/// Derive the full metrics blob from a connection's mentions. Pure and
/// deterministic for a fixed `now`.
pub fn compute_metrics(
    mentions: &[Mention],
    now: i64,
    cfg: &ScoringConfig,
) -> (Metrics, ActivityLevel, i64) {
    let mention_count = mentions.len() as i64;
    let total_upvotes: i64 = mentions.iter().map(|m| m.upvotes).sum();

    let mut pairs: HashSet<(&str, &str)> = HashSet::new();
    for m in mentions {
        pairs.insert((m.source.as_str(), m.author.as_str()));
    }
    let source_diversity = pairs.len() as i64;

    let recent_cutoff = now - cfg.recent_window_days * SECS_PER_DAY;
    let recent_mention_count = mentions.iter().filter(|m| m.posted_at >= recent_cutoff).count() as i64;

    let mut scored: Vec<TopMention> = mentions
        .iter()
        .map(|m| {
            let age_days = ((now - m.posted_at).max(0)) as f64 / SECS_PER_DAY as f64;
            TopMention {
                mention_id: m.id.clone(),
                score: mention_score(m.upvotes, age_days, cfg.decay_days),
                upvotes: m.upvotes,
                age_days,
            }
        })
        .collect();

    // Score desc, mention id asc for determinism
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.mention_id.cmp(&b.mention_id))
    });
    scored.truncate(cfg.top_mentions);

    let last_mentioned_at = mentions.iter().map(|m| m.posted_at).max().unwrap_or(0);

    let activity_level = classify_activity(&scored, last_mentioned_at, now, cfg);

    let metrics = Metrics {
        mention_count,
        total_upvotes,
        source_diversity,
        recent_mention_count,
        top_mentions: scored,
    };

    (metrics, activity_level, last_mentioned_at)
}

/// `trending` when every retained top mention is within the recent window,
/// `active` when the newest mention is within the active window, else
/// `normal`.
fn classify_activity(
    top: &[TopMention],
    last_mentioned_at: i64,
    now: i64,
    cfg: &ScoringConfig,
) -> ActivityLevel {
    if !top.is_empty() && top.iter().all(|t| t.age_days <= cfg.recent_window_days as f64) {
        return ActivityLevel::Trending;
    }
    if last_mentioned_at > 0 && now - last_mentioned_at <= cfg.active_window_days * SECS_PER_DAY {
        return ActivityLevel::Active;
    }
    ActivityLevel::Normal
}

/// Recompute and persist metrics for one connection. Versioned write with
/// bounded retry; every retry re-reads both the row and the mention set, so
/// concurrent appenders cannot lose each other's evidence.
pub async fn recompute_connection_metrics(
    pool: &SqlitePool,
    cfg: &ScoringConfig,
    connection_id: &str,
    write_retries: u32,
) -> EngineResult<Metrics> {
    let now = Utc::now().timestamp();

    for _ in 0..write_retries {
        let conn = store::fetch_connection(pool, connection_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Connection not found: {}", connection_id))?;
        let mentions = store::mentions_for_connection(pool, connection_id).await?;
        let (metrics, activity, last_mentioned_at) = compute_metrics(&mentions, now, cfg);

        let written = store::write_connection_metrics(
            pool,
            connection_id,
            &metrics,
            activity,
            last_mentioned_at,
            conn.version,
        )
        .await?;

        if written {
            return Ok(metrics);
        }
        warn!(connection_id, "metrics write conflicted, retrying");
    }

    Err(EngineError::ConflictRetryExhausted {
        name: connection_id.to_string(),
        entity_type: "connection".to_string(),
        attempts: write_retries,
    })
}

/// Replay the mention store over every connection. Returns the number of
/// connections rebuilt.
pub async fn rebuild_all(
    pool: &SqlitePool,
    cfg: &ScoringConfig,
    write_retries: u32,
) -> Result<u64> {
    let ids = store::all_connection_ids(pool).await?;
    let mut rebuilt = 0u64;
    for id in &ids {
        recompute_connection_metrics(pool, cfg, id, write_retries).await?;
        rebuilt += 1;
    }
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;

    fn make_mention(id: &str, source: &str, author: &str, upvotes: i64, age_days: i64, now: i64) -> Mention {
        Mention {
            id: id.to_string(),
            connection_id: "c1".to_string(),
            source_type: SourceType::Post,
            source_id: format!("src-{}", id),
            source_url: None,
            source: source.to_string(),
            excerpt: None,
            author: author.to_string(),
            upvotes,
            posted_at: now - age_days * SECS_PER_DAY,
            processed_at: now,
        }
    }

    fn cfg() -> ScoringConfig {
        ScoringConfig::default()
    }

    #[test]
    fn test_counts_and_upvote_sum() {
        let now = 1_700_000_000;
        let mentions = vec![
            make_mention("m1", "austinfood", "alice", 50, 1, now),
            make_mention("m2", "austinfood", "bob", 10, 30, now),
        ];
        let (m, _, last) = compute_metrics(&mentions, now, &cfg());
        assert_eq!(m.mention_count, 2);
        assert_eq!(m.total_upvotes, 60);
        assert_eq!(last, now - SECS_PER_DAY);
    }

    #[test]
    fn test_source_diversity_counts_new_pairs_only() {
        let now = 1_700_000_000;
        let mentions = vec![
            make_mention("m1", "austinfood", "alice", 5, 1, now),
            make_mention("m2", "austinfood", "alice", 5, 2, now),
            make_mention("m3", "texasbbq", "alice", 5, 3, now),
        ];
        let (m, _, _) = compute_metrics(&mentions, now, &cfg());
        assert_eq!(m.source_diversity, 2);
    }

    #[test]
    fn test_top_mentions_capped_at_five_by_score() {
        let now = 1_700_000_000;
        let mentions: Vec<Mention> = (0..8)
            .map(|i| make_mention(&format!("m{}", i), "r", &format!("a{}", i), 10 * (i + 1), 1, now))
            .collect();
        let (m, _, _) = compute_metrics(&mentions, now, &cfg());
        assert_eq!(m.top_mentions.len(), 5);
        // Highest-upvote mention (same age) leads
        assert_eq!(m.top_mentions[0].mention_id, "m7");
        // Slice is sorted descending
        for w in m.top_mentions.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
    }

    #[test]
    fn test_idempotent_recompute() {
        let now = 1_700_000_000;
        let mentions = vec![
            make_mention("m1", "r", "a", 50, 1, now),
            make_mention("m2", "r", "b", 10, 40, now),
        ];
        let (m1, a1, l1) = compute_metrics(&mentions, now, &cfg());
        let (m2, a2, l2) = compute_metrics(&mentions, now, &cfg());
        assert_eq!(serde_json::to_string(&m1).unwrap(), serde_json::to_string(&m2).unwrap());
        assert_eq!(a1, a2);
        assert_eq!(l1, l2);
    }

    #[test]
    fn test_activity_trending_when_all_top_recent() {
        let now = 1_700_000_000;
        let mentions = vec![
            make_mention("m1", "r", "a", 20, 5, now),
            make_mention("m2", "r", "b", 15, 20, now),
        ];
        let (_, activity, _) = compute_metrics(&mentions, now, &cfg());
        assert_eq!(activity, ActivityLevel::Trending);
    }

    #[test]
    fn test_activity_active_when_newest_within_week() {
        let now = 1_700_000_000;
        // One old high-upvote mention keeps the top slice from being all
        // recent, but the newest mention is 3 days old.
        let mentions = vec![
            make_mention("m1", "r", "a", 500, 90, now),
            make_mention("m2", "r", "b", 1, 3, now),
        ];
        let (_, activity, _) = compute_metrics(&mentions, now, &cfg());
        assert_eq!(activity, ActivityLevel::Active);
    }

    #[test]
    fn test_activity_normal_when_stale() {
        let now = 1_700_000_000;
        let mentions = vec![make_mention("m1", "r", "a", 100, 90, now)];
        let (_, activity, _) = compute_metrics(&mentions, now, &cfg());
        assert_eq!(activity, ActivityLevel::Normal);
    }

    #[test]
    fn test_empty_mentions() {
        let (m, activity, last) = compute_metrics(&[], 1_700_000_000, &cfg());
        assert_eq!(m.mention_count, 0);
        assert_eq!(activity, ActivityLevel::Normal);
        assert_eq!(last, 0);
    }

    #[test]
    fn test_recent_mention_count_window() {
        let now = 1_700_000_000;
        let mentions = vec![
            make_mention("m1", "r", "a", 5, 10, now),
            make_mention("m2", "r", "b", 5, 29, now),
            make_mention("m3", "r", "c", 5, 45, now),
        ];
        let (m, _, _) = compute_metrics(&mentions, now, &cfg());
        assert_eq!(m.recent_mention_count, 2);
    }
}
