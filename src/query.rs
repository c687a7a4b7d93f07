//! Query template engine: five fixed retrieval templates over the stores.
//!
//! The incoming query is pre-classified upstream; this module only selects
//! and executes the matching template. Geographic and open-now filters are
//! applied to the candidate restaurant set *before* ranking, since ranking
//! is the expensive step. All orderings are deterministic: score desc, then
//! mention_count desc, then id asc.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::cache::TieredCache;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ClassifiedQuery, Connection, DishResult, Entity, EntityType, Evidence, GeoBounds, OpenStatus,
    QueryType, RankedResult, RestaurantResult,
};
use crate::normalize::normalize;
use crate::places::PlacesProvider;
use crate::store;

/// Run the `query` command: read a classified query from a JSON file,
/// execute it, and print the ranked result as JSON.
pub async fn run_query(cfg: &Config, path: &std::path::Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read query file {}: {}", path.display(), e))?;
    let query: ClassifiedQuery = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse query file: {}", e))?;

    let pool = crate::db::connect(cfg).await?;
    let places = crate::places::create_provider(&cfg.places)?;
    let cache = TieredCache::new(&cfg.cache);

    let result = execute_cached(&pool, cfg, &cache, places.as_ref(), &query).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    pool.close().await;
    Ok(())
}

/// Execute a classified query against the stores. Unresolvable entity
/// references produce an empty result set, never an error to the caller.
pub async fn execute(
    pool: &SqlitePool,
    cfg: &Config,
    places: &dyn PlacesProvider,
    query: &ClassifiedQuery,
) -> Result<RankedResult> {
    let (result, _) = execute_inner(pool, cfg, places, query, None).await?;
    Ok(result)
}

/// Template execution proper. Returns the resolved references alongside the
/// result so the caching wrapper can tag entries with everything the query
/// depends on, not just what made it into the output. When a cache is
/// supplied, entity lookups go through the static tier.
async fn execute_inner(
    pool: &SqlitePool,
    cfg: &Config,
    places: &dyn PlacesProvider,
    query: &ClassifiedQuery,
    cache: Option<&TieredCache>,
) -> Result<(RankedResult, ResolvedRefs)> {
    let refs = resolve_references(pool, query).await?;

    if let Err(err) = check_references(query, &refs) {
        debug!(query_type = ?query.query_type, "{}, returning empty", err);
        return Ok((empty_result(query.query_type), refs));
    }

    let all = store::all_connections(pool).await?;
    let restaurants_with_attr = if refs.restaurant_attribute_ids.is_empty() {
        HashSet::new()
    } else {
        restaurants_with_attributes(pool, &refs.restaurant_attribute_ids).await?
    };

    // Template selection: which dish connections are candidates.
    let matching: Vec<&Connection> = all
        .iter()
        .filter(|c| c.dish_id.is_some())
        .filter(|c| match query.query_type {
            QueryType::DishSpecific | QueryType::CategorySpecific => {
                let dish_hit = c
                    .dish_id
                    .as_deref()
                    .is_some_and(|d| refs.dish_or_category_ids.contains(d));
                let cat_hit = c
                    .categories
                    .iter()
                    .any(|cat| refs.dish_or_category_ids.contains(cat));
                dish_hit || cat_hit
            }
            QueryType::VenueSpecific => refs.restaurant_ids.contains(&c.restaurant_id),
            QueryType::AttributeSpecific => {
                let attr_hit = c
                    .dish_attributes
                    .iter()
                    .any(|a| refs.dish_attribute_ids.contains(a));
                attr_hit || restaurants_with_attr.contains(&c.restaurant_id)
            }
            QueryType::Broad => true,
        })
        .collect();

    // Filter-first: restrict the candidate restaurant set before ranking.
    let candidate_restaurant_ids: HashSet<&str> =
        matching.iter().map(|c| c.restaurant_id.as_str()).collect();
    let mut restaurants: HashMap<String, Entity> = HashMap::new();
    for rid in &candidate_restaurant_ids {
        if let Some(e) = fetch_entity_cached(pool, cache, rid).await? {
            restaurants.insert(e.id.clone(), e);
        }
    }

    let mut open_status: HashMap<String, OpenStatus> = HashMap::new();
    let mut allowed: HashSet<String> = HashSet::new();
    for (rid, entity) in &restaurants {
        if let Some(bounds) = &query.filters.geographic_bounds {
            if !within_bounds(entity, bounds) {
                continue;
            }
        }
        if query.filters.open_now {
            let status = lookup_status(places, entity).await;
            open_status.insert(rid.clone(), status);
            // Unknown status must not exclude: the collaborator failing is
            // not evidence the restaurant is closed.
            if status == OpenStatus::Closed {
                continue;
            }
        }
        allowed.insert(rid.clone());
    }

    let mut survivors: Vec<&Connection> = matching
        .into_iter()
        .filter(|c| allowed.contains(&c.restaurant_id))
        .collect();

    // Rank (the cheap part is already done: everything left is in-bounds).
    survivors.sort_by(|a, b| {
        b.quality_score
            .partial_cmp(&a.quality_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.metrics.mention_count.cmp(&a.metrics.mention_count))
            .then(a.id.cmp(&b.id))
    });

    // Backfill open status for displayed restaurants when the filter didn't
    // already require a lookup.
    if !query.filters.open_now {
        for rid in &allowed {
            if let Some(entity) = restaurants.get(rid) {
                let status = lookup_status(places, entity).await;
                open_status.insert(rid.clone(), status);
            }
        }
    }

    let mut dish_names: HashMap<String, String> = HashMap::new();
    let mut dish_results = Vec::with_capacity(survivors.len());
    for conn in &survivors {
        dish_results
            .push(build_dish_result(pool, cache, conn, &restaurants, &mut dish_names, &open_status).await?);
    }

    let restaurant_results = match query.query_type {
        QueryType::DishSpecific | QueryType::VenueSpecific => None,
        QueryType::CategorySpecific | QueryType::AttributeSpecific | QueryType::Broad => Some(
            rank_restaurants(cfg, &survivors, &all, &refs, &restaurants, &allowed, &open_status),
        ),
    };

    let result = RankedResult {
        query_type: query.query_type,
        dish_results,
        restaurant_results,
    };
    Ok((result, refs))
}

/// Require at least one resolved reference for the reference-driven
/// templates. The error never leaves the engine; callers get an empty
/// result instead.
fn check_references(query: &ClassifiedQuery, refs: &ResolvedRefs) -> EngineResult<()> {
    let ok = match query.query_type {
        QueryType::DishSpecific | QueryType::CategorySpecific => {
            !refs.dish_or_category_ids.is_empty()
        }
        QueryType::VenueSpecific => !refs.restaurant_ids.is_empty(),
        QueryType::AttributeSpecific => {
            !refs.dish_attribute_ids.is_empty() || !refs.restaurant_attribute_ids.is_empty()
        }
        QueryType::Broad => true,
    };
    if ok {
        Ok(())
    } else {
        let mut names: Vec<&str> = Vec::new();
        names.extend(query.entities.restaurants.iter().map(|s| s.as_str()));
        names.extend(query.entities.dish_or_categories.iter().map(|s| s.as_str()));
        names.extend(query.entities.attributes.iter().map(|s| s.as_str()));
        Err(EngineError::Query(names.join(", ")))
    }
}

/// Read-through wrapper: exact-query tier, then the per-caller recent tier,
/// then the engine. A freshly computed result lands in both applicable
/// tiers, tagged with the entity ids it depends on.
pub async fn execute_cached(
    pool: &SqlitePool,
    cfg: &Config,
    cache: &TieredCache,
    places: &dyn PlacesProvider,
    query: &ClassifiedQuery,
) -> Result<RankedResult> {
    let key = query_cache_key(query);
    if let Some(value) = cache.get(&key) {
        if let Ok(result) = serde_json::from_value::<RankedResult>(value) {
            return Ok(result);
        }
    }
    if let Some(caller) = &query.caller {
        let user_key = user_cache_key(caller, &key);
        if let Some(value) = cache.get(&user_key) {
            if let Ok(result) = serde_json::from_value::<RankedResult>(value) {
                return Ok(result);
            }
        }
    }

    let (result, refs) = execute_inner(pool, cfg, places, query, Some(cache)).await?;

    // Tag with everything the query depends on: the entities its references
    // resolved to, markers for references that resolved to nothing (so a
    // cached empty result dies when the entity appears), and the entities in
    // the output.
    let mut tags: HashSet<String> = HashSet::new();
    tags.extend(refs.restaurant_ids.iter().cloned());
    tags.extend(refs.dish_or_category_ids.iter().cloned());
    tags.extend(refs.dish_attribute_ids.iter().cloned());
    tags.extend(refs.restaurant_attribute_ids.iter().cloned());
    tags.extend(refs.unresolved_tags.iter().cloned());
    for d in &result.dish_results {
        tags.insert(d.restaurant_id.clone());
        if let Some(dish) = &d.dish_id {
            tags.insert(dish.clone());
        }
    }
    if let Some(rs) = &result.restaurant_results {
        for r in rs {
            tags.insert(r.restaurant_id.clone());
        }
    }
    let tags: Vec<String> = tags.into_iter().collect();

    let value = serde_json::to_value(&result)?;
    cache.put(&key, value.clone(), tags.clone());
    if let Some(caller) = &query.caller {
        cache.put(&user_cache_key(caller, &key), value, tags);
    }

    Ok(result)
}

/// Exact-query cache key: hash of the query shape, entities, and filters.
/// Caller identity deliberately excluded so identical queries share entries.
pub fn query_cache_key(query: &ClassifiedQuery) -> String {
    let canonical = serde_json::json!({
        "query_type": query.query_type,
        "entities": query.entities,
        "filters": query.filters,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("query:{:x}", hasher.finalize())
}

fn user_cache_key(caller: &str, query_key: &str) -> String {
    format!("user:{}:recent:{}", caller, query_key.trim_start_matches("query:"))
}

/// Invalidation tag for a query reference that resolved to nothing. When a
/// matching entity (or alias) later appears, ingestion drops every entry
/// carrying this tag.
pub(crate) fn unresolved_reference_tag(entity_type: EntityType, normalized: &str) -> String {
    format!("unresolved:{}:{}", entity_type.as_str(), normalized)
}

fn empty_result(query_type: QueryType) -> RankedResult {
    let restaurant_results = match query_type {
        QueryType::DishSpecific | QueryType::VenueSpecific => None,
        _ => Some(Vec::new()),
    };
    RankedResult {
        query_type,
        dish_results: Vec::new(),
        restaurant_results,
    }
}

// ============ Reference resolution ============

#[derive(Debug, Default)]
struct ResolvedRefs {
    restaurant_ids: HashSet<String>,
    dish_or_category_ids: HashSet<String>,
    dish_attribute_ids: HashSet<String>,
    restaurant_attribute_ids: HashSet<String>,
    /// Tags for references that resolved to nothing; see
    /// [`unresolved_reference_tag`].
    unresolved_tags: Vec<String>,
}

/// Resolve query entity references by exact name or alias only; queries
/// never create entities and never fuzzy-match. Misses are recorded so
/// cached results can be dropped when the entity shows up.
async fn resolve_references(pool: &SqlitePool, query: &ClassifiedQuery) -> Result<ResolvedRefs> {
    let mut refs = ResolvedRefs::default();

    for name in &query.entities.restaurants {
        match resolve_reference(pool, name, EntityType::Restaurant).await? {
            Some(id) => {
                refs.restaurant_ids.insert(id);
            }
            None => refs.record_miss(name, EntityType::Restaurant),
        }
    }
    for name in &query.entities.dish_or_categories {
        match resolve_reference(pool, name, EntityType::DishOrCategory).await? {
            Some(id) => {
                refs.dish_or_category_ids.insert(id);
            }
            None => refs.record_miss(name, EntityType::DishOrCategory),
        }
    }
    for name in &query.entities.attributes {
        match resolve_reference(pool, name, EntityType::DishAttribute).await? {
            Some(id) => {
                refs.dish_attribute_ids.insert(id);
            }
            None => refs.record_miss(name, EntityType::DishAttribute),
        }
        match resolve_reference(pool, name, EntityType::RestaurantAttribute).await? {
            Some(id) => {
                refs.restaurant_attribute_ids.insert(id);
            }
            None => refs.record_miss(name, EntityType::RestaurantAttribute),
        }
    }

    Ok(refs)
}

impl ResolvedRefs {
    fn record_miss(&mut self, raw: &str, entity_type: EntityType) {
        let norm = normalize(raw);
        if !norm.is_empty() {
            self.unresolved_tags.push(unresolved_reference_tag(entity_type, &norm));
        }
    }
}

async fn resolve_reference(
    pool: &SqlitePool,
    name: &str,
    entity_type: EntityType,
) -> Result<Option<String>> {
    let norm = normalize(name);
    if norm.is_empty() {
        return Ok(None);
    }
    if let Some(entity) = store::find_entity(pool, &norm, entity_type).await? {
        return Ok(Some(entity.id));
    }
    let peers = store::entities_of_type(pool, entity_type).await?;
    if let Some(entity) = peers.iter().find(|e| e.aliases.iter().any(|a| a == &norm)) {
        return Ok(Some(entity.id.clone()));
    }
    debug!(name = %norm, entity_type = entity_type.as_str(), "query reference did not resolve");
    Ok(None)
}

/// Restaurant ids whose metadata attribute list intersects the given set.
async fn restaurants_with_attributes(
    pool: &SqlitePool,
    attr_ids: &HashSet<String>,
) -> Result<HashSet<String>> {
    let restaurants = store::entities_of_type(pool, EntityType::Restaurant).await?;
    let mut hits = HashSet::new();
    for r in restaurants {
        let has = r
            .metadata
            .get("restaurant_attributes")
            .and_then(|v| v.as_array())
            .is_some_and(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .any(|id| attr_ids.contains(id))
            });
        if has {
            hits.insert(r.id);
        }
    }
    Ok(hits)
}

// ============ Filters ============

/// A restaurant without stored coordinates cannot be verified in-bounds, so
/// a bounds filter excludes it.
fn within_bounds(entity: &Entity, bounds: &GeoBounds) -> bool {
    match entity.location() {
        Some((lat, lng)) => bounds.contains(lat, lng),
        None => false,
    }
}

async fn lookup_status(places: &dyn PlacesProvider, entity: &Entity) -> OpenStatus {
    match places.lookup(entity).await {
        Ok(status) => status,
        Err(err) => {
            debug!(restaurant_id = %entity.id, "places lookup failed, status unknown: {}", err);
            OpenStatus::Unknown
        }
    }
}

// ============ Result assembly ============

/// Entity lookup through the static cache tier. Entries live under
/// `static:entity:{id}`, tagged with the id so an explicit metadata change
/// can drop them; score churn leaves them alone.
async fn fetch_entity_cached(
    pool: &SqlitePool,
    cache: Option<&TieredCache>,
    id: &str,
) -> Result<Option<Entity>> {
    let Some(cache) = cache else {
        return store::fetch_entity(pool, id).await;
    };

    let key = format!("static:entity:{}", id);
    if let Some(value) = cache.get(&key) {
        if let Ok(entity) = serde_json::from_value::<Entity>(value) {
            return Ok(Some(entity));
        }
    }
    let entity = store::fetch_entity(pool, id).await?;
    if let Some(e) = &entity {
        cache.put(&key, serde_json::to_value(e)?, vec![id.to_string()]);
    }
    Ok(entity)
}

async fn build_dish_result(
    pool: &SqlitePool,
    cache: Option<&TieredCache>,
    conn: &Connection,
    restaurants: &HashMap<String, Entity>,
    dish_names: &mut HashMap<String, String>,
    open_status: &HashMap<String, OpenStatus>,
) -> Result<DishResult> {
    let restaurant_name = restaurants
        .get(&conn.restaurant_id)
        .map(|e| e.name.clone())
        .unwrap_or_default();

    let dish_name = match &conn.dish_id {
        Some(id) => {
            if !dish_names.contains_key(id) {
                if let Some(e) = fetch_entity_cached(pool, cache, id).await? {
                    dish_names.insert(id.clone(), e.name);
                }
            }
            dish_names.get(id).cloned()
        }
        None => None,
    };

    let top_evidence = match conn.metrics.top_mentions.first() {
        Some(top) => store::fetch_mention(pool, &top.mention_id)
            .await?
            .map(|m| Evidence {
                excerpt: m.excerpt,
                source_url: m.source_url,
                author: m.author,
                upvotes: top.upvotes,
                age_days: top.age_days,
            }),
        None => None,
    };

    Ok(DishResult {
        connection_id: conn.id.clone(),
        restaurant_id: conn.restaurant_id.clone(),
        restaurant_name,
        dish_id: conn.dish_id.clone(),
        dish_name,
        quality_score: conn.quality_score,
        mention_count: conn.metrics.mention_count,
        activity_level: conn.activity_level,
        open_status: open_status
            .get(&conn.restaurant_id)
            .copied()
            .unwrap_or(OpenStatus::Unknown),
        top_evidence,
    })
}

/// Contextual restaurant ranking for the dual-list templates.
///
/// `category_performance_score` is the mention-count-weighted mean of the
/// restaurant's matching connection scores, boosted by direct
/// restaurant-level mentions of the category. The global restaurant quality
/// score is not consulted.
fn rank_restaurants(
    cfg: &Config,
    matching: &[&Connection],
    all: &[Connection],
    refs: &ResolvedRefs,
    restaurants: &HashMap<String, Entity>,
    allowed: &HashSet<String>,
    open_status: &HashMap<String, OpenStatus>,
) -> Vec<RestaurantResult> {
    struct Acc {
        weighted_sum: f64,
        weight: f64,
        count: i64,
    }

    let mut by_restaurant: HashMap<&str, Acc> = HashMap::new();
    for conn in matching {
        let weight = conn.metrics.mention_count.max(1) as f64;
        let acc = by_restaurant.entry(conn.restaurant_id.as_str()).or_insert(Acc {
            weighted_sum: 0.0,
            weight: 0.0,
            count: 0,
        });
        acc.weighted_sum += conn.quality_score * weight;
        acc.weight += weight;
        acc.count += 1;
    }

    // Direct restaurant-level mentions: restaurant-only connections whose
    // category tags intersect the query's resolved categories/attributes.
    let mut direct_boost: HashMap<&str, f64> = HashMap::new();
    for conn in all.iter().filter(|c| c.dish_id.is_none()) {
        if !allowed.contains(&conn.restaurant_id) {
            continue;
        }
        let relevant = refs.dish_or_category_ids.is_empty()
            || conn
                .categories
                .iter()
                .any(|c| refs.dish_or_category_ids.contains(c));
        if relevant {
            let boost = direct_boost.entry(conn.restaurant_id.as_str()).or_insert(0.0);
            *boost = boost.max(conn.quality_score);
        }
    }

    let mut results: Vec<RestaurantResult> = by_restaurant
        .into_iter()
        .map(|(rid, acc)| {
            let mean = if acc.weight > 0.0 {
                acc.weighted_sum / acc.weight
            } else {
                0.0
            };
            let boost = direct_boost.get(rid).copied().unwrap_or(0.0);
            let score = (mean + cfg.scoring.direct_boost_weight * boost)
                .clamp(0.0, cfg.scoring.max_score);
            RestaurantResult {
                restaurant_id: rid.to_string(),
                name: restaurants.get(rid).map(|e| e.name.clone()).unwrap_or_default(),
                category_performance_score: score,
                matching_connections: acc.count,
                open_status: open_status.get(rid).copied().unwrap_or(OpenStatus::Unknown),
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.category_performance_score
            .partial_cmp(&a.category_performance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.restaurant_id.cmp(&b.restaurant_id))
    });
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueryEntities, QueryFilters};

    fn query(query_type: QueryType) -> ClassifiedQuery {
        ClassifiedQuery {
            query_type,
            entities: QueryEntities {
                restaurants: vec!["Franklin BBQ".into()],
                dish_or_categories: vec!["brisket".into()],
                attributes: vec![],
            },
            filters: QueryFilters::default(),
            caller: None,
        }
    }

    #[test]
    fn test_cache_key_deterministic() {
        let q = query(QueryType::DishSpecific);
        assert_eq!(query_cache_key(&q), query_cache_key(&q.clone()));
    }

    #[test]
    fn test_cache_key_ignores_caller() {
        let mut a = query(QueryType::DishSpecific);
        let mut b = query(QueryType::DishSpecific);
        a.caller = Some("alice".into());
        b.caller = Some("bob".into());
        assert_eq!(query_cache_key(&a), query_cache_key(&b));
    }

    #[test]
    fn test_cache_key_varies_with_shape() {
        let a = query(QueryType::DishSpecific);
        let b = query(QueryType::CategorySpecific);
        assert_ne!(query_cache_key(&a), query_cache_key(&b));
    }

    #[test]
    fn test_user_cache_key_namespace() {
        let key = user_cache_key("alice", "query:abc123");
        assert_eq!(key, "user:alice:recent:abc123");
    }

    #[test]
    fn test_missing_references_rejected_per_template() {
        let empty = ResolvedRefs::default();
        let err = check_references(&query(QueryType::DishSpecific), &empty).unwrap_err();
        assert!(matches!(err, EngineError::Query(_)));
        assert!(err.to_string().contains("brisket"));

        // Broad queries need no references.
        assert!(check_references(&query(QueryType::Broad), &empty).is_ok());

        let mut refs = ResolvedRefs::default();
        refs.dish_or_category_ids.insert("d1".into());
        assert!(check_references(&query(QueryType::DishSpecific), &refs).is_ok());
    }

    #[test]
    fn test_record_miss_normalizes_and_skips_empty() {
        let mut refs = ResolvedRefs::default();
        refs.record_miss("The Brisket", EntityType::DishOrCategory);
        refs.record_miss("   ", EntityType::Restaurant);
        assert_eq!(
            refs.unresolved_tags,
            vec!["unresolved:dish_or_category:brisket".to_string()]
        );
    }

    #[test]
    fn test_bounds_exclude_missing_coordinates() {
        let entity = Entity {
            id: "r1".into(),
            name: "franklin bbq".into(),
            entity_type: EntityType::Restaurant,
            aliases: vec![],
            metadata: serde_json::json!({}),
            quality_score: 9.0,
            updated_at: 0,
        };
        let bounds = GeoBounds {
            min_lat: 30.0,
            max_lat: 31.0,
            min_lng: -98.0,
            max_lng: -97.0,
        };
        assert!(!within_bounds(&entity, &bounds));
    }

    #[test]
    fn test_bounds_inclusive() {
        let entity = Entity {
            id: "r1".into(),
            name: "franklin bbq".into(),
            entity_type: EntityType::Restaurant,
            aliases: vec![],
            metadata: serde_json::json!({"location": {"lat": 30.5, "lng": -97.5}}),
            quality_score: 9.0,
            updated_at: 0,
        };
        let bounds = GeoBounds {
            min_lat: 30.0,
            max_lat: 31.0,
            min_lng: -98.0,
            max_lng: -97.0,
        };
        assert!(within_bounds(&entity, &bounds));
    }
}
