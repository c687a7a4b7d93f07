//! End-to-end engine tests against a temporary SQLite database: ingestion
//! idempotency, entity/connection dedup, scoring behavior, query templates,
//! and cache invalidation.

use sqlx::SqlitePool;
use tempfile::TempDir;

use tastegraph::cache::TieredCache;
use tastegraph::config::Config;
use tastegraph::models::{
    ClassifiedQuery, EntityType, ExtractedMention, GeoBounds, QueryEntities, QueryFilters,
    QueryType, SourceType,
};
use tastegraph::places::StaticPlacesProvider;
use tastegraph::{db, ingest, metrics, migrate, query, store};

const SECS_PER_DAY: i64 = 86_400;

async fn setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let cfg = Config::with_db_path(tmp.path().join("taste.sqlite"));
    let pool = db::connect(&cfg).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    (tmp, cfg, pool)
}

fn mention(
    restaurant: &str,
    dish: Option<&str>,
    source_id: &str,
    upvotes: i64,
    age_days: i64,
) -> ExtractedMention {
    let now = chrono::Utc::now().timestamp();
    ExtractedMention {
        restaurant: restaurant.to_string(),
        dish: dish.map(|d| d.to_string()),
        categories: vec![],
        dish_attributes: vec![],
        restaurant_attributes: vec![],
        is_menu_item: dish.is_some(),
        general_praise: dish.is_none(),
        source_type: SourceType::Comment,
        source_id: source_id.to_string(),
        source: "austinfood".to_string(),
        source_url: Some(format!("https://example.com/{}", source_id)),
        excerpt: Some("the brisket here is unreal".to_string()),
        author: format!("author-{}", source_id),
        upvotes,
        posted_at: now - age_days * SECS_PER_DAY,
    }
}

async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_case_and_article_variants_converge() {
    let (_tmp, cfg, pool) = setup().await;

    // "Franklin BBQ"/"brisket" then "franklin bbq"/"the brisket" must land
    // on one restaurant, one dish, one connection with summed evidence.
    let batch = vec![
        mention("Franklin BBQ", Some("brisket"), "s1", 50, 1),
        mention("franklin bbq", Some("the brisket"), "s2", 10, 30),
    ];
    let report = ingest::ingest_batch(&pool, &cfg, None, batch).await.unwrap();
    assert_eq!(report.mentions_inserted, 2);
    assert!(report.parked.is_empty());

    let restaurants = store::entities_of_type(&pool, EntityType::Restaurant).await.unwrap();
    assert_eq!(restaurants.len(), 1);
    assert_eq!(restaurants[0].name, "franklin bbq");

    let dishes = store::entities_of_type(&pool, EntityType::DishOrCategory).await.unwrap();
    assert_eq!(dishes.len(), 1);
    assert_eq!(dishes[0].name, "brisket");

    assert_eq!(count(&pool, "connections").await, 1);
    let conns = store::connections_for_restaurant(&pool, &restaurants[0].id).await.unwrap();
    assert_eq!(conns[0].metrics.mention_count, 2);
    assert_eq!(conns[0].metrics.total_upvotes, 60);
}

#[tokio::test]
async fn test_reingestion_is_idempotent() {
    let (_tmp, cfg, pool) = setup().await;

    let batch = vec![
        mention("Franklin BBQ", Some("brisket"), "s1", 50, 1),
        mention("Ramen Tatsuya", Some("tonkotsu"), "s2", 20, 3),
    ];
    ingest::ingest_batch(&pool, &cfg, None, batch.clone()).await.unwrap();

    let entities_before = count(&pool, "entities").await;
    let mentions_before = count(&pool, "mentions").await;

    let second = ingest::ingest_batch(&pool, &cfg, None, batch).await.unwrap();
    assert_eq!(second.mentions_inserted, 0);
    assert_eq!(second.mentions_deduplicated, 2);

    assert_eq!(count(&pool, "entities").await, entities_before);
    assert_eq!(count(&pool, "mentions").await, mentions_before);

    let restaurants = store::entities_of_type(&pool, EntityType::Restaurant).await.unwrap();
    let franklin = restaurants.iter().find(|r| r.name == "franklin bbq").unwrap();
    let conns = store::connections_for_restaurant(&pool, &franklin.id).await.unwrap();
    assert_eq!(conns[0].metrics.mention_count, 1);
}

#[tokio::test]
async fn test_parallel_workers_create_one_entity() {
    let (_tmp, mut cfg, pool) = setup().await;
    // Force every mention into its own sub-batch so workers race on the
    // same (name, type) key.
    cfg.ingest.batch_size = 1;
    cfg.ingest.workers = 4;

    let batch: Vec<ExtractedMention> = (0..8)
        .map(|i| mention("Joe's Tacos", Some("al pastor"), &format!("s{}", i), 5, 1))
        .collect();
    let report = ingest::ingest_batch(&pool, &cfg, None, batch).await.unwrap();
    assert_eq!(report.mentions_inserted, 8);
    assert!(report.parked.is_empty());

    let restaurants = store::entities_of_type(&pool, EntityType::Restaurant).await.unwrap();
    assert_eq!(restaurants.len(), 1);
    assert_eq!(count(&pool, "connections").await, 1);

    let conns = store::connections_for_restaurant(&pool, &restaurants[0].id).await.unwrap();
    assert_eq!(conns[0].metrics.mention_count, 8);
}

#[tokio::test]
async fn test_attribute_sets_split_connections() {
    let (_tmp, cfg, pool) = setup().await;

    let mut spicy = mention("Joe's Tacos", Some("al pastor"), "s1", 5, 1);
    spicy.dish_attributes = vec!["spicy".to_string()];
    let plain = mention("Joe's Tacos", Some("al pastor"), "s2", 5, 1);
    let mut spicy_again = mention("Joe's Tacos", Some("al pastor"), "s3", 5, 1);
    spicy_again.dish_attributes = vec!["Spicy".to_string()];

    ingest::ingest_batch(&pool, &cfg, None, vec![spicy, plain, spicy_again])
        .await
        .unwrap();

    // (restaurant, dish, {spicy}) and (restaurant, dish, {}) are distinct;
    // the second spicy mention reuses the first connection.
    assert_eq!(count(&pool, "connections").await, 2);
}

#[tokio::test]
async fn test_fuzzy_surface_becomes_alias() {
    let (_tmp, cfg, pool) = setup().await;

    ingest::ingest_batch(
        &pool,
        &cfg,
        None,
        vec![mention("Ramen Tatsuya", Some("tonkotsu"), "s1", 10, 1)],
    )
    .await
    .unwrap();
    ingest::ingest_batch(
        &pool,
        &cfg,
        None,
        vec![mention("Ramen Tatsuya ", Some("tonkotsu"), "s2", 10, 1)],
    )
    .await
    .unwrap();
    // One-character typo inside the fuzzy band
    ingest::ingest_batch(
        &pool,
        &cfg,
        None,
        vec![mention("Ramen Tatsuyo", Some("tonkotsu"), "s3", 10, 1)],
    )
    .await
    .unwrap();

    let restaurants = store::entities_of_type(&pool, EntityType::Restaurant).await.unwrap();
    assert_eq!(restaurants.len(), 1);
    assert!(restaurants[0].aliases.contains(&"ramen tatsuyo".to_string()));
}

#[tokio::test]
async fn test_restaurant_only_mention_uses_sentinel_connection() {
    let (_tmp, cfg, pool) = setup().await;

    let mut praise = mention("Franklin BBQ", None, "s1", 40, 2);
    praise.categories = vec!["bbq".to_string()];
    ingest::ingest_batch(&pool, &cfg, None, vec![praise]).await.unwrap();

    let restaurants = store::entities_of_type(&pool, EntityType::Restaurant).await.unwrap();
    assert_eq!(restaurants.len(), 1);
    let conns = store::connections_for_restaurant(&pool, &restaurants[0].id).await.unwrap();
    assert_eq!(conns.len(), 1);
    assert!(conns[0].dish_id.is_none());
    assert_eq!(conns[0].metrics.mention_count, 1);

    // The category tag resolved to an entity; no dish entity was synthesized
    // beyond it.
    let dishes = store::entities_of_type(&pool, EntityType::DishOrCategory).await.unwrap();
    assert_eq!(dishes.len(), 1);
    assert_eq!(dishes[0].name, "bbq");
}

#[tokio::test]
async fn test_new_positive_mention_never_lowers_connection_score() {
    let (_tmp, cfg, pool) = setup().await;

    ingest::ingest_batch(
        &pool,
        &cfg,
        None,
        vec![mention("Franklin BBQ", Some("brisket"), "s1", 50, 1)],
    )
    .await
    .unwrap();

    let restaurants = store::entities_of_type(&pool, EntityType::Restaurant).await.unwrap();
    let conns = store::connections_for_restaurant(&pool, &restaurants[0].id).await.unwrap();
    let before = conns[0].quality_score;
    assert!(before > 0.0);

    ingest::ingest_batch(
        &pool,
        &cfg,
        None,
        vec![mention("Franklin BBQ", Some("brisket"), "s2", 25, 2)],
    )
    .await
    .unwrap();

    let conns = store::connections_for_restaurant(&pool, &restaurants[0].id).await.unwrap();
    assert!(conns[0].quality_score >= before);
}

#[tokio::test]
async fn test_metrics_rebuild_matches_incremental_state() {
    let (_tmp, cfg, pool) = setup().await;

    ingest::ingest_batch(
        &pool,
        &cfg,
        None,
        vec![
            mention("Franklin BBQ", Some("brisket"), "s1", 50, 1),
            mention("Franklin BBQ", Some("brisket"), "s2", 10, 30),
            mention("Franklin BBQ", Some("ribs"), "s3", 5, 10),
        ],
    )
    .await
    .unwrap();

    let before: Vec<(String, String)> =
        sqlx::query_as("SELECT id, metrics_json FROM connections ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();

    metrics::rebuild_all(&pool, &cfg.scoring, cfg.ingest.write_retries)
        .await
        .unwrap();

    let after: Vec<(String, String)> =
        sqlx::query_as("SELECT id, metrics_json FROM connections ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();

    for ((id_a, json_a), (id_b, json_b)) in before.iter().zip(after.iter()) {
        assert_eq!(id_a, id_b);
        let a: serde_json::Value = serde_json::from_str(json_a).unwrap();
        let b: serde_json::Value = serde_json::from_str(json_b).unwrap();
        assert_eq!(a["mention_count"], b["mention_count"]);
        assert_eq!(a["total_upvotes"], b["total_upvotes"]);
        assert_eq!(a["source_diversity"], b["source_diversity"]);
    }
}

async fn place_restaurant(pool: &SqlitePool, name: &str, lat: f64, lng: f64) {
    let restaurants = store::entities_of_type(pool, EntityType::Restaurant).await.unwrap();
    let r = restaurants.iter().find(|r| r.name == name).unwrap();
    let metadata = serde_json::json!({"location": {"lat": lat, "lng": lng}});
    store::set_entity_metadata(pool, &r.id, &metadata).await.unwrap();
}

#[tokio::test]
async fn test_bounds_filter_applies_before_ranking() {
    let (_tmp, cfg, pool) = setup().await;

    // The out-of-bounds restaurant gets far stronger evidence.
    ingest::ingest_batch(
        &pool,
        &cfg,
        None,
        vec![
            mention("Ramen Tatsuya", Some("ramen"), "s1", 500, 1),
            mention("Daruma Ramen", Some("ramen"), "s2", 5, 1),
        ],
    )
    .await
    .unwrap();

    place_restaurant(&pool, "ramen tatsuya", 40.0, -74.0).await;
    place_restaurant(&pool, "daruma ramen", 30.3, -97.7).await;

    let q = ClassifiedQuery {
        query_type: QueryType::CategorySpecific,
        entities: QueryEntities {
            restaurants: vec![],
            dish_or_categories: vec!["ramen".to_string()],
            attributes: vec![],
        },
        filters: QueryFilters {
            geographic_bounds: Some(GeoBounds {
                min_lat: 30.0,
                max_lat: 31.0,
                min_lng: -98.0,
                max_lng: -97.0,
            }),
            open_now: false,
        },
        caller: None,
    };

    let result = query::execute(&pool, &cfg, &StaticPlacesProvider, &q).await.unwrap();

    assert_eq!(result.dish_results.len(), 1);
    assert_eq!(result.dish_results[0].restaurant_name, "daruma ramen");

    let restaurant_results = result.restaurant_results.unwrap();
    assert_eq!(restaurant_results.len(), 1);
    assert_eq!(restaurant_results[0].name, "daruma ramen");
}

#[tokio::test]
async fn test_unknown_query_reference_returns_empty() {
    let (_tmp, cfg, pool) = setup().await;

    ingest::ingest_batch(
        &pool,
        &cfg,
        None,
        vec![mention("Franklin BBQ", Some("brisket"), "s1", 50, 1)],
    )
    .await
    .unwrap();

    let q = ClassifiedQuery {
        query_type: QueryType::DishSpecific,
        entities: QueryEntities {
            restaurants: vec![],
            dish_or_categories: vec!["sushi".to_string()],
            attributes: vec![],
        },
        filters: QueryFilters::default(),
        caller: None,
    };

    let result = query::execute(&pool, &cfg, &StaticPlacesProvider, &q).await.unwrap();
    assert!(result.dish_results.is_empty());
    assert!(result.restaurant_results.is_none());
}

#[tokio::test]
async fn test_dish_results_ordered_and_carry_evidence() {
    let (_tmp, cfg, pool) = setup().await;

    ingest::ingest_batch(
        &pool,
        &cfg,
        None,
        vec![
            mention("Franklin BBQ", Some("brisket"), "s1", 200, 1),
            mention("Terry Black's", Some("brisket"), "s2", 3, 40),
        ],
    )
    .await
    .unwrap();

    let q = ClassifiedQuery {
        query_type: QueryType::DishSpecific,
        entities: QueryEntities {
            restaurants: vec![],
            dish_or_categories: vec!["brisket".to_string()],
            attributes: vec![],
        },
        filters: QueryFilters::default(),
        caller: None,
    };

    let result = query::execute(&pool, &cfg, &StaticPlacesProvider, &q).await.unwrap();
    assert_eq!(result.dish_results.len(), 2);
    assert_eq!(result.dish_results[0].restaurant_name, "franklin bbq");
    assert!(result.dish_results[0].quality_score >= result.dish_results[1].quality_score);

    let evidence = result.dish_results[0].top_evidence.as_ref().unwrap();
    assert_eq!(evidence.upvotes, 200);
    assert_eq!(evidence.author, "author-s1");
    assert!(evidence.source_url.as_deref().unwrap().contains("s1"));
}

#[tokio::test]
async fn test_cache_read_through_and_score_invalidation() {
    let (_tmp, cfg, pool) = setup().await;
    let cache = TieredCache::new(&cfg.cache);

    ingest::ingest_batch(
        &pool,
        &cfg,
        Some(&cache),
        vec![mention("Franklin BBQ", Some("brisket"), "s1", 50, 1)],
    )
    .await
    .unwrap();

    let q = ClassifiedQuery {
        query_type: QueryType::DishSpecific,
        entities: QueryEntities {
            restaurants: vec![],
            dish_or_categories: vec!["brisket".to_string()],
            attributes: vec![],
        },
        filters: QueryFilters::default(),
        caller: Some("alice".to_string()),
    };

    query::execute_cached(&pool, &cfg, &cache, &StaticPlacesProvider, &q)
        .await
        .unwrap();

    let key = query::query_cache_key(&q);
    assert!(cache.get(&key).is_some());

    // New evidence for the same restaurant must drop the cached query.
    ingest::ingest_batch(
        &pool,
        &cfg,
        Some(&cache),
        vec![mention("Franklin BBQ", Some("brisket"), "s2", 10, 1)],
    )
    .await
    .unwrap();
    assert!(cache.get(&key).is_none());
}

#[tokio::test]
async fn test_cached_empty_result_dropped_when_entity_appears() {
    let (_tmp, cfg, pool) = setup().await;
    let cache = TieredCache::new(&cfg.cache);

    let q = ClassifiedQuery {
        query_type: QueryType::DishSpecific,
        entities: QueryEntities {
            restaurants: vec![],
            dish_or_categories: vec!["brisket".to_string()],
            attributes: vec![],
        },
        filters: QueryFilters::default(),
        caller: None,
    };

    // Nothing ingested yet: the empty result gets cached.
    let first = query::execute_cached(&pool, &cfg, &cache, &StaticPlacesProvider, &q)
        .await
        .unwrap();
    assert!(first.dish_results.is_empty());

    // Evidence for the queried dish arrives; the cached empty must die with it.
    ingest::ingest_batch(
        &pool,
        &cfg,
        Some(&cache),
        vec![mention("Franklin BBQ", Some("brisket"), "s1", 50, 1)],
    )
    .await
    .unwrap();

    let second = query::execute_cached(&pool, &cfg, &cache, &StaticPlacesProvider, &q)
        .await
        .unwrap();
    assert_eq!(second.dish_results.len(), 1);
    assert_eq!(second.dish_results[0].restaurant_name, "franklin bbq");
}

#[tokio::test]
async fn test_cached_result_tagged_with_queried_restaurant() {
    let (_tmp, cfg, pool) = setup().await;
    let cache = TieredCache::new(&cfg.cache);

    // Restaurant exists but has only restaurant-level evidence, so the
    // venue query returns no dish results and nothing lands in the output.
    ingest::ingest_batch(
        &pool,
        &cfg,
        Some(&cache),
        vec![mention("Franklin BBQ", None, "s1", 40, 2)],
    )
    .await
    .unwrap();

    let q = ClassifiedQuery {
        query_type: QueryType::VenueSpecific,
        entities: QueryEntities {
            restaurants: vec!["Franklin BBQ".to_string()],
            dish_or_categories: vec![],
            attributes: vec![],
        },
        filters: QueryFilters::default(),
        caller: None,
    };

    let first = query::execute_cached(&pool, &cfg, &cache, &StaticPlacesProvider, &q)
        .await
        .unwrap();
    assert!(first.dish_results.is_empty());

    // The entry must be tagged with the restaurant the query resolved to,
    // so new dish evidence for it drops the stale empty.
    ingest::ingest_batch(
        &pool,
        &cfg,
        Some(&cache),
        vec![mention("Franklin BBQ", Some("brisket"), "s2", 50, 1)],
    )
    .await
    .unwrap();

    let second = query::execute_cached(&pool, &cfg, &cache, &StaticPlacesProvider, &q)
        .await
        .unwrap();
    assert_eq!(second.dish_results.len(), 1);
}

#[tokio::test]
async fn test_static_tier_survives_scores_falls_on_metadata_change() {
    let (_tmp, cfg, pool) = setup().await;
    let cache = TieredCache::new(&cfg.cache);

    ingest::ingest_batch(
        &pool,
        &cfg,
        Some(&cache),
        vec![mention("Franklin BBQ", Some("brisket"), "s1", 50, 1)],
    )
    .await
    .unwrap();

    let q = ClassifiedQuery {
        query_type: QueryType::DishSpecific,
        entities: QueryEntities {
            restaurants: vec![],
            dish_or_categories: vec!["brisket".to_string()],
            attributes: vec![],
        },
        filters: QueryFilters::default(),
        caller: None,
    };
    query::execute_cached(&pool, &cfg, &cache, &StaticPlacesProvider, &q)
        .await
        .unwrap();

    let restaurants = store::entities_of_type(&pool, EntityType::Restaurant).await.unwrap();
    let static_key = format!("static:entity:{}", restaurants[0].id);
    assert!(cache.get(&static_key).is_some());

    // Plain score churn drops the query tier but spares the static entry.
    ingest::ingest_batch(
        &pool,
        &cfg,
        Some(&cache),
        vec![mention("Franklin BBQ", Some("brisket"), "s2", 10, 1)],
    )
    .await
    .unwrap();
    assert!(cache.get(&static_key).is_some());

    // A metadata change (new restaurant attribute) drops it.
    let mut with_attr = mention("Franklin BBQ", Some("brisket"), "s3", 5, 1);
    with_attr.restaurant_attributes = vec!["patio".to_string()];
    ingest::ingest_batch(&pool, &cfg, Some(&cache), vec![with_attr])
        .await
        .unwrap();
    assert!(cache.get(&static_key).is_none());
}
