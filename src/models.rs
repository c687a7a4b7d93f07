//! Core data models used throughout tastegraph.
//!
//! These types represent the entities, connections, and mentions that flow
//! through the resolution and ranking pipeline, plus the query/result shapes
//! exposed to callers.

use serde::{Deserialize, Serialize};

/// Canonical entity kind. `(name, entity_type)` is the deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Restaurant,
    DishOrCategory,
    DishAttribute,
    RestaurantAttribute,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Restaurant => "restaurant",
            EntityType::DishOrCategory => "dish_or_category",
            EntityType::DishAttribute => "dish_attribute",
            EntityType::RestaurantAttribute => "restaurant_attribute",
        }
    }

    pub fn parse(s: &str) -> Option<EntityType> {
        match s {
            "restaurant" => Some(EntityType::Restaurant),
            "dish_or_category" => Some(EntityType::DishOrCategory),
            "dish_attribute" => Some(EntityType::DishAttribute),
            "restaurant_attribute" => Some(EntityType::RestaurantAttribute),
            _ => None,
        }
    }
}

/// Canonical entity stored in SQLite. Never deleted; aliases only grow.
/// Serializable so the static cache tier can hold whole entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// Normalized (lowercase, article-stripped) canonical name.
    pub name: String,
    pub entity_type: EntityType,
    pub aliases: Vec<String>,
    /// Type-specific metadata: location/hours/restaurant_attributes for
    /// restaurants, empty object for attributes.
    pub metadata: serde_json::Value,
    pub quality_score: f64,
    pub updated_at: i64,
}

impl Entity {
    /// Restaurant coordinates, if present in metadata.
    pub fn location(&self) -> Option<(f64, f64)> {
        let loc = self.metadata.get("location")?;
        let lat = loc.get("lat")?.as_f64()?;
        let lng = loc.get("lng")?.as_f64()?;
        Some((lat, lng))
    }
}

/// Coarse recency classification derived from a connection's evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Trending,
    Active,
    Normal,
}

impl ActivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLevel::Trending => "trending",
            ActivityLevel::Active => "active",
            ActivityLevel::Normal => "normal",
        }
    }

    pub fn parse(s: &str) -> ActivityLevel {
        match s {
            "trending" => ActivityLevel::Trending,
            "active" => ActivityLevel::Active,
            _ => ActivityLevel::Normal,
        }
    }
}

/// One of the top-scored mentions retained on a connection's metrics blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopMention {
    pub mention_id: String,
    pub score: f64,
    pub upvotes: i64,
    pub age_days: f64,
}

/// Aggregated evidence metrics for a connection. Fully derivable from the
/// mention store, so a rebuild always converges to the same values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub mention_count: i64,
    #[serde(default)]
    pub total_upvotes: i64,
    #[serde(default)]
    pub source_diversity: i64,
    #[serde(default)]
    pub recent_mention_count: i64,
    #[serde(default)]
    pub top_mentions: Vec<TopMention>,
}

/// Restaurant→dish edge. `dish_id` is `None` for restaurant-only evidence
/// (general praise, category boosts). Unique on
/// `(restaurant_id, dish_id, sorted dish_attributes)`.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub restaurant_id: String,
    pub dish_id: Option<String>,
    pub categories: Vec<String>,
    pub dish_attributes: Vec<String>,
    pub is_menu_item: bool,
    pub metrics: Metrics,
    pub quality_score: f64,
    pub activity_level: ActivityLevel,
    pub last_mentioned_at: i64,
    pub version: i64,
    pub updated_at: i64,
}

/// Community source kind for a mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Post,
    Comment,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Post => "post",
            SourceType::Comment => "comment",
        }
    }

    pub fn parse(s: &str) -> SourceType {
        match s {
            "post" => SourceType::Post,
            _ => SourceType::Comment,
        }
    }
}

/// One piece of evidence supporting a connection. Immutable once written;
/// deduplicated by `(source_type, source_id, connection_id)`.
#[derive(Debug, Clone)]
pub struct Mention {
    pub id: String,
    pub connection_id: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub source_url: Option<String>,
    /// Community the mention came from (e.g. subreddit name).
    pub source: String,
    pub excerpt: Option<String>,
    pub author: String,
    pub upvotes: i64,
    pub posted_at: i64,
    pub processed_at: i64,
}

/// Raw extraction output consumed by the resolver. Untrusted and possibly
/// duplicated; the resolver treats it defensively.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedMention {
    #[serde(default)]
    pub restaurant: String,
    #[serde(default)]
    pub dish: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub dish_attributes: Vec<String>,
    #[serde(default)]
    pub restaurant_attributes: Vec<String>,
    #[serde(default)]
    pub is_menu_item: bool,
    /// Extractor's restaurant-only marker. Routing keys on dish absence,
    /// which subsumes this flag; it is kept for provenance and consistency
    /// checks.
    #[serde(default)]
    pub general_praise: bool,
    pub source_type: SourceType,
    pub source_id: String,
    /// Community identifier (e.g. subreddit).
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub upvotes: i64,
    pub posted_at: i64,
}

/// Per-mention output of the resolver, consumed by the metric aggregator.
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub restaurant_id: String,
    pub dish_id: Option<String>,
    pub connection_id: String,
    pub mention_id: String,
    /// False when the mention row already existed (idempotent re-ingestion).
    pub mention_inserted: bool,
}

// ============ Query input ============

/// Pre-classified query shape (classification happens upstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    DishSpecific,
    CategorySpecific,
    VenueSpecific,
    AttributeSpecific,
    Broad,
}

/// Entity references extracted from the query text by the upstream classifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryEntities {
    #[serde(default)]
    pub restaurants: Vec<String>,
    #[serde(default)]
    pub dish_or_categories: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Bounding box filter. Inclusive on all edges.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl GeoBounds {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default)]
    pub geographic_bounds: Option<GeoBounds>,
    #[serde(default)]
    pub open_now: bool,
}

/// Structured query consumed by the template engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedQuery {
    pub query_type: QueryType,
    #[serde(default)]
    pub entities: QueryEntities,
    #[serde(default)]
    pub filters: QueryFilters,
    /// Caller identity for the per-caller recent-result cache tier.
    #[serde(default)]
    pub caller: Option<String>,
}

// ============ Query output ============

/// Open/closed status from the operational-metadata collaborator. Lookup
/// failures degrade to `Unknown` rather than failing the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenStatus {
    Open,
    Closed,
    Unknown,
}

/// Attribution for the top evidence mention of a dish result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub excerpt: Option<String>,
    pub source_url: Option<String>,
    pub author: String,
    pub upvotes: i64,
    pub age_days: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DishResult {
    pub connection_id: String,
    pub restaurant_id: String,
    pub restaurant_name: String,
    pub dish_id: Option<String>,
    pub dish_name: Option<String>,
    pub quality_score: f64,
    pub mention_count: i64,
    pub activity_level: ActivityLevel,
    pub open_status: OpenStatus,
    pub top_evidence: Option<Evidence>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestaurantResult {
    pub restaurant_id: String,
    pub name: String,
    /// Contextual score for this query's category/attribute, not the global
    /// restaurant quality score.
    pub category_performance_score: f64,
    pub matching_connections: i64,
    pub open_status: OpenStatus,
}

/// Ranked output of the template engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedResult {
    pub query_type: QueryType,
    pub dish_results: Vec<DishResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restaurant_results: Option<Vec<RestaurantResult>>,
}
