use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub places: PlacesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Pool size. WAL mode tolerates a handful of concurrent readers, but
    /// SQLite still serializes writers.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a connection waits on a locked database before erroring.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    /// Jaro-Winkler similarity above which a fuzzy candidate merges.
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f64,
    /// Lower bound of the heuristic/review band.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
    /// Maximum Levenshtein distance for a fuzzy candidate.
    #[serde(default = "default_max_edit_distance")]
    pub max_edit_distance: usize,
    /// Attempts for the insert-if-absent entity creation race.
    #[serde(default = "default_create_retries")]
    pub create_retries: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            merge_threshold: default_merge_threshold(),
            review_threshold: default_review_threshold(),
            max_edit_distance: default_max_edit_distance(),
            create_retries: default_create_retries(),
        }
    }
}

fn default_merge_threshold() -> f64 {
    0.85
}
fn default_review_threshold() -> f64 {
    0.70
}
fn default_max_edit_distance() -> usize {
    3
}
fn default_create_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    /// Exponential decay constant in days for mention scores.
    #[serde(default = "default_decay_days")]
    pub decay_days: f64,
    /// Window for `recent_mention_count` and the trending check.
    #[serde(default = "default_recent_window_days")]
    pub recent_window_days: i64,
    /// Window for the `active` level check.
    #[serde(default = "default_active_window_days")]
    pub active_window_days: i64,
    /// Top mentions retained on each connection.
    #[serde(default = "default_top_mentions")]
    pub top_mentions: usize,
    /// Connections averaged for the restaurant top-k term (3..=5).
    #[serde(default = "default_top_k_connections")]
    pub top_k_connections: usize,
    /// Weight of the owning restaurant's prior score in a connection score.
    #[serde(default = "default_restaurant_weight")]
    pub restaurant_weight: f64,
    /// Weight of the all-connections breadth term in a restaurant score.
    #[serde(default = "default_breadth_weight")]
    pub breadth_weight: f64,
    /// Weight of direct restaurant-level category mentions in the contextual
    /// restaurant ranking.
    #[serde(default = "default_direct_boost_weight")]
    pub direct_boost_weight: f64,
    /// Upper clamp for all stored scores.
    #[serde(default = "default_max_score")]
    pub max_score: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            decay_days: default_decay_days(),
            recent_window_days: default_recent_window_days(),
            active_window_days: default_active_window_days(),
            top_mentions: default_top_mentions(),
            top_k_connections: default_top_k_connections(),
            restaurant_weight: default_restaurant_weight(),
            breadth_weight: default_breadth_weight(),
            direct_boost_weight: default_direct_boost_weight(),
            max_score: default_max_score(),
        }
    }
}

fn default_decay_days() -> f64 {
    60.0
}
fn default_recent_window_days() -> i64 {
    30
}
fn default_active_window_days() -> i64 {
    7
}
fn default_top_mentions() -> usize {
    5
}
fn default_top_k_connections() -> usize {
    5
}
fn default_restaurant_weight() -> f64 {
    0.125
}
fn default_breadth_weight() -> f64 {
    0.2
}
fn default_direct_boost_weight() -> f64 {
    0.15
}
fn default_max_score() -> f64 {
    10.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_query_ttl_secs")]
    pub query_ttl_secs: u64,
    #[serde(default = "default_recent_ttl_secs")]
    pub recent_ttl_secs: u64,
    #[serde(default = "default_static_ttl_secs")]
    pub static_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            query_ttl_secs: default_query_ttl_secs(),
            recent_ttl_secs: default_recent_ttl_secs(),
            static_ttl_secs: default_static_ttl_secs(),
        }
    }
}

fn default_query_ttl_secs() -> u64 {
    3600
}
fn default_recent_ttl_secs() -> u64 {
    86_400
}
fn default_static_ttl_secs() -> u64 {
    604_800
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Parallel worker tasks per ingestion run.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Mentions per sub-batch; bounds lock contention.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts for versioned connection read-modify-write.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            write_retries: default_write_retries(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    50
}
fn default_write_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlacesConfig {
    /// `static` (hours from entity metadata) or `http`.
    #[serde(default = "default_places_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_places_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_places_max_retries")]
    pub max_retries: u32,
}

impl Default for PlacesConfig {
    fn default() -> Self {
        Self {
            provider: default_places_provider(),
            endpoint: None,
            timeout_secs: default_places_timeout_secs(),
            max_retries: default_places_max_retries(),
        }
    }
}

fn default_places_provider() -> String {
    "static".to_string()
}
fn default_places_timeout_secs() -> u64 {
    5
}
fn default_places_max_retries() -> u32 {
    3
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate db
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }

    // Validate resolver
    if !(0.0..=1.0).contains(&config.resolver.merge_threshold) {
        anyhow::bail!("resolver.merge_threshold must be in [0.0, 1.0]");
    }
    if config.resolver.review_threshold >= config.resolver.merge_threshold {
        anyhow::bail!("resolver.review_threshold must be below resolver.merge_threshold");
    }
    if config.resolver.create_retries == 0 {
        anyhow::bail!("resolver.create_retries must be >= 1");
    }

    // Validate scoring
    if config.scoring.decay_days <= 0.0 {
        anyhow::bail!("scoring.decay_days must be > 0");
    }
    if !(3..=5).contains(&config.scoring.top_k_connections) {
        anyhow::bail!("scoring.top_k_connections must be in 3..=5");
    }
    if !(0.0..=1.0).contains(&config.scoring.restaurant_weight) {
        anyhow::bail!("scoring.restaurant_weight must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.scoring.breadth_weight) {
        anyhow::bail!("scoring.breadth_weight must be in [0.0, 1.0]");
    }
    if config.scoring.max_score <= 0.0 {
        anyhow::bail!("scoring.max_score must be > 0");
    }

    // Validate ingest
    if config.ingest.workers == 0 {
        anyhow::bail!("ingest.workers must be >= 1");
    }
    if config.ingest.batch_size == 0 {
        anyhow::bail!("ingest.batch_size must be >= 1");
    }

    // Validate places
    match config.places.provider.as_str() {
        "static" => {}
        "http" => {
            if config.places.endpoint.is_none() {
                anyhow::bail!("places.endpoint required when places.provider is 'http'");
            }
        }
        other => anyhow::bail!("Unknown places provider: '{}'. Must be static or http.", other),
    }

    Ok(config)
}

impl Config {
    /// Config with defaults for everything except the database path. Used by
    /// tests and by commands that run before a config file exists.
    pub fn with_db_path(path: PathBuf) -> Self {
        Self {
            db: DbConfig {
                path,
                max_connections: default_max_connections(),
                busy_timeout_secs: default_busy_timeout_secs(),
            },
            resolver: ResolverConfig::default(),
            scoring: ScoringConfig::default(),
            cache: CacheConfig::default(),
            ingest: IngestConfig::default(),
            places: PlacesConfig::default(),
        }
    }
}
