use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent; also used by tests against a
/// fresh pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Canonical entities. (name, entity_type) is the dedup key that the
    // insert-if-absent creation path relies on.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            aliases TEXT NOT NULL DEFAULT '[]',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            quality_score REAL NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            UNIQUE(name, entity_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Restaurant→dish edges. dish_id '' marks a restaurant-only connection;
    // a NULL would make the uniqueness constraint unenforceable (SQLite
    // treats NULLs as distinct in unique indexes). attr_key is the sorted
    // dish_attribute id list joined by ','.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            restaurant_id TEXT NOT NULL,
            dish_id TEXT NOT NULL DEFAULT '',
            attr_key TEXT NOT NULL DEFAULT '',
            categories TEXT NOT NULL DEFAULT '[]',
            dish_attributes TEXT NOT NULL DEFAULT '[]',
            is_menu_item INTEGER NOT NULL DEFAULT 0,
            metrics_json TEXT NOT NULL DEFAULT '{}',
            quality_score REAL NOT NULL DEFAULT 0,
            activity_level TEXT NOT NULL DEFAULT 'normal',
            last_mentioned_at INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            UNIQUE(restaurant_id, dish_id, attr_key),
            FOREIGN KEY (restaurant_id) REFERENCES entities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only evidence log. Immutable rows; replayable to rebuild
    // connection metrics.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mentions (
            id TEXT PRIMARY KEY,
            connection_id TEXT NOT NULL,
            source_type TEXT NOT NULL,
            source_id TEXT NOT NULL,
            source_url TEXT,
            source TEXT NOT NULL DEFAULT '',
            excerpt TEXT,
            author TEXT NOT NULL DEFAULT '',
            upvotes INTEGER NOT NULL DEFAULT 0,
            posted_at INTEGER NOT NULL,
            processed_at INTEGER NOT NULL,
            UNIQUE(source_type, source_id, connection_id),
            FOREIGN KEY (connection_id) REFERENCES connections(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the query templates and aggregation paths
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_connections_restaurant ON connections(restaurant_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_connections_dish ON connections(dish_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_connections_score ON connections(quality_score DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_mentions_connection ON mentions(connection_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
