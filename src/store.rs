//! Storage access for the entity, connection, and mention tables.
//!
//! Two coordination primitives live here and nowhere else:
//!
//! - **Insert-if-absent** for entities and connections: an atomic
//!   `INSERT ... ON CONFLICT DO NOTHING` followed by a re-read, retried a
//!   bounded number of times. Two workers racing to create the same
//!   `(name, type)` key converge on one row.
//! - **Versioned read-modify-write** for connection mutation: read the row
//!   and its `version`, write with `WHERE version = ?`, retry on conflict.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    ActivityLevel, Connection, Entity, EntityType, Mention, Metrics, SourceType,
};

/// Sentinel `dish_id` for restaurant-only connections. SQLite unique indexes
/// treat NULLs as distinct, so the empty string keeps
/// `(restaurant_id, dish_id, attr_key)` enforceable.
pub const NO_DISH: &str = "";

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

// ============ Entities ============

fn entity_from_row(row: &SqliteRow) -> Result<Entity> {
    let type_str: String = row.get("entity_type");
    let entity_type = EntityType::parse(&type_str)
        .ok_or_else(|| anyhow::anyhow!("Unknown entity type in store: {}", type_str))?;
    let aliases: String = row.get("aliases");
    let metadata: String = row.get("metadata_json");

    Ok(Entity {
        id: row.get("id"),
        name: row.get("name"),
        entity_type,
        aliases: string_list(&aliases),
        metadata: serde_json::from_str(&metadata)
            .unwrap_or_else(|_| serde_json::json!({})),
        quality_score: row.get("quality_score"),
        updated_at: row.get("updated_at"),
    })
}

/// Atomic insert-if-absent by `(name, entity_type)`.
///
/// Returns the entity id and whether this call created the row. A writer that
/// loses the race re-reads and reuses the competing writer's row; exhausting
/// the retry budget surfaces [`EngineError::ConflictRetryExhausted`].
pub async fn get_or_create_entity(
    pool: &SqlitePool,
    name: &str,
    entity_type: EntityType,
    max_attempts: u32,
) -> EngineResult<(String, bool)> {
    for _ in 0..max_attempts {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM entities WHERE name = ? AND entity_type = ?")
                .bind(name)
                .bind(entity_type.as_str())
                .fetch_optional(pool)
                .await?;

        if let Some(id) = existing {
            return Ok((id, false));
        }

        let id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO entities (id, name, entity_type, aliases, metadata_json, quality_score, updated_at)
            VALUES (?, ?, ?, '[]', '{}', 0, ?)
            ON CONFLICT(name, entity_type) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(entity_type.as_str())
        .bind(now_ts())
        .execute(pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok((id, true));
        }
        // Lost the race; loop re-reads the winner's row.
    }

    Err(EngineError::ConflictRetryExhausted {
        name: name.to_string(),
        entity_type: entity_type.as_str().to_string(),
        attempts: max_attempts,
    })
}

pub async fn find_entity(
    pool: &SqlitePool,
    name: &str,
    entity_type: EntityType,
) -> Result<Option<Entity>> {
    let row = sqlx::query("SELECT * FROM entities WHERE name = ? AND entity_type = ?")
        .bind(name)
        .bind(entity_type.as_str())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(entity_from_row).transpose()
}

pub async fn fetch_entity(pool: &SqlitePool, id: &str) -> Result<Option<Entity>> {
    let row = sqlx::query("SELECT * FROM entities WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(entity_from_row).transpose()
}

pub async fn entities_of_type(pool: &SqlitePool, entity_type: EntityType) -> Result<Vec<Entity>> {
    let rows = sqlx::query("SELECT * FROM entities WHERE entity_type = ? ORDER BY name")
        .bind(entity_type.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter().map(entity_from_row).collect()
}

/// Append an alias if not already present. Single-statement JSON update so
/// concurrent writers can only grow the list.
pub async fn add_alias(pool: &SqlitePool, entity_id: &str, alias: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE entities SET
            aliases = CASE
                WHEN EXISTS (SELECT 1 FROM json_each(aliases) WHERE value = ?2) THEN aliases
                ELSE json_insert(aliases, '$[#]', ?2)
            END,
            updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(entity_id)
    .bind(alias)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(())
}

/// Append an attribute entity id to a restaurant's metadata reference list,
/// never duplicating.
pub async fn add_restaurant_attribute(
    pool: &SqlitePool,
    restaurant_id: &str,
    attribute_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE entities SET
            metadata_json = CASE
                WHEN json_extract(metadata_json, '$.restaurant_attributes') IS NULL
                    THEN json_set(metadata_json, '$.restaurant_attributes', json_array(?2))
                WHEN EXISTS (
                    SELECT 1 FROM json_each(metadata_json, '$.restaurant_attributes')
                    WHERE value = ?2
                ) THEN metadata_json
                ELSE json_insert(metadata_json, '$.restaurant_attributes[#]', ?2)
            END,
            updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(restaurant_id)
    .bind(attribute_id)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_entity_score(pool: &SqlitePool, id: &str, score: f64) -> Result<()> {
    sqlx::query("UPDATE entities SET quality_score = ?, updated_at = ? WHERE id = ?")
        .bind(score)
        .bind(now_ts())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Replace an entity's metadata wholesale. Callers holding a cache must
/// drop the entity's static-tier entry afterwards
/// (`TieredCache::invalidate_static`); score writes need no such step.
pub async fn set_entity_metadata(
    pool: &SqlitePool,
    id: &str,
    metadata: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE entities SET metadata_json = ?, updated_at = ? WHERE id = ?")
        .bind(metadata.to_string())
        .bind(now_ts())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Connections ============

/// Canonical key component for a connection's attribute set: sorted ids
/// joined by ','.
pub fn attr_key(attr_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = attr_ids.iter().map(|s| s.as_str()).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

fn connection_from_row(row: &SqliteRow) -> Connection {
    let dish_id: String = row.get("dish_id");
    let categories: String = row.get("categories");
    let dish_attributes: String = row.get("dish_attributes");
    let metrics_json: String = row.get("metrics_json");
    let activity: String = row.get("activity_level");
    let is_menu_item: i64 = row.get("is_menu_item");

    Connection {
        id: row.get("id"),
        restaurant_id: row.get("restaurant_id"),
        dish_id: if dish_id.is_empty() { None } else { Some(dish_id) },
        categories: string_list(&categories),
        dish_attributes: string_list(&dish_attributes),
        is_menu_item: is_menu_item != 0,
        metrics: serde_json::from_str(&metrics_json).unwrap_or_default(),
        quality_score: row.get("quality_score"),
        activity_level: ActivityLevel::parse(&activity),
        last_mentioned_at: row.get("last_mentioned_at"),
        version: row.get("version"),
        updated_at: row.get("updated_at"),
    }
}

/// Insert-if-absent keyed on `(restaurant_id, dish_id, attr_key)`. Same
/// race-convergence contract as [`get_or_create_entity`].
pub async fn get_or_create_connection(
    pool: &SqlitePool,
    restaurant_id: &str,
    dish_id: Option<&str>,
    attr_ids: &[String],
    is_menu_item: bool,
    max_attempts: u32,
) -> EngineResult<String> {
    let dish = dish_id.unwrap_or(NO_DISH);
    let key = attr_key(attr_ids);
    let attrs_json = serde_json::to_string(&{
        let mut sorted: Vec<&String> = attr_ids.iter().collect();
        sorted.sort_unstable();
        sorted
    })
    .unwrap_or_else(|_| "[]".to_string());

    for _ in 0..max_attempts {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM connections WHERE restaurant_id = ? AND dish_id = ? AND attr_key = ?",
        )
        .bind(restaurant_id)
        .bind(dish)
        .bind(&key)
        .fetch_optional(pool)
        .await?;

        if let Some(id) = existing {
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO connections
                (id, restaurant_id, dish_id, attr_key, categories, dish_attributes,
                 is_menu_item, metrics_json, quality_score, activity_level,
                 last_mentioned_at, version, updated_at)
            VALUES (?, ?, ?, ?, '[]', ?, ?, '{}', 0, 'normal', 0, 0, ?)
            ON CONFLICT(restaurant_id, dish_id, attr_key) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(restaurant_id)
        .bind(dish)
        .bind(&key)
        .bind(&attrs_json)
        .bind(is_menu_item as i64)
        .bind(now_ts())
        .execute(pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(id);
        }
    }

    Err(EngineError::ConflictRetryExhausted {
        name: format!("{}/{}/{}", restaurant_id, dish, key),
        entity_type: "connection".to_string(),
        attempts: max_attempts,
    })
}

/// Union categories/attributes into a connection's tag sets and latch
/// `is_menu_item`. Tags are never removed. Optimistic: retried on version
/// conflict up to `max_attempts`.
pub async fn union_connection_tags(
    pool: &SqlitePool,
    connection_id: &str,
    categories: &[String],
    dish_attributes: &[String],
    is_menu_item: bool,
    max_attempts: u32,
) -> EngineResult<()> {
    for _ in 0..max_attempts {
        let conn = fetch_connection(pool, connection_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Connection vanished: {}", connection_id))?;

        let mut cats = conn.categories.clone();
        for c in categories {
            if !cats.contains(c) {
                cats.push(c.clone());
            }
        }
        let mut attrs = conn.dish_attributes.clone();
        for a in dish_attributes {
            if !attrs.contains(a) {
                attrs.push(a.clone());
            }
        }
        let menu = conn.is_menu_item || is_menu_item;

        if cats == conn.categories && attrs == conn.dish_attributes && menu == conn.is_menu_item {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE connections SET
                categories = ?, dish_attributes = ?, is_menu_item = ?,
                version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(serde_json::to_string(&cats).unwrap_or_else(|_| "[]".to_string()))
        .bind(serde_json::to_string(&attrs).unwrap_or_else(|_| "[]".to_string()))
        .bind(menu as i64)
        .bind(now_ts())
        .bind(connection_id)
        .bind(conn.version)
        .execute(pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
    }

    Err(EngineError::ConflictRetryExhausted {
        name: connection_id.to_string(),
        entity_type: "connection".to_string(),
        attempts: max_attempts,
    })
}

pub async fn fetch_connection(pool: &SqlitePool, id: &str) -> Result<Option<Connection>> {
    let row = sqlx::query("SELECT * FROM connections WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(connection_from_row))
}

pub async fn connections_for_restaurant(
    pool: &SqlitePool,
    restaurant_id: &str,
) -> Result<Vec<Connection>> {
    let rows = sqlx::query("SELECT * FROM connections WHERE restaurant_id = ? ORDER BY id")
        .bind(restaurant_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(connection_from_row).collect())
}

pub async fn connections_for_dish(pool: &SqlitePool, dish_id: &str) -> Result<Vec<Connection>> {
    let rows = sqlx::query("SELECT * FROM connections WHERE dish_id = ? ORDER BY id")
        .bind(dish_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(connection_from_row).collect())
}

pub async fn all_connections(pool: &SqlitePool) -> Result<Vec<Connection>> {
    let rows = sqlx::query("SELECT * FROM connections ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(connection_from_row).collect())
}

pub async fn all_connection_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar("SELECT id FROM connections ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Versioned metrics write. Returns false on version conflict so the caller
/// can re-read and retry.
pub async fn write_connection_metrics(
    pool: &SqlitePool,
    connection_id: &str,
    metrics: &Metrics,
    activity_level: ActivityLevel,
    last_mentioned_at: i64,
    expected_version: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE connections SET
            metrics_json = ?, activity_level = ?, last_mentioned_at = ?,
            version = version + 1, updated_at = ?
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(serde_json::to_string(metrics)?)
    .bind(activity_level.as_str())
    .bind(last_mentioned_at)
    .bind(now_ts())
    .bind(connection_id)
    .bind(expected_version)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn set_connection_score(pool: &SqlitePool, id: &str, score: f64) -> Result<()> {
    sqlx::query("UPDATE connections SET quality_score = ?, updated_at = ? WHERE id = ?")
        .bind(score)
        .bind(now_ts())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Mentions ============

fn mention_from_row(row: &SqliteRow) -> Mention {
    let source_type: String = row.get("source_type");
    Mention {
        id: row.get("id"),
        connection_id: row.get("connection_id"),
        source_type: SourceType::parse(&source_type),
        source_id: row.get("source_id"),
        source_url: row.get("source_url"),
        source: row.get("source"),
        excerpt: row.get("excerpt"),
        author: row.get("author"),
        upvotes: row.get("upvotes"),
        posted_at: row.get("posted_at"),
        processed_at: row.get("processed_at"),
    }
}

/// Idempotent mention insert. Returns false when the
/// `(source_type, source_id, connection_id)` row already exists.
pub async fn insert_mention(pool: &SqlitePool, mention: &Mention) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO mentions
            (id, connection_id, source_type, source_id, source_url, source,
             excerpt, author, upvotes, posted_at, processed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_type, source_id, connection_id) DO NOTHING
        "#,
    )
    .bind(&mention.id)
    .bind(&mention.connection_id)
    .bind(mention.source_type.as_str())
    .bind(&mention.source_id)
    .bind(&mention.source_url)
    .bind(&mention.source)
    .bind(&mention.excerpt)
    .bind(&mention.author)
    .bind(mention.upvotes)
    .bind(mention.posted_at)
    .bind(mention.processed_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn fetch_mention(pool: &SqlitePool, id: &str) -> Result<Option<Mention>> {
    let row = sqlx::query("SELECT * FROM mentions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(mention_from_row))
}

pub async fn mentions_for_connection(
    pool: &SqlitePool,
    connection_id: &str,
) -> Result<Vec<Mention>> {
    let rows = sqlx::query("SELECT * FROM mentions WHERE connection_id = ? ORDER BY posted_at DESC, id")
        .bind(connection_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(mention_from_row).collect())
}
