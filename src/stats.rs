//! Database statistics and health overview.
//!
//! Provides a quick summary of what's stored: entity counts by type,
//! connection activity breakdown, mention totals, and the current top
//! restaurants. Used by `taste stats` to give confidence that ingestion and
//! scoring are working as expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_entities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
        .fetch_one(&pool)
        .await?;
    let total_connections: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM connections")
        .fetch_one(&pool)
        .await?;
    let total_mentions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mentions")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("tastegraph — Database Stats");
    println!("===========================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Entities:     {}", total_entities);
    println!("  Connections:  {}", total_connections);
    println!("  Mentions:     {}", total_mentions);

    // Per-type entity breakdown
    let type_rows = sqlx::query(
        "SELECT entity_type, COUNT(*) AS n FROM entities GROUP BY entity_type ORDER BY n DESC",
    )
    .fetch_all(&pool)
    .await?;

    if !type_rows.is_empty() {
        println!();
        println!("  By entity type:");
        for row in &type_rows {
            let ty: String = row.get("entity_type");
            let n: i64 = row.get("n");
            println!("    {:<24} {:>6}", ty, n);
        }
    }

    // Activity breakdown
    let activity_rows = sqlx::query(
        "SELECT activity_level, COUNT(*) AS n FROM connections GROUP BY activity_level ORDER BY n DESC",
    )
    .fetch_all(&pool)
    .await?;

    if !activity_rows.is_empty() {
        println!();
        println!("  By activity level:");
        for row in &activity_rows {
            let level: String = row.get("activity_level");
            let n: i64 = row.get("n");
            println!("    {:<24} {:>6}", level, n);
        }
    }

    // Top restaurants by stored quality score
    let top_rows = sqlx::query(
        r#"
        SELECT name, quality_score FROM entities
        WHERE entity_type = 'restaurant' AND quality_score > 0
        ORDER BY quality_score DESC, name
        LIMIT 10
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if !top_rows.is_empty() {
        println!();
        println!("  Top restaurants:");
        for row in &top_rows {
            let name: String = row.get("name");
            let score: f64 = row.get("quality_score");
            println!("    {:<32} {:>6.2}", name, score);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
