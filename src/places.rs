//! Operational-metadata collaborator: open/closed status for restaurants.
//!
//! Two providers behind one trait:
//! - **[`StaticPlacesProvider`]** — evaluates a daily open window stored in
//!   the restaurant's own metadata. No I/O; the default.
//! - **[`HttpPlacesProvider`]** — calls an external service with a
//!   per-request timeout and bounded exponential backoff, surfacing
//!   [`EngineError::UpstreamTimeout`] when exhausted.
//!
//! The query engine maps any provider failure to `OpenStatus::Unknown`;
//! ranking never blocks on this collaborator.

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::config::PlacesConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{Entity, OpenStatus};

#[async_trait]
pub trait PlacesProvider: Send + Sync {
    /// Current open status for a restaurant entity.
    async fn lookup(&self, restaurant: &Entity) -> EngineResult<OpenStatus>;
}

/// Instantiate the provider selected by config.
pub fn create_provider(cfg: &PlacesConfig) -> EngineResult<Box<dyn PlacesProvider>> {
    match cfg.provider.as_str() {
        "static" => Ok(Box::new(StaticPlacesProvider)),
        "http" => Ok(Box::new(HttpPlacesProvider::new(cfg)?)),
        other => Err(EngineError::Other(anyhow::anyhow!(
            "Unknown places provider: {}",
            other
        ))),
    }
}

// ============ Static provider ============

/// Reads a daily `hours: {"open": "HH:MM", "close": "HH:MM"}` window from
/// the restaurant's metadata. Missing or unparseable hours are `Unknown`.
pub struct StaticPlacesProvider;

#[async_trait]
impl PlacesProvider for StaticPlacesProvider {
    async fn lookup(&self, restaurant: &Entity) -> EngineResult<OpenStatus> {
        let Some(hours) = restaurant.metadata.get("hours") else {
            return Ok(OpenStatus::Unknown);
        };
        let (Some(open), Some(close)) = (
            hours.get("open").and_then(|v| v.as_str()),
            hours.get("close").and_then(|v| v.as_str()),
        ) else {
            return Ok(OpenStatus::Unknown);
        };
        let (Some(open_min), Some(close_min)) = (parse_hhmm(open), parse_hhmm(close)) else {
            return Ok(OpenStatus::Unknown);
        };

        let now = Utc::now();
        let minute_of_day = (now.hour() * 60 + now.minute()) as i64;
        Ok(open_window_status(minute_of_day, open_min, close_min))
    }
}

fn parse_hhmm(s: &str) -> Option<i64> {
    let (h, m) = s.split_once(':')?;
    let h: i64 = h.parse().ok()?;
    let m: i64 = m.parse().ok()?;
    if !(0..24).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    Some(h * 60 + m)
}

/// Open-window check supporting windows that cross midnight.
fn open_window_status(minute_of_day: i64, open_min: i64, close_min: i64) -> OpenStatus {
    let open = if open_min <= close_min {
        minute_of_day >= open_min && minute_of_day < close_min
    } else {
        minute_of_day >= open_min || minute_of_day < close_min
    };
    if open {
        OpenStatus::Open
    } else {
        OpenStatus::Closed
    }
}

// ============ HTTP provider ============

#[derive(Debug, Deserialize)]
struct PlacesResponse {
    open_now: Option<bool>,
}

/// Calls `GET {endpoint}/places/{id}` with a request timeout. Retries
/// timeouts and 5xx with exponential backoff (1s, 2s, 4s, ...) up to the
/// configured attempt count.
pub struct HttpPlacesProvider {
    client: reqwest::Client,
    endpoint: String,
    max_retries: u32,
}

impl HttpPlacesProvider {
    pub fn new(cfg: &PlacesConfig) -> EngineResult<Self> {
        let endpoint = cfg
            .endpoint
            .clone()
            .ok_or_else(|| EngineError::Other(anyhow::anyhow!("places.endpoint not set")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| EngineError::Other(e.into()))?;
        Ok(Self {
            client,
            endpoint,
            max_retries: cfg.max_retries.max(1),
        })
    }
}

#[async_trait]
impl PlacesProvider for HttpPlacesProvider {
    async fn lookup(&self, restaurant: &Entity) -> EngineResult<OpenStatus> {
        let url = format!("{}/places/{}", self.endpoint.trim_end_matches('/'), restaurant.id);

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(backoff).await;
            }

            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body: PlacesResponse =
                        resp.json().await.map_err(|e| EngineError::Other(e.into()))?;
                    return Ok(match body.open_now {
                        Some(true) => OpenStatus::Open,
                        Some(false) => OpenStatus::Closed,
                        None => OpenStatus::Unknown,
                    });
                }
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(restaurant_id = %restaurant.id, status = %resp.status(), "places lookup server error, retrying");
                }
                Ok(resp) => {
                    // Client error: not retryable, but must not fail ranking.
                    warn!(restaurant_id = %restaurant.id, status = %resp.status(), "places lookup client error");
                    return Ok(OpenStatus::Unknown);
                }
                Err(err) if err.is_timeout() || err.is_connect() => {
                    warn!(restaurant_id = %restaurant.id, "places lookup timed out, retrying");
                }
                Err(err) => return Err(EngineError::Other(err.into())),
            }
        }

        Err(EngineError::UpstreamTimeout {
            context: format!("places lookup for {}", restaurant.id),
            attempts: self.max_retries,
        })
    }
}
