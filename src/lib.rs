//! # tastegraph
//!
//! An entity resolution and ranking engine for community food-discussion
//! mentions.
//!
//! tastegraph ingests structured mention records extracted upstream from
//! community discussion text, resolves them onto a deduplicated graph of
//! restaurants, dishes, categories, and attributes, and maintains
//! time-decayed quality scores so that classified queries return ranked,
//! evidence-backed results quickly.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Extraction  │──▶│   Resolver    │──▶│    SQLite     │
//! │  batches    │   │ Metrics/Score│   │ ent/conn/ment │
//! └─────────────┘   └──────────────┘   └──────┬────────┘
//!                                             │
//!                               ┌─────────────┴──────┐
//!                               ▼                    ▼
//!                        ┌────────────┐       ┌────────────┐
//!                        │   Query    │◀──────│   Cache    │
//!                        │ templates  │       │  3 tiers   │
//!                        └────────────┘       └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! taste init                        # create database
//! taste ingest batch.json           # resolve an extraction batch
//! taste query query.json            # run a classified query
//! taste rebuild-metrics             # replay mentions into fresh metrics
//! taste stats                       # store overview
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`normalize`] | Surface-string normalization |
//! | [`resolver`] | Entity resolution and connection upsert |
//! | [`metrics`] | Connection metric aggregation |
//! | [`score`] | Quality score computation |
//! | [`query`] | Query template engine |
//! | [`cache`] | Multi-tier TTL cache |
//! | [`places`] | Operational-metadata collaborator |
//! | [`ingest`] | Batch ingestion orchestration |
//! | [`store`] | Entity/connection/mention storage access |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod places;
pub mod query;
pub mod resolver;
pub mod score;
pub mod stats;
pub mod store;
