//! # Trialscope
//!
//! A retrieval and deduplication core for clinical-trial catalyst
//! extraction.
//!
//! Trialscope ingests SEC filings and press releases per tracked company,
//! maintains one semantic index per entity backed by SQLite, and drives
//! an LLM extraction pipeline whose output is deduplicated into a stable
//! set of structured catalyst events. An ingestion ledger makes document
//! indexing idempotent across runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────┐   ┌───────────────┐
//! │ Documents │──▶│  Index Manager    │──▶│ SQLite bundle │
//! │  (JSONL)  │   │ ledger+chunk+embed│   │  per entity   │
//! └───────────┘   └──────────────────┘   └──────┬────────┘
//!                                               │
//!                        ┌──────────────────────┤
//!                        ▼                      ▼
//!                  ┌──────────┐        ┌────────────────┐
//!                  │  search   │        │ extract→dedup  │
//!                  │ (context) │        │   → export     │
//!                  └──────────┘        └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! trialscope ingest PRAX --file filings.jsonl --kind 10-Q
//! trialscope search PRAX "relutrigine topline readout"
//! trialscope extract PRAX "clinical trial catalysts" --output events.json
//! trialscope stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`normalize`] | Source text normalization |
//! | [`chunk`] | Text splitting |
//! | [`ledger`] | Idempotent ingestion ledger |
//! | [`index`] | Per-entity semantic index manager |
//! | [`context`] | Context-window expansion of search hits |
//! | [`passage`] | Prompt passage assembly |
//! | [`extract`] | LLM extraction and validation pipeline |
//! | [`dedup`] | Identity-key event deduplication |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`sources`] | JSONL document input |
//! | [`export`] | Event export |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod export;
pub mod extract;
pub mod index;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod passage;
pub mod sources;
