//! # Shelfwise
//!
//! AI-assisted recommendations for a library catalog, streamed to the
//! client as server-sent events.
//!
//! A request is prepared entirely before the stream opens (rate limit,
//! input sanitizing, keyword extraction, catalog retrieval), so every
//! failure up to that point is an ordinary HTTP error. The stream then
//! carries one `status`, one `metadata`, any number of `token` events and
//! exactly one `done` or `error`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────┐   ┌──────────┐
//! │  HTTP    │──▶│ Pipeline (shelfwise-core)│──▶│  SQLite  │
//! │ /recommend   │ sanitize → keywords →    │   │ catalog  │
//! └────┬─────┘   │ retrieve                 │   └──────────┘
//!      │         └──────────────────────────┘
//!      ▼
//! ┌──────────────┐   ┌──────────────┐
//! │ Orchestrator │──▶│ LLM provider │
//! │ (SSE session)│◀──│  (streamed)  │
//! └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! shelfwise init                        # create database
//! shelfwise import ./data/catalog.json  # seed the catalog
//! shelfwise serve                       # start HTTP server
//! shelfwise recommend "cozy mysteries with cats" --media-type book
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_catalog`] | SQLite catalog queries |
//! | [`import`] | Catalog seeding from JSON |
//! | [`llm`] | OpenAI-compatible completion provider |
//! | [`auth`] | Caller identity from proxy headers |
//! | [`orchestrator`] | Per-request event stream sessions |
//! | [`server`] | HTTP server |
//! | [`client`] | Streaming client |

pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod import;
pub mod llm;
pub mod migrate;
pub mod orchestrator;
pub mod server;
pub mod sqlite_catalog;
