//! # cparla
//!
//! Query mediation for parliamentary voting records.
//!
//! Two chambers (deputies and senators) record blocks, legislators, issues
//! and individual votes in SQLite. cparla puts a guarded query surface in
//! front of that store and keeps a set of semantic collections derived from
//! it, so an agent can both filter exactly and find things by meaning.
//!
//! ## Architecture
//!
//! ```text
//!   dataset.json ──▶ ingest ──▶ ┌───────────────┐
//!                               │  relational   │◀── gate ◀── store ◀─┐
//!                               │    tables     │                     │
//!                               └──────┬────────┘                     │
//!                                      │ sync (lease, embed, swap)    │
//!                                      ▼                              │
//!                               ┌───────────────┐                     │
//!                               │   semantic    │◀── index ◀──────────┤
//!                               │  collections  │                     │
//!                               └───────────────┘                 tools
//!                                                              ┌────┴────┐
//!                                                             CLI   HTTP + MCP
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cparla init
//! cparla load ./data/votes.json
//! cparla query "SELECT chamber, COUNT(*) FROM issues GROUP BY chamber"
//! cparla rebuild all
//! cparla search issues-senators "pension reform"
//! cparla serve mcp
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`gate`] | Read-only SQL validation and row capping |
//! | [`store`] | Table listing, schema introspection, gated queries |
//! | [`index`] | Generation-based vector collections |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`sync`] | Collection rebuilds and consistency checks |
//! | [`ingest`] | Dataset loading |
//! | [`tools`] | Tool trait, registry, built-in tools |
//! | [`resources`] | `db://` resources |
//! | [`mcp`] | MCP protocol bridge |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod gate;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod mcp;
pub mod migrate;
pub mod models;
pub mod resources;
pub mod server;
pub mod store;
pub mod sync;
pub mod tools;

pub use error::{Error, Result};
