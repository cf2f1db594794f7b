//! Feed refresh and article synchronization core for a multi-tenant RSS
//! aggregator.
//!
//! - [`feed`] - fetch, parse and de-duplicate feed documents
//! - [`storage`] - SQLite store for collections, feeds, articles and claims
//! - [`sync`] - per-feed sync orchestration, batch refresh and scheduling
//! - [`config`] - TOML configuration

pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;
