//! # comment_harvest
//!
//! Resumable extraction of comments and their images from a login-gated
//! social content site.
//!
//! The crate is organized around one orchestrator, [`pipeline::Extractor`],
//! and the parts it drives:
//!
//! - [`session`]: token lifecycle (cache, profile extraction, interactive
//!   login) with a single-refresh guard
//! - [`records`]: turning raw page records into [`models::Comment`]s with a
//!   content-derived dedup key
//! - [`assets`]: local-first image resolution and downloads
//! - [`resilience`]: retry with exponential backoff and jitter
//! - [`storage`]: per-path locks, atomic writes, checksummed JSON
//! - [`stats`]: statistics recomputed from what is on disk
//! - [`outputs`]: `comment.txt`, `raw.json`, `target-info.json`, `run-report.json`
//!
//! Browser and HTTP access go through the traits in [`collaborators`].

pub mod assets;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod models;
pub mod outputs;
pub mod pipeline;
pub mod records;
pub mod resilience;
pub mod session;
pub mod stats;
pub mod storage;
pub mod utils;

pub use error::{EngineError, ErrorContext, ErrorKind};
pub use pipeline::Extractor;
