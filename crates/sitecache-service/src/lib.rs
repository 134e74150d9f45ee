//! The cache-recreation engine behind the sitecache content server.
//!
//! See the [`caching`] module for an overview of how entries are served, recreated and expired.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod storage;
pub mod utils;
