//! Portfolio Sync - local-first data layer for a portfolio dashboard.
//!
//! Keeps a local cache of tracked apps, their tasks and reviews, and the
//! idea pipeline in line with a remote dataset stored as versioned blobs.
//! Writes are version-checked; writes that cannot reach the remote are
//! queued durably and retried in the background.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use config::PortfolioConfig;
pub use context::PortfolioContext;
pub use error::AppError;
