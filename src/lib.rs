//! Courier - Resilient Concurrent Fetch Engine
//!
//! Fetches large, ordered batches of remote resources through a pool of
//! rotating egress proxies without letting one bad proxy, a burst of 429/5xx
//! responses or a few slow transfers stall the batch.
//!
//! ## Features
//!
//! - Round-robin, random and failover proxy rotation
//! - Per-proxy health tracking with failure and slow-transfer blacklisting
//! - Adaptive worker pool sized from the proxy count
//! - Exponential backoff with jitter, `Retry-After` and a pool-wide 429 cooldown
//! - Chapter page resolution across every known endpoint shape
//! - Alternate-mirror and sequential fallback tiers
//! - Order-preserving results with per-attempt history

pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod models;
pub mod proxy;
pub mod resolver;

pub use config::Config;
pub use engine::{CancelHandle, ChapterDownload, Downloader};
pub use error::{CourierError, Result};
