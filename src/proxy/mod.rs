//! Egress proxy management
//!
//! This module provides:
//! - The static proxy pool and its rotation strategies
//! - Per-proxy health tracking with blacklist windows
//! - Per-proxy concurrency slots

pub mod health;
pub mod pool;
pub mod rotation;
pub mod slots;

pub use health::{HealthConfig, HealthTracker, ProxyHealthRecord, TransferQuality};
pub use pool::ProxyPool;
pub use rotation::{create_selector, ProxySelector, RotationStrategy};
pub use slots::{ProxySlots, SlotGuard};
