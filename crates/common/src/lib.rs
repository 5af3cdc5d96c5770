//! Bastion Common
//!
//! Shared utilities for the Bastion control plane:
//!
//! - **Typed identifiers**: newtypes preventing accidental mixing of
//!   certificate, account, and DNS-provider ids
//! - **NonceCache**: per-key FIFO pool of single-use tokens
//! - **ExpiringCache**: per-key time-expiring value store

pub mod expiring_cache;
pub mod ids;
pub mod nonce_cache;

pub use expiring_cache::ExpiringCache;
pub use ids::{AccountId, CertId, DnsProviderId};
pub use nonce_cache::NonceCache;
