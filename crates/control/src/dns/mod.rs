//! Operator-scripted DNS providers for DNS-01 challenges.
//!
//! A provider is a small script implementing a two-operation capability:
//! create a TXT record and delete it again. Scripts are compiled once per
//! provider id and cached; editing a script invalidates its cache entry so
//! the next challenge picks up the new version. The compiler behind the
//! capability is swappable — the bundled one runs Luau in-process.

mod lua;
mod registry;

pub use lua::LuaCompiler;
pub use registry::ProviderRegistry;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// DNS provider failures.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Script failed to compile. The message is the compiler's own
    /// diagnostic, line numbers included, passed through verbatim.
    #[error("provider script failed to compile: {0}")]
    Compile(String),

    /// Script ran but raised an error.
    #[error("provider script failed: {0}")]
    Execution(String),

    /// Script returned `false`, reporting that it could not apply the
    /// change. Treated the same as an execution failure.
    #[error("provider refused to {operation} TXT record for '{domain}'")]
    Refused {
        operation: &'static str,
        domain: String,
    },

    #[error("no DNS provider registered under id {0}")]
    NotRegistered(bastion_common::DnsProviderId),
}

/// The two-operation record capability a compiled script exposes.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create a TXT record `txt_value` under `domain`.
    async fn create_record(&self, domain: &str, txt_value: &str) -> Result<(), DnsError>;

    /// Delete the TXT record `txt_value` under `domain`.
    async fn delete_record(&self, domain: &str, txt_value: &str) -> Result<(), DnsError>;
}

/// Turns operator source text into an invocable provider.
pub trait ProviderCompiler: Send + Sync {
    fn compile(&self, name: &str, source: &str) -> Result<Arc<dyn DnsProvider>, DnsError>;
}
