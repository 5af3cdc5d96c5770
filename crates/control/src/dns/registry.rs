//! Provider cache keyed by provider id.

use bastion_common::DnsProviderId;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{DnsError, DnsProvider, ProviderCompiler};

/// Caches compiled providers by id.
///
/// Only successful compilations are cached; a failing script is recompiled
/// (and re-reported) on every attempt so the operator always sees the
/// current diagnostic.
pub struct ProviderRegistry {
    compiler: Arc<dyn ProviderCompiler>,
    compiled: DashMap<DnsProviderId, Arc<dyn DnsProvider>>,
}

impl ProviderRegistry {
    pub fn new(compiler: Arc<dyn ProviderCompiler>) -> Self {
        Self {
            compiler,
            compiled: DashMap::new(),
        }
    }

    /// Fetch the cached provider for `id`, compiling `source` on a miss.
    pub fn get_or_compile(
        &self,
        id: DnsProviderId,
        name: &str,
        source: &str,
    ) -> Result<Arc<dyn DnsProvider>, DnsError> {
        if let Some(existing) = self.compiled.get(&id) {
            return Ok(Arc::clone(&existing));
        }
        let provider = self.compiler.compile(name, source)?;
        info!(provider = name, %id, "DNS provider script compiled");
        self.compiled.insert(id, Arc::clone(&provider));
        Ok(provider)
    }

    /// Fetch a previously registered provider.
    pub fn get(&self, id: DnsProviderId) -> Result<Arc<dyn DnsProvider>, DnsError> {
        self.compiled
            .get(&id)
            .map(|p| Arc::clone(&p))
            .ok_or(DnsError::NotRegistered(id))
    }

    /// Register a provider instance directly, bypassing the compiler.
    pub fn insert(&self, id: DnsProviderId, provider: Arc<dyn DnsProvider>) {
        self.compiled.insert(id, provider);
    }

    /// Drop the cached instance for `id`. Called when the operator edits
    /// and re-saves the provider's script.
    pub fn invalidate(&self, id: DnsProviderId) {
        if self.compiled.remove(&id).is_some() {
            debug!(%id, "DNS provider cache invalidated");
        }
    }
}
