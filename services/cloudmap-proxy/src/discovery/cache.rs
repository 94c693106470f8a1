//! TTL cache in front of a discovery backend.
//!
//! Reads take the shared lock; a miss or an expired entry upgrades to the
//! exclusive lock, re-checks, and only then calls the backend. The exclusive
//! lock is held across the backend call, so at most one lookup is in flight
//! at any time. Failed lookups are not cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::{ServiceDescriptor, ServiceLookup};
use crate::error::DiscoveryError;

/// Default time-to-live for cached descriptors.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Cache key: the identifier pair handed in by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServiceKey {
    namespace: String,
    service: String,
}

struct CacheEntry {
    descriptor: Arc<ServiceDescriptor>,
    expires_at: Instant,
}

impl CacheEntry {
    fn fresh_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Descriptor cache wrapping a backing [`ServiceLookup`].
pub struct DescriptorCache {
    backend: Arc<dyn ServiceLookup>,
    ttl: Duration,
    entries: RwLock<HashMap<ServiceKey, CacheEntry>>,
}

impl DescriptorCache {
    /// Create a cache over `backend` with the given TTL.
    pub fn new(backend: Arc<dyn ServiceLookup>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of identifier pairs ever cached (entries are never purged).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Check if nothing has been cached yet.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ServiceLookup for DescriptorCache {
    async fn lookup_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Arc<ServiceDescriptor>, DiscoveryError> {
        let key = ServiceKey {
            namespace: namespace.to_string(),
            service: service.to_string(),
        };
        // Single clock read shared by both checks and the stored expiry.
        let now = Instant::now();

        // Fast path: read lock
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&key) {
                if entry.fresh_at(now) {
                    return Ok(Arc::clone(&entry.descriptor));
                }
            }
        }

        // Slow path: write lock, re-check before hitting the backend
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&key) {
            if entry.fresh_at(now) {
                return Ok(Arc::clone(&entry.descriptor));
            }
        }

        debug!(namespace, service, "Descriptor cache miss");
        let descriptor = match self.backend.lookup_service(namespace, service).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(namespace, service, reason = e.reason_code(), "Lookup not cached");
                return Err(e);
            }
        };

        debug!(
            namespace,
            service,
            instance_count = descriptor.instances.len(),
            ttl_secs = self.ttl.as_secs_f64(),
            "Descriptor cached"
        );
        entries.insert(
            key,
            CacheEntry {
                descriptor: Arc::clone(&descriptor),
                expires_at: now + self.ttl,
            },
        );

        Ok(descriptor)
    }
}
