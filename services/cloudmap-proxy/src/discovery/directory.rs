//! File-backed service directory.
//!
//! Loads a fixed set of services from a JSON or TOML file using the same
//! attribute convention as Cloud Map:
//!
//! ```toml
//! [[services]]
//! namespace = "prod.local"
//! name = "api"
//!
//! [[services.instances]]
//! id = "i-1"
//! attributes = { AWS_INSTANCE_IPV4 = "10.0.0.1", AWS_INIT_HEALTH_STATUS = "HEALTHY" }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{ServiceDescriptor, ServiceInstance, ServiceLookup};
use crate::error::DiscoveryError;

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    namespace: String,
    name: String,
    #[serde(default)]
    instances: Vec<InstanceEntry>,
}

#[derive(Debug, Deserialize)]
struct InstanceEntry {
    id: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

/// A static directory of services.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    services: HashMap<(String, String), Vec<ServiceInstance>>,
}

impl StaticDirectory {
    /// Load a directory file; the format is chosen by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DiscoveryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| DiscoveryError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let directory = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw)?,
            Some("toml") => Self::from_toml_str(&raw)?,
            _ => return Err(DiscoveryError::UnsupportedFormat(path.to_path_buf())),
        };

        info!(
            path = %path.display(),
            service_count = directory.services.len(),
            "Static directory loaded"
        );
        Ok(directory)
    }

    /// Parse a JSON directory.
    pub fn from_json_str(raw: &str) -> Result<Self, DiscoveryError> {
        Self::from_file(serde_json::from_str(raw)?)
    }

    /// Parse a TOML directory.
    pub fn from_toml_str(raw: &str) -> Result<Self, DiscoveryError> {
        Self::from_file(toml::from_str(raw)?)
    }

    fn from_file(file: DirectoryFile) -> Result<Self, DiscoveryError> {
        let mut services = HashMap::new();
        for entry in file.services {
            let instances = entry
                .instances
                .into_iter()
                .map(|i| ServiceInstance::from_attributes(i.id, i.attributes))
                .collect::<Result<Vec<_>, _>>()?;
            services
                .entry((entry.namespace, entry.name))
                .or_insert_with(Vec::new)
                .extend(instances);
        }
        Ok(Self { services })
    }

    /// Register instances for a service, appending to any already present.
    pub fn insert(
        &mut self,
        namespace: impl Into<String>,
        service: impl Into<String>,
        instances: impl IntoIterator<Item = ServiceInstance>,
    ) {
        self.services
            .entry((namespace.into(), service.into()))
            .or_default()
            .extend(instances);
    }

    /// Number of services in the directory.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Check if the directory has no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[async_trait]
impl ServiceLookup for StaticDirectory {
    async fn lookup_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Arc<ServiceDescriptor>, DiscoveryError> {
        let key = (namespace.to_string(), service.to_string());
        let Some(instances) = self.services.get(&key) else {
            return Err(DiscoveryError::NotFound {
                namespace: namespace.to_string(),
                service: service.to_string(),
            });
        };

        Ok(Arc::new(ServiceDescriptor {
            namespace: namespace.to_string(),
            service: service.to_string(),
            instances: instances.iter().filter(|i| i.healthy).cloned().collect(),
        }))
    }
}
