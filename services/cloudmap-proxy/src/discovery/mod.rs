//! Service discovery.
//!
//! This module provides:
//! - The [`ServiceLookup`] port the resolver consumes
//! - A TTL cache in front of any lookup ([`DescriptorCache`])
//! - A Cloud Map client on the AWS SDK ([`CloudMapLookup`])
//! - A file-backed directory ([`StaticDirectory`])
//!
//! Instances are described with the Cloud Map attribute convention:
//! `AWS_INSTANCE_IPV4`, `AWS_INSTANCE_IPV6` and `AWS_INIT_HEALTH_STATUS`.

mod cache;
mod cloudmap;
mod directory;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DiscoveryError;

pub use cache::{DescriptorCache, DEFAULT_CACHE_TTL};
pub use cloudmap::{CloudMapLookup, CloudMapOptions};
pub use directory::StaticDirectory;

/// Attribute carrying the instance IPv4 address.
pub const ATTR_IPV4: &str = "AWS_INSTANCE_IPV4";
/// Attribute carrying the instance IPv6 address.
pub const ATTR_IPV6: &str = "AWS_INSTANCE_IPV6";
/// Attribute carrying the health status reported at registration.
pub const ATTR_HEALTH_STATUS: &str = "AWS_INIT_HEALTH_STATUS";
/// Health status value that marks an instance healthy.
pub const HEALTHY: &str = "HEALTHY";

/// One discovered backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Instance ID, unique within its service.
    pub instance_id: String,
    /// Whether the directory reported the instance healthy.
    pub healthy: bool,
    /// IPv4 address, if registered.
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address, if registered.
    pub ipv6: Option<Ipv6Addr>,
    /// All raw attributes as returned by the directory.
    pub attributes: HashMap<String, String>,
}

impl ServiceInstance {
    /// Build an instance from its raw discovery attributes.
    ///
    /// Fails if an address attribute is present but does not parse.
    pub fn from_attributes(
        instance_id: impl Into<String>,
        attributes: HashMap<String, String>,
    ) -> Result<Self, DiscoveryError> {
        let instance_id = instance_id.into();

        let healthy = attributes
            .get(ATTR_HEALTH_STATUS)
            .is_some_and(|status| status == HEALTHY);

        let ipv4 = match attributes.get(ATTR_IPV4) {
            Some(raw) => Some(raw.parse().map_err(|_| DiscoveryError::InvalidAttribute {
                instance_id: instance_id.clone(),
                attribute: ATTR_IPV4,
                value: raw.clone(),
            })?),
            None => None,
        };

        let ipv6 = match attributes.get(ATTR_IPV6) {
            Some(raw) => Some(raw.parse().map_err(|_| DiscoveryError::InvalidAttribute {
                instance_id: instance_id.clone(),
                attribute: ATTR_IPV6,
                value: raw.clone(),
            })?),
            None => None,
        };

        Ok(Self {
            instance_id,
            healthy,
            ipv4,
            ipv6,
            attributes,
        })
    }
}

/// Point-in-time snapshot of a service's instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub namespace: String,
    pub service: String,
    pub instances: Vec<ServiceInstance>,
}

/// Lookup port for a service-discovery backend.
///
/// Implementations return healthy instances only; callers do not re-check
/// the health flag.
#[async_trait]
pub trait ServiceLookup: Send + Sync {
    /// Look up the instances of `service` in `namespace`.
    async fn lookup_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Arc<ServiceDescriptor>, DiscoveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn instance_from_full_attributes() {
        let instance = ServiceInstance::from_attributes(
            "i-1",
            attrs(&[
                (ATTR_IPV4, "10.0.0.1"),
                (ATTR_IPV6, "fd00::1"),
                (ATTR_HEALTH_STATUS, "HEALTHY"),
                ("AZ", "us-east-1a"),
            ]),
        )
        .unwrap();

        assert_eq!(instance.instance_id, "i-1");
        assert!(instance.healthy);
        assert_eq!(instance.ipv4, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(instance.ipv6, Some("fd00::1".parse().unwrap()));
        assert_eq!(instance.attributes.get("AZ").unwrap(), "us-east-1a");
        assert_eq!(instance.attributes.len(), 4);
    }

    #[test]
    fn health_requires_exact_status() {
        let instance = ServiceInstance::from_attributes(
            "i-1",
            attrs(&[(ATTR_IPV4, "10.0.0.1"), (ATTR_HEALTH_STATUS, "UNHEALTHY")]),
        )
        .unwrap();
        assert!(!instance.healthy);

        let instance =
            ServiceInstance::from_attributes("i-2", attrs(&[(ATTR_IPV4, "10.0.0.2")])).unwrap();
        assert!(!instance.healthy);
    }

    #[test]
    fn invalid_address_attribute_is_rejected() {
        let err = ServiceInstance::from_attributes("i-1", attrs(&[(ATTR_IPV4, "fd00::1")]))
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::InvalidAttribute {
                attribute: ATTR_IPV4,
                ..
            }
        ));

        let err = ServiceInstance::from_attributes("i-1", attrs(&[(ATTR_IPV6, "not-an-ip")]))
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::InvalidAttribute {
                attribute: ATTR_IPV6,
                ..
            }
        ));
    }
}
