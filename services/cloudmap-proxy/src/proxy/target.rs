//! Target specification and per-connection resolution.
//!
//! A target is either a static `host:port`, or a discovery-backed
//! `<scheme>:<namespace>:<service>:<port>` where the scheme selects the
//! address-family preference:
//!
//! | scheme                     | preference |
//! |----------------------------|------------|
//! | `aws-servicediscovery`     | none       |
//! | `aws-servicediscovery-v4`  | IPv4       |
//! | `aws-servicediscovery-v6`  | IPv6       |
//!
//! Discovery-backed targets rotate over the discovered instances with a
//! shared round-robin cursor.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::discovery::{ServiceInstance, ServiceLookup};
use crate::error::ProxyError;

const SCHEME_ANY: &str = "aws-servicediscovery:";
const SCHEME_V4: &str = "aws-servicediscovery-v4:";
const SCHEME_V6: &str = "aws-servicediscovery-v6:";

/// Address-family preference for discovery-backed targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// IPv4 when registered, IPv6 otherwise.
    #[default]
    Any,
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

impl AddressFamily {
    /// Pick the address of `instance` this preference allows, if any.
    pub fn pick(self, instance: &ServiceInstance) -> Option<IpAddr> {
        match self {
            AddressFamily::Any => instance
                .ipv4
                .map(IpAddr::V4)
                .or_else(|| instance.ipv6.map(IpAddr::V6)),
            AddressFamily::V4 => instance.ipv4.map(IpAddr::V4),
            AddressFamily::V6 => instance.ipv6.map(IpAddr::V6),
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            AddressFamily::Any => SCHEME_ANY,
            AddressFamily::V4 => SCHEME_V4,
            AddressFamily::V6 => SCHEME_V6,
        }
    }
}

/// A target resolved through service discovery.
#[derive(Debug)]
pub struct DiscoveryTarget {
    pub namespace: String,
    pub service: String,
    pub family: AddressFamily,
    pub port: u16,
    /// Next instance index to try. Reduced modulo the instance count on use,
    /// so a stale value from a larger descriptor is never out of range.
    cursor: AtomicUsize,
}

impl DiscoveryTarget {
    /// Create a discovery target with the cursor at zero.
    pub fn new(
        namespace: impl Into<String>,
        service: impl Into<String>,
        family: AddressFamily,
        port: u16,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
            family,
            port,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Current cursor position.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Choose the next usable instance starting at the cursor.
    ///
    /// Concurrent callers may race on the cursor; the rotation is then
    /// approximate but the index always stays in range.
    pub fn select(&self, instances: &[ServiceInstance]) -> Result<SocketAddr, ProxyError> {
        let count = instances.len();
        if count == 0 {
            return Err(ProxyError::NoInstances {
                namespace: self.namespace.clone(),
                service: self.service.clone(),
            });
        }

        let start = self.cursor.load(Ordering::Relaxed) % count;
        for offset in 0..count {
            let idx = (start + offset) % count;
            if let Some(ip) = self.family.pick(&instances[idx]) {
                self.cursor.store((idx + 1) % count, Ordering::Relaxed);
                debug!(
                    instance_id = %instances[idx].instance_id,
                    index = idx,
                    "Instance selected"
                );
                return Ok(SocketAddr::new(ip, self.port));
            }
        }

        Err(ProxyError::NoUsableAddress {
            namespace: self.namespace.clone(),
            service: self.service.clone(),
        })
    }

    async fn resolve(&self, lookup: &dyn ServiceLookup) -> Result<SocketAddr, ProxyError> {
        let descriptor = lookup
            .lookup_service(&self.namespace, &self.service)
            .await
            .map_err(|source| ProxyError::Lookup {
                namespace: self.namespace.clone(),
                service: self.service.clone(),
                source,
            })?;
        self.select(&descriptor.instances)
    }
}

/// The configured forward destination.
#[derive(Debug)]
pub enum TargetSpec {
    /// Fixed `host:port`, name-resolved on every connection.
    Static { addr: String },
    /// Resolved through the discovery lookup.
    Discovery(DiscoveryTarget),
}

impl TargetSpec {
    /// Parse a target specification string.
    pub fn parse(spec: &str) -> Result<Self, ProxyError> {
        let (rest, family) = if let Some(rest) = spec.strip_prefix(SCHEME_V4) {
            (rest, AddressFamily::V4)
        } else if let Some(rest) = spec.strip_prefix(SCHEME_V6) {
            (rest, AddressFamily::V6)
        } else if let Some(rest) = spec.strip_prefix(SCHEME_ANY) {
            (rest, AddressFamily::Any)
        } else {
            return Ok(TargetSpec::Static {
                addr: spec.to_string(),
            });
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let [namespace, service, port] = parts.as_slice() else {
            return Err(ProxyError::InvalidAddress(spec.to_string()));
        };
        if namespace.is_empty() || service.is_empty() {
            return Err(ProxyError::InvalidAddress(spec.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::InvalidPort(port.to_string()))?;

        Ok(TargetSpec::Discovery(DiscoveryTarget::new(
            *namespace, *service, family, port,
        )))
    }

    /// Whether resolution goes through service discovery.
    pub fn is_discovery(&self) -> bool {
        matches!(self, TargetSpec::Discovery(_))
    }

    /// Resolve to one concrete address.
    pub async fn resolve(&self, lookup: &dyn ServiceLookup) -> Result<SocketAddr, ProxyError> {
        match self {
            TargetSpec::Static { addr } => resolve_host(addr).await,
            TargetSpec::Discovery(target) => target.resolve(lookup).await,
        }
    }
}

impl FromStr for TargetSpec {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Static { addr } => f.write_str(addr),
            TargetSpec::Discovery(t) => write!(
                f,
                "{}{}:{}:{}",
                t.family.scheme(),
                t.namespace,
                t.service,
                t.port
            ),
        }
    }
}

/// Resolve `host:port` through the system resolver, taking the first answer.
pub(crate) async fn resolve_host(addr: &str) -> Result<SocketAddr, ProxyError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|source| ProxyError::Resolve {
            addr: addr.to_string(),
            source,
        })?;

    addrs.next().ok_or_else(|| ProxyError::Resolve {
        addr: addr.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
    })
}
