pub mod config;
pub mod discovery;
pub mod error;
pub mod proxy;

pub use discovery::{
    CloudMapLookup, CloudMapOptions, DescriptorCache, ServiceDescriptor, ServiceInstance,
    ServiceLookup, StaticDirectory,
};
pub use error::{DiscoveryError, ProxyError};
pub use proxy::{
    parse_listen_addr, AddressFamily, DiscoveryTarget, ListenerStats, Server, ServerConfig,
    TargetSpec,
};
