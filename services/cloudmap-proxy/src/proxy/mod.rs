//! L4 TCP proxy implementation.
//!
//! This module provides:
//! - Target parsing and resolution (static or discovery-backed)
//! - TCP listener management and graceful shutdown
//! - The per-connection bidirectional stream pump
//!
//! ## Architecture
//!
//! ```text
//! Client -> Server (accept loop) -> ConnectionHandler -> TargetSpec::resolve -> DescriptorCache -> ServiceLookup
//!                                          |
//!                                   dial + relay_bidirectional -> Target
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use cloudmap_proxy::{DescriptorCache, Server, ServerConfig, StaticDirectory, TargetSpec};
//!
//! let directory = Arc::new(StaticDirectory::load("directory.toml")?);
//! let cache = Arc::new(DescriptorCache::new(directory, Duration::from_secs(60)));
//! let target = TargetSpec::parse("aws-servicediscovery:prod:api:8080")?;
//!
//! let server = Server::bind(ServerConfig::new("[::]:9000".parse()?), target, cache).await?;
//! server.wait_for_termination().await;
//! ```

mod listener;
mod pump;
mod target;

pub use listener::{parse_listen_addr, ListenerStats, Server, ServerConfig, DEFAULT_CONNECT_TIMEOUT};
pub use pump::{relay_bidirectional, ConnectionState, RelayTotals, RELAY_BUFFER_SIZE};
pub use target::{AddressFamily, DiscoveryTarget, TargetSpec};
