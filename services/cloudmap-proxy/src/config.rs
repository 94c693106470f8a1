//! Proxy configuration.
//!
//! Command-line flags with environment fallbacks. `{NAME}` placeholders in
//! the target and listen arguments are substituted from the environment
//! before parsing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use crate::discovery::{
    CloudMapLookup, CloudMapOptions, DescriptorCache, ServiceLookup, StaticDirectory,
};
use crate::proxy::TargetSpec;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "cloudmap-proxy",
    version,
    about = "TCP reverse proxy with Cloud Map service discovery"
)]
pub struct Args {
    /// Forward destination: host:port, or
    /// aws-servicediscovery[-v4|-v6]:<namespace>:<service>:<port>
    pub target: String,

    /// Listen address: :<port> or host:port
    pub listen: String,

    /// Debug mode (same as a debug level of 2)
    #[arg(long)]
    pub debug: bool,

    /// Debug level; anything above 0 enables debug logs
    #[arg(long, env = "CLOUDMAP_PROXY_DEBUG", default_value_t = 0)]
    pub debug_level: u8,

    /// Timeout for resolving and dialing the target
    #[arg(
        long,
        env = "CLOUDMAP_PROXY_CONN_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub conn_timeout: Duration,

    /// How long discovery results are cached
    #[arg(
        long,
        env = "CLOUDMAP_PROXY_CACHE_TTL",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub cache_ttl: Duration,

    /// Cloud Map endpoint override (e.g. an emulator)
    #[arg(long, env = "CLOUDMAP_PROXY_DISCOVERY_ENDPOINT", conflicts_with = "directory_file")]
    pub discovery_endpoint: Option<String>,

    /// Role to assume for Cloud Map calls
    #[arg(long, env = "AWS_STS_ASSUME_ROLE_ARN", conflicts_with = "directory_file")]
    pub assume_role_arn: Option<String>,

    /// Static directory file (.json or .toml) used instead of Cloud Map
    #[arg(long, env = "CLOUDMAP_PROXY_DIRECTORY_FILE")]
    pub directory_file: Option<PathBuf>,

    /// Log output format
    #[arg(
        long,
        env = "CLOUDMAP_PROXY_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Json
    )]
    pub log_format: LogFormat,
}

/// Where discovery-backed targets are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryBackend {
    CloudMap {
        endpoint: Option<String>,
        assume_role_arn: Option<String>,
    },
    Directory { path: PathBuf },
}

/// Validated configuration.
#[derive(Debug)]
pub struct Config {
    /// Parsed forward destination.
    pub target: TargetSpec,
    /// Listen address after placeholder substitution.
    pub listen: String,
    /// Effective debug level.
    pub debug_level: u8,
    pub log_format: LogFormat,
    pub connect_timeout: Duration,
    pub cache_ttl: Duration,
    pub discovery: Option<DiscoveryBackend>,
}

impl Config {
    /// Build the configuration, substituting placeholders from the process
    /// environment.
    pub fn from_args(args: Args) -> Result<Self> {
        Self::from_args_with(args, |name| std::env::var(name).ok())
    }

    /// Build the configuration with a custom placeholder source.
    pub fn from_args_with<F>(args: Args, mut vars: F) -> Result<Self>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if args.listen.is_empty() {
            bail!("listen address must be specified");
        }

        let target = cloudmap_template::render_with(&args.target, &mut vars)
            .with_context(|| format!("Failed to expand target address {}", args.target))?;
        let listen = cloudmap_template::render_with(&args.listen, &mut vars)
            .with_context(|| format!("Failed to expand listen address {}", args.listen))?;

        let target = TargetSpec::parse(&target)
            .with_context(|| format!("failed to parse target address {target}"))?;

        let discovery = match args.directory_file {
            Some(path) => Some(DiscoveryBackend::Directory { path }),
            None if target.is_discovery() => Some(DiscoveryBackend::CloudMap {
                endpoint: args.discovery_endpoint,
                assume_role_arn: args.assume_role_arn,
            }),
            None => None,
        };

        let debug_level = if args.debug { 2 } else { args.debug_level };

        Ok(Self {
            target,
            listen,
            debug_level,
            log_format: args.log_format,
            connect_timeout: args.conn_timeout,
            cache_ttl: args.cache_ttl,
            discovery,
        })
    }

    /// Default log filter directive for the configured debug level.
    pub fn log_level(&self) -> &'static str {
        if self.debug_level > 0 {
            "debug"
        } else {
            "info"
        }
    }

    /// Build the cached discovery lookup.
    ///
    /// Static targets without a directory file get an empty directory. Cloud
    /// Map calls are bounded by the connect timeout.
    pub async fn build_lookup(&self) -> Result<Arc<dyn ServiceLookup>> {
        let backend: Arc<dyn ServiceLookup> = match &self.discovery {
            Some(DiscoveryBackend::CloudMap {
                endpoint,
                assume_role_arn,
            }) => Arc::new(
                CloudMapLookup::load(CloudMapOptions {
                    endpoint: endpoint.clone(),
                    assume_role_arn: assume_role_arn.clone(),
                    operation_timeout: Some(self.connect_timeout),
                })
                .await,
            ),
            Some(DiscoveryBackend::Directory { path }) => Arc::new(
                StaticDirectory::load(path)
                    .with_context(|| format!("Failed to load directory {}", path.display()))?,
            ),
            None => Arc::new(StaticDirectory::default()),
        };

        Ok(Arc::new(DescriptorCache::new(backend, self.cache_ttl)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["cloudmap-proxy"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    fn no_vars(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults() {
        let config = Config::from_args_with(args(&["127.0.0.1:80", ":8080"]), no_vars).unwrap();
        assert!(!config.target.is_discovery());
        assert_eq!(config.listen, ":8080");
        assert_eq!(config.connect_timeout, crate::proxy::DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.cache_ttl, crate::discovery::DEFAULT_CACHE_TTL);
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.discovery.is_none());
    }

    #[test]
    fn durations_use_humantime() {
        let config = Config::from_args_with(
            args(&[
                "--conn-timeout",
                "1500ms",
                "--cache-ttl",
                "5m",
                "127.0.0.1:80",
                ":8080",
            ]),
            no_vars,
        )
        .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
    }

    #[test]
    fn debug_flag_sets_level() {
        let config =
            Config::from_args_with(args(&["--debug", "127.0.0.1:80", ":8080"]), no_vars).unwrap();
        assert_eq!(config.debug_level, 2);
        assert_eq!(config.log_level(), "debug");
    }

    #[test]
    fn placeholders_are_expanded() {
        let vars = HashMap::from([
            ("NS".to_string(), "prod".to_string()),
            ("PORT".to_string(), "9000".to_string()),
        ]);
        let config = Config::from_args_with(
            args(&[
                "--discovery-endpoint",
                "http://localhost:4566",
                "aws-servicediscovery:{NS}:api:8080",
                ":{PORT}",
            ]),
            |name| vars.get(name).cloned(),
        )
        .unwrap();

        assert_eq!(config.target.to_string(), "aws-servicediscovery:prod:api:8080");
        assert_eq!(config.listen, ":9000");
        assert_eq!(
            config.discovery,
            Some(DiscoveryBackend::CloudMap {
                endpoint: Some("http://localhost:4566".to_string()),
                assume_role_arn: None,
            })
        );
    }

    #[test]
    fn unknown_placeholder_is_fatal() {
        let err = Config::from_args_with(args(&["{HOST}:80", ":8080"]), no_vars).unwrap_err();
        assert!(format!("{err:#}").contains("unknown placeholder: HOST"));
    }

    #[test]
    fn discovery_target_defaults_to_cloud_map() {
        let config = Config::from_args_with(
            args(&[
                "--assume-role-arn",
                "arn:aws:iam::123456789012:role/proxy",
                "aws-servicediscovery:ns:svc:80",
                ":8080",
            ]),
            no_vars,
        )
        .unwrap();
        assert_eq!(
            config.discovery,
            Some(DiscoveryBackend::CloudMap {
                endpoint: None,
                assume_role_arn: Some("arn:aws:iam::123456789012:role/proxy".to_string()),
            })
        );
    }

    #[test]
    fn directory_file_wins_over_cloud_map() {
        let config = Config::from_args_with(
            args(&[
                "--directory-file",
                "dir.toml",
                "aws-servicediscovery:ns:svc:80",
                ":8080",
            ]),
            no_vars,
        )
        .unwrap();
        assert_eq!(
            config.discovery,
            Some(DiscoveryBackend::Directory {
                path: PathBuf::from("dir.toml")
            })
        );
    }

    #[test]
    fn malformed_target_is_fatal() {
        let err = Config::from_args_with(
            args(&["--directory-file", "dir.toml", "aws-servicediscovery:ns:80", ":8080"]),
            no_vars,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("invalid address"));
    }

    #[test]
    fn backends_conflict() {
        let result = Args::try_parse_from([
            "cloudmap-proxy",
            "--discovery-endpoint",
            "http://localhost:4566",
            "--directory-file",
            "dir.toml",
            "127.0.0.1:80",
            ":8080",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn missing_positional_arguments_fail() {
        assert!(Args::try_parse_from(["cloudmap-proxy", "127.0.0.1:80"]).is_err());
    }

    #[test]
    fn empty_listen_is_fatal() {
        let err = Config::from_args_with(args(&["127.0.0.1:80", ""]), no_vars).unwrap_err();
        assert!(err.to_string().contains("listen address"));
    }

    #[tokio::test]
    async fn static_target_gets_empty_directory() {
        let config = Config::from_args_with(args(&["127.0.0.1:80", ":8080"]), no_vars).unwrap();
        let lookup = config.build_lookup().await.unwrap();
        assert!(lookup.lookup_service("ns", "svc").await.is_err());
    }
}
