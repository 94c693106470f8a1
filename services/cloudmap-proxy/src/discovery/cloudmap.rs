//! Cloud Map `DiscoverInstances` client.
//!
//! Credentials come from the default AWS provider chain. When a role ARN is
//! configured, the base credentials are used to assume that role through STS.
//! The endpoint can be overridden, e.g. for an emulator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_servicediscovery::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_servicediscovery::types::HealthStatusFilter;
use aws_sdk_servicediscovery::{config, Client};
use tracing::{debug, info};

use super::{ServiceDescriptor, ServiceInstance, ServiceLookup};
use crate::error::DiscoveryError;

const SESSION_NAME: &str = "cloudmap-proxy";

/// Settings for [`CloudMapLookup::load`].
#[derive(Debug, Clone, Default)]
pub struct CloudMapOptions {
    /// Endpoint override; the regional Cloud Map endpoint when unset.
    pub endpoint: Option<String>,
    /// Role to assume on top of the default credentials.
    pub assume_role_arn: Option<String>,
    /// Bound on one `DiscoverInstances` call, retries included.
    pub operation_timeout: Option<Duration>,
}

/// Lookup backed by the Cloud Map data-plane API.
#[derive(Debug, Clone)]
pub struct CloudMapLookup {
    client: Client,
}

impl CloudMapOptions {
    /// Apply the endpoint override and operation timeout to a client config.
    fn apply(&self, mut builder: config::Builder) -> config::Builder {
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(timeout) = self.operation_timeout {
            builder = builder
                .timeout_config(TimeoutConfig::builder().operation_timeout(timeout).build());
        }
        builder
    }
}

impl CloudMapLookup {
    /// Load AWS configuration from the environment and build a client.
    pub async fn load(options: CloudMapOptions) -> Self {
        let base = aws_config::load_defaults(BehaviorVersion::latest()).await;

        let mut builder = config::Builder::from(&base);
        if let Some(role_arn) = &options.assume_role_arn {
            info!(role_arn = %role_arn, "Assuming role for Cloud Map");
            let provider = AssumeRoleProvider::builder(role_arn.clone())
                .session_name(SESSION_NAME)
                .configure(&base)
                .build()
                .await;
            builder = builder.credentials_provider(provider);
        }

        Self::from_client(Client::from_conf(options.apply(builder).build()))
    }

    /// Wrap an already configured client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceLookup for CloudMapLookup {
    async fn lookup_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Arc<ServiceDescriptor>, DiscoveryError> {
        debug!(
            namespace_name = namespace,
            service_name = service,
            "looking up service"
        );

        let output = self
            .client
            .discover_instances()
            .namespace_name(namespace)
            .service_name(service)
            .health_status(HealthStatusFilter::Healthy)
            .send()
            .await
            .map_err(|e| DiscoveryError::Api {
                code: e.as_service_error().and_then(|se| se.code()).map(str::to_string),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let instances = output
            .instances()
            .iter()
            .map(|summary| {
                ServiceInstance::from_attributes(
                    summary.instance_id().unwrap_or_default(),
                    summary.attributes().cloned().unwrap_or_default(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            namespace_name = namespace,
            service_name = service,
            instance_count = instances.len(),
            "service instances discovered"
        );

        Ok(Arc::new(ServiceDescriptor {
            namespace: namespace.to_string(),
            service: service.to_string(),
            instances,
        }))
    }
}
