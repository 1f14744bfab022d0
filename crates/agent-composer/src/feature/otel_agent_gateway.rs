//! The OpenTelemetry gateway, a Deployment aggregating the telemetry of every node agent.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{ContainerPort, ServicePort, VolumeMount},
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use snafu::ResultExt;

use super::{Feature, FeatureId, FeatureOptions, Owner, Result, StoreSnafu, enabled};
use crate::{
    component::{ComponentName, ContainerName},
    crd::{DatadogAgentSpec, OtelCollectorPort, RemoteConfigConfiguration},
    merger::{PodTemplateManagers, volume::config_map_volume},
    required::{RequiredComponent, RequiredComponents},
    store::{ResourceManagers, config_map::checksum_annotation_key},
};

pub const CONFIG_FILE_NAME: &str = "otel-config.yaml";
pub const CONFIG_MOUNT_PATH: &str = "/etc/otel-agent-gateway";
const CONFIG_VOLUME_NAME: &str = "otel-agent-gateway-config";

const DEFAULT_CONFIG: &str = "receivers:
  otlp:
    protocols:
      grpc:
        endpoint: 0.0.0.0:4317
      http:
        endpoint: 0.0.0.0:4318
exporters:
  datadog:
    api:
      key: ${env:DD_API_KEY}
      site: ${env:DD_SITE}
processors:
  batch:
    timeout: 10s
service:
  pipelines:
    traces:
      receivers: [otlp]
      processors: [batch]
      exporters: [datadog]
    metrics:
      receivers: [otlp]
      processors: [batch]
      exporters: [datadog]
    logs:
      receivers: [otlp]
      processors: [batch]
      exporters: [datadog]
";

/// The ports opened when none are configured. The gateway is reached through its Service, so
/// no host port is used.
pub fn default_ports() -> Vec<OtelCollectorPort> {
    [("otel-grpc", 4317), ("otel-http", 4318)]
        .into_iter()
        .map(|(name, port)| OtelCollectorPort {
            name: name.to_owned(),
            container_port: port,
            host_port: None,
            protocol: Some("TCP".to_owned()),
        })
        .collect()
}

fn protocol(port: &OtelCollectorPort) -> String {
    port.protocol.clone().unwrap_or_else(|| "TCP".to_owned())
}

#[derive(Debug, Default)]
pub struct OtelAgentGatewayFeature {
    owner: Owner,
    ports: Vec<OtelCollectorPort>,
    custom_config: Option<String>,
    config_checksum: Option<String>,
}

pub fn build(_options: &FeatureOptions) -> Box<dyn Feature> {
    Box::<OtelAgentGatewayFeature>::default()
}

impl OtelAgentGatewayFeature {
    fn config_map_name(&self) -> String {
        format!(
            "{}-config",
            self.owner.component_name(ComponentName::OtelAgentGateway)
        )
    }
}

impl Feature for OtelAgentGatewayFeature {
    fn id(&self) -> FeatureId {
        FeatureId::OTEL_AGENT_GATEWAY
    }

    fn configure(
        &mut self,
        owner: &ObjectMeta,
        spec: &mut DatadogAgentSpec,
        _remote_config: Option<&RemoteConfigConfiguration>,
    ) -> RequiredComponents {
        let Some(config) = spec
            .features
            .as_ref()
            .and_then(|features| features.otel_agent_gateway.as_ref())
            .filter(|config| enabled(config.enabled))
        else {
            return RequiredComponents::default();
        };

        self.owner = Owner::new(owner);
        self.ports = if config.ports.is_empty() {
            default_ports()
        } else {
            config.ports.clone()
        };
        self.custom_config = config.conf.clone();

        RequiredComponents {
            otel_agent_gateway: RequiredComponent::enabled([ContainerName::OtelAgentGateway]),
            ..RequiredComponents::default()
        }
    }

    fn manage_dependencies(
        &mut self,
        managers: &mut ResourceManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let config = self
            .custom_config
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG.to_owned());
        let checksum = managers
            .config_map()
            .add_config_map(
                &self.owner.namespace,
                &self.config_map_name(),
                BTreeMap::from([(CONFIG_FILE_NAME.to_owned(), config)]),
            )
            .context(StoreSnafu)?;
        self.config_checksum = Some(checksum);

        let service_ports = self
            .ports
            .iter()
            .map(|port| ServicePort {
                name: Some(port.name.clone()),
                port: port.container_port,
                target_port: Some(IntOrString::Int(port.container_port)),
                protocol: Some(protocol(port)),
                ..ServicePort::default()
            })
            .collect();
        managers
            .service()
            .add_service(
                &self.owner.namespace,
                &self.owner.component_name(ComponentName::OtelAgentGateway),
                self.owner.component_selector(ComponentName::OtelAgentGateway),
                service_ports,
                None,
            )
            .context(StoreSnafu)
    }

    fn manage_otel_agent_gateway(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let gateway = ContainerName::OtelAgentGateway;
        let config_map_name = self.config_map_name();

        managers.volume().add_volume(&config_map_volume(
            CONFIG_VOLUME_NAME,
            &config_map_name,
            &[(CONFIG_FILE_NAME, CONFIG_FILE_NAME)],
        ));
        managers.volume_mount().add_volume_mount_to_container(
            &VolumeMount {
                name: CONFIG_VOLUME_NAME.to_owned(),
                mount_path: CONFIG_MOUNT_PATH.to_owned(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
            gateway,
        );
        if let Some(checksum) = &self.config_checksum {
            managers
                .annotation()
                .add_annotation(checksum_annotation_key(&config_map_name), checksum.as_str());
        }

        for port in &self.ports {
            managers.port().add_port_to_container(
                gateway,
                &ContainerPort {
                    name: Some(port.name.clone()),
                    container_port: port.container_port,
                    protocol: Some(protocol(port)),
                    ..ContainerPort::default()
                },
            );
        }

        Ok(())
    }
}
