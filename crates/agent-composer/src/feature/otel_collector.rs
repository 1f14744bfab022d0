//! The OpenTelemetry collector running next to the core agent.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{ContainerPort, VolumeMount},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use snafu::ResultExt;
use tracing::warn;

use super::{Feature, FeatureId, FeatureOptions, MergeSnafu, Owner, Result, StoreSnafu, enabled};
use crate::{
    component::ContainerName,
    crd::{DatadogAgentSpec, OtelCollectorPort, RemoteConfigConfiguration},
    merger::{
        PodTemplateManagers,
        env_var::{env_var, ignore_new},
        volume::config_map_volume,
    },
    required::{RequiredComponent, RequiredComponents},
    store::{ResourceManagers, config_map::checksum_annotation_key},
};

pub const DD_OTELCOLLECTOR_ENABLED: &str = "DD_OTELCOLLECTOR_ENABLED";
pub const DD_AGENT_IPC_PORT: &str = "DD_AGENT_IPC_PORT";
pub const DD_AGENT_IPC_CONFIG_REFRESH_INTERVAL: &str = "DD_AGENT_IPC_CONFIG_REFRESH_INTERVAL";

pub const DEFAULT_IPC_PORT: i32 = 5009;
pub const DEFAULT_IPC_REFRESH_INTERVAL: i32 = 60;

pub const CONFIG_FILE_NAME: &str = "otel-config.yaml";
pub const CONFIG_MOUNT_PATH: &str = "/etc/otel-agent";
const CONFIG_VOLUME_NAME: &str = "otel-agent-config";

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
  infraattributes:
    cardinality: 2
  batch:
    timeout: 10s
connectors:
  datadog/connector:
    traces:
      compute_top_level_by_span_kind: true
service:
  pipelines:
    traces:
      receivers: [otlp]
      processors: [infraattributes, batch]
      exporters: [datadog, datadog/connector]
    metrics:
      receivers: [otlp, datadog/connector]
      processors: [infraattributes, batch]
      exporters: [datadog]
    logs:
      receivers: [otlp]
      processors: [infraattributes, batch]
      exporters: [datadog]
";

/// The ports opened when none are configured.
pub fn default_ports() -> Vec<OtelCollectorPort> {
    [("otel-grpc", 4317), ("otel-http", 4318)]
        .into_iter()
        .map(|(name, port)| OtelCollectorPort {
            name: name.to_owned(),
            container_port: port,
            host_port: Some(port),
            protocol: Some("TCP".to_owned()),
        })
        .collect()
}

#[derive(Debug)]
pub struct OtelCollectorFeature {
    owner: Owner,
    allowed: bool,
    ports: Vec<OtelCollectorPort>,
    custom_config: Option<String>,
    config_checksum: Option<String>,
}

pub fn build(options: &FeatureOptions) -> Box<dyn Feature> {
    Box::new(OtelCollectorFeature {
        owner: Owner::default(),
        allowed: options.otel_agent_enabled,
        ports: Vec::new(),
        custom_config: None,
        config_checksum: None,
    })
}

impl OtelCollectorFeature {
    fn config_map_name(&self) -> String {
        format!("{}-otel-agent-config", self.owner.name)
    }
}

impl Feature for OtelCollectorFeature {
    fn id(&self) -> FeatureId {
        FeatureId::OTEL_COLLECTOR
    }

    /// Fills in the default ports when none are configured, so the resource shows the ports
    /// actually opened.
    fn configure(
        &mut self,
        owner: &ObjectMeta,
        spec: &mut DatadogAgentSpec,
        _remote_config: Option<&RemoteConfigConfiguration>,
    ) -> RequiredComponents {
        let Some(config) = spec
            .features
            .as_mut()
            .and_then(|features| features.otel_collector.as_mut())
            .filter(|config| enabled(config.enabled))
        else {
            return RequiredComponents::default();
        };

        if !self.allowed {
            warn!("the OpenTelemetry collector is not allowed by the operator, ignoring it");
            return RequiredComponents::default();
        }

        if config.ports.is_empty() {
            config.ports = default_ports();
        }
        self.owner = Owner::new(owner);
        self.ports = config.ports.clone();
        self.custom_config = config.conf.clone();

        RequiredComponents {
            node_agent: RequiredComponent::enabled([
                ContainerName::CoreAgent,
                ContainerName::OtelAgent,
            ]),
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

        Ok(())
    }

    fn manage_node_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let otel = ContainerName::OtelAgent;
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
            otel,
        );
        if let Some(checksum) = &self.config_checksum {
            managers
                .annotation()
                .add_annotation(checksum_annotation_key(&config_map_name), checksum.as_str());
        }

        for port in &self.ports {
            managers.port().add_port_to_container(
                otel,
                &ContainerPort {
                    name: Some(port.name.clone()),
                    container_port: port.container_port,
                    host_port: port.host_port,
                    protocol: Some(port.protocol.clone().unwrap_or_else(|| "TCP".to_owned())),
                    host_ip: None,
                },
            );
        }

        let mut env = managers.env_var();
        env.add_env_var_to_container(
            ContainerName::CoreAgent,
            env_var(DD_OTELCOLLECTOR_ENABLED, "true"),
        );
        // Another component may already have chosen the IPC settings.
        for container in [ContainerName::CoreAgent, otel] {
            for ipc in [
                env_var(DD_AGENT_IPC_PORT, DEFAULT_IPC_PORT.to_string()),
                env_var(
                    DD_AGENT_IPC_CONFIG_REFRESH_INTERVAL,
                    DEFAULT_IPC_REFRESH_INTERVAL.to_string(),
                ),
            ] {
                env.add_env_var_to_container_with_merge_fn(container, ipc, ignore_new)
                    .context(MergeSnafu)?;
            }
        }

        Ok(())
    }
}
