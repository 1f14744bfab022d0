//! The `DatadogAgent` custom resource, as far as the composition engine reads it.
//!
//! Validation and defaulting belong to the admission layer. Everything here is optional and
//! features fall back to their own defaults.
use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    component::ComponentName,
    required::{RequiredComponent, RequiredComponents},
};

/// Deploys the Datadog Agent and its companion workloads.
#[derive(
    Clone, CustomResource, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[kube(
    group = "datadoghq.com",
    version = "v2alpha1",
    kind = "DatadogAgent",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DatadogAgentSpec {
    /// Per-capability configuration blocks.
    pub features: Option<FeaturesConfig>,

    /// Settings shared by every component.
    pub global: Option<GlobalConfig>,

    /// Per-component customisation.
    #[serde(default, rename = "override")]
    pub overrides: BTreeMap<ComponentName, ComponentOverride>,
}

impl DatadogAgentSpec {
    /// Components explicitly switched off through their override.
    ///
    /// The returned record is folded into every feature's requirements, so a disabled component
    /// stays off whatever features ask for.
    pub fn disabled_components(&self) -> RequiredComponents {
        let mut disabled = RequiredComponents::default();
        for (component, component_override) in &self.overrides {
            if component_override.disabled == Some(true) {
                *disabled.get_mut(*component) = RequiredComponent::disabled();
            }
        }

        disabled
    }

    pub fn container_strategy(&self) -> ContainerStrategy {
        self.global
            .as_ref()
            .and_then(|global| global.container_strategy)
            .unwrap_or_default()
    }

    pub fn create_network_policies(&self) -> bool {
        self.global
            .as_ref()
            .and_then(|global| global.network_policy.as_ref())
            .and_then(|network_policy| network_policy.create)
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    pub cluster_name: Option<String>,

    /// How the node agent containers are laid out.
    pub container_strategy: Option<ContainerStrategy>,

    /// Run the process checks inside the core agent instead of a dedicated process-agent.
    pub run_process_checks_in_core_agent: Option<bool>,

    pub network_policy: Option<NetworkPolicyConfig>,
}

/// Layout of the node agent pod.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ContainerStrategy {
    /// One container per agent process.
    #[default]
    Optimized,

    /// All unprivileged agent processes share a single container.
    SingleContainer,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyConfig {
    /// Create Kubernetes NetworkPolicies for the components.
    pub create: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentOverride {
    /// Do not deploy the component at all.
    pub disabled: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesConfig {
    pub log_collection: Option<LogCollectionFeatureConfig>,
    pub live_process_collection: Option<LiveProcessCollectionFeatureConfig>,
    pub npm: Option<NpmFeatureConfig>,
    pub apm: Option<ApmFeatureConfig>,
    pub cluster_checks: Option<ClusterChecksFeatureConfig>,
    pub kubernetes_state_core: Option<KubernetesStateCoreFeatureConfig>,
    pub otlp: Option<OtlpFeatureConfig>,
    pub otel_collector: Option<OtelCollectorFeatureConfig>,
    pub otel_agent_gateway: Option<OtelAgentGatewayFeatureConfig>,
    pub sbom: Option<SbomFeatureConfig>,
    pub dogstatsd: Option<DogstatsdFeatureConfig>,
    pub external_metrics_server: Option<ExternalMetricsServerFeatureConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCollectionFeatureConfig {
    pub enabled: Option<bool>,
    pub container_collect_all: Option<bool>,
    pub container_collect_using_files: Option<bool>,
    pub container_logs_path: Option<String>,
    pub pod_logs_path: Option<String>,
    pub container_symlinks_path: Option<String>,
    pub temp_storage_path: Option<String>,
    pub open_files_limit: Option<i32>,
    pub auto_multi_line_detection: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveProcessCollectionFeatureConfig {
    pub enabled: Option<bool>,
    pub scrub_process_arguments: Option<bool>,
    pub strip_process_arguments: Option<bool>,
}

/// Network Performance Monitoring.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NpmFeatureConfig {
    pub enabled: Option<bool>,
    pub collect_dns_stats: Option<bool>,
    pub enable_conntrack: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApmFeatureConfig {
    pub enabled: Option<bool>,
    pub host_port_config: Option<HostPortConfig>,
    pub unix_domain_socket_config: Option<UnixDomainSocketConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPortConfig {
    pub enabled: Option<bool>,
    pub host_port: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnixDomainSocketConfig {
    pub enabled: Option<bool>,
    pub path: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterChecksFeatureConfig {
    pub enabled: Option<bool>,
    pub use_cluster_checks_runners: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesStateCoreFeatureConfig {
    pub enabled: Option<bool>,

    /// Also collect metrics about CustomResourceDefinitions.
    pub collect_crd_metrics: Option<bool>,

    /// Replaces the generated check configuration.
    pub conf: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpFeatureConfig {
    pub receiver: Option<OtlpReceiverConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpReceiverConfig {
    pub protocols: Option<OtlpProtocolsConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpProtocolsConfig {
    pub grpc: Option<OtlpProtocolConfig>,
    pub http: Option<OtlpProtocolConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpProtocolConfig {
    pub enabled: Option<bool>,

    /// Listen address such as `0.0.0.0:4317`. Unix sockets are not supported.
    pub endpoint: Option<String>,

    pub host_port_config: Option<HostPortConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtelCollectorFeatureConfig {
    pub enabled: Option<bool>,

    /// Ports opened by the collector. Filled with the OTLP defaults when empty.
    #[serde(default)]
    pub ports: Vec<OtelCollectorPort>,

    /// Collector configuration replacing the built-in one.
    pub conf: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtelCollectorPort {
    pub name: String,
    pub container_port: i32,
    pub host_port: Option<i32>,
    pub protocol: Option<String>,
}

/// The cluster-wide OpenTelemetry gateway receiving telemetry from the node agents.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtelAgentGatewayFeatureConfig {
    pub enabled: Option<bool>,

    /// Ports opened by the gateway. The OTLP gRPC and HTTP ports when empty.
    #[serde(default)]
    pub ports: Vec<OtelCollectorPort>,

    /// Gateway configuration replacing the built-in one.
    pub conf: Option<String>,
}

/// Software Bill of Materials collection.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SbomFeatureConfig {
    pub enabled: Option<bool>,
    pub container_image: Option<SbomTypeConfig>,
    pub host: Option<SbomTypeConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SbomTypeConfig {
    pub enabled: Option<bool>,

    #[serde(default)]
    pub analyzers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DogstatsdFeatureConfig {
    pub enabled: Option<bool>,
    pub origin_detection_enabled: Option<bool>,
    pub host_port_config: Option<HostPortConfig>,
    pub unix_domain_socket_config: Option<UnixDomainSocketConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMetricsServerFeatureConfig {
    pub enabled: Option<bool>,
    pub port: Option<i32>,
    pub use_datadogmetrics: Option<bool>,

    /// Register the `external.metrics.k8s.io` APIService, defaults to true.
    pub register_api_service: Option<bool>,
}

/// Feature state pushed through Remote Configuration. Takes precedence over the resource.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfigConfiguration {
    pub features: Option<RemoteConfigFeatures>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfigFeatures {
    pub sbom: Option<SbomFeatureConfig>,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::required::Requirement;

    #[test]
    fn deserialize_with_overrides() {
        let agent: DatadogAgent = serde_yaml::from_str(indoc! {"
            apiVersion: datadoghq.com/v2alpha1
            kind: DatadogAgent
            metadata:
              name: datadog
              namespace: monitoring
            spec:
              global:
                containerStrategy: singleContainer
              features:
                npm:
                  enabled: true
              override:
                clusterAgent:
                  disabled: true
                nodeAgent:
                  disabled: false
        "})
        .unwrap();

        assert_eq!(agent.spec.container_strategy(), ContainerStrategy::SingleContainer);
        assert!(!agent.spec.create_network_policies());

        let disabled = agent.spec.disabled_components();
        assert_eq!(disabled.cluster_agent.required, Requirement::Disabled);
        assert_eq!(disabled.node_agent.required, Requirement::Unset);
        assert_eq!(disabled.cluster_checks_runner.required, Requirement::Unset);
    }

    #[test]
    fn empty_spec_uses_defaults() {
        let spec = DatadogAgentSpec::default();

        assert_eq!(spec.container_strategy(), ContainerStrategy::Optimized);
        assert_eq!(spec.disabled_components(), RequiredComponents::default());
    }
}
