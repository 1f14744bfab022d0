//! OTLP ingestion in the core agent, and in the trace-agent when APM is enabled.
use std::sync::LazyLock;

use k8s_openapi::{
    api::core::v1::{ContainerPort, ServicePort},
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use regex::Regex;
use snafu::{OptionExt, ResultExt};
use tracing::debug;

use super::{
    Feature, FeatureId, FeatureOptions, Owner, Result, StoreSnafu, UnsupportedOtlpEndpointSnafu,
    enabled,
};
use crate::{
    component::{ComponentName, ContainerName},
    crd::{DatadogAgentSpec, OtlpProtocolConfig, RemoteConfigConfiguration},
    merger::{PodTemplateManagers, env_var::env_var},
    required::{RequiredComponent, RequiredComponents},
    store::ResourceManagers,
};

pub const DD_OTLP_GRPC_ENDPOINT: &str = "DD_OTLP_CONFIG_RECEIVER_PROTOCOLS_GRPC_ENDPOINT";
pub const DD_OTLP_HTTP_ENDPOINT: &str = "DD_OTLP_CONFIG_RECEIVER_PROTOCOLS_HTTP_ENDPOINT";

pub const DEFAULT_GRPC_ENDPOINT: &str = "0.0.0.0:4317";
pub const DEFAULT_HTTP_ENDPOINT: &str = "0.0.0.0:4318";

static ENDPOINT_PORT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)$").expect("failed to compile OTLP endpoint port regex"));

/// The port of a TCP endpoint such as `0.0.0.0:4317`.
///
/// Returns [`None`] for Unix sockets and endpoints without a valid port.
pub fn endpoint_port(endpoint: &str) -> Option<i32> {
    if endpoint.starts_with("unix:") {
        return None;
    }

    ENDPOINT_PORT_REGEX
        .captures(endpoint)
        .and_then(|captures| captures[1].parse::<u16>().ok())
        .map(i32::from)
}

/// One enabled receiver protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Protocol {
    port_name: &'static str,
    env_name: &'static str,
    endpoint: String,
    host_port_enabled: bool,
    host_port: Option<i32>,

    /// Filled in once the endpoint was validated.
    port: Option<i32>,
}

impl Protocol {
    fn from_config(
        config: Option<&OtlpProtocolConfig>,
        port_name: &'static str,
        env_name: &'static str,
        default_endpoint: &str,
    ) -> Option<Self> {
        let config = config.filter(|config| enabled(config.enabled))?;

        Some(Self {
            port_name,
            env_name,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| default_endpoint.to_owned()),
            host_port_enabled: config
                .host_port_config
                .as_ref()
                .is_some_and(|host_port| enabled(host_port.enabled)),
            host_port: config
                .host_port_config
                .as_ref()
                .and_then(|host_port| host_port.host_port),
            port: None,
        })
    }

    fn container_port(&self) -> Option<ContainerPort> {
        let port = self.port?;

        Some(ContainerPort {
            name: Some(self.port_name.to_owned()),
            container_port: port,
            host_port: self
                .host_port_enabled
                .then(|| self.host_port.unwrap_or(port)),
            protocol: Some("TCP".to_owned()),
            host_ip: None,
        })
    }
}

#[derive(Debug, Default)]
pub struct OtlpFeature {
    owner: Owner,
    protocols: Vec<Protocol>,
    apm_enabled: bool,
}

pub fn build(_options: &FeatureOptions) -> Box<dyn Feature> {
    Box::<OtlpFeature>::default()
}

impl OtlpFeature {
    fn local_service_name(&self) -> String {
        format!("{}-local", self.owner.component_name(ComponentName::NodeAgent))
    }

    fn manage_agent_containers(
        &self,
        core: ContainerName,
        trace: Option<ContainerName>,
        managers: &mut PodTemplateManagers<'_>,
    ) {
        let containers: Vec<_> = std::iter::once(core).chain(trace).collect();
        for protocol in &self.protocols {
            managers.env_var().add_env_var_to_containers(
                &containers,
                &env_var(protocol.env_name, protocol.endpoint.as_str()),
            );

            if let Some(port) = protocol.container_port() {
                managers.port().add_port_to_container(core, &port);
            }
        }
    }
}

impl Feature for OtlpFeature {
    fn id(&self) -> FeatureId {
        FeatureId::OTLP
    }

    fn configure(
        &mut self,
        owner: &ObjectMeta,
        spec: &mut DatadogAgentSpec,
        _remote_config: Option<&RemoteConfigConfiguration>,
    ) -> RequiredComponents {
        let Some(features) = spec.features.as_ref() else {
            return RequiredComponents::default();
        };
        let protocols = features
            .otlp
            .as_ref()
            .and_then(|otlp| otlp.receiver.as_ref())
            .and_then(|receiver| receiver.protocols.as_ref());
        let Some(protocols) = protocols else {
            return RequiredComponents::default();
        };

        self.protocols = [
            Protocol::from_config(
                protocols.grpc.as_ref(),
                "otlpgrpcport",
                DD_OTLP_GRPC_ENDPOINT,
                DEFAULT_GRPC_ENDPOINT,
            ),
            Protocol::from_config(
                protocols.http.as_ref(),
                "otlphttpport",
                DD_OTLP_HTTP_ENDPOINT,
                DEFAULT_HTTP_ENDPOINT,
            ),
        ]
        .into_iter()
        .flatten()
        .collect();
        if self.protocols.is_empty() {
            return RequiredComponents::default();
        }

        self.owner = Owner::new(owner);
        self.apm_enabled = features
            .apm
            .as_ref()
            .is_some_and(|apm| enabled(apm.enabled));

        let mut containers = vec![ContainerName::CoreAgent];
        if self.apm_enabled {
            containers.push(ContainerName::TraceAgent);
        }

        RequiredComponents {
            node_agent: RequiredComponent::enabled(containers),
            ..RequiredComponents::default()
        }
    }

    /// Validates the endpoints and exposes the receivers through a node-local Service.
    fn manage_dependencies(
        &mut self,
        managers: &mut ResourceManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        for protocol in &mut self.protocols {
            let port = endpoint_port(&protocol.endpoint).context(UnsupportedOtlpEndpointSnafu {
                endpoint: protocol.endpoint.clone(),
            })?;
            protocol.port = Some(port);
        }

        // Internal traffic policies are available since Kubernetes 1.22.
        if !managers.store().platform_info().is_at_least(1, 22) {
            debug!("cluster does not support internal traffic policies, skipping local service");
            return Ok(());
        }

        let ports = self
            .protocols
            .iter()
            .filter_map(|protocol| {
                protocol.port.map(|port| ServicePort {
                    name: Some(protocol.port_name.to_owned()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".to_owned()),
                    ..ServicePort::default()
                })
            })
            .collect();

        managers
            .service()
            .add_service(
                &self.owner.namespace,
                &self.local_service_name(),
                self.owner.component_selector(ComponentName::NodeAgent),
                ports,
                Some("Local"),
            )
            .context(StoreSnafu)
    }

    fn manage_node_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let trace = self.apm_enabled.then_some(ContainerName::TraceAgent);
        self.manage_agent_containers(ContainerName::CoreAgent, trace, managers);
        Ok(())
    }

    fn manage_single_container_node_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        self.manage_agent_containers(ContainerName::UnprivilegedSingleAgent, None, managers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use k8s_openapi::api::core::v1::Service;
    use rstest::rstest;

    use super::*;
    use crate::{
        feature::{
            Error,
            test_util::{env_value, owner, spec},
        },
        merger::test_util::{container, template},
        store::{PlatformInfo, Store},
    };

    #[rstest]
    #[case("0.0.0.0:4317", Some(4317))]
    #[case("localhost:55681", Some(55681))]
    #[case("unix:///var/run/otlp.sock", None)]
    #[case("0.0.0.0", None)]
    #[case("0.0.0.0:65535", Some(65535))]
    #[case("0.0.0.0:99999", None)]
    fn endpoint_ports(#[case] endpoint: &str, #[case] expected: Option<i32>) {
        assert_eq!(endpoint_port(endpoint), expected);
    }

    #[test]
    fn grpc_receiver_with_apm() {
        let mut spec = spec(indoc! {"
            features:
              apm:
                enabled: true
              otlp:
                receiver:
                  protocols:
                    grpc:
                      enabled: true
                      hostPortConfig:
                        enabled: true
                    http:
                      enabled: false
        "});
        let mut feature = OtlpFeature::default();
        let required = feature.configure(&owner(), &mut spec, None);
        assert_eq!(
            required.node_agent.containers,
            vec![ContainerName::CoreAgent, ContainerName::TraceAgent]
        );

        let mut store = crate::store::test_util::store();
        feature
            .manage_dependencies(&mut ResourceManagers::new(&mut store), "")
            .unwrap();
        let service = store.get::<Service>("monitoring", "datadog-agent-local").unwrap();
        let service_spec = service.spec.as_ref().unwrap();
        assert_eq!(service_spec.internal_traffic_policy.as_deref(), Some("Local"));
        assert_eq!(service_spec.ports.as_ref().unwrap()[0].port, 4317);

        let (core, trace) = (ContainerName::CoreAgent, ContainerName::TraceAgent);
        let mut template = template(&[core, trace], &[]);
        feature
            .manage_node_agent(&mut PodTemplateManagers::new(&mut template), "")
            .unwrap();

        let port = &container(&template, core).ports.as_ref().unwrap()[0];
        assert_eq!((port.container_port, port.host_port), (4317, Some(4317)));
        assert_eq!(
            env_value(&template, trace, DD_OTLP_GRPC_ENDPOINT).as_deref(),
            Some(DEFAULT_GRPC_ENDPOINT)
        );
        assert_eq!(env_value(&template, core, DD_OTLP_HTTP_ENDPOINT), None);
    }

    #[test]
    fn unix_endpoint_fails_dependencies() {
        let mut spec = spec(indoc! {"
            features:
              otlp:
                receiver:
                  protocols:
                    http:
                      enabled: true
                      endpoint: unix:///var/run/otlp.sock
        "});
        let mut feature = OtlpFeature::default();
        let required = feature.configure(&owner(), &mut spec, None);
        assert!(required.node_agent.is_present());

        let mut store = crate::store::test_util::store();
        let error = feature
            .manage_dependencies(&mut ResourceManagers::new(&mut store), "")
            .unwrap_err();
        assert!(matches!(error, Error::UnsupportedOtlpEndpoint { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn old_clusters_get_no_local_service() {
        let mut spec = spec(indoc! {"
            features:
              otlp:
                receiver:
                  protocols:
                    grpc:
                      enabled: true
        "});
        let mut feature = OtlpFeature::default();
        feature.configure(&owner(), &mut spec, None);

        let mut store = Store::new(
            &crate::store::test_util::owner(),
            PlatformInfo::new("v1.21.14", []),
        );
        feature
            .manage_dependencies(&mut ResourceManagers::new(&mut store), "")
            .unwrap();
        assert!(store.is_empty());
    }
}
