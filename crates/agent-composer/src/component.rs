//! Names of the deployable components and of the container roles inside their pod templates.
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// One of the workloads managed for a `DatadogAgent`.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    IntoStaticStr,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ComponentName {
    /// The cluster-wide coordinator (Deployment).
    ClusterAgent,

    /// The per-node agent (DaemonSet).
    NodeAgent,

    /// The optional pool of cluster check runners (Deployment).
    ClusterChecksRunner,

    /// The OpenTelemetry gateway (Deployment).
    OtelAgentGateway,
}

impl ComponentName {
    /// Short name used for object names and the `agent.datadoghq.com/component` label.
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::ClusterAgent => "cluster-agent",
            Self::NodeAgent => "agent",
            Self::ClusterChecksRunner => "cluster-checks-runner",
            Self::OtelAgentGateway => "otel-agent-gateway",
        }
    }

    /// The main container of the component. The node agent has several, its core agent is returned.
    pub fn main_container(&self) -> ContainerName {
        match self {
            Self::ClusterAgent => ContainerName::ClusterAgent,
            Self::NodeAgent => ContainerName::CoreAgent,
            Self::ClusterChecksRunner => ContainerName::ClusterChecksRunner,
            Self::OtelAgentGateway => ContainerName::OtelAgentGateway,
        }
    }
}

/// A named container slot inside a component's pod template.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    IntoStaticStr,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ContainerName {
    #[serde(rename = "agent")]
    #[strum(to_string = "agent")]
    CoreAgent,
    TraceAgent,
    ProcessAgent,
    SecurityAgent,
    SystemProbe,
    OtelAgent,
    AgentDataPlane,
    UnprivilegedSingleAgent,
    ClusterAgent,
    ClusterChecksRunner,
    OtelAgentGateway,

    InitVolume,
    InitConfig,
    SeccompSetup,
}

impl ContainerName {
    pub const INIT_CONTAINERS: [Self; 3] = [Self::InitVolume, Self::InitConfig, Self::SeccompSetup];

    /// Roles that need kernel-level access and therefore a dedicated, privileged container.
    pub const PRIVILEGED_CONTAINERS: [Self; 2] = [Self::SecurityAgent, Self::SystemProbe];

    /// Init containers only accept mutations through the dedicated init-container accessors.
    pub fn is_init(&self) -> bool {
        Self::INIT_CONTAINERS.contains(self)
    }

    pub fn is_privileged(&self) -> bool {
        Self::PRIVILEGED_CONTAINERS.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ContainerName::CoreAgent, "agent")]
    #[case(ContainerName::UnprivilegedSingleAgent, "unprivileged-single-agent")]
    #[case(ContainerName::SystemProbe, "system-probe")]
    #[case(ContainerName::InitVolume, "init-volume")]
    fn container_names(#[case] container: ContainerName, #[case] expected: &str) {
        assert_eq!(container.as_str(), expected);
        assert_eq!(container.to_string(), expected);
        assert_eq!(ContainerName::from_str(expected).unwrap(), container);
        assert_eq!(
            serde_json::to_value(container).unwrap(),
            serde_json::Value::String(expected.to_owned())
        );
    }

    #[test]
    fn init_and_privileged_roles() {
        assert!(ContainerName::SeccompSetup.is_init());
        assert!(!ContainerName::CoreAgent.is_init());
        assert!(ContainerName::SystemProbe.is_privileged());
        assert!(!ContainerName::TraceAgent.is_privileged());
    }

    #[test]
    fn component_names_serialize_camel_case() {
        assert_eq!(
            serde_json::to_value(ComponentName::ClusterChecksRunner).unwrap(),
            serde_json::Value::String("clusterChecksRunner".to_owned())
        );
        assert_eq!(ComponentName::NodeAgent.short_name(), "agent");
    }
}
