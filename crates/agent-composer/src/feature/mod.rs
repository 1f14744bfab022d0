//! The contract every capability module implements, and the registry they are built from.
//!
//! A feature is instantiated fresh for every composition run. It first inspects the resource in
//! [`Feature::configure`] and reports which components it needs, then contributes auxiliary
//! objects in [`Feature::manage_dependencies`] and finally mutates the pod template of every
//! deployed component through the `manage_*` hooks.
use std::{collections::BTreeMap, fmt::Display};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::{
    component::ComponentName,
    crd::{DatadogAgentSpec, HostPortConfig, RemoteConfigConfiguration, UnixDomainSocketConfig},
    merger::{self, PodTemplateManagers},
    required::RequiredComponents,
    store::{self, ResourceManagers},
};

pub use self::registry::{BuildFn, FeatureRegistry};

pub mod apm;
pub mod cluster_checks;
pub mod dogstatsd;
pub mod external_metrics;
pub mod kubernetes_state_core;
pub mod live_process;
pub mod log_collection;
pub mod npm;
pub mod otel_agent_gateway;
pub mod otel_collector;
pub mod otlp;
pub mod registry;
pub mod sbom;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to store auxiliary object"))]
    Store { source: store::Error },

    #[snafu(display("failed to merge into the pod template"))]
    Merge { source: merger::Error },

    #[snafu(display(
        "OTLP endpoint {endpoint:?} is not supported, only TCP endpoints with a port are"
    ))]
    UnsupportedOtlpEndpoint { endpoint: String },
}

/// Identifier of a feature. Features are always processed in the order of their identifiers.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FeatureId(&'static str);

impl FeatureId {
    pub const APM: Self = Self("apm");
    pub const CLUSTER_CHECKS: Self = Self("cluster_checks");
    pub const DOGSTATSD: Self = Self("dogstatsd");
    pub const EXTERNAL_METRICS: Self = Self("external_metrics");
    pub const KUBERNETES_STATE_CORE: Self = Self("kubernetes_state_core");
    pub const LIVE_PROCESS: Self = Self("live_process");
    pub const LOG_COLLECTION: Self = Self("log_collection");
    pub const NPM: Self = Self("npm");
    pub const OTEL_AGENT_GATEWAY: Self = Self("otel_agent_gateway");
    pub const OTEL_COLLECTOR: Self = Self("otel_collector");
    pub const OTLP: Self = Self("otlp");
    pub const SBOM: Self = Self("sbom");

    pub const fn new(id: &'static str) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Operator-wide settings handed to every feature builder.
#[cfg_attr(
    feature = "clap",
    derive(clap::Args),
    command(next_help_heading = "Feature Options")
)]
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureOptions {
    /// Run the process checks inside the core agent unless the DatadogAgent says otherwise.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub process_checks_in_core_agent: bool,

    /// Allow DatadogAgents to enable the OpenTelemetry collector.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub otel_agent_enabled: bool,
}

/// A capability that can require and shape the deployed components.
///
/// Only [`Feature::id`], [`Feature::configure`] and [`Feature::manage_dependencies`] are
/// mandatory. The component hooks default to doing nothing.
pub trait Feature: Send {
    fn id(&self) -> FeatureId;

    /// Reads the resource and reports which components and containers are needed.
    ///
    /// Must not depend on cluster state. The only allowed change to `spec` is an idempotent
    /// normalization of the feature's own block.
    fn configure(
        &mut self,
        owner: &ObjectMeta,
        spec: &mut DatadogAgentSpec,
        remote_config: Option<&RemoteConfigConfiguration>,
    ) -> RequiredComponents;

    /// Builds and stores the auxiliary objects (RBAC, ConfigMaps, Services, ...) of the feature.
    fn manage_dependencies(&mut self, managers: &mut ResourceManagers<'_>, provider: &str)
    -> Result<()>;

    fn manage_cluster_agent(
        &self,
        _managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn manage_node_agent(
        &self,
        _managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// Used instead of [`Feature::manage_node_agent`] when all node agent processes share the
    /// unprivileged single container.
    fn manage_single_container_node_agent(
        &self,
        _managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn manage_cluster_checks_runner(
        &self,
        _managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn manage_otel_agent_gateway(
        &self,
        _managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Feature").field(&self.id()).finish()
    }
}

/// Every feature shipped with the crate.
pub const BUILTIN_FEATURES: [(FeatureId, BuildFn); 12] = [
    (FeatureId::APM, apm::build),
    (FeatureId::CLUSTER_CHECKS, cluster_checks::build),
    (FeatureId::DOGSTATSD, dogstatsd::build),
    (FeatureId::EXTERNAL_METRICS, external_metrics::build),
    (FeatureId::KUBERNETES_STATE_CORE, kubernetes_state_core::build),
    (FeatureId::LIVE_PROCESS, live_process::build),
    (FeatureId::LOG_COLLECTION, log_collection::build),
    (FeatureId::NPM, npm::build),
    (FeatureId::OTEL_AGENT_GATEWAY, otel_agent_gateway::build),
    (FeatureId::OTEL_COLLECTOR, otel_collector::build),
    (FeatureId::OTLP, otlp::build),
    (FeatureId::SBOM, sbom::build),
];

pub const AGENT_NAME_LABEL: &str = "agent.datadoghq.com/name";
pub const COMPONENT_LABEL: &str = "agent.datadoghq.com/component";

/// Whether an optional `enabled` flag is set to true.
pub(crate) fn enabled(flag: Option<bool>) -> bool {
    flag.unwrap_or(false)
}

/// The host port to expose, if host port exposure is enabled.
pub(crate) fn configured_host_port(config: Option<&HostPortConfig>, default: i32) -> Option<i32> {
    config
        .filter(|config| enabled(config.enabled))
        .map(|config| config.host_port.unwrap_or(default))
}

/// The socket path to listen on. Sockets are used unless explicitly disabled.
pub(crate) fn configured_socket_path(
    config: Option<&UnixDomainSocketConfig>,
    default: &str,
) -> Option<String> {
    match config {
        Some(config) if config.enabled == Some(false) => None,
        Some(config) => Some(config.path.clone().unwrap_or_else(|| default.to_owned())),
        None => Some(default.to_owned()),
    }
}

/// Directory holding the socket, which is what gets mounted from the host.
pub(crate) fn socket_dir(socket_path: &str) -> &str {
    match socket_path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => ".",
    }
}

/// Name and namespace of the owning resource, captured during configure for later steps.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Owner {
    pub name: String,
    pub namespace: String,
}

impl Owner {
    pub fn new(meta: &ObjectMeta) -> Self {
        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
        }
    }

    /// Name of the object created for `component`, also used for its service account.
    pub fn component_name(&self, component: ComponentName) -> String {
        format!("{}-{}", self.name, component.short_name())
    }

    /// Labels selecting the pods of `component`.
    pub fn component_selector(&self, component: ComponentName) -> BTreeMap<String, String> {
        BTreeMap::from([
            (AGENT_NAME_LABEL.to_owned(), self.name.clone()),
            (COMPONENT_LABEL.to_owned(), component.short_name().to_owned()),
        ])
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use k8s_openapi::{
        api::core::v1::PodTemplateSpec, apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use crate::{
        component::ContainerName,
        crd::DatadogAgentSpec,
        merger::test_util::container,
    };

    pub fn spec(yaml: &str) -> DatadogAgentSpec {
        serde_yaml::from_str(yaml).expect("test spec must be valid")
    }

    pub fn owner() -> ObjectMeta {
        crate::store::test_util::owner().metadata
    }

    pub fn env_value(
        template: &PodTemplateSpec,
        role: ContainerName,
        name: &str,
    ) -> Option<String> {
        container(template, role)
            .env
            .iter()
            .flatten()
            .find(|env_var| env_var.name == name)
            .and_then(|env_var| env_var.value.clone())
    }

    pub fn mount_paths(template: &PodTemplateSpec, role: ContainerName) -> Vec<String> {
        container(template, role)
            .volume_mounts
            .iter()
            .flatten()
            .map(|mount| mount.mount_path.clone())
            .collect()
    }
}
