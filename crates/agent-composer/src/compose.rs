//! Drives every feature through its lifecycle for one `DatadogAgent`.
//!
//! A composition run builds fresh feature instances from the registry, resolves the required
//! components, lets the applicable features store their auxiliary objects and finally lets them
//! shape the pod template of every deployed component. Runs share nothing but the registry, so
//! any number of them can execute on separate threads.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{Container, PodSpec, PodTemplateSpec},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, instrument};

use crate::{
    component::{ComponentName, ContainerName},
    crd::{DatadogAgent, DatadogAgentSpec, RemoteConfigConfiguration},
    feature::{
        self, AGENT_NAME_LABEL, COMPONENT_LABEL, Feature, FeatureId, FeatureOptions,
        FeatureRegistry,
    },
    merger::PodTemplateManagers,
    required::{RequiredComponent, RequiredComponents},
    resolve::{Resolution, resolve},
    store::{PlatformInfo, ResourceManagers, Store},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("feature {feature} failed to manage its dependencies"))]
    ManageDependencies {
        source: feature::Error,
        feature: FeatureId,
    },

    #[snafu(display("feature {feature} failed to manage the {component} template"))]
    ManageComponent {
        source: feature::Error,
        feature: FeatureId,
        component: ComponentName,
    },
}

/// Provides the initial pod template of a deployed component, before any feature touched it.
pub trait ComponentTemplates: Send + Sync {
    fn template(
        &self,
        owner: &ObjectMeta,
        component: ComponentName,
        required: &RequiredComponent,
    ) -> PodTemplateSpec;
}

/// One empty container per required container role, plus the init containers of the node agent.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultComponentTemplates;

impl ComponentTemplates for DefaultComponentTemplates {
    fn template(
        &self,
        owner: &ObjectMeta,
        component: ComponentName,
        required: &RequiredComponent,
    ) -> PodTemplateSpec {
        let container = |role: &ContainerName| Container {
            name: role.to_string(),
            ..Container::default()
        };

        let mut roles: Vec<ContainerName> = Vec::new();
        for role in &required.containers {
            if !roles.contains(role) {
                roles.push(*role);
            }
        }
        if roles.is_empty() {
            roles.push(component.main_container());
        }

        let init_containers = match component {
            ComponentName::NodeAgent => {
                let mut init = vec![ContainerName::InitVolume, ContainerName::InitConfig];
                if roles.contains(&ContainerName::SystemProbe) {
                    init.push(ContainerName::SeccompSetup);
                }
                init
            }
            _ => Vec::new(),
        };

        let labels = BTreeMap::from([
            (
                AGENT_NAME_LABEL.to_owned(),
                owner.name.clone().unwrap_or_default(),
            ),
            (
                COMPONENT_LABEL.to_owned(),
                component.short_name().to_owned(),
            ),
        ]);

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..ObjectMeta::default()
            }),
            spec: Some(PodSpec {
                containers: roles.iter().map(container).collect(),
                init_containers: (!init_containers.is_empty())
                    .then(|| init_containers.iter().map(container).collect()),
                ..PodSpec::default()
            }),
        }
    }
}

/// Inputs of a composition run besides the resource itself.
#[derive(Clone, Copy, Debug)]
pub struct ComposeParams<'a> {
    pub registry: &'a FeatureRegistry,
    pub options: &'a FeatureOptions,
    pub platform_info: &'a PlatformInfo,
    pub remote_config: Option<&'a RemoteConfigConfiguration>,

    /// Components switched off by the caller, in addition to the resource's own overrides.
    pub disabled: Option<&'a RequiredComponents>,

    /// Passed through to the features, for example to adapt to a managed Kubernetes offering.
    pub provider: &'a str,
    pub templates: &'a dyn ComponentTemplates,
}

impl std::fmt::Debug for dyn ComponentTemplates + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ComponentTemplates")
    }
}

/// Desired state produced by one composition run.
#[derive(Clone, Debug, PartialEq)]
pub struct Composition {
    /// The resource after the features normalized it.
    pub spec: DatadogAgentSpec,
    pub required: RequiredComponents,
    pub enabled_features: Vec<FeatureId>,
    pub configured_features: Vec<FeatureId>,

    /// Pod templates of the deployed components.
    pub templates: BTreeMap<ComponentName, PodTemplateSpec>,
    pub store: Store,
}

/// Composes the desired state of `agent`.
///
/// Any failure aborts the whole run. Partial results are never returned, since some features
/// may already have mutated the shared templates.
#[instrument(
    name = "compose_datadog_agent",
    skip_all,
    fields(namespace = ?agent.namespace(), name = %agent.name_any())
)]
pub fn compose(agent: &DatadogAgent, params: &ComposeParams<'_>) -> Result<Composition> {
    let mut spec = agent.spec.clone();
    let mut disabled = spec.disabled_components();
    if let Some(extra) = params.disabled {
        disabled = disabled.merge(extra);
    }

    let Resolution {
        enabled,
        configured,
        required,
    } = resolve(
        params.registry.build_all(params.options),
        &agent.metadata,
        &mut spec,
        params.remote_config,
        &disabled,
    );
    let enabled_features: Vec<FeatureId> = enabled.iter().map(|feature| feature.id()).collect();
    let configured_features: Vec<FeatureId> =
        configured.iter().map(|feature| feature.id()).collect();

    let mut templates: BTreeMap<ComponentName, PodTemplateSpec> = required
        .iter()
        .filter(|(_, component)| component.is_present())
        .map(|(name, component)| {
            (
                name,
                params.templates.template(&agent.metadata, name, component),
            )
        })
        .collect();

    let mut store = Store::new(agent, params.platform_info.clone());
    let mut features: Vec<Box<dyn Feature>> = enabled.into_iter().chain(configured).collect();
    features.sort_by_key(|feature| feature.id());

    for feature in &mut features {
        let id = feature.id();
        feature
            .manage_dependencies(&mut ResourceManagers::new(&mut store), params.provider)
            .context(ManageDependenciesSnafu { feature: id })?;

        for (component, template) in &mut templates {
            debug!(feature = %id, %component, "managing component template");
            let mut managers = PodTemplateManagers::new(template);
            let result = match component {
                ComponentName::ClusterAgent => {
                    feature.manage_cluster_agent(&mut managers, params.provider)
                }
                ComponentName::NodeAgent
                    if required.node_agent.single_container_strategy_enabled() =>
                {
                    feature.manage_single_container_node_agent(&mut managers, params.provider)
                }
                ComponentName::NodeAgent => {
                    feature.manage_node_agent(&mut managers, params.provider)
                }
                ComponentName::ClusterChecksRunner => {
                    feature.manage_cluster_checks_runner(&mut managers, params.provider)
                }
                ComponentName::OtelAgentGateway => {
                    feature.manage_otel_agent_gateway(&mut managers, params.provider)
                }
            };
            result.context(ManageComponentSnafu {
                feature: id,
                component: *component,
            })?;
        }
    }

    info!(
        enabled = ?enabled_features,
        configured = ?configured_features,
        objects = store.len(),
        "composed DatadogAgent"
    );

    Ok(Composition {
        spec,
        required,
        enabled_features,
        configured_features,
        templates,
        store,
    })
}
