//! Decides which features apply and which components, with which containers, get deployed.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, instrument};

use crate::{
    component::ContainerName,
    crd::{ContainerStrategy, DatadogAgentSpec, RemoteConfigConfiguration},
    feature::Feature,
    required::{RequiredComponent, RequiredComponents},
};

/// Outcome of configuring every feature against one resource.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Features requiring at least one component, in processing order.
    pub enabled: Vec<Box<dyn Feature>>,

    /// Features that only expressed an opinion, such as an explicit "off", in processing order.
    pub configured: Vec<Box<dyn Feature>>,

    /// Requirements of all features folded together.
    pub required: RequiredComponents,
}

/// Configures `features` in the given order and folds their requirements.
///
/// Features whose own requirements neither require nor configure anything are dropped. For the
/// others, `disabled` is merged into their requirements before classification, so a component it
/// switches off stays off.
///
/// With the single container strategy, a node agent that needs no privileged container is
/// reduced to the unprivileged single agent container.
#[instrument(name = "resolve_required_components", skip_all)]
pub fn resolve(
    features: Vec<Box<dyn Feature>>,
    owner: &ObjectMeta,
    spec: &mut DatadogAgentSpec,
    remote_config: Option<&RemoteConfigConfiguration>,
    disabled: &RequiredComponents,
) -> Resolution {
    let mut resolution = Resolution::default();

    for mut feature in features {
        let own = feature.configure(owner, spec, remote_config);
        if !own.is_configured() {
            debug!(feature = %feature.id(), "feature not used");
            continue;
        }

        let required = own.merge(disabled);
        resolution.required = resolution.required.merge(&required);

        if required.iter().any(|(_, component)| component.is_present()) {
            debug!(feature = %feature.id(), ?required, "feature enabled");
            resolution.enabled.push(feature);
        } else {
            debug!(feature = %feature.id(), ?required, "feature configured");
            resolution.configured.push(feature);
        }
    }

    if spec.container_strategy() == ContainerStrategy::SingleContainer {
        reduce_to_single_container(&mut resolution.required.node_agent);
    }

    resolution
}

fn reduce_to_single_container(node_agent: &mut RequiredComponent) {
    if !node_agent.is_present() {
        return;
    }

    if node_agent.is_privileged() {
        debug!(
            containers = ?node_agent.containers,
            "node agent needs privileged containers, keeping one container per process"
        );
        return;
    }

    node_agent.containers = vec![ContainerName::UnprivilegedSingleAgent];
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::{
        component::ComponentName,
        feature::{FeatureOptions, FeatureRegistry, test_util::owner},
        required::Requirement,
    };

    fn resolve_yaml(yaml: &str) -> Resolution {
        let mut spec: DatadogAgentSpec = serde_yaml::from_str(yaml).unwrap();
        let disabled = spec.disabled_components();
        let features = FeatureRegistry::global().build_all(&FeatureOptions::default());

        resolve(features, &owner(), &mut spec, None, &disabled)
    }

    fn ids(features: &[Box<dyn Feature>]) -> Vec<&'static str> {
        features.iter().map(|feature| feature.id().as_str()).collect()
    }

    #[test]
    fn empty_spec_requires_nothing() {
        let resolution = resolve_yaml("{}");

        assert_eq!(resolution.required, RequiredComponents::default());
        assert!(resolution.enabled.is_empty());
        assert!(resolution.configured.is_empty());
    }

    #[test]
    fn features_are_classified_in_order() {
        let resolution = resolve_yaml(indoc! {"
            features:
              npm:
                enabled: true
              logCollection:
                enabled: true
              apm:
                enabled: false
              clusterChecks:
                enabled: true
        "});

        assert_eq!(
            ids(&resolution.enabled),
            vec!["cluster_checks", "log_collection", "npm"]
        );
        assert!(resolution.configured.is_empty());
        // The runner pool is explicitly off, since cluster checks do not use runners.
        assert_eq!(
            resolution.required.cluster_checks_runner.required,
            Requirement::Disabled
        );
        assert_eq!(
            resolution.required.node_agent.containers,
            vec![
                ContainerName::CoreAgent,
                ContainerName::ProcessAgent,
                ContainerName::SystemProbe,
            ]
        );
    }

    #[test]
    fn disabled_component_wins_over_feature() {
        let resolution = resolve_yaml(indoc! {"
            features:
              externalMetricsServer:
                enabled: true
            override:
              clusterAgent:
                disabled: true
        "});

        assert_eq!(
            resolution.required.get(ComponentName::ClusterAgent).required,
            Requirement::Disabled
        );
        assert!(resolution.enabled.is_empty());
        assert_eq!(ids(&resolution.configured), vec!["external_metrics"]);
    }

    #[test]
    fn disabled_components_alone_configure_nothing() {
        let resolution = resolve_yaml(indoc! {"
            override:
              clusterAgent:
                disabled: true
              nodeAgent:
                disabled: true
        "});

        assert!(resolution.enabled.is_empty());
        assert!(resolution.configured.is_empty());
        assert_eq!(resolution.required, RequiredComponents::default());
    }

    #[rstest]
    #[case::unprivileged(
        "logCollection: {enabled: true}\n  apm: {enabled: true}",
        vec![ContainerName::UnprivilegedSingleAgent]
    )]
    #[case::privileged(
        "logCollection: {enabled: true}\n  npm: {enabled: true}",
        vec![ContainerName::CoreAgent, ContainerName::ProcessAgent, ContainerName::SystemProbe]
    )]
    fn single_container_reduction(#[case] features: &str, #[case] expected: Vec<ContainerName>) {
        let resolution = resolve_yaml(&format!(
            "global:\n  containerStrategy: singleContainer\nfeatures:\n  {features}\n"
        ));

        assert_eq!(resolution.required.node_agent.containers, expected);
    }

    #[test]
    fn optimized_strategy_keeps_containers() {
        let resolution = resolve_yaml(indoc! {"
            features:
              logCollection:
                enabled: true
              apm:
                enabled: true
        "});

        assert_eq!(
            resolution.required.node_agent.containers,
            vec![ContainerName::CoreAgent, ContainerName::TraceAgent]
        );
    }
}
