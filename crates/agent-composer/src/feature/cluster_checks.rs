//! Dispatches cluster-level checks from the cluster agent to node agents or runners.
use k8s_openapi::{
    api::networking::v1::{NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort},
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use snafu::ResultExt;

use super::{Feature, FeatureId, FeatureOptions, MergeSnafu, Owner, Result, StoreSnafu, enabled};
use crate::{
    component::{ComponentName, ContainerName},
    crd::{DatadogAgentSpec, RemoteConfigConfiguration},
    merger::{
        PodTemplateManagers,
        env_var::{append_to_value, env_var},
    },
    required::{RequiredComponent, RequiredComponents},
    store::ResourceManagers,
};

pub const DD_CLUSTER_CHECKS_ENABLED: &str = "DD_CLUSTER_CHECKS_ENABLED";
pub const DD_EXTRA_CONFIG_PROVIDERS: &str = "DD_EXTRA_CONFIG_PROVIDERS";
pub const DD_EXTRA_LISTENERS: &str = "DD_EXTRA_LISTENERS";

/// Port the cluster agent serves check configurations on.
pub const CLUSTER_AGENT_CMD_PORT: i32 = 5005;

#[derive(Debug, Default)]
pub struct ClusterChecksFeature {
    owner: Owner,
    use_runners: bool,
    create_network_policy: bool,
}

pub fn build(_options: &FeatureOptions) -> Box<dyn Feature> {
    Box::<ClusterChecksFeature>::default()
}

impl ClusterChecksFeature {
    fn manage_agent_container(
        &self,
        container: ContainerName,
        managers: &mut PodTemplateManagers<'_>,
    ) -> Result<()> {
        let providers = if self.use_runners {
            "endpointschecks"
        } else {
            "clusterchecks endpointschecks"
        };
        managers
            .env_var()
            .add_env_var_to_container_with_merge_fn(
                container,
                env_var(DD_EXTRA_CONFIG_PROVIDERS, providers),
                append_to_value,
            )
            .context(MergeSnafu)
    }

    /// Lets the node agents and runners fetch their checks from the cluster agent.
    fn cluster_agent_ingress(&self) -> NetworkPolicyIngressRule {
        let peer = |component: ComponentName| NetworkPolicyPeer {
            pod_selector: Some(LabelSelector {
                match_labels: Some(self.owner.component_selector(component)),
                match_expressions: None,
            }),
            ..NetworkPolicyPeer::default()
        };

        let mut from = vec![peer(ComponentName::NodeAgent)];
        if self.use_runners {
            from.push(peer(ComponentName::ClusterChecksRunner));
        }

        NetworkPolicyIngressRule {
            from: Some(from),
            ports: Some(vec![NetworkPolicyPort {
                port: Some(IntOrString::Int(CLUSTER_AGENT_CMD_PORT)),
                protocol: Some("TCP".to_owned()),
                ..NetworkPolicyPort::default()
            }]),
        }
    }
}

impl Feature for ClusterChecksFeature {
    fn id(&self) -> FeatureId {
        FeatureId::CLUSTER_CHECKS
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
            .and_then(|features| features.cluster_checks.as_ref())
            .filter(|config| enabled(config.enabled))
        else {
            return RequiredComponents::default();
        };

        self.owner = Owner::new(owner);
        self.use_runners = enabled(config.use_cluster_checks_runners);
        self.create_network_policy = spec.create_network_policies();

        // Without runners the runner component is explicitly turned off.
        let cluster_checks_runner = if self.use_runners {
            RequiredComponent::enabled([ContainerName::ClusterChecksRunner])
        } else {
            RequiredComponent::disabled()
        };

        RequiredComponents {
            cluster_agent: RequiredComponent::enabled([ContainerName::ClusterAgent]),
            cluster_checks_runner,
            ..RequiredComponents::default()
        }
    }

    fn manage_dependencies(
        &mut self,
        managers: &mut ResourceManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        if !self.create_network_policy {
            return Ok(());
        }

        let cluster_agent = ComponentName::ClusterAgent;
        managers
            .network_policy()
            .add_kubernetes_network_policy(
                &self.owner.namespace,
                &format!("{}-cluster-checks", self.owner.component_name(cluster_agent)),
                LabelSelector {
                    match_labels: Some(self.owner.component_selector(cluster_agent)),
                    match_expressions: None,
                },
                vec![self.cluster_agent_ingress()],
                Vec::new(),
            )
            .context(StoreSnafu)
    }

    fn manage_cluster_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let container = ContainerName::ClusterAgent;
        let mut env = managers.env_var();
        env.add_env_var_to_container(container, env_var(DD_CLUSTER_CHECKS_ENABLED, "true"));
        for name in [DD_EXTRA_CONFIG_PROVIDERS, DD_EXTRA_LISTENERS] {
            env.add_env_var_to_container_with_merge_fn(
                container,
                env_var(name, "kube_endpoints kube_services"),
                append_to_value,
            )
            .context(MergeSnafu)?;
        }

        Ok(())
    }

    fn manage_node_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        self.manage_agent_container(ContainerName::CoreAgent, managers)
    }

    fn manage_single_container_node_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        self.manage_agent_container(ContainerName::UnprivilegedSingleAgent, managers)
    }

    fn manage_cluster_checks_runner(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let container = ContainerName::ClusterChecksRunner;
        let mut env = managers.env_var();
        env.add_env_var_to_container(container, env_var(DD_CLUSTER_CHECKS_ENABLED, "true"));
        env.add_env_var_to_container_with_merge_fn(
            container,
            env_var(DD_EXTRA_CONFIG_PROVIDERS, "clusterchecks"),
            append_to_value,
        )
        .context(MergeSnafu)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use k8s_openapi::api::networking::v1::NetworkPolicy;
    use rstest::rstest;

    use super::*;
    use crate::{
        feature::test_util::{env_value, owner, spec},
        merger::test_util::template,
        required::Requirement,
        store::test_util::store,
    };

    #[rstest]
    #[case::without_runners(false, Requirement::Disabled, "clusterchecks endpointschecks")]
    #[case::with_runners(true, Requirement::Enabled, "endpointschecks")]
    fn runners_decide_node_agent_providers(
        #[case] use_runners: bool,
        #[case] runner_requirement: Requirement,
        #[case] providers: &str,
    ) {
        let mut spec = spec(&format!(
            "features: {{clusterChecks: {{enabled: true, useClusterChecksRunners: {use_runners}}}}}"
        ));
        let mut feature = ClusterChecksFeature::default();

        let required = feature.configure(&owner(), &mut spec, None);
        assert_eq!(required.cluster_agent.required, Requirement::Enabled);
        assert_eq!(required.cluster_checks_runner.required, runner_requirement);

        let core = ContainerName::CoreAgent;
        let mut template = template(&[core], &[]);
        feature
            .manage_node_agent(&mut PodTemplateManagers::new(&mut template), "")
            .unwrap();
        assert_eq!(
            env_value(&template, core, DD_EXTRA_CONFIG_PROVIDERS).as_deref(),
            Some(providers)
        );
    }

    #[test]
    fn providers_are_appended_to_existing_value() {
        let mut spec = spec(indoc! {"
            features:
              clusterChecks:
                enabled: true
        "});
        let mut feature = ClusterChecksFeature::default();
        feature.configure(&owner(), &mut spec, None);

        let dca = ContainerName::ClusterAgent;
        let mut template = template(&[dca], &[]);
        let mut managers = PodTemplateManagers::new(&mut template);
        managers
            .env_var()
            .add_env_var_to_container(dca, env_var(DD_EXTRA_LISTENERS, "kubelet"));
        feature.manage_cluster_agent(&mut managers, "").unwrap();

        assert_eq!(
            env_value(&template, dca, DD_EXTRA_LISTENERS).as_deref(),
            Some("kubelet kube_endpoints kube_services")
        );
        assert_eq!(
            env_value(&template, dca, DD_CLUSTER_CHECKS_ENABLED).as_deref(),
            Some("true")
        );
    }

    #[test]
    fn network_policy_only_when_requested() {
        let mut feature = ClusterChecksFeature::default();
        let mut store = store();
        let mut without_policy = spec(indoc! {"
            features:
              clusterChecks:
                enabled: true
                useClusterChecksRunners: true
        "});
        feature.configure(&owner(), &mut without_policy, None);
        feature
            .manage_dependencies(&mut ResourceManagers::new(&mut store), "")
            .unwrap();
        assert!(store.is_empty());

        let mut with_policy = spec(indoc! {"
            global:
              networkPolicy:
                create: true
            features:
              clusterChecks:
                enabled: true
                useClusterChecksRunners: true
        "});
        feature.configure(&owner(), &mut with_policy, None);
        feature
            .manage_dependencies(&mut ResourceManagers::new(&mut store), "")
            .unwrap();

        let policy = store
            .get::<NetworkPolicy>("monitoring", "datadog-cluster-agent-cluster-checks")
            .unwrap();
        let ingress = policy.spec.as_ref().unwrap().ingress.as_ref().unwrap();
        assert_eq!(ingress[0].from.as_ref().unwrap().len(), 2);
    }
}
