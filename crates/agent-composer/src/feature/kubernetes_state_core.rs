//! The Kubernetes State Metrics Core check, run by the cluster agent or dispatched to runners.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::{core::v1::VolumeMount, rbac::v1::PolicyRule},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use snafu::ResultExt;
use tracing::debug;

use super::{Feature, FeatureId, FeatureOptions, MergeSnafu, Owner, Result, StoreSnafu, enabled};
use crate::{
    component::{ComponentName, ContainerName},
    crd::{DatadogAgentSpec, RemoteConfigConfiguration},
    merger::{
        PodTemplateManagers,
        env_var::{append_to_value, env_var},
        volume::config_map_volume,
    },
    required::{RequiredComponent, RequiredComponents},
    store::{
        PlatformInfo, RbacBuilder, ResourceManagers,
        config_map::checksum_annotation_key,
        rbac::{CORE_API_GROUP, LIST_VERB, WATCH_VERB},
    },
};

pub const DD_IGNORE_AUTOCONF: &str = "DD_IGNORE_AUTOCONF";

pub const CONFIG_FILE_NAME: &str = "kubernetes_state_core.yaml.default";
pub const CONFIG_MOUNT_PATH: &str = "/etc/datadog-agent/conf.d/kubernetes_state_core.d";
const CONFIG_VOLUME_NAME: &str = "ksm-core-config";

/// Collectors of the default configuration, each granted list and watch on its resource.
const COLLECTORS: [(&str, &str); 21] = [
    (CORE_API_GROUP, "configmaps"),
    (CORE_API_GROUP, "endpoints"),
    (CORE_API_GROUP, "limitranges"),
    (CORE_API_GROUP, "namespaces"),
    (CORE_API_GROUP, "nodes"),
    (CORE_API_GROUP, "persistentvolumeclaims"),
    (CORE_API_GROUP, "persistentvolumes"),
    (CORE_API_GROUP, "pods"),
    (CORE_API_GROUP, "replicationcontrollers"),
    (CORE_API_GROUP, "resourcequotas"),
    (CORE_API_GROUP, "secrets"),
    (CORE_API_GROUP, "services"),
    ("apps", "daemonsets"),
    ("apps", "deployments"),
    ("apps", "replicasets"),
    ("apps", "statefulsets"),
    ("autoscaling", "horizontalpodautoscalers"),
    ("batch", "cronjobs"),
    ("batch", "jobs"),
    ("policy", "poddisruptionbudgets"),
    ("storage.k8s.io", "storageclasses"),
];

const FLOW_CONTROL_API_GROUP: &str = "flowcontrol.apiserver.k8s.io";
const API_EXTENSIONS_API_GROUP: &str = "apiextensions.k8s.io";

#[derive(Debug, Default)]
pub struct KubernetesStateCoreFeature {
    owner: Owner,
    collect_crd_metrics: bool,
    custom_config: Option<String>,
    runs_on_cluster_checks_runner: bool,
    config_checksum: Option<String>,
}

pub fn build(_options: &FeatureOptions) -> Box<dyn Feature> {
    Box::<KubernetesStateCoreFeature>::default()
}

impl KubernetesStateCoreFeature {
    fn config_map_name(&self) -> String {
        format!("{}-kube-state-metrics-core-config", self.owner.name)
    }

    fn cluster_role_name(&self) -> String {
        format!("{}-ksm-core", self.owner.name)
    }

    /// The component whose service account runs the check.
    fn check_runner(&self) -> ComponentName {
        if self.runs_on_cluster_checks_runner {
            ComponentName::ClusterChecksRunner
        } else {
            ComponentName::ClusterAgent
        }
    }

    fn collectors(&self, platform_info: &PlatformInfo) -> Vec<(&'static str, &'static str)> {
        let mut collectors = COLLECTORS.to_vec();
        // The flowcontrol v1 API is available since Kubernetes 1.29.
        if platform_info.is_at_least(1, 29) {
            collectors.push((FLOW_CONTROL_API_GROUP, "flowschemas"));
            collectors.push((FLOW_CONTROL_API_GROUP, "prioritylevelconfigurations"));
        }
        if self.collect_crd_metrics {
            collectors.push((API_EXTENSIONS_API_GROUP, "customresourcedefinitions"));
        }

        collectors
    }

    fn default_config(&self, collectors: &[(&str, &str)]) -> String {
        let mut config = format!(
            "cluster_check: {cluster_check}\ninit_config:\ninstances:\n  - collectors:\n",
            cluster_check = self.runs_on_cluster_checks_runner
        );
        for (_, resource) in collectors {
            config.push_str(&format!("    - {resource}\n"));
        }
        config.push_str(&format!(
            "    skip_leader_election: {}\n    labels_as_tags: {{}}\n",
            self.runs_on_cluster_checks_runner
        ));

        config
    }

    fn policy_rules(collectors: &[(&str, &str)]) -> Vec<PolicyRule> {
        let mut builder = RbacBuilder::new(&[LIST_VERB, WATCH_VERB]);
        for (group, resource) in collectors {
            builder.add_group_kind(group, resource, &[]);
        }

        builder.build()
    }

    fn manage_agent_container(
        container: ContainerName,
        managers: &mut PodTemplateManagers<'_>,
    ) -> Result<()> {
        // The legacy kubernetes_state check must not be scheduled next to this one.
        managers
            .env_var()
            .add_env_var_to_container_with_merge_fn(
                container,
                env_var(DD_IGNORE_AUTOCONF, "kubernetes_state"),
                append_to_value,
            )
            .context(MergeSnafu)
    }
}

impl Feature for KubernetesStateCoreFeature {
    fn id(&self) -> FeatureId {
        FeatureId::KUBERNETES_STATE_CORE
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
        let Some(config) = features
            .kubernetes_state_core
            .as_ref()
            .filter(|config| enabled(config.enabled))
        else {
            return RequiredComponents::default();
        };

        self.owner = Owner::new(owner);
        self.collect_crd_metrics = enabled(config.collect_crd_metrics);
        self.custom_config = config.conf.clone();
        self.runs_on_cluster_checks_runner = features
            .cluster_checks
            .as_ref()
            .is_some_and(|cluster_checks| {
                enabled(cluster_checks.enabled)
                    && enabled(cluster_checks.use_cluster_checks_runners)
            });

        let mut required = RequiredComponents {
            cluster_agent: RequiredComponent::enabled([ContainerName::ClusterAgent]),
            ..RequiredComponents::default()
        };
        if self.runs_on_cluster_checks_runner {
            required.cluster_checks_runner =
                RequiredComponent::enabled([ContainerName::ClusterChecksRunner]);
        }

        required
    }

    fn manage_dependencies(
        &mut self,
        managers: &mut ResourceManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let collectors = self.collectors(managers.store().platform_info());
        let config = match &self.custom_config {
            Some(custom) => custom.clone(),
            None => self.default_config(&collectors),
        };

        let checksum = managers
            .config_map()
            .add_config_map(
                &self.owner.namespace,
                &self.config_map_name(),
                BTreeMap::from([(CONFIG_FILE_NAME.to_owned(), config)]),
            )
            .context(StoreSnafu)?;
        debug!(%checksum, "stored kubernetes_state_core configuration");
        self.config_checksum = Some(checksum);

        managers
            .rbac()
            .add_cluster_policy_rules(
                &self.owner.namespace,
                &self.cluster_role_name(),
                &self.owner.component_name(self.check_runner()),
                Self::policy_rules(&collectors),
            )
            .context(StoreSnafu)
    }

    fn manage_cluster_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
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
            ContainerName::ClusterAgent,
        );

        if let Some(checksum) = &self.config_checksum {
            managers
                .annotation()
                .add_annotation(checksum_annotation_key(&config_map_name), checksum.as_str());
        }

        Ok(())
    }

    fn manage_node_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        Self::manage_agent_container(ContainerName::CoreAgent, managers)
    }

    fn manage_single_container_node_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        Self::manage_agent_container(ContainerName::UnprivilegedSingleAgent, managers)
    }
}
