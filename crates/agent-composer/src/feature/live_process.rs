//! Live process collection, either in the process-agent or inside the core agent.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{Feature, FeatureId, FeatureOptions, Result, enabled};
use crate::{
    component::ContainerName,
    crd::{DatadogAgentSpec, RemoteConfigConfiguration},
    merger::{PodTemplateManagers, env_var::env_var, volume::host_path_volume},
    required::{RequiredComponent, RequiredComponents},
    store::ResourceManagers,
};

pub const DD_PROCESS_CONFIG_RUN_IN_CORE_AGENT_ENABLED: &str =
    "DD_PROCESS_CONFIG_RUN_IN_CORE_AGENT_ENABLED";
pub const DD_PROCESS_CONFIG_PROCESS_COLLECTION_ENABLED: &str =
    "DD_PROCESS_CONFIG_PROCESS_COLLECTION_ENABLED";
pub const DD_PROCESS_CONFIG_SCRUB_ARGS: &str = "DD_PROCESS_CONFIG_SCRUB_ARGS";
pub const DD_PROCESS_CONFIG_STRIP_PROC_ARGUMENTS: &str = "DD_PROCESS_CONFIG_STRIP_PROC_ARGUMENTS";

/// `(name, host path, mount path)` of the read-only host volumes the collector needs.
const HOST_VOLUMES: [(&str, &str, &str); 3] = [
    ("passwd", "/etc/passwd", "/etc/passwd"),
    ("cgroups", "/sys/fs/cgroup", "/host/sys/fs/cgroup"),
    ("procdir", "/proc", "/host/proc"),
];

#[derive(Debug)]
pub struct LiveProcessFeature {
    run_in_core_agent: bool,
    scrub_process_arguments: Option<bool>,
    strip_process_arguments: Option<bool>,
}

pub fn build(options: &FeatureOptions) -> Box<dyn Feature> {
    Box::new(LiveProcessFeature {
        run_in_core_agent: options.process_checks_in_core_agent,
        scrub_process_arguments: None,
        strip_process_arguments: None,
    })
}

impl LiveProcessFeature {
    fn manage_agent_containers(
        &self,
        containers: &[ContainerName],
        collector: ContainerName,
        managers: &mut PodTemplateManagers<'_>,
    ) {
        let mut env = managers.env_var();
        env.add_env_var_to_containers(
            containers,
            &env_var(
                DD_PROCESS_CONFIG_RUN_IN_CORE_AGENT_ENABLED,
                self.run_in_core_agent.to_string(),
            ),
        );
        env.add_env_var_to_container(
            collector,
            env_var(DD_PROCESS_CONFIG_PROCESS_COLLECTION_ENABLED, "true"),
        );
        if let Some(scrub) = self.scrub_process_arguments {
            env.add_env_var_to_container(
                collector,
                env_var(DD_PROCESS_CONFIG_SCRUB_ARGS, scrub.to_string()),
            );
        }
        if let Some(strip) = self.strip_process_arguments {
            env.add_env_var_to_container(
                collector,
                env_var(DD_PROCESS_CONFIG_STRIP_PROC_ARGUMENTS, strip.to_string()),
            );
        }

        for (name, host_path, mount_path) in HOST_VOLUMES {
            let (volume, mount) = host_path_volume(name, host_path, mount_path, true);
            managers.volume().add_volume(&volume);
            managers
                .volume_mount()
                .add_volume_mount_to_container(&mount, collector);
        }
    }
}

impl Feature for LiveProcessFeature {
    fn id(&self) -> FeatureId {
        FeatureId::LIVE_PROCESS
    }

    fn configure(
        &mut self,
        _owner: &ObjectMeta,
        spec: &mut DatadogAgentSpec,
        _remote_config: Option<&RemoteConfigConfiguration>,
    ) -> RequiredComponents {
        let Some(config) = spec
            .features
            .as_ref()
            .and_then(|features| features.live_process_collection.as_ref())
            .filter(|config| enabled(config.enabled))
        else {
            return RequiredComponents::default();
        };

        if let Some(run_in_core_agent) = spec
            .global
            .as_ref()
            .and_then(|global| global.run_process_checks_in_core_agent)
        {
            self.run_in_core_agent = run_in_core_agent;
        }
        self.scrub_process_arguments = config.scrub_process_arguments;
        self.strip_process_arguments = config.strip_process_arguments;

        let mut containers = vec![ContainerName::CoreAgent];
        if !self.run_in_core_agent {
            containers.push(ContainerName::ProcessAgent);
        }

        RequiredComponents {
            node_agent: RequiredComponent::enabled(containers),
            ..RequiredComponents::default()
        }
    }

    fn manage_dependencies(
        &mut self,
        _managers: &mut ResourceManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn manage_node_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let collector = if self.run_in_core_agent {
            ContainerName::CoreAgent
        } else {
            ContainerName::ProcessAgent
        };
        self.manage_agent_containers(
            &[ContainerName::CoreAgent, ContainerName::ProcessAgent],
            collector,
            managers,
        );
        Ok(())
    }

    fn manage_single_container_node_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let single = ContainerName::UnprivilegedSingleAgent;
        self.manage_agent_containers(&[single], single, managers);
        Ok(())
    }
}
