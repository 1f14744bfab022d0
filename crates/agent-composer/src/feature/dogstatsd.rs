//! DogStatsD metric intake in the core agent.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{
    Feature, FeatureId, FeatureOptions, Result, configured_host_port, configured_socket_path,
    enabled, socket_dir,
};
use crate::{
    component::ContainerName,
    crd::{DatadogAgentSpec, RemoteConfigConfiguration},
    merger::{PodTemplateManagers, env_var::env_var, port::host_port, volume::host_path_volume},
    required::{RequiredComponent, RequiredComponents},
    store::ResourceManagers,
};

pub const DD_DOGSTATSD_PORT: &str = "DD_DOGSTATSD_PORT";
pub const DD_DOGSTATSD_NON_LOCAL_TRAFFIC: &str = "DD_DOGSTATSD_NON_LOCAL_TRAFFIC";
pub const DD_DOGSTATSD_SOCKET: &str = "DD_DOGSTATSD_SOCKET";
pub const DD_DOGSTATSD_ORIGIN_DETECTION: &str = "DD_DOGSTATSD_ORIGIN_DETECTION";

pub const DEFAULT_DOGSTATSD_PORT: i32 = 8125;
pub const DEFAULT_DOGSTATSD_SOCKET_PATH: &str = "/var/run/datadog/dsd.socket";

const DOGSTATSD_PORT_NAME: &str = "dogstatsdport";
const DOGSTATSD_SOCKET_VOLUME_NAME: &str = "dsdsocket";

#[derive(Debug, Default)]
pub struct DogstatsdFeature {
    host_port: Option<i32>,
    socket_path: Option<String>,
    origin_detection: bool,
}

pub fn build(_options: &FeatureOptions) -> Box<dyn Feature> {
    Box::<DogstatsdFeature>::default()
}

impl DogstatsdFeature {
    fn manage_agent_container(
        &self,
        container: ContainerName,
        managers: &mut PodTemplateManagers<'_>,
    ) {
        let mut port = host_port(DOGSTATSD_PORT_NAME, DEFAULT_DOGSTATSD_PORT, "UDP");
        port.host_port = self.host_port;
        managers.port().add_port_to_container(container, &port);

        let mut env = managers.env_var();
        env.add_env_var_to_container(
            container,
            env_var(DD_DOGSTATSD_PORT, DEFAULT_DOGSTATSD_PORT.to_string()),
        );
        if self.host_port.is_some() {
            env.add_env_var_to_container(
                container,
                env_var(DD_DOGSTATSD_NON_LOCAL_TRAFFIC, "true"),
            );
        }
        if self.origin_detection {
            env.add_env_var_to_container(container, env_var(DD_DOGSTATSD_ORIGIN_DETECTION, "true"));
        }

        if let Some(socket_path) = &self.socket_path {
            env.add_env_var_to_container(
                container,
                env_var(DD_DOGSTATSD_SOCKET, socket_path.as_str()),
            );

            let dir = socket_dir(socket_path);
            let (volume, mount) = host_path_volume(DOGSTATSD_SOCKET_VOLUME_NAME, dir, dir, false);
            managers.volume().add_volume(&volume);
            managers
                .volume_mount()
                .add_volume_mount_to_container(&mount, container);
        }
    }
}

impl Feature for DogstatsdFeature {
    fn id(&self) -> FeatureId {
        FeatureId::DOGSTATSD
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
            .and_then(|features| features.dogstatsd.as_ref())
            .filter(|config| enabled(config.enabled))
        else {
            return RequiredComponents::default();
        };

        self.host_port =
            configured_host_port(config.host_port_config.as_ref(), DEFAULT_DOGSTATSD_PORT);
        self.socket_path = configured_socket_path(
            config.unix_domain_socket_config.as_ref(),
            DEFAULT_DOGSTATSD_SOCKET_PATH,
        );
        self.origin_detection = enabled(config.origin_detection_enabled);

        RequiredComponents {
            node_agent: RequiredComponent::enabled([ContainerName::CoreAgent]),
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
        self.manage_agent_container(ContainerName::CoreAgent, managers);
        Ok(())
    }

    fn manage_single_container_node_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        self.manage_agent_container(ContainerName::UnprivilegedSingleAgent, managers);
        Ok(())
    }
}
