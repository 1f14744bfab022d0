//! APM trace intake through the trace-agent.
use k8s_openapi::{
    api::core::v1::ContainerPort, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};

use super::{
    Feature, FeatureId, FeatureOptions, Result, configured_host_port, configured_socket_path,
    enabled, socket_dir,
};
use crate::{
    component::ContainerName,
    crd::{DatadogAgentSpec, RemoteConfigConfiguration},
    merger::{PodTemplateManagers, env_var::env_var, volume::host_path_volume},
    required::{RequiredComponent, RequiredComponents},
    store::ResourceManagers,
};

pub const DD_APM_ENABLED: &str = "DD_APM_ENABLED";
pub const DD_APM_RECEIVER_PORT: &str = "DD_APM_RECEIVER_PORT";
pub const DD_APM_NON_LOCAL_TRAFFIC: &str = "DD_APM_NON_LOCAL_TRAFFIC";
pub const DD_APM_RECEIVER_SOCKET: &str = "DD_APM_RECEIVER_SOCKET";

pub const DEFAULT_APM_PORT: i32 = 8126;
pub const DEFAULT_APM_SOCKET_PATH: &str = "/var/run/datadog/apm.socket";

const APM_PORT_NAME: &str = "traceport";
const APM_SOCKET_VOLUME_NAME: &str = "apmsocket";

#[derive(Debug, Default)]
pub struct ApmFeature {
    host_port: Option<i32>,
    socket_path: Option<String>,
}

pub fn build(_options: &FeatureOptions) -> Box<dyn Feature> {
    Box::<ApmFeature>::default()
}

impl ApmFeature {
    fn manage_agent_container(
        &self,
        container: ContainerName,
        managers: &mut PodTemplateManagers<'_>,
    ) {
        let mut env = managers.env_var();
        env.add_env_var_to_container(container, env_var(DD_APM_ENABLED, "true"));
        env.add_env_var_to_container(
            container,
            env_var(DD_APM_RECEIVER_PORT, DEFAULT_APM_PORT.to_string()),
        );
        if self.host_port.is_some() {
            env.add_env_var_to_container(container, env_var(DD_APM_NON_LOCAL_TRAFFIC, "true"));
        }
        if let Some(socket_path) = &self.socket_path {
            env.add_env_var_to_container(
                container,
                env_var(DD_APM_RECEIVER_SOCKET, socket_path.as_str()),
            );
        }

        managers.port().add_port_to_container(
            container,
            &ContainerPort {
                name: Some(APM_PORT_NAME.to_owned()),
                container_port: DEFAULT_APM_PORT,
                host_port: self.host_port,
                protocol: Some("TCP".to_owned()),
                host_ip: None,
            },
        );

        if let Some(socket_path) = &self.socket_path {
            let dir = socket_dir(socket_path);
            let (volume, mount) = host_path_volume(APM_SOCKET_VOLUME_NAME, dir, dir, false);
            managers.volume().add_volume(&volume);
            managers
                .volume_mount()
                .add_volume_mount_to_container(&mount, container);
        }
    }
}

impl Feature for ApmFeature {
    fn id(&self) -> FeatureId {
        FeatureId::APM
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
            .and_then(|features| features.apm.as_ref())
            .filter(|config| enabled(config.enabled))
        else {
            return RequiredComponents::default();
        };

        self.host_port = configured_host_port(config.host_port_config.as_ref(), DEFAULT_APM_PORT);
        self.socket_path = configured_socket_path(
            config.unix_domain_socket_config.as_ref(),
            DEFAULT_APM_SOCKET_PATH,
        );

        RequiredComponents {
            node_agent: RequiredComponent::enabled([
                ContainerName::CoreAgent,
                ContainerName::TraceAgent,
            ]),
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
        self.manage_agent_container(ContainerName::TraceAgent, managers);
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

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::{
        feature::test_util::{env_value, mount_paths, owner, spec},
        merger::test_util::{container, template},
    };

    #[rstest]
    #[case("/var/run/datadog/apm.socket", "/var/run/datadog")]
    #[case("/apm.socket", "/")]
    #[case("apm.socket", ".")]
    fn socket_dirs(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(socket_dir(path), expected);
    }

    #[test]
    fn trace_agent_gets_host_port_and_socket() {
        let mut spec = spec(indoc! {"
            features:
              apm:
                enabled: true
                hostPortConfig:
                  enabled: true
                  hostPort: 18126
        "});
        let mut feature = ApmFeature::default();
        let required = feature.configure(&owner(), &mut spec, None);
        assert_eq!(
            required.node_agent.containers,
            vec![ContainerName::CoreAgent, ContainerName::TraceAgent]
        );

        let mut template = template(&[ContainerName::CoreAgent, ContainerName::TraceAgent], &[]);
        feature
            .manage_node_agent(&mut PodTemplateManagers::new(&mut template), "")
            .unwrap();

        let trace = ContainerName::TraceAgent;
        let ports = container(&template, trace).ports.clone().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].container_port, DEFAULT_APM_PORT);
        assert_eq!(ports[0].host_port, Some(18126));
        assert_eq!(
            env_value(&template, trace, DD_APM_NON_LOCAL_TRAFFIC).as_deref(),
            Some("true")
        );
        assert_eq!(
            env_value(&template, trace, DD_APM_RECEIVER_SOCKET).as_deref(),
            Some(DEFAULT_APM_SOCKET_PATH)
        );
        assert_eq!(mount_paths(&template, trace), vec!["/var/run/datadog"]);
        assert_eq!(env_value(&template, ContainerName::CoreAgent, DD_APM_ENABLED), None);
    }

    #[test]
    fn socket_can_be_disabled() {
        let mut spec = spec(indoc! {"
            features:
              apm:
                enabled: true
                unixDomainSocketConfig:
                  enabled: false
        "});
        let mut feature = ApmFeature::default();
        feature.configure(&owner(), &mut spec, None);

        let single = ContainerName::UnprivilegedSingleAgent;
        let mut template = template(&[single], &[]);
        feature
            .manage_single_container_node_agent(&mut PodTemplateManagers::new(&mut template), "")
            .unwrap();

        assert_eq!(env_value(&template, single, DD_APM_RECEIVER_SOCKET), None);
        assert_eq!(env_value(&template, single, DD_APM_NON_LOCAL_TRAFFIC), None);
        assert!(mount_paths(&template, single).is_empty());
        assert_eq!(container(&template, single).ports.as_ref().unwrap()[0].host_port, None);
    }
}
