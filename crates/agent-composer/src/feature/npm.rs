//! Network Performance Monitoring, backed by the eBPF based system-probe.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{Feature, FeatureId, FeatureOptions, Result, enabled};
use crate::{
    component::ContainerName,
    crd::{DatadogAgentSpec, RemoteConfigConfiguration},
    merger::{
        PodTemplateManagers,
        env_var::env_var,
        volume::{empty_dir_volume, host_path_volume},
    },
    required::{RequiredComponent, RequiredComponents},
    store::ResourceManagers,
};

pub const DD_SYSTEM_PROBE_ENABLED: &str = "DD_SYSTEM_PROBE_ENABLED";
pub const DD_SYSTEM_PROBE_NETWORK_ENABLED: &str = "DD_SYSTEM_PROBE_NETWORK_ENABLED";
pub const DD_SYSTEM_PROBE_CONNTRACK_ENABLED: &str = "DD_SYSTEM_PROBE_CONNTRACK_ENABLED";
pub const DD_SYSTEM_PROBE_COLLECT_DNS_STATS_ENABLED: &str =
    "DD_SYSTEM_PROBE_NETWORK_COLLECT_DNS_STATS_ENABLED";
pub const DD_SYSPROBE_SOCKET: &str = "DD_SYSPROBE_SOCKET";

pub const SYSTEM_PROBE_APPARMOR_ANNOTATION: &str =
    "container.apparmor.security.beta.kubernetes.io/system-probe";

const SYSTEM_PROBE_SOCKET_VOLUME_NAME: &str = "sysprobe-socket-dir";
const SYSTEM_PROBE_SOCKET_DIR: &str = "/var/run/sysprobe";
const SYSTEM_PROBE_SOCKET_PATH: &str = "/var/run/sysprobe/sysprobe.sock";

/// Capabilities the system-probe needs to load its eBPF programs and inspect connections.
pub const SYSTEM_PROBE_CAPABILITIES: [&str; 9] = [
    "SYS_ADMIN",
    "SYS_RESOURCE",
    "SYS_PTRACE",
    "NET_ADMIN",
    "NET_BROADCAST",
    "NET_RAW",
    "IPC_LOCK",
    "CHOWN",
    "DAC_READ_SEARCH",
];

/// `(name, host path, mount path, read only)` of the host volumes mounted into system-probe.
const HOST_VOLUMES: [(&str, &str, &str, bool); 3] = [
    ("procdir", "/proc", "/host/proc", true),
    ("cgroups", "/sys/fs/cgroup", "/host/sys/fs/cgroup", true),
    ("debugfs", "/sys/kernel/debug", "/sys/kernel/debug", false),
];

#[derive(Debug, Default)]
pub struct NpmFeature {
    collect_dns_stats: Option<bool>,
    enable_conntrack: Option<bool>,
}

pub fn build(_options: &FeatureOptions) -> Box<dyn Feature> {
    Box::<NpmFeature>::default()
}

impl Feature for NpmFeature {
    fn id(&self) -> FeatureId {
        FeatureId::NPM
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
            .and_then(|features| features.npm.as_ref())
            .filter(|config| enabled(config.enabled))
        else {
            return RequiredComponents::default();
        };

        self.collect_dns_stats = config.collect_dns_stats;
        self.enable_conntrack = config.enable_conntrack;

        RequiredComponents {
            node_agent: RequiredComponent::enabled([
                ContainerName::CoreAgent,
                ContainerName::ProcessAgent,
                ContainerName::SystemProbe,
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
        let probe = ContainerName::SystemProbe;
        let socket_users = [
            ContainerName::CoreAgent,
            ContainerName::ProcessAgent,
            ContainerName::SystemProbe,
        ];

        managers
            .annotation()
            .add_annotation(SYSTEM_PROBE_APPARMOR_ANNOTATION, "unconfined");
        managers
            .security_context()
            .add_capabilities_to_container(&SYSTEM_PROBE_CAPABILITIES, probe);

        for (name, host_path, mount_path, read_only) in HOST_VOLUMES {
            let (volume, mount) = host_path_volume(name, host_path, mount_path, read_only);
            managers.volume().add_volume(&volume);
            managers.volume_mount().add_volume_mount_to_container(&mount, probe);
        }

        let (socket_volume, socket_mount) =
            empty_dir_volume(SYSTEM_PROBE_SOCKET_VOLUME_NAME, SYSTEM_PROBE_SOCKET_DIR, false);
        managers.volume().add_volume(&socket_volume);
        managers
            .volume_mount()
            .add_volume_mount_to_containers(&socket_mount, &socket_users);

        let mut env = managers.env_var();
        env.add_env_var_to_containers(
            &socket_users,
            &env_var(DD_SYSPROBE_SOCKET, SYSTEM_PROBE_SOCKET_PATH),
        );
        env.add_env_var_to_containers(
            &[ContainerName::CoreAgent, ContainerName::ProcessAgent],
            &env_var(DD_SYSTEM_PROBE_ENABLED, "true"),
        );
        env.add_env_var_to_containers(
            &[ContainerName::ProcessAgent, ContainerName::SystemProbe],
            &env_var(DD_SYSTEM_PROBE_NETWORK_ENABLED, "true"),
        );
        if let Some(conntrack) = self.enable_conntrack {
            env.add_env_var_to_container(
                probe,
                env_var(DD_SYSTEM_PROBE_CONNTRACK_ENABLED, conntrack.to_string()),
            );
        }
        if let Some(dns_stats) = self.collect_dns_stats {
            env.add_env_var_to_container(
                probe,
                env_var(DD_SYSTEM_PROBE_COLLECT_DNS_STATS_ENABLED, dns_stats.to_string()),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        feature::test_util::{env_value, mount_paths, owner, spec},
        merger::test_util::{container, template},
    };

    #[test]
    fn requires_privileged_system_probe() {
        let mut spec = spec(indoc! {"
            features:
              npm:
                enabled: true
        "});

        let required = NpmFeature::default().configure(&owner(), &mut spec, None);
        assert!(required.node_agent.is_privileged());
        assert!(!required.cluster_agent.is_configured());
    }

    #[test]
    fn system_probe_is_set_up() {
        let mut spec = spec(indoc! {"
            features:
              npm:
                enabled: true
                collectDnsStats: false
        "});
        let mut feature = NpmFeature::default();
        feature.configure(&owner(), &mut spec, None);

        let mut template = template(
            &[
                ContainerName::CoreAgent,
                ContainerName::ProcessAgent,
                ContainerName::SystemProbe,
            ],
            &[],
        );
        feature
            .manage_node_agent(&mut PodTemplateManagers::new(&mut template), "")
            .unwrap();

        let probe = ContainerName::SystemProbe;
        let added = container(&template, probe)
            .security_context
            .as_ref()
            .and_then(|context| context.capabilities.as_ref())
            .and_then(|capabilities| capabilities.add.clone())
            .unwrap();
        assert_eq!(added, SYSTEM_PROBE_CAPABILITIES);

        assert_eq!(
            template.metadata.as_ref().unwrap().annotations.as_ref().unwrap()
                [SYSTEM_PROBE_APPARMOR_ANNOTATION],
            "unconfined"
        );
        assert_eq!(
            env_value(&template, probe, DD_SYSTEM_PROBE_COLLECT_DNS_STATS_ENABLED).as_deref(),
            Some("false")
        );
        assert_eq!(env_value(&template, probe, DD_SYSTEM_PROBE_CONNTRACK_ENABLED), None);
        assert_eq!(
            env_value(&template, ContainerName::CoreAgent, DD_SYSPROBE_SOCKET).as_deref(),
            Some(SYSTEM_PROBE_SOCKET_PATH)
        );
        assert_eq!(mount_paths(&template, probe).len(), 4);
        assert_eq!(
            mount_paths(&template, ContainerName::ProcessAgent),
            vec![SYSTEM_PROBE_SOCKET_DIR]
        );
    }
}
