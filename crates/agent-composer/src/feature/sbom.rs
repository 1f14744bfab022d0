//! Software Bill of Materials collection for container images and hosts.
//!
//! Remote Configuration takes precedence over the resource for every flag it sets.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{Feature, FeatureId, FeatureOptions, Result, enabled};
use crate::{
    component::ContainerName,
    crd::{DatadogAgentSpec, RemoteConfigConfiguration, SbomFeatureConfig, SbomTypeConfig},
    merger::{PodTemplateManagers, env_var::env_var, volume::host_path_volume},
    required::{RequiredComponent, RequiredComponents},
    store::ResourceManagers,
};

pub const DD_SBOM_ENABLED: &str = "DD_SBOM_ENABLED";
pub const DD_SBOM_CONTAINER_IMAGE_ENABLED: &str = "DD_SBOM_CONTAINER_IMAGE_ENABLED";
pub const DD_SBOM_CONTAINER_IMAGE_ANALYZERS: &str = "DD_SBOM_CONTAINER_IMAGE_ANALYZERS";
pub const DD_SBOM_HOST_ENABLED: &str = "DD_SBOM_HOST_ENABLED";
pub const DD_SBOM_HOST_ANALYZERS: &str = "DD_SBOM_HOST_ANALYZERS";

/// `(name, host path, mount path)` of the package databases read by host analysis.
const HOST_VOLUMES: [(&str, &str, &str); 4] = [
    ("host-apk-dir", "/var/lib/apk", "/host/var/lib/apk"),
    ("host-dpkg-dir", "/var/lib/dpkg", "/host/var/lib/dpkg"),
    ("host-rpm-dir", "/var/lib/rpm", "/host/var/lib/rpm"),
    ("host-os-release", "/etc/os-release", "/host/etc/os-release"),
];

fn apparmor_annotation(container: ContainerName) -> String {
    format!("container.apparmor.security.beta.kubernetes.io/{container}")
}

/// Settings of one scan type after applying Remote Configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct ScanSettings {
    enabled: bool,
    analyzers: Vec<String>,
}

impl ScanSettings {
    fn resolve(local: Option<&SbomTypeConfig>, remote: Option<&SbomTypeConfig>) -> Self {
        let enabled = remote
            .and_then(|remote| remote.enabled)
            .or_else(|| local.and_then(|local| local.enabled));
        let analyzers = [remote, local]
            .into_iter()
            .flatten()
            .map(|config| &config.analyzers)
            .find(|analyzers| !analyzers.is_empty())
            .cloned()
            .unwrap_or_default();

        Self {
            enabled: enabled.unwrap_or(false),
            analyzers,
        }
    }
}

#[derive(Debug, Default)]
pub struct SbomFeature {
    container_image: ScanSettings,
    host: ScanSettings,
}

pub fn build(_options: &FeatureOptions) -> Box<dyn Feature> {
    Box::<SbomFeature>::default()
}

impl SbomFeature {
    fn manage_agent_container(
        &self,
        container: ContainerName,
        managers: &mut PodTemplateManagers<'_>,
    ) {
        let mut env = managers.env_var();
        env.add_env_var_to_container(container, env_var(DD_SBOM_ENABLED, "true"));
        env.add_env_var_to_container(
            container,
            env_var(
                DD_SBOM_CONTAINER_IMAGE_ENABLED,
                self.container_image.enabled.to_string(),
            ),
        );
        if self.container_image.enabled && !self.container_image.analyzers.is_empty() {
            env.add_env_var_to_container(
                container,
                env_var(
                    DD_SBOM_CONTAINER_IMAGE_ANALYZERS,
                    self.container_image.analyzers.join(" "),
                ),
            );
        }
        env.add_env_var_to_container(
            container,
            env_var(DD_SBOM_HOST_ENABLED, self.host.enabled.to_string()),
        );

        if !self.host.enabled {
            return;
        }
        if !self.host.analyzers.is_empty() {
            env.add_env_var_to_container(
                container,
                env_var(DD_SBOM_HOST_ANALYZERS, self.host.analyzers.join(" ")),
            );
        }

        // Reading the host package databases needs to bypass AppArmor.
        managers
            .security_context()
            .add_capabilities_to_container(&["SYS_ADMIN"], container);
        managers
            .annotation()
            .add_annotation(apparmor_annotation(container), "unconfined");
        for (name, host_path, mount_path) in HOST_VOLUMES {
            let (volume, mount) = host_path_volume(name, host_path, mount_path, true);
            managers.volume().add_volume(&volume);
            managers
                .volume_mount()
                .add_volume_mount_to_container(&mount, container);
        }
    }
}

impl Feature for SbomFeature {
    fn id(&self) -> FeatureId {
        FeatureId::SBOM
    }

    fn configure(
        &mut self,
        _owner: &ObjectMeta,
        spec: &mut DatadogAgentSpec,
        remote_config: Option<&RemoteConfigConfiguration>,
    ) -> RequiredComponents {
        let local = spec
            .features
            .as_ref()
            .and_then(|features| features.sbom.as_ref());
        let remote: Option<&SbomFeatureConfig> = remote_config
            .and_then(|remote_config| remote_config.features.as_ref())
            .and_then(|features| features.sbom.as_ref());

        let feature_enabled = remote
            .and_then(|remote| remote.enabled)
            .or_else(|| local.and_then(|local| local.enabled));
        if !enabled(feature_enabled) {
            return RequiredComponents::default();
        }

        self.container_image = ScanSettings::resolve(
            local.and_then(|local| local.container_image.as_ref()),
            remote.and_then(|remote| remote.container_image.as_ref()),
        );
        self.host = ScanSettings::resolve(
            local.and_then(|local| local.host.as_ref()),
            remote.and_then(|remote| remote.host.as_ref()),
        );

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
