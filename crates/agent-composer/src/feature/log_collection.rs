//! Collects container logs on every node.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{Feature, FeatureId, FeatureOptions, Result, enabled};
use crate::{
    component::ContainerName,
    crd::{DatadogAgentSpec, RemoteConfigConfiguration},
    merger::{PodTemplateManagers, env_var::env_var, volume::host_path_volume},
    required::{RequiredComponent, RequiredComponents},
    store::ResourceManagers,
};

pub const DD_LOGS_ENABLED: &str = "DD_LOGS_ENABLED";
pub const DD_LOGS_CONFIG_CONTAINER_COLLECT_ALL: &str = "DD_LOGS_CONFIG_CONTAINER_COLLECT_ALL";
pub const DD_LOGS_CONFIG_K8S_CONTAINER_USE_FILE: &str = "DD_LOGS_CONFIG_K8S_CONTAINER_USE_FILE";
pub const DD_LOGS_CONFIG_OPEN_FILES_LIMIT: &str = "DD_LOGS_CONFIG_OPEN_FILES_LIMIT";
pub const DD_LOGS_CONFIG_AUTO_MULTI_LINE_DETECTION: &str =
    "DD_LOGS_CONFIG_AUTO_MULTI_LINE_DETECTION";

const DEFAULT_CONTAINER_LOGS_PATH: &str = "/var/lib/docker/containers";
const DEFAULT_POD_LOGS_PATH: &str = "/var/log/pods";
const DEFAULT_CONTAINER_SYMLINKS_PATH: &str = "/var/log/containers";
const DEFAULT_TEMP_STORAGE_PATH: &str = "/var/lib/datadog-agent/logs";

const POINTER_VOLUME_NAME: &str = "pointerdir";
const POINTER_MOUNT_PATH: &str = "/opt/datadog-agent/run";
const POD_LOGS_VOLUME_NAME: &str = "logpodpath";
const CONTAINER_LOGS_VOLUME_NAME: &str = "logcontainerpath";
const SYMLINKS_VOLUME_NAME: &str = "symlinkcontainerpath";

#[derive(Debug, Default)]
pub struct LogCollectionFeature {
    container_collect_all: bool,
    container_collect_using_files: bool,
    container_logs_path: String,
    pod_logs_path: String,
    container_symlinks_path: String,
    temp_storage_path: String,
    open_files_limit: Option<i32>,
    auto_multi_line_detection: Option<bool>,
}

pub fn build(_options: &FeatureOptions) -> Box<dyn Feature> {
    Box::<LogCollectionFeature>::default()
}

impl LogCollectionFeature {
    fn manage_agent_container(
        &self,
        container: ContainerName,
        managers: &mut PodTemplateManagers<'_>,
    ) {
        let mut env = managers.env_var();
        env.add_env_var_to_container(container, env_var(DD_LOGS_ENABLED, "true"));
        env.add_env_var_to_container(
            container,
            env_var(
                DD_LOGS_CONFIG_CONTAINER_COLLECT_ALL,
                self.container_collect_all.to_string(),
            ),
        );
        env.add_env_var_to_container(
            container,
            env_var(
                DD_LOGS_CONFIG_K8S_CONTAINER_USE_FILE,
                self.container_collect_using_files.to_string(),
            ),
        );
        if let Some(limit) = self.open_files_limit {
            env.add_env_var_to_container(
                container,
                env_var(DD_LOGS_CONFIG_OPEN_FILES_LIMIT, limit.to_string()),
            );
        }
        if let Some(detection) = self.auto_multi_line_detection {
            env.add_env_var_to_container(
                container,
                env_var(DD_LOGS_CONFIG_AUTO_MULTI_LINE_DETECTION, detection.to_string()),
            );
        }

        let volumes = [
            host_path_volume(
                POINTER_VOLUME_NAME,
                &self.temp_storage_path,
                POINTER_MOUNT_PATH,
                false,
            ),
            host_path_volume(
                POD_LOGS_VOLUME_NAME,
                &self.pod_logs_path,
                &self.pod_logs_path,
                true,
            ),
            host_path_volume(
                CONTAINER_LOGS_VOLUME_NAME,
                &self.container_logs_path,
                &self.container_logs_path,
                true,
            ),
            host_path_volume(
                SYMLINKS_VOLUME_NAME,
                &self.container_symlinks_path,
                &self.container_symlinks_path,
                true,
            ),
        ];
        for (volume, mount) in &volumes {
            managers.volume().add_volume(volume);
            managers
                .volume_mount()
                .add_volume_mount_to_container(mount, container);
        }
    }
}

impl Feature for LogCollectionFeature {
    fn id(&self) -> FeatureId {
        FeatureId::LOG_COLLECTION
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
            .and_then(|features| features.log_collection.as_ref())
            .filter(|config| enabled(config.enabled))
        else {
            return RequiredComponents::default();
        };

        let path_or = |path: &Option<String>, default: &str| {
            path.clone().unwrap_or_else(|| default.to_owned())
        };
        self.container_collect_all = config.container_collect_all.unwrap_or(false);
        self.container_collect_using_files = config.container_collect_using_files.unwrap_or(true);
        self.container_logs_path =
            path_or(&config.container_logs_path, DEFAULT_CONTAINER_LOGS_PATH);
        self.pod_logs_path = path_or(&config.pod_logs_path, DEFAULT_POD_LOGS_PATH);
        self.container_symlinks_path =
            path_or(&config.container_symlinks_path, DEFAULT_CONTAINER_SYMLINKS_PATH);
        self.temp_storage_path = path_or(&config.temp_storage_path, DEFAULT_TEMP_STORAGE_PATH);
        self.open_files_limit = config.open_files_limit;
        self.auto_multi_line_detection = config.auto_multi_line_detection;

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

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        feature::test_util::{env_value, mount_paths, owner, spec},
        merger::test_util::template,
        required::Requirement,
    };

    #[test]
    fn disabled_without_block() {
        let mut feature = LogCollectionFeature::default();
        let required = feature.configure(&owner(), &mut DatadogAgentSpec::default(), None);

        assert_eq!(required, RequiredComponents::default());
    }

    #[test]
    fn configures_core_agent() {
        let mut spec = spec(indoc! {"
            features:
              logCollection:
                enabled: true
                containerCollectAll: true
                podLogsPath: /custom/pods
                openFilesLimit: 500
        "});
        let mut feature = LogCollectionFeature::default();

        let required = feature.configure(&owner(), &mut spec, None);
        assert_eq!(required.node_agent.required, Requirement::Enabled);
        assert_eq!(required.node_agent.containers, vec![ContainerName::CoreAgent]);

        let mut template = template(&[ContainerName::CoreAgent], &[ContainerName::InitConfig]);
        feature
            .manage_node_agent(&mut PodTemplateManagers::new(&mut template), "")
            .unwrap();

        let core = ContainerName::CoreAgent;
        assert_eq!(env_value(&template, core, DD_LOGS_ENABLED).as_deref(), Some("true"));
        assert_eq!(
            env_value(&template, core, DD_LOGS_CONFIG_CONTAINER_COLLECT_ALL).as_deref(),
            Some("true")
        );
        assert_eq!(
            env_value(&template, core, DD_LOGS_CONFIG_OPEN_FILES_LIMIT).as_deref(),
            Some("500")
        );
        assert_eq!(
            mount_paths(&template, core),
            vec![
                POINTER_MOUNT_PATH,
                "/custom/pods",
                DEFAULT_CONTAINER_LOGS_PATH,
                DEFAULT_CONTAINER_SYMLINKS_PATH,
            ]
        );
        assert!(mount_paths(&template, ContainerName::InitConfig).is_empty());
    }
}
