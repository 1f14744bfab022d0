use k8s_openapi::api::core::v1::{EnvFromSource, PodTemplateSpec};

use super::{container_mut, containers_mut, replace_or_push};
use crate::component::ContainerName;

/// Two sources are the same if they reference the same ConfigMap or the same Secret.
fn same_reference(a: &EnvFromSource, b: &EnvFromSource) -> bool {
    let config_map = |source: &EnvFromSource| {
        source
            .config_map_ref
            .as_ref()
            .map(|config_map| config_map.name.clone())
    };
    let secret = |source: &EnvFromSource| {
        source
            .secret_ref
            .as_ref()
            .map(|secret| secret.name.clone())
    };

    (config_map(a).is_some() && config_map(a) == config_map(b))
        || (secret(a).is_some() && secret(a) == secret(b))
}

/// Manages the `envFrom` sources of the containers of one pod template.
#[derive(Debug)]
pub struct EnvFromManager<'a> {
    template: &'a mut PodTemplateSpec,
}

impl<'a> EnvFromManager<'a> {
    pub(super) fn new(template: &'a mut PodTemplateSpec) -> Self {
        Self { template }
    }

    pub fn add_env_from_var(&mut self, source: &EnvFromSource) {
        for container in containers_mut(self.template) {
            let env_from = container.env_from.get_or_insert_with(Vec::new);
            replace_or_push(env_from, source, same_reference);
        }
    }

    /// Does nothing for init roles or if the template has no such container.
    pub fn add_env_from_var_to_container(&mut self, role: ContainerName, source: &EnvFromSource) {
        if let Some(container) = container_mut(self.template, role) {
            let env_from = container.env_from.get_or_insert_with(Vec::new);
            replace_or_push(env_from, source, same_reference);
        }
    }

    pub fn add_env_from_var_to_containers(
        &mut self,
        roles: &[ContainerName],
        source: &EnvFromSource,
    ) {
        for role in roles {
            self.add_env_from_var_to_container(*role, source);
        }
    }
}
