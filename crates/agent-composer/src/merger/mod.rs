//! Conflict-aware mutation of one shared [`PodTemplateSpec`].
//!
//! Features never touch a template directly. They go through the managers handed out by
//! [`PodTemplateManagers`], which know how to find a container by its role and how to combine a
//! new entry with an existing one carrying the same identity.
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use snafu::Snafu;

use crate::component::ContainerName;

pub use self::{
    annotation::AnnotationManager, env_from::EnvFromManager, env_var::EnvVarManager,
    port::PortManager, security_context::SecurityContextManager, volume::VolumeManager,
    volume_mount::VolumeMountManager,
};

pub mod annotation;
pub mod env_from;
pub mod env_var;
pub mod port;
pub mod security_context;
pub mod volume;
pub mod volume_mount;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Combines an existing entry with a new one sharing its identity.
pub type MergeFn<T> = fn(&T, &T) -> Result<T>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("env var {name:?} is already set and must not be merged"))]
    EnvVarMergeAttempted { name: String },

    #[snafu(display(
        "cannot append to env var {name:?}, one of the values is set from a reference"
    ))]
    IncompatibleEnvVarValue { name: String },

    #[snafu(display("volume {name:?} is already defined and must not be merged"))]
    VolumeMergeAttempted { name: String },

    #[snafu(display(
        "cannot merge items of volume {name:?}, both volumes must be ConfigMap volumes"
    ))]
    IncompatibleVolumeSource { name: String },

    #[snafu(display(
        "path {path:?} of volume {volume:?} is already used for key {existing_key:?}, \
         cannot use it for {key:?}"
    ))]
    ConfigMapItemPathConflict {
        volume: String,
        path: String,
        existing_key: String,
        key: String,
    },

    #[snafu(display(
        "volume mount {name:?} at {mount_path:?} is already defined and must not be merged"
    ))]
    VolumeMountMergeAttempted { name: String, mount_path: String },
}

/// Entry point for all template mutations of one component.
///
/// The wrapped template is shared by every feature invoked against the component, in feature
/// order. Each accessor hands out a short-lived manager borrowing the template.
#[derive(Debug)]
pub struct PodTemplateManagers<'a> {
    template: &'a mut PodTemplateSpec,
}

impl<'a> PodTemplateManagers<'a> {
    pub fn new(template: &'a mut PodTemplateSpec) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &PodTemplateSpec {
        &*self.template
    }

    pub fn env_var(&mut self) -> EnvVarManager<'_> {
        EnvVarManager::new(self.template)
    }

    pub fn env_from_var(&mut self) -> EnvFromManager<'_> {
        EnvFromManager::new(self.template)
    }

    pub fn volume(&mut self) -> VolumeManager<'_> {
        VolumeManager::new(self.template)
    }

    pub fn volume_mount(&mut self) -> VolumeMountManager<'_> {
        VolumeMountManager::new(self.template)
    }

    pub fn security_context(&mut self) -> SecurityContextManager<'_> {
        SecurityContextManager::new(self.template)
    }

    pub fn annotation(&mut self) -> AnnotationManager<'_> {
        AnnotationManager::new(self.template)
    }

    pub fn port(&mut self) -> PortManager<'_> {
        PortManager::new(self.template)
    }
}

fn pod_spec_mut(template: &mut PodTemplateSpec) -> &mut PodSpec {
    template.spec.get_or_insert_with(PodSpec::default)
}

/// All regular containers of the template. Init containers are not included.
fn containers_mut(template: &mut PodTemplateSpec) -> impl Iterator<Item = &mut Container> {
    pod_spec_mut(template).containers.iter_mut()
}

/// The regular container playing `role`.
///
/// Returns [`None`] for init roles, those are only reachable through [`init_container_mut`].
fn container_mut(template: &mut PodTemplateSpec, role: ContainerName) -> Option<&mut Container> {
    if role.is_init() {
        return None;
    }

    pod_spec_mut(template)
        .containers
        .iter_mut()
        .find(|container| container.name == role.as_str())
}

fn init_container_mut(
    template: &mut PodTemplateSpec,
    role: ContainerName,
) -> Option<&mut Container> {
    pod_spec_mut(template)
        .init_containers
        .as_mut()?
        .iter_mut()
        .find(|container| container.name == role.as_str())
}

/// Replaces the entry of `entries` that has the same identity as `new` with the result of
/// `merge_fn`, or appends `new` if there is no such entry.
fn upsert<T: Clone>(
    entries: &mut Vec<T>,
    new: &T,
    same_identity: impl Fn(&T, &T) -> bool,
    merge_fn: MergeFn<T>,
) -> Result<()> {
    match entries.iter_mut().find(|entry| same_identity(&**entry, new)) {
        Some(existing) => *existing = merge_fn(existing, new)?,
        None => entries.push(new.clone()),
    }

    Ok(())
}

/// Like [`upsert`], with the new entry always replacing the existing one.
fn replace_or_push<T: Clone>(
    entries: &mut Vec<T>,
    new: &T,
    same_identity: impl Fn(&T, &T) -> bool,
) {
    match entries.iter_mut().find(|entry| same_identity(&**entry, new)) {
        Some(existing) => existing.clone_from(new),
        None => entries.push(new.clone()),
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

    use crate::component::ContainerName;

    /// A template with one regular container per entry of `containers` and one init container
    /// per entry of `init_containers`.
    pub fn template(
        containers: &[ContainerName],
        init_containers: &[ContainerName],
    ) -> PodTemplateSpec {
        let build = |role: &ContainerName| Container {
            name: role.to_string(),
            ..Default::default()
        };

        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: containers.iter().map(build).collect(),
                init_containers: Some(init_containers.iter().map(build).collect()),
                ..Default::default()
            }),
        }
    }

    pub fn container<'a>(template: &'a PodTemplateSpec, role: ContainerName) -> &'a Container {
        template
            .spec
            .as_ref()
            .and_then(|spec| {
                spec.containers
                    .iter()
                    .chain(spec.init_containers.iter().flatten())
                    .find(|container| container.name == role.as_str())
            })
            .expect("container must exist in test template")
    }
}
