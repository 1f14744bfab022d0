use k8s_openapi::api::core::v1::{PodTemplateSpec, VolumeMount};

use super::{
    MergeFn, Result, VolumeMountMergeAttemptedSnafu, container_mut, init_container_mut,
    replace_or_push, upsert,
};
use crate::component::ContainerName;

pub fn override_current(_current: &VolumeMount, new: &VolumeMount) -> Result<VolumeMount> {
    Ok(new.clone())
}

pub fn ignore_new(current: &VolumeMount, _new: &VolumeMount) -> Result<VolumeMount> {
    Ok(current.clone())
}

pub fn error_on_merge_attempt(current: &VolumeMount, _new: &VolumeMount) -> Result<VolumeMount> {
    VolumeMountMergeAttemptedSnafu {
        name: current.name.clone(),
        mount_path: current.mount_path.clone(),
    }
    .fail()
}

/// A volume may be mounted several times in one container, but only once per path.
fn same_mount(a: &VolumeMount, b: &VolumeMount) -> bool {
    a.name == b.name && a.mount_path == b.mount_path
}

/// Manages the volume mounts of the containers of one pod template.
#[derive(Debug)]
pub struct VolumeMountManager<'a> {
    template: &'a mut PodTemplateSpec,
}

impl<'a> VolumeMountManager<'a> {
    pub(super) fn new(template: &'a mut PodTemplateSpec) -> Self {
        Self { template }
    }

    /// Does nothing for init roles or if the template has no such container.
    pub fn add_volume_mount_to_container(
        &mut self,
        volume_mount: &VolumeMount,
        role: ContainerName,
    ) {
        if let Some(container) = container_mut(self.template, role) {
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            replace_or_push(mounts, volume_mount, same_mount);
        }
    }

    pub fn add_volume_mount_to_containers(
        &mut self,
        volume_mount: &VolumeMount,
        roles: &[ContainerName],
    ) {
        for role in roles {
            self.add_volume_mount_to_container(volume_mount, *role);
        }
    }

    pub fn add_volume_mount_to_container_with_merge_fn(
        &mut self,
        volume_mount: &VolumeMount,
        role: ContainerName,
        merge_fn: MergeFn<VolumeMount>,
    ) -> Result<()> {
        let Some(container) = container_mut(self.template, role) else {
            return Ok(());
        };

        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        upsert(mounts, volume_mount, same_mount, merge_fn)
    }

    pub fn add_volume_mount_to_init_container(
        &mut self,
        volume_mount: &VolumeMount,
        role: ContainerName,
    ) {
        if let Some(container) = init_container_mut(self.template, role) {
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            replace_or_push(mounts, volume_mount, same_mount);
        }
    }
}
