use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, HostPathVolumeSource, KeyToPath, PodTemplateSpec,
    Volume, VolumeMount,
};
use snafu::OptionExt;

use super::{
    ConfigMapItemPathConflictSnafu, IncompatibleVolumeSourceSnafu, MergeFn, Result,
    VolumeMergeAttemptedSnafu, pod_spec_mut, replace_or_push, upsert,
};

pub fn override_current(_current: &Volume, new: &Volume) -> Result<Volume> {
    Ok(new.clone())
}

pub fn ignore_new(current: &Volume, _new: &Volume) -> Result<Volume> {
    Ok(current.clone())
}

pub fn error_on_merge_attempt(current: &Volume, _new: &Volume) -> Result<Volume> {
    VolumeMergeAttemptedSnafu {
        name: current.name.clone(),
    }
    .fail()
}

/// Merges the `items` of two ConfigMap volumes, keyed by their path.
///
/// An item whose path is already mapped to a different key is rejected.
pub fn merge_config_map_items(current: &Volume, new: &Volume) -> Result<Volume> {
    let incompatible = || IncompatibleVolumeSourceSnafu {
        name: current.name.clone(),
    };
    let current_source = current.config_map.as_ref().with_context(incompatible)?;
    let new_source = new.config_map.as_ref().with_context(incompatible)?;

    let mut items = current_source.items.clone().unwrap_or_default();
    for item in new_source.items.iter().flatten() {
        match items.iter().find(|existing| existing.path == item.path) {
            Some(existing) if existing.key != item.key => {
                return ConfigMapItemPathConflictSnafu {
                    volume: current.name.clone(),
                    path: item.path.clone(),
                    existing_key: existing.key.clone(),
                    key: item.key.clone(),
                }
                .fail();
            }
            Some(_) => {}
            None => items.push(item.clone()),
        }
    }

    Ok(Volume {
        config_map: Some(ConfigMapVolumeSource {
            items: Some(items),
            ..current_source.clone()
        }),
        ..current.clone()
    })
}

fn same_name(a: &Volume, b: &Volume) -> bool {
    a.name == b.name
}

/// Manages the volumes of one pod template.
#[derive(Debug)]
pub struct VolumeManager<'a> {
    template: &'a mut PodTemplateSpec,
}

impl<'a> VolumeManager<'a> {
    pub(super) fn new(template: &'a mut PodTemplateSpec) -> Self {
        Self { template }
    }

    /// Adds the volume, replacing any volume with the same name.
    pub fn add_volume(&mut self, volume: &Volume) {
        let volumes = pod_spec_mut(self.template)
            .volumes
            .get_or_insert_with(Vec::new);
        replace_or_push(volumes, volume, same_name);
    }

    pub fn add_volume_with_merge_fn(
        &mut self,
        volume: &Volume,
        merge_fn: MergeFn<Volume>,
    ) -> Result<()> {
        let volumes = pod_spec_mut(self.template)
            .volumes
            .get_or_insert_with(Vec::new);
        upsert(volumes, volume, same_name, merge_fn)
    }
}

/// A host path volume together with the matching mount.
pub fn host_path_volume(
    name: &str,
    host_path: &str,
    mount_path: &str,
    read_only: bool,
) -> (Volume, VolumeMount) {
    let volume = Volume {
        name: name.to_owned(),
        host_path: Some(HostPathVolumeSource {
            path: host_path.to_owned(),
            type_: None,
        }),
        ..Default::default()
    };

    (volume, volume_mount(name, mount_path, read_only))
}

/// An emptyDir volume together with the matching mount.
pub fn empty_dir_volume(name: &str, mount_path: &str, read_only: bool) -> (Volume, VolumeMount) {
    let volume = Volume {
        name: name.to_owned(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };

    (volume, volume_mount(name, mount_path, read_only))
}

/// A volume exposing selected keys of a ConfigMap.
pub fn config_map_volume(name: &str, config_map: &str, items: &[(&str, &str)]) -> Volume {
    Volume {
        name: name.to_owned(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_owned(),
            items: (!items.is_empty()).then(|| {
                items
                    .iter()
                    .map(|(key, path)| KeyToPath {
                        key: (*key).to_owned(),
                        path: (*path).to_owned(),
                        mode: None,
                    })
                    .collect()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume_mount(name: &str, mount_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_owned(),
        mount_path: mount_path.to_owned(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::{Error, PodTemplateManagers, test_util::template};

    fn volumes(template: &PodTemplateSpec) -> Vec<Volume> {
        template
            .spec
            .as_ref()
            .and_then(|spec| spec.volumes.clone())
            .unwrap_or_default()
    }

    #[test]
    fn config_map_items_are_merged_by_path() {
        let mut template = template(&[], &[]);
        let mut managers = PodTemplateManagers::new(&mut template);

        managers.volume().add_volume(&config_map_volume(
            "checksd",
            "datadog-checks",
            &[("ksm.py", "ksm.py")],
        ));
        managers
            .volume()
            .add_volume_with_merge_fn(
                &config_map_volume(
                    "checksd",
                    "datadog-checks",
                    &[("ksm.py", "ksm.py"), ("gpu.py", "gpu.py")],
                ),
                merge_config_map_items,
            )
            .unwrap();

        let volumes = volumes(&template);
        assert_eq!(volumes.len(), 1);
        let paths: Vec<_> = volumes[0]
            .config_map
            .as_ref()
            .and_then(|config_map| config_map.items.as_ref())
            .unwrap()
            .iter()
            .map(|item| item.path.as_str())
            .collect();
        assert_eq!(paths, ["ksm.py", "gpu.py"]);
    }

    #[test]
    fn config_map_item_path_conflict() {
        let current = config_map_volume("checksd", "datadog-checks", &[("ksm.py", "check.py")]);
        let new = config_map_volume("checksd", "datadog-checks", &[("gpu.py", "check.py")]);

        assert_eq!(
            merge_config_map_items(&current, &new).unwrap_err(),
            Error::ConfigMapItemPathConflict {
                volume: "checksd".to_owned(),
                path: "check.py".to_owned(),
                existing_key: "ksm.py".to_owned(),
                key: "gpu.py".to_owned(),
            }
        );
    }

    #[test]
    fn config_map_items_need_config_map_volumes() {
        let (host, _) = host_path_volume("checksd", "/etc/checks", "/checks.d", true);
        let config_map = config_map_volume("checksd", "datadog-checks", &[]);

        assert!(matches!(
            merge_config_map_items(&host, &config_map),
            Err(Error::IncompatibleVolumeSource { .. })
        ));
    }

    #[test]
    fn error_and_ignore_merge_fns() {
        let mut template = template(&[], &[]);
        let mut managers = PodTemplateManagers::new(&mut template);
        let (first, _) = host_path_volume("procdir", "/proc", "/host/proc", true);
        let (second, _) = host_path_volume("procdir", "/other", "/host/proc", true);

        managers.volume().add_volume(&first);
        managers
            .volume()
            .add_volume_with_merge_fn(&second, ignore_new)
            .unwrap();
        assert!(matches!(
            managers
                .volume()
                .add_volume_with_merge_fn(&second, error_on_merge_attempt),
            Err(Error::VolumeMergeAttempted { .. })
        ));

        assert_eq!(volumes(&template), vec![first]);
    }
}
