use k8s_openapi::{api::core::v1::PodTemplateSpec, apimachinery::pkg::apis::meta::v1::ObjectMeta};

/// Manages the annotations of one pod template.
#[derive(Debug)]
pub struct AnnotationManager<'a> {
    template: &'a mut PodTemplateSpec,
}

impl<'a> AnnotationManager<'a> {
    pub(super) fn new(template: &'a mut PodTemplateSpec) -> Self {
        Self { template }
    }

    /// Sets the annotation, the last value written for a key wins.
    pub fn add_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::merger::{PodTemplateManagers, test_util::template};

    #[test]
    fn last_value_wins() {
        let mut template = template(&[], &[]);
        let mut managers = PodTemplateManagers::new(&mut template);

        managers.annotation().add_annotation(
            "container.apparmor.security.beta.kubernetes.io/system-probe",
            "unconfined",
        );
        managers
            .annotation()
            .add_annotation("checksum/cluster-checks-custom-config", "abc");
        managers
            .annotation()
            .add_annotation("checksum/cluster-checks-custom-config", "def");

        assert_eq!(
            template.metadata.and_then(|metadata| metadata.annotations),
            Some(BTreeMap::from([
                (
                    "checksum/cluster-checks-custom-config".to_owned(),
                    "def".to_owned()
                ),
                (
                    "container.apparmor.security.beta.kubernetes.io/system-probe".to_owned(),
                    "unconfined".to_owned()
                ),
            ]))
        );
    }
}
