use k8s_openapi::api::core::v1::{Capabilities, PodTemplateSpec, SecurityContext};

use super::container_mut;
use crate::component::ContainerName;

/// Manages the security contexts of the containers of one pod template.
#[derive(Debug)]
pub struct SecurityContextManager<'a> {
    template: &'a mut PodTemplateSpec,
}

impl<'a> SecurityContextManager<'a> {
    pub(super) fn new(template: &'a mut PodTemplateSpec) -> Self {
        Self { template }
    }

    /// Adds Linux capabilities to the container playing `role`.
    ///
    /// Capabilities already granted are kept and not repeated. Does nothing for init roles or if
    /// the template has no such container.
    pub fn add_capabilities_to_container<S>(&mut self, capabilities: &[S], role: ContainerName)
    where
        S: AsRef<str>,
    {
        let Some(container) = container_mut(self.template, role) else {
            return;
        };

        let added = container
            .security_context
            .get_or_insert_with(SecurityContext::default)
            .capabilities
            .get_or_insert_with(Capabilities::default)
            .add
            .get_or_insert_with(Vec::new);

        for capability in capabilities {
            let capability = capability.as_ref();
            if !added.iter().any(|existing| existing == capability) {
                added.push(capability.to_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::{
        PodTemplateManagers,
        test_util::{container, template},
    };

    #[test]
    fn capabilities_are_unioned() {
        let mut template = template(&[ContainerName::SystemProbe], &[ContainerName::SeccompSetup]);
        let mut managers = PodTemplateManagers::new(&mut template);

        managers
            .security_context()
            .add_capabilities_to_container(&["SYS_ADMIN", "NET_ADMIN"], ContainerName::SystemProbe);
        managers
            .security_context()
            .add_capabilities_to_container(&["SYS_ADMIN", "BPF"], ContainerName::SystemProbe);
        managers
            .security_context()
            .add_capabilities_to_container(&["SYS_ADMIN"], ContainerName::SeccompSetup);

        let added = container(&template, ContainerName::SystemProbe)
            .security_context
            .as_ref()
            .and_then(|context| context.capabilities.as_ref())
            .and_then(|capabilities| capabilities.add.clone());
        assert_eq!(
            added,
            Some(vec![
                "SYS_ADMIN".to_owned(),
                "NET_ADMIN".to_owned(),
                "BPF".to_owned()
            ])
        );
        assert_eq!(
            container(&template, ContainerName::SeccompSetup).security_context,
            None
        );
    }
}
