use k8s_openapi::api::core::v1::{ContainerPort, PodTemplateSpec};

use super::{container_mut, replace_or_push};
use crate::component::ContainerName;

/// Ports are identified by number and protocol, an unset protocol means TCP.
fn same_port(a: &ContainerPort, b: &ContainerPort) -> bool {
    let protocol = |port: &ContainerPort| port.protocol.clone().unwrap_or_else(|| "TCP".to_owned());

    a.container_port == b.container_port && protocol(a) == protocol(b)
}

/// Manages the container ports of one pod template.
#[derive(Debug)]
pub struct PortManager<'a> {
    template: &'a mut PodTemplateSpec,
}

impl<'a> PortManager<'a> {
    pub(super) fn new(template: &'a mut PodTemplateSpec) -> Self {
        Self { template }
    }

    /// Adds the port to the container playing `role`, replacing a port with the same number and
    /// protocol. Does nothing for init roles or if the template has no such container.
    pub fn add_port_to_container(&mut self, role: ContainerName, port: &ContainerPort) {
        if let Some(container) = container_mut(self.template, role) {
            let ports = container.ports.get_or_insert_with(Vec::new);
            replace_or_push(ports, port, same_port);
        }
    }
}

/// A named port exposed on the host with the same number.
pub fn host_port(name: &str, port: i32, protocol: &str) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_owned()),
        container_port: port,
        host_port: Some(port),
        protocol: Some(protocol.to_owned()),
        host_ip: None,
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
    fn ports_are_identified_by_number_and_protocol() {
        let mut template = template(&[ContainerName::CoreAgent], &[]);
        let mut managers = PodTemplateManagers::new(&mut template);

        managers.port().add_port_to_container(
            ContainerName::CoreAgent,
            &ContainerPort {
                container_port: 4317,
                name: Some("otlpgrpcport".to_owned()),
                ..Default::default()
            },
        );
        managers
            .port()
            .add_port_to_container(ContainerName::CoreAgent, &host_port("otel-grpc", 4317, "TCP"));
        managers.port().add_port_to_container(
            ContainerName::CoreAgent,
            &host_port("dogstatsdport", 8125, "UDP"),
        );

        let ports = container(&template, ContainerName::CoreAgent)
            .ports
            .clone()
            .unwrap();
        assert_eq!(ports, vec![
            host_port("otel-grpc", 4317, "TCP"),
            host_port("dogstatsdport", 8125, "UDP")
        ]);
    }
}
