use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

use super::{Result, Store};

#[derive(Debug)]
pub struct ServiceManager<'a> {
    store: &'a mut Store,
}

impl<'a> ServiceManager<'a> {
    pub(super) fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Stores a ClusterIP Service selecting the pods labelled with `selector`.
    ///
    /// With `internal_traffic_policy` set to `Local`, node-local clients only reach the agent on
    /// their own node.
    pub fn add_service(
        &mut self,
        namespace: &str,
        name: &str,
        selector: BTreeMap<String, String>,
        ports: Vec<ServicePort>,
        internal_traffic_policy: Option<&str>,
    ) -> Result<()> {
        let mut service = self.store.get_or_create::<Service>(namespace, name);
        service.spec = Some(ServiceSpec {
            type_: Some("ClusterIP".to_owned()),
            selector: Some(selector),
            ports: Some(ports),
            internal_traffic_policy: internal_traffic_policy.map(str::to_owned),
            ..ServiceSpec::default()
        });
        self.store.add_or_update(service)
    }
}
