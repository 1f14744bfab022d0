use k8s_openapi::{
    api::networking::v1::{
        NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicySpec,
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use serde_json::json;
use snafu::ResultExt;

use super::{BuildObjectSnafu, ObjectKind, Result, Store};

#[derive(Debug)]
pub struct NetworkPolicyManager<'a> {
    store: &'a mut Store,
}

impl<'a> NetworkPolicyManager<'a> {
    pub(super) fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Stores a Kubernetes NetworkPolicy for the pods matched by `pod_selector`.
    ///
    /// The policy types are derived from the rules: an empty rule list leaves that direction
    /// unrestricted.
    pub fn add_kubernetes_network_policy(
        &mut self,
        namespace: &str,
        name: &str,
        pod_selector: LabelSelector,
        ingress: Vec<NetworkPolicyIngressRule>,
        egress: Vec<NetworkPolicyEgressRule>,
    ) -> Result<()> {
        let mut policy_types = Vec::new();
        if !ingress.is_empty() {
            policy_types.push("Ingress");
        }
        if !egress.is_empty() {
            policy_types.push("Egress");
        }

        let spec: NetworkPolicySpec = serde_json::from_value(json!({
            "podSelector": pod_selector,
            "policyTypes": policy_types,
            "ingress": ingress,
            "egress": egress,
        }))
        .context(BuildObjectSnafu {
            kind: ObjectKind::NetworkPolicy,
            name,
        })?;

        let mut policy = self.store.get_or_create::<NetworkPolicy>(namespace, name);
        policy.spec = Some(spec);
        self.store.add_or_update(policy)
    }
}
