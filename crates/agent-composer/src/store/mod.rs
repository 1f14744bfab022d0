//! Accumulates the auxiliary objects features produce while managing their dependencies.
//!
//! Objects are keyed by kind, namespace and name. A later insert with the same key replaces the
//! earlier object, and since features run in a fixed order the final content is reproducible.
use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::{
    api::{
        core::v1::{ConfigMap, Secret, Service, ServiceAccount},
        networking::v1::NetworkPolicy,
        rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    kube_aggregator::pkg::apis::apiregistration::v1::APIService,
};
use kube::{Resource, ResourceExt};
use snafu::{OptionExt, Snafu};
use strum::Display;
use tracing::debug;

pub use self::{
    api_service::ApiServiceManager,
    config_map::ConfigMapManager,
    network_policy::NetworkPolicyManager,
    rbac::{RbacBuilder, RbacManager, normalize_policy_rules, role_ref},
    secret::SecretManager,
    service::ServiceManager,
};

pub mod api_service;
pub mod config_map;
pub mod network_policy;
pub mod rbac;
pub mod secret;
pub mod service;

pub const MANAGED_BY_STORE_LABEL: &str = "operator.datadoghq.com/managed-by-store";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const OPERATOR_NAME: &str = "datadog-operator";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{kind} object has no name"))]
    MissingObjectName { kind: ObjectKind },

    #[snafu(display("namespaced {kind} object {name:?} has no namespace"))]
    MissingObjectNamespace { kind: ObjectKind, name: String },

    #[snafu(display("failed to serialize the data of ConfigMap {name:?}"))]
    SerializeConfigData {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to build {kind} object {name:?}"))]
    BuildObject {
        source: serde_json::Error,
        kind: ObjectKind,
        name: String,
    },
}

/// The kinds of objects the store accepts.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ObjectKind {
    ServiceAccount,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    ConfigMap,
    Secret,
    Service,
    NetworkPolicy,
    #[strum(serialize = "APIService")]
    ApiService,
}

impl ObjectKind {
    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            Self::ClusterRole | Self::ClusterRoleBinding | Self::ApiService
        )
    }
}

/// Identifies one stored object. Cluster-scoped objects use an empty namespace.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StoreKey {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreObject {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    ConfigMap(ConfigMap),
    Secret(Secret),
    Service(Service),
    NetworkPolicy(NetworkPolicy),
    ApiService(APIService),
}

/// A Kubernetes object type the [`Store`] can hold.
pub trait Storable: Resource<DynamicType = ()> + Clone + Default {
    const KIND: ObjectKind;

    fn into_object(self) -> StoreObject;

    fn from_object(object: &StoreObject) -> Option<&Self>;
}

macro_rules! impl_storable {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl Storable for $ty {
                const KIND: ObjectKind = ObjectKind::$variant;

                fn into_object(self) -> StoreObject {
                    StoreObject::$variant(self)
                }

                fn from_object(object: &StoreObject) -> Option<&Self> {
                    match object {
                        StoreObject::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_storable! {
    ServiceAccount => ServiceAccount,
    Role => Role,
    RoleBinding => RoleBinding,
    ClusterRole => ClusterRole,
    ClusterRoleBinding => ClusterRoleBinding,
    ConfigMap => ConfigMap,
    Secret => Secret,
    Service => Service,
    NetworkPolicy => NetworkPolicy,
    ApiService => APIService,
}

/// Facts about the target cluster, supplied by the caller and never modified here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlatformInfo {
    pub version: Option<semver::Version>,
    pub feature_gates: BTreeSet<String>,
}

impl PlatformInfo {
    /// Parses versions as reported by the API server, such as `v1.29.3-gke.1067004`.
    ///
    /// Unparsable versions are treated as unknown.
    pub fn new(version: &str, feature_gates: impl IntoIterator<Item = String>) -> Self {
        let core = version
            .trim_start_matches('v')
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        let mut parts = core.split('.').map(str::parse::<u64>);
        let version = match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor)), None) => Some(semver::Version::new(major, minor, 0)),
            (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch))) => {
                Some(semver::Version::new(major, minor, patch))
            }
            _ => None,
        };

        Self {
            version,
            feature_gates: feature_gates.into_iter().collect(),
        }
    }

    /// Unknown versions are assumed to be recent.
    pub fn is_at_least(&self, major: u64, minor: u64) -> bool {
        self.version
            .as_ref()
            .is_none_or(|version| (version.major, version.minor) >= (major, minor))
    }

    pub fn feature_gate_enabled(&self, gate: &str) -> bool {
        self.feature_gates.contains(gate)
    }
}

/// Desired auxiliary objects of one composition run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Store {
    objects: BTreeMap<StoreKey, StoreObject>,
    default_labels: BTreeMap<String, String>,
    owner_namespace: Option<String>,
    owner_reference: Option<OwnerReference>,
    platform_info: PlatformInfo,
}

impl Store {
    /// Creates an empty store for objects owned by `owner`.
    ///
    /// Namespaced objects living in the owner's namespace get a controller reference to it, so
    /// they are garbage collected together with the owner.
    pub fn new<R>(owner: &R, platform_info: PlatformInfo) -> Self
    where
        R: Resource<DynamicType = ()>,
    {
        let part_of = match owner.namespace() {
            Some(namespace) => format!("{namespace}-{name}", name = owner.name_any()),
            None => owner.name_any(),
        };

        Self {
            objects: BTreeMap::new(),
            default_labels: BTreeMap::from([
                (MANAGED_BY_LABEL.to_owned(), OPERATOR_NAME.to_owned()),
                (PART_OF_LABEL.to_owned(), part_of),
            ]),
            owner_namespace: owner.namespace(),
            owner_reference: owner.controller_owner_ref(&()),
            platform_info,
        }
    }

    /// Inserts the object, replacing an object of the same kind, namespace and name.
    pub fn add_or_update<K: Storable>(&mut self, mut object: K) -> Result<()> {
        let kind = K::KIND;
        let name = object
            .meta()
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .context(MissingObjectNameSnafu { kind })?;
        let namespace = if kind.is_namespaced() {
            object
                .meta()
                .namespace
                .clone()
                .filter(|namespace| !namespace.is_empty())
                .context(MissingObjectNamespaceSnafu {
                    kind,
                    name: name.clone(),
                })?
        } else {
            String::new()
        };

        let labels = object.labels_mut();
        labels.extend(self.default_labels.clone());
        labels.insert(MANAGED_BY_STORE_LABEL.to_owned(), "true".to_owned());

        if let Some(owner_reference) = &self.owner_reference {
            if kind.is_namespaced() && self.owner_namespace.as_deref() == Some(namespace.as_str()) {
                let owner_references = object.owner_references_mut();
                if !owner_references
                    .iter()
                    .any(|existing| existing.uid == owner_reference.uid)
                {
                    owner_references.push(owner_reference.clone());
                }
            }
        }

        debug!(%kind, %namespace, %name, "storing object");
        self.objects.insert(
            StoreKey {
                kind,
                namespace,
                name,
            },
            object.into_object(),
        );

        Ok(())
    }

    pub fn get<K: Storable>(&self, namespace: &str, name: &str) -> Option<&K> {
        self.objects
            .get(&Self::key::<K>(namespace, name))
            .and_then(K::from_object)
    }

    /// Returns a copy of the stored object, or a new object with only its name and namespace set.
    pub fn get_or_create<K: Storable>(&self, namespace: &str, name: &str) -> K {
        if let Some(existing) = self.get::<K>(namespace, name) {
            return existing.clone();
        }

        let mut object = K::default();
        object.meta_mut().name = Some(name.to_owned());
        if K::KIND.is_namespaced() {
            object.meta_mut().namespace = Some(namespace.to_owned());
        }

        object
    }

    /// Removes the object, returning whether it was present.
    pub fn delete(&mut self, kind: ObjectKind, namespace: &str, name: &str) -> bool {
        let namespace = if kind.is_namespaced() { namespace } else { "" };
        self.objects
            .remove(&StoreKey {
                kind,
                namespace: namespace.to_owned(),
                name: name.to_owned(),
            })
            .is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StoreKey, &StoreObject)> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn platform_info(&self) -> &PlatformInfo {
        &self.platform_info
    }

    pub fn owner_namespace(&self) -> Option<&str> {
        self.owner_namespace.as_deref()
    }

    fn key<K: Storable>(namespace: &str, name: &str) -> StoreKey {
        StoreKey {
            kind: K::KIND,
            namespace: if K::KIND.is_namespaced() {
                namespace.to_owned()
            } else {
                String::new()
            },
            name: name.to_owned(),
        }
    }
}

/// Gives features typed access to the store while managing their dependencies.
#[derive(Debug)]
pub struct ResourceManagers<'a> {
    store: &'a mut Store,
}

impl<'a> ResourceManagers<'a> {
    pub fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &*self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        self.store
    }

    pub fn rbac(&mut self) -> RbacManager<'_> {
        RbacManager::new(self.store)
    }

    pub fn config_map(&mut self) -> ConfigMapManager<'_> {
        ConfigMapManager::new(self.store)
    }

    pub fn secret(&mut self) -> SecretManager<'_> {
        SecretManager::new(self.store)
    }

    pub fn service(&mut self) -> ServiceManager<'_> {
        ServiceManager::new(self.store)
    }

    pub fn network_policy(&mut self) -> NetworkPolicyManager<'_> {
        NetworkPolicyManager::new(self.store)
    }

    pub fn api_service(&mut self) -> ApiServiceManager<'_> {
        ApiServiceManager::new(self.store)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::{PlatformInfo, Store};
    use crate::crd::{DatadogAgent, DatadogAgentSpec};

    pub fn owner() -> DatadogAgent {
        let mut owner = DatadogAgent::new("datadog", DatadogAgentSpec::default());
        owner.metadata.namespace = Some("monitoring".to_owned());
        owner.metadata.uid = Some("c5e6f1a2-0000-4000-8000-000000000001".to_owned());
        owner
    }

    pub fn store() -> Store {
        Store::new(&owner(), PlatformInfo::new("v1.30.2", []))
    }
}
