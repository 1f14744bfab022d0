use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
};

use super::{ObjectKind, Result, Store};

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
pub const CORE_API_GROUP: &str = "";

pub const GET_VERB: &str = "get";
pub const LIST_VERB: &str = "list";
pub const WATCH_VERB: &str = "watch";

/// Creates and updates ServiceAccounts, Roles, ClusterRoles and their bindings.
#[derive(Debug)]
pub struct RbacManager<'a> {
    store: &'a mut Store,
}

impl<'a> RbacManager<'a> {
    pub(super) fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    pub fn add_service_account(&mut self, namespace: &str, name: &str) -> Result<()> {
        let service_account = self.store.get_or_create::<ServiceAccount>(namespace, name);
        self.store.add_or_update(service_account)
    }

    /// Grants `rules` in `namespace` to the service account through a Role and a RoleBinding,
    /// both named `role_name`. Rules already granted by the Role are kept.
    pub fn add_policy_rules(
        &mut self,
        namespace: &str,
        role_name: &str,
        service_account_name: &str,
        rules: Vec<PolicyRule>,
    ) -> Result<()> {
        let mut role = self.store.get_or_create::<Role>(namespace, role_name);
        let mut merged = role.rules.take().unwrap_or_default();
        merged.extend(rules);
        role.rules = Some(normalize_policy_rules(merged));
        self.store.add_or_update(role)?;

        self.add_role_binding(
            namespace,
            role_name,
            namespace,
            service_account_name,
            role_ref("Role", role_name),
        )
    }

    /// Grants `rules` cluster-wide to the service account in `namespace` through a ClusterRole
    /// and a ClusterRoleBinding, both named `role_name`.
    pub fn add_cluster_policy_rules(
        &mut self,
        namespace: &str,
        role_name: &str,
        service_account_name: &str,
        rules: Vec<PolicyRule>,
    ) -> Result<()> {
        let mut role = self.store.get_or_create::<ClusterRole>("", role_name);
        let mut merged = role.rules.take().unwrap_or_default();
        merged.extend(rules);
        role.rules = Some(normalize_policy_rules(merged));
        self.store.add_or_update(role)?;

        self.add_cluster_role_binding(
            role_name,
            namespace,
            service_account_name,
            role_ref("ClusterRole", role_name),
        )
    }

    /// Binds `role_ref` to a service account. An existing binding keeps its other subjects.
    pub fn add_role_binding(
        &mut self,
        namespace: &str,
        name: &str,
        service_account_namespace: &str,
        service_account_name: &str,
        role_ref: RoleRef,
    ) -> Result<()> {
        let mut binding = self.store.get_or_create::<RoleBinding>(namespace, name);
        binding.role_ref = role_ref;
        add_subject(
            binding.subjects.get_or_insert_with(Vec::new),
            service_account_subject(service_account_namespace, service_account_name),
        );
        self.store.add_or_update(binding)
    }

    pub fn add_cluster_role_binding(
        &mut self,
        name: &str,
        service_account_namespace: &str,
        service_account_name: &str,
        role_ref: RoleRef,
    ) -> Result<()> {
        let mut binding = self.store.get_or_create::<ClusterRoleBinding>("", name);
        binding.role_ref = role_ref;
        add_subject(
            binding.subjects.get_or_insert_with(Vec::new),
            service_account_subject(service_account_namespace, service_account_name),
        );
        self.store.add_or_update(binding)
    }

    pub fn delete_service_account(&mut self, namespace: &str, name: &str) -> bool {
        self.store
            .delete(ObjectKind::ServiceAccount, namespace, name)
    }

    /// Deletes the Role and its RoleBinding.
    pub fn delete_role(&mut self, namespace: &str, name: &str) -> bool {
        let role = self.store.delete(ObjectKind::Role, namespace, name);
        let binding = self.store.delete(ObjectKind::RoleBinding, namespace, name);
        role || binding
    }

    /// Deletes the ClusterRole and its ClusterRoleBinding.
    pub fn delete_cluster_role(&mut self, name: &str) -> bool {
        let role = self.store.delete(ObjectKind::ClusterRole, "", name);
        let binding = self.store.delete(ObjectKind::ClusterRoleBinding, "", name);
        role || binding
    }
}

fn add_subject(subjects: &mut Vec<Subject>, subject: Subject) {
    if !subjects.contains(&subject) {
        subjects.push(subject);
    }
}

fn service_account_subject(namespace: &str, name: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_owned(),
        name: name.to_owned(),
        namespace: Some(namespace.to_owned()),
        ..Subject::default()
    }
}

/// A reference to the Role or ClusterRole named `name`.
pub fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_owned(),
        kind: kind.to_owned(),
        name: name.to_owned(),
    }
}

/// Brings rules into a canonical form, so equal permissions always serialize identically.
///
/// Every list inside a rule is sorted and deduplicated, then the rules themselves are sorted by
/// their JSON encoding and duplicates are dropped.
pub fn normalize_policy_rules(rules: Vec<PolicyRule>) -> Vec<PolicyRule> {
    fn normalize_list(list: &mut Vec<String>) {
        list.sort();
        list.dedup();
    }

    let mut rules: Vec<PolicyRule> = rules
        .into_iter()
        .map(|mut rule| {
            normalize_list(&mut rule.verbs);
            for list in [
                &mut rule.api_groups,
                &mut rule.resources,
                &mut rule.resource_names,
                &mut rule.non_resource_urls,
            ]
            .into_iter()
            .flatten()
            {
                normalize_list(list);
            }
            rule
        })
        .collect();

    rules.sort_by_cached_key(|rule| serde_json::to_string(rule).unwrap_or_default());
    rules.dedup();
    rules
}

/// Aggregates policy rules per API group and resource.
///
/// Verbs requested several times for the same group, resource and resource names are merged
/// into one rule. [`RbacBuilder::build`] returns the rules in a fixed order, whatever order they
/// were added in.
#[derive(Clone, Debug, Default)]
pub struct RbacBuilder {
    default_verbs: Vec<String>,
    rules: Vec<PolicyRule>,
}

impl RbacBuilder {
    pub fn new(default_verbs: &[&str]) -> Self {
        Self {
            default_verbs: default_verbs.iter().map(|verb| (*verb).to_owned()).collect(),
            rules: Vec::new(),
        }
    }

    /// Grants `verbs`, or the default verbs if none are given, on `resource` in `group`.
    pub fn add_group_kind(&mut self, group: &str, resource: &str, verbs: &[&str]) -> &mut Self {
        self.add_group_kind_with_names(group, resource, &[], verbs)
    }

    /// Like [`RbacBuilder::add_group_kind`], restricted to the named objects.
    pub fn add_group_kind_with_names(
        &mut self,
        group: &str,
        resource: &str,
        resource_names: &[&str],
        verbs: &[&str],
    ) -> &mut Self {
        let verbs: Vec<String> = if verbs.is_empty() {
            self.default_verbs.clone()
        } else {
            verbs.iter().map(|verb| (*verb).to_owned()).collect()
        };
        let resource_names: Option<Vec<String>> = (!resource_names.is_empty())
            .then(|| resource_names.iter().map(|name| (*name).to_owned()).collect());

        let position = self.rules.iter().position(|rule| {
            rule.api_groups.as_deref() == Some(&[group.to_owned()][..])
                && rule.resources.as_deref() == Some(&[resource.to_owned()][..])
                && rule.resource_names == resource_names
        });
        let index = position.unwrap_or_else(|| {
            self.rules.push(PolicyRule {
                api_groups: Some(vec![group.to_owned()]),
                resources: Some(vec![resource.to_owned()]),
                resource_names,
                verbs: Vec::new(),
                ..PolicyRule::default()
            });
            self.rules.len() - 1
        });

        let rule = &mut self.rules[index];
        for verb in verbs {
            if !rule.verbs.contains(&verb) {
                rule.verbs.push(verb);
            }
        }

        self
    }

    /// Rules sorted by API group, then by resources, then by resource names.
    pub fn build(&self) -> Vec<PolicyRule> {
        let joined = |list: &Option<Vec<String>>| list.as_deref().unwrap_or_default().join(",");

        let mut rules = self.rules.clone();
        rules.sort_by_key(|rule| {
            (
                joined(&rule.api_groups),
                joined(&rule.resources),
                joined(&rule.resource_names),
            )
        });
        rules
    }
}
