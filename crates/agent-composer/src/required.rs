//! Requirement bookkeeping shared between features and the composition driver.
//!
//! Every feature reports a [`RequiredComponents`] from its configure step. These values are
//! folded together with [`RequiredComponents::merge`], where an explicit "disabled" always wins
//! over "enabled", and "enabled" wins over "unset".
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::component::{ComponentName, ContainerName};

/// A three-valued requirement flag.
///
/// [`Requirement::Unset`] is not the same as [`Requirement::Disabled`]: an unset component is
/// only left out because nobody asked for it, while a disabled one stays off even if another
/// feature asks for it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Requirement {
    #[default]
    Unset,
    Enabled,
    Disabled,
}

impl Requirement {
    /// Combines two requirements. [`Requirement::Disabled`] dominates, [`Requirement::Unset`] is
    /// the identity.
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Disabled, _) | (_, Self::Disabled) => Self::Disabled,
            (Self::Enabled, _) | (_, Self::Enabled) => Self::Enabled,
            (Self::Unset, Self::Unset) => Self::Unset,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl From<bool> for Requirement {
    fn from(value: bool) -> Self {
        if value { Self::Enabled } else { Self::Disabled }
    }
}

impl From<Option<bool>> for Requirement {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Self::Unset, Self::from)
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Enabled => write!(f, "true"),
            Self::Disabled => write!(f, "false"),
        }
    }
}

/// Appends every entry of `other` that is not already contained in `current`.
///
/// Only membership in the original `current` is checked. Duplicates already present in
/// `current`, or repeated within `other`, are kept as they are.
pub fn merge_container_list(
    current: &[ContainerName],
    other: &[ContainerName],
) -> Vec<ContainerName> {
    let mut merged = current.to_vec();
    merged.extend(other.iter().filter(|container| !current.contains(container)));
    merged
}

/// What a feature needs from one deployable component.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RequiredComponent {
    pub required: Requirement,
    pub containers: Vec<ContainerName>,
}

impl RequiredComponent {
    pub fn enabled(containers: impl Into<Vec<ContainerName>>) -> Self {
        Self {
            required: Requirement::Enabled,
            containers: containers.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            required: Requirement::Disabled,
            containers: Vec::new(),
        }
    }

    pub fn merge(&self, other: &Self) -> Self {
        Self {
            required: self.required.merge(other.required),
            containers: merge_container_list(&self.containers, &other.containers),
        }
    }

    /// Either explicitly required or asking for at least one container.
    pub fn is_enabled(&self) -> bool {
        self.required.is_enabled() || !self.containers.is_empty()
    }

    /// The feature expressed an opinion about this component, possibly a negative one.
    pub fn is_configured(&self) -> bool {
        !self.required.is_unset() || !self.containers.is_empty()
    }

    /// The component is deployed. Only an explicit [`Requirement::Enabled`] counts.
    pub fn is_present(&self) -> bool {
        self.required.is_enabled()
    }

    pub fn is_privileged(&self) -> bool {
        self.containers.iter().any(ContainerName::is_privileged)
    }

    /// Returns true if the only container is the unprivileged single agent.
    pub fn single_container_strategy_enabled(&self) -> bool {
        self.containers == [ContainerName::UnprivilegedSingleAgent]
    }
}

/// One [`RequiredComponent`] per deployable component.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredComponents {
    pub cluster_agent: RequiredComponent,
    pub node_agent: RequiredComponent,
    pub cluster_checks_runner: RequiredComponent,
    pub otel_agent_gateway: RequiredComponent,
}

impl RequiredComponents {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            cluster_agent: self.cluster_agent.merge(&other.cluster_agent),
            node_agent: self.node_agent.merge(&other.node_agent),
            cluster_checks_runner: self
                .cluster_checks_runner
                .merge(&other.cluster_checks_runner),
            otel_agent_gateway: self.otel_agent_gateway.merge(&other.otel_agent_gateway),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.iter().any(|(_, component)| component.is_enabled())
    }

    pub fn is_configured(&self) -> bool {
        self.iter().any(|(_, component)| component.is_configured())
    }

    pub fn get(&self, component: ComponentName) -> &RequiredComponent {
        match component {
            ComponentName::ClusterAgent => &self.cluster_agent,
            ComponentName::NodeAgent => &self.node_agent,
            ComponentName::ClusterChecksRunner => &self.cluster_checks_runner,
            ComponentName::OtelAgentGateway => &self.otel_agent_gateway,
        }
    }

    pub fn get_mut(&mut self, component: ComponentName) -> &mut RequiredComponent {
        match component {
            ComponentName::ClusterAgent => &mut self.cluster_agent,
            ComponentName::NodeAgent => &mut self.node_agent,
            ComponentName::ClusterChecksRunner => &mut self.cluster_checks_runner,
            ComponentName::OtelAgentGateway => &mut self.otel_agent_gateway,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComponentName, &RequiredComponent)> {
        [
            (ComponentName::ClusterAgent, &self.cluster_agent),
            (ComponentName::NodeAgent, &self.node_agent),
            (ComponentName::ClusterChecksRunner, &self.cluster_checks_runner),
            (ComponentName::OtelAgentGateway, &self.otel_agent_gateway),
        ]
        .into_iter()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const ALL: [Requirement; 3] = [
        Requirement::Unset,
        Requirement::Enabled,
        Requirement::Disabled,
    ];

    #[test]
    fn requirement_merge_is_commutative_with_unset_identity() {
        for a in ALL {
            assert_eq!(a.merge(Requirement::Unset), a);
            for b in ALL {
                assert_eq!(a.merge(b), b.merge(a), "{a} merged with {b}");
            }
        }
    }

    #[test]
    fn disabled_dominates() {
        for other in ALL {
            assert_eq!(Requirement::Disabled.merge(other), Requirement::Disabled);
            assert_eq!(other.merge(Requirement::Disabled), Requirement::Disabled);
        }
    }

    #[rstest]
    #[case(None, Requirement::Unset)]
    #[case(Some(true), Requirement::Enabled)]
    #[case(Some(false), Requirement::Disabled)]
    fn requirement_from_optional_bool(#[case] input: Option<bool>, #[case] expected: Requirement) {
        assert_eq!(Requirement::from(input), expected);
    }

    #[test]
    fn container_list_appends_missing_entries_in_order() {
        use ContainerName::*;

        let merged = merge_container_list(&[CoreAgent, TraceAgent], &[ProcessAgent, CoreAgent]);
        assert_eq!(merged, vec![CoreAgent, TraceAgent, ProcessAgent]);
    }

    // Known quirk: only membership in the first list is checked, so duplicates inside either
    // input survive the merge.
    #[test]
    fn container_list_keeps_existing_duplicates() {
        use ContainerName::*;

        let merged = merge_container_list(&[CoreAgent, CoreAgent], &[SystemProbe, SystemProbe]);
        assert_eq!(merged, vec![CoreAgent, CoreAgent, SystemProbe, SystemProbe]);
    }

    #[test]
    fn component_flags() {
        let unset = RequiredComponent::default();
        assert!(!unset.is_enabled());
        assert!(!unset.is_configured());

        let disabled = RequiredComponent::disabled();
        assert!(!disabled.is_enabled());
        assert!(disabled.is_configured());

        let containers_only = RequiredComponent {
            required: Requirement::Unset,
            containers: vec![ContainerName::CoreAgent],
        };
        assert!(containers_only.is_enabled());
        assert!(!containers_only.is_present());

        let single = RequiredComponent::enabled([ContainerName::UnprivilegedSingleAgent]);
        assert!(single.single_container_strategy_enabled());
        assert!(!single.is_privileged());

        let npm =
            RequiredComponent::enabled([ContainerName::CoreAgent, ContainerName::SystemProbe]);
        assert!(npm.is_privileged());
        assert!(!npm.single_container_strategy_enabled());
    }

    #[test]
    fn disabled_override_wins_over_feature_requirement() {
        let feature = RequiredComponents {
            cluster_agent: RequiredComponent::enabled([ContainerName::ClusterAgent]),
            ..Default::default()
        };
        let disabled = RequiredComponents {
            cluster_agent: RequiredComponent::disabled(),
            ..Default::default()
        };

        let resolved = feature.merge(&disabled);
        assert_eq!(resolved.cluster_agent.required, Requirement::Disabled);
        assert!(!resolved.cluster_agent.is_present());
        // The container list is still merged, the override only affects the flag.
        assert_eq!(resolved.cluster_agent.containers, vec![ContainerName::ClusterAgent]);
    }
}
