use std::{
    collections::BTreeMap,
    sync::{LazyLock, PoisonError, RwLock},
};

use snafu::{Snafu, ensure};
use tracing::debug;

use super::{BUILTIN_FEATURES, Feature, FeatureId, FeatureOptions};

/// Creates a fresh, unconfigured feature instance.
pub type BuildFn = fn(&FeatureOptions) -> Box<dyn Feature>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("feature {id} is already registered"))]
    DuplicateFeature { id: FeatureId },
}

static GLOBAL_REGISTRY: LazyLock<FeatureRegistry> = LazyLock::new(|| {
    FeatureRegistry::with_builtin_features().expect("built-in feature identifiers must be unique")
});

/// Maps feature identifiers to their builders.
///
/// Registration happens once at start-up. Composition runs only take the read lock, so any
/// number of them can build their features concurrently.
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    builders: RwLock<BTreeMap<FeatureId, BuildFn>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry containing every built-in feature.
    pub fn with_builtin_features() -> Result<Self, Error> {
        let registry = Self::new();
        for (id, build) in BUILTIN_FEATURES {
            registry.register(id, build)?;
        }

        Ok(registry)
    }

    /// The process-wide registry, populated with the built-in features on first access.
    ///
    /// A duplicate built-in identifier is a packaging defect and panics.
    pub fn global() -> &'static Self {
        &GLOBAL_REGISTRY
    }

    pub fn register(&self, id: FeatureId, build: BuildFn) -> Result<(), Error> {
        let mut builders = self.builders.write().unwrap_or_else(PoisonError::into_inner);
        ensure!(!builders.contains_key(&id), DuplicateFeatureSnafu { id });

        debug!(%id, "registering feature");
        builders.insert(id, build);
        Ok(())
    }

    /// All registered identifiers, in processing order.
    pub fn ids(&self) -> Vec<FeatureId> {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Builds a fresh instance of every registered feature, in processing order.
    pub fn build_all(&self, options: &FeatureOptions) -> Vec<Box<dyn Feature>> {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|build| build(options))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{apm, npm};

    #[test]
    fn duplicate_registration_fails() {
        let registry = FeatureRegistry::new();

        registry.register(FeatureId::NPM, npm::build).unwrap();
        assert_eq!(
            registry.register(FeatureId::NPM, apm::build),
            Err(Error::DuplicateFeature { id: FeatureId::NPM })
        );
        assert_eq!(registry.ids(), vec![FeatureId::NPM]);
    }

    #[test]
    fn features_are_built_in_identifier_order() {
        let registry = FeatureRegistry::new();
        registry.register(FeatureId::NPM, npm::build).unwrap();
        registry.register(FeatureId::APM, apm::build).unwrap();

        let ids: Vec<_> = registry
            .build_all(&FeatureOptions::default())
            .iter()
            .map(|feature| feature.id())
            .collect();
        assert_eq!(ids, vec![FeatureId::APM, FeatureId::NPM]);
    }

    #[test]
    fn global_registry_contains_builtins() {
        let ids = FeatureRegistry::global().ids();

        assert_eq!(ids.len(), BUILTIN_FEATURES.len());
        assert!(ids.is_sorted());
    }
}
