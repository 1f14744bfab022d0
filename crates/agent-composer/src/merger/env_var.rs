use k8s_openapi::api::core::v1::{EnvVar, PodTemplateSpec};
use snafu::ensure;

use super::{
    EnvVarMergeAttemptedSnafu, IncompatibleEnvVarValueSnafu, MergeFn, Result, container_mut,
    containers_mut, init_container_mut, replace_or_push, upsert,
};
use crate::component::ContainerName;

/// The new value replaces the existing one.
pub fn override_current(_current: &EnvVar, new: &EnvVar) -> Result<EnvVar> {
    Ok(new.clone())
}

/// The existing value is kept, the new one is dropped.
pub fn ignore_new(current: &EnvVar, _new: &EnvVar) -> Result<EnvVar> {
    Ok(current.clone())
}

/// Any second definition of the variable is an error.
pub fn error_on_merge_attempt(current: &EnvVar, _new: &EnvVar) -> Result<EnvVar> {
    EnvVarMergeAttemptedSnafu {
        name: current.name.clone(),
    }
    .fail()
}

/// Appends the new value to the existing one, separated by a single space.
///
/// Used for list-like variables such as `DD_IGNORE_AUTOCONF`. Values set through `valueFrom`
/// cannot be concatenated.
pub fn append_to_value(current: &EnvVar, new: &EnvVar) -> Result<EnvVar> {
    ensure!(
        current.value_from.is_none() && new.value_from.is_none(),
        IncompatibleEnvVarValueSnafu {
            name: current.name.clone(),
        }
    );

    let value = [current.value.as_deref(), new.value.as_deref()]
        .into_iter()
        .flatten()
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Ok(EnvVar {
        name: current.name.clone(),
        value: Some(value),
        value_from: None,
    })
}

fn same_name(a: &EnvVar, b: &EnvVar) -> bool {
    a.name == b.name
}

/// Manages the environment variables of the containers of one pod template.
#[derive(Debug)]
pub struct EnvVarManager<'a> {
    template: &'a mut PodTemplateSpec,
}

impl<'a> EnvVarManager<'a> {
    pub(super) fn new(template: &'a mut PodTemplateSpec) -> Self {
        Self { template }
    }

    /// Sets the variable on every regular container, replacing an existing definition.
    pub fn add_env_var(&mut self, env_var: EnvVar) {
        for container in containers_mut(self.template) {
            replace_or_push(container.env.get_or_insert_with(Vec::new), &env_var, same_name);
        }
    }

    /// Sets the variable on the container playing `role`, replacing an existing definition.
    ///
    /// Does nothing for init roles or if the template has no such container.
    pub fn add_env_var_to_container(&mut self, role: ContainerName, env_var: EnvVar) {
        if let Some(container) = container_mut(self.template, role) {
            replace_or_push(container.env.get_or_insert_with(Vec::new), &env_var, same_name);
        }
    }

    pub fn add_env_var_to_containers(&mut self, roles: &[ContainerName], env_var: &EnvVar) {
        for role in roles {
            self.add_env_var_to_container(*role, env_var.clone());
        }
    }

    /// Sets the variable on the container playing `role`. An existing definition with the same
    /// name is combined with the new one using `merge_fn`.
    pub fn add_env_var_to_container_with_merge_fn(
        &mut self,
        role: ContainerName,
        env_var: EnvVar,
        merge_fn: MergeFn<EnvVar>,
    ) -> Result<()> {
        let Some(container) = container_mut(self.template, role) else {
            return Ok(());
        };

        upsert(
            container.env.get_or_insert_with(Vec::new),
            &env_var,
            same_name,
            merge_fn,
        )
    }

    pub fn add_env_var_to_init_container(&mut self, role: ContainerName, env_var: EnvVar) {
        if let Some(container) = init_container_mut(self.template, role) {
            replace_or_push(container.env.get_or_insert_with(Vec::new), &env_var, same_name);
        }
    }
}

/// Shorthand for a plain `name=value` variable.
pub fn env_var(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{EnvVarSource, SecretKeySelector};
    use rstest::rstest;

    use super::*;
    use crate::merger::{
        Error, PodTemplateManagers,
        test_util::{container, template},
    };

    fn value_of(template: &PodTemplateSpec, role: ContainerName, name: &str) -> Option<String> {
        container(template, role)
            .env
            .iter()
            .flatten()
            .find(|env| env.name == name)
            .and_then(|env| env.value.clone())
    }

    #[rstest]
    #[case::append(append_to_value as MergeFn<EnvVar>, "a b")]
    #[case::ignore_new(ignore_new as MergeFn<EnvVar>, "a")]
    #[case::override_current(override_current as MergeFn<EnvVar>, "b")]
    fn two_features_with_merge_fn(#[case] merge_fn: MergeFn<EnvVar>, #[case] expected: &str) {
        let mut template = template(&[ContainerName::CoreAgent], &[]);
        let mut managers = PodTemplateManagers::new(&mut template);

        for value in ["a", "b"] {
            managers
                .env_var()
                .add_env_var_to_container_with_merge_fn(
                    ContainerName::CoreAgent,
                    env_var("DD_IGNORE_AUTOCONF", value),
                    merge_fn,
                )
                .unwrap();
        }

        assert_eq!(
            value_of(&template, ContainerName::CoreAgent, "DD_IGNORE_AUTOCONF").as_deref(),
            Some(expected)
        );
    }

    #[test]
    fn error_on_merge_attempt_reports_variable() {
        let mut template = template(&[ContainerName::CoreAgent], &[]);
        let mut managers = PodTemplateManagers::new(&mut template);
        let mut env = managers.env_var();

        env.add_env_var_to_container_with_merge_fn(
            ContainerName::CoreAgent,
            env_var("DD_SITE", "datadoghq.com"),
            error_on_merge_attempt,
        )
        .unwrap();
        let error = env
            .add_env_var_to_container_with_merge_fn(
                ContainerName::CoreAgent,
                env_var("DD_SITE", "datadoghq.eu"),
                error_on_merge_attempt,
            )
            .unwrap_err();

        assert_eq!(error, Error::EnvVarMergeAttempted {
            name: "DD_SITE".to_owned()
        });
    }

    #[test]
    fn append_rejects_value_from() {
        let from_secret = EnvVar {
            name: "DD_API_KEY".to_owned(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: "datadog-secret".to_owned(),
                    key: "api-key".to_owned(),
                    optional: None,
                }),
                ..Default::default()
            }),
        };

        assert!(matches!(
            append_to_value(&from_secret, &env_var("DD_API_KEY", "x")),
            Err(Error::IncompatibleEnvVarValue { .. })
        ));
    }

    #[test]
    fn init_containers_are_only_reachable_explicitly() {
        let mut template = template(&[ContainerName::CoreAgent], &[ContainerName::InitConfig]);
        let mut managers = PodTemplateManagers::new(&mut template);

        managers
            .env_var()
            .add_env_var_to_container(ContainerName::InitConfig, env_var("FOO", "steady"));
        managers.env_var().add_env_var(env_var("BAR", "all"));
        assert_eq!(value_of(&template, ContainerName::InitConfig, "FOO"), None);
        assert_eq!(value_of(&template, ContainerName::InitConfig, "BAR"), None);
        assert_eq!(
            value_of(&template, ContainerName::CoreAgent, "BAR").as_deref(),
            Some("all")
        );

        let mut managers = PodTemplateManagers::new(&mut template);
        managers
            .env_var()
            .add_env_var_to_init_container(ContainerName::InitConfig, env_var("FOO", "init"));
        assert_eq!(
            value_of(&template, ContainerName::InitConfig, "FOO").as_deref(),
            Some("init")
        );
    }

    #[test]
    fn missing_container_is_a_no_op() {
        let mut template = template(&[ContainerName::CoreAgent], &[]);
        let before = template.clone();
        let mut managers = PodTemplateManagers::new(&mut template);

        managers
            .env_var()
            .add_env_var_to_container(ContainerName::TraceAgent, env_var("DD_APM_ENABLED", "true"));

        assert_eq!(template, before);
    }
}
