//! Serves Datadog metrics to HorizontalPodAutoscalers through the external metrics API.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        core::v1::{ContainerPort, ServicePort},
        rbac::v1::PolicyRule,
    },
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use snafu::ResultExt;

use super::{Feature, FeatureId, FeatureOptions, Owner, Result, StoreSnafu, enabled};
use crate::{
    component::{ComponentName, ContainerName},
    crd::{DatadogAgentSpec, RemoteConfigConfiguration},
    merger::{PodTemplateManagers, env_var::env_var},
    required::{RequiredComponent, RequiredComponents},
    store::{
        RbacBuilder, ResourceManagers,
        rbac::{GET_VERB, LIST_VERB, WATCH_VERB},
        role_ref,
    },
};

pub const DD_EXTERNAL_METRICS_PROVIDER_ENABLED: &str = "DD_EXTERNAL_METRICS_PROVIDER_ENABLED";
pub const DD_EXTERNAL_METRICS_PROVIDER_PORT: &str = "DD_EXTERNAL_METRICS_PROVIDER_PORT";
pub const DD_EXTERNAL_METRICS_PROVIDER_USE_DATADOGMETRIC_CRD: &str =
    "DD_EXTERNAL_METRICS_PROVIDER_USE_DATADOGMETRIC_CRD";

pub const DEFAULT_METRICS_PROVIDER_PORT: i32 = 8443;
pub const EXTERNAL_METRICS_API_GROUP: &str = "external.metrics.k8s.io";
pub const EXTERNAL_METRICS_API_VERSION: &str = "v1beta1";

const METRICS_API_PORT_NAME: &str = "metricsapi";
const DATADOG_API_GROUP: &str = "datadoghq.com";

/// Lets the aggregated API server read the request header authentication configuration.
const AUTH_READER_ROLE: &str = "extension-apiserver-authentication-reader";
const AUTH_DELEGATOR_CLUSTER_ROLE: &str = "system:auth-delegator";

#[derive(Debug, Default)]
pub struct ExternalMetricsFeature {
    owner: Owner,
    port: i32,
    use_datadog_metrics: bool,
    register_api_service: bool,
}

pub fn build(_options: &FeatureOptions) -> Box<dyn Feature> {
    Box::<ExternalMetricsFeature>::default()
}

impl ExternalMetricsFeature {
    fn service_name(&self) -> String {
        format!(
            "{}-metrics-server",
            self.owner.component_name(ComponentName::ClusterAgent)
        )
    }

    fn cluster_role_name(&self) -> String {
        format!(
            "{}-external-metrics",
            self.owner.component_name(ComponentName::ClusterAgent)
        )
    }

    fn policy_rules(&self) -> Vec<PolicyRule> {
        let mut builder = RbacBuilder::new(&[LIST_VERB, WATCH_VERB]);
        builder
            .add_group_kind(EXTERNAL_METRICS_API_GROUP, "*", &[GET_VERB, LIST_VERB, WATCH_VERB])
            .add_group_kind("autoscaling", "horizontalpodautoscalers", &[]);
        if self.use_datadog_metrics {
            builder
                .add_group_kind(
                    DATADOG_API_GROUP,
                    "datadogmetrics",
                    &[LIST_VERB, WATCH_VERB, "create", "delete"],
                )
                .add_group_kind(DATADOG_API_GROUP, "datadogmetrics/status", &["update"]);
        }

        builder.build()
    }
}

impl Feature for ExternalMetricsFeature {
    fn id(&self) -> FeatureId {
        FeatureId::EXTERNAL_METRICS
    }

    fn configure(
        &mut self,
        owner: &ObjectMeta,
        spec: &mut DatadogAgentSpec,
        _remote_config: Option<&RemoteConfigConfiguration>,
    ) -> RequiredComponents {
        let Some(config) = spec
            .features
            .as_ref()
            .and_then(|features| features.external_metrics_server.as_ref())
            .filter(|config| enabled(config.enabled))
        else {
            return RequiredComponents::default();
        };

        self.owner = Owner::new(owner);
        self.port = config.port.unwrap_or(DEFAULT_METRICS_PROVIDER_PORT);
        self.use_datadog_metrics = config.use_datadogmetrics.unwrap_or(true);
        self.register_api_service = config.register_api_service.unwrap_or(true);

        RequiredComponents {
            cluster_agent: RequiredComponent::enabled([ContainerName::ClusterAgent]),
            ..RequiredComponents::default()
        }
    }

    fn manage_dependencies(
        &mut self,
        managers: &mut ResourceManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let namespace = self.owner.namespace.clone();
        let service_account = self.owner.component_name(ComponentName::ClusterAgent);
        let service_name = self.service_name();

        managers
            .service()
            .add_service(
                &namespace,
                &service_name,
                self.owner.component_selector(ComponentName::ClusterAgent),
                vec![ServicePort {
                    name: Some(METRICS_API_PORT_NAME.to_owned()),
                    port: self.port,
                    target_port: Some(IntOrString::Int(self.port)),
                    protocol: Some("TCP".to_owned()),
                    ..ServicePort::default()
                }],
                None,
            )
            .context(StoreSnafu)?;

        let mut rbac = managers.rbac();
        rbac.add_cluster_policy_rules(
            &namespace,
            &self.cluster_role_name(),
            &service_account,
            self.policy_rules(),
        )
        .context(StoreSnafu)?;
        rbac.add_role_binding(
            "kube-system",
            &format!("{service_account}-apiserver"),
            &namespace,
            &service_account,
            role_ref("Role", AUTH_READER_ROLE),
        )
        .context(StoreSnafu)?;
        rbac.add_cluster_role_binding(
            &format!("{service_account}-auth-delegator"),
            &namespace,
            &service_account,
            role_ref("ClusterRole", AUTH_DELEGATOR_CLUSTER_ROLE),
        )
        .context(StoreSnafu)?;

        if self.register_api_service {
            managers
                .api_service()
                .add_api_service(
                    EXTERNAL_METRICS_API_GROUP,
                    EXTERNAL_METRICS_API_VERSION,
                    &namespace,
                    &service_name,
                    self.port,
                )
                .context(StoreSnafu)?;
        }

        Ok(())
    }

    fn manage_cluster_agent(
        &self,
        managers: &mut PodTemplateManagers<'_>,
        _provider: &str,
    ) -> Result<()> {
        let container = ContainerName::ClusterAgent;
        let env_vars = BTreeMap::from([
            (DD_EXTERNAL_METRICS_PROVIDER_ENABLED, "true".to_owned()),
            (DD_EXTERNAL_METRICS_PROVIDER_PORT, self.port.to_string()),
            (
                DD_EXTERNAL_METRICS_PROVIDER_USE_DATADOGMETRIC_CRD,
                self.use_datadog_metrics.to_string(),
            ),
        ]);
        for (name, value) in env_vars {
            managers
                .env_var()
                .add_env_var_to_container(container, env_var(name, value));
        }

        managers.port().add_port_to_container(
            container,
            &ContainerPort {
                name: Some(METRICS_API_PORT_NAME.to_owned()),
                container_port: self.port,
                protocol: Some("TCP".to_owned()),
                ..ContainerPort::default()
            },
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use k8s_openapi::{
        api::rbac::v1::{ClusterRole, RoleBinding},
        kube_aggregator::pkg::apis::apiregistration::v1::APIService,
    };

    use super::*;
    use crate::{
        feature::test_util::{env_value, owner, spec},
        merger::test_util::{container, template},
        store::test_util::store,
    };

    fn manage(yaml: &str) -> (ExternalMetricsFeature, crate::store::Store) {
        let mut feature = ExternalMetricsFeature::default();
        feature.configure(&owner(), &mut spec(yaml), None);

        let mut store = store();
        feature
            .manage_dependencies(&mut ResourceManagers::new(&mut store), "")
            .unwrap();
        (feature, store)
    }

    #[test]
    fn registers_api_service_by_default() {
        let (_, store) = manage(indoc! {"
            features:
              externalMetricsServer:
                enabled: true
        "});

        let api_service = store
            .get::<APIService>("", "v1beta1.external.metrics.k8s.io")
            .unwrap();
        let service = api_service.spec.as_ref().unwrap().service.as_ref().unwrap();
        assert_eq!(
            service.name.as_deref(),
            Some("datadog-cluster-agent-metrics-server")
        );
        assert_eq!(service.port, Some(DEFAULT_METRICS_PROVIDER_PORT));

        let reader = store
            .get::<RoleBinding>("kube-system", "datadog-cluster-agent-apiserver")
            .unwrap();
        assert_eq!(reader.role_ref.name, AUTH_READER_ROLE);

        let role = store
            .get::<ClusterRole>("", "datadog-cluster-agent-external-metrics")
            .unwrap();
        let resources: Vec<_> = role
            .rules
            .iter()
            .flatten()
            .flat_map(|rule| rule.resources.iter().flatten())
            .collect();
        assert!(resources.contains(&&"datadogmetrics".to_owned()));
    }

    #[test]
    fn api_service_registration_can_be_skipped() {
        let (feature, store) = manage(indoc! {"
            features:
              externalMetricsServer:
                enabled: true
                port: 9443
                useDatadogmetrics: false
                registerApiService: false
        "});
        assert!(
            store
                .get::<APIService>("", "v1beta1.external.metrics.k8s.io")
                .is_none()
        );

        let dca = ContainerName::ClusterAgent;
        let mut template = template(&[dca], &[]);
        feature
            .manage_cluster_agent(&mut PodTemplateManagers::new(&mut template), "")
            .unwrap();
        assert_eq!(
            env_value(&template, dca, DD_EXTERNAL_METRICS_PROVIDER_PORT).as_deref(),
            Some("9443")
        );
        let use_crd = env_value(&template, dca, DD_EXTERNAL_METRICS_PROVIDER_USE_DATADOGMETRIC_CRD);
        assert_eq!(use_crd.as_deref(), Some("false"));
        assert_eq!(container(&template, dca).ports.as_ref().unwrap()[0].container_port, 9443);
    }
}
