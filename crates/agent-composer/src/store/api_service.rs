use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{APIService, APIServiceSpec};
use serde_json::json;
use snafu::ResultExt;

use super::{BuildObjectSnafu, ObjectKind, Result, Store};

/// Registers aggregated APIs served by one of the components.
#[derive(Debug)]
pub struct ApiServiceManager<'a> {
    store: &'a mut Store,
}

impl<'a> ApiServiceManager<'a> {
    pub(super) fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Stores the APIService `{version}.{group}` backed by the given Service.
    pub fn add_api_service(
        &mut self,
        group: &str,
        version: &str,
        service_namespace: &str,
        service_name: &str,
        port: i32,
    ) -> Result<()> {
        let name = format!("{version}.{group}");
        let spec: APIServiceSpec = serde_json::from_value(json!({
            "group": group,
            "version": version,
            "groupPriorityMinimum": 100,
            "versionPriority": 100,
            "insecureSkipTLSVerify": true,
            "service": {
                "name": service_name,
                "namespace": service_namespace,
                "port": port,
            },
        }))
        .context(BuildObjectSnafu {
            kind: ObjectKind::ApiService,
            name: name.clone(),
        })?;

        let mut api_service = self.store.get_or_create::<APIService>("", &name);
        api_service.spec = Some(spec);
        self.store.add_or_update(api_service)
    }
}
