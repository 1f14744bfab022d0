use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use snafu::ResultExt;

use super::{Result, SerializeConfigDataSnafu, Store};

/// Annotation carrying the checksum of a configuration blob, see [`checksum_annotation_key`].
pub fn checksum_annotation_key(name: &str) -> String {
    format!("checksum/{name}-custom-config")
}

/// Hex encoded SHA-256 of the JSON serialization of `value`.
pub fn checksum<T: serde::Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let serialized = serde_json::to_vec(value)?;
    Ok(format!("{:x}", Sha256::digest(serialized)))
}

/// Stores ConfigMaps annotated with the checksum of their data.
///
/// Pod templates mounting the ConfigMap carry the same checksum, so a change of the data rolls
/// the pods.
#[derive(Debug)]
pub struct ConfigMapManager<'a> {
    store: &'a mut Store,
}

impl<'a> ConfigMapManager<'a> {
    pub(super) fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Stores the ConfigMap and returns the checksum of its data.
    pub fn add_config_map(
        &mut self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<String> {
        let checksum = checksum(&data).context(SerializeConfigDataSnafu { name })?;

        let mut config_map = self.store.get_or_create::<ConfigMap>(namespace, name);
        config_map
            .annotations_mut()
            .insert(checksum_annotation_key(name), checksum.clone());
        config_map.data = Some(data);
        self.store.add_or_update(config_map)?;

        Ok(checksum)
    }
}
