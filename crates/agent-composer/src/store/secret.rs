use k8s_openapi::{ByteString, api::core::v1::Secret};

use super::{Result, Store};

#[derive(Debug)]
pub struct SecretManager<'a> {
    store: &'a mut Store,
}

impl<'a> SecretManager<'a> {
    pub(super) fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Sets one key of a Secret, keeping the other keys of an already stored Secret.
    pub fn add_secret_data(
        &mut self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut secret = self.store.get_or_create::<Secret>(namespace, name);
        secret
            .data
            .get_or_insert_with(Default::default)
            .insert(key.to_owned(), ByteString(value.as_bytes().to_vec()));
        self.store.add_or_update(secret)
    }
}
