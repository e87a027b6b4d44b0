//! Vault and device directory backed by the daemon's state store.
//!
//! Secrets are stored as-is in the `secrets` table; the store file must be
//! readable only by the daemon user.

use fleetpool_pool::{BoxFuture, DeviceDirectory, DeviceEndpoint, DirectoryError, Vault, VaultError};
use fleetpool_state::StateStore;

pub struct StoreVault {
    store: StateStore,
}

impl StoreVault {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl Vault for StoreVault {
    fn store<'a>(&'a self, key: &'a str, secret: &'a str) -> BoxFuture<'a, Result<(), VaultError>> {
        Box::pin(async move {
            self.store
                .put_secret(key, secret)
                .map_err(|e| VaultError::Backend(e.to_string()))
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<String, VaultError>> {
        Box::pin(async move {
            self.store
                .get_secret(key)
                .map_err(|e| VaultError::Backend(e.to_string()))?
                .ok_or_else(|| VaultError::NotFound(key.to_string()))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), VaultError>> {
        Box::pin(async move {
            self.store
                .delete_secret(key)
                .map(|_| ())
                .map_err(|e| VaultError::Backend(e.to_string()))
        })
    }
}

/// Resolves devices from the `devices` table.
pub struct StoreDeviceDirectory {
    store: StateStore,
}

impl StoreDeviceDirectory {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl DeviceDirectory for StoreDeviceDirectory {
    fn get_device<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<DeviceEndpoint, DirectoryError>> {
        Box::pin(async move {
            let device = self
                .store
                .get_device(id)
                .map_err(|e| DirectoryError::Backend(e.to_string()))?
                .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
            Ok(DeviceEndpoint {
                address: device.address,
                ssh_host: device.ssh_host,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetpool_state::Device;

    #[tokio::test]
    async fn vault_round_trips_and_deletes() {
        let vault = StoreVault::new(StateStore::open_in_memory().unwrap());
        vault.store("pool/cache/d/redis/master", "s3cret").await.unwrap();
        assert_eq!(vault.get("pool/cache/d/redis/master").await.unwrap(), "s3cret");

        vault.delete("pool/cache/d/redis/master").await.unwrap();
        vault.delete("pool/cache/d/redis/master").await.unwrap();
        assert!(matches!(
            vault.get("pool/cache/d/redis/master").await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn directory_resolves_store_devices() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_device(&Device {
                id: "pi-1".into(),
                name: "pi".into(),
                address: "10.0.0.5".into(),
                ssh_host: "pi@10.0.0.5".into(),
                updated_at: 0,
            })
            .unwrap();
        let directory = StoreDeviceDirectory::new(store);

        let endpoint = directory.get_device("pi-1").await.unwrap();
        assert_eq!(endpoint.address, "10.0.0.5");
        assert_eq!(endpoint.ssh_host, "pi@10.0.0.5");
        assert!(matches!(
            directory.get_device("ghost").await,
            Err(DirectoryError::NotFound(_))
        ));
    }
}
