// Secret storage — remote-node passwords keyed by public key
//
// Passwords are only ever held in `Zeroizing` buffers in memory.

use crate::identity::PublicKey;
use crate::store::{StorageBackend, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroizing;

const SECRET_PREFIX: &str = "secret_";

/// Credential storage used by the session manager
#[cfg_attr(test, mockall::automock)]
pub trait SecretStore: Send + Sync {
    fn store(&self, key: &PublicKey, password: &str) -> Result<(), StoreError>;
    fn retrieve(&self, key: &PublicKey) -> Result<Option<Zeroizing<String>>, StoreError>;
    fn delete(&self, key: &PublicKey) -> Result<(), StoreError>;
}

/// Process-local secret store
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<PublicKey, Zeroizing<String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn store(&self, key: &PublicKey, password: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert(*key, Zeroizing::new(password.to_string()));
        Ok(())
    }

    fn retrieve(&self, key: &PublicKey) -> Result<Option<Zeroizing<String>>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn delete(&self, key: &PublicKey) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Secret store persisted through a storage backend.
///
/// Values are written as-is; pair it with a backend the platform already
/// protects (keychain-backed sled directory, encrypted volume).
pub struct BackendSecretStore {
    backend: Arc<dyn StorageBackend>,
}

impl BackendSecretStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn key_for(key: &PublicKey) -> String {
        format!("{}{}", SECRET_PREFIX, key.to_hex())
    }
}

impl SecretStore for BackendSecretStore {
    fn store(&self, key: &PublicKey, password: &str) -> Result<(), StoreError> {
        self.backend
            .put(Self::key_for(key).as_bytes(), password.as_bytes())
    }

    fn retrieve(&self, key: &PublicKey) -> Result<Option<Zeroizing<String>>, StoreError> {
        match self.backend.get(Self::key_for(key).as_bytes())? {
            Some(bytes) => {
                let bytes = Zeroizing::new(bytes);
                let password = std::str::from_utf8(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(Zeroizing::new(password.to_string())))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, key: &PublicKey) -> Result<(), StoreError> {
        self.backend.remove(Self::key_for(key).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemorySecretStore::new();
        let key = PublicKey::from_bytes([7u8; 32]);
        assert!(store.retrieve(&key).unwrap().is_none());

        store.store(&key, "hunter2").unwrap();
        assert_eq!(store.retrieve(&key).unwrap().unwrap().as_str(), "hunter2");

        store.delete(&key).unwrap();
        assert!(store.retrieve(&key).unwrap().is_none());
    }

    #[test]
    fn test_backend_store_survives_new_handle() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let key = PublicKey::from_bytes([8u8; 32]);

        BackendSecretStore::new(backend.clone())
            .store(&key, "password")
            .unwrap();
        let reopened = BackendSecretStore::new(backend);
        assert_eq!(
            reopened.retrieve(&key).unwrap().unwrap().as_str(),
            "password"
        );
    }
}
