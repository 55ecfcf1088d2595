use anyhow::{Context, Result};
use keyring::Entry;
use tracing::debug;

use super::store::KeyValueStore;

const SERVICE_NAME: &str = "agrodata";

/// Token store backend that keeps each session key in the OS keychain.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    /// Use a distinct keychain service, e.g. one per API environment.
    pub fn with_service(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Option<String> {
        let entry = self.entry(key).ok()?;
        match entry.get_password() {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                debug!(key = key, error = %e, "Failed to read from keychain");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store credential in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "touches the OS keychain"]
    fn test_value_survives_a_fresh_store() {
        let service = format!("agrodata-test-{}", std::process::id());
        let writer = KeyringStore::with_service(&service);
        writer.set("authToken", "persisted").unwrap();

        // A new store builds new entries, as a new process would.
        let reader = KeyringStore::with_service(&service);
        assert_eq!(reader.get("authToken").as_deref(), Some("persisted"));

        reader.remove("authToken").unwrap();
        assert_eq!(writer.get("authToken"), None);
        // removing an absent key is not an error
        reader.remove("authToken").unwrap();
    }
}
