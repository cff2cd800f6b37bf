//! Storage backends behind the credential store.
//!
//! Secrets (tokens, the record key) go to a `SecretStore`, normally the OS
//! keychain. The session record goes to a `RecordStore`, normally a file in
//! the data directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use keyring::Entry;

pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

pub trait RecordStore: Send + Sync {
    fn read(&self) -> Result<Option<Vec<u8>>>;
    fn write(&self, bytes: &[u8]) -> Result<()>;
    fn remove(&self) -> Result<()>;
}

impl<T: SecretStore + ?Sized> SecretStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
}

impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        (**self).read()
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes)
    }

    fn remove(&self) -> Result<()> {
        (**self).remove()
    }
}

/// Secrets held in the OS keychain.
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entry(key)?.get_secret() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve secret from keychain"),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entry(key)?
            .set_secret(value)
            .context("Failed to store secret in keychain")
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete secret from keychain"),
        }
    }
}

/// Session record persisted as a single file.
pub struct FileRecordStore {
    path: PathBuf,
}

impl FileRecordStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl RecordStore for FileRecordStore {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path).context("Failed to read session record")?;
        Ok(Some(bytes))
    }

    /// Writes to a sibling temp file and renames it into place, so a crash
    /// never leaves a half-written record behind.
    fn write(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create session directory")?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes).context("Failed to write session record")?;
        std::fs::rename(&tmp, &self.path).context("Failed to move session record into place")?;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove session record")?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| anyhow::anyhow!("secret store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow::anyhow!("secret store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow::anyhow!("secret store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRecordStore {
    record: Mutex<Option<Vec<u8>>>,
}

impl RecordStore for MemoryRecordStore {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        let record = self.record.lock().map_err(|_| anyhow::anyhow!("record store lock poisoned"))?;
        Ok(record.clone())
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut record = self.record.lock().map_err(|_| anyhow::anyhow!("record store lock poisoned"))?;
        *record = Some(bytes.to_vec());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let mut record = self.record.lock().map_err(|_| anyhow::anyhow!("record store lock poisoned"))?;
        *record = None;
        Ok(())
    }
}
