//! The credential store: tokens plus the identity/tenant/permission record
//! they were issued with.
//!
//! Every write replaces the whole `SessionBundle`. Each write bumps a
//! generation counter so callers that started from an older session can
//! detect that it has since been replaced or cleared.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::cipher::RecordCipher;
use super::storage::{FileRecordStore, KeyringSecretStore, MemoryRecordStore, MemorySecretStore, RecordStore, SecretStore};
use crate::config::{SessionConfig, APP_NAME};
use crate::error::AuthError;
use crate::models::{PermissionSet, SessionBundle, TenantDescriptor, TokenPair, UserIdentity};

/// Keychain entry holding the token pair
const TOKENS_KEY: &str = "session-tokens";

/// Keychain entry holding the record encryption key
const RECORD_KEY: &str = "session-record-key";

/// Session record file name in the data directory
const RECORD_FILE: &str = "session.bin";

const RECORD_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoredTokens {
    access_token: String,
    refresh_token: String,
    seal: u64,
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    version: u32,
    /// Must match `StoredTokens::seal`; a mismatch means a torn write.
    seal: u64,
    access_token_expires_at: DateTime<Utc>,
    user: UserIdentity,
    tenant: TenantDescriptor,
    permissions: PermissionSet,
}

/// A session as held by the store, tagged with the generation it was written at.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub generation: u64,
    pub bundle: Arc<SessionBundle>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    session: Option<Arc<SessionBundle>>,
}

/// Readers only take the `slot` read lock. Writers serialize on `writer`
/// and hold the `slot` write lock just long enough to swap the session, so
/// keychain and disk I/O never block a reader.
pub struct CredentialStore {
    secrets: Box<dyn SecretStore>,
    records: Box<dyn RecordStore>,
    writer: Mutex<()>,
    slot: RwLock<Slot>,
}

impl CredentialStore {
    pub fn new(secrets: impl SecretStore + 'static, records: impl RecordStore + 'static) -> Self {
        Self {
            secrets: Box::new(secrets),
            records: Box::new(records),
            writer: Mutex::new(()),
            slot: RwLock::new(Slot::default()),
        }
    }

    /// Tokens in the OS keychain, sealed record in the data directory.
    pub fn system(config: &SessionConfig) -> Result<Self> {
        let path = config.data_dir()?.join(RECORD_FILE);
        Ok(Self::new(KeyringSecretStore::new(APP_NAME), FileRecordStore::new(path)))
    }

    /// Process-local store with no persistence.
    pub fn in_memory() -> Self {
        Self::new(MemorySecretStore::default(), MemoryRecordStore::default())
    }

    /// The current session, if any. Never fails; a poisoned lock reads as empty.
    pub fn current(&self) -> Option<StoredSession> {
        let slot = self.slot.read().ok()?;
        slot.session.as_ref().map(|bundle| StoredSession {
            generation: slot.generation,
            bundle: Arc::clone(bundle),
        })
    }

    pub fn generation(&self) -> u64 {
        self.slot.read().map(|s| s.generation).unwrap_or(0)
    }

    /// Load the persisted session into memory.
    ///
    /// A record that cannot be opened, or whose seal does not match the
    /// stored tokens, is discarded and reported as no session.
    pub fn load(&self) -> Result<Option<StoredSession>, AuthError> {
        let _writer = self.lock_writer();
        let bundle = match self.read_persisted() {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Discarding unreadable stored session");
                self.remove_persisted();
                None
            }
        };
        Ok(self.install(bundle))
    }

    /// Persist and install a new session, replacing whatever was there.
    pub fn replace(&self, bundle: SessionBundle) -> Result<StoredSession, AuthError> {
        let _writer = self.lock_writer();
        self.persist(&bundle)?;
        let stored = self
            .install(Some(bundle))
            .ok_or_else(|| AuthError::Storage("session vanished during write".into()))?;
        debug!(generation = stored.generation, tenant = %stored.bundle.tenant.id, "Stored session");
        Ok(stored)
    }

    /// Like `replace`, but only if the store is still at `expected_generation`.
    /// Returns `Ok(None)` without writing anything when it is not.
    pub fn replace_if_current(
        &self,
        expected_generation: u64,
        bundle: SessionBundle,
    ) -> Result<Option<StoredSession>, AuthError> {
        let _writer = self.lock_writer();
        // Only writers move the generation, and we hold the writer lock
        if !self.is_current(expected_generation) {
            debug!(
                expected = expected_generation,
                actual = self.generation(),
                "Session changed underneath write, discarding"
            );
            return Ok(None);
        }
        self.persist(&bundle)?;
        Ok(self.install(Some(bundle)))
    }

    /// Drop the session from memory and storage. Storage failures are logged,
    /// never returned: the in-memory session is gone either way.
    pub fn clear(&self) {
        let _writer = self.lock_writer();
        self.install(None);
        self.remove_persisted();
    }

    /// Clear only if the store is still at `expected_generation`.
    pub fn clear_if_current(&self, expected_generation: u64) -> bool {
        let _writer = self.lock_writer();
        if !self.is_current(expected_generation) {
            return false;
        }
        self.install(None);
        self.remove_persisted();
        true
    }

    fn is_current(&self, expected_generation: u64) -> bool {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.generation == expected_generation && slot.session.is_some()
    }

    /// Swap the in-memory session and bump the generation.
    fn install(&self, bundle: Option<SessionBundle>) -> Option<StoredSession> {
        let mut slot = self.write_slot();
        slot.generation += 1;
        slot.session = bundle.map(Arc::new);
        slot.session.as_ref().map(|bundle| StoredSession {
            generation: slot.generation,
            bundle: Arc::clone(bundle),
        })
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, bundle: &SessionBundle) -> Result<(), AuthError> {
        let seal: u64 = rand::random();
        let tokens = StoredTokens {
            access_token: bundle.tokens.access_token.clone(),
            refresh_token: bundle.tokens.refresh_token.clone(),
            seal,
        };
        let record = SessionRecord {
            version: RECORD_VERSION,
            seal,
            access_token_expires_at: bundle.tokens.expires_at,
            user: bundle.user.clone(),
            tenant: bundle.tenant.clone(),
            permissions: bundle.permissions.clone(),
        };

        let cipher = self.cipher(true)?.context("Record key unavailable")?;
        let token_bytes = serde_json::to_vec(&tokens).context("Failed to serialize tokens")?;
        let record_bytes = serde_json::to_vec(&record).context("Failed to serialize session record")?;
        let sealed = cipher.seal(&record_bytes)?;

        // Tokens first: a crash between the two writes leaves mismatched
        // seals, which `load` treats as no session.
        self.secrets.set(TOKENS_KEY, &token_bytes)?;
        self.records.write(&sealed)?;
        Ok(())
    }

    fn read_persisted(&self) -> Result<Option<SessionBundle>> {
        let Some(sealed) = self.records.read()? else {
            return Ok(None);
        };
        let cipher = self
            .cipher(false)?
            .ok_or_else(|| anyhow::anyhow!("Session record present but record key missing"))?;
        let record: SessionRecord =
            serde_json::from_slice(&cipher.open(&sealed)?).context("Failed to parse session record")?;
        if record.version != RECORD_VERSION {
            anyhow::bail!("Unsupported session record version {}", record.version);
        }

        let tokens: StoredTokens = match self.secrets.get(TOKENS_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).context("Failed to parse stored tokens")?,
            None => anyhow::bail!("Session record present but tokens missing"),
        };
        if tokens.seal != record.seal {
            anyhow::bail!("Stored tokens do not belong to the session record");
        }

        Ok(Some(SessionBundle {
            tokens: TokenPair {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
                expires_at: record.access_token_expires_at,
            },
            user: record.user,
            tenant: record.tenant,
            permissions: record.permissions,
        }))
    }

    fn cipher(&self, create: bool) -> Result<Option<RecordCipher>> {
        match self.secrets.get(RECORD_KEY)? {
            Some(key) => Ok(Some(RecordCipher::from_key(&key)?)),
            None if create => {
                let key = RecordCipher::generate_key();
                self.secrets.set(RECORD_KEY, &key)?;
                Ok(Some(RecordCipher::from_key(&key)?))
            }
            None => Ok(None),
        }
    }

    fn remove_persisted(&self) {
        if let Err(e) = self.records.remove() {
            warn!(error = %format!("{:#}", e), "Failed to remove session record");
        }
        if let Err(e) = self.secrets.delete(TOKENS_KEY) {
            warn!(error = %format!("{:#}", e), "Failed to remove stored tokens");
        }
    }
}
