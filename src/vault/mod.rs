//! Encrypted-at-rest credential vault.
//!
//! The vault is a single file of length-prefixed records. Each record is a
//! JSON envelope whose `ciphertext` field is the AES-256-GCM encryption of
//! the provider API key under a fresh random nonce. The 32-byte cipher key
//! is derived from the configured master key with SHA-256. The first record
//! of every vault encrypts a fixed sentinel string; failing to decrypt it on
//! load means the master key is wrong, which is fatal at startup rather than
//! a silent downgrade to "no vault".
//!
//! Deletion appends a tombstone; ids are never reused.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use typeshare::typeshare;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::errors::VaultError;
use crate::core::session::ProviderKey;

/// Sentinel plaintext used to verify the master key on load.
const SENTINEL_ID: &str = "vault-sentinel";
const SENTINEL_PLAINTEXT: &[u8] = b"aperture-vault-v1";

/// A decrypted secret that wipes its memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a secret.
    #[must_use]
    pub fn new(value: String) -> Self {
        Self(value)
    }

    /// Borrow the cleartext. Callers must not copy it into long-lived state.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString(***)")
    }
}

/// Credential metadata, safe to list (no plaintext).
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialMeta {
    /// Opaque credential id
    pub id: String,

    /// Provider the key belongs to
    pub provider: ProviderKey,

    /// Human label
    pub label: String,

    /// When the credential was stored
    #[typeshare(serialized_as = "String")]
    pub created_at: DateTime<Utc>,
}

/// A resolved credential: metadata plus the decrypted key.
#[derive(Debug)]
pub struct ResolvedCredential {
    /// Provider the key belongs to
    pub provider: ProviderKey,

    /// The decrypted key
    pub api_key: SecretString,
}

/// On-disk record envelope.
#[derive(Debug, Serialize, Deserialize)]
struct RecordEntry {
    id: String,
    provider: String,
    label: String,
    nonce: String,
    ciphertext: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    tombstone: bool,
}

struct VaultState {
    /// Live records by id.
    records: HashMap<String, RecordEntry>,
    /// Every id ever seen, including tombstoned ones. Reuse is forbidden.
    seen_ids: HashSet<String>,
}

/// The credential vault. Writes go through an exclusive lock; reads hit the
/// in-memory index loaded at startup.
pub struct CredentialVault {
    path: PathBuf,
    cipher: Aes256Gcm,
    state: Mutex<VaultState>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Open (or create) the vault file with the given master key.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::MasterKeyMismatch`] when the sentinel record
    /// does not decrypt (wrong key), [`VaultError::CorruptRecord`] when a
    /// record fails to decode, and io errors for filesystem failures. All of
    /// these are fatal to startup by design.
    pub async fn open(path: &Path, master_key: &str) -> Result<Self, VaultError> {
        let cipher = derive_cipher(master_key);

        let mut state = VaultState {
            records: HashMap::new(),
            seen_ids: HashSet::new(),
        };

        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let entries = parse_records(&bytes)?;
                let mut sentinel_seen = false;
                for entry in entries {
                    if entry.id == SENTINEL_ID {
                        verify_sentinel(&cipher, &entry)?;
                        sentinel_seen = true;
                        continue;
                    }
                    state.seen_ids.insert(entry.id.clone());
                    if entry.tombstone {
                        state.records.remove(&entry.id);
                    } else {
                        state.records.insert(entry.id.clone(), entry);
                    }
                }
                if !sentinel_seen && !state.seen_ids.is_empty() {
                    return Err(VaultError::CorruptRecord {
                        offset: 0,
                        reason: "vault file has records but no sentinel".to_owned(),
                    });
                }
                let vault = Self {
                    path: path.to_path_buf(),
                    cipher,
                    state: Mutex::new(state),
                };
                if !sentinel_seen {
                    vault.write_sentinel().await?;
                }
                Ok(vault)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Missing file means empty vault.
                let vault = Self {
                    path: path.to_path_buf(),
                    cipher,
                    state: Mutex::new(state),
                };
                vault.write_sentinel().await?;
                tracing::info!(path = %path.display(), "created new credential vault");
                Ok(vault)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Store a key. Returns the new credential id.
    ///
    /// # Errors
    ///
    /// Returns an error on id collision (never expected with v4 UUIDs) or
    /// filesystem failure.
    pub async fn put(
        &self,
        provider: ProviderKey,
        label: &str,
        plaintext_key: &str,
    ) -> Result<String, VaultError> {
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        if state.seen_ids.contains(&id) {
            return Err(VaultError::DuplicateId { id });
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext_key.as_bytes())
            .map_err(|_| VaultError::CorruptRecord {
                offset: 0,
                reason: "encryption failure".to_owned(),
            })?;

        let entry = RecordEntry {
            id: id.clone(),
            provider: provider.to_string(),
            label: label.to_owned(),
            nonce: BASE64_STANDARD.encode(nonce),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
            created_at: Utc::now(),
            tombstone: false,
        };

        self.append(&entry).await?;
        state.seen_ids.insert(id.clone());
        state.records.insert(id.clone(), entry);

        tracing::info!(credential_id = %id, provider = %provider, "stored credential");
        Ok(id)
    }

    /// Decrypt one credential. The only operation that returns plaintext;
    /// callers are the session manager during session creation.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] for unknown or tombstoned ids and
    /// [`VaultError::CorruptRecord`] when decryption fails.
    pub async fn get(&self, id: &str) -> Result<ResolvedCredential, VaultError> {
        let state = self.state.lock().await;
        let entry = state.records.get(id).ok_or_else(|| VaultError::NotFound {
            id: id.to_owned(),
        })?;
        let plaintext = self.decrypt_entry(entry)?;
        let provider =
            entry
                .provider
                .parse::<ProviderKey>()
                .map_err(|e| VaultError::CorruptRecord {
                    offset: 0,
                    reason: format!("record {id}: {e}"),
                })?;
        Ok(ResolvedCredential {
            provider,
            api_key: SecretString::new(plaintext),
        })
    }

    /// List credential metadata. Never includes plaintext.
    pub async fn list(&self) -> Vec<CredentialMeta> {
        let state = self.state.lock().await;
        let mut metas: Vec<CredentialMeta> = state
            .records
            .values()
            .filter_map(|entry| {
                let provider = entry.provider.parse::<ProviderKey>().ok()?;
                Some(CredentialMeta {
                    id: entry.id.clone(),
                    provider,
                    label: entry.label.clone(),
                    created_at: entry.created_at,
                })
            })
            .collect();
        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        metas
    }

    /// Tombstone a credential. The id never reappears.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] for unknown ids.
    pub async fn delete(&self, id: &str) -> Result<(), VaultError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.records.remove(id) else {
            return Err(VaultError::NotFound { id: id.to_owned() });
        };
        let tombstone = RecordEntry {
            tombstone: true,
            ciphertext: String::new(),
            nonce: String::new(),
            ..entry
        };
        self.append(&tombstone).await?;
        tracing::info!(credential_id = %id, "deleted credential");
        Ok(())
    }

    fn decrypt_entry(&self, entry: &RecordEntry) -> Result<String, VaultError> {
        let nonce_bytes =
            BASE64_STANDARD
                .decode(&entry.nonce)
                .map_err(|e| VaultError::CorruptRecord {
                    offset: 0,
                    reason: format!("record {}: bad nonce: {e}", entry.id),
                })?;
        if nonce_bytes.len() != 12 {
            return Err(VaultError::CorruptRecord {
                offset: 0,
                reason: format!("record {}: nonce length {}", entry.id, nonce_bytes.len()),
            });
        }
        let ciphertext =
            BASE64_STANDARD
                .decode(&entry.ciphertext)
                .map_err(|e| VaultError::CorruptRecord {
                    offset: 0,
                    reason: format!("record {}: bad ciphertext: {e}", entry.id),
                })?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| VaultError::CorruptRecord {
                offset: 0,
                reason: format!("record {}: authentication failed", entry.id),
            })?;
        String::from_utf8(plaintext).map_err(|e| VaultError::CorruptRecord {
            offset: 0,
            reason: format!("record {}: not utf-8: {e}", entry.id),
        })
    }

    async fn write_sentinel(&self) -> Result<(), VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, SENTINEL_PLAINTEXT)
            .map_err(|_| VaultError::CorruptRecord {
                offset: 0,
                reason: "sentinel encryption failure".to_owned(),
            })?;
        let entry = RecordEntry {
            id: SENTINEL_ID.to_owned(),
            provider: String::new(),
            label: String::new(),
            nonce: BASE64_STANDARD.encode(nonce),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
            created_at: Utc::now(),
            tombstone: false,
        };
        self.append(&entry).await
    }

    async fn append(&self, entry: &RecordEntry) -> Result<(), VaultError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(entry).map_err(|e| VaultError::CorruptRecord {
            offset: 0,
            reason: format!("record serialization failed: {e}"),
        })?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let len =
            u32::try_from(json.len()).map_err(|_| VaultError::CorruptRecord {
                offset: 0,
                reason: "record too large".to_owned(),
            })?;
        file.write_all(&len.to_be_bytes()).await?;
        file.write_all(&json).await?;
        file.sync_data().await?;
        Ok(())
    }
}

fn derive_cipher(master_key: &str) -> Aes256Gcm {
    let digest = Sha256::digest(master_key.as_bytes());
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest))
}

fn verify_sentinel(cipher: &Aes256Gcm, entry: &RecordEntry) -> Result<(), VaultError> {
    let nonce_bytes = BASE64_STANDARD
        .decode(&entry.nonce)
        .map_err(|e| VaultError::CorruptRecord {
            offset: 0,
            reason: format!("sentinel nonce: {e}"),
        })?;
    if nonce_bytes.len() != 12 {
        return Err(VaultError::CorruptRecord {
            offset: 0,
            reason: "sentinel nonce length".to_owned(),
        });
    }
    let ciphertext =
        BASE64_STANDARD
            .decode(&entry.ciphertext)
            .map_err(|e| VaultError::CorruptRecord {
                offset: 0,
                reason: format!("sentinel ciphertext: {e}"),
            })?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| VaultError::MasterKeyMismatch)?;
    if plaintext != SENTINEL_PLAINTEXT {
        return Err(VaultError::MasterKeyMismatch);
    }
    Ok(())
}

/// Split a vault file into record envelopes. Any truncated or undecodable
/// record fails the whole read; corruption is never skipped.
fn parse_records(bytes: &[u8]) -> Result<Vec<RecordEntry>, VaultError> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if offset + 4 > bytes.len() {
            return Err(VaultError::CorruptRecord {
                offset: offset as u64,
                reason: "truncated length prefix".to_owned(),
            });
        }
        let len_bytes: [u8; 4] = bytes[offset..offset + 4]
            .try_into()
            .map_err(|_| VaultError::CorruptRecord {
                offset: offset as u64,
                reason: "unreadable length prefix".to_owned(),
            })?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        offset += 4;
        if offset + len > bytes.len() {
            return Err(VaultError::CorruptRecord {
                offset: offset as u64,
                reason: "record extends past end of file".to_owned(),
            });
        }
        let entry: RecordEntry = serde_json::from_slice(&bytes[offset..offset + len]).map_err(
            |e| VaultError::CorruptRecord {
                offset: offset as u64,
                reason: format!("undecodable record: {e}"),
            },
        )?;
        entries.push(entry);
        offset += len;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "0123456789abcdef0123456789abcdef";

    async fn temp_vault() -> (tempfile::TempDir, CredentialVault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = CredentialVault::open(&dir.path().join("creds.bin"), MASTER)
            .await
            .unwrap();
        (dir, vault)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, vault) = temp_vault().await;
        let id = vault
            .put(ProviderKey::Anthropic, "work key", "sk-abc")
            .await
            .unwrap();
        let resolved = vault.get(&id).await.unwrap();
        assert_eq!(resolved.provider, ProviderKey::Anthropic);
        assert_eq!(resolved.api_key.expose(), "sk-abc");
    }

    #[tokio::test]
    async fn test_list_has_no_plaintext() {
        let (_dir, vault) = temp_vault().await;
        vault
            .put(ProviderKey::Openai, "oai", "sk-secret-value")
            .await
            .unwrap();
        let listed = vault.list().await;
        assert_eq!(listed.len(), 1);
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("sk-secret-value"));
    }

    #[tokio::test]
    async fn test_delete_tombstones_forever() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.bin");
        let vault = CredentialVault::open(&path, MASTER).await.unwrap();
        let id = vault
            .put(ProviderKey::Groq, "g", "gsk-1")
            .await
            .unwrap();
        vault.delete(&id).await.unwrap();
        assert!(matches!(
            vault.get(&id).await,
            Err(VaultError::NotFound { .. })
        ));
        assert!(vault.list().await.is_empty());

        // Survives a reload.
        drop(vault);
        let vault = CredentialVault::open(&path, MASTER).await.unwrap();
        assert!(matches!(
            vault.get(&id).await,
            Err(VaultError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_master_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.bin");
        let vault = CredentialVault::open(&path, MASTER).await.unwrap();
        vault
            .put(ProviderKey::Anthropic, "k", "sk-1")
            .await
            .unwrap();
        drop(vault);

        let result = CredentialVault::open(&path, "another-master-key-that-is-long!").await;
        assert!(matches!(result, Err(VaultError::MasterKeyMismatch)));
    }

    #[tokio::test]
    async fn test_corrupt_record_fails_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.bin");
        let vault = CredentialVault::open(&path, MASTER).await.unwrap();
        vault
            .put(ProviderKey::Anthropic, "k", "sk-1")
            .await
            .unwrap();
        drop(vault);

        // Truncate mid-record.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        let result = CredentialVault::open(&path, MASTER).await;
        assert!(matches!(result, Err(VaultError::CorruptRecord { .. })));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_vault() {
        let dir = tempfile::tempdir().unwrap();
        let vault = CredentialVault::open(&dir.path().join("fresh.bin"), MASTER)
            .await
            .unwrap();
        assert!(vault.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.bin");
        let vault = CredentialVault::open(&path, MASTER).await.unwrap();
        let id = vault
            .put(ProviderKey::Openrouter, "router", "or-key")
            .await
            .unwrap();
        drop(vault);

        let vault = CredentialVault::open(&path, MASTER).await.unwrap();
        let resolved = vault.get(&id).await.unwrap();
        assert_eq!(resolved.api_key.expose(), "or-key");
    }
}
