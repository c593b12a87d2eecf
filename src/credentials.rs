//! At-rest encryption for secrets: provider auth descriptors and API-key
//! hashed secrets share the same master-key-backed cipher.

use std::{fmt, path::PathBuf, sync::Arc};

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::{
    database::{DbError, DbPool},
    error::AppError,
};

const KEY_FILENAME: &str = "secret.key";
const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const CONFIG_DIR_NAME: &str = "routewise";

/// A nonce/ciphertext pair ready to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// The random nonce used for this encryption.
    pub nonce: Vec<u8>,
    /// The encrypted payload.
    pub ciphertext: Vec<u8>,
}

/// Wraps the master key and performs symmetric encryption/decryption of
/// short secrets (provider auth tokens, API-key secrets).
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Arc<XChaCha20Poly1305>,
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher").finish()
    }
}

impl SecretCipher {
    /// Loads the master key from the user's config directory, generating
    /// one on first use.
    pub async fn new() -> Result<Self, AppError> {
        let key_path = key_file_path()?;
        let key_bytes = load_or_create_key(&key_path).await?;
        let cipher = XChaCha20Poly1305::new(&key_bytes.into());
        Ok(Self {
            cipher: Arc::new(cipher),
        })
    }

    /// Encrypts `plaintext` under a freshly generated random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, AppError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|err| AppError::Internal(format!("failed to encrypt secret: {err}")))?;

        Ok(EncryptedSecret {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    /// Decrypts a previously encrypted secret.
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String, AppError> {
        let nonce = XNonce::from_slice(&secret.nonce);
        let plaintext = self
            .cipher
            .decrypt(nonce, secret.ciphertext.as_slice())
            .map_err(|err| AppError::Internal(format!("failed to decrypt secret: {err}")))?;
        String::from_utf8(plaintext)
            .map_err(|err| AppError::Internal(format!("decrypted secret was not valid UTF-8: {err}")))
    }

    /// Constant-time comparison of `candidate` against a decrypted secret,
    /// so key validation never leaks timing information about how much of
    /// the candidate matched.
    pub fn matches(&self, candidate: &str, stored: &EncryptedSecret) -> Result<bool, AppError> {
        let expected = self.decrypt(stored)?;
        Ok(constant_time_eq(candidate.as_bytes(), expected.as_bytes()))
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Persists encrypted provider auth descriptors, keyed by the opaque
/// reference string carried in a `ProviderRecord`'s `auth` field.
#[derive(Clone)]
pub struct CredentialStore {
    pool: Arc<DbPool>,
    cipher: SecretCipher,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore").finish()
    }
}

impl CredentialStore {
    /// Builds a store over `pool`, loading or creating the master key.
    pub async fn new(pool: Arc<DbPool>) -> Result<Self, AppError> {
        Ok(Self {
            pool,
            cipher: SecretCipher::new().await?,
        })
    }

    /// Retrieves and decrypts the secret stored under `reference`.
    pub async fn get(&self, reference: &str) -> Result<Option<String>, AppError> {
        let record = sqlx::query_as::<_, (Vec<u8>, Vec<u8>)>(
            r"SELECT nonce, ciphertext FROM provider_credentials WHERE reference = ?",
        )
        .bind(reference)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;

        let Some((nonce, ciphertext)) = record else {
            return Ok(None);
        };

        self.cipher
            .decrypt(&EncryptedSecret { nonce, ciphertext })
            .map(Some)
    }

    /// Inserts or updates the secret stored under `reference`.
    pub async fn set(&self, reference: &str, secret: &str) -> Result<(), AppError> {
        let encrypted = self.cipher.encrypt(secret)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r"INSERT INTO provider_credentials (reference, nonce, ciphertext, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(reference) DO UPDATE SET
                   nonce = excluded.nonce,
                   ciphertext = excluded.ciphertext,
                   updated_at = excluded.updated_at",
        )
        .bind(reference)
        .bind(encrypted.nonce)
        .bind(encrypted.ciphertext)
        .bind(now.clone())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;

        Ok(())
    }

    /// Removes a stored secret; returns whether a row was deleted.
    pub async fn remove(&self, reference: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM provider_credentials WHERE reference = ?")
            .bind(reference)
            .execute(&*self.pool)
            .await
            .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Lists every reference with a stored secret.
    pub async fn references(&self) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query("SELECT reference FROM provider_credentials")
            .fetch_all(&*self.pool)
            .await
            .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;

        Ok(rows.into_iter().map(|row| row.get::<String, _>(0)).collect())
    }
}

fn key_file_path() -> Result<PathBuf, AppError> {
    let config_root = dirs::config_dir()
        .ok_or_else(|| AppError::ConfigInvalid("unable to determine config directory".into()))?
        .join(CONFIG_DIR_NAME);
    Ok(config_root.join(KEY_FILENAME))
}

async fn load_or_create_key(path: &PathBuf) -> Result<[u8; KEY_SIZE], AppError> {
    if let Ok(bytes) = tokio::fs::read(path).await {
        if bytes.len() == KEY_SIZE {
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&bytes);
            return Ok(key);
        }
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| AppError::ConfigInvalid(format!("failed to create config dir: {err}")))?;
    }

    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    tokio::fs::write(path, &key)
        .await
        .map_err(|err| AppError::ConfigInvalid(format!("failed to write key file: {err}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .map_err(|err| AppError::ConfigInvalid(format!("failed to set key perms: {err}")))?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_identical_slices() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"secret", b"public"));
    }
}
