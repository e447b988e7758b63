//! Credential vault: AES-256-GCM ciphertexts at rest, plaintext only
//! just-in-time in memory. Also holds the short-lived OAuth state
//! nonces used during platform authorization flows.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use std::time::Duration;

use leadflow_bus::Bus;
use leadflow_core::{CrmCredential, FlowError, Result};
use leadflow_store::Repository;

const OAUTH_STATE_TTL: Duration = Duration::from_secs(600);

fn oauth_key(nonce: &str) -> String {
    format!("oauth:state:{nonce}")
}

pub struct CredentialVault {
    key: LessSafeKey,
    rng: SystemRandom,
    repo: Arc<dyn Repository>,
    bus: Arc<dyn Bus>,
}

impl CredentialVault {
    /// Build from the base64-encoded 32-byte key held in the environment.
    pub fn new(key_b64: &str, repo: Arc<dyn Repository>, bus: Arc<dyn Bus>) -> Result<Self> {
        let key_bytes = B64
            .decode(key_b64)
            .map_err(|e| FlowError::Credential(format!("encryption key is not base64: {e}")))?;
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| FlowError::Credential("encryption key must be 32 bytes".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
            repo,
            bus,
        })
    }

    /// base64(nonce || ciphertext || tag)
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| FlowError::Credential("rng failure".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| FlowError::Credential("encryption failed".into()))?;

        let mut packed = nonce_bytes.to_vec();
        packed.extend_from_slice(&in_out);
        Ok(B64.encode(packed))
    }

    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String> {
        let packed = B64
            .decode(ciphertext_b64)
            .map_err(|e| FlowError::Credential(format!("ciphertext is not base64: {e}")))?;
        if packed.len() <= NONCE_LEN {
            return Err(FlowError::Credential("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| FlowError::Credential("bad nonce".into()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| FlowError::Credential("decryption failed".into()))?;
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| FlowError::Credential("plaintext is not utf-8".into()))
    }

    /// Encrypt and persist a platform secret for a tenant.
    pub async fn store(&self, tenant: &str, platform: &str, secret: &str) -> Result<()> {
        let credential = CrmCredential {
            tenant_id: tenant.to_string(),
            platform: platform.to_string(),
            ciphertext: self.encrypt(secret)?,
            updated_at: Utc::now(),
        };
        self.repo.put_credential(&credential).await
    }

    /// Fetch and decrypt a platform secret.
    pub async fn fetch(&self, tenant: &str, platform: &str) -> Result<Option<String>> {
        match self.repo.get_credential(tenant, platform).await? {
            Some(credential) => Ok(Some(self.decrypt(&credential.ciphertext)?)),
            None => Ok(None),
        }
    }

    /// Park an OAuth state payload under its nonce for ten minutes.
    pub async fn store_oauth_state(&self, nonce: &str, payload: serde_json::Value) -> Result<()> {
        self.bus
            .set(&oauth_key(nonce), payload, Some(OAUTH_STATE_TTL))
            .await
    }

    /// Consume an OAuth state payload; a nonce is single-use.
    pub async fn take_oauth_state(&self, nonce: &str) -> Result<Option<serde_json::Value>> {
        let key = oauth_key(nonce);
        let value = self.bus.get(&key).await?;
        if value.is_some() {
            self.bus.delete(&key).await?;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_bus::memory::MemoryBus;
    use leadflow_store::SqliteStore;

    fn vault() -> CredentialVault {
        let key = B64.encode([7u8; 32]);
        CredentialVault::new(
            &key,
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(MemoryBus::new()),
        )
        .unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let vault = vault();
        let ct = vault.encrypt("pat-secret-token").unwrap();
        assert_ne!(ct, "pat-secret-token");
        assert_eq!(vault.decrypt(&ct).unwrap(), "pat-secret-token");
        // Nonces differ per encryption.
        assert_ne!(ct, vault.encrypt("pat-secret-token").unwrap());
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let vault = vault();
        let ct = vault.encrypt("secret").unwrap();
        let mut bytes = B64.decode(&ct).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(vault.decrypt(&B64.encode(bytes)).is_err());
    }

    #[test]
    fn rejects_short_keys() {
        let short = B64.encode([1u8; 16]);
        assert!(
            CredentialVault::new(
                &short,
                Arc::new(SqliteStore::open_in_memory().unwrap()),
                Arc::new(MemoryBus::new()),
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn stores_only_ciphertext() {
        let repo = Arc::new(SqliteStore::open_in_memory().unwrap());
        let key = B64.encode([9u8; 32]);
        let vault = CredentialVault::new(
            &key,
            Arc::clone(&repo) as _,
            Arc::new(MemoryBus::new()),
        )
        .unwrap();

        vault.store("tenant-1", "hubspot", "hub-token").await.unwrap();
        let raw = leadflow_store::Repository::get_credential(&*repo, "tenant-1", "hubspot")
            .await
            .unwrap()
            .unwrap();
        assert!(!raw.ciphertext.contains("hub-token"));
        assert_eq!(
            vault.fetch("tenant-1", "hubspot").await.unwrap().unwrap(),
            "hub-token"
        );
    }

    #[tokio::test]
    async fn oauth_state_is_single_use() {
        let vault = vault();
        vault
            .store_oauth_state("nonce-1", serde_json::json!({"tenant": "t1"}))
            .await
            .unwrap();
        assert!(vault.take_oauth_state("nonce-1").await.unwrap().is_some());
        assert!(vault.take_oauth_state("nonce-1").await.unwrap().is_none());
    }
}
