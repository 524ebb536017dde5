//! Test doubles for the HSM boundary
//!
//! `MockHsm` keeps real key bundles in memory behind opaque handles so the
//! engine's HSM routing can be exercised end to end, and can be switched
//! into an unreachable state to test fail-closed behaviour.

#![allow(dead_code)]

use a2a_crypto::{AgentPublicKey, AgentSecretKey, SensitiveBytes32};
use a2a_vault::{HsmGeneratedKey, HsmKeyHandle, HsmKeyRequest, HsmProvider, Result, VaultError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Software-backed HSM
pub struct MockHsm {
    name: String,
    keys: Mutex<HashMap<String, AgentSecretKey>>,
    reachable: AtomicBool,
    pub generate_calls: AtomicUsize,
    pub sign_calls: AtomicUsize,
    pub agree_calls: AtomicUsize,
}

impl MockHsm {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            keys: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            generate_calls: AtomicUsize::new(0),
            sign_calls: AtomicUsize::new(0),
            agree_calls: AtomicUsize::new(0),
        })
    }

    pub fn new_unreachable(name: &str) -> Arc<Self> {
        let hsm = Self::new(name);
        hsm.set_reachable(false);
        hsm
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Provision a key out of band, as an operator would
    pub fn provision(&self, key_ref: &str) -> AgentPublicKey {
        let secret = AgentSecretKey::generate();
        let public_key = secret.public_key();
        self.keys.lock().unwrap().insert(key_ref.to_string(), secret);
        public_key
    }

    pub fn key_count(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VaultError::HsmUnavailable(format!("{}: connection refused", self.name)))
        }
    }

    fn with_key<T>(&self, handle: &HsmKeyHandle, f: impl FnOnce(&AgentSecretKey) -> T) -> Result<T> {
        let keys = self.keys.lock().unwrap();
        keys.get(&handle.key_ref)
            .map(f)
            .ok_or_else(|| VaultError::HsmUnavailable(format!("no key {}", handle.key_ref)))
    }
}

#[async_trait]
impl HsmProvider for MockHsm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_key_pair(&self, request: &HsmKeyRequest) -> Result<HsmGeneratedKey> {
        self.check_reachable()?;
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let key_ref = format!("slot/{}/{}", request.agent_id, request.key_id);
        let public_key = self.provision(&key_ref);
        Ok(HsmGeneratedKey {
            handle: HsmKeyHandle {
                provider: self.name.clone(),
                key_ref,
            },
            public_key,
        })
    }

    async fn get_private_key_handle(&self, key_ref: &str) -> Result<HsmKeyHandle> {
        self.check_reachable()?;
        if !self.keys.lock().unwrap().contains_key(key_ref) {
            return Err(VaultError::HsmUnavailable(format!("no key {}", key_ref)));
        }
        Ok(HsmKeyHandle {
            provider: self.name.clone(),
            key_ref: key_ref.to_string(),
        })
    }

    async fn sign(&self, handle: &HsmKeyHandle, message: &[u8]) -> Result<Vec<u8>> {
        self.check_reachable()?;
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        self.with_key(handle, |secret| secret.sign(message).to_vec())
    }

    async fn diffie_hellman(&self, handle: &HsmKeyHandle, peer: &AgentPublicKey) -> Result<SensitiveBytes32> {
        self.check_reachable()?;
        self.agree_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.with_key(handle, |secret| secret.diffie_hellman(peer))??)
    }
}
