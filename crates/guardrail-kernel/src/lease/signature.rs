//! Principals and signature verification
//!
//! Cosigners are known principals with a declared [`Role`] and a public key.
//! Verification goes through [`SignatureVerifier`] so the signature scheme can
//! be swapped; [`Ed25519Verifier`] is the default.

use crate::audit::{AuditAction, AuditTrail};
use crate::store::{load_json, save_json, Collection, StateStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use guardrail_core::{Clock, InputError, Result, Role};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Checks a detached signature against a public key
pub trait SignatureVerifier: Send + Sync + fmt::Debug {
    /// Scheme name, for logs
    fn scheme(&self) -> &'static str;

    /// Whether `signature` is valid for `message` under `public_key`.
    /// Malformed keys or signatures are simply invalid.
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 signatures with 32-byte public keys
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn scheme(&self) -> &'static str {
        "ed25519"
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

/// Sign `message` with an Ed25519 key
#[must_use]
pub fn ed25519_sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    key.sign(message).to_bytes().to_vec()
}

/// A known signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    pub registered_at: DateTime<Utc>,
}

/// Registry of principals allowed to cosign
#[derive(Debug)]
pub struct PrincipalDirectory {
    principals: DashMap<String, Principal>,
    persist_lock: Mutex<()>,
    store: Arc<dyn StateStore>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
}

impl PrincipalDirectory {
    /// Restore the directory from `store`
    ///
    /// # Errors
    /// Returns an error if the stored principals cannot be read.
    pub fn open(
        store: Arc<dyn StateStore>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let stored: Vec<Principal> =
            load_json(store.as_ref(), Collection::Principals)?.unwrap_or_default();
        let principals = DashMap::new();
        for principal in stored {
            principals.insert(principal.id.clone(), principal);
        }
        Ok(Self {
            principals,
            persist_lock: Mutex::new(()),
            store,
            audit,
            clock,
        })
    }

    /// Register or re-key a principal
    ///
    /// # Errors
    /// Returns `InputError::MalformedId` on an empty id or key, or a store
    /// error if the directory could not be persisted.
    pub fn register(&self, id: &str, role: Role, public_key: Vec<u8>) -> Result<Principal> {
        if id.trim().is_empty() {
            return Err(InputError::MalformedId("principal id is empty".into()).into());
        }
        if public_key.is_empty() {
            return Err(InputError::MalformedId(format!("principal {id} has an empty key")).into());
        }
        let principal = Principal {
            id: id.to_string(),
            role,
            public_key,
            registered_at: self.clock.now(),
        };

        {
            let _guard = self.persist_lock.lock();
            let previous = self.principals.insert(principal.id.clone(), principal.clone());
            if let Err(e) = self.persist() {
                match previous {
                    Some(previous) => self.principals.insert(previous.id.clone(), previous),
                    None => self.principals.remove(id).map(|(_, p)| p),
                };
                return Err(e.into());
            }
        }

        self.audit.record_committed(
            id,
            AuditAction::PrincipalRegistered {
                principal: id.to_string(),
                role,
            },
        );
        tracing::info!(principal = id, %role, "principal registered");
        Ok(principal)
    }

    /// Look up a principal
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Principal> {
        self.principals.get(id).map(|p| p.value().clone())
    }

    /// All principals, sorted by id
    #[must_use]
    pub fn list(&self) -> Vec<Principal> {
        let mut all: Vec<Principal> = self.principals.iter().map(|p| p.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn persist(&self) -> std::result::Result<(), guardrail_core::StoreError> {
        save_json(self.store.as_ref(), Collection::Principals, &self.list())
    }
}

/// Serde adapter storing byte vectors as hex strings
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
