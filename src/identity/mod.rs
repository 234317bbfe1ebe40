//! Identity and key management interface.
//!
//! The transport never touches private keys directly; it asks the key store
//! to sign and verify on its behalf, and uses the extra-user-data area for
//! the one piece of state it persists (the cookie secret).

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use crate::crypto::{self, SigKeypair};
use crate::error::{Error, Result};
use crate::types::{Address, Hash, Signature};

/// A public identity held by the key store.
#[derive(Clone, Debug)]
pub struct PublicIdentity {
    pub address: Address,
    /// Uncompressed SEC1 signing public key.
    pub signing_pubkey: Vec<u8>,
    /// Asymmetric encryption public key, when the identity carries one.
    pub encryption_pubkey: Option<Vec<u8>>,
}

/// Holds the node's identities, signs and verifies hashes, and persists
/// small pieces of user data. Implementations are internally synchronized.
pub trait KeyStore: Send + Sync {
    /// The identity used to sign cookies and prove the node's address.
    fn default_public_identity(&self) -> Result<PublicIdentity>;

    /// All identities this node holds.
    fn identities(&self) -> Result<Vec<PublicIdentity>>;

    /// Sign `hash` with the identity behind `address`.
    fn sign_hash(&self, address: Address, hash: &Hash) -> Result<Signature>;

    /// Verify that `sig` over `hash` came from the identity behind `address`.
    fn verify_signature(&self, address: Address, hash: &Hash, sig: &Signature) -> Result<bool>;

    fn extra_user_data(&self, key: &str) -> Result<Option<Value>>;

    fn save_extra_user_data(&self, key: &str, value: Value) -> Result<()>;
}

/// In-memory key store over generated secp256k1 keypairs.
pub struct MemoryKeyStore {
    keypairs: Vec<SigKeypair>,
    extra: RwLock<HashMap<String, Value>>,
}

impl MemoryKeyStore {
    /// A key store holding one freshly generated identity.
    pub fn new() -> Self {
        Self::with_keypairs(vec![SigKeypair::generate()])
    }

    pub fn with_keypairs(keypairs: Vec<SigKeypair>) -> Self {
        MemoryKeyStore {
            keypairs,
            extra: RwLock::new(HashMap::new()),
        }
    }

    fn keypair_for(&self, address: Address) -> Result<&SigKeypair> {
        self.keypairs
            .iter()
            .find(|kp| kp.address() == address)
            .ok_or_else(|| Error::KeyStore(format!("no identity for address {address}")))
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    fn default_public_identity(&self) -> Result<PublicIdentity> {
        let keypair = self
            .keypairs
            .first()
            .ok_or_else(|| Error::KeyStore("key store is empty".into()))?;
        Ok(PublicIdentity {
            address: keypair.address(),
            signing_pubkey: keypair.public_key_bytes(),
            encryption_pubkey: None,
        })
    }

    fn identities(&self) -> Result<Vec<PublicIdentity>> {
        Ok(self
            .keypairs
            .iter()
            .map(|kp| PublicIdentity {
                address: kp.address(),
                signing_pubkey: kp.public_key_bytes(),
                encryption_pubkey: None,
            })
            .collect())
    }

    fn sign_hash(&self, address: Address, hash: &Hash) -> Result<Signature> {
        self.keypair_for(address)?.sign_hash(hash)
    }

    fn verify_signature(&self, address: Address, hash: &Hash, sig: &Signature) -> Result<bool> {
        Ok(crypto::verify_signature(address, hash, sig))
    }

    fn extra_user_data(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.extra.read().get(key).cloned())
    }

    fn save_extra_user_data(&self, key: &str, value: Value) -> Result<()> {
        self.extra.write().insert(key.to_string(), value);
        Ok(())
    }
}
