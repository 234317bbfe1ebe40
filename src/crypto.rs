//! Recoverable secp256k1 signatures and Keccak-256 hashing.
//!
//! Signatures are the Ethereum-style 65-byte form `r ‖ s ‖ v`, where `v` is
//! the recovery id. Addresses are the low 20 bytes of the Keccak-256 digest
//! of the uncompressed public key.

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::error::{Error, Result};
use crate::types::{Address, Hash, Signature};

/// Keccak-256 digest of `data`.
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Keccak-256 over the concatenation of two byte strings. Used for cookie
/// signing: `hash(value ‖ cookie-secret)`.
pub fn keccak256_concat(a: &[u8], b: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(a);
    hasher.update(b);
    Hash(hasher.finalize().into())
}

/// A secp256k1 signing keypair.
#[derive(Clone)]
pub struct SigKeypair {
    signing_key: SigningKey,
}

impl SigKeypair {
    pub fn generate() -> Self {
        SigKeypair {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::BadRequest(format!("bad key hex: {e}")))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| Error::BadRequest(format!("bad private key: {e}")))?;
        Ok(SigKeypair { signing_key })
    }

    /// The uncompressed SEC1 encoding of the public key (65 bytes).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    pub fn address(&self) -> Address {
        pubkey_address(self.signing_key.verifying_key())
    }

    /// Sign a prehashed digest, returning the 65-byte recoverable form.
    pub fn sign_hash(&self, hash: &Hash) -> Result<Signature> {
        let (sig, recid): (EcdsaSignature, RecoveryId) = self
            .signing_key
            .sign_prehash_recoverable(hash.as_bytes())
            .map_err(|e| Error::Internal(format!("signing failed: {e}")))?;
        let mut bytes = sig.to_vec();
        bytes.push(recid.to_byte());
        Ok(Signature(bytes))
    }
}

impl std::fmt::Debug for SigKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigKeypair({})", self.address())
    }
}

/// Recover the signing public key from a digest and a 65-byte signature.
pub fn recover_signing_pubkey(hash: &Hash, sig: &Signature) -> Result<VerifyingKey> {
    let raw = sig.as_bytes();
    if raw.len() != 65 {
        return Err(Error::BadSignature);
    }
    let v = match raw[64] {
        27 | 28 => raw[64] - 27,
        0 | 1 => raw[64],
        _ => return Err(Error::BadSignature),
    };
    let recid = RecoveryId::try_from(v).map_err(|_| Error::BadSignature)?;
    let sig = EcdsaSignature::try_from(&raw[..64]).map_err(|_| Error::BadSignature)?;
    VerifyingKey::recover_from_prehash(hash.as_bytes(), &sig, recid).map_err(|_| Error::BadSignature)
}

/// Derive the 20-byte address from a public key.
pub fn pubkey_address(pubkey: &VerifyingKey) -> Address {
    let encoded = pubkey.to_encoded_point(false);
    let digest = keccak256(&encoded.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest.as_bytes()[12..]);
    Address(addr)
}

/// Verify that `sig` over `hash` was produced by the key behind `address`.
pub fn verify_signature(address: Address, hash: &Hash, sig: &Signature) -> bool {
    match recover_signing_pubkey(hash, sig) {
        Ok(pubkey) => pubkey_address(&pubkey) == address,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_recover() {
        let keypair = SigKeypair::generate();
        let hash = keccak256(b"challenge bytes");
        let sig = keypair.sign_hash(&hash).unwrap();
        assert_eq!(sig.as_bytes().len(), 65);

        let recovered = recover_signing_pubkey(&hash, &sig).unwrap();
        assert_eq!(pubkey_address(&recovered), keypair.address());
    }

    #[test]
    fn test_verify_signature() {
        let keypair = SigKeypair::generate();
        let hash = keccak256(b"data");
        let sig = keypair.sign_hash(&hash).unwrap();
        assert!(verify_signature(keypair.address(), &hash, &sig));

        let other = SigKeypair::generate();
        assert!(!verify_signature(other.address(), &hash, &sig));
    }

    #[test]
    fn test_recover_rejects_malformed() {
        let hash = keccak256(b"data");
        assert!(recover_signing_pubkey(&hash, &Signature(vec![0; 10])).is_err());
        assert!(recover_signing_pubkey(&hash, &Signature(vec![0xff; 65])).is_err());
    }

    #[test]
    fn test_ethereum_style_v_values() {
        let keypair = SigKeypair::generate();
        let hash = keccak256(b"data");
        let mut sig = keypair.sign_hash(&hash).unwrap();
        // The 27/28 convention decodes to the same key.
        sig.0[64] += 27;
        let recovered = recover_signing_pubkey(&hash, &sig).unwrap();
        assert_eq!(pubkey_address(&recovered), keypair.address());
    }

    #[test]
    fn test_keypair_hex_roundtrip_stable_address() {
        let keypair = SigKeypair::generate();
        let hex_key = hex::encode(keypair.signing_key.to_bytes());
        let restored = SigKeypair::from_hex(&hex_key).unwrap();
        assert_eq!(restored.address(), keypair.address());
    }
}
