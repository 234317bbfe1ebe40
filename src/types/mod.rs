//! Core value types: addresses, hashes, versions, session ids, signatures.
//!
//! All of these are thin fixed-size byte wrappers with hex serialization.
//! They appear on the wire (headers, cookie payloads, JSON bodies) as
//! lowercase hex strings.

mod keypath;

pub use keypath::Keypath;

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A 20-byte account address derived from a signing public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

/// A 32-byte Keccak-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash(pub [u8; 32]);

/// A 32-byte random session identifier, carried only in the signed
/// `sessionid` cookie.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub [u8; 32]);

/// A 32-byte transaction version id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Version(pub [u8; 32]);

/// A recoverable secp256k1 signature (65 bytes: r ‖ s ‖ recovery id).
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Signature(pub Vec<u8>);

fn decode_fixed_hex<const N: usize>(s: &str, what: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(s).map_err(|e| Error::BadRequest(format!("bad {what} hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::BadRequest(format!("bad {what} length")))
}

impl Address {
    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(Address(decode_fixed_hex(
            s.trim_start_matches("0x"),
            "address",
        )?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::BadRequest("bad address length".into()))?;
        Ok(Address(arr))
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The zero address stands for "no verified identity".
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Hash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::BadRequest("bad hash length".into()))?;
        Ok(Hash(arr))
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl SessionId {
    pub fn random() -> Self {
        SessionId(rand::random())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::BadCookie("bad session id length".into()))?;
        Ok(SessionId(arr))
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Version {
    pub fn random() -> Self {
        Version(rand::random())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(Version(decode_fixed_hex(s.trim(), "version")?))
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Signature {
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|e| Error::BadRequest(format!("bad signature hex: {e}")))?;
        Ok(Signature(bytes))
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

macro_rules! impl_hex_display {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.hex())
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.hex())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.hex())
            }
        }
    };
}

impl_hex_display!(Address);
impl_hex_display!(Hash);
impl_hex_display!(SessionId);
impl_hex_display!(Version);
impl_hex_display!(Signature);

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::from_hex(&s).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::from_hex(&s).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(de::Error::custom)?;
        Hash::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_hex_roundtrip() {
        let addr = Address([0xab; 20]);
        assert_eq!(Address::from_hex(&addr.hex()).unwrap(), addr);
    }

    #[test]
    fn test_address_accepts_0x_prefix() {
        let addr = Address([0x11; 20]);
        let with_prefix = format!("0x{}", addr.hex());
        assert_eq!(Address::from_hex(&with_prefix).unwrap(), addr);
    }

    #[test]
    fn test_zero_address() {
        assert!(Address::default().is_zero());
        assert!(!Address([1; 20]).is_zero());
    }

    #[test]
    fn test_version_from_hex_rejects_wrong_length() {
        assert!(Version::from_hex("abcd").is_err());
        assert!(Version::from_hex("zz").is_err());
    }

    #[test]
    fn test_version_trims_whitespace() {
        let v = Version::random();
        assert_eq!(Version::from_hex(&format!("  {} ", v.hex())).unwrap(), v);
    }

    #[test]
    fn test_session_ids_are_distinct() {
        assert_ne!(SessionId::random(), SessionId::random());
    }

    #[test]
    fn test_signature_serde() {
        let sig = Signature(vec![1, 2, 3]);
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, "\"010203\"");
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }
}
