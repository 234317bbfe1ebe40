//! Signed cookies and request identity resolution.
//!
//! Cookies are self-issued: the value is `hex(payload) ":" hex(sig)` where
//! the signature is the node's default identity over
//! `keccak256(payload ‖ cookie-secret)`. They verify only on the node that
//! minted them, which is intentional.

use axum::http::{HeaderMap, Uri};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::crypto::keccak256_concat;
use crate::error::{Error, Result};
use crate::types::Address;

use super::{query_params, Transport};

/// Lifetime of minted cookies.
const COOKIE_MAX_AGE_SECS: u64 = 24 * 60 * 60;

impl Transport {
    /// Mint a `Set-Cookie` value for `name` over `value`.
    pub(crate) fn make_signed_cookie(&self, name: &str, value: &[u8]) -> Result<String> {
        let identity = self
            .key_store()
            .default_public_identity()
            .map_err(|e| Error::KeyStore(e.to_string()))?;
        let hash = keccak256_concat(value, &self.cookie_secret());
        let sig = self.key_store().sign_hash(identity.address, &hash)?;
        Ok(format!(
            "{name}={}:{}; Path=/; Max-Age={COOKIE_MAX_AGE_SECS}",
            hex::encode(value),
            sig.hex(),
        ))
    }

    /// Read and verify the signed cookie `name` from a request.
    ///
    /// Returns [`Error::NoCookie`] when the cookie is absent, so callers can
    /// distinguish "not there" from "there but invalid".
    pub(crate) fn signed_cookie(&self, headers: &HeaderMap, name: &str) -> Result<Vec<u8>> {
        let raw = cookie_from_headers(headers, name)
            .ok_or_else(|| Error::NoCookie(name.to_string()))?;

        let (value_hex, sig_hex) = match raw.split_once(':') {
            Some(parts) => parts,
            None => {
                return Err(Error::BadCookie(format!(
                    "cookie '{name}' has {} parts",
                    raw.split(':').count()
                )))
            }
        };
        let value = hex::decode(value_hex)
            .map_err(|e| Error::BadCookie(format!("cookie '{name}' bad hex value: {e}")))?;
        let sig = hex::decode(sig_hex)
            .map_err(|e| Error::BadCookie(format!("cookie '{name}' bad hex signature: {e}")))?;

        let identity = self
            .key_store()
            .default_public_identity()
            .map_err(|e| Error::KeyStore(e.to_string()))?;
        let hash = keccak256_concat(&value, &self.cookie_secret());
        let valid = self.key_store().verify_signature(
            identity.address,
            &hash,
            &crate::types::Signature(sig),
        )?;
        if !valid {
            return Err(Error::BadCookie(format!(
                "cookie '{name}' has invalid signature (value: {})",
                hex::encode(&value)
            )));
        }
        Ok(value)
    }

    /// Resolve the caller's verified address: a bearer JWT first, then the
    /// signed `address` cookie. An anonymous caller yields the zero address.
    pub(crate) fn address_from_request(&self, headers: &HeaderMap, uri: &Uri) -> Result<Address> {
        let params = query_params(uri);
        let token = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_start_matches("Bearer ").trim())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .or_else(|| params.get("ucan").cloned());

        if let Some(token) = token {
            if let Some(address) = self.address_from_jwt(&token)? {
                return Ok(address);
            }
        }

        match self.signed_cookie(headers, "address") {
            Ok(bytes) => Address::from_bytes(&bytes),
            Err(err) if err.is_no_cookie() => Ok(Address::default()),
            Err(err) => Err(err),
        }
    }

    fn address_from_jwt(&self, token: &str) -> Result<Option<Address>> {
        #[derive(Deserialize)]
        struct Claims {
            address: Option<String>,
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        let data = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.config().jwt_secret),
            &validation,
        )
        .map_err(|e| Error::BadRequest(format!("bad jwt: {e}")))?;

        let addr_hex = data
            .claims
            .address
            .ok_or_else(|| Error::BadRequest("jwt does not contain 'address' claim".into()))?;
        Address::from_hex(&addr_hex)
            .map(Some)
            .map_err(|_| Error::BadRequest("jwt 'address' claim contains invalid data".into()))
    }
}

/// Extract a cookie value from the `Cookie` request header.
fn cookie_from_headers(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(axum::http::header::COOKIE) {
        let Ok(header) = header.to_str() else { continue };
        for pair in header.split(';') {
            let Some((k, v)) = pair.trim().split_once('=') else {
                continue;
            };
            if k == name {
                return Some(v.to_string());
            }
        }
    }
    None
}
