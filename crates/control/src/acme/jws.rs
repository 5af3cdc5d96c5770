//! JWS request signing with the ACME account key.
//!
//! ACME requests are JWS envelopes signed with an ECDSA P-256 account key.
//! Signatures use the fixed-field (IEEE P1363) encoding, which is exactly
//! what ring's `ECDSA_P256_SHA256_FIXED_SIGNING` produces — no DER
//! re-encoding needed. Pre-account requests embed the public JWK in the
//! protected header; everything after account creation uses the account
//! URL as `kid`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::Serialize;
use serde_json::json;

use super::error::AcmeError;

/// ECDSA P-256 account key.
pub struct AccountKey {
    key_pair: EcdsaKeyPair,
    pkcs8: Vec<u8>,
    rng: SystemRandom,
}

impl AccountKey {
    /// Generate a fresh key pair.
    pub fn generate() -> Result<Self, AcmeError> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|e| AcmeError::Signing(format!("key generation failed: {e}")))?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    /// Load a persisted key from PKCS#8 DER.
    pub fn from_pkcs8(der: &[u8]) -> Result<Self, AcmeError> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der, &rng)
            .map_err(|e| AcmeError::Signing(format!("PKCS#8 parse failed: {e}")))?;
        Ok(Self {
            key_pair,
            pkcs8: der.to_vec(),
            rng,
        })
    }

    /// PKCS#8 DER bytes for persistence.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    /// Public key as a JWK object for the protected header.
    pub fn jwk(&self) -> serde_json::Value {
        let (x, y) = self.public_point();
        json!({
            "kty": "EC",
            "crv": "P-256",
            "x": x,
            "y": y,
        })
    }

    /// RFC 7638 JWK thumbprint: base64url(SHA-256) over the required JWK
    /// members in lexicographic order.
    pub fn thumbprint(&self) -> String {
        let (x, y) = self.public_point();
        let canonical = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);
        let digest = ring::digest::digest(&ring::digest::SHA256, canonical.as_bytes());
        URL_SAFE_NO_PAD.encode(digest.as_ref())
    }

    /// The HTTP-01 key authorization for `token`.
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.thumbprint())
    }

    /// Sign a request for `url`.
    ///
    /// `kid` selects the header form: `Some(account_url)` after account
    /// creation, `None` to embed the JWK. `payload` of `None` produces the
    /// empty payload of a POST-as-GET.
    pub fn sign_jws<P: Serialize>(
        &self,
        url: &str,
        nonce: &str,
        kid: Option<&str>,
        payload: Option<&P>,
    ) -> Result<String, AcmeError> {
        let protected = match kid {
            Some(kid) => json!({
                "alg": "ES256",
                "kid": kid,
                "nonce": nonce,
                "url": url,
            }),
            None => json!({
                "alg": "ES256",
                "jwk": self.jwk(),
                "nonce": nonce,
                "url": url,
            }),
        };

        let protected_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&protected)?);
        let payload_b64 = match payload {
            Some(payload) => URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?),
            None => String::new(),
        };

        let signing_input = format!("{protected_b64}.{payload_b64}");
        let signature = self
            .key_pair
            .sign(&self.rng, signing_input.as_bytes())
            .map_err(|e| AcmeError::Signing(format!("ECDSA signing failed: {e}")))?;

        let body = json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature.as_ref()),
        });
        Ok(body.to_string())
    }

    /// (x, y) coordinates of the public point, base64url encoded.
    fn public_point(&self) -> (String, String) {
        // Uncompressed SEC1 point: 0x04 || x (32 bytes) || y (32 bytes)
        let public = self.key_pair.public_key().as_ref();
        (
            URL_SAFE_NO_PAD.encode(&public[1..33]),
            URL_SAFE_NO_PAD.encode(&public[33..65]),
        )
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    #[test]
    fn test_pkcs8_round_trip_preserves_thumbprint() {
        let key = AccountKey::generate().unwrap();
        let reloaded = AccountKey::from_pkcs8(key.pkcs8_der()).unwrap();
        assert_eq!(key.thumbprint(), reloaded.thumbprint());
    }

    #[test]
    fn test_jws_structure() {
        let key = AccountKey::generate().unwrap();
        let body = key
            .sign_jws(
                "https://ca.example/acme/new-account",
                "nonce-1",
                None,
                Some(&serde_json::json!({"termsOfServiceAgreed": true})),
            )
            .unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        let protected_b64 = parsed["protected"].as_str().unwrap();
        let protected: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(protected_b64).unwrap()).unwrap();

        assert_eq!(protected["alg"], "ES256");
        assert_eq!(protected["nonce"], "nonce-1");
        assert_eq!(protected["jwk"]["kty"], "EC");
        assert!(protected.get("kid").is_none());

        // P1363 fixed-field: r || s, 32 bytes each
        let signature = URL_SAFE_NO_PAD
            .decode(parsed["signature"].as_str().unwrap())
            .unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_post_as_get_has_empty_payload() {
        let key = AccountKey::generate().unwrap();
        let body = key
            .sign_jws::<()>("https://ca.example/order/1", "n", Some("https://ca.example/acct/1"), None)
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["payload"], "");

        let protected: serde_json::Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD
                .decode(parsed["protected"].as_str().unwrap())
                .unwrap(),
        )
        .unwrap();
        assert_eq!(protected["kid"], "https://ca.example/acct/1");
    }

    #[test]
    fn test_key_authorization_format() {
        let key = AccountKey::generate().unwrap();
        let auth = key.key_authorization("tok-123");
        assert!(auth.starts_with("tok-123."));
        assert_eq!(auth.split('.').count(), 2);
    }
}
