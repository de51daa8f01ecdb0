//! Subscriber credentials.
//!
//! A credential is `base64url(claims JSON) "." base64url(ed25519 signature)`,
//! the signature covering the first segment as sent.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::NotifierAuthError;

/// Who a connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub organization: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub organization: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

impl Claims {
    pub fn new(user_id: impl Into<String>, organization: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            user_id: user_id.into(),
            organization: organization.into(),
            exp: Utc::now().timestamp().saturating_add(ttl_secs),
        }
    }
}

/// Verifies a presented credential and decodes the identity it carries.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, NotifierAuthError>;
}

pub struct Ed25519TokenVerifier {
    key: VerifyingKey,
}

impl Ed25519TokenVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Load from the standard base64 encoding of the 32-byte public key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .context("verifying key is not valid base64")?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("verifying key must be 32 bytes, got {}", bytes.len()))?;
        let key = VerifyingKey::from_bytes(&array).map_err(|e| anyhow!("Invalid verifying key: {}", e))?;
        Ok(Self::new(key))
    }
}

impl TokenVerifier for Ed25519TokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, NotifierAuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(NotifierAuthError::MissingToken);
        }
        let (claims_part, sig_part) = token
            .split_once('.')
            .ok_or_else(|| NotifierAuthError::Malformed("expected two segments".into()))?;

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_part)
            .map_err(|e| NotifierAuthError::Malformed(format!("signature: {}", e)))?;
        let sig_array: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| NotifierAuthError::Malformed("signature must be 64 bytes".into()))?;
        let signature = Signature::from_bytes(&sig_array);

        self.key
            .verify(claims_part.as_bytes(), &signature)
            .map_err(|_| NotifierAuthError::BadSignature)?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(claims_part)
            .map_err(|e| NotifierAuthError::Malformed(format!("claims: {}", e)))?;
        let claims: Claims = serde_json::from_slice(&claims_json)
            .map_err(|e| NotifierAuthError::Malformed(format!("claims: {}", e)))?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(NotifierAuthError::Expired);
        }
        if claims.user_id.is_empty() || claims.organization.is_empty() {
            return Err(NotifierAuthError::Malformed("empty identity".into()));
        }

        Ok(Identity {
            user_id: claims.user_id,
            organization: claims.organization,
        })
    }
}

/// Issue a credential for `claims`.
pub fn sign_token(key: &SigningKey, claims: &Claims) -> Result<String> {
    let json = serde_json::to_vec(claims)?;
    let claims_part = URL_SAFE_NO_PAD.encode(json);
    let signature = key.sign(claims_part.as_bytes());
    Ok(format!(
        "{}.{}",
        claims_part,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn signing_key_from_base64(encoded: &str) -> Result<SigningKey> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .context("signing key is not valid base64")?;
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("signing key must be 32 bytes, got {}", bytes.len()))?;
    Ok(SigningKey::from_bytes(&array))
}

pub fn encode_key(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (SigningKey, Ed25519TokenVerifier) {
        let signing = generate_signing_key();
        let verifier = Ed25519TokenVerifier::new(signing.verifying_key());
        (signing, verifier)
    }

    #[test]
    fn test_valid_token_yields_identity() {
        let (signing, verifier) = keypair();
        let token = sign_token(&signing, &Claims::new("u-1", "org-9", 60)).unwrap();
        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.user_id, "u-1");
        assert_eq!(identity.organization, "org-9");
    }

    #[test]
    fn test_rejections() {
        let (signing, verifier) = keypair();
        assert_eq!(verifier.verify(""), Err(NotifierAuthError::MissingToken));
        assert!(matches!(
            verifier.verify("no-dot"),
            Err(NotifierAuthError::Malformed(_))
        ));

        let expired = sign_token(&signing, &Claims::new("u-1", "org-9", -5)).unwrap();
        assert_eq!(verifier.verify(&expired), Err(NotifierAuthError::Expired));

        let (other, _) = keypair();
        let foreign = sign_token(&other, &Claims::new("u-1", "org-9", 60)).unwrap();
        assert_eq!(verifier.verify(&foreign), Err(NotifierAuthError::BadSignature));
    }

    #[test]
    fn test_tampered_claims_fail_signature() {
        let (signing, verifier) = keypair();
        let token = sign_token(&signing, &Claims::new("u-1", "org-9", 60)).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims::new("admin", "org-9", 60)).unwrap(),
        );
        let forged = format!("{}.{}", forged_claims, sig);
        assert_eq!(verifier.verify(&forged), Err(NotifierAuthError::BadSignature));
    }

    #[test]
    fn test_key_base64_round_trip() {
        let signing = generate_signing_key();
        let encoded = encode_key(signing.verifying_key().as_bytes());
        let verifier = Ed25519TokenVerifier::from_base64(&encoded).unwrap();
        let token = sign_token(&signing, &Claims::new("u", "o", 60)).unwrap();
        assert!(verifier.verify(&token).is_ok());

        let restored = signing_key_from_base64(&encode_key(&signing.to_bytes())).unwrap();
        assert_eq!(restored.verifying_key(), signing.verifying_key());
        assert!(Ed25519TokenVerifier::from_base64("AAAA").is_err());
    }
}
