//! Detached JWS (compact serialization) over the image index descriptor.
//!
//! ES256 is the only accepted algorithm, at both sign and verify time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::consts::ALLOWED_JWT_ALG;
use crate::meta::Descriptor;
use crate::sign::CertChain;
use crate::{Error, Result};

/// JWT header of an index signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwsHeader {
    /// Signature algorithm; must be `ES256`.
    pub alg: String,
    /// Token type.
    pub typ: String,
    /// Certificate chain, leaf first.
    #[serde(default)]
    pub x5c: Vec<String>,
}

/// JWT claims binding the signed index descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexJwtClaims {
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Descriptor of the signed `index.json`, identical to its JSON form
    /// elsewhere.
    pub image_index: Descriptor,
}

/// Loads an ECDSA P-256 signing key from PEM (PKCS#8 or SEC1).
pub fn load_signing_key(key_pem: &str) -> Result<SigningKey> {
    use p256::pkcs8::DecodePrivateKey as _;
    if let Ok(secret) = p256::SecretKey::from_pkcs8_pem(key_pem) {
        return Ok(SigningKey::from(secret));
    }
    p256::SecretKey::from_sec1_pem(key_pem)
        .map(SigningKey::from)
        .map_err(|_| Error::NonEcdsaKey)
}

/// Composes the signed compact JWS for an index descriptor.
pub fn compose_index_jwt(
    claims: &IndexJwtClaims,
    chain: &CertChain,
    signing_key: &SigningKey,
) -> Result<String> {
    let header = JwsHeader {
        alg: ALLOWED_JWT_ALG.to_owned(),
        typ: "JWT".to_owned(),
        x5c: chain.to_x5c(),
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let message = format!("{header_b64}.{claims_b64}");
    let signature: Signature = signing_key.sign(message.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());
    Ok(format!("{message}.{signature_b64}"))
}

fn split_token(token: &str) -> Result<(&str, &str, &str)> {
    let mut parts = token.trim().split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) => Ok((h, p, s)),
        _ => Err(Error::BadSignature(
            "malformed JWS compact serialization".to_owned(),
        )),
    }
}

fn decode_header(token: &str) -> Result<JwsHeader> {
    let (header_b64, _, _) = split_token(token)?;
    let raw = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|e| Error::BadSignature(format!("unparsable JWS header: {e}")))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Extracts the `x5c` chain entries without verifying the signature.
///
/// Callers verify the chain against a trust store first, then use the
/// verified signing certificate's key on the signature itself.
pub fn peek_x5c(token: &str) -> Result<Vec<String>> {
    let header = decode_header(token)?;
    if header.x5c.is_empty() {
        return Err(Error::BadChain("missing x5c header in JWT".to_owned()));
    }
    Ok(header.x5c)
}

/// Verifies the JWS signature and returns the decoded claims.
///
/// Rejects any algorithm other than ES256 before touching the signature.
pub fn verify_index_jwt(token: &str, key: &VerifyingKey) -> Result<IndexJwtClaims> {
    let header = decode_header(token)?;
    if header.alg != ALLOWED_JWT_ALG {
        return Err(Error::WrongAlg(header.alg));
    }

    let (header_b64, claims_b64, signature_b64) = split_token(token)?;
    let signature_raw = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|e| Error::BadSignature(format!("unparsable signature encoding: {e}")))?;
    let signature = Signature::from_slice(&signature_raw)
        .map_err(|e| Error::BadSignature(format!("unparsable ES256 signature: {e}")))?;

    let message = format!("{header_b64}.{claims_b64}");
    key.verify(message.as_bytes(), &signature)
        .map_err(|_| Error::BadSignature("JWS signature does not verify".to_owned()))?;

    let claims_raw = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|e| Error::BadSignature(format!("unparsable claims encoding: {e}")))?;
    Ok(serde_json::from_slice(&claims_raw)?)
}
