//! The signed-index protocol: ES256 JWS binding a certificate chain, the
//! image index digest, and a caller-provided trust root.

mod chain;
mod jws;

pub use chain::{CaStore, CertChain, CertDer, MAX_CHAIN_LENGTH};
pub use jws::{
    compose_index_jwt, load_signing_key, peek_x5c, verify_index_jwt, IndexJwtClaims, JwsHeader,
};

use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::layout::ImageDir;
use crate::{Error, Result, Sha256Digest};

/// Signs a finalized directory-form image.
///
/// Stamps `signed_at`, rewrites `index.json`, hashes the rewritten bytes
/// into the claims, and emits `index.jwt` next to it. Signing requires
/// finalization; a second signing requires `force` and re-hashes the
/// freshly stamped index.
pub fn sign_image(
    image_dir: &ImageDir,
    sign_key_pem: &str,
    cert_chain: CertChain,
    force: bool,
) -> Result<()> {
    let mut index = image_dir.load_index()?;
    index.finalize_signing(force)?;
    let descriptor = image_dir.write_index(&index)?;

    let signing_key = load_signing_key(sign_key_pem)?;
    let claims = IndexJwtClaims {
        iat: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default(),
        image_index: descriptor,
    };
    let token = compose_index_jwt(&claims, &cert_chain, &signing_key)?;
    fs::write(image_dir.jwt_path(), &token)?;
    info!(image = %image_dir.root().display(), "image signed");
    Ok(())
}

/// Verifies a received image's signature.
///
/// Rebuilds the chain from the token's `x5c`, validates it against the
/// trust store when one is supplied, verifies the ES256 signature with
/// the end-entity key, and compares the signed descriptor digest to the
/// digest of the local `index.json` bytes.
pub fn verify_image_signature(
    index_bytes: &[u8],
    token: &str,
    ca_store: Option<&CaStore>,
) -> Result<IndexJwtClaims> {
    let x5c = peek_x5c(token)?;
    let chain = CertChain::from_x5c(&x5c)?;
    if let Some(store) = ca_store {
        store.verify_chain(&chain)?;
    }
    let verifying_key = chain.ee().verifying_key()?;
    let claims = verify_index_jwt(token, &verifying_key)?;
    if claims.image_index.digest != Sha256Digest::of(index_bytes) {
        return Err(Error::IndexDigestMismatch);
    }
    Ok(claims)
}
