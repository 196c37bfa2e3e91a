//! X.509 certificate handling: signing chains and the CA trust store.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use base64::Engine as _;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use tracing::debug;
use x509_parser::prelude::{FromDer as _, ParsedExtension, X509Certificate};

use crate::{Error, Result};

/// Hard cap on certificate chain length at every construction stage.
pub const MAX_CHAIN_LENGTH: usize = 6;

/// A single certificate held as DER, re-parsed on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertDer {
    der: Vec<u8>,
}

impl CertDer {
    /// Wraps DER bytes, validating that they parse as a certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let cert = Self { der };
        cert.parse()?;
        Ok(cert)
    }

    /// Parses a PEM-encoded certificate.
    pub fn from_pem_str(pem_str: &str) -> Result<Self> {
        let block = pem::parse(pem_str)
            .map_err(|e| Error::BadChain(format!("unparsable PEM certificate: {e}")))?;
        Self::from_der(block.into_contents())
    }

    /// Decodes one `x5c` entry.
    ///
    /// RFC 7515 mandates base64 DER; a backward-compatibility fallback
    /// also accepts PEM strings and raw DER bytes.
    pub fn from_x5c_entry(entry: &str) -> Result<Self> {
        if entry.trim_start().starts_with("-----BEGIN") {
            return Self::from_pem_str(entry);
        }
        if let Ok(der) = base64::engine::general_purpose::STANDARD.decode(entry.trim()) {
            if let Ok(cert) = Self::from_der(der) {
                return Ok(cert);
            }
        }
        Self::from_der(entry.as_bytes().to_vec())
    }

    /// Returns the raw DER bytes.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Renders the certificate as PEM.
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    /// Renders the certificate as a base64-DER `x5c` entry.
    pub fn to_x5c_entry(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.der)
    }

    fn parse(&self) -> Result<X509Certificate<'_>> {
        let (_, cert) = X509Certificate::from_der(&self.der)
            .map_err(|e| Error::BadChain(format!("unparsable DER certificate: {e}")))?;
        Ok(cert)
    }

    /// Raw DER of the subject name, used as an identity key.
    pub fn subject_raw(&self) -> Result<Vec<u8>> {
        Ok(self.parse()?.subject().as_raw().to_vec())
    }

    /// Raw DER of the issuer name.
    pub fn issuer_raw(&self) -> Result<Vec<u8>> {
        Ok(self.parse()?.issuer().as_raw().to_vec())
    }

    /// Human-readable subject, for error messages.
    pub fn subject_string(&self) -> String {
        self.parse()
            .map(|c| c.subject().to_string())
            .unwrap_or_else(|_| "<unparsable>".to_owned())
    }

    /// Returns `true` for a self-signed (subject == issuer) certificate.
    pub fn is_self_signed(&self) -> Result<bool> {
        let cert = self.parse()?;
        Ok(cert.subject().as_raw() == cert.issuer().as_raw())
    }

    /// Returns `true` if the certificate is within its validity period.
    pub fn is_valid_now(&self) -> Result<bool> {
        Ok(self.parse()?.validity().is_valid())
    }

    /// Extracts the P-256 ECDSA verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let cert = self.parse()?;
        let spki = cert.public_key();
        VerifyingKey::from_sec1_bytes(&spki.subject_public_key.data)
            .map_err(|_| Error::NonEcdsaKey)
    }

    /// Returns `(critical, ca)` of the BasicConstraints extension, if any.
    pub fn basic_constraints(&self) -> Result<Option<(bool, bool)>> {
        let cert = self.parse()?;
        for ext in cert.extensions() {
            if let ParsedExtension::BasicConstraints(bc) = ext.parsed_extension() {
                return Ok(Some((ext.critical, bc.ca)));
            }
        }
        Ok(None)
    }

    /// Verifies that this certificate is signed by `issuer`'s key.
    pub fn verify_signed_by(&self, issuer: &Self) -> Result<()> {
        let cert = self.parse()?;
        let tbs = cert.tbs_certificate.as_ref();
        let signature = Signature::from_der(&cert.signature_value.data)
            .map_err(|e| Error::BadSignature(format!("unparsable certificate signature: {e}")))?;
        issuer
            .verifying_key()?
            .verify(tbs, &signature)
            .map_err(|_| {
                Error::BadSignature(format!(
                    "certificate {} not signed by {}",
                    self.subject_string(),
                    issuer.subject_string()
                ))
            })
    }
}

/// A signing chain: the end-entity certificate plus its intermediates,
/// leaf first. Root CAs never appear inside a chain.
#[derive(Debug, Clone)]
pub struct CertChain {
    ee: CertDer,
    intermediates: Vec<CertDer>,
}

impl CertChain {
    /// Builds a chain from an unordered candidate set.
    ///
    /// The end-entity is the unique certificate whose subject is not the
    /// issuer of any other candidate; the intermediates follow issuer
    /// links from there. Self-signed candidates, over-long chains and
    /// inputs holding more than one chain are rejected.
    pub fn from_certs(certs: Vec<CertDer>) -> Result<Self> {
        if certs.is_empty() {
            return Err(Error::BadChain("no certificates provided".to_owned()));
        }
        if certs.len() > MAX_CHAIN_LENGTH {
            return Err(Error::ChainTooLong(certs.len()));
        }

        let mut issuer_of = HashMap::with_capacity(certs.len());
        let mut by_subject = HashMap::with_capacity(certs.len());
        for (idx, cert) in certs.iter().enumerate() {
            if cert.is_self_signed()? {
                return Err(Error::RootInChain);
            }
            issuer_of.insert(cert.issuer_raw()?, idx);
            by_subject.insert(cert.subject_raw()?, idx);
        }

        let mut ee_candidates = Vec::new();
        for (idx, cert) in certs.iter().enumerate() {
            if !issuer_of.contains_key(&cert.subject_raw()?) {
                ee_candidates.push(idx);
            }
        }
        let &[ee_idx] = &ee_candidates[..] else {
            return Err(Error::BadChain(format!(
                "expected exactly one end-entity candidate, found {}",
                ee_candidates.len()
            )));
        };
        let ee = certs[ee_idx].clone();

        let mut intermediates = Vec::new();
        let mut cursor = ee.issuer_raw()?;
        while let Some(&idx) = by_subject.get(&cursor) {
            if intermediates.len() >= MAX_CHAIN_LENGTH {
                return Err(Error::ChainTooLong(intermediates.len() + 1));
            }
            let cert = certs[idx].clone();
            cursor = cert.issuer_raw()?;
            intermediates.push(cert);
        }

        if intermediates.len() + 1 != certs.len() {
            return Err(Error::BadChain(
                "input holds disconnected certificates (multiple chains)".to_owned(),
            ));
        }
        Ok(Self { ee, intermediates })
    }

    /// Rebuilds a chain from `x5c` entries.
    pub fn from_x5c(entries: &[String]) -> Result<Self> {
        let certs = entries
            .iter()
            .map(|entry| CertDer::from_x5c_entry(entry))
            .collect::<Result<Vec<_>>>()?;
        Self::from_certs(certs)
    }

    /// Serializes to `x5c` entries, leaf first, base64 DER.
    pub fn to_x5c(&self) -> Vec<String> {
        std::iter::once(&self.ee)
            .chain(self.intermediates.iter())
            .map(CertDer::to_x5c_entry)
            .collect()
    }

    /// The end-entity (signing) certificate.
    pub fn ee(&self) -> &CertDer {
        &self.ee
    }

    /// The intermediate certificates, EE's issuer first.
    pub fn intermediates(&self) -> &[CertDer] {
        &self.intermediates
    }
}

/// An in-memory store of CA certificates keyed by subject.
#[derive(Debug, Default)]
pub struct CaStore {
    certs: HashMap<Vec<u8>, CertDer>,
}

impl CaStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a certificate, replacing any previous one with the same subject.
    pub fn add_cert(&mut self, cert: CertDer) -> Result<()> {
        self.certs.insert(cert.subject_raw()?, cert);
        Ok(())
    }

    /// Adds certificates from raw PEM bytes (one or more blocks).
    pub fn add_pem_bytes(&mut self, raw: &[u8]) -> Result<()> {
        let blocks = pem::parse_many(raw)
            .map_err(|e| Error::BadChain(format!("unparsable CA PEM: {e}")))?;
        for block in blocks {
            self.add_cert(CertDer::from_der(block.into_contents())?)?;
        }
        Ok(())
    }

    /// Loads every PEM file of a caller-provided CA directory.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut store = Self::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            store.add_pem_bytes(&fs::read(entry.path())?)?;
        }
        Ok(store)
    }

    /// Number of certificates held.
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Returns `true` when the store holds no certificates.
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Validates the store itself: at least one self-signed root present.
    pub fn check(&self) -> Result<()> {
        for cert in self.certs.values() {
            if cert.is_self_signed()? {
                return Ok(());
            }
        }
        Err(Error::BadChain(
            "trust store holds no self-signed root certificate".to_owned(),
        ))
    }

    /// Verifies a signing chain against this trust store.
    ///
    /// Every CA on the path must carry a critical `BasicConstraints`
    /// extension with `cA=true`, be within its validity period, and sign
    /// the certificate below it; the path must terminate at a
    /// self-signed root held by the store.
    pub fn verify_chain(&self, chain: &CertChain) -> Result<()> {
        self.check()?;

        if !chain.ee().is_valid_now()? {
            return Err(Error::BadChain(format!(
                "end-entity certificate {} is outside its validity period",
                chain.ee().subject_string()
            )));
        }

        let mut cursor = chain.ee().clone();
        for ca in chain.intermediates() {
            require_ca(ca)?;
            cursor.verify_signed_by(ca)?;
            cursor = ca.clone();
        }

        let mut depth = 0;
        loop {
            let issuer_raw = cursor.issuer_raw()?;
            let issuer = self.certs.get(&issuer_raw).ok_or_else(|| {
                Error::BadChain(format!(
                    "issuer of {} not found in the trust store",
                    cursor.subject_string()
                ))
            })?;
            require_ca(issuer)?;
            cursor.verify_signed_by(issuer)?;
            debug!(issuer = %issuer.subject_string(), "chain link verified");
            if issuer.is_self_signed()? {
                return Ok(());
            }
            cursor = issuer.clone();
            depth += 1;
            if depth > MAX_CHAIN_LENGTH {
                return Err(Error::ChainTooLong(depth));
            }
        }
    }
}

fn require_ca(cert: &CertDer) -> Result<()> {
    match cert.basic_constraints()? {
        Some((true, true)) => {}
        _ => {
            return Err(Error::BadChain(format!(
                "{} lacks a critical BasicConstraints cA=true extension",
                cert.subject_string()
            )));
        }
    }
    if !cert.is_valid_now()? {
        return Err(Error::BadChain(format!(
            "CA certificate {} is outside its validity period",
            cert.subject_string()
        )));
    }
    Ok(())
}
