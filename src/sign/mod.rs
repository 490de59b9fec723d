pub mod block;
pub mod cms;
pub mod identity;
pub mod jar;
pub mod verify;

use anyhow::{Context, Result};
use rasn_pkix::Certificate;
use rsa::pkcs8::EncodePublicKey;
use rsa::{PaddingScheme, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;

pub use identity::{DistinguishedName, IdentityConfig, IdentityStore};
pub use verify::{verify, VerificationReport};

pub(crate) fn rsa_sign(key: &RsaPrivateKey, bytes: &[u8]) -> Result<Vec<u8>> {
    let digest = Sha256::digest(bytes);
    let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
    Ok(key.sign(padding, &digest)?)
}

pub(crate) fn decode_certificate(der: &[u8]) -> Result<Certificate> {
    cms::der_decode::<Certificate>(der)
}

/// DER `SubjectPublicKeyInfo` of a decoded certificate.
pub(crate) fn certificate_public_key(cert: &Certificate) -> Result<Vec<u8>> {
    cms::der_encode(&cert.tbs_certificate.subject_public_key_info)
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// A loaded signing identity: private key plus its self-signed certificate.
#[derive(Clone)]
pub struct Signer {
    key: RsaPrivateKey,
    pubkey: RsaPublicKey,
    cert: Certificate,
    cert_der: Vec<u8>,
    alias: String,
}

impl Signer {
    pub fn new(key: RsaPrivateKey, cert_der: Vec<u8>) -> Result<Self> {
        let cert = decode_certificate(&cert_der)?;
        let pubkey = RsaPublicKey::from(&key);
        let spki = pubkey.to_public_key_der()?;
        anyhow::ensure!(
            certificate_public_key(&cert)? == spki.as_ref(),
            "certificate does not belong to the private key"
        );
        Ok(Self {
            key,
            pubkey,
            cert,
            cert_der,
            alias: "CERT".to_string(),
        })
    }

    /// Names the identity; the v1 signature files are derived from it.
    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = alias.to_string();
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        rsa_sign(&self.key, bytes)
    }

    pub fn pubkey(&self) -> &RsaPublicKey {
        &self.pubkey
    }

    pub fn key(&self) -> &RsaPrivateKey {
        &self.key
    }

    pub fn cert(&self) -> &Certificate {
        &self.cert
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// SHA-256 of the certificate, lowercase hex.
    pub fn fingerprint(&self) -> String {
        sha256_hex(&self.cert_der)
    }

    pub fn cert_pem(&self) -> String {
        pem::encode(&pem::Pem {
            tag: "CERTIFICATE".to_string(),
            contents: self.cert_der.clone(),
        })
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("alias", &self.alias)
            .field("pubkey", &self.pubkey)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Which schemes to apply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignOptions {
    pub v1: bool,
    pub v2: bool,
    pub v3: bool,
    /// Lowest platform version the artifact targets.
    pub min_sdk: u32,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            v1: true,
            v2: true,
            v3: true,
            min_sdk: 21,
        }
    }
}

/// Signs `input` into `output`. Any signature already present is replaced.
pub fn sign_apk(input: &Path, output: &Path, signer: &Signer, options: &SignOptions) -> Result<()> {
    anyhow::ensure!(
        options.v1 || options.v2 || options.v3,
        "no signature scheme enabled"
    );
    anyhow::ensure!(input != output, "signing in place is not supported");
    if options.v1 {
        jar::sign(input, output, signer, options).context("v1 signing failed")?;
    } else {
        jar::strip(input, output)?;
    }
    if options.v2 || options.v3 {
        block::sign(output, signer, options).context("signing block failed")?;
    }
    tracing::info!(
        "Signed {} (v1={} v2={} v3={})",
        output.display(),
        options.v1,
        options.v2,
        options.v3
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_reject_mismatched_certificate() {
        let config = IdentityConfig::throwaway("unused.p12");
        let a = identity::generate(&config).unwrap();
        let b = identity::generate(&config).unwrap();
        assert!(Signer::new(a.key().clone(), b.cert_der().to_vec()).is_err());
    }

    #[test]
    fn should_export_pem() {
        let signer = identity::generate(&IdentityConfig::throwaway("unused.p12")).unwrap();
        let pem = signer.cert_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(pem::parse(&pem).unwrap().contents, signer.cert_der());
        assert_eq!(signer.fingerprint().len(), 64);
    }
}
