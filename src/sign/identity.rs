//! The long-lived, self-issued signing identity.
//!
//! One PKCS#12 keystore per installation. It is created on first use and
//! never regenerated afterwards; a keystore that exists but cannot be opened
//! is an error, not a reason to mint a new key.

use super::cms::{self, der_decode, der_encode, SHA256_WITH_RSA};
use super::Signer;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, Utc};
use rasn::types::{Any, BitString, ConstOid, Integer, Oid, PrintableString, SetOf};
use rasn_pkix::{
    AttributeTypeAndValue, Certificate, DirectoryString, Name, TbsCertificate, Time, Validity,
    Version,
};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DistinguishedName {
    attributes: Vec<(String, String)>,
}

impl DistinguishedName {
    /// Parses `CN=Name, O=Org, C=UZ`. Supported keys: CN, O, OU, C, L, ST.
    pub fn parse(s: &str) -> Result<Self> {
        let mut attributes = vec![];
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .with_context(|| format!("`{}` is not a KEY=value pair", part))?;
            let key = key.trim().to_ascii_uppercase();
            anyhow::ensure!(
                Self::oid_for(&key).is_some(),
                "unsupported name attribute `{}`",
                key
            );
            attributes.push((key, value.trim().to_string()));
        }
        anyhow::ensure!(!attributes.is_empty(), "distinguished name is empty");
        Ok(Self { attributes })
    }

    fn oid_for(key: &str) -> Option<ConstOid> {
        Some(match key {
            "CN" => Oid::JOINT_ISO_ITU_T_DS_ATTRIBUTE_TYPE_COMMON_NAME,
            "O" => Oid::JOINT_ISO_ITU_T_DS_ATTRIBUTE_TYPE_ORGANISATION_NAME,
            "OU" => Oid::JOINT_ISO_ITU_T_DS_ATTRIBUTE_TYPE_ORGANISATIONAL_UNIT_NAME,
            "C" => Oid::JOINT_ISO_ITU_T_DS_ATTRIBUTE_TYPE_COUNTRY_NAME,
            "L" => Oid::JOINT_ISO_ITU_T_DS_ATTRIBUTE_TYPE_LOCALITY_NAME,
            "ST" => Oid::JOINT_ISO_ITU_T_DS_ATTRIBUTE_TYPE_STATE_OR_PROVINCE_NAME,
            _ => return None,
        })
    }

    pub fn common_name(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == "CN")
            .map(|(_, v)| v.as_str())
    }

    /// X.509 `Name`: one single-valued RDN per attribute, in the given order.
    pub fn to_name(&self) -> Result<Name> {
        let mut rdns = Vec::with_capacity(self.attributes.len());
        for (key, value) in &self.attributes {
            let oid = Self::oid_for(key).with_context(|| format!("unsupported name attribute `{}`", key))?;
            let value = if key == "C" {
                DirectoryString::Printable(PrintableString::new(value.clone()))
            } else {
                DirectoryString::Utf8(value.clone())
            };
            rdns.push(SetOf::from([AttributeTypeAndValue {
                r#type: oid.into(),
                value: Any::new(der_encode(&value)?),
            }]));
        }
        Ok(Name::RdnSequence(rdns))
    }
}

impl std::fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let parts: Vec<String> = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub keystore_path: PathBuf,
    pub alias: String,
    pub passphrase: String,
    pub key_bits: usize,
    pub validity_days: u32,
    pub subject: DistinguishedName,
}

impl IdentityConfig {
    /// Short-lived identity for tests: small key, same container format.
    pub fn throwaway(keystore_path: impl Into<PathBuf>) -> Self {
        Self {
            keystore_path: keystore_path.into(),
            alias: "throwaway".to_string(),
            passphrase: "throwaway".to_string(),
            key_bits: 1024,
            validity_days: 1,
            subject: DistinguishedName {
                attributes: vec![("CN".to_string(), "Throwaway".to_string())],
            },
        }
    }
}

/// X.509 `Time`: UTCTime through 2049, GeneralizedTime after.
fn x509_time(t: DateTime<Utc>) -> Time {
    if t.year() < 2050 {
        Time::Utc(t)
    } else {
        Time::General(t.into())
    }
}

/// Builds a self-signed certificate for `key`.
pub fn self_signed_certificate(key: &RsaPrivateKey, config: &IdentityConfig) -> Result<Vec<u8>> {
    let now = Utc::now();
    let not_after = now + Duration::days(config.validity_days as i64);
    let name = config.subject.to_name()?;
    let spki = key.to_public_key().to_public_key_der()?;
    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: Integer::from(now.timestamp_millis().max(1)),
        signature: cms::algorithm(SHA256_WITH_RSA)?,
        issuer: name.clone(),
        validity: Validity {
            not_before: x509_time(now),
            not_after: x509_time(not_after),
        },
        subject: name,
        subject_public_key_info: der_decode(spki.as_ref())?,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: None,
    };
    let signature = super::rsa_sign(key, &der_encode(&tbs_certificate)?)?;
    der_encode(&Certificate {
        tbs_certificate,
        signature_algorithm: cms::algorithm(SHA256_WITH_RSA)?,
        signature_value: BitString::from_vec(signature),
    })
}

pub fn generate(config: &IdentityConfig) -> Result<Signer> {
    tracing::info!(
        "Generating {}-bit signing key for `{}`",
        config.key_bits,
        config.subject
    );
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), config.key_bits)?;
    let cert = self_signed_certificate(&key, config)?;
    Ok(Signer::new(key, cert)?.with_alias(&config.alias))
}

pub fn to_pkcs12(signer: &Signer, config: &IdentityConfig) -> Result<Vec<u8>> {
    let key = signer.key().to_pkcs8_der()?;
    let pfx = p12::PFX::new(
        signer.cert_der(),
        key.as_bytes(),
        None,
        &config.passphrase,
        &config.alias,
    )
    .context("Failed to assemble PKCS#12 container")?;
    Ok(pfx.to_der())
}

pub fn from_pkcs12(bytes: &[u8], config: &IdentityConfig) -> Result<Signer> {
    let pfx = p12::PFX::parse(bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse PKCS#12: {:?}", e))?;
    anyhow::ensure!(
        pfx.verify_mac(&config.passphrase),
        "keystore passphrase does not match"
    );
    let keys = pfx
        .key_bags(&config.passphrase)
        .map_err(|e| anyhow::anyhow!("Failed to extract keys from PKCS#12: {:?}", e))?;
    let certs = pfx
        .cert_x509_bags(&config.passphrase)
        .map_err(|e| anyhow::anyhow!("Failed to extract certs from PKCS#12: {:?}", e))?;
    anyhow::ensure!(keys.len() == 1, "expected one private key, found {}", keys.len());
    anyhow::ensure!(certs.len() == 1, "expected one certificate, found {}", certs.len());
    let key = RsaPrivateKey::from_pkcs8_der(&keys[0]).context("Keystore key is not RSA")?;
    let signer = Signer::new(key, certs[0].clone())?;
    Ok(signer.with_alias(&config.alias))
}

/// Owns the keystore file. Cheap to share; the loaded identity is cached.
#[derive(Debug)]
pub struct IdentityStore {
    config: IdentityConfig,
    cached: Mutex<Option<Arc<Signer>>>,
}

impl IdentityStore {
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            cached: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.keystore_path
    }

    pub fn exists(&self) -> bool {
        self.config.keystore_path.exists()
    }

    /// Returns the identity, creating and persisting it on first use.
    pub fn acquire(&self) -> Result<Arc<Signer>> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| anyhow::anyhow!("identity store lock poisoned"))?;
        if let Some(signer) = cached.as_ref() {
            return Ok(signer.clone());
        }
        let signer = if self.exists() {
            self.load()?
        } else {
            self.create()?
        };
        let signer = Arc::new(signer);
        *cached = Some(signer.clone());
        Ok(signer)
    }

    fn load(&self) -> Result<Signer> {
        let path = &self.config.keystore_path;
        let bytes =
            std::fs::read(path).with_context(|| format!("While reading {}", path.display()))?;
        let signer = from_pkcs12(&bytes, &self.config)
            .with_context(|| format!("Keystore {} is unusable", path.display()))?;
        tracing::debug!("Loaded signing identity {}", signer.fingerprint());
        Ok(signer)
    }

    fn create(&self) -> Result<Signer> {
        let path = &self.config.keystore_path;
        let signer = generate(&self.config)?;
        let bytes = to_pkcs12(&signer, &self.config)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(path) {
            Ok(_) => {
                tracing::info!(
                    "Created keystore {} ({})",
                    path.display(),
                    signer.fingerprint()
                );
                Ok(signer)
            }
            // another process won the race; its identity is the one to use
            Err(err) if path.exists() => {
                tracing::warn!("Keystore appeared while creating it: {}", err.error);
                self.load()
            }
            Err(err) => Err(err.error)
                .with_context(|| format!("While writing keystore {}", path.display())),
        }
    }
}
