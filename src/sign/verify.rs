//! Re-reads a signed archive and checks each signature scheme.
//!
//! Structural problems end up in the report rather than in an `Err`; only
//! an unreadable file fails the call.

use super::block::{
    compute_digest, SchemeBlock, SignedData, SigningBlock, APK_SIGNING_BLOCK_V2_ID,
    APK_SIGNING_BLOCK_V3_ID, RSA_PKCS1V15_SHA2_256, STRIPPING_PROTECTION_ATTR_ID,
};
use super::cms::{DetachedSignature, SHA256};
use super::jar::{self, Manifest, APK_SIGNED_ATTR, DIGEST_ATTR, MANIFEST_MF};
use super::{certificate_public_key, decode_certificate, sha256_hex};
use anyhow::{Context, Result};
use rsa::pkcs8::DecodePublicKey;
use rsa::{PaddingScheme, PublicKey, RsaPublicKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::{Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct VerificationReport {
    pub verified: bool,
    pub v1: bool,
    pub v2: bool,
    pub v3: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// SHA-256 fingerprints of the signer certificates.
    pub signers: Vec<String>,
}

impl VerificationReport {
    pub fn log(&self) {
        tracing::info!(
            "Verify: verified={} v1={} v2={} v3={}",
            self.verified,
            self.v1,
            self.v2,
            self.v3
        );
        for error in &self.errors {
            tracing::warn!("Verify error: {}", error);
        }
        for warning in &self.warnings {
            tracing::warn!("Verify warning: {}", warning);
        }
    }

    fn add_signer(&mut self, fingerprint: String) {
        if !self.signers.contains(&fingerprint) {
            self.signers.push(fingerprint);
        }
    }
}

fn verify_rsa(public_key_der: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let pubkey = RsaPublicKey::from_public_key_der(public_key_der)?;
    let digest = Sha256::digest(message);
    let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
    pubkey
        .verify(padding, &digest, signature)
        .context("signature does not verify")?;
    Ok(())
}

struct SchemeResult {
    fingerprints: Vec<String>,
    announces_v3: bool,
}

fn verify_scheme(value: &[u8], v3: bool, zip_hash: &[u8; 32]) -> Result<SchemeResult> {
    let block = SchemeBlock::read(value, v3)?;
    anyhow::ensure!(!block.signers.is_empty(), "no signers");
    let mut result = SchemeResult {
        fingerprints: vec![],
        announces_v3: false,
    };
    for signer in &block.signers {
        anyhow::ensure!(!signer.signatures.is_empty(), "found no signatures");
        for sig in &signer.signatures {
            anyhow::ensure!(
                sig.algorithm == RSA_PKCS1V15_SHA2_256,
                "found unsupported signature algorithm 0x{:x}",
                sig.algorithm
            );
            verify_rsa(&signer.public_key, &signer.signed_data, &sig.signature)?;
        }
        let signed_data = SignedData::read(&signer.signed_data, v3)?;
        anyhow::ensure!(!signed_data.digests.is_empty(), "found no digests");
        let signed_algorithms: Vec<u32> = signed_data.digests.iter().map(|d| d.algorithm).collect();
        let signature_algorithms: Vec<u32> = signer.signatures.iter().map(|s| s.algorithm).collect();
        anyhow::ensure!(
            signed_algorithms == signature_algorithms,
            "signature and digest algorithm lists differ"
        );
        for digest in &signed_data.digests {
            anyhow::ensure!(
                digest.digest == zip_hash,
                "computed hash doesn't match signed hash"
            );
        }
        let cert = signed_data
            .certificates
            .first()
            .context("found no certificates")?;
        let decoded = decode_certificate(cert)?;
        anyhow::ensure!(
            certificate_public_key(&decoded)? == signer.public_key,
            "certificate public key does not match the signer public key"
        );
        if v3 {
            anyhow::ensure!(
                signer.sdk_range == signed_data.sdk_range,
                "signer and signed data disagree on the SDK range"
            );
        }
        for (id, value) in &signed_data.additional_attributes {
            tracing::debug!("additional attribute: 0x{:x} {:?}", id, value);
            if *id == STRIPPING_PROTECTION_ATTR_ID && value.get(..4) == Some(&3u32.to_le_bytes()[..]) {
                result.announces_v3 = true;
            }
        }
        result.fingerprints.push(sha256_hex(cert));
    }
    Ok(result)
}

fn read_entry<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut file = archive.by_name(name)?;
    let mut bytes = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Checks the JAR signature. Returns `Ok(false)` when there is none.
fn verify_v1(apk: &[u8], block: &SigningBlock, report: &mut VerificationReport) -> Result<bool> {
    let mut archive = ZipArchive::new(Cursor::new(apk))?;
    let Ok(manifest_bytes) = read_entry(&mut archive, MANIFEST_MF) else {
        return Ok(false);
    };
    let manifest = Manifest::parse(&manifest_bytes).context("MANIFEST.MF is malformed")?;
    let errors_before = report.errors.len();

    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let signature_files: Vec<&String> = names
        .iter()
        .filter(|n| n.starts_with("META-INF/") && n.to_ascii_uppercase().ends_with(".SF"))
        .collect();
    anyhow::ensure!(!signature_files.is_empty(), "MANIFEST.MF present without signature files");

    for sf_name in signature_files {
        let base = &sf_name[..sf_name.len() - 3];
        let block_name = format!("{base}.RSA");
        let sf_bytes = read_entry(&mut archive, sf_name)?;
        let signature_block = match read_entry(&mut archive, &block_name) {
            Ok(bytes) => DetachedSignature::parse(&bytes).with_context(|| format!("{block_name} is malformed"))?,
            Err(_) => {
                report.errors.push(format!("v1: {sf_name} has no matching {block_name}"));
                continue;
            }
        };
        anyhow::ensure!(
            SHA256 == signature_block.digest_algorithm,
            "{} uses an unsupported digest algorithm",
            block_name
        );
        let cert = signature_block.certificates.first().context("signature block has no certificate")?;
        let spki = certificate_public_key(&decode_certificate(cert)?)?;
        if let Err(err) = verify_rsa(&spki, &sf_bytes, &signature_block.signature) {
            report.errors.push(format!("v1: {sf_name}: {err:#}"));
            continue;
        }
        report.add_signer(sha256_hex(cert));

        let sf = Manifest::parse(&sf_bytes).with_context(|| format!("{sf_name} is malformed"))?;
        let whole = sf.main.get("SHA-256-Digest-Manifest");
        if whole != Some(jar::digest_b64(&manifest_bytes).as_str()) {
            // fall back to per-section digests
            for section in &sf.sections {
                let Some(name) = section.name() else { continue };
                let expected = manifest
                    .section(name)
                    .map(|s| jar::digest_b64(&manifest_bytes[s.raw.clone()]));
                if section.get(DIGEST_ATTR) != expected.as_deref() {
                    report
                        .errors
                        .push(format!("v1: {sf_name}: digest of manifest section {name} does not match"));
                }
            }
        }
        if let Some(signed) = sf.main.get(APK_SIGNED_ATTR) {
            for id in signed.split(',').map(str::trim) {
                let missing = match id {
                    "2" => block.pair(APK_SIGNING_BLOCK_V2_ID).is_none(),
                    "3" => block.pair(APK_SIGNING_BLOCK_V3_ID).is_none(),
                    _ => false,
                };
                if missing {
                    report.errors.push(format!(
                        "v1: {sf_name} says the APK is v{id} signed but that signature is missing"
                    ));
                }
            }
        }
    }

    let mut protected = BTreeSet::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        if file.is_dir() || jar::is_signature_entry(&name) {
            continue;
        }
        let Some(section) = manifest.section(&name) else {
            report.errors.push(format!("v1: entry {name} is not protected by the signature"));
            continue;
        };
        protected.insert(name.clone());
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        let actual = base64_of(&hasher.finalize());
        if section.get(DIGEST_ATTR) != Some(actual.as_str()) {
            report.errors.push(format!("v1: digest of {name} does not match"));
        }
    }
    for section in &manifest.sections {
        if let Some(name) = section.name() {
            if !protected.contains(name) && !jar::is_signature_entry(name) {
                report
                    .errors
                    .push(format!("v1: {name} is listed in MANIFEST.MF but missing"));
            }
        }
    }
    Ok(report.errors.len() == errors_before)
}

fn base64_of(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn verify(path: &Path) -> Result<VerificationReport> {
    let apk = std::fs::read(path).with_context(|| format!("While reading {}", path.display()))?;
    let mut report = VerificationReport::default();
    let mut r = Cursor::new(&apk[..]);
    let block = match SigningBlock::parse(&mut r) {
        Ok(block) => block,
        Err(err) => {
            report.errors.push(format!("archive structure: {err:#}"));
            return Ok(report);
        }
    };

    if block.has_block() {
        let zip_hash = compute_digest(&mut r, block.sb_start, block.cd_start, block.cde_start)?;
        let mut v2_announces_v3 = false;
        for (id, v3) in [(APK_SIGNING_BLOCK_V2_ID, false), (APK_SIGNING_BLOCK_V3_ID, true)] {
            let Some(value) = block.pair(id) else { continue };
            let scheme = if v3 { "v3" } else { "v2" };
            match verify_scheme(value, v3, &zip_hash) {
                Ok(result) => {
                    if v3 {
                        report.v3 = true;
                    } else {
                        report.v2 = true;
                        v2_announces_v3 = result.announces_v3;
                    }
                    for fingerprint in result.fingerprints {
                        report.add_signer(fingerprint);
                    }
                }
                Err(err) => report.errors.push(format!("{scheme}: {err:#}")),
            }
        }
        if v2_announces_v3 && block.pair(APK_SIGNING_BLOCK_V3_ID).is_none() {
            report
                .errors
                .push("v2: signer announces a v3 signature that is missing".to_string());
        }
        for (id, _) in &block.pairs {
            if *id != APK_SIGNING_BLOCK_V2_ID && *id != APK_SIGNING_BLOCK_V3_ID {
                tracing::debug!("ignoring signing block pair 0x{:x}", id);
            }
        }
    }

    match verify_v1(&apk, &block, &mut report) {
        Ok(present_and_valid) => report.v1 = present_and_valid,
        Err(err) => report.errors.push(format!("v1: {err:#}")),
    }
    if !report.v1 && report.errors.iter().all(|e| !e.starts_with("v1:")) {
        report
            .warnings
            .push("no JAR signature; platforms before API 24 will reject the APK".to_string());
    }

    report.verified = report.errors.is_empty() && (report.v1 || report.v2 || report.v3);
    Ok(report)
}
