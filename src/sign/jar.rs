//! JAR signing (APK signature scheme v1).
//!
//! Produces `META-INF/MANIFEST.MF`, `META-INF/<NAME>.SF` and a detached
//! PKCS#7 `META-INF/<NAME>.RSA`, all using SHA-256.

use super::cms;
use super::{SignOptions, Signer};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_MF: &str = "META-INF/MANIFEST.MF";
pub const DIGEST_ATTR: &str = "SHA-256-Digest";
pub const APK_SIGNED_ATTR: &str = "X-Android-APK-Signed";
const CREATED_BY: &str = concat!(env!("CARGO_PKG_VERSION"), " (apkforge)");
const MAX_LINE_BYTES: usize = 72;
/// First platform version that understands SHA-256 in JAR signatures.
const MIN_SDK_SHA256: u32 = 18;

/// Whether `name` is a file the JAR signature scheme owns.
pub fn is_signature_entry(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    upper == "MANIFEST.MF"
        || upper.starts_with("SIG-")
        || [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|ext| upper.ends_with(ext))
}

/// `flutware` -> `FLUTWARE`; anything outside `[A-Z0-9_-]` becomes `_`.
pub fn signature_base_name(alias: &str) -> String {
    let name: String = alias
        .chars()
        .take(8)
        .map(|c| match c.to_ascii_uppercase() {
            c @ ('A'..='Z' | '0'..='9' | '_' | '-') => c,
            _ => '_',
        })
        .collect();
    if name.is_empty() {
        "CERT".to_string()
    } else {
        name
    }
}

pub(crate) fn digest_b64(bytes: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(bytes))
}

fn write_attribute(out: &mut Vec<u8>, key: &str, value: &str) {
    let line = format!("{key}: {value}");
    let mut bytes = line.as_bytes();
    let mut first = true;
    while !bytes.is_empty() || first {
        let room = if first { MAX_LINE_BYTES } else { MAX_LINE_BYTES - 1 };
        let (head, tail) = bytes.split_at(room.min(bytes.len()));
        if !first {
            out.push(b' ');
        }
        out.extend_from_slice(head);
        out.extend_from_slice(b"\r\n");
        bytes = tail;
        first = false;
    }
}

/// One section of a parsed manifest or signature file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Section {
    pub attributes: Vec<(String, String)>,
    /// Bytes of the section in the source, trailing blank line included.
    pub raw: Range<usize>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.get("Name")
    }
}

/// Manifest-format document: a main section followed by named sections.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    pub main: Section,
    pub sections: Vec<Section>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut sections = vec![];
        let mut current = Section::default();
        let mut start = 0;
        let mut pos = 0;
        // continuation lines are joined as bytes, a fold may split a character
        let mut lines: Vec<Vec<u8>> = vec![];
        while pos < bytes.len() {
            let end = bytes[pos..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|i| pos + i + 1)
                .unwrap_or(bytes.len());
            let line = &bytes[pos..end];
            let line = line.strip_suffix(b"\n").unwrap_or(line);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            pos = end;
            if line.is_empty() {
                current.attributes = unfold(&lines)?;
                current.raw = start..pos;
                sections.push(std::mem::take(&mut current));
                lines.clear();
                start = pos;
            } else if let Some(continued) = line.strip_prefix(b" ") {
                let last = lines.last_mut().context("continuation line without attribute")?;
                last.extend_from_slice(continued);
            } else {
                lines.push(line.to_vec());
            }
        }
        if !lines.is_empty() {
            current.attributes = unfold(&lines)?;
            current.raw = start..pos;
            sections.push(current);
        }
        let mut sections = sections.into_iter();
        let main = sections.next().unwrap_or_default();
        Ok(Self {
            main,
            sections: sections.filter(|s| !s.attributes.is_empty()).collect(),
        })
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name() == Some(name))
    }
}

fn unfold(lines: &[Vec<u8>]) -> Result<Vec<(String, String)>> {
    lines
        .iter()
        .map(|line| {
            let line = std::str::from_utf8(line).context("manifest line is not UTF-8")?;
            let (key, value) = line
                .split_once(": ")
                .with_context(|| format!("malformed manifest line `{}`", line))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

/// A freshly written manifest and the byte range of each of its sections.
struct ManifestWriter {
    bytes: Vec<u8>,
    main: Range<usize>,
    sections: Vec<(String, Range<usize>)>,
}

impl ManifestWriter {
    fn new(entries: &[(String, String)]) -> Self {
        let mut bytes = vec![];
        write_attribute(&mut bytes, "Manifest-Version", "1.0");
        write_attribute(&mut bytes, "Created-By", CREATED_BY);
        bytes.extend_from_slice(b"\r\n");
        let main = 0..bytes.len();
        let mut sections = Vec::with_capacity(entries.len());
        for (name, digest) in entries {
            let start = bytes.len();
            write_attribute(&mut bytes, "Name", name);
            write_attribute(&mut bytes, DIGEST_ATTR, digest);
            bytes.extend_from_slice(b"\r\n");
            sections.push((name.clone(), start..bytes.len()));
        }
        Self {
            bytes,
            main,
            sections,
        }
    }

    fn signature_file(&self, options: &SignOptions) -> Vec<u8> {
        let mut sf = vec![];
        write_attribute(&mut sf, "Signature-Version", "1.0");
        write_attribute(&mut sf, "Created-By", CREATED_BY);
        write_attribute(&mut sf, "SHA-256-Digest-Manifest", &digest_b64(&self.bytes));
        write_attribute(
            &mut sf,
            "SHA-256-Digest-Manifest-Main-Attributes",
            &digest_b64(&self.bytes[self.main.clone()]),
        );
        let schemes: Vec<&str> = [(options.v2, "2"), (options.v3, "3")]
            .into_iter()
            .filter_map(|(on, id)| on.then_some(id))
            .collect();
        if !schemes.is_empty() {
            write_attribute(&mut sf, APK_SIGNED_ATTR, &schemes.join(", "));
        }
        sf.extend_from_slice(b"\r\n");
        for (name, range) in &self.sections {
            write_attribute(&mut sf, "Name", name);
            write_attribute(&mut sf, DIGEST_ATTR, &digest_b64(&self.bytes[range.clone()]));
            sf.extend_from_slice(b"\r\n");
        }
        sf
    }
}

/// Copies `input` to `output` without any JAR signature files.
pub fn strip(input: &Path, output: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(
        File::open(input).with_context(|| format!("While opening {}", input.display()))?,
    )?;
    let mut zip = ZipWriter::new(BufWriter::new(File::create(output)?));
    for i in 0..archive.len() {
        let file = archive.by_index(i)?;
        if is_signature_entry(file.name()) {
            continue;
        }
        crate::apk::copy_entry(&mut zip, file, true)?;
    }
    zip.finish()?.flush()?;
    Ok(())
}

/// Writes a v1 signed copy of `input` to `output`.
pub fn sign(input: &Path, output: &Path, signer: &Signer, options: &SignOptions) -> Result<()> {
    anyhow::ensure!(
        options.min_sdk >= MIN_SDK_SHA256,
        "v1 signing with SHA-256 needs minSdk {} or later, got {}",
        MIN_SDK_SHA256,
        options.min_sdk
    );
    let mut archive = ZipArchive::new(
        File::open(input).with_context(|| format!("While opening {}", input.display()))?,
    )?;
    let mut entries = vec![];
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() || is_signature_entry(file.name()) {
            continue;
        }
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)
            .with_context(|| format!("While digesting {}", file.name()))?;
        entries.push((file.name().to_string(), STANDARD.encode(hasher.finalize())));
    }

    let manifest = ManifestWriter::new(&entries);
    let sf = manifest.signature_file(options);
    let block = cms::sign_detached(signer, &sf)?;
    let base = signature_base_name(signer.alias());
    tracing::debug!(
        "v1: {} entries digested, signature files META-INF/{}.SF/.RSA",
        entries.len(),
        base
    );

    let mut zip = ZipWriter::new(BufWriter::new(
        File::create(output).with_context(|| format!("While creating {}", output.display()))?,
    ));
    for i in 0..archive.len() {
        let file = archive.by_index(i)?;
        if is_signature_entry(file.name()) {
            continue;
        }
        crate::apk::copy_entry(&mut zip, file, true)?;
    }
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, contents) in [
        (MANIFEST_MF.to_string(), &manifest.bytes),
        (format!("META-INF/{base}.SF"), &sf),
        (format!("META-INF/{base}.RSA"), &block),
    ] {
        zip.start_file(name, opts)?;
        zip.write_all(contents)?;
    }
    zip.finish()?.flush()?;
    Ok(())
}
