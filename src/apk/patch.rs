//! Rewrites the identity of a template inside its manifest and resource table.
//!
//! Each attempted mutation produces a [`PatchOutcome`]. Whether a failed
//! mutation aborts the build is up to the caller's [`PatchPolicy`].

use super::manifest::{attr, AttrValue, AttrWrite, BinaryManifest, ElementId};
use super::{base_options, entry_options, table, MANIFEST, RESOURCES, STORED_ALIGNMENT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchPolicy {
    /// Log failed mutations and keep whatever was applied.
    #[default]
    BestEffort,
    /// Any failed mutation fails the build.
    Strict,
}

/// Identity written into the template.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PatchSpec {
    pub package_name: String,
    pub version_code: i32,
    pub version_name: String,
    pub display_name: String,
    pub provider_marker: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum PatchStatus {
    Applied,
    Created,
    Unchanged,
    Missing,
    Failed(String),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PatchOutcome {
    pub target: String,
    pub status: PatchStatus,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PatchReport {
    /// Package id the template carried before patching.
    pub old_package: Option<String>,
    pub outcomes: Vec<PatchOutcome>,
}

impl PatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &PatchOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, PatchStatus::Failed(_)))
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn status_of(&self, target: &str) -> Option<&PatchStatus> {
        self.outcomes
            .iter()
            .find(|o| o.target == target)
            .map(|o| &o.status)
    }

    fn push(&mut self, target: impl Into<String>, status: PatchStatus) {
        let target = target.into();
        match &status {
            PatchStatus::Failed(reason) => tracing::warn!("patch {}: failed: {}", target, reason),
            status => tracing::debug!("patch {}: {:?}", target, status),
        }
        self.outcomes.push(PatchOutcome { target, status });
    }

    fn record(&mut self, target: impl Into<String>, result: Result<Option<AttrWrite>>) {
        let status = match result {
            Ok(Some(AttrWrite::Updated)) => PatchStatus::Applied,
            Ok(Some(AttrWrite::Created)) => PatchStatus::Created,
            Ok(Some(AttrWrite::Unchanged)) => PatchStatus::Unchanged,
            Ok(None) => PatchStatus::Missing,
            Err(err) => PatchStatus::Failed(format!("{:#}", err)),
        };
        self.push(target, status);
    }
}

/// Applies `spec` to the manifest. Fails only if the document has no root element.
pub fn patch_manifest(manifest: &mut BinaryManifest, spec: &PatchSpec, report: &mut PatchReport) -> Result<()> {
    let root = manifest.root().context("manifest has no root element")?;
    report.old_package = manifest.get_string(root, "package");

    let result = manifest.set_string(root, "package", &spec.package_name);
    report.record("manifest@package", result);
    let result = manifest.set_int(root, "versionCode", spec.version_code);
    report.record("manifest@versionCode", result);
    let result = manifest.set_string(root, "versionName", &spec.version_name);
    report.record("manifest@versionName", result);
    force_release_flags(manifest, root, "manifest", report);

    match manifest.application() {
        Some(app) => {
            force_release_flags(manifest, app, "application", report);
            let result = manifest
                .set_android_bool(app, "extractNativeLibs", attr::EXTRACT_NATIVE_LIBS, true)
                .map(Some);
            report.record("application@extractNativeLibs", result);
        }
        None => report.push("application", PatchStatus::Missing),
    }

    rewrite_labels(manifest, &spec.display_name, report);
    let old_package = report.old_package.clone();
    rewrite_authorities(manifest, old_package.as_deref(), spec, report);
    Ok(())
}

fn force_release_flags(manifest: &mut BinaryManifest, element: ElementId, scope: &str, report: &mut PatchReport) {
    let result = manifest
        .set_android_bool(element, "testOnly", attr::TEST_ONLY, false)
        .map(Some);
    report.record(format!("{scope}@testOnly"), result);
    let result = manifest
        .set_android_bool(element, "debuggable", attr::DEBUGGABLE, false)
        .map(Some);
    report.record(format!("{scope}@debuggable"), result);
}

fn target_name(manifest: &BinaryManifest, element: ElementId, index: usize) -> String {
    format!(
        "{}@{}",
        manifest.element_name(element).unwrap_or("?"),
        manifest.attribute_name(element, index).unwrap_or("?")
    )
}

fn rewrite_labels(manifest: &mut BinaryManifest, label: &str, report: &mut PatchReport) {
    let mut found = false;
    for (element, _) in manifest.elements() {
        for index in manifest.attributes_named(element, "label") {
            found = true;
            let target = target_name(manifest, element, index);
            let result = manifest.set_string_at(element, index, label).map(Some);
            report.record(target, result);
        }
    }
    if !found {
        report.push("label", PatchStatus::Missing);
    }
}

/// New value for a provider authority, or `None` if it is not a file sharing one.
pub fn rewrite_authority(current: &str, old_package: Option<&str>, new_package: &str, marker: &str) -> Option<String> {
    if !current.contains(&format!(".{marker}")) {
        return None;
    }
    Some(match old_package {
        Some(old) if !old.trim().is_empty() && current.starts_with(old) => {
            format!("{}{}", new_package, &current[old.len()..])
        }
        _ => format!("{new_package}.{marker}"),
    })
}

fn rewrite_authorities(
    manifest: &mut BinaryManifest,
    old_package: Option<&str>,
    spec: &PatchSpec,
    report: &mut PatchReport,
) {
    for provider in manifest.find_elements("provider") {
        for index in manifest.attributes_named(provider, "authorities") {
            let Some(AttrValue::String(current)) = manifest.attribute_value(provider, index) else {
                continue;
            };
            let Some(updated) = rewrite_authority(&current, old_package, &spec.package_name, &spec.provider_marker)
            else {
                continue;
            };
            let result = manifest.set_string_at(provider, index, &updated).map(Some);
            report.record(format!("provider@authorities({current})"), result);
        }
    }
}

/// Patches the archive at `path` in place.
///
/// Errors only when the archive or its manifest cannot be read or written;
/// individual mutations are reported in the returned [`PatchReport`].
pub fn patch_archive(path: &Path, spec: &PatchSpec) -> Result<PatchReport> {
    let mut archive = ZipArchive::new(
        File::open(path).with_context(|| format!("While opening {}", path.display()))?,
    )?;
    let mut report = PatchReport::default();

    let mut manifest_bytes = vec![];
    archive
        .by_name(MANIFEST)
        .with_context(|| format!("template has no {}", MANIFEST))?
        .read_to_end(&mut manifest_bytes)?;
    let mut manifest = BinaryManifest::parse(&manifest_bytes)?;
    patch_manifest(&mut manifest, spec, &mut report)?;
    let manifest_bytes = manifest.to_bytes()?;

    let table_bytes = match archive.by_name(RESOURCES) {
        Ok(mut file) => {
            let mut bytes = vec![];
            file.read_to_end(&mut bytes)?;
            Some(bytes)
        }
        Err(_) => None,
    };
    let table_bytes = match (table_bytes, report.old_package.clone()) {
        (Some(mut bytes), Some(old)) => {
            let status = match table::rename_package(&mut bytes, &old, &spec.package_name) {
                Ok(0) => PatchStatus::Missing,
                Ok(_) => PatchStatus::Applied,
                Err(err) => PatchStatus::Failed(format!("{:#}", err)),
            };
            let renamed = status == PatchStatus::Applied;
            report.push(format!("{}@package({})", RESOURCES, old), status);
            renamed.then_some(bytes)
        }
        (Some(_), None) => {
            report.push(format!("{}@package", RESOURCES), PatchStatus::Missing);
            None
        }
        (None, _) => {
            report.push(RESOURCES, PatchStatus::Missing);
            None
        }
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut out = NamedTempFile::new_in(dir)?;
    {
        let mut zip = ZipWriter::new(out.as_file_mut());
        for i in 0..archive.len() {
            let file = archive.by_index(i)?;
            let replacement = match file.name() {
                MANIFEST => Some(&manifest_bytes),
                RESOURCES => table_bytes.as_ref(),
                _ => None,
            };
            let Some(contents) = replacement else {
                zip.raw_copy_file(file)?;
                continue;
            };
            // the platform maps a stored resource table directly
            let align = if file.compression() == CompressionMethod::Stored {
                STORED_ALIGNMENT
            } else {
                1
            };
            let name = file.name().to_string();
            let options = entry_options(&file, align).unwrap_or_else(|err| {
                tracing::debug!("rewriting {} without its extra field: {:#}", name, err);
                base_options(&file, align)
            });
            drop(file);
            zip.start_file(name, options)?;
            zip.write_all(contents)?;
        }
        zip.finish()?;
    }
    out.persist(path)
        .with_context(|| format!("While replacing {}", path.display()))?;

    let failed = report.failures().count();
    tracing::info!(
        "Patched {} ({} mutations, {} failed)",
        path.display(),
        report.outcomes.len(),
        failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_move_authority_prefix_to_new_package() {
        assert_eq!(
            rewrite_authority("com.old.app.fileprovider", Some("com.old.app"), "com.new.app", "fileprovider"),
            Some("com.new.app.fileprovider".to_string())
        );
    }

    #[test]
    fn should_replace_foreign_authorities_wholesale() {
        assert_eq!(
            rewrite_authority("x.y.fileprovider", Some("com.old.app"), "com.new.app", "fileprovider"),
            Some("com.new.app.fileprovider".to_string())
        );
        assert_eq!(
            rewrite_authority("com.old.app.fileprovider", None, "com.new.app", "fileprovider"),
            Some("com.new.app.fileprovider".to_string())
        );
    }

    #[test]
    fn should_leave_other_authorities_alone() {
        assert_eq!(
            rewrite_authority("com.old.app.androidx-startup", Some("com.old.app"), "com.new.app", "fileprovider"),
            None
        );
    }

    #[test]
    fn should_report_failures() {
        let mut report = PatchReport::default();
        report.record("a", Ok(Some(AttrWrite::Updated)));
        report.record("b", Ok(None));
        assert!(report.is_clean());
        report.record("c", Err(anyhow::anyhow!("boom")));
        assert!(!report.is_clean());
        assert_eq!(report.status_of("b"), Some(&PatchStatus::Missing));
        assert_eq!(report.status_of("c"), Some(&PatchStatus::Failed("boom".into())));
    }
}
