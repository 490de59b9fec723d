//! Copies a patched archive forward without its stale signature files and
//! configuration asset, then appends the new configuration asset.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Clone, Debug)]
pub struct RepackageOptions {
    /// Entry path of the configuration asset.
    pub config_asset: String,
    /// Entries starting with this prefix are dropped.
    pub signature_dir: String,
    /// Re-emit stored entries on 4 byte boundaries.
    pub align_stored: bool,
}

impl Default for RepackageOptions {
    fn default() -> Self {
        Self {
            config_asset: crate::core::config::CONFIG_ASSET.to_string(),
            signature_dir: crate::core::config::SIGNATURE_DIR.to_string(),
            align_stored: true,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RepackageSummary {
    pub copied: usize,
    pub stripped_signatures: usize,
    pub replaced_config: bool,
}

pub fn repackage(
    input: &Path,
    output: &Path,
    config_content: &str,
    options: &RepackageOptions,
) -> Result<RepackageSummary> {
    let mut archive = ZipArchive::new(
        File::open(input).with_context(|| format!("While opening {}", input.display()))?,
    )?;
    let out = File::create(output).with_context(|| format!("While creating {}", output.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(out));
    let mut summary = RepackageSummary::default();

    for i in 0..archive.len() {
        let file = archive.by_index(i)?;
        let name = file.name().to_string();
        if name.starts_with(&options.signature_dir) {
            tracing::debug!("dropping stale signature entry {}", name);
            summary.stripped_signatures += 1;
            continue;
        }
        if name == options.config_asset {
            tracing::debug!("dropping old configuration asset {}", name);
            summary.replaced_config = true;
            continue;
        }
        super::copy_entry(&mut zip, file, options.align_stored)?;
        summary.copied += 1;
    }

    let zopts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(options.config_asset.as_str(), zopts)?;
    zip.write_all(config_content.as_bytes())?;
    zip.finish()?.flush()?;

    tracing::info!(
        "Repackaged {} entries ({} signature entries dropped, config {})",
        summary.copied,
        summary.stripped_signatures,
        if summary.replaced_config { "replaced" } else { "added" }
    );
    Ok(summary)
}
