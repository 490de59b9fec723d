pub mod manifest;
pub mod patch;
pub mod repackage;
pub mod res;
pub mod table;

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use manifest::BinaryManifest;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use zip::read::ZipFile;
use zip::write::FullFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST: &str = "AndroidManifest.xml";
pub const RESOURCES: &str = "resources.arsc";
/// Data of stored entries starts on this boundary so it can be mapped directly.
pub const STORED_ALIGNMENT: u16 = 4;

/// Extra field ids the writer produces itself, or that only pad for alignment.
const REGENERATED_EXTRA_IDS: [u16; 3] = [0x0001, 0xa11e, 0xd935];

pub fn extract_zip_file(path: &Path, name: &str) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut f = archive
        .by_name(name)
        .with_context(|| format!("`{}` not found in {}", name, path.display()))?;
    let mut buf = Vec::with_capacity(f.size() as usize);
    f.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Splits a raw extra field into `(header id, data)` records.
pub fn extra_fields(mut extra: &[u8]) -> Result<Vec<(u16, Vec<u8>)>> {
    let mut fields = vec![];
    while extra.len() >= 4 {
        let id = extra.read_u16::<LittleEndian>()?;
        let len = extra.read_u16::<LittleEndian>()? as usize;
        anyhow::ensure!(
            len <= extra.len(),
            "extra field 0x{:04x} overruns the extra data",
            id
        );
        let (data, rest) = extra.split_at(len);
        fields.push((id, data.to_vec()));
        extra = rest;
    }
    Ok(fields)
}

/// Writer options with `file`'s method, timestamp and permissions.
pub(crate) fn base_options(file: &ZipFile<'_>, align: u16) -> FullFileOptions<'static> {
    let mut options = FullFileOptions::default()
        .compression_method(file.compression())
        .last_modified_time(file.last_modified().unwrap_or_default())
        .large_file(file.size().max(file.compressed_size()) > u32::MAX as u64)
        .with_alignment(align);
    if let Some(mode) = file.unix_mode() {
        options = options.unix_permissions(mode);
    }
    options
}

/// Like [`base_options`], also carrying `file`'s extra field.
///
/// Fails when the writer refuses one of the original extra records.
pub(crate) fn entry_options(file: &ZipFile<'_>, align: u16) -> Result<FullFileOptions<'static>> {
    let mut options = base_options(file, align);
    for (id, data) in extra_fields(file.extra_data().unwrap_or_default())? {
        if REGENERATED_EXTRA_IDS.contains(&id) {
            continue;
        }
        options
            .add_extra_data(id, data.into_boxed_slice(), false)
            .with_context(|| format!("extra field 0x{:04x}", id))?;
    }
    Ok(options)
}

/// Copies `file` into `zip` with its data, timestamp, comment and extra field.
///
/// Entries are copied raw. When `align_stored` is set, stored entries are
/// instead rewritten with the same bytes, crc and size so that their data
/// starts on a [`STORED_ALIGNMENT`] boundary. A stored entry that cannot be
/// rewritten without losing metadata is copied raw and left unaligned.
pub(crate) fn copy_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    mut file: ZipFile<'_>,
    align_stored: bool,
) -> Result<()> {
    let name = file.name().to_string();
    let realign = align_stored && file.compression() == CompressionMethod::Stored && !file.is_dir();
    let options = if !realign {
        None
    } else if !file.comment().is_empty() {
        tracing::debug!("{} has an entry comment, copying it unaligned", name);
        None
    } else {
        match entry_options(&file, STORED_ALIGNMENT) {
            Ok(options) => Some(options),
            Err(err) => {
                tracing::debug!("copying {} unaligned: {:#}", name, err);
                None
            }
        }
    };
    let Some(options) = options else {
        return zip
            .raw_copy_file(file)
            .with_context(|| format!("While copying {}", name));
    };
    let mut contents = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut contents)?;
    zip.start_file(name, options)?;
    zip.write_all(&contents)?;
    Ok(())
}

/// Native library ABIs shipped under `lib/<abi>/`, in first-seen order.
pub fn apk_abis<R: Read + Seek>(archive: &ZipArchive<R>) -> Vec<String> {
    let mut abis: Vec<String> = vec![];
    for name in archive.file_names() {
        let mut parts = name.split('/');
        if let (Some("lib"), Some(abi), Some(rest)) = (parts.next(), parts.next(), parts.next()) {
            if !abi.is_empty() && !rest.is_empty() && !abis.iter().any(|a| a == abi) {
                abis.push(abi.to_string());
            }
        }
    }
    abis
}

/// Identity and compatibility metadata read back from a finished package.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ApkMeta {
    pub package: Option<String>,
    pub version_code: Option<i32>,
    pub version_name: Option<String>,
    pub label: Option<String>,
    pub test_only: bool,
    pub debuggable: bool,
    pub min_sdk: Option<u32>,
    pub target_sdk: Option<u32>,
    pub abis: Vec<String>,
}

impl ApkMeta {
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("While opening {}", path.display()))?;
        let mut archive = ZipArchive::new(file)?;
        let abis = apk_abis(&archive);
        let mut bytes = vec![];
        archive
            .by_name(MANIFEST)
            .with_context(|| format!("{} has no {}", path.display(), MANIFEST))?
            .read_to_end(&mut bytes)?;
        let manifest = BinaryManifest::parse(&bytes)?;
        let mut meta = Self {
            abis,
            ..Default::default()
        };
        if let Some(root) = manifest.root() {
            meta.package = manifest.get_string(root, "package");
            meta.version_code = manifest.get_int(root, "versionCode").map(|code| code as i32);
            meta.version_name = manifest.get_string(root, "versionName");
            meta.test_only = manifest.get_bool(root, "testOnly").unwrap_or(false);
            meta.debuggable = manifest.get_bool(root, "debuggable").unwrap_or(false);
        }
        if let Some(app) = manifest.application() {
            meta.label = manifest.get_string(app, "label");
            meta.test_only |= manifest.get_bool(app, "testOnly").unwrap_or(false);
            meta.debuggable |= manifest.get_bool(app, "debuggable").unwrap_or(false);
        }
        if let Some(sdk) = manifest.find_elements("uses-sdk").first() {
            meta.min_sdk = manifest.get_int(*sdk, "minSdkVersion");
            meta.target_sdk = manifest.get_int(*sdk, "targetSdkVersion");
        }
        Ok(meta)
    }

    pub fn log(&self, device_abis: &[String]) {
        tracing::info!(
            "APK meta: pkg={} vCode={} vName={} testOnly={} debug={} minSdk={} targetSdk={} apkAbis={:?} deviceAbis={:?}",
            self.package.as_deref().unwrap_or("?"),
            self.version_code.map(|v| v.to_string()).unwrap_or_else(|| "?".into()),
            self.version_name.as_deref().unwrap_or("?"),
            self.test_only,
            self.debuggable,
            self.min_sdk.map(|v| v.to_string()).unwrap_or_else(|| "?".into()),
            self.target_sdk.map(|v| v.to_string()).unwrap_or_else(|| "?".into()),
            self.abis,
            device_abis,
        );
        if !self.abis.is_empty() && !self.abis.iter().any(|abi| device_abis.contains(abi)) {
            tracing::warn!("None of the packaged ABIs run on this device");
        }
    }
}
