#![allow(dead_code)]

use apkforge::apk::manifest::{attr, ANDROID_NS};
use apkforge::apk::res::{
    Chunk, ResTableHeader, ResTablePackageHeader, ResValue, ResXmlAttribute, ResXmlEndElement,
    ResXmlNamespace, ResXmlNodeHeader, ResXmlStartElement, StringPool,
};
use apkforge::core::config::{Settings, CONFIG_ASSET};
use apkforge::pipeline::Pipeline;
use apkforge::sign::IdentityConfig;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const OLD_PACKAGE: &str = "com.old.app";
pub const OLD_LABEL: &str = "Old App";
pub const OLD_CONFIG: &str = r#"{"screens":[]}"#;
pub const NATIVE_LIB: &str = "lib/arm64-v8a/libapp.so";

// Resource mapped names come first, in the order of the resource map.
const STRINGS: &[&str] = &[
    "label",
    "debuggable",
    "authorities",
    "minSdkVersion",
    "versionCode",
    "versionName",
    "testOnly",
    "android",
    ANDROID_NS,
    "manifest",
    "package",
    "application",
    "activity",
    "provider",
    "uses-sdk",
    OLD_PACKAGE,
    "1.0",
    OLD_LABEL,
    "com.old.app.fileprovider",
];

fn s(value: &str) -> i32 {
    STRINGS.iter().position(|candidate| *candidate == value).unwrap() as i32
}

fn android_attr(name: &str, raw: Option<&str>, typed_value: ResValue) -> ResXmlAttribute {
    ResXmlAttribute {
        namespace: s(ANDROID_NS),
        name: s(name),
        raw_value: raw.map(s).unwrap_or(-1),
        typed_value,
    }
}

fn android_string(name: &str, value: &str) -> ResXmlAttribute {
    android_attr(name, Some(value), ResValue::string(s(value) as usize))
}

/// A compiled manifest for `com.old.app` that is debuggable and test only.
pub fn manifest_bytes() -> Vec<u8> {
    let node = ResXmlNodeHeader::default();
    let ns = ResXmlNamespace {
        prefix: s("android"),
        uri: s(ANDROID_NS),
    };
    let start = |name: &str, attrs: Vec<ResXmlAttribute>| {
        Chunk::XmlStartElement(
            node,
            ResXmlStartElement {
                name: s(name),
                attribute_count: attrs.len() as u16,
                ..Default::default()
            },
            attrs,
        )
    };
    let end = |name: &str| {
        Chunk::XmlEndElement(
            node,
            ResXmlEndElement {
                namespace: -1,
                name: s(name),
            },
        )
    };
    Chunk::Xml(vec![
        Chunk::StringPool(StringPool::new(
            STRINGS.iter().map(|s| s.to_string()).collect(),
            true,
        )),
        Chunk::XmlResourceMap(vec![
            attr::LABEL,
            attr::DEBUGGABLE,
            attr::AUTHORITIES,
            attr::MIN_SDK_VERSION,
            attr::VERSION_CODE,
            attr::VERSION_NAME,
            attr::TEST_ONLY,
        ]),
        Chunk::XmlStartNamespace(node, ns),
        start(
            "manifest",
            vec![
                android_attr("versionCode", None, ResValue::int_dec(1)),
                android_string("versionName", "1.0"),
                ResXmlAttribute {
                    namespace: -1,
                    name: s("package"),
                    raw_value: s(OLD_PACKAGE),
                    typed_value: ResValue::string(s(OLD_PACKAGE) as usize),
                },
            ],
        ),
        start(
            "uses-sdk",
            vec![android_attr("minSdkVersion", None, ResValue::int_dec(21))],
        ),
        end("uses-sdk"),
        start(
            "application",
            vec![
                android_string("label", OLD_LABEL),
                android_attr("debuggable", None, ResValue::boolean(true)),
                android_attr("testOnly", None, ResValue::boolean(true)),
            ],
        ),
        start("activity", vec![android_string("label", OLD_LABEL)]),
        end("activity"),
        start(
            "provider",
            vec![android_string("authorities", "com.old.app.fileprovider")],
        ),
        end("provider"),
        end("application"),
        end("manifest"),
        Chunk::XmlEndNamespace(node, ns),
    ])
    .to_bytes()
    .unwrap()
}

/// A resource table holding a single package named `package`.
pub fn table_bytes(package: &str) -> Vec<u8> {
    Chunk::Table(
        ResTableHeader { package_count: 1 },
        vec![
            Chunk::StringPool(StringPool::new(vec![OLD_LABEL.into()], true)),
            Chunk::TablePackage(
                ResTablePackageHeader {
                    id: 0x7f,
                    name: package.to_string(),
                    type_strings: 0,
                    last_public_type: 0,
                    key_strings: 0,
                    last_public_key: 0,
                    type_id_offset: 0,
                },
                vec![
                    Chunk::StringPool(StringPool::new(vec!["string".into()], false)),
                    Chunk::StringPool(StringPool::new(vec!["app_name".into()], false)),
                ],
            ),
        ],
    )
    .to_bytes()
    .unwrap()
}

/// Bytes of the stored native library, long enough to notice truncation.
pub fn native_lib() -> Vec<u8> {
    (0..4099u32).map(|i| (i * 31 % 251) as u8).collect()
}

/// Writes a template archive with a stale signature and configuration asset.
pub fn write_template(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file("AndroidManifest.xml", deflated).unwrap();
    zip.write_all(&manifest_bytes()).unwrap();
    zip.start_file("resources.arsc", stored).unwrap();
    zip.write_all(&table_bytes(OLD_PACKAGE)).unwrap();
    zip.start_file("classes.dex", deflated).unwrap();
    zip.write_all(b"dex\n035\0 placeholder").unwrap();
    // odd offset before the stored library
    zip.start_file("assets/a", stored).unwrap();
    zip.write_all(b"x").unwrap();
    zip.start_file(NATIVE_LIB, stored).unwrap();
    zip.write_all(&native_lib()).unwrap();
    zip.start_file(CONFIG_ASSET, deflated).unwrap();
    zip.write_all(OLD_CONFIG.as_bytes()).unwrap();
    for stale in ["META-INF/MANIFEST.MF", "META-INF/CERT.SF", "META-INF/CERT.RSA"] {
        zip.start_file(stale, deflated).unwrap();
        zip.write_all(b"stale").unwrap();
    }
    zip.finish().unwrap();
}

/// An entry for [`write_raw_template`].
pub struct RawEntry {
    pub name: &'static str,
    pub deflated: bool,
    pub data: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: &'static str,
}

impl RawEntry {
    pub fn stored(name: &'static str, data: Vec<u8>) -> Self {
        Self {
            name,
            deflated: false,
            data,
            extra: vec![],
            comment: "",
        }
    }

    /// Compressed data, as a single non-compressed deflate block.
    fn payload(&self) -> Vec<u8> {
        if !self.deflated {
            return self.data.clone();
        }
        let len = self.data.len() as u16;
        let mut block = vec![0x01];
        block.write_u16::<LittleEndian>(len).unwrap();
        block.write_u16::<LittleEndian>(!len).unwrap();
        block.extend_from_slice(&self.data);
        block
    }
}

/// 2021-06-15 10:30:00 in MS-DOS format.
pub const RAW_TIME: u16 = (10 << 11) | (30 << 5);
pub const RAW_DATE: u16 = ((2021 - 1980) << 9) | (6 << 5) | 15;

/// Extra field `0xbeef` holding `ABCD`.
pub const TAGGED_EXTRA: &[u8] = &[0xef, 0xbe, 0x04, 0x00, b'A', b'B', b'C', b'D'];

/// Writes an archive byte by byte, so entries can carry comments and extra
/// fields the zip writer does not produce.
pub fn write_raw_template(path: &Path, entries: &[RawEntry]) {
    let mut out: Vec<u8> = vec![];
    let mut central: Vec<u8> = vec![];
    for entry in entries {
        let offset = out.len() as u32;
        let payload = entry.payload();
        let method = if entry.deflated { 8 } else { 0 };
        let crc = crc32fast::hash(&entry.data);

        out.write_u32::<LittleEndian>(0x04034b50).unwrap();
        out.write_u16::<LittleEndian>(20).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(method).unwrap();
        out.write_u16::<LittleEndian>(RAW_TIME).unwrap();
        out.write_u16::<LittleEndian>(RAW_DATE).unwrap();
        out.write_u32::<LittleEndian>(crc).unwrap();
        out.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(entry.data.len() as u32).unwrap();
        out.write_u16::<LittleEndian>(entry.name.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(entry.extra.len() as u16).unwrap();
        out.extend_from_slice(entry.name.as_bytes());
        out.extend_from_slice(&entry.extra);
        out.extend_from_slice(&payload);

        central.write_u32::<LittleEndian>(0x02014b50).unwrap();
        // made by unix
        central.write_u16::<LittleEndian>(0x0314).unwrap();
        central.write_u16::<LittleEndian>(20).unwrap();
        central.write_u16::<LittleEndian>(0).unwrap();
        central.write_u16::<LittleEndian>(method).unwrap();
        central.write_u16::<LittleEndian>(RAW_TIME).unwrap();
        central.write_u16::<LittleEndian>(RAW_DATE).unwrap();
        central.write_u32::<LittleEndian>(crc).unwrap();
        central.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        central.write_u32::<LittleEndian>(entry.data.len() as u32).unwrap();
        central.write_u16::<LittleEndian>(entry.name.len() as u16).unwrap();
        central.write_u16::<LittleEndian>(entry.extra.len() as u16).unwrap();
        central.write_u16::<LittleEndian>(entry.comment.len() as u16).unwrap();
        central.write_u16::<LittleEndian>(0).unwrap();
        central.write_u16::<LittleEndian>(0).unwrap();
        central.write_u32::<LittleEndian>(0o100644 << 16).unwrap();
        central.write_u32::<LittleEndian>(offset).unwrap();
        central.extend_from_slice(entry.name.as_bytes());
        central.extend_from_slice(&entry.extra);
        central.extend_from_slice(entry.comment.as_bytes());
    }
    let central_offset = out.len() as u32;
    out.extend_from_slice(&central);
    out.write_u32::<LittleEndian>(0x06054b50).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(entries.len() as u16).unwrap();
    out.write_u16::<LittleEndian>(entries.len() as u16).unwrap();
    out.write_u32::<LittleEndian>(central.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(central_offset).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    std::fs::write(path, out).unwrap();
}

/// A template whose retained entries carry comments, extra fields and an
/// old timestamp.
pub fn write_annotated_template(path: &Path) {
    write_raw_template(
        path,
        &[
            RawEntry::stored("AndroidManifest.xml", manifest_bytes()),
            RawEntry::stored("resources.arsc", table_bytes(OLD_PACKAGE)),
            RawEntry {
                name: "assets/stored.bin",
                deflated: false,
                data: b"stored payload".to_vec(),
                extra: TAGGED_EXTRA.to_vec(),
                comment: "keep-me",
            },
            RawEntry {
                name: "assets/deflated.bin",
                deflated: true,
                data: b"deflated payload".to_vec(),
                extra: TAGGED_EXTRA.to_vec(),
                comment: "keep-me",
            },
            RawEntry {
                name: "assets/aligned.bin",
                deflated: false,
                data: b"realigned payload".to_vec(),
                extra: TAGGED_EXTRA.to_vec(),
                comment: "",
            },
            RawEntry::stored(NATIVE_LIB, native_lib()),
        ],
    );
}

/// Scratch space with a template and a pipeline using a throwaway identity.
pub struct Fixture {
    pub dir: TempDir,
    pub template: PathBuf,
    pub pipeline: Pipeline,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self::with_template(settings, write_template)
    }

    pub fn with_template(mut settings: Settings, write: impl FnOnce(&Path)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.apk");
        write(&template);
        settings.archive.work_dir = Some(dir.path().join("work"));
        let identity = IdentityConfig::throwaway(dir.path().join("keys").join("throwaway.p12"));
        let pipeline = Pipeline::with_identity(settings, identity);
        Self {
            dir,
            template,
            pipeline,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Entries left in the work directory.
    pub fn leftovers(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.path("work")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => vec![],
        }
    }
}
