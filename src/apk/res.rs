//! Codec for the chunked binary resource format used by `AndroidManifest.xml`
//! and `resources.arsc`.
//!
//! Chunks this crate edits are decoded into structured values. Everything else
//! (type specs, typed entries, libraries, overlays) is kept as a [`RawChunk`] and
//! written back byte for byte.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ChunkType {
    Null = 0x0000,
    StringPool = 0x0001,
    Table = 0x0002,
    Xml = 0x0003,
    XmlStartNamespace = 0x0100,
    XmlEndNamespace = 0x0101,
    XmlStartElement = 0x0102,
    XmlEndElement = 0x0103,
    XmlCdata = 0x0104,
    XmlResourceMap = 0x0180,
    TablePackage = 0x0200,
}

impl ChunkType {
    pub fn from_u16(ty: u16) -> Option<Self> {
        Some(match ty {
            ty if ty == ChunkType::Null as u16 => ChunkType::Null,
            ty if ty == ChunkType::StringPool as u16 => ChunkType::StringPool,
            ty if ty == ChunkType::Table as u16 => ChunkType::Table,
            ty if ty == ChunkType::Xml as u16 => ChunkType::Xml,
            ty if ty == ChunkType::XmlStartNamespace as u16 => ChunkType::XmlStartNamespace,
            ty if ty == ChunkType::XmlEndNamespace as u16 => ChunkType::XmlEndNamespace,
            ty if ty == ChunkType::XmlStartElement as u16 => ChunkType::XmlStartElement,
            ty if ty == ChunkType::XmlEndElement as u16 => ChunkType::XmlEndElement,
            ty if ty == ChunkType::XmlCdata as u16 => ChunkType::XmlCdata,
            ty if ty == ChunkType::XmlResourceMap as u16 => ChunkType::XmlResourceMap,
            ty if ty == ChunkType::TablePackage as u16 => ChunkType::TablePackage,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResChunkHeader {
    /// Type identifier for this chunk. The meaning of this value depends
    /// on the containing chunk.
    pub ty: u16,
    /// Size of the chunk header (in bytes). Adding this value to the address
    /// of the chunk allows you to find its associated data (if any).
    pub header_size: u16,
    /// Total size of this chunk (in bytes). This is the header_size plus the
    /// size of any data associated with the chunk.
    pub size: u32,
}

impl ResChunkHeader {
    pub const SIZE: u64 = 8;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let ty = r.read_u16::<LittleEndian>()?;
        let header_size = r.read_u16::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            ty,
            header_size,
            size,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16::<LittleEndian>(self.ty)?;
        w.write_u16::<LittleEndian>(self.header_size)?;
        w.write_u32::<LittleEndian>(self.size)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResStringPoolHeader {
    pub string_count: u32,
    pub style_count: u32,
    pub flags: u32,
    pub strings_start: u32,
    pub styles_start: u32,
}

impl ResStringPoolHeader {
    pub const SORTED_FLAG: u32 = 1 << 0;
    pub const UTF8_FLAG: u32 = 1 << 8;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let string_count = r.read_u32::<LittleEndian>()?;
        let style_count = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        let strings_start = r.read_u32::<LittleEndian>()?;
        let styles_start = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            string_count,
            style_count,
            flags,
            strings_start,
            styles_start,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.string_count)?;
        w.write_u32::<LittleEndian>(self.style_count)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(self.strings_start)?;
        w.write_u32::<LittleEndian>(self.styles_start)?;
        Ok(())
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & Self::UTF8_FLAG > 0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResSpan {
    pub name: i32,
    pub first_char: u32,
    pub last_char: u32,
}

impl ResSpan {
    pub fn read(r: &mut impl Read) -> Result<Option<Self>> {
        let name = r.read_i32::<LittleEndian>()?;
        if name == -1 {
            return Ok(None);
        }
        let first_char = r.read_u32::<LittleEndian>()?;
        let last_char = r.read_u32::<LittleEndian>()?;
        Ok(Some(Self {
            name,
            first_char,
            last_char,
        }))
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_u32::<LittleEndian>(self.first_char)?;
        w.write_u32::<LittleEndian>(self.last_char)?;
        Ok(())
    }
}

/// Decoded string pool. Indices into `strings` are what every other chunk
/// refers to, so entries must never be reordered once other chunks point at them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StringPool {
    pub strings: Vec<String>,
    pub styles: Vec<Vec<ResSpan>>,
    pub utf8: bool,
    pub sorted: bool,
}

impl StringPool {
    pub fn new(strings: Vec<String>, utf8: bool) -> Self {
        Self {
            strings,
            utf8,
            ..Default::default()
        }
    }

    pub fn get(&self, index: i32) -> Option<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.strings.get(index))
            .map(String::as_str)
    }

    pub fn position(&self, s: &str) -> Option<usize> {
        self.strings.iter().position(|candidate| candidate == s)
    }

    fn read<R: Read + Seek>(r: &mut R, start_pos: u64, header: &ResChunkHeader) -> Result<Self> {
        let pool_header = ResStringPoolHeader::read(r)?;
        r.seek(SeekFrom::Start(start_pos + header.header_size as u64))?;
        let mut string_offsets = Vec::with_capacity(pool_header.string_count as usize);
        for _ in 0..pool_header.string_count {
            string_offsets.push(r.read_u32::<LittleEndian>()?);
        }
        let mut style_offsets = Vec::with_capacity(pool_header.style_count as usize);
        for _ in 0..pool_header.style_count {
            style_offsets.push(r.read_u32::<LittleEndian>()?);
        }

        let strings_base = start_pos + pool_header.strings_start as u64;
        let mut strings = Vec::with_capacity(string_offsets.len());
        for (i, offset) in string_offsets.iter().enumerate() {
            r.seek(SeekFrom::Start(strings_base + *offset as u64))?;
            let s = if pool_header.is_utf8() {
                read_utf8_string(r)
            } else {
                read_utf16_string(r)
            }
            .with_context(|| format!("While decoding string #{i}"))?;
            strings.push(s);
        }

        let styles_base = start_pos + pool_header.styles_start as u64;
        let mut styles = Vec::with_capacity(style_offsets.len());
        for offset in style_offsets {
            r.seek(SeekFrom::Start(styles_base + offset as u64))?;
            let mut spans = vec![];
            while let Some(span) = ResSpan::read(r)? {
                spans.push(span);
            }
            styles.push(spans);
        }

        Ok(Self {
            strings,
            styles,
            utf8: pool_header.is_utf8(),
            sorted: pool_header.flags & ResStringPoolHeader::SORTED_FLAG > 0,
        })
    }

    fn write<W: Seek + Write>(&self, w: &mut W) -> Result<()> {
        let mut chunk = ChunkWriter::start_chunk(ChunkType::StringPool, w)?;
        ResStringPoolHeader::default().write(w)?;
        chunk.end_header(w)?;
        let indices_count = self.strings.len() + self.styles.len();
        for _ in 0..indices_count {
            w.write_u32::<LittleEndian>(0)?;
        }
        let mut indices = Vec::with_capacity(indices_count);

        let strings_start = w.stream_position()?;
        for string in &self.strings {
            indices.push(w.stream_position()? - strings_start);
            if self.utf8 {
                write_utf8_string(w, string)?;
            } else {
                write_utf16_string(w, string)?;
            }
        }
        while w.stream_position()? % 4 != 0 {
            w.write_u8(0)?;
        }

        let styles_start = w.stream_position()?;
        for style in &self.styles {
            indices.push(w.stream_position()? - styles_start);
            for span in style {
                span.write(w)?;
            }
            w.write_i32::<LittleEndian>(-1)?;
        }
        if !self.styles.is_empty() {
            // end of the style array
            w.write_i32::<LittleEndian>(-1)?;
            w.write_i32::<LittleEndian>(-1)?;
        }
        let (start_chunk, end_chunk) = chunk.end_chunk(w)?;

        let mut flags = 0;
        if self.utf8 {
            flags |= ResStringPoolHeader::UTF8_FLAG;
        }
        if self.sorted {
            flags |= ResStringPoolHeader::SORTED_FLAG;
        }
        w.seek(SeekFrom::Start(start_chunk + ResChunkHeader::SIZE))?;
        ResStringPoolHeader {
            string_count: self.strings.len() as u32,
            style_count: self.styles.len() as u32,
            flags,
            strings_start: (strings_start - start_chunk) as u32,
            styles_start: if self.styles.is_empty() {
                0
            } else {
                (styles_start - start_chunk) as u32
            },
        }
        .write(w)?;
        for index in indices {
            w.write_u32::<LittleEndian>(index as u32)?;
        }
        w.seek(SeekFrom::Start(end_chunk))?;
        Ok(())
    }
}

fn read_utf8_length(r: &mut impl Read) -> Result<u32> {
    let high = r.read_u8()? as u32;
    if high & 0x80 != 0 {
        Ok(((high & 0x7f) << 8) | r.read_u8()? as u32)
    } else {
        Ok(high)
    }
}

fn read_utf8_string(r: &mut impl Read) -> Result<String> {
    let _utf16_len = read_utf8_length(r)?;
    let byte_len = read_utf8_length(r)?;
    let mut buf = vec![0; byte_len as usize];
    r.read_exact(&mut buf)?;
    // aapt sometimes emits modified utf-8
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_utf16_string(r: &mut impl Read) -> Result<String> {
    let high = r.read_u16::<LittleEndian>()? as u32;
    let len = if high & 0x8000 != 0 {
        ((high & 0x7fff) << 16) | r.read_u16::<LittleEndian>()? as u32
    } else {
        high
    };
    let mut units = Vec::with_capacity(len as usize);
    for _ in 0..len {
        units.push(r.read_u16::<LittleEndian>()?);
    }
    Ok(String::from_utf16(&units)?)
}

fn write_utf8_length(w: &mut impl Write, len: usize) -> Result<()> {
    anyhow::ensure!(len <= 0x7fff, "string of {} units is too long for a pool", len);
    if len > 0x7f {
        w.write_u8(0x80 | (len >> 8) as u8)?;
    }
    w.write_u8((len & 0xff) as u8)?;
    Ok(())
}

fn write_utf8_string(w: &mut impl Write, s: &str) -> Result<()> {
    write_utf8_length(w, s.encode_utf16().count())?;
    write_utf8_length(w, s.len())?;
    w.write_all(s.as_bytes())?;
    w.write_u8(0)?;
    Ok(())
}

fn write_utf16_string(w: &mut impl Write, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = units.len();
    anyhow::ensure!(len <= 0x7fff_ffff, "string of {} units is too long for a pool", len);
    if len > 0x7fff {
        w.write_u16::<LittleEndian>(0x8000 | (len >> 16) as u16)?;
    }
    w.write_u16::<LittleEndian>((len & 0xffff) as u16)?;
    for unit in units {
        w.write_u16::<LittleEndian>(unit)?;
    }
    w.write_u16::<LittleEndian>(0)?;
    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResTableHeader {
    pub package_count: u32,
}

impl ResTableHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let package_count = r.read_u32::<LittleEndian>()?;
        Ok(Self { package_count })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.package_count)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlNodeHeader {
    pub line_number: u32,
    pub comment: i32,
}

impl ResXmlNodeHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let line_number = r.read_u32::<LittleEndian>()?;
        let comment = r.read_i32::<LittleEndian>()?;
        Ok(Self {
            line_number,
            comment,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.line_number)?;
        w.write_i32::<LittleEndian>(self.comment)?;
        Ok(())
    }
}

impl Default for ResXmlNodeHeader {
    fn default() -> Self {
        Self {
            line_number: 1,
            comment: -1,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlNamespace {
    pub prefix: i32,
    pub uri: i32,
}

impl ResXmlNamespace {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let prefix = r.read_i32::<LittleEndian>()?;
        let uri = r.read_i32::<LittleEndian>()?;
        Ok(Self { prefix, uri })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.prefix)?;
        w.write_i32::<LittleEndian>(self.uri)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlStartElement {
    /// String of the full namespace of this element.
    pub namespace: i32,
    /// String name of this node.
    pub name: i32,
    /// Byte offset from the start of this structure to where
    /// the attributes start.
    pub attribute_start: u16,
    /// Size of the attribute structures that follow.
    pub attribute_size: u16,
    /// Number of attributes associated with an ELEMENT. These are
    /// available as an array of ResXmlAttribute structures
    /// immediately following this node.
    pub attribute_count: u16,
    /// Index (1-based) of the "id" attribute. 0 if none.
    pub id_index: u16,
    /// Index (1-based) of the "class" attribute. 0 if none.
    pub class_index: u16,
    /// Index (1-based) of the "style" attribute. 0 if none.
    pub style_index: u16,
}

impl Default for ResXmlStartElement {
    fn default() -> Self {
        Self {
            namespace: -1,
            name: -1,
            attribute_start: Self::SIZE,
            attribute_size: ResXmlAttribute::SIZE,
            attribute_count: 0,
            id_index: 0,
            class_index: 0,
            style_index: 0,
        }
    }
}

impl ResXmlStartElement {
    pub const SIZE: u16 = 0x14;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        let attribute_start = r.read_u16::<LittleEndian>()?;
        let attribute_size = r.read_u16::<LittleEndian>()?;
        let attribute_count = r.read_u16::<LittleEndian>()?;
        let id_index = r.read_u16::<LittleEndian>()?;
        let class_index = r.read_u16::<LittleEndian>()?;
        let style_index = r.read_u16::<LittleEndian>()?;
        Ok(Self {
            namespace,
            name,
            attribute_start,
            attribute_size,
            attribute_count,
            id_index,
            class_index,
            style_index,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_u16::<LittleEndian>(self.attribute_start)?;
        w.write_u16::<LittleEndian>(self.attribute_size)?;
        w.write_u16::<LittleEndian>(self.attribute_count)?;
        w.write_u16::<LittleEndian>(self.id_index)?;
        w.write_u16::<LittleEndian>(self.class_index)?;
        w.write_u16::<LittleEndian>(self.style_index)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlAttribute {
    pub namespace: i32,
    pub name: i32,
    pub raw_value: i32,
    pub typed_value: ResValue,
}

impl ResXmlAttribute {
    pub const SIZE: u16 = 0x14;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        let raw_value = r.read_i32::<LittleEndian>()?;
        let typed_value = ResValue::read(r)?;
        Ok(Self {
            namespace,
            name,
            raw_value,
            typed_value,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_i32::<LittleEndian>(self.raw_value)?;
        self.typed_value.write(w)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlEndElement {
    pub namespace: i32,
    pub name: i32,
}

impl ResXmlEndElement {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        Ok(Self { namespace, name })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlCdata {
    /// The raw CDATA character data.
    pub data: i32,
    pub typed_value: ResValue,
}

impl ResXmlCdata {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let data = r.read_i32::<LittleEndian>()?;
        let typed_value = ResValue::read(r)?;
        Ok(Self { data, typed_value })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.data)?;
        self.typed_value.write(w)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResTablePackageHeader {
    /// If this is a base package, its ID. Package IDs start
    /// at 1 (corresponding to the value of the package bits in a
    /// resource identifier). 0 means this is not a base package.
    pub id: u32,
    /// Actual name of this package, \0-terminated.
    pub name: String,
    /// Offset to a ResStringPoolHeader defining the resource
    /// type symbol table. If zero, this package is inheriting
    /// from another base package (overriding specific values in it).
    pub type_strings: u32,
    /// Last index into type_strings that is for public use by others.
    pub last_public_type: u32,
    /// Offset to a ResStringPoolHeader defining the resource key
    /// symbol table. If zero, this package is inheriting from another
    /// base package (overriding specific values in it).
    pub key_strings: u32,
    /// Last index into key_strings that is for public use by others.
    pub last_public_key: u32,
    pub type_id_offset: u32,
}

impl ResTablePackageHeader {
    /// Number of UTF-16 units reserved for the package name, terminator included.
    pub const NAME_UNITS: usize = 128;

    pub fn read<R: Read + Seek>(r: &mut R, header: &ResChunkHeader) -> Result<Self> {
        let id = r.read_u32::<LittleEndian>()?;
        let mut name = [0u16; Self::NAME_UNITS];
        for unit in name.iter_mut() {
            *unit = r.read_u16::<LittleEndian>()?;
        }
        let name = decode_package_name(&name)?;
        let type_strings = r.read_u32::<LittleEndian>()?;
        let last_public_type = r.read_u32::<LittleEndian>()?;
        let key_strings = r.read_u32::<LittleEndian>()?;
        let last_public_key = r.read_u32::<LittleEndian>()?;
        // older tables stop before type_id_offset
        let type_id_offset = if header.header_size >= 0x120 {
            r.read_u32::<LittleEndian>()?
        } else {
            0
        };
        Ok(Self {
            id,
            name,
            type_strings,
            last_public_type,
            key_strings,
            last_public_key,
            type_id_offset,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.id)?;
        for unit in encode_package_name(&self.name)? {
            w.write_u16::<LittleEndian>(unit)?;
        }
        w.write_u32::<LittleEndian>(self.type_strings)?;
        w.write_u32::<LittleEndian>(self.last_public_type)?;
        w.write_u32::<LittleEndian>(self.key_strings)?;
        w.write_u32::<LittleEndian>(self.last_public_key)?;
        w.write_u32::<LittleEndian>(self.type_id_offset)?;
        Ok(())
    }
}

pub fn decode_package_name(units: &[u16]) -> Result<String> {
    let len = units.iter().position(|c| *c == 0).unwrap_or(units.len());
    Ok(String::from_utf16(&units[..len])?)
}

/// Encodes `name` into the fixed, zero padded package name field.
pub fn encode_package_name(name: &str) -> Result<[u16; ResTablePackageHeader::NAME_UNITS]> {
    let mut units = [0u16; ResTablePackageHeader::NAME_UNITS];
    let encoded: Vec<u16> = name.encode_utf16().collect();
    anyhow::ensure!(
        encoded.len() < ResTablePackageHeader::NAME_UNITS,
        "package name `{}` does not fit the {} unit table field",
        name,
        ResTablePackageHeader::NAME_UNITS - 1
    );
    units[..encoded.len()].copy_from_slice(&encoded);
    Ok(units)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResValue {
    pub size: u16,
    pub res0: u8,
    pub data_type: u8,
    pub data: u32,
}

impl ResValue {
    pub fn new(data_type: ResValueType, data: u32) -> Self {
        Self {
            size: 8,
            res0: 0,
            data_type: data_type as u8,
            data,
        }
    }

    pub fn string(index: usize) -> Self {
        Self::new(ResValueType::String, index as u32)
    }

    pub fn boolean(value: bool) -> Self {
        Self::new(ResValueType::IntBoolean, if value { 0xffff_ffff } else { 0 })
    }

    pub fn int_dec(value: u32) -> Self {
        Self::new(ResValueType::IntDec, value)
    }

    pub fn value_type(&self) -> Option<ResValueType> {
        ResValueType::from_u8(self.data_type)
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let size = r.read_u16::<LittleEndian>()?;
        let res0 = r.read_u8()?;
        let data_type = r.read_u8()?;
        let data = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            size,
            res0,
            data_type,
            data,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16::<LittleEndian>(self.size)?;
        w.write_u8(self.res0)?;
        w.write_u8(self.data_type)?;
        w.write_u32::<LittleEndian>(self.data)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResValueType {
    Null = 0x00,
    Reference = 0x01,
    Attribute = 0x02,
    String = 0x03,
    Float = 0x04,
    Dimension = 0x05,
    Fraction = 0x06,
    IntDec = 0x10,
    IntHex = 0x11,
    IntBoolean = 0x12,
    IntColorArgb8 = 0x1c,
    IntColorRgb8 = 0x1d,
    IntColorArgb4 = 0x1e,
    IntColorRgb4 = 0x1f,
}

impl ResValueType {
    pub fn from_u8(ty: u8) -> Option<Self> {
        Some(match ty {
            x if x == Self::Null as u8 => Self::Null,
            x if x == Self::Reference as u8 => Self::Reference,
            x if x == Self::Attribute as u8 => Self::Attribute,
            x if x == Self::String as u8 => Self::String,
            x if x == Self::Float as u8 => Self::Float,
            x if x == Self::Dimension as u8 => Self::Dimension,
            x if x == Self::Fraction as u8 => Self::Fraction,
            x if x == Self::IntDec as u8 => Self::IntDec,
            x if x == Self::IntHex as u8 => Self::IntHex,
            x if x == Self::IntBoolean as u8 => Self::IntBoolean,
            x if x == Self::IntColorArgb8 as u8 => Self::IntColorArgb8,
            x if x == Self::IntColorRgb8 as u8 => Self::IntColorRgb8,
            x if x == Self::IntColorArgb4 as u8 => Self::IntColorArgb4,
            x if x == Self::IntColorRgb4 as u8 => Self::IntColorRgb4,
            _ => return None,
        })
    }
}

/// A chunk this codec does not interpret.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawChunk {
    pub ty: u16,
    /// Header bytes following the common 8 byte chunk header.
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Chunk {
    Null,
    StringPool(StringPool),
    Table(ResTableHeader, Vec<Chunk>),
    Xml(Vec<Chunk>),
    XmlStartNamespace(ResXmlNodeHeader, ResXmlNamespace),
    XmlEndNamespace(ResXmlNodeHeader, ResXmlNamespace),
    XmlStartElement(ResXmlNodeHeader, ResXmlStartElement, Vec<ResXmlAttribute>),
    XmlEndElement(ResXmlNodeHeader, ResXmlEndElement),
    XmlCdata(ResXmlNodeHeader, ResXmlCdata),
    XmlResourceMap(Vec<u32>),
    TablePackage(ResTablePackageHeader, Vec<Chunk>),
    Raw(RawChunk),
}

struct ChunkWriter {
    ty: u16,
    start_chunk: u64,
    end_header: u64,
}

impl ChunkWriter {
    fn start_chunk<W: Seek + Write>(ty: ChunkType, w: &mut W) -> Result<Self> {
        Self::start_raw(ty as u16, w)
    }

    fn start_raw<W: Seek + Write>(ty: u16, w: &mut W) -> Result<Self> {
        let start_chunk = w.stream_position()?;
        ResChunkHeader::default().write(w)?;
        Ok(Self {
            ty,
            start_chunk,
            end_header: 0,
        })
    }

    fn end_header<W: Seek + Write>(&mut self, w: &mut W) -> Result<()> {
        self.end_header = w.stream_position()?;
        Ok(())
    }

    fn end_chunk<W: Seek + Write>(self, w: &mut W) -> Result<(u64, u64)> {
        anyhow::ensure!(self.end_header != 0, "chunk header was never closed");
        let end_chunk = w.stream_position()?;
        let header = ResChunkHeader {
            ty: self.ty,
            header_size: (self.end_header - self.start_chunk) as u16,
            size: (end_chunk - self.start_chunk) as u32,
        };
        w.seek(SeekFrom::Start(self.start_chunk))?;
        header.write(w)?;
        w.seek(SeekFrom::Start(end_chunk))?;
        Ok((self.start_chunk, end_chunk))
    }
}

impl Chunk {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::parse(&mut Cursor::new(bytes))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let start_pos = r.stream_position()?;
        let header = ResChunkHeader::read(r)?;
        anyhow::ensure!(
            header.header_size as u64 >= ResChunkHeader::SIZE
                && header.size >= header.header_size as u32,
            "malformed chunk header {:?} at {}",
            header,
            start_pos
        );
        let header_end = start_pos + header.header_size as u64;
        let end_pos = start_pos + header.size as u64;
        let chunk = match ChunkType::from_u16(header.ty) {
            Some(ChunkType::Null) => {
                tracing::trace!("null");
                Chunk::Null
            }
            Some(ChunkType::StringPool) => {
                tracing::trace!("string pool");
                Chunk::StringPool(StringPool::read(r, start_pos, &header)?)
            }
            Some(ChunkType::Table) => {
                tracing::trace!("table");
                let table_header = ResTableHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                Chunk::Table(table_header, Self::parse_children(r, end_pos)?)
            }
            Some(ChunkType::Xml) => {
                tracing::trace!("xml");
                r.seek(SeekFrom::Start(header_end))?;
                Chunk::Xml(Self::parse_children(r, end_pos)?)
            }
            Some(ChunkType::XmlStartNamespace) => {
                tracing::trace!("xml start namespace");
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let namespace = ResXmlNamespace::read(r)?;
                Chunk::XmlStartNamespace(node_header, namespace)
            }
            Some(ChunkType::XmlEndNamespace) => {
                tracing::trace!("xml end namespace");
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let namespace = ResXmlNamespace::read(r)?;
                Chunk::XmlEndNamespace(node_header, namespace)
            }
            Some(ChunkType::XmlStartElement) => {
                tracing::trace!("xml start element");
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let mut start_element = ResXmlStartElement::read(r)?;
                let attributes_base = header_end + start_element.attribute_start as u64;
                let stride = start_element.attribute_size.max(ResXmlAttribute::SIZE) as u64;
                let mut attributes = Vec::with_capacity(start_element.attribute_count as usize);
                for i in 0..start_element.attribute_count as u64 {
                    r.seek(SeekFrom::Start(attributes_base + i * stride))?;
                    attributes.push(ResXmlAttribute::read(r)?);
                }
                // normalized on write
                start_element.attribute_start = ResXmlStartElement::SIZE;
                start_element.attribute_size = ResXmlAttribute::SIZE;
                Chunk::XmlStartElement(node_header, start_element, attributes)
            }
            Some(ChunkType::XmlEndElement) => {
                tracing::trace!("xml end element");
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let end_element = ResXmlEndElement::read(r)?;
                Chunk::XmlEndElement(node_header, end_element)
            }
            Some(ChunkType::XmlCdata) => {
                tracing::trace!("xml cdata");
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                Chunk::XmlCdata(node_header, ResXmlCdata::read(r)?)
            }
            Some(ChunkType::XmlResourceMap) => {
                tracing::trace!("xml resource map");
                r.seek(SeekFrom::Start(header_end))?;
                let count = (header.size as usize - header.header_size as usize) / 4;
                let mut resource_map = Vec::with_capacity(count);
                for _ in 0..count {
                    resource_map.push(r.read_u32::<LittleEndian>()?);
                }
                Chunk::XmlResourceMap(resource_map)
            }
            Some(ChunkType::TablePackage) => {
                tracing::trace!("table package");
                let package_header = ResTablePackageHeader::read(r, &header)?;
                r.seek(SeekFrom::Start(header_end))?;
                Chunk::TablePackage(package_header, Self::parse_children(r, end_pos)?)
            }
            None => {
                tracing::trace!("raw chunk 0x{:04x}", header.ty);
                let mut header_bytes = vec![0; (header_end - start_pos - ResChunkHeader::SIZE) as usize];
                r.read_exact(&mut header_bytes)?;
                let mut body = vec![0; (end_pos - header_end) as usize];
                r.read_exact(&mut body)?;
                Chunk::Raw(RawChunk {
                    ty: header.ty,
                    header: header_bytes,
                    body,
                })
            }
        };
        r.seek(SeekFrom::Start(end_pos))?;
        Ok(chunk)
    }

    fn parse_children<R: Read + Seek>(r: &mut R, end_pos: u64) -> Result<Vec<Chunk>> {
        let mut chunks = vec![];
        // trailing padding shorter than a chunk header is tolerated
        while r.stream_position()? + ResChunkHeader::SIZE <= end_pos {
            chunks.push(Chunk::parse(r)?);
        }
        Ok(chunks)
    }

    pub fn write<W: Seek + Write>(&self, w: &mut W) -> Result<()> {
        match self {
            Chunk::Null => {}
            Chunk::StringPool(pool) => pool.write(w)?,
            Chunk::Table(table_header, chunks) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::Table, w)?;
                table_header.write(w)?;
                chunk.end_header(w)?;
                for chunk in chunks {
                    chunk.write(w)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::Xml(chunks) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::Xml, w)?;
                chunk.end_header(w)?;
                for chunk in chunks {
                    chunk.write(w)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::XmlStartNamespace(node_header, namespace) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlStartNamespace, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                namespace.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlEndNamespace(node_header, namespace) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlEndNamespace, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                namespace.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlStartElement(node_header, start_element, attributes) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlStartElement, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                let mut start_element = *start_element;
                start_element.attribute_start = ResXmlStartElement::SIZE;
                start_element.attribute_size = ResXmlAttribute::SIZE;
                start_element.attribute_count = attributes.len() as u16;
                start_element.write(w)?;
                for attr in attributes {
                    attr.write(w)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::XmlEndElement(node_header, end_element) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlEndElement, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                end_element.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlCdata(node_header, cdata) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlCdata, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                cdata.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlResourceMap(resource_map) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlResourceMap, w)?;
                chunk.end_header(w)?;
                for entry in resource_map {
                    w.write_u32::<LittleEndian>(*entry)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::TablePackage(package_header, chunks) => {
                let package_start = w.stream_position()?;
                let mut chunk = ChunkWriter::start_chunk(ChunkType::TablePackage, w)?;
                let mut package_header = package_header.clone();
                let header_start = w.stream_position()?;
                package_header.write(w)?;
                chunk.end_header(w)?;

                // The type and key pools are the first two children.
                for (i, child) in chunks.iter().enumerate() {
                    let child_start = (w.stream_position()? - package_start) as u32;
                    match (i, child) {
                        (0, Chunk::StringPool(_)) => package_header.type_strings = child_start,
                        (1, Chunk::StringPool(_)) => package_header.key_strings = child_start,
                        _ => {}
                    }
                    child.write(w)?;
                }
                chunk.end_chunk(w)?;

                let end = w.stream_position()?;
                w.seek(SeekFrom::Start(header_start))?;
                package_header.write(w)?;
                w.seek(SeekFrom::Start(end))?;
            }
            Chunk::Raw(raw) => {
                let mut chunk = ChunkWriter::start_raw(raw.ty, w)?;
                w.write_all(&raw.header)?;
                chunk.end_header(w)?;
                w.write_all(&raw.body)?;
                chunk.end_chunk(w)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse(chunk: &Chunk) -> Chunk {
        Chunk::from_bytes(&chunk.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn should_keep_long_utf8_strings() {
        let long = "x".repeat(300);
        let pool = Chunk::StringPool(StringPool::new(vec![long.clone(), "short".into()], true));
        let Chunk::StringPool(parsed) = reparse(&pool) else {
            panic!("expected a string pool");
        };
        assert_eq!(parsed.strings, vec![long, "short".to_string()]);
        assert!(parsed.utf8);
    }

    #[test]
    fn should_keep_utf16_pools_utf16() {
        let pool = Chunk::StringPool(StringPool::new(vec!["Привет".into(), "".into()], false));
        let bytes = pool.to_bytes().unwrap();
        let Chunk::StringPool(parsed) = Chunk::from_bytes(&bytes).unwrap() else {
            panic!("expected a string pool");
        };
        assert!(!parsed.utf8);
        assert_eq!(parsed.get(0), Some("Привет"));
        assert_eq!(parsed.get(1), Some(""));
        assert_eq!(parsed.get(2), None);
        assert_eq!(bytes.len() % 4, 0);
    }

    #[test]
    fn should_preserve_unknown_chunks() {
        let raw = Chunk::Raw(RawChunk {
            ty: 0x0203,
            header: vec![1, 0, 0, 0],
            body: vec![9; 12],
        });
        let xml = Chunk::Xml(vec![
            Chunk::StringPool(StringPool::new(vec!["a".into()], true)),
            raw.clone(),
        ]);
        let Chunk::Xml(children) = reparse(&xml) else {
            panic!("expected xml");
        };
        assert_eq!(children[1], raw);
    }

    #[test]
    fn should_write_package_pool_offsets() {
        let table = Chunk::Table(
            ResTableHeader { package_count: 1 },
            vec![Chunk::TablePackage(
                ResTablePackageHeader {
                    id: 0x7f,
                    name: "com.example".into(),
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
            )],
        );
        let Chunk::Table(_, children) = reparse(&table) else {
            panic!("expected a table");
        };
        let Chunk::TablePackage(header, _) = &children[0] else {
            panic!("expected a package");
        };
        assert_eq!(header.name, "com.example");
        assert_eq!(header.type_strings, 288);
        assert!(header.key_strings > header.type_strings);
    }

    #[test]
    fn should_reject_oversized_package_names() {
        assert!(encode_package_name(&"a".repeat(127)).is_ok());
        assert!(encode_package_name(&"a".repeat(128)).is_err());
    }
}
