//! Package entries of a compiled `resources.arsc`.
//!
//! Only chunk headers are walked; package names are patched in their fixed
//! width field so every offset in the table stays valid.

use super::res::{decode_package_name, encode_package_name, ChunkType, ResChunkHeader};
use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use std::io::Cursor;

/// Offset of the name field inside a package chunk (chunk header + id).
const PACKAGE_NAME_OFFSET: usize = 12;
const PACKAGE_NAME_BYTES: usize = 256;

/// Byte offsets of every package chunk in the table.
fn package_offsets(table: &[u8]) -> Result<Vec<usize>> {
    let header = ResChunkHeader::read(&mut Cursor::new(table))?;
    anyhow::ensure!(
        header.ty == ChunkType::Table as u16,
        "not a resource table (chunk type 0x{:04x})",
        header.ty
    );
    let end = (header.size as usize).min(table.len());
    let mut pos = header.header_size as usize;
    let mut offsets = vec![];
    while pos + ResChunkHeader::SIZE as usize <= end {
        let child = ResChunkHeader::read(&mut Cursor::new(&table[pos..]))?;
        anyhow::ensure!(
            child.size as usize >= ResChunkHeader::SIZE as usize,
            "corrupt chunk at offset {}",
            pos
        );
        if child.ty == ChunkType::TablePackage as u16 {
            anyhow::ensure!(
                pos + PACKAGE_NAME_OFFSET + PACKAGE_NAME_BYTES <= end,
                "truncated package chunk at offset {}",
                pos
            );
            offsets.push(pos);
        }
        pos += child.size as usize;
    }
    Ok(offsets)
}

fn read_name(table: &[u8], offset: usize) -> Result<String> {
    let start = offset + PACKAGE_NAME_OFFSET;
    let mut units = [0u16; PACKAGE_NAME_BYTES / 2];
    LittleEndian::read_u16_into(&table[start..start + PACKAGE_NAME_BYTES], &mut units);
    decode_package_name(&units)
}

pub fn package_names(table: &[u8]) -> Result<Vec<String>> {
    package_offsets(table)?
        .into_iter()
        .map(|offset| read_name(table, offset))
        .collect()
}

/// Renames every package called `from` to `to`. Returns how many were renamed.
pub fn rename_package(table: &mut [u8], from: &str, to: &str) -> Result<usize> {
    let units = encode_package_name(to)?;
    let mut renamed = 0;
    for offset in package_offsets(table)? {
        if read_name(table, offset)? != from {
            continue;
        }
        let start = offset + PACKAGE_NAME_OFFSET;
        LittleEndian::write_u16_into(&units, &mut table[start..start + PACKAGE_NAME_BYTES]);
        tracing::debug!("renamed table package `{}` -> `{}`", from, to);
        renamed += 1;
    }
    Ok(renamed)
}
