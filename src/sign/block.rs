//! APK Signing Block holding the v2 and v3 signature scheme pairs.

use super::{SignOptions, Signer};
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rsa::pkcs8::EncodePublicKey;
use sha2::{Digest as _, Sha256};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const APK_SIGNING_BLOCK_MAGIC: &[u8] = b"APK Sig Block 42";
pub const APK_SIGNING_BLOCK_V2_ID: u32 = 0x7109871a;
pub const APK_SIGNING_BLOCK_V3_ID: u32 = 0xf05368c0;
/// v2 signed-data attribute announcing that the signer also produced a v3 block.
pub const STRIPPING_PROTECTION_ATTR_ID: u32 = 0xbeeff00d;
pub const RSA_PKCS1V15_SHA2_256: u32 = 0x0103;
pub const V3_MIN_SDK: u32 = 28;
pub const V3_MAX_SDK: u32 = i32::MAX as u32;
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZipInfo {
    pub cde_start: u64,
    pub cd_start: u64,
}

impl ZipInfo {
    pub fn new<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let cde_start = find_cde_start_pos(r)?;
        r.seek(SeekFrom::Start(cde_start + 16))?;
        let cd_start = r.read_u32::<LittleEndian>()? as u64;
        anyhow::ensure!(
            cd_start <= cde_start,
            "central directory offset {} lies past its end record",
            cd_start
        );
        Ok(Self {
            cde_start,
            cd_start,
        })
    }
}

fn find_cde_start_pos<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    const CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x06054b50;
    const HEADER_SIZE: u64 = 22;
    let file_length = reader.seek(SeekFrom::End(0))?;
    let search_upper_bound = file_length.saturating_sub(HEADER_SIZE + u16::MAX as u64);
    anyhow::ensure!(file_length >= HEADER_SIZE, "Invalid zip header");
    let mut pos = file_length - HEADER_SIZE;
    while pos >= search_upper_bound {
        reader.seek(SeekFrom::Start(pos))?;
        if reader.read_u32::<LittleEndian>()? == CENTRAL_DIRECTORY_END_SIGNATURE {
            return Ok(pos);
        }
        pos = match pos.checked_sub(1) {
            Some(p) => p,
            None => break,
        };
    }
    anyhow::bail!("Could not find central directory end");
}

/// Location of the signing block and its id-value pairs, if the archive has one.
#[derive(Debug, Default)]
pub struct SigningBlock {
    pub pairs: Vec<(u32, Vec<u8>)>,
    /// Start of the block, or of the central directory when there is none.
    pub sb_start: u64,
    pub cd_start: u64,
    pub cde_start: u64,
}

impl SigningBlock {
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let info = ZipInfo::new(r)?;
        let mut block = SigningBlock {
            cde_start: info.cde_start,
            cd_start: info.cd_start,
            sb_start: info.cd_start,
            ..Default::default()
        };
        let Some(footer) = block.cd_start.checked_sub(16 + 8) else {
            return Ok(block);
        };
        r.seek(SeekFrom::Start(footer))?;
        let size = r.read_u64::<LittleEndian>()?;
        let mut magic = [0; 16];
        r.read_exact(&mut magic)?;
        if magic != APK_SIGNING_BLOCK_MAGIC {
            return Ok(block);
        }
        let sb_start = (block.cd_start)
            .checked_sub(size)
            .and_then(|p| p.checked_sub(8))
            .context("signing block size exceeds its offset")?;
        anyhow::ensure!(size >= 24, "signing block too small");
        r.seek(SeekFrom::Start(sb_start))?;
        let leading = r.read_u64::<LittleEndian>()?;
        anyhow::ensure!(leading == size, "signing block sizes disagree");
        let mut body = vec![0; (size - 24) as usize];
        r.read_exact(&mut body)?;
        let mut rest = &body[..];
        while !rest.is_empty() {
            let length = rest.read_u64::<LittleEndian>()? as usize;
            anyhow::ensure!(
                (4..=rest.len()).contains(&length),
                "signing block pair overruns the block"
            );
            let (pair, tail) = rest.split_at(length);
            let mut pair = pair;
            let id = pair.read_u32::<LittleEndian>()?;
            block.pairs.push((id, pair.to_vec()));
            rest = tail;
        }
        block.sb_start = sb_start;
        Ok(block)
    }

    pub fn pair(&self, id: u32) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(pid, _)| *pid == id)
            .map(|(_, value)| value.as_slice())
    }

    pub fn has_block(&self) -> bool {
        self.sb_start != self.cd_start
    }
}

/// Chunked SHA-256 content digest over everything except the signing block.
pub fn compute_digest<R: Read + Seek>(
    r: &mut R,
    sb_start: u64,
    cd_start: u64,
    cde_start: u64,
) -> Result<[u8; 32]> {
    let mut chunks = vec![];
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; MAX_CHUNK_SIZE];

    // chunk contents
    r.rewind()?;
    let mut pos = 0;
    while pos < sb_start {
        hash_chunk(&mut chunks, r, sb_start, &mut hasher, &mut chunk, &mut pos)?;
    }

    // chunk cd
    let mut pos = r.seek(SeekFrom::Start(cd_start))?;
    while pos < cde_start {
        hash_chunk(&mut chunks, r, cde_start, &mut hasher, &mut chunk, &mut pos)?;
    }

    // chunk cde, with the central directory offset as if there were no block
    chunk.clear();
    r.read_to_end(&mut chunk)?;
    anyhow::ensure!(
        chunk.len() >= 20 && chunk.len() <= MAX_CHUNK_SIZE,
        "malformed end of central directory"
    );
    let mut cursor = Cursor::new(&mut chunk);
    cursor.seek(SeekFrom::Start(16))?;
    cursor.write_u32::<LittleEndian>(sb_start as u32)?;
    hasher.update([0xa5]);
    hasher.update((chunk.len() as u32).to_le_bytes());
    hasher.update(&chunk);
    chunks.push(hasher.finalize_reset().into());

    // compute root
    hasher.update([0x5a]);
    hasher.update((chunks.len() as u32).to_le_bytes());
    for chunk in &chunks {
        hasher.update(chunk);
    }
    Ok(hasher.finalize().into())
}

fn hash_chunk<R: Read + Seek>(
    chunks: &mut Vec<[u8; 32]>,
    r: &mut R,
    size: u64,
    hasher: &mut Sha256,
    buffer: &mut Vec<u8>,
    pos: &mut u64,
) -> Result<()> {
    let end = std::cmp::min(*pos + MAX_CHUNK_SIZE as u64, size);
    let len = (end - *pos) as usize;
    buffer.resize(len, 0);
    r.read_exact(buffer)?;
    hasher.update([0xa5]);
    hasher.update((len as u32).to_le_bytes());
    hasher.update(&buffer[..]);
    chunks.push(hasher.finalize_reset().into());
    *pos = end;
    Ok(())
}

/// Splits a u32 length-prefixed value off the front of `buf`.
pub(crate) fn take_prefixed<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = buf.read_u32::<LittleEndian>()? as usize;
    anyhow::ensure!(len <= buf.len(), "length prefix {} overruns its container", len);
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn write_prefixed(w: &mut impl Write, bytes: &[u8]) -> Result<()> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(())
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Digest {
    pub algorithm: u32,
    pub digest: Vec<u8>,
}

impl Digest {
    fn new(hash: [u8; 32]) -> Self {
        Self {
            algorithm: RSA_PKCS1V15_SHA2_256,
            digest: hash.to_vec(),
        }
    }

    fn read(mut r: &[u8]) -> Result<Self> {
        let algorithm = r.read_u32::<LittleEndian>()?;
        let digest = take_prefixed(&mut r)?.to_vec();
        Ok(Self { algorithm, digest })
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.digest.len() as u32 + 8)?;
        w.write_u32::<LittleEndian>(self.algorithm)?;
        write_prefixed(w, &self.digest)
    }
}

/// The signed part of a v2 or v3 signer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SignedData {
    pub digests: Vec<Digest>,
    pub certificates: Vec<Vec<u8>>,
    /// v3 only.
    pub sdk_range: Option<(u32, u32)>,
    pub additional_attributes: Vec<(u32, Vec<u8>)>,
}

impl SignedData {
    fn new(hash: [u8; 32], signer: &Signer) -> Self {
        Self {
            digests: vec![Digest::new(hash)],
            certificates: vec![signer.cert_der().to_vec()],
            sdk_range: None,
            additional_attributes: vec![],
        }
    }

    pub fn read(mut r: &[u8], v3: bool) -> Result<Self> {
        let mut signed_data = SignedData::default();
        let mut digests = take_prefixed(&mut r)?;
        while !digests.is_empty() {
            signed_data.digests.push(Digest::read(take_prefixed(&mut digests)?)?);
        }
        let mut certificates = take_prefixed(&mut r)?;
        while !certificates.is_empty() {
            signed_data
                .certificates
                .push(take_prefixed(&mut certificates)?.to_vec());
        }
        if v3 {
            let min = r.read_u32::<LittleEndian>()?;
            let max = r.read_u32::<LittleEndian>()?;
            signed_data.sdk_range = Some((min, max));
        }
        let mut attributes = take_prefixed(&mut r)?;
        while !attributes.is_empty() {
            let mut attribute = take_prefixed(&mut attributes)?;
            let id = attribute.read_u32::<LittleEndian>()?;
            signed_data.additional_attributes.push((id, attribute.to_vec()));
        }
        Ok(signed_data)
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        let mut digests = vec![];
        for digest in &self.digests {
            digest.write(&mut digests)?;
        }
        write_prefixed(w, &digests)?;
        let mut certificates = vec![];
        for cert in &self.certificates {
            write_prefixed(&mut certificates, cert)?;
        }
        write_prefixed(w, &certificates)?;
        if let Some((min, max)) = self.sdk_range {
            w.write_u32::<LittleEndian>(min)?;
            w.write_u32::<LittleEndian>(max)?;
        }
        let mut attributes = vec![];
        for (id, value) in &self.additional_attributes {
            attributes.write_u32::<LittleEndian>(value.len() as u32 + 4)?;
            attributes.write_u32::<LittleEndian>(*id)?;
            attributes.write_all(value)?;
        }
        write_prefixed(w, &attributes)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApkSignature {
    pub algorithm: u32,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApkSigner {
    pub signed_data: Vec<u8>,
    /// v3 only.
    pub sdk_range: Option<(u32, u32)>,
    pub signatures: Vec<ApkSignature>,
    pub public_key: Vec<u8>,
}

/// Value of a v2 or v3 pair: a sequence of signers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SchemeBlock {
    pub signers: Vec<ApkSigner>,
}

impl SchemeBlock {
    fn new(hash: [u8; 32], signer: &Signer, v3: bool, announce_v3: bool) -> Result<Self> {
        let mut data = SignedData::new(hash, signer);
        if v3 {
            data.sdk_range = Some((V3_MIN_SDK, V3_MAX_SDK));
        } else if announce_v3 {
            data.additional_attributes
                .push((STRIPPING_PROTECTION_ATTR_ID, 3u32.to_le_bytes().to_vec()));
        }
        let mut signed_data = vec![];
        data.write(&mut signed_data)?;
        let signature = signer.sign(&signed_data)?;
        Ok(Self {
            signers: vec![ApkSigner {
                signed_data,
                sdk_range: data.sdk_range,
                signatures: vec![ApkSignature {
                    algorithm: RSA_PKCS1V15_SHA2_256,
                    signature,
                }],
                public_key: signer.pubkey().to_public_key_der()?.as_ref().to_vec(),
            }],
        })
    }

    pub fn read(mut r: &[u8], v3: bool) -> Result<Self> {
        let mut signers = vec![];
        let mut all = take_prefixed(&mut r)?;
        while !all.is_empty() {
            let mut signer = take_prefixed(&mut all)?;
            let signed_data = take_prefixed(&mut signer)?.to_vec();
            let sdk_range = if v3 {
                let min = signer.read_u32::<LittleEndian>()?;
                let max = signer.read_u32::<LittleEndian>()?;
                Some((min, max))
            } else {
                None
            };
            let mut signatures = vec![];
            let mut sigs = take_prefixed(&mut signer)?;
            while !sigs.is_empty() {
                let mut sig = take_prefixed(&mut sigs)?;
                let algorithm = sig.read_u32::<LittleEndian>()?;
                let signature = take_prefixed(&mut sig)?.to_vec();
                signatures.push(ApkSignature {
                    algorithm,
                    signature,
                });
            }
            let public_key = take_prefixed(&mut signer)?.to_vec();
            signers.push(ApkSigner {
                signed_data,
                sdk_range,
                signatures,
                public_key,
            });
        }
        Ok(Self { signers })
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        let mut buffer = vec![];
        for signer in &self.signers {
            let mut signer_buffer = vec![];
            write_prefixed(&mut signer_buffer, &signer.signed_data)?;
            if let Some((min, max)) = signer.sdk_range {
                signer_buffer.write_u32::<LittleEndian>(min)?;
                signer_buffer.write_u32::<LittleEndian>(max)?;
            }
            let mut sig_buffer = vec![];
            for sig in &signer.signatures {
                sig_buffer.write_u32::<LittleEndian>(sig.signature.len() as u32 + 8)?;
                sig_buffer.write_u32::<LittleEndian>(sig.algorithm)?;
                write_prefixed(&mut sig_buffer, &sig.signature)?;
            }
            write_prefixed(&mut signer_buffer, &sig_buffer)?;
            write_prefixed(&mut signer_buffer, &signer.public_key)?;
            write_prefixed(&mut buffer, &signer_buffer)?;
        }
        write_prefixed(w, &buffer)
    }
}

fn write_apk_signing_block<W: Write>(w: &mut W, pairs: &[(u32, Vec<u8>)]) -> Result<()> {
    let pairs_len: u64 = pairs.iter().map(|(_, v)| v.len() as u64 + 12).sum();
    let size = pairs_len + 24;
    w.write_u64::<LittleEndian>(size)?;
    for (id, value) in pairs {
        w.write_u64::<LittleEndian>(value.len() as u64 + 4)?;
        w.write_u32::<LittleEndian>(*id)?;
        w.write_all(value)?;
    }
    w.write_u64::<LittleEndian>(size)?;
    w.write_all(APK_SIGNING_BLOCK_MAGIC)?;
    Ok(())
}

/// Inserts a fresh signing block into the archive at `path`, replacing any existing one.
pub fn sign(path: &Path, signer: &Signer, options: &SignOptions) -> Result<()> {
    let apk = std::fs::read(path).with_context(|| format!("While reading {}", path.display()))?;
    let mut r = Cursor::new(&apk);
    let block = SigningBlock::parse(&mut r)?;
    if block.has_block() {
        tracing::debug!("replacing existing signing block ({} pairs)", block.pairs.len());
    }
    let zip_hash = compute_digest(&mut r, block.sb_start, block.cd_start, block.cde_start)?;

    let mut pairs = vec![];
    if options.v2 {
        let mut value = vec![];
        SchemeBlock::new(zip_hash, signer, false, options.v3)?.write(&mut value)?;
        pairs.push((APK_SIGNING_BLOCK_V2_ID, value));
    }
    if options.v3 {
        let mut value = vec![];
        SchemeBlock::new(zip_hash, signer, true, false)?.write(&mut value)?;
        pairs.push((APK_SIGNING_BLOCK_V3_ID, value));
    }
    let mut nblock = vec![];
    write_apk_signing_block(&mut nblock, &pairs)?;
    tracing::debug!("signing block: {} bytes, {} pairs", nblock.len(), pairs.len());

    let mut f = File::create(path)?;
    f.write_all(&apk[..(block.sb_start as usize)])?;
    f.write_all(&nblock)?;
    let cd_start = f.stream_position()?;
    f.write_all(&apk[(block.cd_start as usize)..(block.cde_start as usize)])?;
    let cde_start = f.stream_position()?;
    f.write_all(&apk[(block.cde_start as usize)..])?;
    f.seek(SeekFrom::Start(cde_start + 16))?;
    f.write_u32::<LittleEndian>(cd_start as u32)?;
    f.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_read_back_signed_data() {
        let data = SignedData {
            digests: vec![Digest::new([7; 32])],
            certificates: vec![vec![1, 2, 3]],
            sdk_range: Some((V3_MIN_SDK, V3_MAX_SDK)),
            additional_attributes: vec![(STRIPPING_PROTECTION_ATTR_ID, vec![3, 0, 0, 0])],
        };
        let mut bytes = vec![];
        data.write(&mut bytes).unwrap();
        assert_eq!(SignedData::read(&bytes, true).unwrap(), data);
    }

    #[test]
    fn should_reject_truncated_prefixes() {
        let mut buf: &[u8] = &[10, 0, 0, 0, 1, 2];
        assert!(take_prefixed(&mut buf).is_err());
    }

    #[test]
    fn should_frame_block_with_matching_sizes() {
        let pairs = vec![(APK_SIGNING_BLOCK_V2_ID, vec![0; 5])];
        let mut block = vec![];
        write_apk_signing_block(&mut block, &pairs).unwrap();
        let size = u64::from_le_bytes(block[..8].try_into().unwrap());
        assert_eq!(size as usize, block.len() - 8);
        assert!(block.ends_with(APK_SIGNING_BLOCK_MAGIC));
        let footer = &block[block.len() - 24..block.len() - 16];
        assert_eq!(u64::from_le_bytes(footer.try_into().unwrap()), size);
    }
}
