/// PKG entry payloads: key material, license blobs, PlayGo defaults and
/// the entry-name table.
use std::path::PathBuf;

use anyhow::Result;

use crate::pkg_lib::crypto::{self, FAKE_PFS_KEYSET};
use crate::pkg_lib::desc::{ContentType, EntryId, MetaEntry};

pub const ENTRY_KEYS_SIZE: u64 = 0x800;
pub const IMAGE_KEY_SIZE: u64 = 0x100;
pub const GENERAL_DIGESTS_SIZE: u64 = 0x180;
pub const LICENSE_DAT_SIZE: u64 = 0x400;
pub const LICENSE_INFO_SIZE: u64 = 0x200;
pub const PS_RESERVED_SIZE: u64 = 0x2000;
pub const PLAYGO_CHUNK_DAT_SIZE: u64 = 0x4000;
pub const ENTRY_KEY_COUNT: u32 = 7;

/// Where an entry's bytes come from at body-write time.
pub enum EntryData {
    Bytes(Vec<u8>),
    /// Staged file streamed from disk
    File(PathBuf, u64),
    Zeros(u64),
}

impl EntryData {
    pub fn size(&self) -> u64 {
        match self {
            EntryData::Bytes(b) => b.len() as u64,
            EntryData::File(_, size) => *size,
            EntryData::Zeros(n) => *n,
        }
    }
}

pub struct PkgEntry {
    pub id: EntryId,
    pub meta: MetaEntry,
    pub data: EntryData,
}

/// The EntryNames table: NUL-terminated names, offset 0 reserved for the
/// empty name used by unnamed entries.
pub struct EntryNames {
    blob: Vec<u8>,
}

impl EntryNames {
    pub fn new() -> Self {
        Self { blob: vec![0] }
    }

    pub fn add(&mut self, name: &str) -> u32 {
        let offset = self.blob.len() as u32;
        self.blob.extend_from_slice(name.as_bytes());
        self.blob.push(0);
        offset
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.blob
    }

    pub fn len(&self) -> u64 {
        self.blob.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.blob.len() <= 1
    }
}

impl Default for EntryNames {
    fn default() -> Self {
        Self::new()
    }
}

/// EntryKeys: content digest, one digest per derived key, then each key
/// wrapped under the keyset. 0x800 bytes.
pub fn entry_keys_blob(content_id: &str, passcode: &str) -> Result<Vec<u8>> {
    let mut blob = vec![0u8; ENTRY_KEYS_SIZE as usize];
    let mut cid = [0u8; 48];
    cid[..content_id.len()].copy_from_slice(content_id.as_bytes());
    blob[0..32].copy_from_slice(&crypto::sha256(&cid));
    for k in 0..ENTRY_KEY_COUNT {
        let key = crypto::compute_keys(content_id, passcode, k)?;
        let off = 32 + 32 * k as usize;
        blob[off..off + 32].copy_from_slice(&crypto::sha256(&key));
        let material = [content_id.as_bytes(), &k.to_le_bytes()].concat();
        let wrapped = crypto::rsa2048_encrypt_key(&FAKE_PFS_KEYSET, &key, &material)?;
        let woff = 0x100 + 0x100 * k as usize;
        blob[woff..woff + wrapped.len()].copy_from_slice(&wrapped);
    }
    Ok(blob)
}

/// ImageKey: the EKPFS wrapped under the keyset, 0x100 bytes.
pub fn image_key_blob(ekpfs: &[u8; 32], content_id: &str, seed: &[u8; 16]) -> Result<Vec<u8>> {
    let material = [content_id.as_bytes(), &seed[..]].concat();
    let mut wrapped = crypto::rsa2048_encrypt_key(&FAKE_PFS_KEYSET, ekpfs, &material)?;
    wrapped.resize(IMAGE_KEY_SIZE as usize, 0);
    Ok(wrapped)
}

fn license_fields(
    out: &mut [u8],
    magic: &[u8; 4],
    content_id: &str,
    content_type: ContentType,
    entitlement_key: Option<[u8; 16]>,
) {
    out[0..4].copy_from_slice(magic);
    out[4..8].copy_from_slice(&1u32.to_le_bytes());
    out[8..12].copy_from_slice(&u32::from(content_type).to_le_bytes());
    out[0x10..0x10 + content_id.len()].copy_from_slice(content_id.as_bytes());
    if let Some(ek) = entitlement_key {
        out[0x40..0x50].copy_from_slice(&ek);
    }
    let digest = crypto::sha256(&out[0..0x60]);
    out[0x60..0x80].copy_from_slice(&digest);
}

/// license.dat blob, 0x400 bytes
pub fn license_dat(
    content_id: &str,
    content_type: ContentType,
    entitlement_key: Option<[u8; 16]>,
) -> Vec<u8> {
    let mut out = vec![0u8; LICENSE_DAT_SIZE as usize];
    license_fields(&mut out, b"\x7Flic", content_id, content_type, entitlement_key);
    out
}

/// license.info blob, padded to exactly 0x200 bytes
pub fn license_info(
    content_id: &str,
    content_type: ContentType,
    entitlement_key: Option<[u8; 16]>,
) -> Vec<u8> {
    let mut out = vec![0u8; LICENSE_INFO_SIZE as usize];
    license_fields(&mut out, b"\x7Fnfo", content_id, content_type, entitlement_key);
    out
}

/// Minimal single-chunk playgo-chunk.dat used when the project does not
/// stage one.
pub fn default_playgo_chunk_dat() -> Vec<u8> {
    let mut out = vec![0u8; PLAYGO_CHUNK_DAT_SIZE as usize];
    out[0..4].copy_from_slice(b"plgo");
    out[4..6].copy_from_slice(&1u16.to_le_bytes()); // version major
    out[8..10].copy_from_slice(&1u16.to_le_bytes()); // image count
    out[10..12].copy_from_slice(&1u16.to_le_bytes()); // chunk count
    out[12..14].copy_from_slice(&1u16.to_le_bytes()); // mchunk count
    out[14..16].copy_from_slice(&1u16.to_le_bytes()); // scenario count
    out[0x10..0x14].copy_from_slice(&(PLAYGO_CHUNK_DAT_SIZE as u32).to_le_bytes());
    out
}

/// Default playgo-manifest.xml for a single-chunk package
pub fn default_playgo_manifest(content_id: &str) -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <psproject fmt=\"playgo-manifest\" version=\"1000\">\n\
         \x20 <volume content_id=\"{}\">\n\
         \x20   <chunk_info chunk_count=\"1\" scenario_count=\"1\">\n\
         \x20     <chunks supported_languages=\"\">\n\
         \x20       <chunk id=\"0\" label=\"Chunk #0\"/>\n\
         \x20     </chunks>\n\
         \x20     <scenarios default_id=\"0\">\n\
         \x20       <scenario id=\"0\" type=\"sp\" initial_chunk_count=\"1\" label=\"Scenario #0\">0</scenario>\n\
         \x20     </scenarios>\n\
         \x20   </chunk_info>\n\
         \x20 </volume>\n\
         </psproject>\n",
        content_id
    )
    .into_bytes()
}
