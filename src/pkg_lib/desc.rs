// see: https://www.psdevwiki.com/ps4/PFS and https://www.psdevwiki.com/ps4/Package_Files
#![allow(dead_code)]

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::pkg_lib::utils::{BeReader, BeWriter};
use crate::pkg_lib::{DIRECT_BLOCKS, SIG_ENTRY_SIZE};

/*
 * PFS image constants
 */
pub const PFS_VERSION: u64 = 1;
pub const PFS_MAGIC: u64 = 20130315;

/*
 * PFS header mode bits
 */
pub const PFS_MODE_SIGNED: u16 = 0x0001;
pub const PFS_MODE_64BIT: u16 = 0x0002;
pub const PFS_MODE_ENCRYPTED: u16 = 0x0004;
pub const PFS_MODE_ALWAYS: u16 = 0x0008 /* set on every authored image */;

/*
 * Fixed offsets inside block 0 of a PFS image
 */
pub const PFS_HEADER_IBS_OFFSET: u64 = 0x54  /* embedded InodeBlockSig dinode */;
pub const PFS_SEED_OFFSET: u64 = 0x370;
pub const PFS_HEADER_SIG_OFFSET: u64 = 0x380 /* HMAC of the signed header region */;
pub const PFS_HEADER_SIG_SIZE: u64 = 0x5A0   /* length of the signed header region */;

/*
 * Inode mode and flag bits
 */
pub const PFS_INO_MODE_DIR: u16 = 0o040555;
pub const PFS_INO_MODE_FILE: u16 = 0o100555;

pub const PFS_INO_RDONLY: u32 = 0x00000001;
pub const PFS_INO_COMPRESSED: u32 = 0x00000002;
pub const PFS_INO_INTERNAL: u32 = 0x00000010   /* fpt / collision resolver / uroot */;
/* both bits are set on every inode of a signed image */
pub const PFS_INO_SIGNED_PAIR: u32 = 0x10000000 | 0x20000000;

/// Offset of the block pointer (+signature) table inside any dinode variant
pub const DINODE_BLOCK_TABLE_OFFSET: u64 = 0x64;
/// Pointer+signature slots in a dinode: 12 direct, 1 indirect, 1 double-indirect
pub const DINODE_BLOCK_SLOTS: usize = DIRECT_BLOCKS + 2;

const DINODE_SIG_AREA: usize = DINODE_BLOCK_SLOTS * SIG_ENTRY_SIZE as usize;

/*
 * Signed dinode: each of the 14 slots is a 36-byte pair of
 * HMAC-SHA256 (32 bytes) followed by the block index (4 bytes).
 * The pairs are filled by the signing pass, not at layout time.
 */
#[derive(Debug, Clone)]
#[repr(C)]
pub struct DinodeS32 {
    /*000*/ pub mode: u16,           /* File mode */
    pub nlink: u16,                  /* Links count */
    pub flags: u32,                  /* Inode flags */
    /*008*/ pub size: i64,           /* Size in bytes */
    /*010*/ pub size_compressed: i64,
    /*018*/ pub atime: u64,
    /*020*/ pub mtime: u64,
    /*028*/ pub ctime: u64,
    /*030*/ pub birthtime: u64,
    /*038*/ pub mtime_nsec: u32,
    pub atime_nsec: u32,
    /*040*/ pub ctime_nsec: u32,
    pub birthtime_nsec: u32,
    /*048*/ pub uid: u32,
    pub gid: u32,
    /*050*/ pub spare: [u64; 2],
    /*060*/ pub blocks: u32,         /* 64 KiB data blocks */
    /*064*/ pub sig_area: [u8; DINODE_SIG_AREA],
    /*25C*/ pub pad: [u8; 100],
}

impl DinodeS32 {
    pub const SIZE_OF: usize = 0x2C0;
}

impl Default for DinodeS32 {
    fn default() -> Self {
        Self {
            mode: 0,
            nlink: 0,
            flags: 0,
            size: 0,
            size_compressed: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            birthtime: 0,
            mtime_nsec: 0,
            atime_nsec: 0,
            ctime_nsec: 0,
            birthtime_nsec: 0,
            uid: 0,
            gid: 0,
            spare: [0; 2],
            blocks: 0,
            sig_area: [0; DINODE_SIG_AREA],
            pad: [0; 100],
        }
    }
}

/*
 * Unsigned dinode: plain little-endian block pointers, -1 in unused slots.
 */
#[derive(Debug, Clone)]
#[repr(C)]
pub struct DinodeD32 {
    /*000*/ pub mode: u16,
    pub nlink: u16,
    pub flags: u32,
    /*008*/ pub size: i64,
    /*010*/ pub size_compressed: i64,
    /*018*/ pub atime: u64,
    /*020*/ pub mtime: u64,
    /*028*/ pub ctime: u64,
    /*030*/ pub birthtime: u64,
    /*038*/ pub mtime_nsec: u32,
    pub atime_nsec: u32,
    /*040*/ pub ctime_nsec: u32,
    pub birthtime_nsec: u32,
    /*048*/ pub uid: u32,
    pub gid: u32,
    /*050*/ pub spare: [u64; 2],
    /*060*/ pub blocks: u32,
    /*064*/ pub direct: [i32; DIRECT_BLOCKS], /* Pointers to data blocks */
    /*094*/ pub ib: [i32; 2],                 /* Single / double indirect */
    /*09C*/ pub pad: [u8; 12],
}

impl DinodeD32 {
    pub const SIZE_OF: usize = 0xA8;
}

impl Default for DinodeD32 {
    fn default() -> Self {
        Self {
            mode: 0,
            nlink: 0,
            flags: 0,
            size: 0,
            size_compressed: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            birthtime: 0,
            mtime_nsec: 0,
            atime_nsec: 0,
            ctime_nsec: 0,
            birthtime_nsec: 0,
            uid: 0,
            gid: 0,
            spare: [0; 2],
            blocks: 0,
            direct: [-1; DIRECT_BLOCKS],
            ib: [-1; 2],
            pad: [0; 12],
        }
    }
}

/*
 * Fixed leading fields of the PFS header (block 0). The embedded
 * InodeBlockSig dinode follows at PFS_HEADER_IBS_OFFSET and the seed
 * sits at PFS_SEED_OFFSET; both are emitted separately because their
 * placement is not naturally aligned.
 */
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct PfsHeaderRaw {
    /*00*/ pub version: u64, /* 1 */
    /*08*/ pub magic: u64,   /* 20130315 */
    /*10*/ pub id: u64,
    /*18*/ pub fmode: u8,
    pub clean: u8,
    pub ronly: u8,
    pub rsv: u8,
    /*1C*/ pub mode: u16,
    pub unk1: u16,
    /*20*/ pub block_size: u32, /* 0x10000 */
    pub n_backup: u32,
    /*28*/ pub n_block: u64,
    /*30*/ pub dinode_count: u64,
    /*38*/ pub nd_block: u64,
    /*40*/ pub dinode_block_count: u64,
    /*48*/ pub superroot_ino: u64,
}

/*
 * Directory entry, padded to 8 bytes. A record never crosses a 64 KiB
 * block boundary: the previous record's entsize is stretched instead.
 */
pub const DIRENT_HEADER_SIZE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum DirentType {
    File = 2,
    Directory = 3,
    Dot = 4,
    DotDot = 5,
}

#[derive(Debug, Clone)]
pub struct PfsDirent {
    pub ino: u32,
    pub dtype: DirentType,
    pub name: String,
}

impl PfsDirent {
    pub fn new(ino: u32, dtype: DirentType, name: &str) -> Self {
        Self {
            ino,
            dtype,
            name: name.to_string(),
        }
    }

    /// Serialized record size including 8-byte name padding
    pub fn entsize(&self) -> u64 {
        DIRENT_HEADER_SIZE + (self.name.len() as u64 + 7) / 8 * 8
    }

    /// Emit the record with an explicit entsize (stretched for the last
    /// record of a block)
    pub fn to_bytes_with_entsize(&self, entsize: u64) -> Vec<u8> {
        let mut buf = vec![0u8; entsize as usize];
        buf[0..4].copy_from_slice(&self.ino.to_le_bytes());
        buf[4..8].copy_from_slice(&u32::from(self.dtype).to_le_bytes());
        buf[8..12].copy_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&(entsize as u32).to_le_bytes());
        buf[16..16 + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_bytes_with_entsize(self.entsize())
    }
}

/*
 * PKG container constants
 */
pub const PKG_MAGIC: u32 = 0x7F434E54 /* "\x7F" "CNT" */;
pub const PKG_TYPE: u32 = 0x80000001;
pub const PKG_DRM_TYPE_PS4: u32 = 0xF;
pub const PKG_HEADER_SIZE: usize = 0x1000;
pub const PKG_SIGNATURE_OFFSET: u64 = 0x1000;
pub const PKG_SIGNATURE_SIZE: usize = 0x100;
pub const PKG_HEADER_DIGEST_OFFSET: u64 = 0xFE0;
pub const PKG_SC_ENTRY_COUNT: u16 = 5;

pub const PKG_PFS_FLAGS_OLD: u64 = 0x8000_0000_0000_03CC;
pub const PKG_PFS_FLAGS_NEW: u64 = 0xA000_0000_0000_03CC;
pub const PKG_PFS_SIGNED_SIZE: u32 = 0x10000;
pub const PKG_PFS_CACHE_SIZE: u32 = 0xD0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ContentType {
    Gd = 0x1A,
    Dp = 0x1B,
    Ac = 0x1C,
    Al = 0x1D,
}

/*
 * Entry identifiers. Entries with id >= ParamSfo carry a name in the
 * EntryNames table.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EntryId {
    EntryKeys = 0x0001,
    ImageKey = 0x0010,
    GeneralDigests = 0x0020,
    Metas = 0x0100,
    Digests = 0x0200,
    EntryNames = 0x0400,
    LicenseDat = 0x0A00,
    LicenseInfo = 0x0A80,
    ParamSfo = 0x1000,
    PlaygoChunkDat = 0x1001,
    PlaygoChunkSha = 0x1002,
    PlaygoManifestXml = 0x1003,
    PronunciationXml = 0x1004,
    PronunciationSig = 0x1005,
    Pic1Png = 0x1006,
    PubtoolinfoDat = 0x1008,
    Icon0Png = 0x1200,
    Pic0Png = 0x1220,
    Snd0At9 = 0x1240,
    ChangeinfoXml = 0x1260,
    Trophy00Trp = 0x1280,
    Keystone = 0x12A0,
    ShareparamJson = 0x12C0,
    PsReservedDat = 0x1400,
}

impl EntryId {
    pub fn has_name(self) -> bool {
        u32::from(self) >= u32::from(EntryId::ParamSfo)
    }

    /// Staged `sce_sys/` path for file-backed entries
    pub fn from_sce_sys_name(name: &str) -> Option<EntryId> {
        Some(match name {
            "param.sfo" => EntryId::ParamSfo,
            "playgo-chunk.dat" => EntryId::PlaygoChunkDat,
            "playgo-chunk.sha" => EntryId::PlaygoChunkSha,
            "playgo-manifest.xml" => EntryId::PlaygoManifestXml,
            "pronunciation.xml" => EntryId::PronunciationXml,
            "pronunciation.sig" => EntryId::PronunciationSig,
            "pic1.png" => EntryId::Pic1Png,
            "pubtoolinfo.dat" => EntryId::PubtoolinfoDat,
            "icon0.png" => EntryId::Icon0Png,
            "pic0.png" => EntryId::Pic0Png,
            "snd0.at9" => EntryId::Snd0At9,
            "changeinfo/changeinfo.xml" => EntryId::ChangeinfoXml,
            "trophy/trophy00.trp" => EntryId::Trophy00Trp,
            "keystone" => EntryId::Keystone,
            "shareparam.json" => EntryId::ShareparamJson,
            "psreserved.dat" => EntryId::PsReservedDat,
            _ => return None,
        })
    }

    pub fn entry_name(self) -> &'static str {
        match self {
            EntryId::ParamSfo => "param.sfo",
            EntryId::PlaygoChunkDat => "playgo-chunk.dat",
            EntryId::PlaygoChunkSha => "playgo-chunk.sha",
            EntryId::PlaygoManifestXml => "playgo-manifest.xml",
            EntryId::PronunciationXml => "pronunciation.xml",
            EntryId::PronunciationSig => "pronunciation.sig",
            EntryId::Pic1Png => "pic1.png",
            EntryId::PubtoolinfoDat => "pubtoolinfo.dat",
            EntryId::Icon0Png => "icon0.png",
            EntryId::Pic0Png => "pic0.png",
            EntryId::Snd0At9 => "snd0.at9",
            EntryId::ChangeinfoXml => "changeinfo/changeinfo.xml",
            EntryId::Trophy00Trp => "trophy/trophy00.trp",
            EntryId::Keystone => "keystone",
            EntryId::ShareparamJson => "shareparam.json",
            EntryId::PsReservedDat => "psreserved.dat",
            _ => "",
        }
    }

    /// Canonical placement rank for `sce_sys` file entries; unknown names
    /// sort to 999
    pub fn sort_key(self) -> u32 {
        const CANONICAL: &[EntryId] = &[
            EntryId::ParamSfo,
            EntryId::PlaygoChunkDat,
            EntryId::PlaygoChunkSha,
            EntryId::PlaygoManifestXml,
            EntryId::PronunciationXml,
            EntryId::PronunciationSig,
            EntryId::Pic1Png,
            EntryId::PubtoolinfoDat,
            EntryId::Icon0Png,
            EntryId::Pic0Png,
            EntryId::Snd0At9,
            EntryId::ChangeinfoXml,
            EntryId::Trophy00Trp,
            EntryId::Keystone,
            EntryId::ShareparamJson,
        ];
        CANONICAL
            .iter()
            .position(|&id| id == self)
            .map(|p| p as u32)
            .unwrap_or(999)
    }

    /// Flag words recorded in the meta table. The high nibble of flags1
    /// marks encryption-capable entries; flags2 carries the key index.
    pub fn meta_flags(self) -> (u32, u32) {
        match self {
            EntryId::EntryKeys => (0x4000_0000, 0),
            EntryId::ImageKey => (0xE000_0000, 0x2000_0000),
            EntryId::GeneralDigests => (0x6000_0000, 0),
            EntryId::Metas => (0x6000_0000, 0),
            EntryId::Digests => (0x4000_0000, 0),
            EntryId::EntryNames => (0x4000_0000, 0),
            EntryId::LicenseDat => (0x8000_0000, 0x2000_0000),
            EntryId::LicenseInfo => (0x8000_0000, 0x1000_0000),
            _ => (0x0000_0000, 0),
        }
    }
}

/*
 * One 32-byte record of the Metas entry, big-endian.
 */
pub const META_ENTRY_SIZE: u64 = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaEntry {
    pub id: u32,
    pub name_table_offset: u32,
    pub flags1: u32,
    pub flags2: u32,
    pub data_offset: u32,
    pub data_size: u32,
}

impl MetaEntry {
    pub fn to_bytes(&self) -> [u8; META_ENTRY_SIZE as usize] {
        let mut buf = [0u8; META_ENTRY_SIZE as usize];
        BeWriter::new(&mut buf)
            .u32(self.id)
            .u32(self.name_table_offset)
            .u32(self.flags1)
            .u32(self.flags2)
            .u32(self.data_offset)
            .u32(self.data_size);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut r = BeReader::new(buf);
        Self {
            id: r.u32(),
            name_table_offset: r.u32(),
            flags1: r.u32(),
            flags2: r.u32(),
            data_offset: r.u32(),
            data_size: r.u32(),
        }
    }
}

/*
 * PKG container header, big-endian, 0x1000 bytes on disk followed by the
 * 0x100-byte RSA signature.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgHeader {
    pub pkg_type: u32,
    pub pkg_0x008: u32,
    pub file_count: u32,
    pub entry_count: u32,
    pub sc_entry_count: u16,
    pub entry_count_2: u16,
    pub entry_table_offset: u32,
    pub main_ent_data_size: u32,
    pub body_offset: u64,
    pub body_size: u64,
    pub content_offset: u64,
    pub content_size: u64,
    pub content_id: [u8; 36],
    pub drm_type: u32,
    pub content_type: u32,
    pub content_flags: u32,
    pub promote_size: u32,
    pub version_date: u32,
    pub version_hash: u32,
    pub iro_tag: u32,
    pub ekc_version: u32,
    pub sc_entries1_hash: [u8; 32],
    pub sc_entries2_hash: [u8; 32],
    pub digest_table_hash: [u8; 32],
    pub body_digest: [u8; 32],
    pub pkg_0x400: u32,
    pub pfs_image_count: u32,
    pub pfs_flags: u64,
    pub pfs_image_offset: u64,
    pub pfs_image_size: u64,
    pub mount_image_offset: u64,
    pub mount_image_size: u64,
    pub package_size: u64,
    pub pfs_signed_size: u32,
    pub pfs_cache_size: u32,
    pub pfs_image_digest: [u8; 32],
    pub pfs_signed_digest: [u8; 32],
    pub pfs_split_size_nth_0: u64,
    pub pfs_split_size_nth_1: u64,
    pub header_digest: [u8; 32],
}

impl Default for PkgHeader {
    fn default() -> Self {
        Self {
            pkg_type: 0,
            pkg_0x008: 0,
            file_count: 0,
            entry_count: 0,
            sc_entry_count: 0,
            entry_count_2: 0,
            entry_table_offset: 0,
            main_ent_data_size: 0,
            body_offset: 0,
            body_size: 0,
            content_offset: 0,
            content_size: 0,
            content_id: [0; 36],
            drm_type: 0,
            content_type: 0,
            content_flags: 0,
            promote_size: 0,
            version_date: 0,
            version_hash: 0,
            iro_tag: 0,
            ekc_version: 0,
            sc_entries1_hash: [0; 32],
            sc_entries2_hash: [0; 32],
            digest_table_hash: [0; 32],
            body_digest: [0; 32],
            pkg_0x400: 0,
            pfs_image_count: 0,
            pfs_flags: 0,
            pfs_image_offset: 0,
            pfs_image_size: 0,
            mount_image_offset: 0,
            mount_image_size: 0,
            package_size: 0,
            pfs_signed_size: 0,
            pfs_cache_size: 0,
            pfs_image_digest: [0; 32],
            pfs_signed_digest: [0; 32],
            pfs_split_size_nth_0: 0,
            pfs_split_size_nth_1: 0,
            header_digest: [0; 32],
        }
    }
}

impl PkgHeader {
    pub fn to_bytes(&self) -> [u8; PKG_HEADER_SIZE] {
        let mut buf = [0u8; PKG_HEADER_SIZE];
        let mut w = BeWriter::new(&mut buf);
        w.u32(PKG_MAGIC)
            .u32(self.pkg_type)
            .u32(self.pkg_0x008)
            .u32(self.file_count)
            .u32(self.entry_count)
            .u16(self.sc_entry_count)
            .u16(self.entry_count_2)
            .u32(self.entry_table_offset)
            .u32(self.main_ent_data_size)
            .u64(self.body_offset)
            .u64(self.body_size)
            .u64(self.content_offset)
            .u64(self.content_size);
        w.seek(0x40).bytes(&self.content_id);
        w.seek(0x70)
            .u32(self.drm_type)
            .u32(self.content_type)
            .u32(self.content_flags)
            .u32(self.promote_size)
            .u32(self.version_date)
            .u32(self.version_hash)
            .u32(self.iro_tag)
            .u32(self.ekc_version);
        w.seek(0x100)
            .bytes(&self.sc_entries1_hash)
            .bytes(&self.sc_entries2_hash)
            .bytes(&self.digest_table_hash)
            .bytes(&self.body_digest);
        w.seek(0x400)
            .u32(self.pkg_0x400)
            .u32(self.pfs_image_count)
            .u64(self.pfs_flags)
            .u64(self.pfs_image_offset)
            .u64(self.pfs_image_size)
            .u64(self.mount_image_offset)
            .u64(self.mount_image_size)
            .u64(self.package_size)
            .u32(self.pfs_signed_size)
            .u32(self.pfs_cache_size)
            .bytes(&self.pfs_image_digest)
            .bytes(&self.pfs_signed_digest)
            .u64(self.pfs_split_size_nth_0)
            .u64(self.pfs_split_size_nth_1);
        w.seek(PKG_HEADER_DIGEST_OFFSET as usize)
            .bytes(&self.header_digest);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Self> {
        let mut r = BeReader::new(buf);
        let magic = r.u32();
        if magic != PKG_MAGIC {
            return Err(anyhow::anyhow!("bad PKG magic {:#x}", magic));
        }
        let mut hdr = Self {
            pkg_type: r.u32(),
            pkg_0x008: r.u32(),
            file_count: r.u32(),
            entry_count: r.u32(),
            sc_entry_count: r.u16(),
            entry_count_2: r.u16(),
            entry_table_offset: r.u32(),
            main_ent_data_size: r.u32(),
            body_offset: r.u64(),
            body_size: r.u64(),
            content_offset: r.u64(),
            content_size: r.u64(),
            ..Default::default()
        };
        hdr.content_id = r.seek(0x40).bytes();
        r.seek(0x70);
        hdr.drm_type = r.u32();
        hdr.content_type = r.u32();
        hdr.content_flags = r.u32();
        hdr.promote_size = r.u32();
        hdr.version_date = r.u32();
        hdr.version_hash = r.u32();
        hdr.iro_tag = r.u32();
        hdr.ekc_version = r.u32();
        r.seek(0x100);
        hdr.sc_entries1_hash = r.bytes();
        hdr.sc_entries2_hash = r.bytes();
        hdr.digest_table_hash = r.bytes();
        hdr.body_digest = r.bytes();
        r.seek(0x400);
        hdr.pkg_0x400 = r.u32();
        hdr.pfs_image_count = r.u32();
        hdr.pfs_flags = r.u64();
        hdr.pfs_image_offset = r.u64();
        hdr.pfs_image_size = r.u64();
        hdr.mount_image_offset = r.u64();
        hdr.mount_image_size = r.u64();
        hdr.package_size = r.u64();
        hdr.pfs_signed_size = r.u32();
        hdr.pfs_cache_size = r.u32();
        hdr.pfs_image_digest = r.bytes();
        hdr.pfs_signed_digest = r.bytes();
        hdr.pfs_split_size_nth_0 = r.u64();
        hdr.pfs_split_size_nth_1 = r.u64();
        hdr.header_digest = r.seek(PKG_HEADER_DIGEST_OFFSET as usize).bytes();
        Ok(hdr)
    }
}
