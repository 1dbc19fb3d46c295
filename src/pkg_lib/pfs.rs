/// PFS image builder: inode allocation, block layout, dirent emission,
/// signing plan and XTS encryption plan.
use std::io;

use anyhow::{anyhow, Context, Result};
use hmac::Mac;
use log::*;
use out_sink::OutSink;
use rayon::prelude::*;

use crate::pkg_lib::crypto::{self, HmacSha256, XtsSector};
use crate::pkg_lib::desc::*;
use crate::pkg_lib::fpt::FlatPathTable;
use crate::pkg_lib::tree::{FsNode, NodeKind, StagingTree, UROOT};
use crate::pkg_lib::utils::{div_ceil, serialize_row};
use crate::pkg_lib::{
    BuildError, DIRECT_BLOCKS, PARALLEL_WORKERS, PFS_BLOCK_SIZE, PTRS_PER_BLOCK, SIGS_PER_BLOCK,
    SIG_ENTRY_SIZE, XTS_SECTORS_PER_BLOCK, XTS_SECTOR_SIZE,
};

/// Options resolved by the orchestrator before the build starts.
#[derive(Debug, Clone)]
pub struct PfsProperties {
    pub signed: bool,
    pub encrypted: bool,
    pub new_crypt: bool,
    pub seed: [u8; 16],
    pub ekpfs: [u8; 32],
    pub min_blocks: u64,
    pub file_time: u64,
}

impl PfsProperties {
    /// Inner image: plain unsigned filesystem carrying the staged tree
    pub fn plain(ekpfs: [u8; 32], file_time: u64, min_blocks: u64) -> Self {
        Self {
            signed: false,
            encrypted: false,
            new_crypt: false,
            seed: [0; 16],
            ekpfs,
            min_blocks,
            file_time,
        }
    }
}

/// One planned signature: HMAC over `size` bytes of `block`, stored as a
/// 36-byte (digest, block index) pair at `sig_offset` in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSigInfo {
    pub block: u32,
    pub sig_offset: u64,
    pub size: u64,
}

/// In-memory inode; serialized as DinodeS32 or DinodeD32 depending on mode.
#[derive(Debug, Clone)]
pub struct Inode {
    pub number: u32,
    pub mode: u16,
    pub flags: u32,
    pub size: u64,
    pub size_compressed: u64,
    pub blocks: u32,
    pub nlink: u16,
    pub time: u64,
    /// Data block numbers; -1 marks an unused slot
    pub direct: [i64; DIRECT_BLOCKS],
    pub ib: [i64; 2],
}

impl Inode {
    fn new(number: u32, mode: u16, flags: u32, time: u64) -> Self {
        Self {
            number,
            mode,
            flags,
            size: 0,
            size_compressed: 0,
            blocks: 0,
            nlink: 1,
            time,
            direct: [-1; DIRECT_BLOCKS],
            ib: [-1; 2],
        }
    }

    /// Signed on-disk form. The pointer+signature area stays zero here;
    /// the signing pass writes both halves of every pair.
    pub fn to_s32(&self) -> DinodeS32 {
        DinodeS32 {
            mode: self.mode,
            nlink: self.nlink,
            flags: self.flags | PFS_INO_SIGNED_PAIR,
            size: self.size as i64,
            size_compressed: self.size_compressed as i64,
            atime: self.time,
            mtime: self.time,
            ctime: self.time,
            birthtime: self.time,
            blocks: self.blocks,
            ..Default::default()
        }
    }

    pub fn to_d32(&self) -> DinodeD32 {
        let mut d = DinodeD32 {
            mode: self.mode,
            nlink: self.nlink,
            flags: self.flags,
            size: self.size as i64,
            size_compressed: self.size_compressed as i64,
            atime: self.time,
            mtime: self.time,
            ctime: self.time,
            birthtime: self.time,
            blocks: self.blocks,
            ..Default::default()
        };
        for (i, v) in self.direct.iter().enumerate() {
            d.direct[i] = *v as i32;
        }
        d.ib[0] = self.ib[0] as i32;
        d.ib[1] = self.ib[1] as i32;
        d
    }
}

enum Payload {
    /// Precomputed bytes: directory dirent streams, collision resolver
    Bytes(Vec<u8>),
    /// Staged file streamed through its writer callback; files without a
    /// writer only reserve blocks (the orchestrator fills them later)
    File(usize),
}

struct LayoutNode {
    ino: usize,
    payload: Payload,
    start_block: u64,
    blocks: u64,
    /// Indirect blocks consumed by this node: [ib0, dind, l2...]
    ind_blocks: Vec<u64>,
}

pub struct PfsBuilder {
    props: PfsProperties,
    tree: StagingTree,
    inodes: Vec<Inode>,
    super_root_dirents: Vec<PfsDirent>,
    super_root_block: u64,
    fpt_bytes: Vec<u8>,
    fpt_start_block: u64,
    has_collision: bool,
    /// Unsigned images place the resolver in the post-FPT slot
    cr_pending: Option<(usize, Vec<u8>)>,
    dinode_block_count: u64,
    empty_block: Option<u64>,
    total_blocks: u64,
    nodes: Vec<LayoutNode>,
    data_sigs: Vec<BlockSigInfo>,
    /// Processed last-pushed-first so covering signatures see their
    /// covered content already in place
    final_sigs: Vec<BlockSigInfo>,
}

impl PfsBuilder {
    /// Run setup and block layout. Both are pure planning: nothing is
    /// written until [`PfsBuilder::write_image`].
    pub fn new(props: PfsProperties, tree: StagingTree) -> Result<Self> {
        let mut builder = Self {
            props,
            tree,
            inodes: vec![],
            super_root_dirents: vec![],
            super_root_block: 0,
            fpt_bytes: vec![],
            fpt_start_block: 0,
            has_collision: false,
            cr_pending: None,
            dinode_block_count: 0,
            empty_block: None,
            total_blocks: 0,
            nodes: vec![],
            data_sigs: vec![],
            final_sigs: vec![],
        };
        builder.setup()?;
        builder.layout()?;
        Ok(builder)
    }

    pub fn block_size(&self) -> u64 {
        PFS_BLOCK_SIZE
    }

    fn dinode_size(&self) -> u64 {
        if self.props.signed {
            DinodeS32::SIZE_OF as u64
        } else {
            DinodeD32::SIZE_OF as u64
        }
    }

    fn inodes_per_block(&self) -> u64 {
        self.block_size() / self.dinode_size()
    }

    /// Absolute image offset of inode `ino`'s record
    fn inode_offset(&self, ino: usize) -> u64 {
        let ipb = self.inodes_per_block();
        let bs = self.block_size();
        (1 + ino as u64 / ipb) * bs + (ino as u64 % ipb) * self.dinode_size()
    }

    /// Absolute image offset of pointer+signature slot `slot` of inode `ino`
    fn inode_sig_offset(&self, ino: usize, slot: usize) -> u64 {
        self.inode_offset(ino) + DINODE_BLOCK_TABLE_OFFSET + SIG_ENTRY_SIZE * slot as u64
    }

    pub fn image_size(&self) -> u64 {
        self.total_blocks * self.block_size()
    }

    pub fn empty_block(&self) -> Option<u64> {
        self.empty_block
    }

    pub fn has_collision(&self) -> bool {
        self.has_collision
    }

    pub fn inodes(&self) -> &[Inode] {
        &self.inodes
    }

    pub fn data_sigs(&self) -> &[BlockSigInfo] {
        &self.data_sigs
    }

    pub fn final_sigs(&self) -> &[BlockSigInfo] {
        &self.final_sigs
    }

    pub fn seed(&self) -> &[u8; 16] {
        &self.props.seed
    }

    /// Start block of a laid-out file, by full path (e.g. "/pfs_image.dat")
    pub fn file_start_block(&self, path: &str) -> Option<u64> {
        self.nodes.iter().find_map(|n| match n.payload {
            Payload::File(idx) => (self.tree.full_path(idx) == path).then_some(n.start_block),
            _ => None,
        })
    }

    // ---- setup ----

    fn setup(&mut self) -> Result<()> {
        let bs = self.block_size();
        let time = self.props.file_time;
        let dirs = self.tree.dirs_ordinal();
        let files = self.tree.files_shallow_last();

        // inode 0: super-root
        let mut sroot = Inode::new(0, PFS_INO_MODE_DIR, PFS_INO_INTERNAL | PFS_INO_RDONLY, time);
        sroot.size = bs;
        sroot.blocks = 1;
        self.inodes.push(sroot);
        // inode 1: flat_path_table (sized once the table is built)
        self.inodes.push(Inode::new(
            1,
            PFS_INO_MODE_FILE,
            PFS_INO_INTERNAL | PFS_INO_RDONLY,
            time,
        ));

        // the collision scan runs before any user inode numbers are handed
        // out: the resolver, when needed, must take inode 2
        let probe: Vec<(String, u32)> = dirs
            .iter()
            .chain(files.iter())
            .map(|&i| (self.tree.full_path(i), 0))
            .collect();
        let (probe_fpt, _) = FlatPathTable::build(&probe);
        self.has_collision = probe_fpt.has_collision();

        let cr_ino = if self.has_collision {
            self.inodes.push(Inode::new(
                2,
                PFS_INO_MODE_FILE,
                PFS_INO_INTERNAL | PFS_INO_RDONLY,
                time,
            ));
            Some(2u32)
        } else {
            None
        };

        // uroot
        let uroot_ino = self.inodes.len() as u32;
        let mut uroot = Inode::new(uroot_ino, PFS_INO_MODE_DIR, PFS_INO_RDONLY, time);
        uroot.nlink = 2;
        self.inodes.push(uroot);
        self.tree.node_mut(UROOT).inode = uroot_ino;
        self.inodes[0].nlink += 1;

        // super-root dirents: flat_path_table [, collision_resolver], uroot
        self.super_root_dirents
            .push(PfsDirent::new(1, DirentType::File, "flat_path_table"));
        if let Some(cr) = cr_ino {
            self.super_root_dirents
                .push(PfsDirent::new(cr, DirentType::File, "collision_resolver"));
        }
        self.super_root_dirents
            .push(PfsDirent::new(uroot_ino, DirentType::Directory, "uroot"));

        // directory inodes in ordinal order; each one registers with its
        // parent and bumps the parent's nlink
        let mut dirent_lists: Vec<Vec<PfsDirent>> = vec![vec![]; self.tree.len()];
        dirent_lists[UROOT] = vec![
            PfsDirent::new(uroot_ino, DirentType::Dot, "."),
            PfsDirent::new(0, DirentType::DotDot, ".."),
        ];
        for &d in &dirs {
            let ino = self.inodes.len() as u32;
            self.tree.node_mut(d).inode = ino;
            let mut inode = Inode::new(ino, PFS_INO_MODE_DIR, PFS_INO_RDONLY, time);
            inode.nlink = 2;
            self.inodes.push(inode);
            let parent = self.tree.node(d).parent.unwrap_or(UROOT);
            let parent_ino = self.tree.node(parent).inode;
            dirent_lists[d] = vec![
                PfsDirent::new(ino, DirentType::Dot, "."),
                PfsDirent::new(parent_ino, DirentType::DotDot, ".."),
            ];
            dirent_lists[parent].push(PfsDirent::new(
                ino,
                DirentType::Directory,
                &self.tree.node(d).name,
            ));
            self.inodes[parent_ino as usize].nlink += 1;
        }

        // file inodes in shallow-last order
        for &f in &files {
            let ino = self.inodes.len() as u32;
            self.tree.node_mut(f).inode = ino;
            let node = self.tree.node(f);
            let mut flags = PFS_INO_RDONLY;
            let mut size_compressed = node.size;
            if let NodeKind::File {
                compress,
                compressed_size,
            } = &node.kind
            {
                if *compress {
                    flags |= PFS_INO_COMPRESSED;
                }
                if let Some(cs) = compressed_size {
                    size_compressed = *cs;
                }
            }
            let mut inode = Inode::new(ino, PFS_INO_MODE_FILE, flags, time);
            inode.size = node.size;
            inode.size_compressed = size_compressed;
            inode.blocks = div_ceil(node.size, bs) as u32;
            self.inodes.push(inode);
            let parent = node.parent.unwrap_or(UROOT);
            let name = self.tree.node(f).name.clone();
            dirent_lists[parent].push(PfsDirent::new(ino, DirentType::File, &name));
        }

        // flat path table over the fully numbered tree
        let entries: Vec<(String, u32)> = dirs
            .iter()
            .chain(files.iter())
            .map(|&i| (self.tree.full_path(i), self.tree.node(i).inode))
            .collect();
        let (fpt, cr) = FlatPathTable::build(&entries);
        self.fpt_bytes = fpt.into_bytes();
        self.inodes[1].size = self.fpt_bytes.len() as u64;
        self.inodes[1].blocks = div_ceil(self.fpt_bytes.len() as u64, bs) as u32;
        if let (Some(cr_ino), Some(cr)) = (cr_ino, cr) {
            let bytes = cr.into_bytes();
            let ci = cr_ino as usize;
            self.inodes[ci].size = bytes.len() as u64;
            self.inodes[ci].blocks = div_ceil(bytes.len() as u64, bs) as u32;
            if self.props.signed {
                // resolver lays out as a leading data node
                self.nodes.push(LayoutNode {
                    ino: ci,
                    payload: Payload::Bytes(bytes),
                    start_block: 0,
                    blocks: self.inodes[ci].blocks as u64,
                    ind_blocks: vec![],
                });
            } else {
                self.cr_pending = Some((ci, bytes));
            }
        }

        // directory payloads freeze here: every dirent is known
        let ui = uroot_ino as usize;
        let uroot_bytes = dirents_to_blocks(&dirent_lists[UROOT], bs);
        self.inodes[ui].blocks = div_ceil(uroot_bytes.len() as u64, bs) as u32;
        self.inodes[ui].size = self.inodes[ui].blocks as u64 * bs;
        self.nodes.push(LayoutNode {
            ino: ui,
            payload: Payload::Bytes(uroot_bytes),
            start_block: 0,
            blocks: self.inodes[ui].blocks as u64,
            ind_blocks: vec![],
        });
        for &d in &dirs {
            let ino = self.tree.node(d).inode as usize;
            let bytes = dirents_to_blocks(&dirent_lists[d], bs);
            self.inodes[ino].blocks = div_ceil(bytes.len() as u64, bs) as u32;
            self.inodes[ino].size = self.inodes[ino].blocks as u64 * bs;
            self.nodes.push(LayoutNode {
                ino,
                payload: Payload::Bytes(bytes),
                start_block: 0,
                blocks: self.inodes[ino].blocks as u64,
                ind_blocks: vec![],
            });
        }
        for &f in &files {
            let ino = self.tree.node(f).inode as usize;
            self.nodes.push(LayoutNode {
                ino,
                payload: Payload::File(f),
                start_block: 0,
                blocks: self.inodes[ino].blocks as u64,
                ind_blocks: vec![],
            });
        }
        Ok(())
    }

    // ---- layout ----

    fn indirect_blocks_needed(&self, blocks: u64) -> Result<u64> {
        let per = if self.props.signed {
            SIGS_PER_BLOCK
        } else {
            PTRS_PER_BLOCK
        };
        let direct = DIRECT_BLOCKS as u64;
        if blocks <= direct {
            return Ok(0);
        }
        let rem = blocks - direct;
        if rem <= per {
            return Ok(1);
        }
        let l2 = div_ceil(rem - per, per);
        if l2 > per {
            return Err(anyhow!(BuildError::LayoutOverflow(format!(
                "{} blocks exceed two levels of indirection",
                blocks
            ))));
        }
        Ok(2 + l2)
    }

    fn layout(&mut self) -> Result<()> {
        let bs = self.block_size();
        let signed = self.props.signed;
        let mut ndblock: u64 = 0;

        // block 0: header; its signature covers the first 0x5A0 bytes
        if signed {
            self.final_sigs.push(BlockSigInfo {
                block: 0,
                sig_offset: PFS_HEADER_SIG_OFFSET,
                size: PFS_HEADER_SIG_SIZE,
            });
        }
        ndblock += 1;

        // inode blocks, referenced from the header InodeBlockSig slots
        let dinode_bytes = self.inodes.len() as u64 * self.dinode_size();
        self.dinode_block_count = div_ceil(dinode_bytes, bs);
        if self.dinode_block_count > DINODE_BLOCK_SLOTS as u64 {
            return Err(anyhow!(BuildError::LayoutOverflow(format!(
                "{} inode blocks exceed the header block table",
                self.dinode_block_count
            ))));
        }
        if signed {
            for i in 0..self.dinode_block_count {
                self.final_sigs.push(BlockSigInfo {
                    block: (1 + i) as u32,
                    sig_offset: PFS_HEADER_IBS_OFFSET
                        + DINODE_BLOCK_TABLE_OFFSET
                        + SIG_ENTRY_SIZE * i,
                    size: bs,
                });
            }
        }
        ndblock += self.dinode_block_count;

        // super-root data block
        self.super_root_block = ndblock;
        self.inodes[0].direct[0] = ndblock as i64;
        if signed {
            self.final_sigs.push(BlockSigInfo {
                block: ndblock as u32,
                sig_offset: self.inode_sig_offset(0, 0),
                size: bs,
            });
        }
        ndblock += 1;

        // flat path table blocks fill direct slots of inode 1
        let fpt_blocks = self.inodes[1].blocks as u64;
        if fpt_blocks > DIRECT_BLOCKS as u64 {
            return Err(anyhow!(BuildError::LayoutOverflow(format!(
                "flat path table needs {} blocks, only {} direct slots",
                fpt_blocks, DIRECT_BLOCKS
            ))));
        }
        self.fpt_start_block = ndblock;
        for s in 0..fpt_blocks {
            self.inodes[1].direct[s as usize] = ndblock as i64;
            if signed {
                self.final_sigs.push(BlockSigInfo {
                    block: ndblock as u32,
                    sig_offset: self.inode_sig_offset(1, s as usize),
                    size: bs,
                });
            }
            ndblock += 1;
        }

        // post-FPT slot: an unencrypted hole, except when the unsigned
        // resolver takes it
        if let Some((cr_ino, bytes)) = self.cr_pending.take() {
            let blocks = div_ceil(bytes.len() as u64, bs);
            if blocks > DIRECT_BLOCKS as u64 {
                return Err(anyhow!(BuildError::LayoutOverflow(
                    "collision resolver exceeds direct slots".to_string()
                )));
            }
            for i in 0..blocks {
                self.inodes[cr_ino].direct[i as usize] = (ndblock + i) as i64;
            }
            self.nodes.insert(
                0,
                LayoutNode {
                    ino: cr_ino,
                    payload: Payload::Bytes(bytes),
                    start_block: ndblock,
                    blocks,
                    ind_blocks: vec![],
                },
            );
            ndblock += blocks;
        } else {
            self.empty_block = Some(ndblock);
            ndblock += 1;
        }

        // reserve the indirect pool
        let mut total_ib = 0;
        for n in &self.nodes {
            if n.start_block != 0 {
                continue; // resolver already placed
            }
            total_ib += self.indirect_blocks_needed(n.blocks)?;
        }
        let mut ib_next = (ndblock, ndblock + total_ib);
        ndblock += total_ib;

        // data blocks per node
        for i in 0..self.nodes.len() {
            if self.nodes[i].start_block != 0 {
                continue;
            }
            ndblock = self.layout_node(i, ndblock, &mut ib_next)?;
        }
        debug_assert_eq!(ib_next.0, ib_next.1);

        self.total_blocks = ndblock.max(self.props.min_blocks);
        info!(
            "pfs layout: {} inodes in {} blocks, {} data sigs, {} final sigs, {} blocks total",
            self.inodes.len(),
            self.dinode_block_count,
            self.data_sigs.len(),
            self.final_sigs.len(),
            self.total_blocks
        );
        Ok(())
    }

    fn layout_node(
        &mut self,
        idx: usize,
        mut ndblock: u64,
        ib_next: &mut (u64, u64),
    ) -> Result<u64> {
        let bs = self.block_size();
        let signed = self.props.signed;
        let per = if signed { SIGS_PER_BLOCK } else { PTRS_PER_BLOCK };
        let ino = self.nodes[idx].ino;
        let blocks = self.nodes[idx].blocks;

        self.nodes[idx].start_block = ndblock;
        let direct = blocks.min(DIRECT_BLOCKS as u64);
        for i in 0..direct {
            self.inodes[ino].direct[i as usize] = ndblock as i64;
            if signed {
                self.data_sigs.push(BlockSigInfo {
                    block: ndblock as u32,
                    sig_offset: self.inode_sig_offset(ino, i as usize),
                    size: bs,
                });
            }
            ndblock += 1;
        }
        let mut remaining = blocks.saturating_sub(DIRECT_BLOCKS as u64);
        if remaining == 0 {
            return Ok(ndblock);
        }

        // single indirect
        let ib0 = take_ib(ib_next)?;
        self.inodes[ino].ib[0] = ib0 as i64;
        self.nodes[idx].ind_blocks.push(ib0);
        if signed {
            self.final_sigs.push(BlockSigInfo {
                block: ib0 as u32,
                sig_offset: self.inode_sig_offset(ino, DIRECT_BLOCKS),
                size: bs,
            });
        }
        let take = remaining.min(per);
        for j in 0..take {
            if signed {
                self.data_sigs.push(BlockSigInfo {
                    block: ndblock as u32,
                    sig_offset: ib0 * bs + SIG_ENTRY_SIZE * j,
                    size: bs,
                });
            }
            ndblock += 1;
        }
        remaining -= take;
        if remaining == 0 {
            return Ok(ndblock);
        }

        // double indirect: second-level blocks sign into it, their
        // children sign into the second level
        let dib = take_ib(ib_next)?;
        self.inodes[ino].ib[1] = dib as i64;
        self.nodes[idx].ind_blocks.push(dib);
        if signed {
            self.final_sigs.push(BlockSigInfo {
                block: dib as u32,
                sig_offset: self.inode_sig_offset(ino, DIRECT_BLOCKS + 1),
                size: bs,
            });
        }
        let mut level = 0;
        while remaining > 0 {
            if level >= per {
                return Err(anyhow!(BuildError::LayoutOverflow(format!(
                    "inode {} needs more than two levels of indirection",
                    ino
                ))));
            }
            let l2 = take_ib(ib_next)?;
            self.nodes[idx].ind_blocks.push(l2);
            if signed {
                self.final_sigs.push(BlockSigInfo {
                    block: l2 as u32,
                    sig_offset: dib * bs + SIG_ENTRY_SIZE * level,
                    size: bs,
                });
            }
            let take = remaining.min(per);
            for j in 0..take {
                if signed {
                    self.data_sigs.push(BlockSigInfo {
                        block: ndblock as u32,
                        sig_offset: l2 * bs + SIG_ENTRY_SIZE * j,
                        size: bs,
                    });
                }
                ndblock += 1;
            }
            remaining -= take;
            level += 1;
        }
        Ok(ndblock)
    }

    // ---- data writing ----

    /// Write header, inode table, super-root dirents, the path table and
    /// every node payload at `base` in `sink`.
    pub fn write_image(&self, sink: &dyn OutSink, base: u64) -> Result<()> {
        let bs = self.block_size();

        // block 0
        let mut block0 = vec![0u8; bs as usize];
        let raw = PfsHeaderRaw {
            version: PFS_VERSION,
            magic: PFS_MAGIC,
            id: u64::from_le_bytes(self.props.seed[0..8].try_into().unwrap()),
            ronly: 1,
            mode: self.header_mode(),
            block_size: bs as u32,
            n_block: self.total_blocks,
            dinode_count: self.inodes.len() as u64,
            nd_block: self.total_blocks,
            dinode_block_count: self.dinode_block_count,
            superroot_ino: 0,
            ..Default::default()
        };
        block0[0..0x50].copy_from_slice(unsafe { serialize_row(&raw) });
        self.write_header_ibs(&mut block0);
        if self.props.signed || self.props.encrypted {
            block0[PFS_SEED_OFFSET as usize..PFS_SEED_OFFSET as usize + 16]
                .copy_from_slice(&self.props.seed);
        }
        sink.write_at(base, &block0)?;

        // inode table, padded inside each block
        let ipb = self.inodes_per_block() as usize;
        let mut block = vec![0u8; bs as usize];
        for (bi, chunk) in self.inodes.chunks(ipb).enumerate() {
            block.fill(0);
            for (i, inode) in chunk.iter().enumerate() {
                let off = i * self.dinode_size() as usize;
                let bytes: Vec<u8> = if self.props.signed {
                    let row = inode.to_s32();
                    unsafe { serialize_row(&row) }.to_vec()
                } else {
                    let row = inode.to_d32();
                    unsafe { serialize_row(&row) }.to_vec()
                };
                block[off..off + bytes.len()].copy_from_slice(&bytes);
            }
            sink.write_at(base + (1 + bi as u64) * bs, &block)?;
        }

        // super-root dirents right after the inode table
        let sroot = dirents_to_blocks(&self.super_root_dirents, bs);
        sink.write_at(base + self.super_root_block * bs, &sroot)?;

        // flat path table
        sink.write_at(base + self.fpt_start_block * bs, &self.fpt_bytes)?;

        // node payloads
        for node in &self.nodes {
            let offset = base + node.start_block * bs;
            match &node.payload {
                Payload::Bytes(bytes) => sink.write_at(offset, bytes)?,
                Payload::File(idx) => {
                    self.write_file_payload(sink, offset, self.tree.node(*idx))?
                }
            }
            if !self.props.signed {
                self.write_indirect_pointers(sink, base, node)?;
            }
        }
        Ok(())
    }

    fn write_file_payload(&self, sink: &dyn OutSink, offset: u64, node: &FsNode) -> Result<()> {
        let writer = match &node.writer {
            Some(w) => w,
            None => return Ok(()),
        };
        let mut region = RegionWriter {
            sink,
            pos: offset,
            written: 0,
        };
        writer(&mut region).with_context(|| format!("writing {}", node.name))?;
        if region.written != node.size {
            return Err(anyhow!(BuildError::IoFailure(format!(
                "{}: wrote {:#x} bytes, staged size {:#x}",
                node.name, region.written, node.size
            ))));
        }
        Ok(())
    }

    /// Unsigned images carry plain little-endian pointer arrays in their
    /// indirect blocks.
    fn write_indirect_pointers(
        &self,
        sink: &dyn OutSink,
        base: u64,
        node: &LayoutNode,
    ) -> Result<()> {
        if node.ind_blocks.is_empty() {
            return Ok(());
        }
        let bs = self.block_size();
        let per = PTRS_PER_BLOCK;
        let data_block = |i: u64| (node.start_block + i) as u32;
        let mut ind = node.ind_blocks.iter();
        let ib0 = *ind.next().unwrap();
        let past_direct = node.blocks - DIRECT_BLOCKS as u64;
        let mut buf = vec![0u8; bs as usize];
        for j in 0..past_direct.min(per) {
            let v = data_block(DIRECT_BLOCKS as u64 + j);
            buf[j as usize * 4..j as usize * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        sink.write_at(base + ib0 * bs, &buf)?;

        let mut remaining = past_direct.saturating_sub(per);
        if remaining == 0 {
            return Ok(());
        }
        let dib = *ind.next().unwrap();
        let l2_blocks: Vec<u64> = ind.copied().collect();
        buf.fill(0);
        for (k, l2) in l2_blocks.iter().enumerate() {
            buf[k * 4..k * 4 + 4].copy_from_slice(&(*l2 as u32).to_le_bytes());
        }
        sink.write_at(base + dib * bs, &buf)?;
        let mut consumed = DIRECT_BLOCKS as u64 + per;
        for l2 in l2_blocks {
            buf.fill(0);
            let take = remaining.min(per);
            for j in 0..take {
                let v = data_block(consumed + j);
                buf[j as usize * 4..j as usize * 4 + 4].copy_from_slice(&v.to_le_bytes());
            }
            sink.write_at(base + l2 * bs, &buf)?;
            consumed += take;
            remaining -= take;
        }
        Ok(())
    }

    fn header_mode(&self) -> u16 {
        let mut mode = PFS_MODE_ALWAYS;
        if self.props.signed {
            mode |= PFS_MODE_SIGNED;
        }
        if self.props.encrypted {
            mode |= PFS_MODE_ENCRYPTED;
        }
        mode
    }

    fn write_header_ibs(&self, block0: &mut [u8]) {
        let off = PFS_HEADER_IBS_OFFSET as usize;
        let bs = self.block_size();
        if self.props.signed {
            // slots fill with 1..=K when the final pass writes each pair
            let ibs = DinodeS32 {
                mode: PFS_INO_MODE_FILE,
                nlink: 1,
                flags: PFS_INO_INTERNAL | PFS_INO_RDONLY | PFS_INO_SIGNED_PAIR,
                size: (self.dinode_block_count * bs) as i64,
                size_compressed: (self.dinode_block_count * bs) as i64,
                blocks: self.dinode_block_count as u32,
                ..Default::default()
            };
            let bytes = unsafe { serialize_row(&ibs) };
            block0[off..off + bytes.len()].copy_from_slice(bytes);
        } else {
            let mut ibs = DinodeD32 {
                mode: PFS_INO_MODE_FILE,
                nlink: 1,
                flags: PFS_INO_INTERNAL | PFS_INO_RDONLY,
                size: (self.dinode_block_count * bs) as i64,
                size_compressed: (self.dinode_block_count * bs) as i64,
                blocks: self.dinode_block_count as u32,
                ..Default::default()
            };
            // slot 0 points at the first inode block; the rest keep their
            // defaults
            ibs.direct[0] = 1;
            let bytes = unsafe { serialize_row(&ibs) };
            block0[off..off + bytes.len()].copy_from_slice(bytes);
        }
    }

    // ---- signing ----

    /// HMAC every planned block. Data signatures run with bounded
    /// parallelism; the final pool runs serially, last-pushed first,
    /// because indirect, inode and header block contents depend on the
    /// signatures written before them.
    pub fn sign(&self, sink: &dyn OutSink, base: u64, parallel: bool) -> Result<()> {
        if !self.props.signed {
            return Ok(());
        }
        let key = crypto::pfs_sign_key(&self.props.ekpfs, &self.props.seed)?;
        let mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| anyhow!(BuildError::CryptoFailure(e.to_string())))?;
        let bs = self.block_size() as usize;

        let sign_one = |mac: &HmacSha256, buf: &mut Vec<u8>, sig: &BlockSigInfo| -> Result<()> {
            buf.resize(sig.size as usize, 0);
            sink.read_at(base + sig.block as u64 * bs as u64, buf)?;
            let mut m = mac.clone();
            m.update(buf);
            let digest = m.finalize().into_bytes();
            sink.write_at(base + sig.sig_offset, &digest)?;
            sink.write_at(base + sig.sig_offset + 32, &sig.block.to_le_bytes())?;
            Ok(())
        };

        if parallel {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(PARALLEL_WORKERS)
                .build()
                .map_err(|e| anyhow!(BuildError::IoFailure(e.to_string())))?;
            pool.install(|| {
                self.data_sigs.par_iter().try_for_each_init(
                    || (mac.clone(), vec![0u8; bs]),
                    |(mac, buf), sig| sign_one(mac, buf, sig),
                )
            })?;
        } else {
            let mut buf = vec![0u8; bs];
            for sig in &self.data_sigs {
                sign_one(&mac, &mut buf, sig)?;
            }
        }

        let mut buf = vec![0u8; bs];
        for sig in self.final_sigs.iter().rev() {
            sign_one(&mac, &mut buf, sig)?;
        }
        Ok(())
    }

    // ---- encryption ----

    /// Sector indices swept by XTS: everything from sector 16 up to the
    /// image end, minus the 16 plaintext sectors of the empty block.
    pub fn xts_sector_gen(&self) -> Vec<u64> {
        let total = div_ceil(self.image_size(), XTS_SECTOR_SIZE);
        let skip = self
            .empty_block
            .map(|b| (b * XTS_SECTORS_PER_BLOCK, (b + 1) * XTS_SECTORS_PER_BLOCK));
        (XTS_SECTORS_PER_BLOCK..total)
            .filter(|s| match skip {
                Some((lo, hi)) => *s < lo || *s >= hi,
                None => true,
            })
            .collect()
    }

    pub fn encrypt(&self, sink: &dyn OutSink, base: u64, parallel: bool) -> Result<()> {
        if !self.props.encrypted {
            return Ok(());
        }
        let (tweak_key, data_key) =
            crypto::pfs_enc_keys(&self.props.ekpfs, &self.props.seed, self.props.new_crypt)?;
        // validate the keys up front; workers clone their own transformer
        XtsSector::new(&tweak_key, &data_key)?;
        let sectors = self.xts_sector_gen();

        let encrypt_one = |xts: &XtsSector, buf: &mut Vec<u8>, sector: u64| -> Result<()> {
            let offset = base + sector * XTS_SECTOR_SIZE;
            sink.read_at(offset, buf)?;
            xts.encrypt_sector(buf, sector);
            sink.write_at(offset, buf)?;
            Ok(())
        };

        if parallel {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(PARALLEL_WORKERS)
                .build()
                .map_err(|e| anyhow!(BuildError::IoFailure(e.to_string())))?;
            pool.install(|| {
                sectors.par_iter().try_for_each_init(
                    || {
                        (
                            XtsSector::new(&tweak_key, &data_key).expect("validated above"),
                            vec![0u8; XTS_SECTOR_SIZE as usize],
                        )
                    },
                    |(xts, buf), sector| encrypt_one(xts, buf, *sector),
                )
            })?;
        } else {
            let xts = XtsSector::new(&tweak_key, &data_key)?;
            let mut buf = vec![0u8; XTS_SECTOR_SIZE as usize];
            for sector in sectors {
                encrypt_one(&xts, &mut buf, sector)?;
            }
        }
        Ok(())
    }
}

fn take_ib(ib_next: &mut (u64, u64)) -> Result<u64> {
    if ib_next.0 >= ib_next.1 {
        return Err(anyhow!(BuildError::LayoutOverflow(
            "indirect block pool exhausted".to_string()
        )));
    }
    let b = ib_next.0;
    ib_next.0 += 1;
    Ok(b)
}

/// Serialize a dirent list into whole blocks. A record that would cross a
/// block boundary instead stretches the previous record's entsize so the
/// next record starts on the boundary.
pub fn dirents_to_blocks(dirents: &[PfsDirent], block_size: u64) -> Vec<u8> {
    let mut out: Vec<u8> = vec![];
    let mut last_start: Option<usize> = None;
    for d in dirents {
        let ent = d.entsize();
        let used = out.len() as u64 % block_size;
        if used + ent > block_size {
            let pad = block_size - used;
            if let Some(start) = last_start {
                let old = u32::from_le_bytes(out[start + 12..start + 16].try_into().unwrap());
                out[start + 12..start + 16].copy_from_slice(&(old + pad as u32).to_le_bytes());
            }
            out.resize(out.len() + pad as usize, 0);
        }
        last_start = Some(out.len());
        out.extend_from_slice(&d.to_bytes());
    }
    let tail = out.len() as u64 % block_size;
    if tail != 0 {
        out.resize((out.len() as u64 + block_size - tail) as usize, 0);
    }
    out
}

/// Streams a node payload into the sink at an advancing offset.
struct RegionWriter<'a> {
    sink: &'a dyn OutSink,
    pos: u64,
    written: u64,
}

impl io::Write for RegionWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink
            .write_at(self.pos, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.pos += buf.len() as u64;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg_lib::tree::StagingTree;
    use anyhow::Result;
    use out_sink::MemSink;

    fn test_props(signed: bool, encrypted: bool) -> PfsProperties {
        PfsProperties {
            signed,
            encrypted,
            new_crypt: false,
            seed: [0x11; 16],
            ekpfs: [0x22; 32],
            min_blocks: 0,
            file_time: 1_600_000_000,
        }
    }

    fn zero_writer(size: u64) -> crate::pkg_lib::tree::NodeWriter {
        Box::new(move |sink| {
            let chunk = vec![0xABu8; 0x10000];
            let mut left = size as usize;
            while left > 0 {
                let n = left.min(chunk.len());
                sink.write_all(&chunk[..n])?;
                left -= n;
            }
            Ok(())
        })
    }

    #[test]
    fn single_file_uses_direct_slots() -> Result<()> {
        let mut tree = StagingTree::new();
        tree.add_file(UROOT, "eboot.bin", 100 * 1024, zero_writer(100 * 1024));
        let pfs = PfsBuilder::new(test_props(true, false), tree)?;
        // inode 2 is uroot (no collision), 3 the file
        let file = &pfs.inodes()[3];
        assert_eq!(file.blocks, 2);
        assert!(file.direct[0] >= 0 && file.direct[1] == file.direct[0] + 1);
        assert_eq!(file.ib, [-1, -1]);
        let no_indirect: Vec<_> = pfs
            .nodes
            .iter()
            .filter(|n| !n.ind_blocks.is_empty())
            .collect();
        assert!(no_indirect.is_empty());
        Ok(())
    }

    #[test]
    fn gigabyte_file_indirection_plan() -> Result<()> {
        let size = 1u64 << 30;
        let mut tree = StagingTree::new();
        tree.add_file(UROOT, "big.bin", size, zero_writer(size));
        let pfs = PfsBuilder::new(test_props(true, false), tree)?;
        let blocks = div_ceil(size, PFS_BLOCK_SIZE);
        assert_eq!(blocks, 16384);
        // exactly one single-indirect, one double-indirect, eight l2 blocks
        let node = pfs.nodes.iter().find(|n| n.blocks == blocks).unwrap();
        assert_eq!(node.ind_blocks.len(), 10);
        let file_data_sigs = pfs
            .data_sigs()
            .iter()
            .filter(|s| s.block as u64 >= node.start_block)
            .count();
        assert_eq!(file_data_sigs as u64, blocks);
        assert!(pfs.final_sigs().len() >= 10);
        Ok(())
    }

    #[test]
    fn collision_renumbers_the_roots() -> Result<()> {
        let mut tree = StagingTree::new();
        tree.add_file(UROOT, "AQ", 1, zero_writer(1));
        tree.add_file(UROOT, "B2", 1, zero_writer(1));
        let pfs = PfsBuilder::new(test_props(false, false), tree)?;
        assert!(pfs.has_collision());
        // 0 super-root, 1 fpt, 2 resolver, 3 uroot
        assert_eq!(pfs.inodes()[2].flags & PFS_INO_INTERNAL, PFS_INO_INTERNAL);
        let names: Vec<&str> = pfs
            .super_root_dirents
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["flat_path_table", "collision_resolver", "uroot"]);
        assert_eq!(pfs.super_root_dirents[1].ino, 2);
        assert_eq!(pfs.super_root_dirents[2].ino, 3);
        // unsigned: the resolver occupies the post-FPT slot, no empty block
        assert_eq!(pfs.empty_block(), None);
        Ok(())
    }

    #[test]
    fn signed_collision_lays_resolver_as_leading_data_node() -> Result<()> {
        let mut tree = StagingTree::new();
        tree.add_file(UROOT, "AQ", 1, zero_writer(1));
        tree.add_file(UROOT, "B2", 1, zero_writer(1));
        let pfs = PfsBuilder::new(test_props(true, false), tree)?;
        assert!(pfs.has_collision());

        // numbering: 0 super-root, 1 fpt, 2 resolver, 3 uroot, 4/5 files
        assert_eq!(pfs.inodes().len(), 6);
        assert_eq!(pfs.inodes()[2].flags & PFS_INO_INTERNAL, PFS_INO_INTERNAL);
        assert_eq!(pfs.inodes()[2].mode, PFS_INO_MODE_FILE);
        assert_eq!(pfs.inodes()[3].mode, PFS_INO_MODE_DIR);
        let names: Vec<&str> = pfs
            .super_root_dirents
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["flat_path_table", "collision_resolver", "uroot"]);
        assert_eq!(pfs.super_root_dirents[1].ino, 2);
        assert_eq!(pfs.super_root_dirents[2].ino, 3);

        // signed mode keeps the post-FPT hole: hdr(0), inodes(1), sroot(2),
        // fpt(3), empty(4); the resolver heads the data region at block 5
        assert_eq!(pfs.empty_block(), Some(4));
        assert_eq!(pfs.nodes[0].ino, 2);
        assert_eq!(pfs.nodes[0].start_block, 5);
        assert_eq!(pfs.inodes()[2].direct[0], 5);
        // uroot dirents, then the two files in shallow-last order
        let starts: Vec<(usize, u64)> =
            pfs.nodes.iter().map(|n| (n.ino, n.start_block)).collect();
        assert_eq!(starts, vec![(2, 5), (3, 6), (4, 7), (5, 8)]);
        assert_eq!(pfs.image_size(), 9 * PFS_BLOCK_SIZE);

        // uroot dirent stream: ".", "..", then AQ before B2
        let uroot_names: Vec<String> = match &pfs.nodes[1].payload {
            Payload::Bytes(blob) => (0..4)
                .map(|i| {
                    let at = i * 24;
                    let len =
                        u32::from_le_bytes(blob[at + 8..at + 12].try_into().unwrap()) as usize;
                    String::from_utf8(blob[at + 16..at + 16 + len].to_vec()).unwrap()
                })
                .collect(),
            _ => panic!("uroot payload is precomputed bytes"),
        };
        assert_eq!(uroot_names, vec![".", "..", "AQ", "B2"]);

        // the resolver's data block is in the parallel signing plan, its
        // signature slot inside inode 2's record
        assert!(pfs.data_sigs().contains(&BlockSigInfo {
            block: 5,
            sig_offset: pfs.inode_sig_offset(2, 0),
            size: PFS_BLOCK_SIZE,
        }));
        assert_eq!(pfs.data_sigs().len(), 4);
        // final pool: header, one inode block, super-root, fpt
        assert_eq!(pfs.final_sigs().len(), 4);
        Ok(())
    }

    #[test]
    fn uncollided_tree_keeps_empty_block() -> Result<()> {
        let mut tree = StagingTree::new();
        tree.add_file(UROOT, "a.bin", 1, zero_writer(1));
        let pfs = PfsBuilder::new(test_props(false, false), tree)?;
        assert!(!pfs.has_collision());
        assert!(pfs.empty_block().is_some());
        // 0 super-root, 1 fpt, 2 uroot, 3 file
        assert_eq!(pfs.inodes()[2].mode, PFS_INO_MODE_DIR);
        Ok(())
    }

    #[test]
    fn min_blocks_floor_applies() -> Result<()> {
        let mut props = test_props(false, false);
        props.min_blocks = 100;
        let mut tree = StagingTree::new();
        tree.add_file(UROOT, "a.bin", 1, zero_writer(1));
        let pfs = PfsBuilder::new(props, tree)?;
        assert_eq!(pfs.image_size(), 100 * PFS_BLOCK_SIZE);
        Ok(())
    }

    #[test]
    fn written_image_has_sane_header_and_dirents() -> Result<()> {
        let mut tree = StagingTree::new();
        let content = b"hello pfs".to_vec();
        let len = content.len() as u64;
        tree.add_file(
            UROOT,
            "hello.txt",
            len,
            Box::new(move |sink| {
                sink.write_all(b"hello pfs")?;
                Ok(())
            }),
        );
        let pfs = PfsBuilder::new(test_props(false, false), tree)?;
        let sink = MemSink::new(pfs.image_size());
        pfs.write_image(&sink, 0)?;
        let image = sink.into_vec();
        assert_eq!(
            u64::from_le_bytes(image[0x08..0x10].try_into().unwrap()),
            PFS_MAGIC
        );
        // uroot dirents hold ".", ".." and the file
        let uroot_node = pfs.nodes.iter().find(|n| n.ino == 2).unwrap();
        let off = (uroot_node.start_block * PFS_BLOCK_SIZE) as usize;
        assert_eq!(&image[off + 16..off + 17], b".");
        // file payload lands at its start block
        let file_node = pfs.nodes.iter().find(|n| n.ino == 3).unwrap();
        let foff = (file_node.start_block * PFS_BLOCK_SIZE) as usize;
        assert_eq!(&image[foff..foff + content.len()], &content[..]);
        Ok(())
    }

    #[test]
    fn signed_image_signatures_verify() -> Result<()> {
        let mut tree = StagingTree::new();
        tree.add_file(UROOT, "data.bin", 0x18000, zero_writer(0x18000));
        let pfs = PfsBuilder::new(test_props(true, false), tree)?;
        let sink = MemSink::new(pfs.image_size());
        pfs.write_image(&sink, 0)?;
        pfs.sign(&sink, 0, false)?;
        let image = sink.into_vec();
        let key = crypto::pfs_sign_key(&[0x22; 32], &[0x11; 16])?;

        for sig in pfs.data_sigs() {
            let start = sig.block as usize * 0x10000;
            let digest = crypto::hmac_sha256(&key, &image[start..start + sig.size as usize])?;
            let at = sig.sig_offset as usize;
            assert_eq!(&image[at..at + 32], &digest);
            assert_eq!(
                u32::from_le_bytes(image[at + 32..at + 36].try_into().unwrap()),
                sig.block
            );
        }
        // every final signature except the header entry covers final bytes
        for sig in pfs.final_sigs().iter().rev() {
            let start = sig.block as usize * 0x10000;
            let mut covered = image[start..start + sig.size as usize].to_vec();
            if sig.block == 0 {
                // the header digest is computed while its own field is zero
                covered[PFS_HEADER_SIG_OFFSET as usize..PFS_HEADER_SIG_OFFSET as usize + 36]
                    .fill(0);
            }
            let digest = crypto::hmac_sha256(&key, &covered)?;
            let at = sig.sig_offset as usize;
            assert_eq!(&image[at..at + 32], &digest, "block {}", sig.block);
        }
        Ok(())
    }

    #[test]
    fn encrypted_image_keeps_plaintext_holes() -> Result<()> {
        let mut tree = StagingTree::new();
        tree.add_file(UROOT, "data.bin", 0x20000, zero_writer(0x20000));
        let pfs = PfsBuilder::new(test_props(true, true), tree)?;
        let sink = MemSink::new(pfs.image_size());
        pfs.write_image(&sink, 0)?;
        pfs.sign(&sink, 0, false)?;
        let before = {
            let mut v = vec![0u8; pfs.image_size() as usize];
            sink.read_at(0, &mut v)?;
            v
        };
        pfs.encrypt(&sink, 0, false)?;
        let image = sink.into_vec();

        // header block untouched
        assert_eq!(&image[..0x10000], &before[..0x10000]);
        // empty block stays zero
        let eb = pfs.empty_block().unwrap() as usize * 0x10000;
        assert!(image[eb..eb + 0x10000].iter().all(|&b| b == 0));
        // every swept sector decrypts back to its plaintext
        let (tweak, data) = crypto::pfs_enc_keys(&[0x22; 32], &[0x11; 16], false)?;
        let xts = XtsSector::new(&tweak, &data)?;
        for &sector in pfs.xts_sector_gen().iter().take(64) {
            let off = sector as usize * 0x1000;
            let mut buf = image[off..off + 0x1000].to_vec();
            xts.decrypt_sector(&mut buf, sector);
            assert_eq!(&buf[..], &before[off..off + 0x1000], "sector {}", sector);
        }
        Ok(())
    }

    #[test]
    fn dirent_blocks_never_split_records() {
        let mut dirents = vec![];
        for i in 0..3000 {
            dirents.push(PfsDirent::new(
                i,
                DirentType::File,
                &format!("file_with_a_rather_long_name_{:05}", i),
            ));
        }
        let blob = dirents_to_blocks(&dirents, PFS_BLOCK_SIZE);
        assert_eq!(blob.len() as u64 % PFS_BLOCK_SIZE, 0);
        // walk the records: each stays within its block
        let mut pos = 0usize;
        let mut seen = 0;
        while pos + 16 <= blob.len() {
            let ino = u32::from_le_bytes(blob[pos..pos + 4].try_into().unwrap());
            let entsize =
                u32::from_le_bytes(blob[pos + 12..pos + 16].try_into().unwrap()) as usize;
            if entsize == 0 {
                break;
            }
            let name_len = u32::from_le_bytes(blob[pos + 8..pos + 12].try_into().unwrap()) as usize;
            assert_eq!(
                pos / PFS_BLOCK_SIZE as usize,
                (pos + 16 + name_len - 1) / PFS_BLOCK_SIZE as usize,
                "record at {:#x} crosses a block boundary",
                pos
            );
            assert_eq!(ino, seen);
            seen += 1;
            pos += entsize;
        }
        assert_eq!(seen, 3000);
    }
}
