/// PKG container builder and build orchestrator: entry assembly, the
/// digest cascade and the final header signature.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::*;
use out_sink::{MemSink, MmapSink, OutSink};
use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::pkg_lib::crypto::{self, PKG_SIGN_KEY};
use crate::pkg_lib::desc::*;
use crate::pkg_lib::entries::*;
use crate::pkg_lib::pfs::{PfsBuilder, PfsProperties};
use crate::pkg_lib::project::PkgProject;
use crate::pkg_lib::sfo::{set_pubtool_info, SfoFile};
use crate::pkg_lib::tree::{StagingTree, UROOT};
use crate::pkg_lib::utils::{align_up, div_ceil};
use crate::pkg_lib::{
    emit, status, BuildError, Event, Log, PARALLEL_WORKERS, PFS_BLOCK_SIZE, PKG_BODY_OFFSET,
    PKG_ENTRY_ALIGN, PKG_INITIAL_BODY_SIZE, PKG_PFS_ALIGN,
};

pub const PUBTOOLVER: u32 = 0x0289_0000;
/// Content flag selecting the second-generation PFS key derivation
pub const PKG_CONTENT_FLAG_NEW_CRYPT: u32 = 0x0000_0010;
/// Inner image path inside the outer filesystem
pub const INNER_IMAGE_PATH: &str = "/pfs_image.dat";

/// Completed-package descriptor handed back to the caller.
#[derive(Debug, Clone)]
pub struct Pkg {
    pub header: PkgHeader,
    pub entries: Vec<(EntryId, MetaEntry)>,
}

pub struct PkgBuilder {
    project: PkgProject,
}

struct Plan {
    header: PkgHeader,
    entries: Vec<PkgEntry>,
    content_type: ContentType,
    inner: Option<PfsBuilder>,
    outer: Option<PfsBuilder>,
    /// Absolute offset of the embedded inner image
    inner_offset: u64,
    package_size: u64,
}

impl Plan {
    fn entry_index(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

impl PkgBuilder {
    pub fn new(project: PkgProject) -> Result<Self> {
        project.validate()?;
        Ok(Self { project })
    }

    /// Build the package into `path` through a memory map, with the
    /// parallel sign/encrypt/hash stages enabled.
    pub fn write(&self, path: &Path, mut log: Log) -> Result<Pkg> {
        let mut plan = self.plan(&mut log)?;
        let sink = MmapSink::create(path, plan.package_size)?;
        self.build_into(&mut plan, &sink, true, &mut log)?;
        sink.flush()?;
        Ok(self.finish(plan))
    }

    /// Build the package into an arbitrary stream. Everything runs
    /// serially against an in-memory image.
    pub fn write_stream(&self, stream: &mut dyn Write, mut log: Log) -> Result<Pkg> {
        let mut plan = self.plan(&mut log)?;
        let sink = MemSink::new(plan.package_size);
        self.build_into(&mut plan, &sink, false, &mut log)?;
        stream.write_all(&sink.into_vec())?;
        Ok(self.finish(plan))
    }

    fn finish(&self, plan: Plan) -> Pkg {
        Pkg {
            header: plan.header,
            entries: plan
                .entries
                .iter()
                .map(|e| (e.id, e.meta.clone()))
                .collect(),
        }
    }

    // ---- planning ----

    fn plan(&self, log: &mut Log) -> Result<Plan> {
        let project = &self.project;
        status!(log, "staging tree from {}", project.root_dir.display());
        let (tree, sce_entries) = StagingTree::from_dir(&project.root_dir)?;

        let mut staged: BTreeMap<EntryId, PathBuf> = sce_entries.into_iter().collect();
        let sfo_path = staged.remove(&EntryId::ParamSfo).ok_or_else(|| {
            anyhow!(BuildError::MissingRequiredFile(
                "sce_sys/param.sfo".to_string()
            ))
        })?;
        let sfo_bytes =
            std::fs::read(&sfo_path).with_context(|| format!("reading {}", sfo_path.display()))?;
        let mut sfo = SfoFile::from_bytes(&sfo_bytes)?;

        let content_type = project.volume_type.content_type();
        let ekpfs = match project.pfs.ekpfs {
            Some(k) => k,
            None => crypto::compute_keys(&project.content_id, &project.passcode, crypto::EKPFS_INDEX)?,
        };
        let seed = project.pfs.seed.unwrap_or_else(|| {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let mut s = [0u8; 16];
            rng.fill(&mut s);
            s
        });
        let file_time = project.effective_file_time();

        // the PFS pair: the inner image carries the staged tree, the outer
        // image carries the inner image as a single file
        let (inner, outer, inner_offset_block) = if content_type == ContentType::Al {
            (None, None, 0)
        } else {
            let inner = PfsBuilder::new(
                PfsProperties::plain(ekpfs, file_time, project.pfs.min_blocks),
                tree,
            )?;
            let mut outer_tree = StagingTree::new();
            outer_tree.add_external_file(
                UROOT,
                INNER_IMAGE_PATH.trim_start_matches('/'),
                inner.image_size(),
            );
            let outer = PfsBuilder::new(
                PfsProperties {
                    signed: project.pfs.sign,
                    encrypted: project.pfs.encrypt,
                    new_crypt: project.pfs.new_crypt,
                    seed,
                    ekpfs,
                    min_blocks: 0,
                    file_time,
                },
                outer_tree,
            )?;
            let start = outer
                .file_start_block(INNER_IMAGE_PATH)
                .ok_or_else(|| anyhow!("inner image lost during outer layout"))?;
            (Some(inner), Some(outer), start)
        };
        let pfs_image_size = outer.as_ref().map(|o| o.image_size()).unwrap_or(0);

        // provisional package size drives the ChunkSha allocation and the
        // first param.sfo augmentation
        let provisional_size = PKG_BODY_OFFSET + PKG_INITIAL_BODY_SIZE + pfs_image_size;
        self.augment_sfo(&mut sfo, provisional_size, pfs_image_size > 0);

        let mut entries =
            self.assemble_entries(content_type, &mut staged, &sfo, &ekpfs, &seed, provisional_size)?;

        // lay entry data out and refine the body size
        let body_end = layout_entries(&mut entries);
        let body_size = (align_up(body_end.max(PKG_BODY_OFFSET + PKG_INITIAL_BODY_SIZE), PKG_PFS_ALIGN)
            - PKG_BODY_OFFSET)
            .max(PKG_INITIAL_BODY_SIZE);
        let pfs_image_offset = if pfs_image_size > 0 {
            PKG_BODY_OFFSET + body_size
        } else {
            0
        };
        let package_size = PKG_BODY_OFFSET + body_size + pfs_image_size;

        // the final package size is now known: refresh the SFO in place
        // (field capacity is fixed, so entry offsets cannot move)
        if package_size != provisional_size {
            self.augment_sfo(&mut sfo, package_size, pfs_image_size > 0);
            let idx = entries
                .iter()
                .position(|e| e.id == EntryId::ParamSfo)
                .expect("param.sfo entry exists");
            let bytes = sfo.to_bytes();
            if bytes.len() as u64 == entries[idx].meta.data_size as u64 {
                entries[idx].data = EntryData::Bytes(bytes);
            } else {
                warn!("param.sfo size changed after final augmentation; keeping provisional copy");
            }
        }

        // the recorded ChunkSha size follows the real chunk count; an
        // overrun of the allocation is logged, not fatal
        if let Some(idx) = entries.iter().position(|e| e.id == EntryId::PlaygoChunkSha) {
            let needed = 4 * div_ceil(package_size, PFS_BLOCK_SIZE) as u32;
            let allocated = entries[idx].data.size() as u32;
            if needed > allocated {
                warn!(
                    "playgo-chunk.sha needs {:#x} bytes but {:#x} are allocated",
                    needed, allocated
                );
            } else {
                entries[idx].meta.data_size = needed;
            }
        }

        let header = self.build_header(
            content_type,
            &entries,
            body_size,
            body_end,
            pfs_image_offset,
            pfs_image_size,
            package_size,
        )?;

        Ok(Plan {
            header,
            entries,
            content_type,
            inner,
            outer,
            inner_offset: pfs_image_offset + inner_offset_block * PFS_BLOCK_SIZE,
            package_size,
        })
    }

    fn augment_sfo(&self, sfo: &mut SfoFile, package_size: u64, has_pfs: bool) {
        let mut fields = vec![("c_date", self.project.c_date())];
        if let Some(t) = self.project.c_time() {
            fields.push(("c_time", t));
        }
        if has_pfs {
            fields.push(("img0_l0_size", div_ceil(package_size, 0x100000).to_string()));
            fields.push(("img0_l1_size", "0".to_string()));
            fields.push(("img0_sc_ksize", "512".to_string()));
            fields.push(("img0_pc_ksize", "832".to_string()));
        }
        set_pubtool_info(sfo, &fields);
        // fix the field capacity so later value updates cannot move offsets
        if let Some(e) = sfo.entries.iter_mut().find(|e| e.key == "PUBTOOLINFO") {
            e.max_len = e.max_len.max(0x200);
        }
        sfo.set_int("PUBTOOLVER", PUBTOOLVER);
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_entries(
        &self,
        content_type: ContentType,
        staged: &mut BTreeMap<EntryId, PathBuf>,
        sfo: &SfoFile,
        ekpfs: &[u8; 32],
        seed: &[u8; 16],
        provisional_size: u64,
    ) -> Result<Vec<PkgEntry>> {
        let project = &self.project;
        let mut list: Vec<(EntryId, EntryData)> = vec![
            (
                EntryId::EntryKeys,
                EntryData::Bytes(entry_keys_blob(&project.content_id, &project.passcode)?),
            ),
            (
                EntryId::ImageKey,
                EntryData::Bytes(image_key_blob(ekpfs, &project.content_id, seed)?),
            ),
            (
                EntryId::GeneralDigests,
                EntryData::Bytes(vec![0; GENERAL_DIGESTS_SIZE as usize]),
            ),
            // sized once the entry count is final
            (EntryId::Metas, EntryData::Zeros(0)),
            (EntryId::Digests, EntryData::Zeros(0)),
            (EntryId::EntryNames, EntryData::Zeros(0)),
        ];

        if content_type == ContentType::Gd {
            let chunk_dat = match staged.remove(&EntryId::PlaygoChunkDat) {
                Some(path) => file_entry_data(&path)?,
                None => EntryData::Bytes(default_playgo_chunk_dat()),
            };
            list.push((EntryId::PlaygoChunkDat, chunk_dat));
            let chunk_sha_size = 4 * div_ceil(provisional_size, PFS_BLOCK_SIZE);
            staged.remove(&EntryId::PlaygoChunkSha);
            list.push((
                EntryId::PlaygoChunkSha,
                EntryData::Bytes(vec![0; chunk_sha_size as usize]),
            ));
            let manifest = match staged.remove(&EntryId::PlaygoManifestXml) {
                Some(path) => file_entry_data(&path)?,
                None => EntryData::Bytes(default_playgo_manifest(&project.content_id)),
            };
            list.push((EntryId::PlaygoManifestXml, manifest));
        }

        let ek = project.entitlement_key_bytes();
        list.push((
            EntryId::LicenseDat,
            EntryData::Bytes(license_dat(&project.content_id, content_type, ek)),
        ));
        list.push((
            EntryId::LicenseInfo,
            EntryData::Bytes(license_info(&project.content_id, content_type, ek)),
        ));
        list.push((EntryId::ParamSfo, EntryData::Bytes(sfo.to_bytes())));

        // remaining recognized sce_sys files in canonical order
        let mut rest: Vec<(EntryId, PathBuf)> = staged
            .iter()
            .map(|(id, p)| (*id, p.clone()))
            .collect();
        rest.sort_by_key(|(id, _)| (id.sort_key(), u32::from(*id)));
        for (id, path) in rest {
            list.push((id, file_entry_data(&path)?));
        }
        list.push((EntryId::PsReservedDat, EntryData::Zeros(PS_RESERVED_SIZE)));

        // second pass: entry count and names are now final
        let count = list.len() as u64;
        let mut names = EntryNames::new();
        let mut entries = Vec::with_capacity(list.len());
        for (id, mut data) in list {
            match id {
                EntryId::Metas => data = EntryData::Zeros(count * META_ENTRY_SIZE),
                EntryId::Digests => data = EntryData::Zeros(count * 32),
                _ => {}
            }
            let name_table_offset = if id.has_name() {
                names.add(id.entry_name())
            } else {
                0
            };
            let (flags1, flags2) = id.meta_flags();
            entries.push(PkgEntry {
                id,
                meta: MetaEntry {
                    id: id.into(),
                    name_table_offset,
                    flags1,
                    flags2,
                    data_offset: 0,
                    data_size: 0,
                },
                data,
            });
        }
        let names_bytes = names.into_bytes();
        if let Some(e) = entries.iter_mut().find(|e| e.id == EntryId::EntryNames) {
            e.data = EntryData::Bytes(names_bytes);
        }
        Ok(entries)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_header(
        &self,
        content_type: ContentType,
        entries: &[PkgEntry],
        body_size: u64,
        body_end: u64,
        pfs_image_offset: u64,
        pfs_image_size: u64,
        package_size: u64,
    ) -> Result<PkgHeader> {
        let project = &self.project;
        let metas = entries
            .iter()
            .find(|e| e.id == EntryId::Metas)
            .expect("metas entry exists");
        let sc_sizes: u64 = entries
            .iter()
            .filter(|e| {
                matches!(
                    e.id,
                    EntryId::EntryKeys
                        | EntryId::ImageKey
                        | EntryId::GeneralDigests
                        | EntryId::Metas
                        | EntryId::Digests
                )
            })
            .map(|e| e.meta.data_size as u64)
            .sum();

        let mut header = PkgHeader {
            pkg_type: PKG_TYPE,
            file_count: entries.iter().filter(|e| e.id.has_name()).count() as u32,
            entry_count: entries.len() as u32,
            sc_entry_count: PKG_SC_ENTRY_COUNT,
            entry_count_2: entries.len() as u16,
            entry_table_offset: metas.meta.data_offset,
            main_ent_data_size: sc_sizes as u32,
            body_offset: PKG_BODY_OFFSET,
            body_size,
            content_offset: entries[0].meta.data_offset as u64,
            content_size: body_end - entries[0].meta.data_offset as u64,
            drm_type: PKG_DRM_TYPE_PS4,
            content_type: content_type.into(),
            content_flags: self.content_flags(content_type),
            version_date: u32::from_str_radix(&project.c_date(), 16).unwrap_or(0),
            ekc_version: project.entitlement_key.is_some() as u32,
            package_size,
            mount_image_size: package_size,
            ..Default::default()
        };
        header.content_id[..project.content_id.len()]
            .copy_from_slice(project.content_id.as_bytes());
        if pfs_image_size > 0 {
            header.pfs_image_count = 1;
            header.pfs_flags = if project.pfs.new_crypt {
                PKG_PFS_FLAGS_NEW
            } else {
                PKG_PFS_FLAGS_OLD
            };
            header.pfs_image_offset = pfs_image_offset;
            header.pfs_image_size = pfs_image_size;
            header.pfs_signed_size = PKG_PFS_SIGNED_SIZE;
            header.pfs_cache_size = PKG_PFS_CACHE_SIZE;
        }
        Ok(header)
    }

    fn content_flags(&self, content_type: ContentType) -> u32 {
        let base = match content_type {
            ContentType::Gd => 0x8A00_0000,
            ContentType::Dp => 0x8E00_0000,
            ContentType::Ac | ContentType::Al => 0x8C00_0000,
        };
        if self.project.pfs.new_crypt {
            base | PKG_CONTENT_FLAG_NEW_CRYPT
        } else {
            base
        }
    }

    // ---- building ----

    fn build_into(
        &self,
        plan: &mut Plan,
        sink: &dyn OutSink,
        parallel: bool,
        log: &mut Log,
    ) -> Result<()> {
        emit(log, Event::Progress(15));

        if let (Some(outer), Some(inner)) = (&plan.outer, &plan.inner) {
            let base = plan.header.pfs_image_offset;
            status!(log, "writing PFS image at {:#x}", base);
            outer.write_image(sink, base)?;
            inner.write_image(sink, plan.inner_offset)?;
            emit(log, Event::Progress(40));
            status!(log, "signing PFS blocks");
            outer.sign(sink, base, parallel)?;
            emit(log, Event::Progress(70));
            status!(log, "encrypting PFS sectors");
            outer.encrypt(sink, base, parallel)?;
            emit(log, Event::Progress(80));
        }

        self.finalize(plan, sink, parallel, log)
    }

    /// The digest cascade of the container. The order of operations is
    /// load-bearing: each digest covers bytes produced by the steps
    /// before it.
    fn finalize(&self, plan: &mut Plan, sink: &dyn OutSink, parallel: bool, log: &mut Log) -> Result<()> {
        let mut header = plan.header.clone();

        // 1+2: PFS digests
        if plan.outer.is_some() {
            header.pfs_signed_digest = sha256_range(
                sink,
                header.pfs_image_offset,
                PKG_PFS_SIGNED_SIZE as u64,
            )?;
            header.pfs_image_digest =
                sha256_range(sink, header.pfs_image_offset, header.pfs_image_size)?;
        }

        // 3: PlayGo chunk hashes become body content
        if plan.content_type == ContentType::Gd {
            status!(log, "hashing PlayGo chunks");
            let first = header.pfs_image_offset / PFS_BLOCK_SIZE;
            let last = plan.package_size / PFS_BLOCK_SIZE;
            let hashes = playgo_chunk_hashes(sink, first, last, parallel)?;
            let idx = plan
                .entry_index(EntryId::PlaygoChunkSha)
                .ok_or_else(|| anyhow!("GD package without playgo-chunk.sha"))?;
            if let EntryData::Bytes(blob) = &mut plan.entries[idx].data {
                for (i, h) in hashes.iter().enumerate() {
                    let at = (first as usize + i) * 4;
                    if at + 4 <= blob.len() {
                        blob[at..at + 4].copy_from_slice(h);
                    }
                }
            }
        }

        // 4: general digests over header subfields
        {
            let snapshot = header.to_bytes();
            let idx = plan
                .entry_index(EntryId::GeneralDigests)
                .expect("general digests entry exists");
            if let EntryData::Bytes(blob) = &mut plan.entries[idx].data {
                let mut cid = [0u8; 48];
                cid[..header.content_id.len()].copy_from_slice(&header.content_id);
                blob[0x00..0x20].copy_from_slice(&crypto::sha256(&snapshot[0x00..0x40]));
                blob[0x20..0x40].copy_from_slice(&crypto::sha256(&cid));
                blob[0x40..0x60].copy_from_slice(&crypto::sha256(&snapshot[0x400..0x490]));
                blob[0x60..0x80].copy_from_slice(&header.pfs_image_digest);
            }
        }

        // 5: body write
        status!(log, "writing body entries");
        let metas_bytes: Vec<u8> = plan
            .entries
            .iter()
            .flat_map(|e| e.meta.to_bytes())
            .collect();
        for entry in &plan.entries {
            let offset = entry.meta.data_offset as u64;
            match &entry.data {
                EntryData::Bytes(b) => sink.write_at(offset, b)?,
                EntryData::Zeros(_) => { /* the file is zero-initialized */ }
                EntryData::File(path, size) => copy_file_into(sink, offset, path, *size)?,
            }
            if entry.id == EntryId::Metas {
                sink.write_at(offset, &metas_bytes)?;
            }
        }

        // 6: per-entry digests, mirrored into the digest table
        let digests_idx = plan
            .entry_index(EntryId::Digests)
            .expect("digest entry exists");
        let digests_offset = plan.entries[digests_idx].meta.data_offset as u64;
        for i in 1..plan.entries.len() {
            let meta = &plan.entries[i].meta;
            let digest = sha256_range(sink, meta.data_offset as u64, meta.data_size as u64)?;
            sink.write_at(digests_offset + 32 * i as u64, &digest)?;
        }
        let digests_bytes = read_range(
            sink,
            digests_offset,
            plan.entries[digests_idx].meta.data_size as u64,
        )?;

        // 7+8: body digest and digest-table hash
        header.body_digest = sha256_range(sink, header.body_offset, header.body_size)?;
        header.digest_table_hash = crypto::sha256(&digests_bytes);

        // 9: SC entries 1 — the concatenation length must equal
        // main_ent_data_size or the plan itself is broken
        let sc_ids = [
            EntryId::EntryKeys,
            EntryId::ImageKey,
            EntryId::GeneralDigests,
            EntryId::Metas,
            EntryId::Digests,
        ];
        let mut sc1 = vec![];
        for id in sc_ids {
            let meta = &plan.entries[plan.entry_index(id).expect("sc entry")].meta;
            sc1.extend(read_range(sink, meta.data_offset as u64, meta.data_size as u64)?);
        }
        if sc1.len() as u64 != header.main_ent_data_size as u64 {
            return Err(anyhow!(BuildError::SizeMismatch {
                expected: header.main_ent_data_size as u64,
                actual: sc1.len() as u64,
            }));
        }
        header.sc_entries1_hash = crypto::sha256(&sc1);

        // 10: SC entries 2 truncates the meta table to the SC rows
        let mut sc2 = vec![];
        for id in [EntryId::EntryKeys, EntryId::ImageKey, EntryId::GeneralDigests] {
            let meta = &plan.entries[plan.entry_index(id).expect("sc entry")].meta;
            sc2.extend(read_range(sink, meta.data_offset as u64, meta.data_size as u64)?);
        }
        let metas_meta = &plan.entries[plan.entry_index(EntryId::Metas).expect("metas")].meta;
        sc2.extend(read_range(
            sink,
            metas_meta.data_offset as u64,
            header.sc_entry_count as u64 * 0x20,
        )?);
        header.sc_entries2_hash = crypto::sha256(&sc2);

        // 11: header
        status!(log, "finalizing header");
        sink.write_at(0, &header.to_bytes())?;

        // 12: header digest
        let digest = sha256_range(sink, 0, PKG_HEADER_DIGEST_OFFSET)?;
        header.header_digest = digest;
        sink.write_at(PKG_HEADER_DIGEST_OFFSET, &digest)?;

        // 13: RSA signature over the digest of the full header page
        let page = sha256_range(sink, 0, PKG_HEADER_SIZE as u64)?;
        let signature = crypto::rsa2048_sign_digest(&PKG_SIGN_KEY, &page)?;
        sink.write_at(PKG_SIGNATURE_OFFSET, &signature)?;

        plan.header = header;
        Ok(())
    }
}

/// Assign aligned data offsets; returns the end of the last entry.
fn layout_entries(entries: &mut [PkgEntry]) -> u64 {
    let mut cur = PKG_BODY_OFFSET;
    for entry in entries.iter_mut() {
        cur = align_up(cur, PKG_ENTRY_ALIGN);
        entry.meta.data_offset = cur as u32;
        entry.meta.data_size = entry.data.size() as u32;
        cur += entry.data.size();
    }
    cur
}

fn file_entry_data(path: &Path) -> Result<EntryData> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("cannot stat {}", path.display()))?;
    Ok(EntryData::File(path.to_path_buf(), meta.len()))
}

fn copy_file_into(sink: &dyn OutSink, offset: u64, path: &Path, expected: u64) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut buf = vec![0u8; 1 << 16];
    let mut pos = offset;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sink.write_at(pos, &buf[..n])?;
        pos += n as u64;
    }
    if pos - offset != expected {
        return Err(anyhow!(BuildError::IoFailure(format!(
            "{}: size changed during build",
            path.display()
        ))));
    }
    Ok(())
}

fn read_range(sink: &dyn OutSink, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    sink.read_at(offset, &mut buf)?;
    Ok(buf)
}

fn sha256_range(sink: &dyn OutSink, offset: u64, len: u64) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    let mut pos = 0;
    while pos < len {
        let n = buf.len().min((len - pos) as usize);
        sink.read_at(offset + pos, &mut buf[..n])?;
        hasher.update(&buf[..n]);
        pos += n as u64;
    }
    Ok(hasher.finalize().into())
}

/// First four bytes of the SHA-256 of every 64 KiB chunk in
/// `[first, last)`, in chunk order.
fn playgo_chunk_hashes(
    sink: &dyn OutSink,
    first: u64,
    last: u64,
    parallel: bool,
) -> Result<Vec<[u8; 4]>> {
    let chunk_of = |buf: &mut Vec<u8>, ci: u64| -> Result<[u8; 4]> {
        sink.read_at(ci * PFS_BLOCK_SIZE, buf)?;
        let digest = crypto::sha256(buf);
        Ok(digest[0..4].try_into().unwrap())
    };
    if parallel {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(PARALLEL_WORKERS)
            .build()
            .map_err(|e| anyhow!(BuildError::IoFailure(e.to_string())))?;
        pool.install(|| {
            (first..last)
                .into_par_iter()
                .map_init(
                    || vec![0u8; PFS_BLOCK_SIZE as usize],
                    |buf, ci| chunk_of(buf, ci),
                )
                .collect::<Result<Vec<[u8; 4]>>>()
        })
    } else {
        let mut buf = vec![0u8; PFS_BLOCK_SIZE as usize];
        (first..last).map(|ci| chunk_of(&mut buf, ci)).collect()
    }
}
