/// End-to-end package builds against the boundary scenarios and the
/// digest/signature laws of the container format.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::NaiveDate;
use rpkg::crypto;
use rpkg::sfo::SfoFile;
use rpkg::{
    BuildError, Event, PkgBuilder, PkgHeader, PkgProject, VolumeType, EntryId,
    PKG_PFS_FLAGS_NEW, PKG_PFS_FLAGS_OLD,
};

const CID: &str = "UP0000-TEST00000_00-0000000000000000";
const PASS: &str = "00000000000000000000000000000000";

struct Scratch {
    root: PathBuf,
}

impl Scratch {
    fn new(name: &str) -> Result<Self> {
        let root = std::env::temp_dir().join(format!("rpkg_it_{}", name));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("staging/sce_sys"))?;
        Ok(Self { root })
    }

    fn staging(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn out(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn write_param_sfo(&self) -> Result<()> {
        let mut sfo = SfoFile::default();
        sfo.set_str("TITLE", "Integration Fixture");
        sfo.set_str("TITLE_ID", "TEST00000");
        sfo.set_str("CONTENT_ID", CID);
        sfo.set_int("APP_VER", 0x0100);
        fs::write(self.staging().join("sce_sys/param.sfo"), sfo.to_bytes())?;
        Ok(())
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn fixed_project(volume: VolumeType, root: &Path) -> PkgProject {
    let mut project = PkgProject::new(CID, PASS, volume, root);
    project.creation_date = NaiveDate::from_ymd_opt(2024, 3, 9);
    project.pfs.seed = Some([7u8; 16]);
    project.pfs.file_time = Some(1_700_000_000);
    project
}

#[test]
fn tiny_al_package_has_no_pfs() -> Result<()> {
    let scratch = Scratch::new("al")?;
    scratch.write_param_sfo()?;
    fs::write(scratch.staging().join("sce_sys/icon0.png"), b"not a real png")?;

    let project = fixed_project(VolumeType::PkgPs4AcNodata, &scratch.staging());
    let out = scratch.out("al.pkg");
    let pkg = PkgBuilder::new(project)?.write(&out, None)?;

    assert_eq!(pkg.header.pfs_image_size, 0);
    assert_eq!(pkg.header.pfs_image_offset, 0);
    assert_eq!(
        pkg.header.package_size,
        pkg.header.body_offset + pkg.header.body_size
    );
    // output size is the body aligned out to 0x80000
    assert_eq!(fs::metadata(&out)?.len(), 0x80000);
    assert!(pkg.entries.iter().any(|(id, _)| *id == EntryId::Icon0Png));
    assert!(!pkg
        .entries
        .iter()
        .any(|(id, _)| *id == EntryId::PlaygoChunkSha));
    Ok(())
}

#[test]
fn header_round_trips_from_disk() -> Result<()> {
    let scratch = Scratch::new("roundtrip")?;
    scratch.write_param_sfo()?;
    fs::write(scratch.staging().join("eboot.bin"), vec![0x42u8; 1024])?;

    let mut project = fixed_project(VolumeType::PkgPs4App, &scratch.staging());
    project.pfs.sign = false;
    project.pfs.encrypt = false;
    let out = scratch.out("plain.pkg");
    let pkg = PkgBuilder::new(project)?.write(&out, None)?;

    let file = fs::read(&out)?;
    let parsed = PkgHeader::from_bytes(&file)?;
    assert_eq!(parsed, pkg.header);
    Ok(())
}

#[test]
fn single_file_gd_package_laws() -> Result<()> {
    let scratch = Scratch::new("gd")?;
    scratch.write_param_sfo()?;
    fs::write(scratch.staging().join("eboot.bin"), vec![0x5Au8; 100 * 1024])?;

    let project = fixed_project(VolumeType::PkgPs4App, &scratch.staging());
    let out = scratch.out("gd.pkg");
    let mut events = vec![];
    let mut log = |e: Event| events.push(e);
    let pkg = PkgBuilder::new(project)?.write(&out, Some(&mut log))?;
    let file = fs::read(&out)?;
    let header = &pkg.header;

    // progress callback hit the documented percentages
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            Event::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![15, 40, 70, 80]);

    // metas law
    let metas = pkg
        .entries
        .iter()
        .find(|(id, _)| *id == EntryId::Metas)
        .unwrap();
    assert_eq!(metas.1.data_size as usize, pkg.entries.len() * 32);

    // chunk sha sizing law
    let chunk_sha = pkg
        .entries
        .iter()
        .find(|(id, _)| *id == EntryId::PlaygoChunkSha)
        .unwrap();
    assert_eq!(
        chunk_sha.1.data_size as u64,
        4 * ((header.package_size + 0xFFFF) / 0x10000)
    );

    // every chunk hash over the PFS region matches the file content
    let sha_off = chunk_sha.1.data_offset as u64;
    let first_chunk = header.pfs_image_offset / 0x10000;
    let last_chunk = header.package_size / 0x10000;
    for ci in first_chunk..last_chunk {
        let chunk = &file[(ci * 0x10000) as usize..((ci + 1) * 0x10000) as usize];
        let expect = &crypto::sha256(chunk)[0..4];
        let at = (sha_off + ci * 4) as usize;
        assert_eq!(&file[at..at + 4], expect, "chunk {}", ci);
    }
    // slots before the PFS region stay zero
    assert_eq!(&file[sha_off as usize..sha_off as usize + 4], &[0u8; 4]);

    // per-entry digest law; the digest table hashes itself in sequence,
    // so rebuild its partial state for the self-referential row
    let digests = pkg
        .entries
        .iter()
        .position(|(id, _)| *id == EntryId::Digests)
        .unwrap();
    let dmeta = &pkg.entries[digests].1;
    let table =
        &file[dmeta.data_offset as usize..(dmeta.data_offset + dmeta.data_size) as usize];
    for (i, (_, meta)) in pkg.entries.iter().enumerate().skip(1) {
        let body = &file[meta.data_offset as usize..(meta.data_offset + meta.data_size) as usize];
        let expect = if i == digests {
            let mut partial = vec![0u8; dmeta.data_size as usize];
            partial[32..32 * i].copy_from_slice(&table[32..32 * i]);
            crypto::sha256(&partial)
        } else {
            crypto::sha256(body)
        };
        assert_eq!(&table[32 * i..32 * i + 32], &expect, "entry {}", i);
    }
    assert_eq!(&table[0..32], &[0u8; 32]);

    // digest table hash and body digest
    assert_eq!(header.digest_table_hash, crypto::sha256(table));
    let body = &file
        [header.body_offset as usize..(header.body_offset + header.body_size) as usize];
    assert_eq!(header.body_digest, crypto::sha256(body));

    // SC entry concatenation laws
    let mut sc1 = vec![];
    for id in [
        EntryId::EntryKeys,
        EntryId::ImageKey,
        EntryId::GeneralDigests,
        EntryId::Metas,
        EntryId::Digests,
    ] {
        let meta = &pkg.entries.iter().find(|(i, _)| *i == id).unwrap().1;
        sc1.extend_from_slice(
            &file[meta.data_offset as usize..(meta.data_offset + meta.data_size) as usize],
        );
    }
    assert_eq!(sc1.len(), header.main_ent_data_size as usize);
    assert_eq!(header.sc_entries1_hash, crypto::sha256(&sc1));

    // header digest and RSA signature
    assert_eq!(crypto::sha256(&file[..0xFE0]), header.header_digest);
    assert_eq!(&file[0xFE0..0x1000], &header.header_digest);
    let page_digest = crypto::sha256(&file[..0x1000]);
    crypto::rsa2048_verify_digest(
        &crypto::PKG_SIGN_KEY,
        &page_digest,
        &file[0x1000..0x1100],
    )?;
    Ok(())
}

#[test]
fn identical_projects_build_identical_bytes() -> Result<()> {
    let scratch = Scratch::new("determinism")?;
    scratch.write_param_sfo()?;
    fs::write(scratch.staging().join("eboot.bin"), vec![0x11u8; 4096])?;

    let build = |name: &str| -> Result<Vec<u8>> {
        let project = fixed_project(VolumeType::PkgPs4App, &scratch.staging());
        let out = scratch.out(name);
        PkgBuilder::new(project)?.write(&out, None)?;
        Ok(fs::read(&out)?)
    };
    let a = build("a.pkg")?;
    let b = build("b.pkg")?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn stream_and_mmap_paths_agree() -> Result<()> {
    let scratch = Scratch::new("stream")?;
    scratch.write_param_sfo()?;
    fs::write(scratch.staging().join("eboot.bin"), vec![0x33u8; 4096])?;

    let project = fixed_project(VolumeType::PkgPs4App, &scratch.staging());
    let out = scratch.out("mmap.pkg");
    PkgBuilder::new(project.clone())?.write(&out, None)?;
    let mmap_bytes = fs::read(&out)?;

    let mut stream_bytes = vec![];
    PkgBuilder::new(project)?.write_stream(&mut stream_bytes, None)?;
    assert_eq!(mmap_bytes, stream_bytes);
    Ok(())
}

#[test]
fn old_and_new_crypt_differ_only_under_the_keys() -> Result<()> {
    let scratch = Scratch::new("crypt")?;
    scratch.write_param_sfo()?;
    fs::write(scratch.staging().join("eboot.bin"), vec![0x77u8; 4096])?;

    let build = |name: &str, new_crypt: bool| -> Result<(rpkg::Pkg, Vec<u8>)> {
        let mut project = fixed_project(VolumeType::PkgPs4App, &scratch.staging());
        project.pfs.new_crypt = new_crypt;
        let out = scratch.out(name);
        let pkg = PkgBuilder::new(project)?.write(&out, None)?;
        Ok((pkg, fs::read(&out)?))
    };
    let (old_pkg, old_file) = build("old.pkg", false)?;
    let (new_pkg, new_file) = build("new.pkg", true)?;

    assert_eq!(old_pkg.header.pfs_flags, PKG_PFS_FLAGS_OLD);
    assert_eq!(new_pkg.header.pfs_flags, PKG_PFS_FLAGS_NEW);
    assert_eq!(
        old_pkg.header.pfs_flags ^ new_pkg.header.pfs_flags,
        1 << 61
    );

    // sector 16 ciphertext differs, plaintext does not
    let pfs = old_pkg.header.pfs_image_offset as usize;
    let old_sector = &old_file[pfs + 0x10000..pfs + 0x11000];
    let new_sector = &new_file[pfs + 0x10000..pfs + 0x11000];
    assert_ne!(old_sector, new_sector);

    let ekpfs = crypto::compute_keys(CID, PASS, crypto::EKPFS_INDEX)?;
    let seed = [7u8; 16];
    let decrypt = |bytes: &[u8], new_crypt: bool| -> Result<Vec<u8>> {
        let (tweak, data) = crypto::pfs_enc_keys(&ekpfs, &seed, new_crypt)?;
        let xts = crypto::XtsSector::new(&tweak, &data)?;
        let mut buf = bytes.to_vec();
        xts.decrypt_sector(&mut buf, 16);
        Ok(buf)
    };
    assert_eq!(decrypt(old_sector, false)?, decrypt(new_sector, true)?);
    Ok(())
}

#[test]
fn missing_param_sfo_is_a_typed_error() -> Result<()> {
    let scratch = Scratch::new("missing_sfo")?;
    fs::write(scratch.staging().join("eboot.bin"), b"elf")?;

    let project = fixed_project(VolumeType::PkgPs4App, &scratch.staging());
    let err = PkgBuilder::new(project)?
        .write(&scratch.out("nope.pkg"), None)
        .unwrap_err();
    match err.downcast_ref::<BuildError>() {
        Some(BuildError::MissingRequiredFile(path)) => {
            assert!(path.contains("param.sfo"));
        }
        other => panic!("unexpected error kind: {:?}", other),
    }
    Ok(())
}

#[test]
fn pubtool_fields_are_stamped() -> Result<()> {
    let scratch = Scratch::new("pubtool")?;
    scratch.write_param_sfo()?;
    fs::write(scratch.staging().join("eboot.bin"), vec![1u8; 64])?;

    let project = fixed_project(VolumeType::PkgPs4App, &scratch.staging());
    let out = scratch.out("pubtool.pkg");
    let pkg = PkgBuilder::new(project)?.write(&out, None)?;
    let file = fs::read(&out)?;

    let meta = &pkg
        .entries
        .iter()
        .find(|(id, _)| *id == EntryId::ParamSfo)
        .unwrap()
        .1;
    let sfo = SfoFile::from_bytes(
        &file[meta.data_offset as usize..(meta.data_offset + meta.data_size) as usize],
    )?;
    let info = sfo.get_str("PUBTOOLINFO").unwrap();
    assert!(info.contains("c_date=20240309"), "{}", info);
    let l0 = (pkg.header.package_size + 0xFFFFF) / 0x100000;
    assert!(info.contains(&format!("img0_l0_size={}", l0)), "{}", info);
    assert!(info.contains("img0_sc_ksize=512"), "{}", info);
    assert_eq!(
        sfo.get("PUBTOOLVER"),
        Some(&rpkg::sfo::SfoValue::Int(0x0289_0000))
    );
    // version_date mirrors c_date in hex form
    assert_eq!(pkg.header.version_date, 0x20240309);
    Ok(())
}
