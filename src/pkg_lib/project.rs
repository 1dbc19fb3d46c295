/// Project configuration handed to the builders by external collaborators.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, NaiveDate, Timelike, Utc};

use crate::pkg_lib::desc::ContentType;
use crate::pkg_lib::{BuildError, PFS_BLOCK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeType {
    PkgPs4App,
    PkgPs4Patch,
    PkgPs4Remaster,
    PkgPs4AcData,
    PkgPs4AcNodata,
    PkgPs4SfTheme,
    PkgPs4Theme,
}

impl VolumeType {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "pkg_ps4_app" => VolumeType::PkgPs4App,
            "pkg_ps4_patch" => VolumeType::PkgPs4Patch,
            "pkg_ps4_remaster" => VolumeType::PkgPs4Remaster,
            "pkg_ps4_ac_data" => VolumeType::PkgPs4AcData,
            "pkg_ps4_ac_nodata" => VolumeType::PkgPs4AcNodata,
            "pkg_ps4_sf_theme" => VolumeType::PkgPs4SfTheme,
            "pkg_ps4_theme" => VolumeType::PkgPs4Theme,
            _ => {
                return Err(anyhow!(BuildError::InvalidProject(format!(
                    "unknown volume type: {}",
                    s
                ))))
            }
        })
    }

    pub fn content_type(self) -> ContentType {
        match self {
            VolumeType::PkgPs4App => ContentType::Gd,
            VolumeType::PkgPs4Patch | VolumeType::PkgPs4Remaster => ContentType::Dp,
            VolumeType::PkgPs4AcData | VolumeType::PkgPs4SfTheme | VolumeType::PkgPs4Theme => {
                ContentType::Ac
            }
            VolumeType::PkgPs4AcNodata => ContentType::Al,
        }
    }
}

/// PFS build options; `sign`/`encrypt` apply to the outer image.
#[derive(Debug, Clone)]
pub struct PfsOptions {
    pub sign: bool,
    pub encrypt: bool,
    /// Select the second-generation sector key derivation
    pub new_crypt: bool,
    pub block_size: u64,
    /// 16-byte image seed; randomized when absent
    pub seed: Option<[u8; 16]>,
    /// Minimum image footprint in blocks
    pub min_blocks: u64,
    /// Externally supplied EKPFS; derived from content id + passcode when absent
    pub ekpfs: Option<[u8; 32]>,
    /// Inode timestamp (epoch seconds); derived from the creation date when absent
    pub file_time: Option<u64>,
}

impl Default for PfsOptions {
    fn default() -> Self {
        Self {
            sign: true,
            encrypt: true,
            new_crypt: false,
            block_size: PFS_BLOCK_SIZE,
            seed: None,
            min_blocks: 0,
            ekpfs: None,
            file_time: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PkgProject {
    /// 36-character ASCII content id, e.g. "UP0000-TEST00000_00-0000000000000000"
    pub content_id: String,
    /// 32-character passcode
    pub passcode: String,
    /// Optional entitlement key, 32 hex digits
    pub entitlement_key: Option<String>,
    pub volume_type: VolumeType,
    pub creation_date: Option<NaiveDate>,
    pub use_creation_time: bool,
    /// Staging tree root on disk
    pub root_dir: PathBuf,
    pub pfs: PfsOptions,
}

impl PkgProject {
    pub fn new(content_id: &str, passcode: &str, volume_type: VolumeType, root_dir: &Path) -> Self {
        Self {
            content_id: content_id.to_string(),
            passcode: passcode.to_string(),
            entitlement_key: None,
            volume_type,
            creation_date: None,
            use_creation_time: false,
            root_dir: root_dir.to_path_buf(),
            pfs: PfsOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.content_id.len() != 36 || !self.content_id.is_ascii() {
            return Err(anyhow!(BuildError::InvalidProject(format!(
                "content id must be 36 ASCII characters: {:?}",
                self.content_id
            ))));
        }
        if self.passcode.len() != 32 {
            return Err(anyhow!(BuildError::InvalidProject(
                "passcode must be 32 characters".to_string()
            )));
        }
        if let Some(ek) = &self.entitlement_key {
            let bytes = hex::decode(ek).map_err(|e| {
                anyhow!(BuildError::InvalidProject(format!(
                    "entitlement key is not hex: {}",
                    e
                )))
            })?;
            if bytes.len() != 16 {
                return Err(anyhow!(BuildError::InvalidProject(
                    "entitlement key must be 16 bytes".to_string()
                )));
            }
        }
        if self.pfs.block_size != PFS_BLOCK_SIZE {
            return Err(anyhow!(BuildError::InvalidProject(format!(
                "unsupported block size {:#x}",
                self.pfs.block_size
            ))));
        }
        Ok(())
    }

    pub fn entitlement_key_bytes(&self) -> Option<[u8; 16]> {
        let ek = self.entitlement_key.as_ref()?;
        let bytes = hex::decode(ek).ok()?;
        bytes.try_into().ok()
    }

    /// Date stamped into PUBTOOLINFO and the header version_date
    pub fn effective_date(&self) -> NaiveDate {
        self.creation_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Timestamp for every PFS inode
    pub fn effective_file_time(&self) -> u64 {
        if let Some(t) = self.pfs.file_time {
            return t;
        }
        self.effective_date()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp() as u64)
            .unwrap_or(0)
    }

    pub fn c_date(&self) -> String {
        let d = self.effective_date();
        format!("{:04}{:02}{:02}", d.year(), d.month(), d.day())
    }

    pub fn c_time(&self) -> Option<String> {
        if !self.use_creation_time {
            return None;
        }
        let t = Utc::now().time();
        Some(format!("{:02}{:02}{:02}", t.hour(), t.minute(), t.second()))
    }

    /// Parse a `key=value` project description, one pair per line.
    /// Relative `root_dir` resolves against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read project {}", path.display()))?;
        let base = path.parent().unwrap_or(Path::new("."));
        let mut content_id = None;
        let mut passcode = None;
        let mut volume_type = None;
        let mut root_dir = None;
        let mut project = None::<PkgProject>;
        let mut pending: Vec<(String, String)> = vec![];
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("bad project line: {}", line))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "content_id" => content_id = Some(value.to_string()),
                "passcode" => passcode = Some(value.to_string()),
                "volume_type" => volume_type = Some(VolumeType::parse(value)?),
                "root_dir" => root_dir = Some(base.join(value)),
                _ => pending.push((key.to_string(), value.to_string())),
            }
            if project.is_none() {
                if let (Some(cid), Some(pass), Some(vt), Some(root)) =
                    (&content_id, &passcode, &volume_type, &root_dir)
                {
                    project = Some(PkgProject::new(cid, pass, *vt, root));
                }
            }
        }
        let mut project = project.ok_or_else(|| {
            anyhow!(BuildError::InvalidProject(
                "project needs content_id, passcode, volume_type and root_dir".to_string()
            ))
        })?;
        for (key, value) in pending {
            let flag = || value == "true" || value == "1";
            match key.as_str() {
                "entitlement_key" => project.entitlement_key = Some(value.clone()),
                "creation_date" => {
                    project.creation_date =
                        Some(NaiveDate::parse_from_str(&value, "%Y-%m-%d").with_context(|| {
                            format!("creation_date must be YYYY-MM-DD: {}", value)
                        })?)
                }
                "use_creation_time" => project.use_creation_time = flag(),
                "sign" => project.pfs.sign = flag(),
                "encrypt" => project.pfs.encrypt = flag(),
                "new_crypt" => project.pfs.new_crypt = flag(),
                "min_blocks" => project.pfs.min_blocks = value.parse()?,
                "file_time" => project.pfs.file_time = Some(value.parse()?),
                "seed" => {
                    let bytes = hex::decode(&value)?;
                    project.pfs.seed = Some(
                        bytes
                            .try_into()
                            .map_err(|_| anyhow!("seed must be 16 bytes of hex"))?,
                    );
                }
                _ => log::warn!("unused project option: {} = {}", key, value),
            }
        }
        project.validate()?;
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn volume_mapping() -> Result<()> {
        assert_eq!(VolumeType::parse("pkg_ps4_app")?.content_type(), ContentType::Gd);
        assert_eq!(VolumeType::parse("pkg_ps4_patch")?.content_type(), ContentType::Dp);
        assert_eq!(VolumeType::parse("pkg_ps4_ac_nodata")?.content_type(), ContentType::Al);
        assert!(VolumeType::parse("pkg_ps5_app").is_err());
        Ok(())
    }

    #[test]
    fn validation_catches_bad_fields() {
        let mut p = PkgProject::new(
            "UP0000-TEST00000_00-0000000000000000",
            "00000000000000000000000000000000",
            VolumeType::PkgPs4App,
            Path::new("root"),
        );
        assert!(p.validate().is_ok());
        p.passcode = "short".into();
        assert!(p.validate().is_err());
        p.passcode = "00000000000000000000000000000000".into();
        p.entitlement_key = Some("zz".into());
        assert!(p.validate().is_err());
        p.entitlement_key = Some("00112233445566778899aabbccddeeff".into());
        assert!(p.validate().is_ok());
        assert_eq!(
            p.entitlement_key_bytes(),
            Some([0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
    }

    #[test]
    fn date_formatting() {
        let mut p = PkgProject::new(
            "UP0000-TEST00000_00-0000000000000000",
            "00000000000000000000000000000000",
            VolumeType::PkgPs4App,
            Path::new("root"),
        );
        p.creation_date = NaiveDate::from_ymd_opt(2024, 3, 9);
        assert_eq!(p.c_date(), "20240309");
        assert_eq!(p.c_time(), None);
        assert_eq!(p.effective_file_time(), 1709942400);
    }
}
