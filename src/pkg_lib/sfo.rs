/// Minimal param.sfo reader/writer: enough to parse the staged file,
/// rewrite the publishing-tool fields and serialize deterministically.
use anyhow::{anyhow, Result};

pub const SFO_MAGIC: u32 = 0x46535000 /* "\0PSF" */;
pub const SFO_VERSION: u32 = 0x0101;

pub const SFO_FMT_UTF8_SPECIAL: u16 = 0x0004;
pub const SFO_FMT_UTF8: u16 = 0x0204;
pub const SFO_FMT_INT32: u16 = 0x0404;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SfoValue {
    Str(String),
    Int(u32),
    /// Raw bytes for formats this tool does not interpret
    Bytes(u16, Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct SfoEntry {
    pub key: String,
    pub value: SfoValue,
    pub max_len: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SfoFile {
    pub entries: Vec<SfoEntry>,
}

impl SfoFile {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 0x14 {
            return Err(anyhow!("param.sfo too short"));
        }
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let u16_at = |o: usize| u16::from_le_bytes(buf[o..o + 2].try_into().unwrap());
        if u32_at(0) != SFO_MAGIC {
            return Err(anyhow!("bad param.sfo magic {:#x}", u32_at(0)));
        }
        let key_table = u32_at(0x08) as usize;
        let data_table = u32_at(0x0C) as usize;
        let count = u32_at(0x10) as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let e = 0x14 + i * 0x10;
            if e + 0x10 > buf.len() {
                return Err(anyhow!("param.sfo index truncated"));
            }
            let key_offset = key_table + u16_at(e) as usize;
            let fmt = u16_at(e + 2);
            let len = u32_at(e + 4) as usize;
            let max_len = u32_at(e + 8);
            let data_offset = data_table + u32_at(e + 12) as usize;
            let key_end = buf[key_offset..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| key_offset + p)
                .ok_or_else(|| anyhow!("unterminated param.sfo key"))?;
            let key = String::from_utf8(buf[key_offset..key_end].to_vec())?;
            if data_offset + len > buf.len() {
                return Err(anyhow!("param.sfo data truncated for {}", key));
            }
            let data = &buf[data_offset..data_offset + len];
            let value = match fmt {
                SFO_FMT_INT32 => SfoValue::Int(u32::from_le_bytes(data[0..4].try_into().unwrap())),
                SFO_FMT_UTF8 => {
                    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                    SfoValue::Str(String::from_utf8_lossy(&data[..end]).to_string())
                }
                _ => SfoValue::Bytes(fmt, data.to_vec()),
            };
            entries.push(SfoEntry {
                key,
                value,
                max_len,
            });
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&SfoValue> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(SfoValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        let needed = (value.len() as u32 + 1 + 3) / 4 * 4;
        if let Some(e) = self.entries.iter_mut().find(|e| e.key == key) {
            e.value = SfoValue::Str(value.to_string());
            e.max_len = e.max_len.max(needed);
        } else {
            self.entries.push(SfoEntry {
                key: key.to_string(),
                value: SfoValue::Str(value.to_string()),
                max_len: needed,
            });
        }
    }

    pub fn set_int(&mut self, key: &str, value: u32) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.key == key) {
            e.value = SfoValue::Int(value);
            e.max_len = 4;
        } else {
            self.entries.push(SfoEntry {
                key: key.to_string(),
                value: SfoValue::Int(value),
                max_len: 4,
            });
        }
    }

    /// Serialize with alphabetically sorted keys, 4-aligned tables.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut entries: Vec<&SfoEntry> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let mut key_table = vec![];
        let mut index = vec![];
        let mut data_table = vec![];
        for e in &entries {
            let key_offset = key_table.len() as u16;
            key_table.extend_from_slice(e.key.as_bytes());
            key_table.push(0);
            let (fmt, data, len) = match &e.value {
                SfoValue::Int(v) => (SFO_FMT_INT32, v.to_le_bytes().to_vec(), 4u32),
                SfoValue::Str(s) => {
                    let mut d = s.as_bytes().to_vec();
                    d.push(0);
                    let len = d.len() as u32;
                    (SFO_FMT_UTF8, d, len)
                }
                SfoValue::Bytes(fmt, d) => (*fmt, d.clone(), d.len() as u32),
            };
            let max_len = e.max_len.max(len);
            let data_offset = data_table.len() as u32;
            data_table.extend_from_slice(&data);
            data_table.resize(data_offset as usize + max_len as usize, 0);
            index.push((key_offset, fmt, len, max_len, data_offset));
        }
        while key_table.len() % 4 != 0 {
            key_table.push(0);
        }

        let key_table_start = 0x14 + entries.len() * 0x10;
        let data_table_start = key_table_start + key_table.len();
        let mut out = Vec::with_capacity(data_table_start + data_table.len());
        out.extend_from_slice(&SFO_MAGIC.to_le_bytes());
        out.extend_from_slice(&SFO_VERSION.to_le_bytes());
        out.extend_from_slice(&(key_table_start as u32).to_le_bytes());
        out.extend_from_slice(&(data_table_start as u32).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (key_offset, fmt, len, max_len, data_offset) in index {
            out.extend_from_slice(&key_offset.to_le_bytes());
            out.extend_from_slice(&fmt.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&max_len.to_le_bytes());
            out.extend_from_slice(&data_offset.to_le_bytes());
        }
        out.extend_from_slice(&key_table);
        out.extend_from_slice(&data_table);
        out
    }
}

/// Merge publishing-tool fields into PUBTOOLINFO, preserving unrelated
/// `k=v` pairs already present.
pub fn set_pubtool_info(sfo: &mut SfoFile, fields: &[(&str, String)]) {
    let mut pairs: Vec<(String, String)> = sfo
        .get_str("PUBTOOLINFO")
        .map(|s| {
            s.split(',')
                .filter_map(|kv| {
                    kv.split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();
    for (key, value) in fields {
        if let Some(p) = pairs.iter_mut().find(|(k, _)| k == key) {
            p.1 = value.clone();
        } else {
            pairs.push((key.to_string(), value.clone()));
        }
    }
    let joined = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    sfo.set_str("PUBTOOLINFO", &joined);
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn sample() -> SfoFile {
        let mut sfo = SfoFile::default();
        sfo.set_str("TITLE", "Test Title");
        sfo.set_str("TITLE_ID", "TEST00000");
        sfo.set_int("APP_VER", 0x0100);
        sfo
    }

    #[test]
    fn round_trip() -> Result<()> {
        let sfo = sample();
        let bytes = sfo.to_bytes();
        let back = SfoFile::from_bytes(&bytes)?;
        assert_eq!(back.get_str("TITLE"), Some("Test Title"));
        assert_eq!(back.get("APP_VER"), Some(&SfoValue::Int(0x0100)));
        // serialization is canonical
        assert_eq!(back.to_bytes(), bytes);
        Ok(())
    }

    #[test]
    fn pubtool_merge() -> Result<()> {
        let mut sfo = sample();
        sfo.set_str("PUBTOOLINFO", "sdk_ver=05050000,c_date=19990101");
        set_pubtool_info(
            &mut sfo,
            &[
                ("c_date", "20240309".to_string()),
                ("img0_l0_size", "1536".to_string()),
            ],
        );
        assert_eq!(
            sfo.get_str("PUBTOOLINFO"),
            Some("sdk_ver=05050000,c_date=20240309,img0_l0_size=1536")
        );
        Ok(())
    }

    #[test]
    fn grows_max_len() {
        let mut sfo = sample();
        sfo.set_str("TITLE", "A much longer title than before, much longer");
        let bytes = sfo.to_bytes();
        let back = SfoFile::from_bytes(&bytes).unwrap();
        assert_eq!(
            back.get_str("TITLE"),
            Some("A much longer title than before, much longer")
        );
    }
}
