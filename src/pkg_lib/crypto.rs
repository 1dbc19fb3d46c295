/// Crypto primitives: digests, key derivation, XTS sector transform and the
/// RSA keysets used for the image key and the header signature.
use aes::cipher::KeyInit;
use aes::Aes128;
use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use xts_mode::{get_tweak_default, Xts128};

use crate::pkg_lib::BuildError;

pub type HmacSha256 = Hmac<Sha256>;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| anyhow!(BuildError::CryptoFailure(e.to_string())))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Entry-key derivation: SHA-256 over a 96-byte buffer of content id,
/// key index and passcode. Index 1 yields the EKPFS.
pub fn compute_keys(content_id: &str, passcode: &str, index: u32) -> Result<[u8; 32]> {
    if content_id.len() != 36 {
        return Err(anyhow!(BuildError::InvalidProject(format!(
            "content id must be 36 characters, got {}",
            content_id.len()
        ))));
    }
    if passcode.len() != 32 {
        return Err(anyhow!(BuildError::InvalidProject(format!(
            "passcode must be 32 characters, got {}",
            passcode.len()
        ))));
    }
    let mut data = [0u8; 96];
    data[0..36].copy_from_slice(content_id.as_bytes());
    data[48..52].copy_from_slice(&index.to_le_bytes());
    data[64..96].copy_from_slice(passcode.as_bytes());
    Ok(sha256(&data))
}

pub const EKPFS_INDEX: u32 = 1;

/// PFS key generator: HMAC-SHA256(ekpfs, index_le ++ seed)
pub fn pfs_gen_crypto_key(ekpfs: &[u8; 32], seed: &[u8; 16], index: u32) -> Result<[u8; 32]> {
    let mut d = [0u8; 20];
    d[0..4].copy_from_slice(&index.to_le_bytes());
    d[4..20].copy_from_slice(seed);
    hmac_sha256(ekpfs, &d)
}

/// Per-block signature key (generator index 2)
pub fn pfs_sign_key(ekpfs: &[u8; 32], seed: &[u8; 16]) -> Result<[u8; 32]> {
    pfs_gen_crypto_key(ekpfs, seed, 2)
}

/// XTS key pair. The second-generation derivation uses generator index 3
/// instead of 1, so old and new images never share sector keys.
pub fn pfs_enc_keys(
    ekpfs: &[u8; 32],
    seed: &[u8; 16],
    new_crypt: bool,
) -> Result<([u8; 16], [u8; 16])> {
    let index = if new_crypt { 3 } else { 1 };
    let key = pfs_gen_crypto_key(ekpfs, seed, index)?;
    let mut tweak = [0u8; 16];
    let mut data = [0u8; 16];
    tweak.copy_from_slice(&key[0..16]);
    data.copy_from_slice(&key[16..32]);
    Ok((tweak, data))
}

/// AES-128-XTS transform over 4 KiB sectors, tweaked by sector index.
pub struct XtsSector {
    xts: Xts128<Aes128>,
}

impl XtsSector {
    pub fn new(tweak_key: &[u8; 16], data_key: &[u8; 16]) -> Result<Self> {
        let cipher_1 = Aes128::new_from_slice(data_key)
            .map_err(|e| anyhow!(BuildError::CryptoFailure(e.to_string())))?;
        let cipher_2 = Aes128::new_from_slice(tweak_key)
            .map_err(|e| anyhow!(BuildError::CryptoFailure(e.to_string())))?;
        Ok(Self {
            xts: Xts128::new(cipher_1, cipher_2),
        })
    }

    pub fn encrypt_sector(&self, buf: &mut [u8], sector: u64) {
        self.xts
            .encrypt_area(buf, buf.len(), sector as u128, get_tweak_default);
    }

    pub fn decrypt_sector(&self, buf: &mut [u8], sector: u64) {
        self.xts
            .decrypt_area(buf, buf.len(), sector as u128, get_tweak_default);
    }
}

/// Deterministic RNG seeded from build material, used wherever RSA needs
/// randomness so that identical projects produce identical bytes.
pub fn material_rng(label: &str, material: &[u8]) -> StdRng {
    let mut h = Sha256::new();
    h.update(label.as_bytes());
    h.update(material);
    StdRng::from_seed(h.finalize().into())
}

lazy_static! {
    /// Stand-in for the console keyset that wraps the EKPFS into the
    /// ImageKey entry. Derived from a fixed seed so builds reproduce.
    pub static ref FAKE_PFS_KEYSET: RsaPrivateKey = {
        let mut rng = material_rng("rpkg.fake-pfs-keyset", &[]);
        RsaPrivateKey::new(&mut rng, 2048).expect("RSA keyset generation")
    };
    /// Header signing key.
    pub static ref PKG_SIGN_KEY: RsaPrivateKey = {
        let mut rng = material_rng("rpkg.pkg-sign-key", &[]);
        RsaPrivateKey::new(&mut rng, 2048).expect("RSA keyset generation")
    };
}

/// RSA-2048 wrap of a key blob under `key`'s public half. Padding bytes come
/// from `material` so the ciphertext is reproducible.
pub fn rsa2048_encrypt_key(key: &RsaPrivateKey, msg: &[u8], material: &[u8]) -> Result<Vec<u8>> {
    let public = RsaPublicKey::from(key);
    let mut rng = material_rng("rpkg.rsa-wrap", material);
    public
        .encrypt(&mut rng, Pkcs1v15Encrypt, msg)
        .map_err(|e| anyhow!(BuildError::CryptoFailure(e.to_string())))
        .context("RSA key wrap")
}

/// RSA-2048 signature over a SHA-256 digest
pub fn rsa2048_sign_digest(key: &RsaPrivateKey, digest: &[u8; 32]) -> Result<Vec<u8>> {
    key.sign(Pkcs1v15Sign::new::<Sha256>(), digest)
        .map_err(|e| anyhow!(BuildError::CryptoFailure(e.to_string())))
        .context("RSA header signature")
}

pub fn rsa2048_verify_digest(key: &RsaPrivateKey, digest: &[u8; 32], sig: &[u8]) -> Result<()> {
    RsaPublicKey::from(key)
        .verify(Pkcs1v15Sign::new::<Sha256>(), digest, sig)
        .map_err(|e| anyhow!(BuildError::CryptoFailure(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    const CID: &str = "UP0000-TEST00000_00-0000000000000000";
    const PASS: &str = "00000000000000000000000000000000";

    #[test]
    fn compute_keys_is_stable() -> Result<()> {
        let a = compute_keys(CID, PASS, EKPFS_INDEX)?;
        let b = compute_keys(CID, PASS, EKPFS_INDEX)?;
        assert_eq!(a, b);
        // other indices derive different keys
        assert_ne!(a, compute_keys(CID, PASS, 2)?);
        assert!(compute_keys("short", PASS, 1).is_err());
        Ok(())
    }

    #[test]
    fn enc_keys_differ_between_crypt_generations() -> Result<()> {
        let ekpfs = compute_keys(CID, PASS, EKPFS_INDEX)?;
        let seed = [7u8; 16];
        let old = pfs_enc_keys(&ekpfs, &seed, false)?;
        let new = pfs_enc_keys(&ekpfs, &seed, true)?;
        assert_ne!(old, new);
        Ok(())
    }

    #[test]
    fn xts_round_trip() -> Result<()> {
        let xts = XtsSector::new(&[1u8; 16], &[2u8; 16])?;
        let plain = [0x5Au8; 0x1000];
        let mut buf = plain;
        xts.encrypt_sector(&mut buf, 16);
        assert_ne!(buf, plain);
        xts.decrypt_sector(&mut buf, 16);
        assert_eq!(buf, plain);
        // tweak matters
        let mut other = plain;
        xts.encrypt_sector(&mut other, 17);
        let mut again = plain;
        xts.encrypt_sector(&mut again, 16);
        assert_ne!(other, again);
        Ok(())
    }

    #[test]
    fn rsa_sign_verify() -> Result<()> {
        let digest = sha256(b"header bytes");
        let sig = rsa2048_sign_digest(&PKG_SIGN_KEY, &digest)?;
        assert_eq!(sig.len(), 256);
        rsa2048_verify_digest(&PKG_SIGN_KEY, &digest, &sig)?;
        assert!(rsa2048_verify_digest(&PKG_SIGN_KEY, &sha256(b"other"), &sig).is_err());
        Ok(())
    }

    #[test]
    fn rsa_wrap_is_deterministic() -> Result<()> {
        let msg = [3u8; 32];
        let a = rsa2048_encrypt_key(&FAKE_PFS_KEYSET, &msg, b"material")?;
        let b = rsa2048_encrypt_key(&FAKE_PFS_KEYSET, &msg, b"material")?;
        assert_eq!(a, b);
        let c = rsa2048_encrypt_key(&FAKE_PFS_KEYSET, &msg, b"other material")?;
        assert_ne!(a, c);
        Ok(())
    }
}
