//! m.secret_storage.v1.aes-hmac-sha2
//!
//! - HKDF-SHA256（32 字节全零 salt，info = secret 名称）派生 64 字节：前 32 字节 AES 密钥，后 32 字节 MAC 密钥
//! - AES-256-CTR，无填充，随机 16 字节 IV（清除第 63 位）
//! - HMAC-SHA256 覆盖密文；解密前先校验 MAC

use aes::Aes256;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::types::{EncryptedData, KeyDescription};
use crate::error::{MatrixError, Result};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// 解码时接受带或不带 '=' 填充的 base64
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

struct SubKeys {
    aes: Zeroizing<[u8; 32]>,
    mac: Zeroizing<[u8; 32]>,
}

fn derive_keys(key: &[u8], name: &str) -> Result<SubKeys> {
    let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; 32]), key);
    let mut okm = Zeroizing::new([0u8; 64]);
    hkdf.expand(name.as_bytes(), &mut okm[..])
        .map_err(|e| MatrixError::Crypto(format!("HKDF 派生失败: {}", e)))?;

    let mut aes = Zeroizing::new([0u8; 32]);
    let mut mac = Zeroizing::new([0u8; 32]);
    aes.copy_from_slice(&okm[..32]);
    mac.copy_from_slice(&okm[32..]);
    Ok(SubKeys { aes, mac })
}

fn apply_ctr(aes_key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    let mut cipher = Aes256Ctr::new_from_slices(aes_key, iv)
        .map_err(|e| MatrixError::Crypto(format!("AES-CTR 初始化失败: {}", e)))?;
    cipher.apply_keystream(buf);
    Ok(())
}

fn hmac(mac_key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|e| MatrixError::Crypto(format!("HMAC 初始化失败: {}", e)))
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    LENIENT_BASE64
        .decode(value)
        .map_err(|e| MatrixError::InvalidData(format!("{} 不是合法的 base64: {}", field, e)))
}

/// 随机 IV；第 63 位清零，避免计数器在 64 位边界溢出（与其他客户端互通）
fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv[8] &= 0x7f;
    iv
}

/// key id = base64(SHA-256(key)[0..12])，去掉末尾 '='
pub fn compute_key_id(key: &[u8]) -> String {
    let hash = Sha256::digest(key);
    STANDARD.encode(&hash[..12]).trim_end_matches('=').to_string()
}

/// 新的 32 字节随机 key
pub fn generate_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
    OsRng.fill_bytes(key.as_mut_slice());
    key
}

fn encrypt_with_iv(name: &str, data: &[u8], key: &[u8], iv: &[u8; IV_LEN]) -> Result<EncryptedData> {
    let keys = derive_keys(key, name)?;

    let mut ciphertext = data.to_vec();
    apply_ctr(&keys.aes[..], iv, &mut ciphertext)?;

    let mut mac = hmac(&keys.mac[..])?;
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    Ok(EncryptedData {
        iv: STANDARD.encode(iv),
        ciphertext: STANDARD.encode(&ciphertext),
        mac: STANDARD.encode(tag),
    })
}

pub fn encrypt(name: &str, data: &[u8], key: &[u8]) -> Result<EncryptedData> {
    encrypt_with_iv(name, data, key, &random_iv())
}

/// 先校验 MAC（常量时间），通过后才解密
pub fn decrypt(name: &str, encrypted: &EncryptedData, key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let iv = decode("iv", &encrypted.iv)?;
    let ciphertext = decode("ciphertext", &encrypted.ciphertext)?;
    let stored_mac = decode("mac", &encrypted.mac)?;

    let keys = derive_keys(key, name)?;

    let mut mac = hmac(&keys.mac[..])?;
    mac.update(&ciphertext);
    mac.verify_slice(&stored_mac).map_err(|_| MatrixError::MacMismatch)?;

    let mut plaintext = Zeroizing::new(ciphertext);
    apply_ctr(&keys.aes[..], &iv, plaintext.as_mut_slice())?;
    Ok(plaintext)
}

/// 全零探针：注册 key 时生成 iv / mac，校验 key 时用同一 iv 重算
pub fn encrypt_probe(key: &[u8]) -> Result<EncryptedData> {
    encrypt("", &[0u8; KEY_LEN], key)
}

/// `key` 是否与 description 中的 iv / mac 吻合；任何结构或密码学不匹配都返回 false
pub fn check_key(key: &[u8], description: &KeyDescription) -> bool {
    let (Some(iv), Some(stored_mac)) = (description.iv.as_deref(), description.mac.as_deref()) else {
        return false;
    };
    let (Ok(iv), Ok(stored_mac)) = (decode("iv", iv), decode("mac", stored_mac)) else {
        return false;
    };
    let Ok(keys) = derive_keys(key, "") else {
        return false;
    };

    let mut probe = [0u8; KEY_LEN];
    if apply_ctr(&keys.aes[..], &iv, &mut probe).is_err() {
        return false;
    }
    let Ok(mut mac) = hmac(&keys.mac[..]) else {
        return false;
    };
    mac.update(&probe);
    mac.verify_slice(&stored_mac).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn round_trip() {
        let data = br#"{"key":"c2VjcmV0"}"#;
        let encrypted = encrypt("m.cross_signing.master", data, &KEY).unwrap();
        let decrypted = decrypt("m.cross_signing.master", &encrypted, &KEY).unwrap();
        assert_eq!(decrypted.as_slice(), data);
    }

    #[test]
    fn empty_payload_round_trips() {
        let encrypted = encrypt("x", b"", &KEY).unwrap();
        assert!(decrypt("x", &encrypted, &KEY).unwrap().is_empty());
    }

    #[test]
    fn iv_has_bit_63_cleared() {
        for _ in 0..16 {
            let encrypted = encrypt("n", b"data", &KEY).unwrap();
            let iv = STANDARD.decode(&encrypted.iv).unwrap();
            assert_eq!(iv.len(), 16);
            assert_eq!(iv[8] & 0x80, 0);
        }
    }

    #[test]
    fn flipped_ciphertext_bit_is_rejected() {
        let encrypted = encrypt("n", b"attack at dawn", &KEY).unwrap();
        let mut ciphertext = STANDARD.decode(&encrypted.ciphertext).unwrap();
        ciphertext[0] ^= 0x01;
        let tampered = EncryptedData {
            ciphertext: STANDARD.encode(&ciphertext),
            ..encrypted
        };
        assert_eq!(decrypt("n", &tampered, &KEY).unwrap_err(), MatrixError::MacMismatch);
    }

    #[test]
    fn flipped_mac_bit_is_rejected() {
        let encrypted = encrypt("n", b"attack at dawn", &KEY).unwrap();
        let mut mac = STANDARD.decode(&encrypted.mac).unwrap();
        mac[31] ^= 0x80;
        let tampered = EncryptedData {
            mac: STANDARD.encode(&mac),
            ..encrypted
        };
        assert_eq!(decrypt("n", &tampered, &KEY).unwrap_err(), MatrixError::MacMismatch);
    }

    #[test]
    fn truncated_mac_is_rejected() {
        let encrypted = encrypt("n", b"payload", &KEY).unwrap();
        let mac = STANDARD.decode(&encrypted.mac).unwrap();
        let tampered = EncryptedData {
            mac: STANDARD.encode(&mac[..16]),
            ..encrypted
        };
        assert_eq!(decrypt("n", &tampered, &KEY).unwrap_err(), MatrixError::MacMismatch);
    }

    #[test]
    fn wrong_name_or_key_fails_mac() {
        let encrypted = encrypt("a", b"payload", &KEY).unwrap();
        assert_eq!(decrypt("b", &encrypted, &KEY).unwrap_err(), MatrixError::MacMismatch);
        assert_eq!(decrypt("a", &encrypted, &[8u8; 32]).unwrap_err(), MatrixError::MacMismatch);
    }

    #[test]
    fn malformed_base64_is_invalid_data() {
        let encrypted = EncryptedData {
            iv: "!!!".into(),
            ciphertext: "AAAA".into(),
            mac: "AAAA".into(),
        };
        assert!(matches!(decrypt("n", &encrypted, &KEY), Err(MatrixError::InvalidData(_))));
    }

    #[test]
    fn unpadded_base64_is_accepted() {
        let encrypted = encrypt("n", b"hello", &KEY).unwrap();
        let unpadded = EncryptedData {
            iv: encrypted.iv.trim_end_matches('=').to_string(),
            ciphertext: encrypted.ciphertext.trim_end_matches('=').to_string(),
            mac: encrypted.mac.trim_end_matches('=').to_string(),
        };
        assert_eq!(decrypt("n", &unpadded, &KEY).unwrap().as_slice(), b"hello");
    }

    #[test]
    fn key_id_is_deterministic_and_distinct() {
        let a = compute_key_id(&KEY);
        assert_eq!(a, compute_key_id(&KEY));
        assert_eq!(a.len(), 16);
        assert!(!a.ends_with('='));
        assert_ne!(a, compute_key_id(&[8u8; 32]));
    }

    #[test]
    fn probe_validates_only_matching_key() {
        let probe = encrypt_probe(&KEY).unwrap();
        let description = KeyDescription::new(None, None, probe.iv, probe.mac);
        assert!(check_key(&KEY, &description));
        assert!(!check_key(&[9u8; 32], &description));

        let no_mac = KeyDescription { mac: None, ..description };
        assert!(!check_key(&KEY, &no_mac));
    }

    #[test]
    fn generated_keys_differ() {
        let a = generate_key();
        let b = generate_key();
        assert_eq!(a.len(), KEY_LEN);
        assert_ne!(a.as_slice(), b.as_slice());
    }
}
