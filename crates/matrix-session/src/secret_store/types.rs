//! Secret storage 的线上格式

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::constants::M_SECRET_STORAGE_V1_AES_HMAC_SHA2;

/// 一份密文：iv / ciphertext / mac 均为 base64
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub iv: String,
    pub ciphertext: String,
    pub mac: String,
}

/// 账户数据中的一个 secret，可同时被多个 key 加密
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub encrypted: BTreeMap<String, EncryptedData>,
}

/// 从口令派生 key 的参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passphrase {
    /// 目前只有 `m.pbkdf2`
    pub algorithm: String,
    pub salt: String,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<u32>,
}

/// `m.secret_storage.key.<keyId>` 的内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<Passphrase>,
    /// 全零探针的 iv / mac，用于校验 key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl KeyDescription {
    pub fn new(name: Option<String>, passphrase: Option<Passphrase>, iv: String, mac: String) -> Self {
        Self {
            name,
            algorithm: M_SECRET_STORAGE_V1_AES_HMAC_SHA2.to_string(),
            passphrase,
            iv: Some(iv),
            mac: Some(mac),
        }
    }
}

/// `m.secret_storage.default_key` 的内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultKeyContent {
    pub key: String,
}
