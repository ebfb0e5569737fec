//! 加密 secret 存储（SSSS）
//!
//! secret 以 `{"encrypted": {keyId: {iv, ciphertext, mac}}}` 的形式保存在账户数据中，
//! 同一个 secret 可以同时被多个 key 加密。
//!
//! 状态机：`Uninitialized → NeedKey(description) → Online(keyId)`，另有终态 `Error`。

pub mod crypto;
pub mod key_cache;
pub mod types;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::account_data::AccountDataChannel;
use crate::error::{MatrixError, Result};
use crate::events::{EventManager, SessionEvent};
use crate::models::constants::{secret_storage_key_type, M_SECRET_STORAGE_DEFAULT_KEY};

pub use crypto::{compute_key_id, decrypt, encrypt};
pub use key_cache::{MemoryKeyCache, SecureKeyCache};
pub use types::{DefaultKeyContent, EncryptedData, KeyDescription, Passphrase, Secret};

/// 向本机 key 缓存请求 key 时展示给用户的说明
const KEY_CACHE_REASON: &str = "The app needs to load cryptographic keys for your account";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretStoreState {
    /// 账户还没有默认 key
    Uninitialized,
    /// 有默认 key，但本地拿不到，需要用户提供口令
    NeedKey(KeyDescription),
    Online(String),
    Error(String),
}

pub struct SecretStore {
    account_data: Arc<dyn AccountDataChannel>,
    key_cache: Arc<dyn SecureKeyCache>,
    keys: RwLock<HashMap<String, Zeroizing<Vec<u8>>>>,
    state: RwLock<SecretStoreState>,
    default_key_id: RwLock<Option<String>>,
    events: Option<Arc<EventManager>>,
}

impl SecretStore {
    fn empty(
        account_data: Arc<dyn AccountDataChannel>,
        key_cache: Arc<dyn SecureKeyCache>,
        keys: HashMap<String, Zeroizing<Vec<u8>>>,
    ) -> Self {
        Self {
            account_data,
            key_cache,
            keys: RwLock::new(keys),
            state: RwLock::new(SecretStoreState::Uninitialized),
            default_key_id: RwLock::new(None),
            events: None,
        }
    }

    /// 以 `key` 作为默认 key 上线。
    ///
    /// 远端没有默认 key 时注册并设为默认；已有不同的默认 key 时覆盖默认指针。
    /// 旧 key 加密的 secret 不会被重新加密。
    pub async fn with_default_key(
        account_data: Arc<dyn AccountDataChannel>,
        key_cache: Arc<dyn SecureKeyCache>,
        key: &[u8],
    ) -> Result<Self> {
        let key_id = compute_key_id(key);
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), Zeroizing::new(key.to_vec()));
        let store = Self::empty(account_data, key_cache, keys);

        match store.get_default_key_id().await? {
            Some(existing) if existing == key_id => {
                debug!("🔑 默认 key [{}] 已注册", key_id);
            }
            Some(existing) => {
                info!("🔑 默认 key 由 [{}] 切换为 [{}]", existing, key_id);
                store.register_key(key, &key_id, None, None).await?;
                store.set_default_key_id(&key_id).await?;
                warn!("⚠️ [{}] 加密的 secret 未用新 key 重新加密", existing);
            }
            None => {
                info!("🔑 账户没有默认 key，注册 [{}]", key_id);
                store.register_key(key, &key_id, None, None).await?;
                store.set_default_key_id(&key_id).await?;
            }
        }

        if !store.key_cache.save_key(key, &key_id).await {
            warn!("本机 key 缓存保存 [{}] 失败", key_id);
        }
        *store.default_key_id.write() = Some(key_id.clone());
        *store.state.write() = SecretStoreState::Online(key_id);
        Ok(store)
    }

    /// 用一组已知 key 初始化，依次查找：内存 key 表 → 本机 key 缓存 → 需要口令
    pub async fn with_keys(
        account_data: Arc<dyn AccountDataChannel>,
        key_cache: Arc<dyn SecureKeyCache>,
        keys: HashMap<String, Vec<u8>>,
    ) -> Result<Self> {
        let keys = keys.into_iter().map(|(id, key)| (id, Zeroizing::new(key))).collect();
        let store = Self::empty(account_data, key_cache, keys);

        let Some(default_key_id) = store.get_default_key_id().await? else {
            warn!("账户没有默认 secret storage key");
            return Ok(store);
        };
        *store.default_key_id.write() = Some(default_key_id.clone());

        if store.keys.read().contains_key(&default_key_id) {
            info!("🔓 SecretStore online，key [{}]", default_key_id);
            *store.state.write() = SecretStoreState::Online(default_key_id);
            return Ok(store);
        }

        if let Some(key) = store.key_cache.load_key(&default_key_id, KEY_CACHE_REASON).await {
            info!("🔓 从本机缓存加载 key [{}]", default_key_id);
            store.keys.write().insert(default_key_id.clone(), key);
            *store.state.write() = SecretStoreState::Online(default_key_id);
            return Ok(store);
        }

        let state = match store.get_key_description(&default_key_id).await? {
            Some(description) => {
                debug!("默认 key [{}] 不在本地，等待口令", default_key_id);
                SecretStoreState::NeedKey(description)
            }
            None => {
                warn!("默认 key [{}] 缺少 key description", default_key_id);
                SecretStoreState::Error(format!("missing description for default key {}", default_key_id))
            }
        };
        *store.state.write() = state;
        Ok(store)
    }

    /// 状态变化时向事件管理器广播
    pub fn with_event_manager(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> SecretStoreState {
        self.state.read().clone()
    }

    pub fn is_online(&self) -> bool {
        matches!(*self.state.read(), SecretStoreState::Online(_))
    }

    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 新的随机 key 及其 key id
    pub fn generate_key() -> (String, Zeroizing<Vec<u8>>) {
        let key = crypto::generate_key();
        (compute_key_id(&key), key)
    }

    fn key_for(&self, key_id: &str) -> Option<Zeroizing<Vec<u8>>> {
        self.keys.read().get(key_id).cloned()
    }

    async fn fetch_secret(&self, secret_type: &str) -> Result<Option<Secret>> {
        let Some(value) = self.account_data.get_account_data(secret_type).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<Secret>(value) {
            Ok(secret) => Ok(Some(secret)),
            Err(e) => {
                warn!("secret [{}] 格式不正确: {}", secret_type, e);
                Ok(None)
            }
        }
    }

    /// 读取并解密 secret；没有任何可用 key 时返回 `None`
    pub async fn get_secret<T: DeserializeOwned>(&self, secret_type: &str) -> Result<Option<T>> {
        let Some(secret) = self.fetch_secret(secret_type).await? else {
            debug!("secret [{}] 不存在", secret_type);
            return Ok(None);
        };

        for (key_id, encrypted) in &secret.encrypted {
            let Some(key) = self.key_for(key_id) else {
                debug!("没有 key [{}]，跳过", key_id);
                continue;
            };
            let plaintext = match decrypt(secret_type, encrypted, &key) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!("用 key [{}] 解密 [{}] 失败: {}", key_id, secret_type, e);
                    continue;
                }
            };
            match serde_json::from_slice::<T>(&plaintext) {
                Ok(value) => {
                    debug!("🔓 secret [{}] 已用 key [{}] 解密", secret_type, key_id);
                    return Ok(Some(value));
                }
                Err(e) => warn!("secret [{}] 解密后无法反序列化: {}", secret_type, e),
            }
        }

        warn!("没有可用的 key 解密 secret [{}]", secret_type);
        Ok(None)
    }

    /// 用当前默认 key 加密并保存，只覆盖该 key id 对应的条目
    pub async fn save_secret<T: Serialize>(&self, content: &T, secret_type: &str) -> Result<()> {
        let SecretStoreState::Online(key_id) = self.state() else {
            return Err(MatrixError::InvalidState(
                "secret storage is not online; a decryption key is required".to_string(),
            ));
        };
        let key = self
            .key_for(&key_id)
            .ok_or_else(|| MatrixError::NotFound(format!("encryption key {}", key_id)))?;

        let mut secret = self.fetch_secret(secret_type).await?.unwrap_or_default();
        let data = Zeroizing::new(serde_json::to_vec(content)?);
        let encrypted = encrypt(secret_type, &data, &key)?;
        secret.encrypted.insert(key_id.clone(), encrypted);

        self.account_data
            .put_account_data(secret_type, serde_json::to_value(&secret)?)
            .await?;
        info!("🔐 secret [{}] 已用 key [{}] 保存", secret_type, key_id);
        Ok(())
    }

    pub async fn get_key_description(&self, key_id: &str) -> Result<Option<KeyDescription>> {
        let Some(value) = self
            .account_data
            .get_account_data(&secret_storage_key_type(key_id))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    /// 上传 key description：全零探针的 iv / mac 用于之后校验 key
    pub async fn register_key(
        &self,
        key: &[u8],
        key_id: &str,
        name: Option<String>,
        passphrase: Option<Passphrase>,
    ) -> Result<()> {
        let probe = crypto::encrypt_probe(key)?;
        let description = KeyDescription::new(name, passphrase, probe.iv, probe.mac);
        self.account_data
            .put_account_data(&secret_storage_key_type(key_id), serde_json::to_value(&description)?)
            .await?;
        debug!("🔑 key [{}] 已注册", key_id);
        Ok(())
    }

    /// `key` 是否与远端保存的 key description 吻合；任何失败都返回 false
    pub async fn validate_key(&self, key: &[u8], key_id: &str) -> bool {
        match self.get_key_description(key_id).await {
            Ok(Some(description)) => crypto::check_key(key, &description),
            Ok(None) => false,
            Err(e) => {
                warn!("读取 key [{}] description 失败: {}", key_id, e);
                false
            }
        }
    }

    pub async fn set_default_key_id(&self, key_id: &str) -> Result<()> {
        let content = DefaultKeyContent { key: key_id.to_string() };
        self.account_data
            .put_account_data(M_SECRET_STORAGE_DEFAULT_KEY, serde_json::to_value(&content)?)
            .await
    }

    pub async fn get_default_key_id(&self) -> Result<Option<String>> {
        let Some(value) = self.account_data.get_account_data(M_SECRET_STORAGE_DEFAULT_KEY).await? else {
            return Ok(None);
        };
        let content: DefaultKeyContent = serde_json::from_value(value)?;
        Ok(Some(content.key))
    }

    /// 用户输入口令得到 key 后调用：校验、加入 key 表、写入本机缓存；
    /// 若正是缺失的默认 key，则 `NeedKey → Online`。返回 key 是否有效。
    pub async fn add_key(&self, key: &[u8], key_id: &str) -> Result<bool> {
        if !self.validate_key(key, key_id).await {
            warn!("key [{}] 校验失败", key_id);
            return Ok(false);
        }

        self.keys
            .write()
            .insert(key_id.to_string(), Zeroizing::new(key.to_vec()));
        if !self.key_cache.save_key(key, key_id).await {
            warn!("本机 key 缓存保存 [{}] 失败", key_id);
        }

        let is_default = self.default_key_id.read().as_deref() == Some(key_id);
        let became_online = {
            let mut state = self.state.write();
            if is_default && matches!(*state, SecretStoreState::NeedKey(_)) {
                *state = SecretStoreState::Online(key_id.to_string());
                true
            } else {
                false
            }
        };

        if became_online {
            info!("🔓 SecretStore online，key [{}]", key_id);
            if let Some(events) = &self.events {
                events.emit(SessionEvent::secret_store_state_changed(self.state())).await;
            }
        }
        Ok(true)
    }
}
