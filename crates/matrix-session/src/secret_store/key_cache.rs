//! 本机安全 key 缓存
//!
//! 平台实现（keychain / keystore）通常需要用户在场验证，`reason` 是展示给用户的说明。
//! 任何失败都按「key 不可用」处理。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use zeroize::Zeroizing;

#[async_trait]
pub trait SecureKeyCache: Send + Sync {
    async fn load_key(&self, key_id: &str, reason: &str) -> Option<Zeroizing<Vec<u8>>>;

    /// 返回是否保存成功
    async fn save_key(&self, key: &[u8], key_id: &str) -> bool;
}

/// 进程内缓存
#[derive(Default)]
pub struct MemoryKeyCache {
    keys: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.lock().contains_key(key_id)
    }
}

impl std::fmt::Debug for MemoryKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyCache")
            .field("key_ids", &self.keys.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl SecureKeyCache for MemoryKeyCache {
    async fn load_key(&self, key_id: &str, _reason: &str) -> Option<Zeroizing<Vec<u8>>> {
        self.keys.lock().get(key_id).cloned()
    }

    async fn save_key(&self, key: &[u8], key_id: &str) -> bool {
        self.keys
            .lock()
            .insert(key_id.to_string(), Zeroizing::new(key.to_vec()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_loads() {
        let cache = MemoryKeyCache::new();
        assert!(cache.load_key("k", "test").await.is_none());
        assert!(cache.save_key(&[1, 2, 3], "k").await);
        assert_eq!(cache.load_key("k", "test").await.unwrap().as_slice(), &[1, 2, 3]);
        assert!(format!("{:?}", cache).contains("\"k\""));
    }
}
