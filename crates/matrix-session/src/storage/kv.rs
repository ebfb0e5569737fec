//! sled 键值存储
//!
//! 存放同步游标等小块数据，值统一序列化为 JSON。每个会话使用一个以用户命名的 Tree。

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{MatrixError, Result};

const MAX_OPEN_RETRIES: u32 = 6;
const RETRY_DELAY_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct KvStore {
    db: Db,
    tree: Tree,
}

impl KvStore {
    /// 打开 `path` 下的 sled 数据库并选中 `namespace` Tree。
    ///
    /// 上一个会话可能刚释放文件锁，锁冲突时按指数退避重试。
    pub async fn open(path: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        let path = path.as_ref();
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| MatrixError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        let mut attempt = 0;
        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(MatrixError::KvStore(format!("打开 sled 数据库失败: {}", e)));
                    }
                    let delay = RETRY_DELAY_MS * (1 << (attempt - 1));
                    warn!("🔒 sled 数据库被占用，{}ms 后重试 ({}/{})", delay, attempt, MAX_OPEN_RETRIES);
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        };

        let store = Self::with_db(db, namespace)?;
        info!("🗝️ KV 存储已打开: {} [{}]", path.display(), namespace);
        Ok(store)
    }

    /// 进程退出即删除的临时库（InMemory 会话与测试）
    pub fn temporary(namespace: &str) -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| MatrixError::KvStore(format!("创建临时 sled 数据库失败: {}", e)))?;
        Self::with_db(db, namespace)
    }

    fn with_db(db: Db, namespace: &str) -> Result<Self> {
        let tree = db
            .open_tree(format!("ns_{}", namespace))
            .map_err(|e| MatrixError::KvStore(format!("打开 Tree 失败: {}", e)))?;
        Ok(Self { db, tree })
    }

    pub fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let bytes = serde_json::to_vec(value)?;
        self.tree
            .insert(key, bytes)
            .map_err(|e| MatrixError::KvStore(format!("写入失败: {}", e)))?;
        Ok(())
    }

    pub fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// 删除键，返回是否存在过
    pub fn delete<K: AsRef<[u8]>>(&self, key: K) -> Result<bool> {
        Ok(self.tree.remove(key)?.is_some())
    }

    pub fn exists<K: AsRef<[u8]>>(&self, key: K) -> Result<bool> {
        Ok(self.tree.contains_key(key)?)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let kv = KvStore::temporary("@me:hs").unwrap();
        assert!(!kv.exists("k").unwrap());

        kv.set("k", &vec![1u32, 2, 3]).unwrap();
        assert_eq!(kv.get::<_, Vec<u32>>("k").unwrap(), Some(vec![1, 2, 3]));

        assert!(kv.delete("k").unwrap());
        assert!(!kv.delete("k").unwrap());
        assert_eq!(kv.get::<_, Vec<u32>>("k").unwrap(), None);
    }

    #[tokio::test]
    async fn namespaces_are_isolated_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let alice = KvStore::open(dir.path(), "alice").await.unwrap();
            alice.set("cursor", &"s1").unwrap();
            alice.flush().await.unwrap();

            let bob = KvStore::with_db(alice.db.clone(), "bob").unwrap();
            assert_eq!(bob.get::<_, String>("cursor").unwrap(), None);
        }
        let alice = KvStore::open(dir.path(), "alice").await.unwrap();
        assert_eq!(alice.get::<_, String>("cursor").unwrap(), Some("s1".to_string()));
    }
}
