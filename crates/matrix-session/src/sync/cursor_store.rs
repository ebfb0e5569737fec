//! 同步游标持久化
//!
//! Key 格式：`sync_cursor:{user_id}`，值为最近一次成功应用的 next_batch。

use std::sync::Arc;

use crate::error::Result;
use crate::storage::KvStore;

const PREFIX: &str = "sync_cursor";

pub struct SyncCursorStore {
    kv: Arc<KvStore>,
    user_id: String,
}

impl SyncCursorStore {
    pub fn new(kv: Arc<KvStore>, user_id: impl Into<String>) -> Self {
        Self {
            kv,
            user_id: user_id.into(),
        }
    }

    fn key(user_id: &str) -> String {
        format!("{}:{}", PREFIX, user_id)
    }

    pub fn load(&self) -> Result<Option<String>> {
        self.kv.get(Self::key(&self.user_id))
    }

    pub fn save(&self, token: &str) -> Result<()> {
        self.kv.set(Self::key(&self.user_id), &token)
    }

    /// 登出 / 重置同步时清除
    pub fn clear(&self) -> Result<()> {
        self.kv.delete(Self::key(&self.user_id)).map(|_| ())
    }
}
