//! 会话配置
//!
//! 与 `SessionConfig::builder()` 一起使用；`Session::new` 之前会调用 `validate()`。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MatrixError, Result};

/// 本地缓存的存放方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    /// 只在内存中，进程退出即丢弃
    InMemory,
    /// 写入 data_dir；`preserve = false` 时打开前清空该用户的旧缓存
    Persistent { preserve: bool },
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Persistent { preserve: true }
    }
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 单次请求超时（秒），必须大于 /sync 长轮询超时
    pub request_timeout_secs: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 90,
        }
    }
}

/// 后台同步循环的失败退避
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// 第 `failures` 次连续失败后的等待时间（从 1 开始）
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let delay = self.base_delay_ms as f64 * self.backoff_factor.max(1.0).powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// homeserver 基础 URL，例如 https://matrix.example.org
    pub homeserver: String,
    pub user_id: String,
    pub device_id: Option<String>,
    pub access_token: Option<String>,
    /// 本地缓存根目录
    pub data_dir: PathBuf,
    pub storage_type: StorageType,
    /// 服务器端长轮询超时（毫秒）
    pub sync_timeout_ms: u64,
    /// 从已知游标恢复（优先于本地持久化的游标）
    pub initial_sync_token: Option<String>,
    /// 创建后立即启动后台同步
    pub start_syncing: bool,
    pub http_client_config: HttpClientConfig,
    pub retry_config: RetryConfig,
    /// 事件广播通道容量
    pub event_buffer_size: usize,
    pub debug_mode: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            homeserver: String::new(),
            user_id: String::new(),
            device_id: None,
            access_token: None,
            data_dir: default_data_dir(),
            storage_type: StorageType::default(),
            sync_timeout_ms: 30_000,
            initial_sync_token: None,
            start_syncing: false,
            http_client_config: HttpClientConfig::default(),
            retry_config: RetryConfig::default(),
            event_buffer_size: 256,
            debug_mode: false,
        }
    }
}

/// 默认数据目录 ~/.matrix-session/
fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".matrix-session"))
        .unwrap_or_else(|_| PathBuf::from(".matrix-session"))
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.homeserver.trim().is_empty() {
            return Err(MatrixError::Config("homeserver 不能为空".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(MatrixError::Config("user_id 不能为空".to_string()));
        }
        if self.http_client_config.request_timeout_secs * 1000 <= self.sync_timeout_ms {
            return Err(MatrixError::Config(format!(
                "请求超时 {}s 必须大于长轮询超时 {}ms",
                self.http_client_config.request_timeout_secs, self.sync_timeout_ms
            )));
        }
        if self.event_buffer_size == 0 {
            return Err(MatrixError::Config("event_buffer_size 必须大于 0".to_string()));
        }
        Ok(())
    }

    /// 当前用户的缓存目录（user id 中的 ':' 等字符替换掉）
    pub fn user_data_dir(&self) -> PathBuf {
        let safe: String = self
            .user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.data_dir.join("users").join(safe)
    }
}

pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    pub fn homeserver<S: Into<String>>(mut self, url: S) -> Self {
        self.config.homeserver = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.config.user_id = user_id.into();
        self
    }

    pub fn device_id<S: Into<String>>(mut self, device_id: S) -> Self {
        self.config.device_id = Some(device_id.into());
        self
    }

    pub fn access_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.access_token = Some(token.into());
        self
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn storage_type(mut self, storage_type: StorageType) -> Self {
        self.config.storage_type = storage_type;
        self
    }

    pub fn sync_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.sync_timeout_ms = timeout;
        self
    }

    pub fn initial_sync_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.initial_sync_token = Some(token.into());
        self
    }

    pub fn start_syncing(mut self, enabled: bool) -> Self {
        self.config.start_syncing = enabled;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.config.retry_config = config;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields_and_trims_homeserver() {
        let config = SessionConfig::builder()
            .homeserver("https://hs.example.org/")
            .user_id("@alice:example.org")
            .access_token("secret")
            .storage_type(StorageType::InMemory)
            .build();

        assert_eq!(config.homeserver, "https://hs.example.org");
        assert_eq!(config.storage_type, StorageType::InMemory);
        assert_eq!(config.sync_timeout_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_request_timeout() {
        let config = SessionConfig::builder()
            .homeserver("https://hs")
            .user_id("@a:hs")
            .http_client_config(HttpClientConfig {
                connect_timeout_secs: 5,
                request_timeout_secs: 30,
            })
            .build();
        assert!(matches!(config.validate(), Err(MatrixError::Config(_))));
    }

    #[test]
    fn validate_rejects_missing_identity() {
        let config = SessionConfig::builder().homeserver("https://hs").build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(1), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(2), Duration::from_millis(2000));
        assert_eq!(retry.delay_for(3), Duration::from_millis(4000));
        assert_eq!(retry.delay_for(20), Duration::from_millis(30000));
    }

    #[test]
    fn user_data_dir_is_filesystem_safe() {
        let config = SessionConfig::builder().data_dir("/tmp/ms").user_id("@a:hs.org").build();
        assert_eq!(config.user_data_dir(), PathBuf::from("/tmp/ms/users/_a_hs.org"));
    }
}
