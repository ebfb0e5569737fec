use thiserror::Error;

/// 会话层统一错误类型
///
/// 所有变体只携带字符串/状态码，保证 `Clone`：
/// 同一轮 /sync 的结果需要分发给所有合并等待的调用方。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    /// 网络失败（连接、超时、TLS 等）
    #[error("Transport error: {0}")]
    Transport(String),
    /// 服务器返回非成功状态码
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// 响应体无法解码
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    /// 密钥派生 / 加解密失败
    #[error("Crypto error: {0}")]
    Crypto(String),
    /// MAC 校验失败，密文未被解密
    #[error("MAC doesn't match")]
    MacMismatch,
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// 前置状态不满足（例如 SecretStore 未 online）
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl MatrixError {
    /// 传输层错误（含非成功状态码）
    pub fn is_transport(&self) -> bool {
        matches!(self, MatrixError::Transport(_) | MatrixError::Http { .. })
    }

    /// 响应解码错误
    pub fn is_decode(&self) -> bool {
        matches!(self, MatrixError::Decode(_))
    }

    /// 服务器状态码（如果是 HTTP 错误）
    pub fn http_status(&self) -> Option<u16> {
        match self {
            MatrixError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for MatrixError {
    fn from(error: serde_json::Error) -> Self {
        MatrixError::Serialization(error.to_string())
    }
}

impl From<rusqlite::Error> for MatrixError {
    fn from(error: rusqlite::Error) -> Self {
        MatrixError::Database(error.to_string())
    }
}

impl From<std::io::Error> for MatrixError {
    fn from(error: std::io::Error) -> Self {
        MatrixError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for MatrixError {
    fn from(error: reqwest::Error) -> Self {
        MatrixError::Transport(error.to_string())
    }
}

impl From<sled::Error> for MatrixError {
    fn from(error: sled::Error) -> Self {
        MatrixError::KvStore(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MatrixError>;
