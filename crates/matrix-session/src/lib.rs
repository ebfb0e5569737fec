//! Matrix 客户端会话层
//!
//! - 🔄 /sync 长轮询引擎：游标推进、单飞合并、邀请 / 加入 / 离开分发
//! - 🧠 房间状态合并：prior state + timeline 增量，重放幂等
//! - 💾 本地缓存：SQLite 房间存储 + sled 游标存储
//! - 🔐 SSSS：基于 account data 的 secret 加密存储（HKDF + AES-CTR + HMAC）
//! - ⚙️ 事件系统：同步与 SecretStore 状态变化统一广播
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use matrix_session::{Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::builder()
//!         .homeserver("https://matrix.example.org")
//!         .user_id("@alice:example.org")
//!         .access_token("syt_...")
//!         .data_dir("/path/to/data")
//!         .build();
//!
//!     let session = Session::new(config).await?;
//!     session.sync().await?;
//!     for room in session.rooms() {
//!         println!("{}: {:?}", room.room_id(), room.name());
//!     }
//!
//!     session.start_syncing();
//!     Ok(())
//! }
//! ```

pub mod account_data;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod room;
pub mod secret_store;
pub mod session;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod version;

#[cfg(test)]
mod test_support;

pub use account_data::{AccountDataChannel, HttpAccountData, MemoryAccountData};
pub use config::{HttpClientConfig, RetryConfig, SessionConfig, SessionConfigBuilder, StorageType};
pub use error::{MatrixError, Result};
pub use events::{EventManager, EventStats, SessionEvent};
pub use models::{ClientEvent, EventId, RoomId, StrippedStateEvent, SyncResponse, UserId};
pub use room::{InvitedRoom, JoinedRoom, Membership, Room};
pub use secret_store::{
    KeyDescription, MemoryKeyCache, SecretStore, SecretStoreState, SecureKeyCache,
};
pub use session::{Session, SessionParts};
pub use storage::{JoinDelta, KvStore, MemoryRoomStore, RoomStore, SqliteRoomStore};
pub use sync::{StateReconciler, SyncCursorStore, SyncEngine, SyncOptions};
pub use transport::{HttpResponse, HttpTransport, Transport};
pub use version::{SDK_VERSION, GIT_SHA, BUILD_TIME, SDK_DB_VERSION};
