//! 会话门面
//!
//! 分层初始化顺序：存储层 → 传输层 → 事件层 → 同步引擎。
//! 房间注册表由引擎持有，这里只负责在注册表未命中时从本地缓存或服务器物化房间。

use reqwest::Method;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::account_data::{AccountDataChannel, HttpAccountData};
use crate::config::{SessionConfig, StorageType};
use crate::error::{MatrixError, Result};
use crate::events::{EventManager, SessionEvent};
use crate::models::{ClientEvent, RoomId};
use crate::room::{InvitedRoom, JoinedRoom};
use crate::secret_store::{MemoryKeyCache, SecretStore, SecureKeyCache};
use crate::storage::{KvStore, MemoryRoomStore, RoomStore, SqliteRoomStore};
use crate::sync::{SyncCursorStore, SyncEngine, SyncOptions};
use crate::transport::{encode_path, HttpTransport, Transport};

/// 从本地缓存物化房间时带上的最近时间线条数
const CACHED_TIMELINE_LIMIT: usize = 50;

/// 外部注入的协作者
pub struct SessionParts {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn RoomStore>,
    pub account_data: Arc<dyn AccountDataChannel>,
    pub key_cache: Arc<dyn SecureKeyCache>,
    pub cursor_store: Option<SyncCursorStore>,
}

pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn RoomStore>,
    account_data: Arc<dyn AccountDataChannel>,
    key_cache: Arc<dyn SecureKeyCache>,
    events: Arc<EventManager>,
    engine: SyncEngine,
}

impl Session {
    /// 按配置创建会话
    pub async fn new(config: SessionConfig) -> Result<Self> {
        crate::logging::init(config.debug_mode);
        config.validate()?;
        info!("正在创建会话 {} ({})", config.user_id, crate::version::version_string());

        // === 第1层：存储 ===
        let (store, kv): (Arc<dyn RoomStore>, KvStore) = match config.storage_type {
            StorageType::InMemory => {
                debug!("使用内存存储");
                (Arc::new(MemoryRoomStore::new()), KvStore::temporary(&config.user_id)?)
            }
            StorageType::Persistent { preserve } => {
                let dir = config.user_data_dir();
                if !preserve && tokio::fs::try_exists(&dir).await? {
                    info!("🧹 清空本地缓存 {}", dir.display());
                    tokio::fs::remove_dir_all(&dir).await?;
                }
                tokio::fs::create_dir_all(&dir).await?;
                let store = SqliteRoomStore::open(dir.join("rooms.db")).await?;
                let kv = KvStore::open(dir.join("kv"), &config.user_id).await?;
                (Arc::new(store), kv)
            }
        };
        let cursor_store = SyncCursorStore::new(Arc::new(kv), config.user_id.clone());

        // === 第2层：传输 ===
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
            &config.homeserver,
            config.access_token.clone(),
            &config.http_client_config,
        )?);
        let account_data = Arc::new(HttpAccountData::new(transport.clone(), config.user_id.clone()));

        Self::with_parts(
            config,
            SessionParts {
                transport,
                store,
                account_data,
                key_cache: Arc::new(MemoryKeyCache::new()),
                cursor_store: Some(cursor_store),
            },
        )
    }

    /// 用外部提供的协作者组装会话
    pub fn with_parts(config: SessionConfig, parts: SessionParts) -> Result<Self> {
        // === 第3层：事件 ===
        let events = Arc::new(EventManager::new(config.event_buffer_size));

        // === 第4层：同步引擎 ===
        let engine = SyncEngine::new(
            parts.transport.clone(),
            parts.store.clone(),
            events.clone(),
            SyncOptions {
                timeout_ms: config.sync_timeout_ms,
                retry: config.retry_config.clone(),
                since: config.initial_sync_token.clone(),
                cursor_store: parts.cursor_store,
            },
        )?;

        if config.start_syncing {
            engine.start_syncing();
        }
        info!("✅ 会话 {} 已就绪", config.user_id);

        Ok(Self {
            config,
            transport: parts.transport,
            store: parts.store,
            account_data: parts.account_data,
            key_cache: parts.key_cache,
            events,
            engine,
        })
    }

    pub fn whoami(&self) -> &str {
        &self.config.user_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn event_manager(&self) -> Arc<EventManager> {
        self.events.clone()
    }

    pub async fn sync(&self) -> Result<Option<String>> {
        self.engine.sync().await
    }

    pub fn start_syncing(&self) {
        self.engine.start_syncing();
    }

    pub fn stop_syncing(&self) {
        self.engine.stop_syncing();
    }

    pub fn is_syncing(&self) -> bool {
        self.engine.is_syncing()
    }

    pub fn sync_token(&self) -> Option<String> {
        self.engine.sync_token()
    }

    pub fn rooms(&self) -> Vec<JoinedRoom> {
        self.engine.rooms()
    }

    pub fn invitations(&self) -> Vec<InvitedRoom> {
        self.engine.invitations()
    }

    /// 已加入的房间：注册表 → 本地缓存 → 服务器
    pub async fn get_room(&self, room_id: &str) -> Result<Option<JoinedRoom>> {
        if let Some(room) = self.engine.room(room_id) {
            return Ok(Some(room));
        }

        let cached = self.store.load_essential_state(room_id).await?;
        if !cached.is_empty() {
            let timeline = self.store.load_timeline(room_id, CACHED_TIMELINE_LIMIT, 0).await?;
            debug!("📦 从本地缓存物化房间 {} ({} 条状态)", room_id, cached.len());
            let room = JoinedRoom::new(room_id, &cached, &timeline);
            return Ok(Some(self.engine.insert_room(room)));
        }

        let Some(state) = self.fetch_room_state(room_id).await? else {
            return Ok(None);
        };
        if state.is_empty() {
            return Ok(None);
        }
        self.store.save_state(&state, room_id).await?;
        debug!("🌐 从服务器物化房间 {} ({} 条状态)", room_id, state.len());
        let room = JoinedRoom::new(room_id, &state, &[]);
        Ok(Some(self.engine.insert_room(room)))
    }

    /// 邀请中的房间：注册表 → 本地缓存
    pub async fn get_invited_room(&self, room_id: &str) -> Result<Option<InvitedRoom>> {
        if let Some(room) = self.engine.invitation(room_id) {
            return Ok(Some(room));
        }
        let stripped = self.store.load_stripped_state(room_id).await?;
        if stripped.is_empty() {
            return Ok(None);
        }
        let room = InvitedRoom::from_stripped_state(room_id, &stripped);
        Ok(Some(self.engine.insert_invitation(room)))
    }

    /// 从服务器拉取房间完整状态，写入本地缓存并合并进已知房间
    pub async fn get_room_state_events(&self, room_id: &str) -> Result<Vec<ClientEvent>> {
        let state = self
            .fetch_room_state(room_id)
            .await?
            .ok_or_else(|| MatrixError::NotFound(format!("room {}", room_id)))?;
        if !state.is_empty() {
            self.store.save_state(&state, room_id).await?;
        }
        if let Some(changes) = self.engine.merge_room_state(room_id, &state) {
            debug!("房间 {} 合并 {} 条状态变化", room_id, changes);
        }
        Ok(state)
    }

    /// 本地缓存中的时间线，最新在前
    pub async fn load_timeline(&self, room_id: &str, limit: usize, offset: usize) -> Result<Vec<ClientEvent>> {
        self.store.load_timeline(room_id, limit, offset).await
    }

    /// 按最近活跃时间排序的房间 id
    pub async fn recent_room_ids(&self, limit: usize) -> Result<Vec<RoomId>> {
        self.store.recent_room_ids(limit).await
    }

    /// 服务器拒绝（403 / 404）时返回 None
    async fn fetch_room_state(&self, room_id: &str) -> Result<Option<Vec<ClientEvent>>> {
        let path = encode_path(&["_matrix", "client", "v3", "rooms", room_id, "state"])?;
        let response = self.transport.send_request(Method::GET, &path, &[], None).await?;
        if matches!(response.status, 403 | 404) {
            debug!("房间 {} 状态不可用 (HTTP {})", room_id, response.status);
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json()?))
    }

    pub async fn pause(&self) -> Result<()> {
        Err(MatrixError::NotImplemented("pause".to_string()))
    }

    pub async fn close(&self) -> Result<()> {
        Err(MatrixError::NotImplemented("close".to_string()))
    }

    /// 以 `key` 作为默认 key 打开 SecretStore
    pub async fn secret_store_with_default_key(&self, key: &[u8]) -> Result<SecretStore> {
        let store = SecretStore::with_default_key(self.account_data.clone(), self.key_cache.clone(), key).await?;
        Ok(store.with_event_manager(self.events.clone()))
    }

    pub async fn secret_store_with_keys(&self, keys: HashMap<String, Vec<u8>>) -> Result<SecretStore> {
        let store = SecretStore::with_keys(self.account_data.clone(), self.key_cache.clone(), keys).await?;
        Ok(store.with_event_manager(self.events.clone()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.engine.is_syncing() {
            warn!("会话 {} 释放时后台同步仍在运行，发出停止请求", self.config.user_id);
            self.engine.stop_syncing();
        }
    }
}
