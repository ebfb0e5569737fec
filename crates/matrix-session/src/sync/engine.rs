//! /sync 长轮询引擎
//!
//! - 单飞：同一时刻最多一轮 /sync 在途，并发调用方共享同一结果
//! - 每轮顺序：请求 → 解码 → 邀请 / 加入 / 离开分发（先持久化，再更新注册表）→ 推进游标 → 广播事件
//! - 引擎自身不重试，失败直接返回给调用方；后台循环按 `RetryConfig` 退避
//! - 轮次在独立任务中运行，调用方被取消不会中断正在进行的一轮

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cursor_store::SyncCursorStore;
use crate::config::RetryConfig;
use crate::error::{MatrixError, Result};
use crate::events::{now_millis, EventManager, SessionEvent};
use crate::models::constants::SYNC_PATH;
use crate::models::sync_response::{InvitedRoomSync, LeftRoomSync};
use crate::models::{ClientEvent, JoinedRoomSync, RoomId, SyncResponse};
use crate::room::{InvitedRoom, JoinedRoom, Membership};
use crate::storage::{JoinDelta, RoomStore};
use crate::transport::Transport;

type SharedCycle = Shared<BoxFuture<'static, Result<Option<String>>>>;

/// 引擎参数
pub struct SyncOptions {
    /// 服务器端长轮询超时（毫秒）
    pub timeout_ms: u64,
    pub retry: RetryConfig,
    /// 初始游标；为空时从 `cursor_store` 恢复
    pub since: Option<String>,
    pub cursor_store: Option<SyncCursorStore>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retry: RetryConfig::default(),
            since: None,
            cursor_store: None,
        }
    }
}

/// 一轮 /sync 中各类房间的处理数
#[derive(Debug, Default)]
struct CycleSummary {
    joined: usize,
    invited: usize,
    left: usize,
    events: Vec<SessionEvent>,
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn RoomStore>,
    events: Arc<EventManager>,
    cursor_store: Option<SyncCursorStore>,
    timeout_ms: u64,
    retry: RetryConfig,

    since: RwLock<Option<String>>,
    rooms: RwLock<HashMap<RoomId, JoinedRoom>>,
    invitations: RwLock<HashMap<RoomId, InvitedRoom>>,

    inflight: Mutex<Option<(u64, SharedCycle)>>,
    cycle_generation: AtomicU64,

    keep_syncing: AtomicBool,
    driver_generation: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// 轮次结束（含 panic）时释放单飞槽位
struct InflightGuard {
    inner: Arc<EngineInner>,
    generation: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut slot = self.inner.inflight.lock();
        if slot.as_ref().is_some_and(|(generation, _)| *generation == self.generation) {
            *slot = None;
        }
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn RoomStore>,
        events: Arc<EventManager>,
        options: SyncOptions,
    ) -> Result<Self> {
        let since = match options.since {
            Some(token) => Some(token),
            None => match &options.cursor_store {
                Some(cursor_store) => cursor_store.load()?,
                None => None,
            },
        };
        if let Some(token) = &since {
            info!("🔄 从游标 {} 恢复同步", token);
        }

        Ok(Self {
            inner: Arc::new(EngineInner {
                transport,
                store,
                events,
                cursor_store: options.cursor_store,
                timeout_ms: options.timeout_ms,
                retry: options.retry,
                since: RwLock::new(since),
                rooms: RwLock::new(HashMap::new()),
                invitations: RwLock::new(HashMap::new()),
                inflight: Mutex::new(None),
                cycle_generation: AtomicU64::new(0),
                keep_syncing: AtomicBool::new(false),
                driver_generation: AtomicU64::new(0),
                driver: Mutex::new(None),
            }),
        })
    }

    /// 执行一轮 /sync；已有一轮在途时等待并返回同一结果
    pub async fn sync(&self) -> Result<Option<String>> {
        let cycle = {
            let mut slot = self.inner.inflight.lock();
            match slot.as_ref() {
                Some((_, cycle)) => {
                    debug!("⏳ 已有一轮 /sync 在途，合并等待");
                    cycle.clone()
                }
                None => {
                    let generation = self.inner.cycle_generation.fetch_add(1, Ordering::SeqCst);
                    let inner = self.inner.clone();
                    let handle = tokio::spawn(async move {
                        let _guard = InflightGuard {
                            inner: inner.clone(),
                            generation,
                        };
                        inner.cycle().await
                    });
                    let cycle = async move {
                        handle
                            .await
                            .map_err(|e| MatrixError::Runtime(format!("sync task failed: {}", e)))?
                    }
                    .boxed()
                    .shared();
                    *slot = Some((generation, cycle.clone()));
                    cycle
                }
            }
        };
        cycle.await
    }

    /// 启动后台同步循环；已在运行时不做任何事
    pub fn start_syncing(&self) {
        let mut driver = self.inner.driver.lock();
        let running = driver.as_ref().is_some_and(|handle| !handle.is_finished());
        if running && self.inner.keep_syncing.load(Ordering::SeqCst) {
            return;
        }

        self.inner.keep_syncing.store(true, Ordering::SeqCst);
        let generation = self.inner.driver_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let engine = self.clone();
        *driver = Some(tokio::spawn(async move { engine.drive(generation).await }));
    }

    /// 清除 keep-syncing 标记；当前这一轮完成后循环退出
    pub fn stop_syncing(&self) {
        if self.inner.keep_syncing.swap(false, Ordering::SeqCst) {
            info!("⏹️ 请求停止后台同步");
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.keep_syncing.load(Ordering::SeqCst)
    }

    async fn drive(&self, generation: u64) {
        info!("🔄 后台同步已启动");
        let mut failures = 0u32;
        while self.inner.keep_syncing.load(Ordering::SeqCst)
            && self.inner.driver_generation.load(Ordering::SeqCst) == generation
        {
            match self.sync().await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.inner.retry.delay_for(failures);
                    warn!("⚠️ /sync 失败（连续 {} 次），{:?} 后重试: {}", failures, delay, e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        info!("⏹️ 后台同步已停止");
    }

    pub fn sync_token(&self) -> Option<String> {
        self.inner.since.read().clone()
    }

    pub fn rooms(&self) -> Vec<JoinedRoom> {
        let mut rooms: Vec<JoinedRoom> = self.inner.rooms.read().values().cloned().collect();
        rooms.sort_by(|a, b| a.room_id().cmp(b.room_id()));
        rooms
    }

    pub fn invitations(&self) -> Vec<InvitedRoom> {
        let mut rooms: Vec<InvitedRoom> = self.inner.invitations.read().values().cloned().collect();
        rooms.sort_by(|a, b| a.room_id().cmp(b.room_id()));
        rooms
    }

    pub fn room(&self, room_id: &str) -> Option<JoinedRoom> {
        self.inner.rooms.read().get(room_id).cloned()
    }

    pub fn invitation(&self, room_id: &str) -> Option<InvitedRoom> {
        self.inner.invitations.read().get(room_id).cloned()
    }

    /// 登记一个从本地缓存或服务器物化的房间；已存在时保留现有对象
    pub fn insert_room(&self, room: JoinedRoom) -> JoinedRoom {
        self.inner
            .rooms
            .write()
            .entry(room.room_id().to_string())
            .or_insert(room)
            .clone()
    }

    pub fn insert_invitation(&self, room: InvitedRoom) -> InvitedRoom {
        self.inner
            .invitations
            .write()
            .entry(room.room_id().to_string())
            .or_insert(room)
            .clone()
    }

    /// 把额外拉取的状态并入已知房间，返回变化条数
    pub fn merge_room_state(&self, room_id: &str, events: &[ClientEvent]) -> Option<usize> {
        self.inner
            .rooms
            .write()
            .get_mut(room_id)
            .map(|room| room.update_state(events))
    }
}

impl EngineInner {
    async fn cycle(&self) -> Result<Option<String>> {
        match self.run_cycle().await {
            Ok(token) => Ok(token),
            Err(e) => {
                error!("❌ /sync 失败，游标保持不变: {}", e);
                self.events.emit(SessionEvent::sync_failed(&e)).await;
                Err(e)
            }
        }
    }

    async fn run_cycle(&self) -> Result<Option<String>> {
        let since = self.since.read().clone();
        let mut params = vec![("timeout".to_string(), self.timeout_ms.to_string())];
        if let Some(token) = &since {
            params.push(("since".to_string(), token.clone()));
        }

        let response = self
            .transport
            .send_request(Method::GET, SYNC_PATH, &params, None)
            .await?
            .error_for_status()?;
        let body: SyncResponse = response.json()?;

        if since.as_deref() == Some(body.next_batch.as_str()) {
            debug!("游标未变化 ({})，跳过本轮", body.next_batch);
            return Ok(since);
        }

        let mut summary = CycleSummary::default();
        if let Some(rooms) = &body.rooms {
            for (room_id, invited) in &rooms.invite {
                self.apply_invite(room_id, invited, &mut summary).await?;
            }
            for (room_id, joined) in &rooms.join {
                self.apply_join(room_id, joined, &mut summary).await?;
            }
            for (room_id, left) in &rooms.leave {
                self.apply_leave(room_id, left, &mut summary).await?;
            }
        }

        self.advance_cursor(&body.next_batch)?;
        info!(
            "✅ /sync 完成 → {} (加入 {}, 邀请 {}, 离开 {})",
            body.next_batch, summary.joined, summary.invited, summary.left
        );

        for event in summary.events {
            self.events.emit(event).await;
        }
        self.events
            .emit(SessionEvent::SyncCompleted {
                next_batch: body.next_batch.clone(),
                joined: summary.joined,
                invited: summary.invited,
                left: summary.left,
                timestamp: now_millis(),
            })
            .await;

        Ok(Some(body.next_batch))
    }

    async fn apply_invite(&self, room_id: &str, invited: &InvitedRoomSync, summary: &mut CycleSummary) -> Result<()> {
        let events = invited
            .invite_state
            .as_ref()
            .map(|s| s.events.as_slice())
            .unwrap_or(&[]);
        debug!("📨 邀请 {} ({} 条精简状态)", room_id, events.len());

        self.store.save_stripped_state(events, room_id).await?;

        let room = InvitedRoom::from_stripped_state(room_id, events);
        let is_new = self.invitations.write().insert(room_id.to_string(), room).is_none();
        if is_new {
            summary.events.push(SessionEvent::room_invited(room_id));
        }
        summary.invited += 1;
        Ok(())
    }

    async fn apply_join(&self, room_id: &str, joined: &JoinedRoomSync, summary: &mut CycleSummary) -> Result<()> {
        let all_state = joined.all_state_events();
        let timeline = joined.timeline_events();
        debug!("🏠 加入 {} ({} 条状态, {} 条时间线)", room_id, all_state.len(), timeline.len());

        let existing = self.rooms.read().contains_key(room_id);
        self.store
            .save_join_delta(&JoinDelta {
                room_id,
                state: &all_state,
                timeline,
                timestamp: joined.latest_timestamp(),
                clear_stripped: !existing,
            })
            .await?;

        let event = {
            let mut rooms = self.rooms.write();
            match rooms.get_mut(room_id) {
                Some(room) => {
                    let outcome = room.apply_delta(joined.state_events(), timeline);
                    if let Some(counts) = joined.unread_notifications {
                        room.set_unread_counts(counts);
                    }
                    (outcome.new_timeline_events > 0 || outcome.state_changes > 0)
                        .then(|| SessionEvent::room_updated(room_id, outcome.new_timeline_events))
                }
                None => {
                    let mut room = JoinedRoom::new(room_id, joined.state_events(), timeline);
                    if let Some(counts) = joined.unread_notifications {
                        room.set_unread_counts(counts);
                    }
                    rooms.insert(room_id.to_string(), room);
                    Some(SessionEvent::room_joined(room_id))
                }
            }
        };
        if !existing {
            self.invitations.write().remove(room_id);
        }

        summary.events.extend(event);
        summary.joined += 1;
        Ok(())
    }

    async fn apply_leave(&self, room_id: &str, left: &LeftRoomSync, summary: &mut CycleSummary) -> Result<()> {
        let ts = left
            .timeline
            .as_ref()
            .and_then(|t| t.events.iter().map(|e| e.origin_server_ts).max())
            .unwrap_or(0);
        self.store.save_room_timestamp(room_id, Membership::Leave, ts).await?;

        let was_joined = self.rooms.write().remove(room_id).is_some();
        let was_invited = self.invitations.write().remove(room_id).is_some();
        if was_joined || was_invited {
            debug!("🚪 离开 {}", room_id);
            summary.events.push(SessionEvent::room_left(room_id));
        }
        summary.left += 1;
        Ok(())
    }

    /// 先持久化再更新内存；持久化失败时游标不变
    fn advance_cursor(&self, next_batch: &str) -> Result<()> {
        if let Some(cursor_store) = &self.cursor_store {
            cursor_store.save(next_batch)?;
        }
        *self.since.write() = Some(next_batch.to_string());
        Ok(())
    }
}
