//! 本地持久化
//!
//! - `RoomStore`：房间状态 / 时间线 / 精简状态的持久化接口（同步引擎只依赖这个 trait）
//! - `SqliteRoomStore`：rusqlite + refinery migration 的实现
//! - `MemoryRoomStore`：内存实现（InMemory 会话与测试）
//! - `KvStore`：sled 键值存储（同步游标等小数据）

pub mod kv;
pub mod memory;
pub mod migrate;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ClientEvent, RoomId, StrippedStateEvent};
use crate::room::Membership;

pub use kv::KvStore;
pub use memory::{MemoryRoomStore, StoreCall};
pub use sqlite::SqliteRoomStore;

/// 一次 /sync 中某个已加入房间的全部写入
#[derive(Debug, Clone, Copy)]
pub struct JoinDelta<'a> {
    pub room_id: &'a str,
    pub state: &'a [ClientEvent],
    pub timeline: &'a [ClientEvent],
    /// 本批最新事件的时间戳
    pub timestamp: Option<i64>,
    /// 房间刚从邀请转为加入，需要清理精简状态
    pub clear_stripped: bool,
}

/// 房间数据持久化接口
///
/// 每个 save 调用在支持事务的实现中应是一个事务；
/// 同一 (room, type, state_key) 的状态后写覆盖先写，时间线按 event_id 去重。
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// 保存状态事件（按传入顺序写入，后者覆盖前者）
    async fn save_state(&self, events: &[ClientEvent], room_id: &str) -> Result<()>;

    /// 保存时间线事件
    async fn save_timeline(&self, events: &[ClientEvent], room_id: &str) -> Result<()>;

    /// 保存邀请房间的精简状态
    async fn save_stripped_state(&self, events: &[StrippedStateEvent], room_id: &str) -> Result<()>;

    /// 加入房间后清理遗留的精简状态
    async fn delete_stripped_state(&self, room_id: &str) -> Result<()>;

    /// 记录房间成员关系与最新时间戳（用于最近房间排序）
    async fn save_room_timestamp(&self, room_id: &str, membership: Membership, timestamp: i64) -> Result<()>;

    /// 写入一个房间的加入增量：状态 → 时间线 → 时间戳 → 清理精简状态。
    ///
    /// 支持事务的实现应覆盖此方法，在同一事务内完成全部写入。
    async fn save_join_delta(&self, delta: &JoinDelta<'_>) -> Result<()> {
        if !delta.state.is_empty() {
            self.save_state(delta.state, delta.room_id).await?;
        }
        if !delta.timeline.is_empty() {
            self.save_timeline(delta.timeline, delta.room_id).await?;
        }
        if let Some(timestamp) = delta.timestamp {
            self.save_room_timestamp(delta.room_id, Membership::Join, timestamp).await?;
        }
        if delta.clear_stripped {
            self.delete_stripped_state(delta.room_id).await?;
        }
        Ok(())
    }

    /// 打开房间所需的最小状态集合
    async fn load_essential_state(&self, room_id: &str) -> Result<Vec<ClientEvent>>;

    async fn load_stripped_state(&self, room_id: &str) -> Result<Vec<StrippedStateEvent>>;

    /// 全部状态，按 origin_server_ts 升序
    async fn load_state(&self, room_id: &str) -> Result<Vec<ClientEvent>>;

    /// 时间线，最新在前
    async fn load_timeline(&self, room_id: &str, limit: usize, offset: usize) -> Result<Vec<ClientEvent>>;

    /// 按最近时间戳排序的房间 id
    async fn recent_room_ids(&self, limit: usize) -> Result<Vec<RoomId>>;
}

/// SQLite / 内存存储统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub timeline_events: u64,
    pub state_events: u64,
    pub stripped_state_events: u64,
    pub rooms: u64,
}
