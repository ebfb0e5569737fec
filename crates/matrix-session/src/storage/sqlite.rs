//! SQLite 房间存储
//!
//! 表结构见 migrations/：timeline / state / stripped_state / rooms。
//! 每个 save 调用在单个事务内完成，一个房间的加入增量也是一个事务；连接由 tokio Mutex 串行化。

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::migrate::init_db;
use super::{JoinDelta, RoomStore, StoreStats};
use crate::error::{MatrixError, Result};
use crate::models::constants::ESSENTIAL_STATE_TYPES;
use crate::models::{ClientEvent, RoomId, StrippedStateEvent};
use crate::room::Membership;

const EVENT_COLUMNS: &str = "event_id, sender, type, state_key, origin_server_ts, content, unsigned";

#[derive(Debug)]
pub struct SqliteRoomStore {
    conn: Mutex<Connection>,
}

impl SqliteRoomStore {
    /// 打开（或创建）数据库文件并执行 migration
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| MatrixError::IO(format!("创建数据库目录失败: {}", e)))?;
            }
        }
        let mut conn = Connection::open(path)
            .map_err(|e| MatrixError::Database(format!("打开数据库失败: {}", e)))?;
        init_db(&mut conn)?;
        info!("🗄️ 房间数据库已打开: {}", path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        init_db(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().await;
        let count = |table: &str| -> Result<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            timeline_events: count("timeline")?,
            state_events: count("state")?,
            stripped_state_events: count("stripped_state")?,
            rooms: count("rooms")?,
        })
    }

    pub async fn room_membership(&self, room_id: &str) -> Result<Option<(Membership, i64)>> {
        let conn = self.conn.lock().await;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT join_state, timestamp FROM rooms WHERE room_id = ?1",
                [room_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((join_state, ts)) => {
                let membership = Membership::parse(&join_state)
                    .ok_or_else(|| MatrixError::InvalidData(format!("未知的 join_state: {}", join_state)))?;
                Ok(Some((membership, ts)))
            }
            None => Ok(None),
        }
    }
}

fn to_json(value: &serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json(column: usize, raw: String) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<ClientEvent> {
    let unsigned: Option<String> = row.get(6)?;
    Ok(ClientEvent {
        event_id: row.get(0)?,
        sender: row.get(1)?,
        event_type: row.get(2)?,
        state_key: row.get(3)?,
        origin_server_ts: row.get(4)?,
        content: from_json(5, row.get(5)?)?,
        unsigned: unsigned.map(|raw| from_json(6, raw)).transpose()?,
    })
}

fn insert_state(conn: &Connection, events: &[ClientEvent], room_id: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO state
         (room_id, type, state_key, event_id, sender, origin_server_ts, content, unsigned)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for event in events {
        let Some(state_key) = event.state_key.as_deref() else {
            continue;
        };
        let unsigned = event.unsigned.as_ref().map(to_json).transpose()?;
        stmt.execute(params![
            room_id,
            event.event_type,
            state_key,
            event.event_id,
            event.sender,
            event.origin_server_ts,
            to_json(&event.content)?,
            unsigned,
        ])?;
    }
    Ok(())
}

fn insert_timeline(conn: &Connection, events: &[ClientEvent], room_id: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO timeline
         (event_id, room_id, sender, type, state_key, origin_server_ts, content, unsigned)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for event in events {
        let unsigned = event.unsigned.as_ref().map(to_json).transpose()?;
        stmt.execute(params![
            event.event_id,
            room_id,
            event.sender,
            event.event_type,
            event.state_key,
            event.origin_server_ts,
            to_json(&event.content)?,
            unsigned,
        ])?;
    }
    Ok(())
}

fn upsert_room(conn: &Connection, room_id: &str, membership: Membership, timestamp: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO rooms (room_id, join_state, timestamp) VALUES (?1, ?2, ?3)
         ON CONFLICT(room_id) DO UPDATE SET
             join_state = excluded.join_state,
             timestamp = MAX(rooms.timestamp, excluded.timestamp)",
        params![room_id, membership.as_str(), timestamp],
    )?;
    Ok(())
}

fn clear_stripped(conn: &Connection, room_id: &str) -> Result<()> {
    conn.execute("DELETE FROM stripped_state WHERE room_id = ?1", [room_id])?;
    Ok(())
}

#[async_trait]
impl RoomStore for SqliteRoomStore {
    async fn save_state(&self, events: &[ClientEvent], room_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        insert_state(&tx, events, room_id)?;
        tx.commit()?;
        debug!("💾 {} 保存 {} 条状态", room_id, events.len());
        Ok(())
    }

    async fn save_timeline(&self, events: &[ClientEvent], room_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        insert_timeline(&tx, events, room_id)?;
        tx.commit()?;
        debug!("💾 {} 保存 {} 条时间线事件", room_id, events.len());
        Ok(())
    }

    async fn save_stripped_state(&self, events: &[StrippedStateEvent], room_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO stripped_state (room_id, type, state_key, sender, content)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for event in events {
                stmt.execute(params![
                    room_id,
                    event.event_type,
                    event.state_key,
                    event.sender,
                    to_json(&event.content)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_stripped_state(&self, room_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        clear_stripped(&conn, room_id)
    }

    async fn save_room_timestamp(&self, room_id: &str, membership: Membership, timestamp: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        upsert_room(&conn, room_id, membership, timestamp)
    }

    async fn save_join_delta(&self, delta: &JoinDelta<'_>) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        insert_state(&tx, delta.state, delta.room_id)?;
        insert_timeline(&tx, delta.timeline, delta.room_id)?;
        if let Some(timestamp) = delta.timestamp {
            upsert_room(&tx, delta.room_id, Membership::Join, timestamp)?;
        }
        if delta.clear_stripped {
            clear_stripped(&tx, delta.room_id)?;
        }
        tx.commit()?;
        debug!(
            "💾 {} 加入增量: {} 条状态, {} 条时间线",
            delta.room_id,
            delta.state.len(),
            delta.timeline.len()
        );
        Ok(())
    }

    async fn load_essential_state(&self, room_id: &str) -> Result<Vec<ClientEvent>> {
        let conn = self.conn.lock().await;
        let placeholders = (0..ESSENTIAL_STATE_TYPES.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM state WHERE room_id = ?1 AND type IN ({}) ORDER BY origin_server_ts, event_id",
            EVENT_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let args = std::iter::once(room_id).chain(ESSENTIAL_STATE_TYPES.iter().copied());
        let events = stmt
            .query_map(params_from_iter(args), row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    async fn load_stripped_state(&self, room_id: &str) -> Result<Vec<StrippedStateEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT sender, state_key, type, content FROM stripped_state WHERE room_id = ?1 ORDER BY type, state_key",
        )?;
        let events = stmt
            .query_map([room_id], |row| {
                Ok(StrippedStateEvent {
                    sender: row.get(0)?,
                    state_key: row.get(1)?,
                    event_type: row.get(2)?,
                    content: from_json(3, row.get(3)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    async fn load_state(&self, room_id: &str) -> Result<Vec<ClientEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM state WHERE room_id = ?1 ORDER BY origin_server_ts, event_id",
            EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map([room_id], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    async fn load_timeline(&self, room_id: &str, limit: usize, offset: usize) -> Result<Vec<ClientEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM timeline WHERE room_id = ?1
             ORDER BY origin_server_ts DESC, event_id DESC LIMIT ?2 OFFSET ?3",
            EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![room_id, limit as i64, offset as i64], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    async fn recent_room_ids(&self, limit: usize) -> Result<Vec<RoomId>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT room_id FROM rooms ORDER BY timestamp DESC, room_id LIMIT ?1")?;
        let ids = stmt
            .query_map([limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<RoomId>>>()?;
        Ok(ids)
    }
}
