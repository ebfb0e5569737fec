//! 内存房间存储
//!
//! 与 SQLite 实现相同的覆盖/去重语义，额外记录调用日志，便于验证同步引擎的写入顺序。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{RoomStore, StoreStats};
use crate::error::Result;
use crate::models::constants::ESSENTIAL_STATE_TYPES;
use crate::models::{ClientEvent, EventId, RoomId, StrippedStateEvent};
use crate::room::Membership;

/// 一次持久化调用（按发生顺序记录）
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    SaveState { room_id: RoomId, event_ids: Vec<EventId> },
    SaveTimeline { room_id: RoomId, event_ids: Vec<EventId> },
    SaveStrippedState { room_id: RoomId, count: usize },
    DeleteStrippedState { room_id: RoomId },
    SaveRoomTimestamp { room_id: RoomId, membership: Membership, timestamp: i64 },
}

#[derive(Debug, Default)]
struct Inner {
    state: HashMap<RoomId, BTreeMap<(String, String), ClientEvent>>,
    timeline: HashMap<RoomId, BTreeMap<EventId, ClientEvent>>,
    stripped: HashMap<RoomId, BTreeMap<(String, String), StrippedStateEvent>>,
    rooms: HashMap<RoomId, (Membership, i64)>,
    calls: Vec<StoreCall>,
}

/// 内存实现
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    inner: Mutex<Inner>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 到目前为止的持久化调用
    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    pub fn room_membership(&self, room_id: &str) -> Option<(Membership, i64)> {
        self.inner.lock().rooms.get(room_id).copied()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            timeline_events: inner.timeline.values().map(|t| t.len() as u64).sum(),
            state_events: inner.state.values().map(|s| s.len() as u64).sum(),
            stripped_state_events: inner.stripped.values().map(|s| s.len() as u64).sum(),
            rooms: inner.rooms.len() as u64,
        }
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn save_state(&self, events: &[ClientEvent], room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let room = inner.state.entry(room_id.to_string()).or_default();
        for event in events {
            if let Some(key) = event.state_tuple() {
                room.insert(key, event.clone());
            }
        }
        inner.calls.push(StoreCall::SaveState {
            room_id: room_id.to_string(),
            event_ids: events.iter().map(|e| e.event_id.clone()).collect(),
        });
        Ok(())
    }

    async fn save_timeline(&self, events: &[ClientEvent], room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let room = inner.timeline.entry(room_id.to_string()).or_default();
        for event in events {
            room.entry(event.event_id.clone()).or_insert_with(|| event.clone());
        }
        inner.calls.push(StoreCall::SaveTimeline {
            room_id: room_id.to_string(),
            event_ids: events.iter().map(|e| e.event_id.clone()).collect(),
        });
        Ok(())
    }

    async fn save_stripped_state(&self, events: &[StrippedStateEvent], room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let room = inner.stripped.entry(room_id.to_string()).or_default();
        for event in events {
            room.insert((event.event_type.clone(), event.state_key.clone()), event.clone());
        }
        inner.calls.push(StoreCall::SaveStrippedState {
            room_id: room_id.to_string(),
            count: events.len(),
        });
        Ok(())
    }

    async fn delete_stripped_state(&self, room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stripped.remove(room_id);
        inner.calls.push(StoreCall::DeleteStrippedState { room_id: room_id.to_string() });
        Ok(())
    }

    async fn save_room_timestamp(&self, room_id: &str, membership: Membership, timestamp: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.rooms.entry(room_id.to_string()).or_insert((membership, timestamp));
        entry.0 = membership;
        entry.1 = entry.1.max(timestamp);
        inner.calls.push(StoreCall::SaveRoomTimestamp {
            room_id: room_id.to_string(),
            membership,
            timestamp,
        });
        Ok(())
    }

    async fn load_essential_state(&self, room_id: &str) -> Result<Vec<ClientEvent>> {
        let mut events: Vec<ClientEvent> = self
            .load_state(room_id)
            .await?
            .into_iter()
            .filter(|e| ESSENTIAL_STATE_TYPES.contains(&e.event_type.as_str()))
            .collect();
        events.sort_by(|a, b| a.timeline_cmp(b));
        Ok(events)
    }

    async fn load_stripped_state(&self, room_id: &str) -> Result<Vec<StrippedStateEvent>> {
        let inner = self.inner.lock();
        Ok(inner
            .stripped
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn load_state(&self, room_id: &str) -> Result<Vec<ClientEvent>> {
        let inner = self.inner.lock();
        let mut events: Vec<ClientEvent> = inner
            .state
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by(|a, b| a.timeline_cmp(b));
        Ok(events)
    }

    async fn load_timeline(&self, room_id: &str, limit: usize, offset: usize) -> Result<Vec<ClientEvent>> {
        let inner = self.inner.lock();
        let mut events: Vec<ClientEvent> = inner
            .timeline
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by(|a, b| b.timeline_cmp(a));
        Ok(events.into_iter().skip(offset).take(limit).collect())
    }

    async fn recent_room_ids(&self, limit: usize) -> Result<Vec<RoomId>> {
        let inner = self.inner.lock();
        let mut rooms: Vec<(&RoomId, i64)> = inner.rooms.iter().map(|(id, (_, ts))| (id, *ts)).collect();
        rooms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        Ok(rooms.into_iter().take(limit).map(|(id, _)| id.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str, event_type: &str, state_key: Option<&str>, ts: i64) -> ClientEvent {
        let mut value = json!({"event_id": id, "type": event_type, "origin_server_ts": ts, "content": {}});
        if let Some(key) = state_key {
            value["state_key"] = json!(key);
        }
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn later_state_write_overwrites_same_key() {
        let store = MemoryRoomStore::new();
        store
            .save_state(
                &[event("$a", "m.room.name", Some(""), 5), event("$b", "m.room.name", Some(""), 1)],
                "!r",
            )
            .await
            .unwrap();

        let state = store.load_state("!r").await.unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].event_id, "$b");
    }

    #[tokio::test]
    async fn essential_state_excludes_members() {
        let store = MemoryRoomStore::new();
        store
            .save_state(
                &[
                    event("$c", "m.room.create", Some(""), 1),
                    event("$m", "m.room.member", Some("@a:hs"), 2),
                ],
                "!r",
            )
            .await
            .unwrap();

        let essential = store.load_essential_state("!r").await.unwrap();
        assert_eq!(essential.len(), 1);
        assert_eq!(essential[0].event_type, "m.room.create");
    }

    #[tokio::test]
    async fn timeline_is_newest_first_and_deduplicated() {
        let store = MemoryRoomStore::new();
        let events = vec![event("$1", "m.room.message", None, 1), event("$2", "m.room.message", None, 2)];
        store.save_timeline(&events, "!r").await.unwrap();
        store.save_timeline(&events, "!r").await.unwrap();

        let loaded = store.load_timeline("!r", 10, 0).await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$2", "$1"]);
        assert_eq!(store.stats().timeline_events, 2);
        assert_eq!(store.calls().len(), 2);
    }

    #[tokio::test]
    async fn recent_rooms_ordered_by_timestamp() {
        let store = MemoryRoomStore::new();
        store.save_room_timestamp("!old", Membership::Join, 10).await.unwrap();
        store.save_room_timestamp("!new", Membership::Join, 20).await.unwrap();
        store.save_room_timestamp("!old", Membership::Leave, 5).await.unwrap();

        assert_eq!(store.recent_room_ids(10).await.unwrap(), vec!["!new", "!old"]);
        assert_eq!(store.room_membership("!old"), Some((Membership::Leave, 10)));
    }
}
