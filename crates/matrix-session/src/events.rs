//! 会话事件
//!
//! 同步循环与 SecretStore 的状态变化通过 `EventManager` 广播；
//! 房间注册表本身只通过快照访问，订阅者收到事件后再读取。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::models::RoomId;
use crate::secret_store::SecretStoreState;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// 一轮 /sync 已应用，游标已推进
    SyncCompleted {
        next_batch: String,
        joined: usize,
        invited: usize,
        left: usize,
        timestamp: i64,
    },
    RoomInvited {
        room_id: RoomId,
        timestamp: i64,
    },
    RoomJoined {
        room_id: RoomId,
        timestamp: i64,
    },
    RoomUpdated {
        room_id: RoomId,
        new_timeline_events: usize,
        timestamp: i64,
    },
    RoomLeft {
        room_id: RoomId,
        timestamp: i64,
    },
    /// 一轮 /sync 失败，游标未变
    SyncFailed {
        error: String,
        timestamp: i64,
    },
    SecretStoreStateChanged {
        state: SecretStoreState,
        timestamp: i64,
    },
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::SyncCompleted { .. } => "sync_completed",
            SessionEvent::RoomInvited { .. } => "room_invited",
            SessionEvent::RoomJoined { .. } => "room_joined",
            SessionEvent::RoomUpdated { .. } => "room_updated",
            SessionEvent::RoomLeft { .. } => "room_left",
            SessionEvent::SyncFailed { .. } => "sync_failed",
            SessionEvent::SecretStoreStateChanged { .. } => "secret_store_state_changed",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SessionEvent::SyncCompleted { timestamp, .. }
            | SessionEvent::RoomInvited { timestamp, .. }
            | SessionEvent::RoomJoined { timestamp, .. }
            | SessionEvent::RoomUpdated { timestamp, .. }
            | SessionEvent::RoomLeft { timestamp, .. }
            | SessionEvent::SyncFailed { timestamp, .. }
            | SessionEvent::SecretStoreStateChanged { timestamp, .. } => *timestamp,
        }
    }

    pub fn room_invited(room_id: impl Into<RoomId>) -> Self {
        SessionEvent::RoomInvited {
            room_id: room_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn room_joined(room_id: impl Into<RoomId>) -> Self {
        SessionEvent::RoomJoined {
            room_id: room_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn room_updated(room_id: impl Into<RoomId>, new_timeline_events: usize) -> Self {
        SessionEvent::RoomUpdated {
            room_id: room_id.into(),
            new_timeline_events,
            timestamp: now_millis(),
        }
    }

    pub fn room_left(room_id: impl Into<RoomId>) -> Self {
        SessionEvent::RoomLeft {
            room_id: room_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn sync_failed(error: impl ToString) -> Self {
        SessionEvent::SyncFailed {
            error: error.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn secret_store_state_changed(state: SecretStoreState) -> Self {
        SessionEvent::SecretStoreStateChanged {
            state,
            timestamp: now_millis(),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

type EventListener = Box<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

pub struct EventManager {
    sender: broadcast::Sender<SessionEvent>,
    /// 按事件类型注册的回调，"*" 接收全部
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    pub async fn emit(&self, event: SessionEvent) {
        debug!("📣 {}", event.event_type());
        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有订阅者时 send 失败是正常情况
        if self.sender.send(event.clone()).is_err() {
            debug!("no active receivers for {}", event.event_type());
        }

        let listeners = self.listeners.read().await;
        for key in [event.event_type(), "*"] {
            if let Some(callbacks) = listeners.get(key) {
                for callback in callbacks {
                    callback(&event);
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));
        self.stats.write().await.listener_count = listeners.values().map(|v| v.len()).sum();
        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let manager = EventManager::new(8);
        let mut rx = manager.subscribe();

        manager.emit(SessionEvent::room_joined("!r:hs")).await;

        match rx.recv().await.unwrap() {
            SessionEvent::RoomJoined { room_id, .. } => assert_eq!(room_id, "!r:hs"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn listeners_and_stats() {
        let manager = EventManager::new(8);
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        {
            let typed = typed.clone();
            manager
                .add_listener("room_left", move |_| {
                    typed.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            let all = all.clone();
            manager
                .add_listener("*", move |_| {
                    all.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        manager.emit(SessionEvent::room_left("!a")).await;
        manager.emit(SessionEvent::sync_failed("HTTP 502")).await;

        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.listener_count, 2);
        assert_eq!(stats.events_by_type.get("sync_failed"), Some(&1));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let manager = EventManager::new(1);
        manager.emit(SessionEvent::room_invited("!i")).await;
        assert_eq!(manager.subscriber_count(), 0);
    }
}
