//! GET /_matrix/client/v3/sync 响应体
//!
//! 房间表使用 BTreeMap：同一响应内按 room_id 有序处理，重放结果确定。
//! account_data / presence / to_device / device_lists / knock 只做解码，不参与 reconcile。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::event::{ClientEvent, RoomId, StrippedStateEvent, UserId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Option<Rooms>,
    #[serde(default)]
    pub account_data: Option<EventsContainer>,
    #[serde(default)]
    pub presence: Option<EventsContainer>,
    #[serde(default)]
    pub to_device: Option<EventsContainer>,
    #[serde(default)]
    pub device_lists: Option<DeviceLists>,
    #[serde(default)]
    pub device_one_time_keys_count: Option<HashMap<String, u64>>,
}

/// 未结构化的事件容器（account_data / presence / to_device / ephemeral）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsContainer {
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<UserId>,
    #[serde(default)]
    pub left: Vec<UserId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub invite: BTreeMap<RoomId, InvitedRoomSync>,
    #[serde(default)]
    pub join: BTreeMap<RoomId, JoinedRoomSync>,
    #[serde(default)]
    pub knock: BTreeMap<RoomId, serde_json::Value>,
    #[serde(default)]
    pub leave: BTreeMap<RoomId, LeftRoomSync>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvitedRoomSync {
    #[serde(default)]
    pub invite_state: Option<InviteState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InviteState {
    #[serde(default)]
    pub events: Vec<StrippedStateEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateEvents {
    #[serde(default)]
    pub events: Vec<ClientEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<ClientEvent>,
    #[serde(default)]
    pub limited: Option<bool>,
    #[serde(default)]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadNotificationCounts {
    #[serde(default)]
    pub highlight_count: u64,
    #[serde(default)]
    pub notification_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomSummary {
    #[serde(default, rename = "m.heroes")]
    pub heroes: Option<Vec<UserId>>,
    #[serde(default, rename = "m.invited_member_count")]
    pub invited_member_count: Option<u64>,
    #[serde(default, rename = "m.joined_member_count")]
    pub joined_member_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedRoomSync {
    #[serde(default)]
    pub account_data: Option<EventsContainer>,
    #[serde(default)]
    pub ephemeral: Option<EventsContainer>,
    #[serde(default)]
    pub state: Option<StateEvents>,
    #[serde(default)]
    pub summary: Option<RoomSummary>,
    #[serde(default)]
    pub timeline: Option<Timeline>,
    #[serde(default)]
    pub unread_notifications: Option<UnreadNotificationCounts>,
}

impl JoinedRoomSync {
    /// timeline 之前的状态事件
    pub fn state_events(&self) -> &[ClientEvent] {
        self.state.as_ref().map(|s| s.events.as_slice()).unwrap_or(&[])
    }

    pub fn timeline_events(&self) -> &[ClientEvent] {
        self.timeline.as_ref().map(|t| t.events.as_slice()).unwrap_or(&[])
    }

    /// 先 prior state，再 timeline 内携带 state_key 的事件
    pub fn all_state_events(&self) -> Vec<ClientEvent> {
        self.state_events()
            .iter()
            .chain(self.timeline_events().iter().filter(|e| e.is_state()))
            .cloned()
            .collect()
    }

    /// 本批 timeline 的最新时间戳
    pub fn latest_timestamp(&self) -> Option<i64> {
        self.timeline_events().iter().map(|e| e.origin_server_ts).max()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeftRoomSync {
    #[serde(default)]
    pub account_data: Option<EventsContainer>,
    #[serde(default)]
    pub state: Option<StateEvents>,
    #[serde(default)]
    pub timeline: Option<Timeline>,
}
