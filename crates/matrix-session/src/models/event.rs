//! 房间事件模型
//!
//! 只建模 reconcile 需要的外壳字段；`content` 保留为原始 JSON，
//! 具体消息类型的 schema 映射不在本 crate 范围内。

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub type RoomId = String;
pub type EventId = String;
pub type UserId = String;

/// 房间内事件（/sync 中不带 room_id 的形式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    pub event_id: EventId,
    #[serde(default)]
    pub sender: UserId,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub origin_server_ts: i64,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<serde_json::Value>,
}

impl ClientEvent {
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// 状态键 (type, state_key)；非状态事件返回 None
    pub fn state_tuple(&self) -> Option<(String, String)> {
        self.state_key
            .as_ref()
            .map(|key| (self.event_type.clone(), key.clone()))
    }

    /// 时间线排序键：(origin_server_ts, event_id)
    pub fn timeline_key(&self) -> (i64, EventId) {
        (self.origin_server_ts, self.event_id.clone())
    }

    /// 时间线顺序比较，时间戳相同时按 event_id 打破平局
    pub fn timeline_cmp(&self, other: &ClientEvent) -> Ordering {
        self.origin_server_ts
            .cmp(&other.origin_server_ts)
            .then_with(|| self.event_id.cmp(&other.event_id))
    }

    pub fn content_str(&self, field: &str) -> Option<&str> {
        self.content.get(field).and_then(|v| v.as_str())
    }
}

/// 邀请房间的精简状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrippedStateEvent {
    #[serde(default)]
    pub sender: UserId,
    pub state_key: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl StrippedStateEvent {
    pub fn content_str(&self, field: &str) -> Option<&str> {
        self.content.get(field).and_then(|v| v.as_str())
    }
}
