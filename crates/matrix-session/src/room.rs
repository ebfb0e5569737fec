//! 房间模型：Invited / Joined / Left 三种生命周期
//!
//! Invited → Joined、Invited → Left、Joined → Left 只由 /sync 增量驱动。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::constants::{
    M_ROOM_AVATAR, M_ROOM_CREATE, M_ROOM_ENCRYPTION, M_ROOM_MEMBER, M_ROOM_NAME, M_ROOM_TOPIC,
};
use crate::models::{ClientEvent, RoomId, StrippedStateEvent, UnreadNotificationCounts, UserId};
use crate::sync::reconciler::{ReconcileOutcome, RoomState, StateReconciler, Timeline};

/// 房间成员关系（持久化到 rooms 表的 join_state）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Leave,
}

impl Membership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Membership::Invite => "invite",
            Membership::Join => "join",
            Membership::Leave => "leave",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "invite" => Some(Membership::Invite),
            "join" => Some(Membership::Join),
            "leave" => Some(Membership::Leave),
            _ => None,
        }
    }
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 被邀请的房间：只持有精简状态
#[derive(Debug, Clone, PartialEq)]
pub struct InvitedRoom {
    room_id: RoomId,
    stripped_state: HashMap<(String, String), StrippedStateEvent>,
}

impl InvitedRoom {
    /// 由 invite_state 构建，同一 (type, state_key) 后者覆盖前者
    pub fn from_stripped_state(room_id: impl Into<RoomId>, events: &[StrippedStateEvent]) -> Self {
        let stripped_state = events
            .iter()
            .map(|e| ((e.event_type.clone(), e.state_key.clone()), e.clone()))
            .collect();
        Self {
            room_id: room_id.into(),
            stripped_state,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&StrippedStateEvent> {
        self.stripped_state
            .get(&(event_type.to_string(), state_key.to_string()))
    }

    pub fn name(&self) -> Option<&str> {
        self.get(M_ROOM_NAME, "").and_then(|e| e.content_str("name"))
    }

    pub fn topic(&self) -> Option<&str> {
        self.get(M_ROOM_TOPIC, "").and_then(|e| e.content_str("topic"))
    }

    pub fn avatar_url(&self) -> Option<&str> {
        self.get(M_ROOM_AVATAR, "").and_then(|e| e.content_str("url"))
    }

    /// 邀请 `user_id` 的人：其 m.room.member 事件的 sender
    pub fn inviter(&self, user_id: &str) -> Option<&str> {
        self.get(M_ROOM_MEMBER, user_id)
            .filter(|e| e.content_str("membership") == Some("invite"))
            .map(|e| e.sender.as_str())
    }

    pub fn state_len(&self) -> usize {
        self.stripped_state.len()
    }
}

/// 已加入的房间：完整状态 + 时间线 + 未读计数
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRoom {
    room_id: RoomId,
    state: RoomState,
    timeline: Timeline,
    notification_count: u64,
    highlight_count: u64,
}

impl JoinedRoom {
    /// 从状态 + 时间线物化一个房间
    pub fn new(room_id: impl Into<RoomId>, initial_state: &[ClientEvent], initial_timeline: &[ClientEvent]) -> Self {
        let outcome = StateReconciler::reconcile(&RoomState::new(), &Timeline::new(), initial_state, initial_timeline);
        Self {
            room_id: room_id.into(),
            state: outcome.state,
            timeline: outcome.timeline,
            notification_count: 0,
            highlight_count: 0,
        }
    }

    /// 原地合并一批增量，返回合并统计
    pub fn apply_delta(&mut self, prior_state: &[ClientEvent], timeline_events: &[ClientEvent]) -> ReconcileOutcome {
        let outcome = StateReconciler::reconcile(&self.state, &self.timeline, prior_state, timeline_events);
        self.state = outcome.state.clone();
        self.timeline = outcome.timeline.clone();
        outcome
    }

    /// 只合并状态（例如从服务器拉取的全量状态）
    pub fn update_state(&mut self, events: &[ClientEvent]) -> usize {
        self.state.apply_batch(events)
    }

    pub fn set_unread_counts(&mut self, counts: UnreadNotificationCounts) {
        self.notification_count = counts.notification_count;
        self.highlight_count = counts.highlight_count;
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn notification_count(&self) -> u64 {
        self.notification_count
    }

    pub fn highlight_count(&self) -> u64 {
        self.highlight_count
    }

    pub fn name(&self) -> Option<&str> {
        self.state.get(M_ROOM_NAME, "").and_then(|e| e.content_str("name"))
    }

    pub fn topic(&self) -> Option<&str> {
        self.state.get(M_ROOM_TOPIC, "").and_then(|e| e.content_str("topic"))
    }

    pub fn avatar_url(&self) -> Option<&str> {
        self.state.get(M_ROOM_AVATAR, "").and_then(|e| e.content_str("url"))
    }

    /// 房间创建者：优先 content.creator，缺省时取 create 事件的 sender
    pub fn creator(&self) -> Option<&str> {
        self.state.get(M_ROOM_CREATE, "").map(|e| {
            e.content_str("creator").unwrap_or(e.sender.as_str())
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.state.get(M_ROOM_ENCRYPTION, "").is_some()
    }

    /// membership == join 的成员
    pub fn member_ids(&self) -> Vec<UserId> {
        self.state
            .events_of_type(M_ROOM_MEMBER)
            .into_iter()
            .filter(|e| e.content_str("membership") == Some("join"))
            .filter_map(|e| e.state_key.clone())
            .collect()
    }

    pub fn latest_timestamp(&self) -> Option<i64> {
        self.timeline.last().map(|e| e.origin_server_ts)
    }
}

/// 房间生命周期视图
#[derive(Debug, Clone, PartialEq)]
pub enum Room {
    Invited(InvitedRoom),
    Joined(JoinedRoom),
    /// 终态；已从活跃注册表中移除
    Left(RoomId),
}

impl Room {
    pub fn room_id(&self) -> &str {
        match self {
            Room::Invited(room) => room.room_id(),
            Room::Joined(room) => room.room_id(),
            Room::Left(room_id) => room_id,
        }
    }

    pub fn membership(&self) -> Membership {
        match self {
            Room::Invited(_) => Membership::Invite,
            Room::Joined(_) => Membership::Join,
            Room::Left(_) => Membership::Leave,
        }
    }
}
