//! 房间状态合并器
//!
//! 纯函数，不做 I/O：给定旧的 RoomState / Timeline 与一批新事件，产出新的 RoomState / Timeline。
//!
//! 规则：
//! - 先应用 prior state，再应用 timeline 中携带 state_key 的事件；同一 (type, state_key) 后写覆盖先写
//! - 一批事件先按 (type, state_key) 折叠为最终胜出者，只有胜出者与已有条目不同才写入
//! - timeline 按 (origin_server_ts, event_id) 排序，按 event_id 去重，只追加
//! - 同一批次重复应用结果不变（引擎层重放保护依赖这一点）

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::models::{ClientEvent, EventId};

type StateKey = (String, String);

#[derive(Debug, Clone, PartialEq)]
struct StateEntry {
    /// 本房间内的写入序号，用于按最后写入顺序遍历
    seq: u64,
    event: ClientEvent,
}

/// 房间状态：每个 (type, state_key) 只保留最新一条
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomState {
    entries: HashMap<StateKey, StateEntry>,
    next_seq: u64,
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从一组状态事件构建（按顺序应用）
    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a ClientEvent>,
    {
        let mut state = Self::new();
        state.apply_batch(events);
        state
    }

    /// 写入一条状态事件，返回状态是否发生变化。
    ///
    /// 非状态事件被忽略；同一 event_id 重复写入视为无变化（不推进写入序号）。
    pub fn apply(&mut self, event: &ClientEvent) -> bool {
        let Some(key) = event.state_tuple() else {
            return false;
        };
        if let Some(existing) = self.entries.get(&key) {
            if existing.event.event_id == event.event_id {
                return false;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, StateEntry { seq, event: event.clone() });
        true
    }

    /// 按顺序写入一批状态事件，返回实际变化的条目数。
    ///
    /// 同一 (type, state_key) 在批内多次出现时只保留最后一条，
    /// 胜出者按其最后出现的位置写入；与已有条目相同的键不推进写入序号。
    pub fn apply_batch<'a, I>(&mut self, events: I) -> usize
    where
        I: IntoIterator<Item = &'a ClientEvent>,
    {
        let mut last_index: HashMap<StateKey, usize> = HashMap::new();
        let events: Vec<&ClientEvent> = events.into_iter().collect();
        for (index, event) in events.iter().enumerate() {
            if let Some(key) = event.state_tuple() {
                last_index.insert(key, index);
            }
        }

        let mut winners: Vec<usize> = last_index.into_values().collect();
        winners.sort_unstable();
        winners.into_iter().filter(|&index| self.apply(events[index])).count()
    }

    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&ClientEvent> {
        self.entries
            .get(&(event_type.to_string(), state_key.to_string()))
            .map(|entry| &entry.event)
    }

    /// 某类型的全部状态事件（如所有 m.room.member）
    pub fn events_of_type(&self, event_type: &str) -> Vec<&ClientEvent> {
        let mut entries: Vec<&StateEntry> = self
            .entries
            .iter()
            .filter(|((t, _), _)| t == event_type)
            .map(|(_, entry)| entry)
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| &entry.event).collect()
    }

    /// 全部状态事件，按最后写入顺序
    pub fn events(&self) -> Vec<&ClientEvent> {
        let mut entries: Vec<&StateEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| &entry.event).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 房间时间线：有序、去重、只追加
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    events: Vec<ClientEvent>,
    ids: HashSet<EventId>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a ClientEvent>,
    {
        let mut timeline = Self::new();
        for event in events {
            timeline.insert(event);
        }
        timeline
    }

    /// 插入一条事件；event_id 已存在时返回 false
    pub fn insert(&mut self, event: &ClientEvent) -> bool {
        if self.ids.contains(&event.event_id) {
            return false;
        }
        let pos = self
            .events
            .partition_point(|existing| existing.timeline_cmp(event).is_lt());
        self.events.insert(pos, event.clone());
        self.ids.insert(event.event_id.clone());
        true
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.ids.contains(event_id)
    }

    pub fn events(&self) -> &[ClientEvent] {
        &self.events
    }

    pub fn last(&self) -> Option<&ClientEvent> {
        self.events.last()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// 一次合并的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub state: RoomState,
    pub timeline: Timeline,
    /// 实际改变的状态条目数
    pub state_changes: usize,
    /// 新加入时间线的事件数（去重后）
    pub new_timeline_events: usize,
}

/// 状态合并器
#[derive(Debug, Clone, Copy, Default)]
pub struct StateReconciler;

impl StateReconciler {
    /// 合并一批 prior state + timeline 事件
    pub fn reconcile(
        state: &RoomState,
        timeline: &Timeline,
        prior_state: &[ClientEvent],
        timeline_events: &[ClientEvent],
    ) -> ReconcileOutcome {
        let mut new_state = state.clone();
        let mut new_timeline = timeline.clone();

        let state_changes =
            new_state.apply_batch(prior_state.iter().chain(timeline_events.iter().filter(|e| e.is_state())));

        let new_timeline_events = timeline_events
            .iter()
            .filter(|event| new_timeline.insert(event))
            .count();

        debug!(
            "reconcile: {} 条状态变化, {} 条新时间线事件",
            state_changes, new_timeline_events
        );

        ReconcileOutcome {
            state: new_state,
            timeline: new_timeline,
            state_changes,
            new_timeline_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_event(id: &str, event_type: &str, key: &str, ts: i64, content: serde_json::Value) -> ClientEvent {
        serde_json::from_value(json!({
            "event_id": id, "type": event_type, "state_key": key,
            "origin_server_ts": ts, "sender": "@a:hs", "content": content
        }))
        .unwrap()
    }

    fn message(id: &str, ts: i64) -> ClientEvent {
        serde_json::from_value(json!({
            "event_id": id, "type": "m.room.message", "origin_server_ts": ts,
            "sender": "@a:hs", "content": {"body": id}
        }))
        .unwrap()
    }

    #[test]
    fn timeline_state_overrides_prior_state() {
        // timeline 内的状态事件时间戳更早，仍然后写覆盖
        let prior = vec![state_event("$p", "m.room.name", "", 50, json!({"name": "prior"}))];
        let timeline = vec![state_event("$t", "m.room.name", "", 10, json!({"name": "timeline"}))];

        let outcome = StateReconciler::reconcile(&RoomState::new(), &Timeline::new(), &prior, &timeline);

        let name = outcome.state.get("m.room.name", "").unwrap();
        assert_eq!(name.event_id, "$t");
        assert_eq!(outcome.state.len(), 1);
        // 批内被覆盖的 prior 条目不计入变化
        assert_eq!(outcome.state_changes, 1);
    }

    #[test]
    fn timeline_is_sorted_and_deduplicated() {
        let events = vec![message("$c", 30), message("$a", 10), message("$b", 10), message("$a", 10)];
        let outcome = StateReconciler::reconcile(&RoomState::new(), &Timeline::new(), &[], &events);

        let ids: Vec<_> = outcome.timeline.events().iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$a", "$b", "$c"]);
        assert_eq!(outcome.new_timeline_events, 3);
    }

    #[test]
    fn same_event_in_prior_state_and_timeline_appears_once_in_timeline() {
        let topic = state_event("$topic", "m.room.topic", "", 20, json!({"topic": "rust"}));
        let events = vec![message("$m1", 10), topic.clone(), message("$m2", 30)];

        let outcome = StateReconciler::reconcile(&RoomState::new(), &Timeline::new(), &[topic.clone()], &events);

        let ids: Vec<_> = outcome.timeline.events().iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$m1", "$topic", "$m2"]);
        assert_eq!(outcome.state.get("m.room.topic", "").unwrap().event_id, "$topic");
        assert_eq!(outcome.state_changes, 1);
    }

    #[test]
    fn applying_same_batch_twice_is_idempotent() {
        let prior = vec![
            state_event("$create", "m.room.create", "", 1, json!({"creator": "@a:hs"})),
            state_event("$member", "m.room.member", "@a:hs", 2, json!({"membership": "join"})),
        ];
        let timeline = vec![message("$m1", 3), state_event("$name", "m.room.name", "", 4, json!({"name": "n"}))];

        let once = StateReconciler::reconcile(&RoomState::new(), &Timeline::new(), &prior, &timeline);
        let twice = StateReconciler::reconcile(&once.state, &once.timeline, &prior, &timeline);

        assert_eq!(once.state, twice.state);
        assert_eq!(once.timeline, twice.timeline);
        assert_eq!(twice.state_changes, 0);
        assert_eq!(twice.new_timeline_events, 0);
    }

    #[test]
    fn replaying_overlapping_batch_is_idempotent() {
        let prior = vec![state_event("$p", "m.room.name", "", 50, json!({"name": "prior"}))];
        let timeline = vec![
            state_event("$t", "m.room.name", "", 10, json!({"name": "timeline"})),
            state_event("$y", "m.room.topic", "", 11, json!({"topic": "t"})),
        ];

        let once = StateReconciler::reconcile(&RoomState::new(), &Timeline::new(), &prior, &timeline);
        let twice = StateReconciler::reconcile(&once.state, &once.timeline, &prior, &timeline);

        let order = |state: &RoomState| -> Vec<String> { state.events().iter().map(|e| e.event_id.clone()).collect() };
        assert_eq!(order(&once.state), vec!["$t", "$y"]);
        assert_eq!(order(&twice.state), order(&once.state));
        assert_eq!(twice.state, once.state);
        assert_eq!(twice.state_changes, 0);
        assert_eq!(twice.new_timeline_events, 0);
        assert_eq!(twice.state.get("m.room.name", "").unwrap().event_id, "$t");
    }

    #[test]
    fn batch_keeps_last_occurrence_position() {
        let mut state = RoomState::new();
        let changed = state.apply_batch(&[
            state_event("$1", "m.room.name", "", 1, json!({})),
            state_event("$2", "m.room.topic", "", 2, json!({})),
            state_event("$3", "m.room.name", "", 3, json!({})),
        ]);

        let ids: Vec<_> = state.events().iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$2", "$3"]);
        assert_eq!(changed, 2);
    }

    #[test]
    fn state_iterates_in_last_write_order() {
        let mut state = RoomState::new();
        state.apply(&state_event("$1", "m.room.name", "", 1, json!({})));
        state.apply(&state_event("$2", "m.room.topic", "", 2, json!({})));
        state.apply(&state_event("$3", "m.room.name", "", 3, json!({})));

        let ids: Vec<_> = state.events().iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$2", "$3"]);
    }

    #[test]
    fn non_state_events_do_not_touch_state() {
        let mut state = RoomState::new();
        assert!(!state.apply(&message("$m", 1)));
        assert!(state.is_empty());
    }

    #[test]
    fn events_of_type_filters_members() {
        let state = RoomState::from_events(&[
            state_event("$a", "m.room.member", "@a:hs", 1, json!({"membership": "join"})),
            state_event("$b", "m.room.member", "@b:hs", 2, json!({"membership": "invite"})),
            state_event("$n", "m.room.name", "", 3, json!({"name": "x"})),
        ]);
        assert_eq!(state.events_of_type("m.room.member").len(), 2);
    }
}
