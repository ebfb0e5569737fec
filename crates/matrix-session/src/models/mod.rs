//! 协议数据模型

pub mod constants;
pub mod event;
pub mod sync_response;

pub use event::{ClientEvent, EventId, RoomId, StrippedStateEvent, UserId};
pub use sync_response::{JoinedRoomSync, SyncResponse, UnreadNotificationCounts};
