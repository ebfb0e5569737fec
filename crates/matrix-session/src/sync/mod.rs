//! 同步：/sync 引擎、状态合并、游标持久化

pub mod cursor_store;
pub mod engine;
pub mod reconciler;

pub use cursor_store::SyncCursorStore;
pub use engine::{SyncEngine, SyncOptions};
pub use reconciler::{ReconcileOutcome, RoomState, StateReconciler, Timeline};
