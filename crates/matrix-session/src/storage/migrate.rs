//! 房间缓存数据库初始化
//!
//! 统一入口 `init_db`：pragmas → refinery migrations → schema 版本校验。
//! 新增表结构只需在 migrations/ 添加 V{n}__{name}.sql。

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;
use tracing::debug;

use crate::error::{MatrixError, Result};
use crate::version::SDK_DB_VERSION;

const REFINERY_TABLE: &str = "refinery_schema_history";

/// WAL + NORMAL 同步；房间缓存可从服务器重建，不需要 FULL
const CACHE_PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA temp_store=MEMORY;
";

fn enable_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(CACHE_PRAGMAS.trim())
        .map_err(|e| MatrixError::Database(format!("设置 PRAGMA 失败: {}", e)))
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    let report = embedded::migrations::runner()
        .run(conn)
        .map_err(|e| MatrixError::Database(format!("执行 migration 失败: {}", e)))?;
    debug!("🗄️ 已应用 {} 个 migration", report.applied_migrations().len());
    Ok(())
}

/// 当前数据库的 schema 版本；历史表不存在时返回 None
pub fn schema_version(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
        [REFINERY_TABLE],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(None);
    }

    let version: Option<i64> = conn.query_row(
        &format!("SELECT MAX(version) FROM {}", REFINERY_TABLE),
        [],
        |row| row.get(0),
    )?;
    Ok(version.filter(|&v| v > 0))
}

/// 数据库版本高于本构建支持的版本时拒绝打开
fn check_db_version(conn: &Connection) -> Result<()> {
    match schema_version(conn)? {
        Some(v) if v > SDK_DB_VERSION => Err(MatrixError::Database(format!(
            "数据库版本 {} 高于当前支持的最高版本 {}",
            v, SDK_DB_VERSION
        ))),
        _ => Ok(()),
    }
}

pub fn init_db(conn: &mut Connection) -> Result<()> {
    enable_pragmas(conn)?;
    run_migrations(conn)?;
    check_db_version(conn)
}
