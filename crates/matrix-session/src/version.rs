//! 版本与构建元信息
//!
//! - crate 版本 → Cargo.toml
//! - 数据库 schema 版本 → migrations/ 文件（refinery 管理，build.rs 扫描）

/// crate semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（vergen 在 build.rs 中生成）
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// 构建时间（vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 当前支持的最高数据库 migration 版本。
/// 打开数据库时若 refinery 历史表中的版本更高则拒绝使用（防 downgrade 后 schema 不兼容）。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// 用于 User-Agent 等场景的版本字符串
pub fn version_string() -> String {
    format!("matrix-session/{} ({})", SDK_VERSION, GIT_SHA)
}
