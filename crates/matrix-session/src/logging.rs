//! tracing 订阅器初始化
//!
//! 过滤规则优先级：`RUST_LOG` → `MATRIX_SESSION_LOG` → 内置默认值。
//! 重复调用无副作用（宿主程序可能已经安装了自己的订阅器）。

use std::env;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "MATRIX_SESSION_LOG";
const DEFAULT_FILTER: &str = "info,matrix_session=info";
const DEBUG_FILTER: &str = "info,matrix_session=debug";

pub fn init(debug_mode: bool) {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(debug_mode)
        .with_env_filter(filter_from_env(debug_mode))
        .try_init();
}

fn filter_from_env(debug_mode: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let custom = env::var(LOG_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok());
    if let Some(filter) = custom {
        return filter;
    }

    EnvFilter::new(if debug_mode { DEBUG_FILTER } else { DEFAULT_FILTER })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(true);
        init(false);
        tracing::info!("🧪 logging initialized twice");
    }
}
