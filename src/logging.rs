//! 日志初始化：支持环境变量覆盖与默认值。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::DEFAULT_LOG_FILTER;

/// 初始化 tracing 日志订阅；`RUST_LOG` 未设置时使用默认过滤规则。
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
