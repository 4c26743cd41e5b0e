//! 日志模块 - 常规日志、错误日志分文件输出

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::CONFIG_FILE;

/// 常规日志文件名
pub const APP_LOG: &str = "app.log";
/// 错误日志文件名（只记录 ERROR）
pub const ERROR_LOG: &str = "error.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写常规日志（错误日志始终写）
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        fs::read_to_string(config_dir.join(CONFIG_FILE))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("log").cloned())
            .and_then(|log| serde_json::from_value::<LogConfig>(log).ok())
            .unwrap_or_default()
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 日志目录（位于数据目录下）
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// 持有后台写线程，drop 时刷新缓冲
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// 初始化日志系统
pub fn init_logging(log_dir: &Path, config: &LogConfig, verbose: bool) -> io::Result<LogGuards> {
    fs::create_dir_all(log_dir)?;

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };
    let mut env_filter = EnvFilter::from_default_env().add_directive(level.into());
    // sqlx 每条语句都会打日志
    if let Ok(directive) = "sqlx=warn".parse() {
        env_filter = env_filter.add_directive(directive);
    }

    let (error_writer, error_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, ERROR_LOG));
    let mut guards = vec![error_guard];

    // 错误日志层 - 无论是否启用常规日志都输出
    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(LevelFilter::ERROR);

    let app_layer = if config.enabled {
        let (app_writer, app_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, APP_LOG));
        guards.push(app_guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(app_writer)
                .with_ansi(false)
                .with_target(false),
        )
    } else {
        None
    };

    // 详细模式下同时输出到控制台
    let console_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(app_layer)
        .with(error_layer)
        .with(console_layer)
        .try_init();

    Ok(LogGuards { _guards: guards })
}
