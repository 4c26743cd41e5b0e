use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod remote;

pub use crate::config::BackupConfig;
pub use crate::core::{SyncConfig, SyncEngine, SyncReport};

/// 数据库文件名
pub const DB_FILE: &str = "rbackup.db";

/// 应用状态，在各命令间共享
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    /// 数据目录：config.json、数据库、logs/
    pub data_dir: PathBuf,
}

impl AppState {
    pub async fn new(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        std::fs::create_dir_all(&data_dir)?;
        tracing::debug!("数据目录: {:?}", data_dir);

        let db = db::connect(&data_dir.join(DB_FILE)).await?;
        Ok(Self { db, data_dir })
    }

    /// 读取备份配置，合并命令行覆盖项并校验
    pub fn backup_config(&self, root: Option<PathBuf>, remote: Option<String>) -> anyhow::Result<BackupConfig> {
        BackupConfig::load(&self.data_dir)?
            .with_overrides(root, remote)
            .validate()
    }

    pub fn log_dir(&self) -> PathBuf {
        logging::get_log_dir(&self.data_dir)
    }

    /// 关闭数据库连接池
    pub async fn cleanup(&self) {
        tracing::debug!("关闭数据库连接池...");
        self.db.close().await;
    }
}

/// 默认数据目录 `$HOME/.config/rbackup`
pub fn default_data_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("rbackup"))
        .unwrap_or_else(|| PathBuf::from(".rbackup"))
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }
}
