//! 备份 / 重试 / 统计命令

use crate::config::BackupConfig;
use crate::core::scanner::FsScanner;
use crate::core::{SyncConfig, SyncEngine, SyncReport};
use crate::remote::RcloneRemote;
use crate::AppState;
use std::sync::Arc;
use tracing::debug;

/// 根据配置组装同步引擎
pub fn build_engine(state: &AppState, config: &BackupConfig) -> SyncEngine {
    let scan_config = config.scan_config(&state.data_dir);
    debug!("扫描排除目录: {:?}", scan_config.excluded_dirs);

    let remote = RcloneRemote::new(config.transfer.clone(), &config.local_root, &config.remote);
    let sync_config = SyncConfig {
        root: config.local_root.clone(),
        max_batch: config.max_batch,
        propagate_deletes: config.propagate_deletes,
    };

    SyncEngine::new(
        state.db.clone(),
        Arc::new(remote),
        Arc::new(FsScanner::new(scan_config)),
        sync_config,
    )
    .with_banner_dir(state.log_dir())
}

/// 常规备份
pub async fn start_backup(state: &AppState, config: &BackupConfig) -> SyncReport {
    build_engine(state, config).run_backup().await
}

/// 只重试失败台账
pub async fn retry_failures(state: &AppState, config: &BackupConfig) -> SyncReport {
    build_engine(state, config).run_retry().await
}

/// 只统计变更
pub async fn count_changes(state: &AppState, config: &BackupConfig) -> SyncReport {
    build_engine(state, config).run_count().await
}
