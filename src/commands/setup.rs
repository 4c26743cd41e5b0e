//! 初始化配置

use crate::config::BackupConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// 写入根目录与远端到 config.json，返回校验后的配置
pub fn init_config(data_dir: &Path, root: Option<PathBuf>, remote: Option<String>) -> Result<BackupConfig> {
    let config = BackupConfig::load(data_dir)?
        .with_overrides(root, remote)
        .validate()?;

    config
        .save(data_dir)
        .with_context(|| format!("保存配置失败: {}", data_dir.display()))?;
    info!(
        "配置已保存: {} -> {}",
        config.local_root.display(),
        config.remote
    );
    Ok(config)
}
