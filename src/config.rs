//! 应用配置模块

use crate::core::scanner::ScanConfig;
use crate::remote::{PROBE_TIMEOUT_SECS, TRANSFER_TIMEOUT_SECS};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";

/// 传输工具配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 传输工具可执行文件
    #[serde(default = "default_program")]
    pub program: String,
    /// 单向复制子命令
    #[serde(default = "default_sync_command")]
    pub sync_command: String,
    /// 连通性探测子命令
    #[serde(default = "default_probe_command")]
    pub probe_command: String,
    /// 附加参数（例如各云盘后端的专用开关）
    #[serde(default = "default_extra_args")]
    pub extra_args: Vec<String>,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

fn default_program() -> String {
    "rclone".to_string()
}

fn default_sync_command() -> String {
    "sync".to_string()
}

fn default_probe_command() -> String {
    "lsd".to_string()
}

fn default_extra_args() -> Vec<String> {
    vec!["-v".to_string()]
}

fn default_probe_timeout() -> u64 {
    PROBE_TIMEOUT_SECS
}

fn default_transfer_timeout() -> u64 {
    TRANSFER_TIMEOUT_SECS
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            sync_command: default_sync_command(),
            probe_command: default_probe_command(),
            extra_args: default_extra_args(),
            probe_timeout_secs: default_probe_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}

/// 备份配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// 本地根目录
    #[serde(default)]
    pub local_root: PathBuf,
    /// 远端目标（例如 `Drive:` 或 `Drive:backup`）
    #[serde(default)]
    pub remote: String,
    /// 路径包含其中任一子串即排除
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,
    /// 每次运行最多复制的文件数
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// 是否把本地删除同步到远端
    #[serde(default = "default_propagate_deletes")]
    pub propagate_deletes: bool,
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_excluded_paths() -> Vec<String> {
    vec!["__pycache__".to_string(), "node_modules".to_string()]
}

fn default_max_batch() -> usize {
    200
}

fn default_propagate_deletes() -> bool {
    true
}

fn default_scan_timeout() -> u64 {
    10
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::new(),
            remote: String::new(),
            excluded_paths: default_excluded_paths(),
            max_batch: default_max_batch(),
            propagate_deletes: default_propagate_deletes(),
            scan_timeout_secs: default_scan_timeout(),
            transfer: TransferConfig::default(),
        }
    }
}

impl BackupConfig {
    /// 从配置文件加载；文件或 `backup` 节不存在时返回默认值
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join(CONFIG_FILE);
        if !config_file.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_file)
            .with_context(|| format!("读取配置文件失败: {}", config_file.display()))?;
        let config: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("配置文件格式错误: {}", config_file.display()))?;

        match config.get("backup") {
            Some(section) => serde_json::from_value(section.clone()).context("backup 配置无效"),
            None => Ok(Self::default()),
        }
    }

    /// 保存备份配置（保留文件中的其它节）
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        let config_file = config_dir.join(CONFIG_FILE);

        // 读取现有配置
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        config["backup"] = serde_json::to_value(self)?;
        fs::write(&config_file, serde_json::to_string_pretty(&config)?)
    }

    /// 命令行参数覆盖配置文件
    pub fn with_overrides(mut self, root: Option<PathBuf>, remote: Option<String>) -> Self {
        if let Some(root) = root {
            self.local_root = root;
        }
        if let Some(remote) = remote {
            self.remote = remote;
        }
        self
    }

    /// 校验并规范化根目录
    pub fn validate(mut self) -> Result<Self> {
        if self.local_root.as_os_str().is_empty() {
            bail!("未配置本地根目录 (backup.localRoot 或 --root)");
        }
        if self.remote.trim().is_empty() {
            bail!("未配置远端 (backup.remote 或 --remote)");
        }
        if self.max_batch == 0 {
            bail!("backup.maxBatch 必须大于 0");
        }

        self.local_root = fs::canonicalize(&self.local_root)
            .with_context(|| format!("本地根目录不可访问: {}", self.local_root.display()))?;
        if !self.local_root.is_dir() {
            bail!("本地根目录不是文件夹: {}", self.local_root.display());
        }
        Ok(self)
    }

    /// 生成扫描配置；数据目录位于根目录内时整体排除
    pub fn scan_config(&self, data_dir: &Path) -> ScanConfig {
        let data_dir = fs::canonicalize(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());
        let excluded_dirs = if data_dir.starts_with(&self.local_root) {
            vec![data_dir]
        } else {
            vec![]
        };

        ScanConfig {
            excluded_paths: self.excluded_paths.clone(),
            excluded_dirs,
            timeout_secs: self.scan_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackupConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_batch, 200);
        assert!(config.propagate_deletes);
        assert_eq!(config.transfer.program, "rclone");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_section_and_save() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"log": {"level": "debug"}, "backup": {"remote": "Drive:", "maxBatch": 5, "transfer": {"extraArgs": []}}}"#,
        )
        .unwrap();

        let config = BackupConfig::load(dir.path()).unwrap();
        assert_eq!(config.remote, "Drive:");
        assert_eq!(config.max_batch, 5);
        assert!(config.transfer.extra_args.is_empty());
        assert_eq!(config.transfer.transfer_timeout_secs, 600);

        let config = config.with_overrides(Some(dir.path().to_path_buf()), None);
        config.save(dir.path()).unwrap();

        // 其它节保持不变
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap()).unwrap();
        assert_eq!(raw["log"]["level"], "debug");
        assert_eq!(raw["backup"]["maxBatch"], 5);

        let validated = BackupConfig::load(dir.path()).unwrap().validate().unwrap();
        assert_eq!(validated.local_root, fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_data_dir_inside_root_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("state");
        fs::create_dir(&data).unwrap();

        let config = BackupConfig::default()
            .with_overrides(Some(dir.path().to_path_buf()), Some("Drive:".to_string()))
            .validate()
            .unwrap();
        assert_eq!(config.scan_config(&data).excluded_dirs.len(), 1);

        let outside = tempfile::tempdir().unwrap();
        assert!(config.scan_config(outside.path()).excluded_dirs.is_empty());
    }
}
