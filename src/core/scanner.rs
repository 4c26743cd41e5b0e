use crate::db::{EntryKind, Stamp};
use crate::error::ListingFailure;
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// 文件扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 路径中包含任一子串即排除
    pub excluded_paths: Vec<String>,
    /// 整棵排除的目录（程序自身的数据目录位于根目录内时）
    pub excluded_dirs: Vec<PathBuf>,
    /// 单个目录的读取超时（秒）
    pub timeout_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            excluded_paths: vec!["__pycache__".to_string(), "node_modules".to_string()],
            excluded_dirs: vec![],
            timeout_secs: 10,
        }
    }
}

impl ScanConfig {
    /// 检查路径是否应该被排除（点文件、配置的子串、排除目录）
    fn should_exclude(&self, path: &Path, name: &OsStr) -> bool {
        if name.to_string_lossy().starts_with('.') {
            return true;
        }

        let path_str = path.to_string_lossy();
        if self
            .excluded_paths
            .iter()
            .any(|excluded| !excluded.is_empty() && path_str.contains(excluded.as_str()))
        {
            return true;
        }

        self.excluded_dirs.iter().any(|dir| path.starts_with(dir))
    }
}

/// 目录中的一个实时子项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub stamp: Stamp,
}

/// 列目录结果
///
/// `Failed` 表示本轮没有观测到该目录，绝不能当作“目录变空”处理。
#[derive(Debug)]
pub enum Listing {
    Listed(Vec<LiveEntry>),
    Failed(ListingFailure),
}

/// 列出单个目录的直接子项
#[async_trait]
pub trait DirectoryLister: Send + Sync {
    async fn list(&self, dir: &Path) -> Listing;
}

/// 本地文件系统扫描器
pub struct FsScanner {
    config: ScanConfig,
}

impl FsScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }
}

impl Default for FsScanner {
    fn default() -> Self {
        Self::new(ScanConfig::default())
    }
}

/// 同步读取目录；任一子项元数据读取失败都让整个目录的结果失效，
/// 否则缺失的子项会被误判为删除
fn read_children(dir: &Path, config: &ScanConfig) -> Result<Vec<LiveEntry>, ListingFailure> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry.map_err(|source| ListingFailure::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();

        if config.should_exclude(path, entry.file_name()) {
            trace!("排除: {}", path.display());
            continue;
        }

        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            trace!("跳过符号链接: {}", path.display());
            continue;
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            // socket、fifo 等特殊文件
            continue;
        };

        if path.to_str().is_none() {
            warn!("跳过非 UTF-8 路径: {}", path.display());
            continue;
        }

        let modified = entry
            .metadata()
            .map_err(|source| ListingFailure::Io {
                path: path.to_path_buf(),
                source,
            })?
            .modified()
            .map_err(|source| ListingFailure::Metadata {
                path: path.to_path_buf(),
                source,
            })?;

        let stamp = Stamp::try_from_system_time(modified).unwrap_or_else(|| {
            warn!("修改时间超出范围，按边界值记录: {}", path.display());
            Stamp::from_system_time(modified)
        });

        entries.push(LiveEntry {
            path: path.to_path_buf(),
            kind,
            stamp,
        });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

#[async_trait]
impl DirectoryLister for FsScanner {
    async fn list(&self, dir: &Path) -> Listing {
        let owned_dir = dir.to_path_buf();
        let config = self.config.clone();
        let secs = self.config.timeout_secs;

        // 使用 spawn_blocking 避免阻塞 async runtime
        let task = tokio::task::spawn_blocking(move || read_children(&owned_dir, &config));

        let result = match tokio::time::timeout(Duration::from_secs(secs), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ListingFailure::Join(join_err)),
            Err(_) => Err(ListingFailure::Timeout {
                path: dir.to_path_buf(),
                secs,
            }),
        };

        match result {
            Ok(entries) => {
                debug!("列出 {}: {} 个子项", dir.display(), entries.len());
                Listing::Listed(entries)
            }
            Err(e) => {
                warn!("目录本轮未观测: {}", e);
                Listing::Failed(e)
            }
        }
    }
}
