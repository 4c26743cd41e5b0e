//! 错误分类
//!
//! 单项错误（列目录失败、单文件传输失败）在发生处记录，不会越过扫描器 / 编排器；
//! 运行级错误（远端不可达、快照完整性破坏）终止本次运行。

use std::path::PathBuf;
use thiserror::Error;

/// 快照库错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("路径已存在于快照中: {}", .0.display())]
    DuplicateKey(PathBuf),
    #[error("父目录未被跟踪: {}", .0.display())]
    UnknownParent(PathBuf),
    #[error("目录仍有被跟踪的子项，不能删除: {}", .0.display())]
    HasChildren(PathBuf),
    #[error("快照库跟踪的根目录是 {stored}，而不是 {configured}")]
    RootMismatch { stored: String, configured: String },
    #[error("无效的时间戳: {0}")]
    InvalidStamp(String),
    #[error("无效的路径类型: {0}")]
    InvalidKind(String),
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// 是否说明对比算法本身出了问题（而不是数据库暂时不可用）
    pub fn is_integrity_violation(&self) -> bool {
        !matches!(self, StoreError::Database(_))
    }
}

/// 单个目录无法读取
#[derive(Debug, Error)]
pub enum ListingFailure {
    #[error("读取目录失败 {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("读取元数据失败 {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("读取目录超时 ({secs}s): {}", path.display())]
    Timeout { path: PathBuf, secs: u64 },
    #[error("扫描任务异常: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// 外部传输工具调用失败
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("传输工具退出码 {code:?}")]
    Exit { code: Option<i32> },
    #[error("传输工具超时 ({secs}s)")]
    Timeout { secs: u64 },
    #[error("无法启动传输工具: {0}")]
    Spawn(#[from] std::io::Error),
}

/// 运行级错误，出现即终止本次运行
#[derive(Debug, Error)]
pub enum RunError {
    #[error("远端不可用: {0}")]
    CollaboratorUnavailable(String),
    #[error("快照完整性被破坏: {0}")]
    IntegrityViolation(StoreError),
    #[error("快照库错误: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RunError {
    fn from(err: StoreError) -> Self {
        if err.is_integrity_violation() {
            RunError::IntegrityViolation(err)
        } else {
            RunError::Store(err)
        }
    }
}

impl From<sqlx::Error> for RunError {
    fn from(err: sqlx::Error) -> Self {
        RunError::Store(StoreError::Database(err))
    }
}
