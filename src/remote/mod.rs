pub mod rclone;

use crate::error::TransferError;
use async_trait::async_trait;
use std::path::Path;

pub use rclone::RcloneRemote;

// ============ 公共常量 ============

/// 连通性探测超时（秒）
pub const PROBE_TIMEOUT_SECS: u64 = 60;
/// 单个路径传输超时（秒）
pub const TRANSFER_TIMEOUT_SECS: u64 = 600;

/// 传输范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferScope {
    /// 单个文件（修改或删除）
    File,
    /// 整个目录子树（目录删除时使用）
    Tree,
}

/// 远端抽象接口：外部传输工具被视为黑盒
#[async_trait]
pub trait Remote: Send + Sync {
    /// 轻量级连通性检查，在任何扫描 / 复制之前调用
    async fn probe(&self) -> Result<(), TransferError>;

    /// 只针对一个相对路径执行单向复制
    async fn transfer(&self, rel_path: &Path, scope: TransferScope) -> Result<(), TransferError>;

    /// 获取远端名称（用于日志）
    fn name(&self) -> &str;
}
