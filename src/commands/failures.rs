//! 失败台账与运行历史查询

use crate::core::{FailureLedger, LedgerEntry, RunLog};
use crate::db::RunLogRow;
use crate::AppState;
use anyhow::{Context, Result};

/// 列出等待重试的路径
pub async fn list_failures(state: &AppState) -> Result<Vec<LedgerEntry>> {
    FailureLedger::new(state.db.clone())
        .entries()
        .await
        .context("读取失败台账失败")
}

/// 最近的运行记录
pub async fn get_run_history(state: &AppState, limit: u32) -> Result<Vec<RunLogRow>> {
    RunLog::new(state.db.clone())
        .recent(limit)
        .await
        .context("读取运行记录失败")
}
