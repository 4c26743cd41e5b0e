//! 运行记录 - 每次运行写入 run_log 表与逐路径明细 run_entries，
//! 并向 `YY_MM_run.log` 追加起止横幅
//!
//! 运行记录只用于审计，算法本身从不读回。

use crate::core::engine::SyncItem;
use crate::core::snapshot::path_key;
use crate::db::{RunEntryRow, RunLogRow, RunMode, RunStatus, STAMP_FORMAT};
use crate::error::StoreError;
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// 一次运行的起点
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub mode: RunMode,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// 运行结束时写入的计数
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounts {
    pub files_scanned: u32,
    pub files_changed: u32,
    pub files_synced: u32,
    pub files_failed: u32,
    pub paths_deleted: u32,
    pub store_writes: u64,
}

/// 运行日志
pub struct RunLog {
    db: Arc<SqlitePool>,
    /// 横幅文件所在目录；None 时只写数据库
    banner_dir: Option<PathBuf>,
}

impl RunLog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db, banner_dir: None }
    }

    pub fn with_banner_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.banner_dir = Some(dir.into());
        self
    }

    /// 横幅文件名，例如 `24_03_run.log`
    pub fn banner_file(dir: &Path, at: DateTime<Utc>) -> PathBuf {
        dir.join(format!("{:02}_{:02}_run.log", at.year() % 100, at.month()))
    }

    /// 记录运行开始；写入失败只告警，不影响运行
    pub async fn start(&self, mode: RunMode) -> RunRecord {
        let record = RunRecord {
            id: uuid::Uuid::new_v4().to_string(),
            mode,
            pid: std::process::id(),
            started_at: Utc::now(),
        };

        let result = sqlx::query(
            r#"INSERT INTO run_log (id, mode, pid, start_time, status)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&record.id)
        .bind(mode.as_str())
        .bind(record.pid as i64)
        .bind(record.started_at.timestamp())
        .bind(RunStatus::Running.as_str())
        .execute(&*self.db)
        .await;
        if let Err(e) = result {
            warn!("记录运行开始失败: {}", e);
        }

        let title = match mode {
            RunMode::Backup => "Start",
            RunMode::Retry => "Retry",
            RunMode::Count => "Count",
        };
        let msg = format!("# {} {} #", title, record.started_at.format(STAMP_FORMAT));
        self.append_banner(&format!("\n{}\n{}\n", "#".repeat(msg.len()), msg));

        record
    }

    /// 记录运行结束，返回持续秒数
    pub async fn finish(
        &self,
        record: &RunRecord,
        status: RunStatus,
        counts: &RunCounts,
        error_message: Option<&str>,
    ) -> u64 {
        let ended_at = Utc::now();
        let duration = (ended_at - record.started_at).num_seconds().max(0) as u64;

        let result = sqlx::query(
            r#"UPDATE run_log SET
                   end_time = ?, duration_secs = ?, status = ?,
                   files_scanned = ?, files_changed = ?, files_synced = ?, files_failed = ?,
                   paths_deleted = ?, store_writes = ?, error_message = ?
               WHERE id = ?"#,
        )
        .bind(ended_at.timestamp())
        .bind(duration as i64)
        .bind(status.as_str())
        .bind(counts.files_scanned as i64)
        .bind(counts.files_changed as i64)
        .bind(counts.files_synced as i64)
        .bind(counts.files_failed as i64)
        .bind(counts.paths_deleted as i64)
        .bind(counts.store_writes as i64)
        .bind(error_message)
        .bind(&record.id)
        .execute(&*self.db)
        .await;
        if let Err(e) = result {
            warn!("记录运行结束失败: {}", e);
        }

        let msg = format!("# End   {} #", ended_at.format(STAMP_FORMAT));
        let time = format_duration(duration);
        let pad = msg.len().saturating_sub(time.len() + 1);
        self.append_banner(&format!(
            "{}\n{}{}#\n{}\n",
            msg,
            time,
            " ".repeat(pad),
            "#".repeat(msg.len())
        ));

        duration
    }

    /// 登记本轮的全部变更（包括超出批量上限和不传播的删除）
    pub async fn record_entries(&self, record: &RunRecord, items: &[SyncItem]) {
        if items.is_empty() {
            return;
        }
        if let Err(e) = self.insert_entries(record, items).await {
            warn!("记录运行明细失败: {}", e);
        }
    }

    async fn insert_entries(&self, record: &RunRecord, items: &[SyncItem]) -> Result<(), sqlx::Error> {
        let mut tx = self.db.begin().await?;
        for item in items {
            sqlx::query(
                r#"INSERT OR IGNORE INTO run_entries (run_id, file_path, action, kind, modification_time)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(&record.id)
            .bind(path_key(item.path()))
            .bind(item.action().as_str())
            .bind(item.kind().as_str())
            .bind(item.stamp().map(|s| s.to_string()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// 某一项复制 / 删除成功
    pub async fn mark_synced(&self, record: &RunRecord, item: &SyncItem) {
        let result = sqlx::query(
            "UPDATE run_entries SET synced = 1 WHERE run_id = ? AND file_path = ? AND action = ?",
        )
        .bind(&record.id)
        .bind(path_key(item.path()))
        .bind(item.action().as_str())
        .execute(&*self.db)
        .await;
        if let Err(e) = result {
            warn!("更新运行明细失败 {}: {}", item.path().display(), e);
        }
    }

    /// 某次运行的明细（按动作、路径排序）
    pub async fn entries(&self, run_id: &str) -> Result<Vec<RunEntryRow>, StoreError> {
        let rows = sqlx::query_as::<_, RunEntryRow>(
            r#"SELECT run_id, file_path, action, kind, modification_time, synced
               FROM run_entries WHERE run_id = ? ORDER BY action, file_path"#,
        )
        .bind(run_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// 最近的运行记录（新的在前）
    pub async fn recent(&self, limit: u32) -> Result<Vec<RunLogRow>, StoreError> {
        let rows = sqlx::query_as::<_, RunLogRow>(
            r#"SELECT id, mode, pid, start_time, end_time, duration_secs, status,
                      files_scanned, files_changed, files_synced, files_failed,
                      paths_deleted, store_writes, error_message
               FROM run_log ORDER BY start_time DESC, rowid DESC LIMIT ?"#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    fn append_banner(&self, text: &str) {
        let Some(dir) = &self.banner_dir else {
            return;
        };
        let path = Self::banner_file(dir, Utc::now());
        let result = std::fs::create_dir_all(dir).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?
                .write_all(text.as_bytes())
        });
        if let Err(e) = result {
            warn!("写入运行日志失败 {}: {}", path.display(), e);
        }
    }
}

/// `# Time  H h. M m. S s.`
pub fn format_duration(secs: u64) -> String {
    let (h, rest) = (secs / 3600, secs % 3600);
    format!("# Time  {} h. {} m. {} s.", h, rest / 60, rest % 60)
}
