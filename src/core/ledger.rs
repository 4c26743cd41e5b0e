//! 失败台账 - 记录最近一次复制失败的路径，供重试模式使用

use crate::core::snapshot::path_key;
use crate::db::{EntryKind, LedgerRow, Stamp};
use crate::error::StoreError;
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// 台账条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    /// 尝试复制时捕获的时间；None 表示待传播的远端删除
    pub stamp: Option<Stamp>,
    pub occurrences: u32,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            path: PathBuf::from(row.file_path),
            kind: EntryKind::try_from(row.kind.as_str())?,
            stamp: Stamp::parse_opt(row.modification_time.as_deref())?,
            occurrences: row.occurrence_count.max(0) as u32,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

/// 失败台账
pub struct FailureLedger {
    db: Arc<SqlitePool>,
}

impl FailureLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// 记录一次失败，返回累计次数
    pub async fn record_failure(
        &self,
        path: &Path,
        kind: EntryKind,
        stamp: Option<Stamp>,
        error: &str,
    ) -> Result<u32, StoreError> {
        let now = chrono::Utc::now().timestamp();

        let count: i64 = sqlx::query_scalar(
            r#"INSERT INTO failure_ledger (file_path, kind, modification_time, occurrence_count, last_error, updated_at)
               VALUES (?, ?, ?, 1, ?, ?)
               ON CONFLICT(file_path) DO UPDATE SET
                   kind = excluded.kind,
                   modification_time = excluded.modification_time,
                   occurrence_count = failure_ledger.occurrence_count + 1,
                   last_error = excluded.last_error,
                   updated_at = excluded.updated_at
               RETURNING occurrence_count"#,
        )
        .bind(path_key(path))
        .bind(kind.as_str())
        .bind(stamp.map(|s| s.to_string()))
        .bind(error)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        debug!("记录失败 ({} 次): {}", count, path.display());
        Ok(count.max(0) as u32)
    }

    /// 成功后移除条目，返回是否存在过
    pub async fn clear(&self, path: &Path) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM failure_ledger WHERE file_path = ?")
            .bind(path_key(path))
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// 所有待重试条目（按路径排序）
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT file_path, kind, modification_time, occurrence_count, last_error, updated_at
             FROM failure_ledger ORDER BY file_path",
        )
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    pub async fn get(&self, path: &Path) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query_as::<_, LedgerRow>(
            "SELECT file_path, kind, modification_time, occurrence_count, last_error, updated_at
             FROM failure_ledger WHERE file_path = ?",
        )
        .bind(path_key(path))
        .fetch_optional(&*self.db)
        .await?;

        row.map(LedgerEntry::try_from).transpose()
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failure_ledger")
            .fetch_one(&*self.db)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn test_failures_accumulate_and_clear() {
        let ledger = FailureLedger::new(connect_in_memory().await.unwrap());
        let path = Path::new("/data/a.txt");
        let first = Stamp::parse("2024-01-01 00:00").unwrap();
        let second = Stamp::parse("2024-01-02 00:00").unwrap();

        assert_eq!(ledger.record_failure(path, EntryKind::File, Some(first), "exit 1").await.unwrap(), 1);
        assert_eq!(ledger.record_failure(path, EntryKind::File, Some(second), "timeout").await.unwrap(), 2);

        let entry = ledger.get(path).await.unwrap().unwrap();
        assert_eq!(entry.occurrences, 2);
        assert_eq!(entry.stamp, Some(second));
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));

        assert!(ledger.clear(path).await.unwrap());
        assert!(!ledger.clear(path).await.unwrap());
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_entries_sorted() {
        let ledger = FailureLedger::new(connect_in_memory().await.unwrap());
        ledger.record_failure(Path::new("/data/b"), EntryKind::Dir, None, "x").await.unwrap();
        ledger.record_failure(Path::new("/data/a"), EntryKind::File, None, "x").await.unwrap();

        let entries = ledger.entries().await.unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/data/a"), PathBuf::from("/data/b")]);
        assert_eq!(entries[1].kind, EntryKind::Dir);
        assert_eq!(entries[1].stamp, None);
    }
}
