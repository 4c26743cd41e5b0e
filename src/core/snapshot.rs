//! 快照库 - 记录每个路径最近一次已知的修改时间，按父目录分组
//!
//! 对外只暴露窄接口：读取子项、创建、删除、更新时间。

use crate::db::{EntryKind, Stamp, TimesRow};
use crate::error::StoreError;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const ROOT_KEY: &str = "root";

/// 快照中的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub kind: EntryKind,
    /// 文件：最近一次成功复制时的时间；None 表示尚未复制过
    pub stamp: Option<Stamp>,
}

/// 初始化结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    /// 首次使用，刚建立根目录
    Fresh,
    Existing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotTracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotTracked,
}

/// 快照库
pub struct SnapshotStore {
    db: Arc<SqlitePool>,
    writes: AtomicU64,
}

pub(crate) fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn map_write_error(err: sqlx::Error, path: &Path, parent: &Path) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StoreError::DuplicateKey(path.to_path_buf());
        }
        if db_err.is_foreign_key_violation() {
            return StoreError::UnknownParent(parent.to_path_buf());
        }
    }
    StoreError::Database(err)
}

impl SnapshotStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            writes: AtomicU64::new(0),
        }
    }

    /// 本进程内对快照的写入次数
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn bump_writes(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// 快照库绑定的根目录
    pub async fn root(&self) -> Result<Option<String>, StoreError> {
        let root: Option<String> =
            sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
                .bind(ROOT_KEY)
                .fetch_optional(&*self.db)
                .await?;
        Ok(root)
    }

    /// 是否已为该根目录初始化过
    pub async fn is_initialized(&self, root: &Path) -> Result<bool, StoreError> {
        let configured = path_key(root);
        match self.root().await? {
            Some(stored) if stored == configured => Ok(true),
            Some(stored) => Err(StoreError::RootMismatch { stored, configured }),
            None => Ok(false),
        }
    }

    /// 首次使用时登记根目录
    pub async fn bootstrap(&self, root: &Path) -> Result<Bootstrap, StoreError> {
        if self.is_initialized(root).await? {
            debug!("快照库已初始化: {}", root.display());
            return Ok(Bootstrap::Existing);
        }

        let key = path_key(root);
        let mut tx = self.db.begin().await?;
        sqlx::query("INSERT INTO folders (folder_path) VALUES (?)")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, root, root))?;
        sqlx::query("INSERT INTO store_meta (key, value) VALUES (?, ?)")
            .bind(ROOT_KEY)
            .bind(&key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.bump_writes();

        info!("快照库首次初始化，根目录: {}", root.display());
        Ok(Bootstrap::Fresh)
    }

    /// 某目录的直接子项；目录未被跟踪时返回空
    pub async fn children_of(&self, dir: &Path) -> Result<BTreeMap<PathBuf, StoredEntry>, StoreError> {
        let rows = sqlx::query_as::<_, TimesRow>(
            "SELECT file_path, kind, modification_time FROM times WHERE parent_path = ?",
        )
        .bind(path_key(dir))
        .fetch_all(&*self.db)
        .await?;

        let mut children = BTreeMap::new();
        for row in rows {
            let entry = StoredEntry {
                kind: EntryKind::try_from(row.kind.as_str())?,
                stamp: Stamp::parse_opt(row.modification_time.as_deref())?,
            };
            children.insert(PathBuf::from(row.file_path), entry);
        }
        Ok(children)
    }

    /// 单条记录
    pub async fn get(&self, path: &Path) -> Result<Option<StoredEntry>, StoreError> {
        let row = sqlx::query_as::<_, TimesRow>(
            "SELECT file_path, kind, modification_time FROM times WHERE file_path = ?",
        )
        .bind(path_key(path))
        .fetch_optional(&*self.db)
        .await?;

        row.map(|r| {
            Ok(StoredEntry {
                kind: EntryKind::try_from(r.kind.as_str())?,
                stamp: Stamp::parse_opt(r.modification_time.as_deref())?,
            })
        })
        .transpose()
    }

    /// 登记新路径；目录同时登记为 folder
    pub async fn record_create(
        &self,
        path: &Path,
        parent: &Path,
        kind: EntryKind,
        stamp: Option<Stamp>,
    ) -> Result<(), StoreError> {
        let key = path_key(path);
        let parent_key = path_key(parent);
        let mut tx = self.db.begin().await?;

        let parent_known: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM folders WHERE folder_path = ?")
                .bind(&parent_key)
                .fetch_optional(&mut *tx)
                .await?;
        if parent_known.is_none() {
            return Err(StoreError::UnknownParent(parent.to_path_buf()));
        }

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM times WHERE file_path = ? UNION SELECT 1 FROM folders WHERE folder_path = ?",
        )
        .bind(&key)
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_some() {
            return Err(StoreError::DuplicateKey(path.to_path_buf()));
        }

        if kind == EntryKind::Dir {
            sqlx::query("INSERT INTO folders (folder_path) VALUES (?)")
                .bind(&key)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_write_error(e, path, parent))?;
        }

        sqlx::query(
            "INSERT INTO times (parent_path, file_path, kind, modification_time) VALUES (?, ?, ?, ?)",
        )
        .bind(&parent_key)
        .bind(&key)
        .bind(kind.as_str())
        .bind(stamp.map(|s| s.to_string()))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, path, parent))?;

        tx.commit().await?;
        self.bump_writes();
        Ok(())
    }

    /// 删除路径；目录必须先删掉所有被跟踪的子项
    pub async fn record_delete(&self, path: &Path) -> Result<DeleteOutcome, StoreError> {
        let key = path_key(path);
        let mut tx = self.db.begin().await?;

        let kind: Option<String> = sqlx::query_scalar("SELECT kind FROM times WHERE file_path = ?")
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(kind) = kind else {
            return Ok(DeleteOutcome::NotTracked);
        };

        if EntryKind::try_from(kind.as_str())? == EntryKind::Dir {
            let children: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM times WHERE parent_path = ?")
                    .bind(&key)
                    .fetch_one(&mut *tx)
                    .await?;
            if children > 0 {
                return Err(StoreError::HasChildren(path.to_path_buf()));
            }
        }

        sqlx::query("DELETE FROM times WHERE file_path = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM folders WHERE folder_path = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.bump_writes();
        Ok(DeleteOutcome::Deleted)
    }

    /// 覆盖已记录的时间
    pub async fn record_update(&self, path: &Path, stamp: Stamp) -> Result<UpdateOutcome, StoreError> {
        let result = sqlx::query("UPDATE times SET modification_time = ? WHERE file_path = ?")
            .bind(stamp.to_string())
            .bind(path_key(path))
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(UpdateOutcome::NotTracked);
        }
        self.bump_writes();
        Ok(UpdateOutcome::Updated)
    }

    /// 被跟踪的路径总数
    pub async fn tracked_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM times")
            .fetch_one(&*self.db)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    fn stamp(raw: &str) -> Stamp {
        Stamp::parse(raw).unwrap()
    }

    async fn store() -> SnapshotStore {
        let store = SnapshotStore::new(connect_in_memory().await.unwrap());
        assert_eq!(store.bootstrap(Path::new("/data")).await.unwrap(), Bootstrap::Fresh);
        store
    }

    #[tokio::test]
    async fn test_bootstrap_once() {
        let store = store().await;
        assert_eq!(
            store.bootstrap(Path::new("/data")).await.unwrap(),
            Bootstrap::Existing
        );
        assert!(matches!(
            store.bootstrap(Path::new("/other")).await,
            Err(StoreError::RootMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_children_of_untracked_is_empty() {
        let store = store().await;
        assert!(store.children_of(Path::new("/nowhere")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_and_list_children() {
        let store = store().await;
        let root = Path::new("/data");
        store
            .record_create(Path::new("/data/docs"), root, EntryKind::Dir, Some(stamp("2024-01-01 00:00")))
            .await
            .unwrap();
        store
            .record_create(Path::new("/data/docs/a.txt"), Path::new("/data/docs"), EntryKind::File, None)
            .await
            .unwrap();

        let top = store.children_of(root).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[Path::new("/data/docs")].kind, EntryKind::Dir);

        let docs = store.children_of(Path::new("/data/docs")).await.unwrap();
        assert_eq!(
            docs[Path::new("/data/docs/a.txt")],
            StoredEntry { kind: EntryKind::File, stamp: None }
        );
        assert_eq!(store.tracked_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let store = store().await;
        let root = Path::new("/data");
        store
            .record_create(Path::new("/data/a.txt"), root, EntryKind::File, None)
            .await
            .unwrap();
        let err = store
            .record_create(Path::new("/data/a.txt"), root, EntryKind::File, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
        assert!(err.is_integrity_violation());
    }

    #[tokio::test]
    async fn test_create_under_unknown_parent_fails() {
        let store = store().await;
        let err = store
            .record_create(Path::new("/data/x/a.txt"), Path::new("/data/x"), EntryKind::File, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownParent(_)));
    }

    #[tokio::test]
    async fn test_delete_dir_requires_empty() {
        let store = store().await;
        let root = Path::new("/data");
        let dir = Path::new("/data/docs");
        store.record_create(dir, root, EntryKind::Dir, None).await.unwrap();
        store
            .record_create(Path::new("/data/docs/a.txt"), dir, EntryKind::File, None)
            .await
            .unwrap();

        assert!(matches!(
            store.record_delete(dir).await,
            Err(StoreError::HasChildren(_))
        ));

        assert_eq!(
            store.record_delete(Path::new("/data/docs/a.txt")).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(store.record_delete(dir).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.record_delete(dir).await.unwrap(), DeleteOutcome::NotTracked);
        assert_eq!(store.tracked_count().await.unwrap(), 0);

        // 目录删除后可以重新创建
        store.record_create(dir, root, EntryKind::Dir, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_counts_writes() {
        let store = store().await;
        let path = Path::new("/data/a.txt");
        store
            .record_create(path, Path::new("/data"), EntryKind::File, None)
            .await
            .unwrap();
        let before = store.writes();

        assert_eq!(
            store.record_update(path, stamp("2024-01-02 00:00")).await.unwrap(),
            UpdateOutcome::Updated
        );
        assert_eq!(
            store.record_update(Path::new("/data/gone.txt"), stamp("2024-01-02 00:00")).await.unwrap(),
            UpdateOutcome::NotTracked
        );
        assert_eq!(store.writes(), before + 1);
        assert_eq!(
            store.get(path).await.unwrap().unwrap().stamp,
            Some(stamp("2024-01-02 00:00"))
        );
    }
}
