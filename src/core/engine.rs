//! 同步编排 - 串行复制变更集，成功后更新快照，失败写入台账
//!
//! 三个入口：`run_backup`（探测 + 对账 + 复制）、`run_retry`（只处理台账）、
//! `run_count`（只统计，不写快照也不连远端）。每次运行都会写入起止记录，
//! 即使中途终止。

use crate::core::ledger::FailureLedger;
use crate::core::reconciler::{ChangeSet, ReconcileMode, ReconcileStats, Reconciler};
use crate::core::run_log::{RunCounts, RunLog, RunRecord};
use crate::core::scanner::DirectoryLister;
use crate::core::snapshot::{Bootstrap, SnapshotStore, UpdateOutcome};
use crate::db::{EntryAction, EntryKind, RunMode, RunStatus, Stamp};
use crate::error::RunError;
use crate::remote::{Remote, TransferScope};
use serde::Serialize;
use sqlx::SqlitePool;
use std::error::Error as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 本地根目录（已规范化）
    pub root: PathBuf,
    /// 每次备份最多复制的文件数
    pub max_batch: usize,
    /// 是否把本地删除同步到远端
    pub propagate_deletes: bool,
}

impl SyncConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_batch: 200,
            propagate_deletes: true,
        }
    }
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: u64,
    pub files_scanned: u32,
    pub files_changed: u32,
    pub files_synced: u32,
    pub files_failed: u32,
    pub paths_deleted: u32,
    /// 超出批量上限、留到下次运行的文件数
    pub deferred: u32,
    pub listing_failures: u32,
    pub store_writes: u64,
    /// 本次是否只建立了快照
    pub cataloged: bool,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn new(record: &RunRecord) -> Self {
        Self {
            run_id: record.id.clone(),
            mode: record.mode,
            status: RunStatus::Running,
            start_time: record.started_at.timestamp(),
            end_time: 0,
            duration: 0,
            files_scanned: 0,
            files_changed: 0,
            files_synced: 0,
            files_failed: 0,
            paths_deleted: 0,
            deferred: 0,
            listing_failures: 0,
            store_writes: 0,
            cataloged: false,
            errors: Vec::new(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.status == RunStatus::Aborted
    }

    fn apply_stats(&mut self, changes: &ChangeSet, stats: &ReconcileStats) {
        self.files_scanned = stats.entries_listed;
        self.files_changed = changes.files.len() as u32;
        self.paths_deleted = changes.deleted.len() as u32;
        self.listing_failures = stats.listing_failures;
    }

    fn counts(&self) -> RunCounts {
        RunCounts {
            files_scanned: self.files_scanned,
            files_changed: self.files_changed,
            files_synced: self.files_synced,
            files_failed: self.files_failed,
            paths_deleted: self.paths_deleted,
            store_writes: self.store_writes,
        }
    }
}

/// 一项待复制的工作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncItem {
    /// 复制文件，成功后把快照时间更新为捕获的时间
    Copy { path: PathBuf, stamp: Stamp },
    /// 把本地删除传播到远端
    Delete { path: PathBuf, kind: EntryKind },
}

impl SyncItem {
    pub fn path(&self) -> &Path {
        match self {
            SyncItem::Copy { path, .. } | SyncItem::Delete { path, .. } => path,
        }
    }

    pub fn action(&self) -> EntryAction {
        match self {
            SyncItem::Copy { .. } => EntryAction::Copy,
            SyncItem::Delete { .. } => EntryAction::Delete,
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            SyncItem::Copy { .. } => EntryKind::File,
            SyncItem::Delete { kind, .. } => *kind,
        }
    }

    /// 复制时捕获的时间；删除没有时间
    pub fn stamp(&self) -> Option<Stamp> {
        match self {
            SyncItem::Copy { stamp, .. } => Some(*stamp),
            SyncItem::Delete { .. } => None,
        }
    }

    fn scope(&self) -> TransferScope {
        match self {
            SyncItem::Delete {
                kind: EntryKind::Dir,
                ..
            } => TransferScope::Tree,
            _ => TransferScope::File,
        }
    }
}

/// 一批工作的结果
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub synced: u32,
    pub failed: u32,
    pub errors: Vec<String>,
}

/// 同步引擎
pub struct SyncEngine {
    store: SnapshotStore,
    ledger: FailureLedger,
    run_log: RunLog,
    remote: Arc<dyn Remote>,
    lister: Arc<dyn DirectoryLister>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        db: Arc<SqlitePool>,
        remote: Arc<dyn Remote>,
        lister: Arc<dyn DirectoryLister>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store: SnapshotStore::new(db.clone()),
            ledger: FailureLedger::new(db.clone()),
            run_log: RunLog::new(db),
            remote,
            lister,
            config,
        }
    }

    /// 指定运行横幅文件目录
    pub fn with_banner_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_log = self.run_log.with_banner_dir(dir);
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    /// 常规备份
    pub async fn run_backup(&self) -> SyncReport {
        let record = self.run_log.start(RunMode::Backup).await;
        info!("开始备份: {} -> {}", self.config.root.display(), self.remote.name());

        let mut report = SyncReport::new(&record);
        let writes_before = self.store.writes();
        let result = self.backup(&record, &mut report).await;
        self.finish(&record, report, writes_before, result).await
    }

    /// 只重试台账中的条目
    pub async fn run_retry(&self) -> SyncReport {
        let record = self.run_log.start(RunMode::Retry).await;
        info!("开始重试失败项 -> {}", self.remote.name());

        let mut report = SyncReport::new(&record);
        let writes_before = self.store.writes();
        let result = self.retry(&record, &mut report).await;
        self.finish(&record, report, writes_before, result).await
    }

    /// 只统计变更，不写快照、不连远端
    pub async fn run_count(&self) -> SyncReport {
        let record = self.run_log.start(RunMode::Count).await;
        info!("开始统计变更: {}", self.config.root.display());

        let mut report = SyncReport::new(&record);
        let writes_before = self.store.writes();
        let result = self.count(&mut report).await;
        self.finish(&record, report, writes_before, result).await
    }

    async fn probe(&self) -> Result<(), RunError> {
        self.remote.probe().await.map_err(|e| {
            RunError::CollaboratorUnavailable(format!("{}: {}", self.remote.name(), e))
        })?;
        debug!("远端可访问: {}", self.remote.name());
        Ok(())
    }

    async fn backup(&self, record: &RunRecord, report: &mut SyncReport) -> Result<(), RunError> {
        self.probe().await?;
        let root = self.config.root.as_path();

        if self.store.bootstrap(root).await? == Bootstrap::Fresh {
            // 首次运行只建立快照，不复制
            let (changes, stats) = Reconciler::new(&self.store, self.lister.as_ref(), ReconcileMode::Catalog)
                .reconcile(root)
                .await?;
            report.apply_stats(&changes, &stats);
            report.cataloged = true;
            report.status = RunStatus::Cataloged;
            info!("首次运行，已登记 {} 个文件，本轮不复制", changes.files.len());
            return Ok(());
        }

        let (changes, stats) = Reconciler::new(&self.store, self.lister.as_ref(), ReconcileMode::Track)
            .reconcile(root)
            .await?;
        report.apply_stats(&changes, &stats);

        let mut items: Vec<SyncItem> = changes
            .files
            .into_iter()
            .map(|c| SyncItem::Copy {
                path: c.path,
                stamp: c.stamp,
            })
            .collect();
        let deletions: Vec<SyncItem> = changes
            .deleted
            .into_iter()
            .map(|d| SyncItem::Delete { path: d.path, kind: d.kind })
            .collect();

        // 明细包含全部变更，不受批量上限和删除策略影响
        self.run_log.record_entries(record, &items).await;
        self.run_log.record_entries(record, &deletions).await;

        if items.len() > self.config.max_batch {
            report.deferred = (items.len() - self.config.max_batch) as u32;
            warn!(
                "变更文件 {} 个，超过单次上限 {}，其余 {} 个留到下次",
                items.len(),
                self.config.max_batch,
                report.deferred
            );
            items.truncate(self.config.max_batch);
        }

        if self.config.propagate_deletes {
            items.extend(deletions);
        }

        let outcome = self.sync_items(record, &items).await?;
        report.files_synced = outcome.synced;
        report.files_failed = outcome.failed;
        report.errors = outcome.errors;
        report.status = RunStatus::Completed;
        Ok(())
    }

    async fn retry(&self, record: &RunRecord, report: &mut SyncReport) -> Result<(), RunError> {
        self.probe().await?;
        // 绑定了其它根目录的快照库直接报错
        self.store.is_initialized(&self.config.root).await?;

        let items: Vec<SyncItem> = self
            .ledger
            .entries()
            .await?
            .into_iter()
            .map(|entry| match entry.stamp {
                Some(stamp) => SyncItem::Copy {
                    path: entry.path,
                    stamp,
                },
                None => SyncItem::Delete {
                    path: entry.path,
                    kind: entry.kind,
                },
            })
            .collect();
        report.files_changed = items.len() as u32;
        info!("台账中共 {} 项待重试", items.len());
        self.run_log.record_entries(record, &items).await;

        let outcome = self.sync_items(record, &items).await?;
        report.files_synced = outcome.synced;
        report.files_failed = outcome.failed;
        report.errors = outcome.errors;
        report.status = RunStatus::Completed;
        Ok(())
    }

    async fn count(&self, report: &mut SyncReport) -> Result<(), RunError> {
        let root = self.config.root.as_path();
        if !self.store.is_initialized(root).await? {
            info!("快照库尚未初始化，所有文件都视为新增");
        }

        let (changes, stats) = Reconciler::new(&self.store, self.lister.as_ref(), ReconcileMode::DryRun)
            .reconcile(root)
            .await?;
        report.apply_stats(&changes, &stats);
        report.status = RunStatus::Completed;
        info!(
            "待复制 {} 个文件，待删除 {} 个路径",
            report.files_changed, report.paths_deleted
        );
        Ok(())
    }

    /// 串行处理每一项；单项失败只记入台账，不影响后续项
    pub async fn sync_items(&self, record: &RunRecord, items: &[SyncItem]) -> Result<SyncOutcome, RunError> {
        let mut outcome = SyncOutcome::default();
        let total = items.len();

        for (index, item) in items.iter().enumerate() {
            let path = item.path();
            let Ok(rel_path) = path.strip_prefix(&self.config.root) else {
                let msg = format!("路径不在根目录下: {}", path.display());
                warn!("{}", msg);
                self.record_failure(item, &msg).await?;
                outcome.failed += 1;
                outcome.errors.push(msg);
                continue;
            };

            debug!("[{}/{}] {:?}", index + 1, total, item);
            match self.remote.transfer(rel_path, item.scope()).await {
                Ok(()) => {
                    self.commit_success(item).await?;
                    self.run_log.mark_synced(record, item).await;
                    outcome.synced += 1;
                }
                Err(e) => {
                    let msg = format!("{}: {}", rel_path.display(), e);
                    warn!("复制失败 {}", msg);
                    let occurrences = self.record_failure(item, &e.to_string()).await?;
                    debug!("累计失败 {} 次: {}", occurrences, rel_path.display());
                    outcome.failed += 1;
                    outcome.errors.push(msg);
                }
            }
        }

        if total > 0 {
            info!("复制完成: 成功 {}, 失败 {}", outcome.synced, outcome.failed);
        }
        Ok(outcome)
    }

    /// 单项成功后立即提交快照并清除台账
    async fn commit_success(&self, item: &SyncItem) -> Result<(), RunError> {
        match item {
            SyncItem::Copy { path, stamp } => {
                if self.store.record_update(path, *stamp).await? == UpdateOutcome::NotTracked {
                    debug!("复制成功但路径已不在快照中: {}", path.display());
                }
                debug!("已复制: {}", path.display());
            }
            SyncItem::Delete { path, .. } => {
                debug!("远端已删除: {}", path.display());
            }
        }
        self.ledger.clear(item.path()).await?;
        Ok(())
    }

    async fn record_failure(&self, item: &SyncItem, error: &str) -> Result<u32, RunError> {
        let count = match item {
            SyncItem::Copy { path, stamp } => {
                self.ledger
                    .record_failure(path, EntryKind::File, Some(*stamp), error)
                    .await?
            }
            SyncItem::Delete { path, kind } => self.ledger.record_failure(path, *kind, None, error).await?,
        };
        Ok(count)
    }

    /// 收尾：终止时写错误日志，并始终写入运行记录
    async fn finish(
        &self,
        record: &RunRecord,
        mut report: SyncReport,
        writes_before: u64,
        result: Result<(), RunError>,
    ) -> SyncReport {
        report.store_writes = self.store.writes().saturating_sub(writes_before);

        let error_message = match result {
            Ok(()) => None,
            Err(e) => {
                let chain = error_chain(&e);
                error!("运行终止 ({}): {}", record.mode.as_str(), chain);
                report.status = RunStatus::Aborted;
                report.errors.push(chain.clone());
                Some(chain)
            }
        };

        report.duration = self
            .run_log
            .finish(record, report.status, &report.counts(), error_message.as_deref())
            .await;
        report.end_time = report.start_time + report.duration as i64;

        info!(
            "运行结束 ({}): {}, 扫描 {}, 变更 {}, 成功 {}, 失败 {}, 删除 {}, 延后 {}, 快照写入 {}",
            record.mode.as_str(),
            report.status.as_str(),
            report.files_scanned,
            report.files_changed,
            report.files_synced,
            report.files_failed,
            report.paths_deleted,
            report.deferred,
            report.store_writes
        );
        report
    }
}

/// 拼接完整的错误链
fn error_chain(err: &RunError) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scanner::FsScanner;
    use crate::db::connect_in_memory;
    use crate::error::{StoreError, TransferError};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// 记录调用并按路径模拟失败的远端
    #[derive(Default)]
    struct ScriptedRemote {
        offline: bool,
        failing: Mutex<HashSet<PathBuf>>,
        calls: Mutex<Vec<(PathBuf, TransferScope)>>,
    }

    #[async_trait]
    impl Remote for ScriptedRemote {
        async fn probe(&self) -> Result<(), TransferError> {
            if self.offline {
                return Err(TransferError::Exit { code: Some(1) });
            }
            Ok(())
        }

        async fn transfer(&self, rel_path: &Path, scope: TransferScope) -> Result<(), TransferError> {
            self.calls.lock().unwrap().push((rel_path.to_path_buf(), scope));
            if self.failing.lock().unwrap().contains(rel_path) {
                return Err(TransferError::Timeout { secs: 600 });
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    async fn engine(root: &Path, remote: Arc<ScriptedRemote>) -> SyncEngine {
        SyncEngine::new(
            connect_in_memory().await.unwrap(),
            remote,
            Arc::new(FsScanner::default()),
            SyncConfig::new(root),
        )
    }

    #[tokio::test]
    async fn test_sync_items_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("b.txt"), b"b").unwrap();

        let remote = Arc::new(ScriptedRemote::default());
        remote.failing.lock().unwrap().insert(PathBuf::from("a.txt"));
        let engine = engine(root, remote.clone()).await;
        engine.run_backup().await;

        let stamp = Stamp::parse("2030-01-01 00:00").unwrap();
        let items = vec![
            SyncItem::Copy {
                path: root.join("a.txt"),
                stamp,
            },
            SyncItem::Copy {
                path: root.join("b.txt"),
                stamp,
            },
            SyncItem::Delete {
                path: root.join("old"),
                kind: EntryKind::Dir,
            },
        ];
        let record = engine.run_log().start(RunMode::Retry).await;
        engine.run_log().record_entries(&record, &items).await;
        let outcome = engine.sync_items(&record, &items).await.unwrap();
        assert_eq!(outcome.synced, 2);
        assert_eq!(outcome.failed, 1);

        assert_ne!(engine.store().get(&root.join("a.txt")).await.unwrap().unwrap().stamp, Some(stamp));
        assert_eq!(engine.store().get(&root.join("b.txt")).await.unwrap().unwrap().stamp, Some(stamp));
        assert_eq!(engine.ledger().count().await.unwrap(), 1);
        assert!(remote
            .calls
            .lock()
            .unwrap()
            .contains(&(PathBuf::from("old"), TransferScope::Tree)));

        let synced: Vec<bool> = engine
            .run_log()
            .entries(&record.id)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.synced)
            .collect();
        // copy a.txt, copy b.txt, delete old
        assert_eq!(synced, vec![false, true, true]);
    }

    #[tokio::test]
    async fn test_offline_remote_aborts_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let remote = Arc::new(ScriptedRemote {
            offline: true,
            ..ScriptedRemote::default()
        });
        let engine = engine(dir.path(), remote.clone()).await;
        let report = engine.run_backup().await;

        assert!(report.is_aborted());
        assert_eq!(report.store_writes, 0);
        assert!(remote.calls.lock().unwrap().is_empty());
        assert!(!engine.store().is_initialized(dir.path()).await.unwrap());

        // 运行记录仍然写入了起止
        let runs = engine.run_log().recent(1).await.unwrap();
        assert_eq!(runs[0].status, "aborted");
        assert!(runs[0].end_time.is_some());
        assert!(runs[0].error_message.as_deref().unwrap().contains("scripted"));
    }

    #[tokio::test]
    async fn test_batch_limit_defers_rest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let remote = Arc::new(ScriptedRemote::default());
        let mut engine = engine(root, remote.clone()).await;
        engine.config.max_batch = 2;
        engine.run_backup().await;

        for name in ["1.txt", "2.txt", "3.txt"] {
            std::fs::write(root.join(name), name).unwrap();
        }
        let report = engine.run_backup().await;
        assert_eq!(report.files_changed, 3);
        assert_eq!(report.files_synced, 2);
        assert_eq!(report.deferred, 1);

        // 剩下的一个在下次运行时仍被检测到
        let report = engine.run_backup().await;
        assert_eq!(report.files_changed, 1);
        assert_eq!(report.files_synced, 1);
        assert_eq!(remote.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_root_mismatch_is_integrity_violation() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let db = connect_in_memory().await.unwrap();
        SnapshotStore::new(db.clone()).bootstrap(other.path()).await.unwrap();

        let engine = SyncEngine::new(
            db,
            Arc::new(ScriptedRemote::default()),
            Arc::new(FsScanner::default()),
            SyncConfig::new(dir.path()),
        );
        let report = engine.run_count().await;
        assert!(report.is_aborted());

        let err = RunError::from(StoreError::RootMismatch {
            stored: "a".to_string(),
            configured: "b".to_string(),
        });
        assert!(matches!(err, RunError::IntegrityViolation(_)));
    }

    #[test]
    fn test_error_chain_includes_source() {
        let err = RunError::from(StoreError::DuplicateKey(PathBuf::from("/data/a.txt")));
        let chain = error_chain(&err);
        assert!(chain.contains("/data/a.txt"));
    }
}
