//! 差异对账 - 逐目录比较实时子项与快照，登记创建 / 删除并收集需要复制的文件
//!
//! 每个仍然存在的子目录都会被完整比较一次，不依赖目录自身时间戳，
//! 也不假设列目录的顺序。

use crate::core::scanner::{DirectoryLister, LiveEntry, Listing};
use crate::core::snapshot::{DeleteOutcome, SnapshotStore, StoredEntry};
use crate::db::{EntryKind, Stamp};
use crate::error::StoreError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 对账模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// 常规运行：新文件以“未复制”登记，等复制成功后才写入时间
    Track,
    /// 新建快照：直接记录实时时间，本轮不复制
    Catalog,
    /// 只统计，不写快照
    DryRun,
}

/// 需要复制的文件及本轮捕获的时间
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub path: PathBuf,
    pub stamp: Stamp,
}

/// 本地已删除的路径（删除子树时只记录最顶层）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deletion {
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// 本轮变更集
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSet {
    pub files: Vec<Change>,
    pub deleted: Vec<Deletion>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.deleted.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.iter().any(|c| c.path == path)
    }
}

/// 对账统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub dirs_visited: u32,
    pub entries_listed: u32,
    pub created: u32,
    pub deleted: u32,
    pub listing_failures: u32,
}

/// 一次遍历中显式传递的累加器
#[derive(Debug, Default)]
struct Walk {
    changes: ChangeSet,
    stats: ReconcileStats,
}

/// 差异对账器
pub struct Reconciler<'a> {
    store: &'a SnapshotStore,
    lister: &'a dyn DirectoryLister,
    mode: ReconcileMode,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a SnapshotStore, lister: &'a dyn DirectoryLister, mode: ReconcileMode) -> Self {
        Self { store, lister, mode }
    }

    /// 从根目录开始深度优先对账
    pub async fn reconcile(&self, root: &Path) -> Result<(ChangeSet, ReconcileStats), StoreError> {
        info!("开始对账: {} ({:?})", root.display(), self.mode);

        let mut walk = Walk::default();
        self.reconcile_dir(root, &mut walk).await?;

        info!(
            "对账完成: {} 个目录, {} 个子项, 新增 {}, 删除 {}, 待复制 {}, 未观测目录 {}",
            walk.stats.dirs_visited,
            walk.stats.entries_listed,
            walk.stats.created,
            walk.stats.deleted,
            walk.changes.files.len(),
            walk.stats.listing_failures
        );
        Ok((walk.changes, walk.stats))
    }

    fn writes_enabled(&self) -> bool {
        self.mode != ReconcileMode::DryRun
    }

    /// 新路径登记时使用的时间
    fn initial_stamp(&self, entry: &LiveEntry) -> Option<Stamp> {
        match (entry.kind, self.mode) {
            (EntryKind::Dir, _) | (EntryKind::File, ReconcileMode::Catalog) => Some(entry.stamp),
            (EntryKind::File, _) => None,
        }
    }

    async fn reconcile_dir(&self, dir: &Path, walk: &mut Walk) -> Result<(), StoreError> {
        walk.stats.dirs_visited += 1;

        let live = match self.lister.list(dir).await {
            Listing::Listed(entries) => entries,
            Listing::Failed(_) => {
                // 本轮没有观测，既不新增也不删除
                walk.stats.listing_failures += 1;
                return Ok(());
            }
        };
        walk.stats.entries_listed += live.len() as u32;

        let stored = self.store.children_of(dir).await?;
        let live_by_path: BTreeMap<&Path, &LiveEntry> =
            live.iter().map(|e| (e.path.as_path(), e)).collect();

        // 本地已删除，或类型改变（文件 <-> 目录）的路径先移除
        for (path, entry) in &stored {
            let gone = match live_by_path.get(path.as_path()) {
                None => true,
                Some(live_entry) => live_entry.kind != entry.kind,
            };
            if gone {
                self.remove_tree(path, entry.kind, walk).await?;
                walk.changes.deleted.push(Deletion {
                    path: path.clone(),
                    kind: entry.kind,
                });
            }
        }

        let mut descend = Vec::new();
        for entry in &live {
            match stored.get(&entry.path) {
                Some(known) if known.kind == entry.kind => {
                    self.compare_existing(entry, known, walk).await?;
                    if entry.kind == EntryKind::Dir {
                        descend.push(entry.path.clone());
                    }
                }
                _ => {
                    self.register_new(dir, entry, walk).await?;
                    if entry.kind == EntryKind::Dir {
                        descend.push(entry.path.clone());
                    }
                }
            }
        }

        for sub in descend {
            Box::pin(self.reconcile_dir(&sub, walk)).await?;
        }
        Ok(())
    }

    /// 两边都存在的路径
    async fn compare_existing(
        &self,
        entry: &LiveEntry,
        known: &StoredEntry,
        walk: &mut Walk,
    ) -> Result<(), StoreError> {
        if known.stamp == Some(entry.stamp) {
            return Ok(());
        }

        match entry.kind {
            EntryKind::File => {
                debug!("已修改: {} ({:?} -> {})", entry.path.display(), known.stamp, entry.stamp);
                walk.changes.files.push(Change {
                    path: entry.path.clone(),
                    stamp: entry.stamp,
                });
            }
            EntryKind::Dir => {
                // 目录不参与复制，时间直接写回
                if self.writes_enabled() {
                    self.store.record_update(&entry.path, entry.stamp).await?;
                }
            }
        }
        Ok(())
    }

    /// 本地新出现的路径
    async fn register_new(&self, parent: &Path, entry: &LiveEntry, walk: &mut Walk) -> Result<(), StoreError> {
        if self.writes_enabled() {
            self.store
                .record_create(&entry.path, parent, entry.kind, self.initial_stamp(entry))
                .await?;
        }
        walk.stats.created += 1;
        debug!("新增: {} ({})", entry.path.display(), entry.kind.as_str());

        if entry.kind == EntryKind::File {
            walk.changes.files.push(Change {
                path: entry.path.clone(),
                stamp: entry.stamp,
            });
        }
        Ok(())
    }

    /// 自底向上移除一棵子树
    async fn remove_tree(&self, path: &Path, kind: EntryKind, walk: &mut Walk) -> Result<(), StoreError> {
        if kind == EntryKind::Dir {
            let children = self.store.children_of(path).await?;
            for (child, entry) in &children {
                Box::pin(self.remove_tree(child, entry.kind, walk)).await?;
            }
        }

        if self.writes_enabled() && self.store.record_delete(path).await? == DeleteOutcome::NotTracked {
            debug!("删除时已不在快照中: {}", path.display());
            return Ok(());
        }
        walk.stats.deleted += 1;
        debug!("已删除: {}", path.display());
        Ok(())
    }
}
