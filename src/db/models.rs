use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StoreError;

/// 持久化时间格式（分钟精度）
pub const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

/// 0001-01-01 00:00:00 UTC
const MIN_UNIX_SECS: i64 = -62_135_596_800;
/// 9999-12-31 23:59:59 UTC
const MAX_UNIX_SECS: i64 = 253_402_300_799;

/// 相对 UNIX 纪元的整秒数（向下取整），溢出时取 i64 边界
fn unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
        Err(e) => {
            let before = e.duration();
            let secs = i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
            if before.subsec_nanos() > 0 {
                secs.saturating_neg().saturating_sub(1)
            } else {
                secs.saturating_neg()
            }
        }
    }
}

/// 修改时间戳，截断到分钟，按 UTC 存储
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp(NaiveDateTime);

impl Stamp {
    pub fn new(at: NaiveDateTime) -> Self {
        let truncated = at
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(at);
        Self(truncated)
    }

    /// 超出可表示范围（公元 1 年至 9999 年）时返回 None
    pub fn try_from_system_time(time: SystemTime) -> Option<Self> {
        let secs = unix_secs(time);
        if !(MIN_UNIX_SECS..=MAX_UNIX_SECS).contains(&secs) {
            return None;
        }
        DateTime::<Utc>::from_timestamp(secs, 0).map(|utc| Self::new(utc.naive_utc()))
    }

    /// 超出范围的时间被截到边界，不会 panic
    pub fn from_system_time(time: SystemTime) -> Self {
        let secs = unix_secs(time).clamp(MIN_UNIX_SECS, MAX_UNIX_SECS);
        let utc = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default();
        Self::new(utc.naive_utc())
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        NaiveDateTime::parse_from_str(raw.trim(), STAMP_FORMAT)
            .map(Self)
            .map_err(|_| StoreError::InvalidStamp(raw.to_string()))
    }

    /// 解析可空列
    pub fn parse_opt(raw: Option<&str>) -> Result<Option<Self>, StoreError> {
        raw.map(Self::parse).transpose()
    }

    pub fn naive(&self) -> NaiveDateTime {
        self.0
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(STAMP_FORMAT))
    }
}

/// 路径类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Dir => "dir",
        }
    }
}

impl TryFrom<&str> for EntryKind {
    type Error = StoreError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "file" => Ok(EntryKind::File),
            "dir" => Ok(EntryKind::Dir),
            other => Err(StoreError::InvalidKind(other.to_string())),
        }
    }
}

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Backup,
    Retry,
    Count,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Backup => "backup",
            RunMode::Retry => "retry",
            RunMode::Count => "count",
        }
    }
}

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    /// 首次运行：只建立快照，不复制
    Cataloged,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cataloged => "cataloged",
            RunStatus::Aborted => "aborted",
        }
    }
}

/// 运行明细中的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryAction {
    Copy,
    Delete,
}

impl EntryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryAction::Copy => "copy",
            EntryAction::Delete => "delete",
        }
    }
}

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TimesRow {
    pub file_path: String,
    pub kind: String,
    pub modification_time: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerRow {
    pub file_path: String,
    pub kind: String,
    pub modification_time: Option<String>,
    pub occurrence_count: i64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogRow {
    pub id: String,
    pub mode: String,
    pub pid: i64,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_secs: Option<i64>,
    pub status: String,
    pub files_scanned: i64,
    pub files_changed: i64,
    pub files_synced: i64,
    pub files_failed: i64,
    pub paths_deleted: i64,
    pub store_writes: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEntryRow {
    pub run_id: String,
    pub file_path: String,
    pub action: String,
    pub kind: String,
    pub modification_time: Option<String>,
    pub synced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_stamp_truncates_to_minute() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_nano_opt(10, 11, 12, 345)
            .unwrap();
        let stamp = Stamp::new(at);
        assert_eq!(stamp.to_string(), "2024-01-02 10:11");
        assert_eq!(Stamp::parse("2024-01-02 10:11").unwrap(), stamp);
    }

    #[test]
    fn test_stamp_out_of_range_is_clamped() {
        use std::time::Duration;

        let far_future = UNIX_EPOCH + Duration::from_secs(9_000_000_000_000);
        assert_eq!(Stamp::try_from_system_time(far_future), None);
        assert_eq!(Stamp::from_system_time(far_future).to_string(), "9999-12-31 23:59");

        let before_epoch = UNIX_EPOCH - Duration::from_secs(90);
        assert_eq!(
            Stamp::try_from_system_time(before_epoch).unwrap().to_string(),
            "1969-12-31 23:58"
        );

        let at = Stamp::parse("2024-01-01 00:00").unwrap();
        let when: SystemTime = at.naive().and_utc().into();
        assert_eq!(Stamp::try_from_system_time(when), Some(at));
    }

    #[test]
    fn test_stamp_rejects_garbage() {
        assert!(matches!(
            Stamp::parse("yesterday"),
            Err(StoreError::InvalidStamp(_))
        ));
        assert_eq!(Stamp::parse_opt(None).unwrap(), None);
    }

    #[test]
    fn test_entry_kind_from_str() {
        assert_eq!(EntryKind::try_from("dir").unwrap(), EntryKind::Dir);
        assert!(EntryKind::try_from("link").is_err());
    }
}
