pub mod models;
pub use models::*;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
pub use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// 打开（必要时创建）数据库文件并运行迁移
///
/// 快照库是单一的共享可变资源，所以连接池只保留一个连接，
/// 所有写入天然串行。
pub async fn connect(db_path: &Path) -> Result<Arc<SqlitePool>> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(Arc::new(pool))
}

/// 内存数据库（测试与演练用）
pub async fn connect_in_memory() -> Result<Arc<SqlitePool>> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    // 内存库随连接关闭而消失，禁止连接被回收
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(Arc::new(pool))
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
