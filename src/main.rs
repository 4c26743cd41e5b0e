//! rbackup: 增量单向备份
//!
//! 用修改时间快照找出自上次运行以来变化的文件，只把这些文件交给 rclone 复制。

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::error;

use rbackup_lib::commands::{failures, setup, sync};
use rbackup_lib::db::{RunLogRow, STAMP_FORMAT};
use rbackup_lib::logging::{get_log_dir, init_logging, LogConfig};
use rbackup_lib::{default_data_dir, AppState, SyncReport};

const HISTORY_LIMIT: u32 = 20;

#[derive(Parser)]
#[command(name = "rbackup")]
#[command(version)]
#[command(about = "Incremental one-way backup driven by modification-time snapshots")]
struct Cli {
    /// 详细日志（debug 级别并输出到终端）
    #[arg(short, long)]
    verbose: bool,

    /// 数据目录（config.json、数据库、logs/），默认 $HOME/.config/rbackup
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// 本地根目录，覆盖 config.json
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// 远端目标，覆盖 config.json
    #[arg(long, value_name = "REMOTE")]
    remote: Option<String>,

    /// 只重试失败台账中的路径
    #[arg(long, conflicts_with_all = ["count", "failures", "history", "init"])]
    retry: bool,

    /// 只统计变更，不复制也不写快照
    #[arg(long, conflicts_with_all = ["failures", "history", "init"])]
    count: bool,

    /// 列出失败台账
    #[arg(long, conflicts_with_all = ["history", "init"])]
    failures: bool,

    /// 列出最近的运行记录
    #[arg(long, conflicts_with = "init")]
    history: bool,

    /// 把 --root / --remote 写入 config.json
    #[arg(long)]
    init: bool,

    /// 以 JSON 输出运行报告
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("无法创建数据目录 {}: {}", data_dir.display(), e);
        return ExitCode::FAILURE;
    }

    let log_config = LogConfig::load(&data_dir);
    let _guards = match init_logging(&get_log_dir(&data_dir), &log_config, cli.verbose) {
        Ok(guards) => Some(guards),
        Err(e) => {
            eprintln!("无法初始化日志: {}", e);
            None
        }
    };

    match run(cli, data_dir).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, data_dir: PathBuf) -> anyhow::Result<ExitCode> {
    if cli.init {
        let config = setup::init_config(&data_dir, cli.root, cli.remote)?;
        println!(
            "已保存配置: {} -> {}",
            config.local_root.display(),
            config.remote
        );
        return Ok(ExitCode::SUCCESS);
    }

    let state = AppState::new(Some(data_dir)).await?;

    if cli.failures {
        let entries = failures::list_failures(&state).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        } else if entries.is_empty() {
            println!("失败台账为空");
        } else {
            for entry in &entries {
                let stamp = entry
                    .stamp
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "删除".to_string());
                println!(
                    "{:>3}x  {}  {}  {}",
                    entry.occurrences,
                    stamp,
                    entry.path.display(),
                    entry.last_error.as_deref().unwrap_or("")
                );
            }
        }
        state.cleanup().await;
        return Ok(ExitCode::SUCCESS);
    }

    if cli.history {
        let rows = failures::get_run_history(&state, HISTORY_LIMIT).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else if rows.is_empty() {
            println!("暂无运行记录");
        } else {
            for row in &rows {
                println!("{}", history_line(row));
            }
        }
        state.cleanup().await;
        return Ok(ExitCode::SUCCESS);
    }

    let config = state.backup_config(cli.root, cli.remote)?;
    let report = if cli.retry {
        sync::retry_failures(&state, &config).await
    } else if cli.count {
        sync::count_changes(&state, &config).await
    } else {
        sync::start_backup(&state, &config).await
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    state.cleanup().await;

    Ok(if report.is_aborted() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn history_line(row: &RunLogRow) -> String {
    let started = DateTime::<Utc>::from_timestamp(row.start_time, 0)
        .map(|t| t.format(STAMP_FORMAT).to_string())
        .unwrap_or_else(|| row.start_time.to_string());
    let mut line = format!(
        "{}  {:<6} {:<10} 变更 {}, 成功 {}, 失败 {}, 删除 {}, 用时 {}s",
        started,
        row.mode,
        row.status,
        row.files_changed,
        row.files_synced,
        row.files_failed,
        row.paths_deleted,
        row.duration_secs.unwrap_or(0)
    );
    if let Some(msg) = &row.error_message {
        line.push_str(&format!("  ({})", msg));
    }
    line
}

fn print_report(report: &SyncReport) {
    println!(
        "{} ({}): 扫描 {}, 变更 {}, 成功 {}, 失败 {}, 删除 {}, 延后 {}, 用时 {}s",
        report.mode.as_str(),
        report.status.as_str(),
        report.files_scanned,
        report.files_changed,
        report.files_synced,
        report.files_failed,
        report.paths_deleted,
        report.deferred,
        report.duration
    );
    if report.cataloged {
        println!("首次运行：已建立快照，本轮未复制");
    }
    if report.listing_failures > 0 {
        println!("{} 个目录本轮无法读取，已跳过", report.listing_failures);
    }
    for err in &report.errors {
        eprintln!("  {}", err);
    }
}
