use super::{Remote, TransferScope};
use crate::config::TransferConfig;
use crate::error::TransferError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// 通过 rclone（或兼容的命令行工具）复制到远端
pub struct RcloneRemote {
    config: TransferConfig,
    source_root: PathBuf,
    destination: String,
    name: String,
}

impl RcloneRemote {
    pub fn new(config: TransferConfig, source_root: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        let destination = destination.into();
        let name = format!("{}:{}", config.program, destination);
        Self {
            config,
            source_root: source_root.into(),
            destination,
            name,
        }
    }

    /// 生成只匹配该路径的过滤规则（以 / 开头锚定到根目录）
    pub fn include_pattern(rel_path: &Path, scope: TransferScope) -> String {
        let mut pattern = String::new();
        for component in rel_path.components() {
            if let Component::Normal(part) = component {
                pattern.push('/');
                for ch in part.to_string_lossy().chars() {
                    if matches!(ch, '\\' | '*' | '?' | '[' | ']' | '{' | '}') {
                        pattern.push('\\');
                    }
                    pattern.push(ch);
                }
            }
        }
        if scope == TransferScope::Tree {
            pattern.push_str("/**");
        }
        pattern
    }

    /// 执行一次外部命令；超时与失败同样处理
    async fn run(&self, args: Vec<String>, timeout_secs: u64) -> Result<(), TransferError> {
        debug!("执行: {} {}", self.config.program, args.join(" "));

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await {
            Ok(output) => output?,
            Err(_) => return Err(TransferError::Timeout { secs: timeout_secs }),
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        if !tail.is_empty() {
            warn!(
                "{} 输出:\n{}",
                self.config.program,
                tail.into_iter().rev().collect::<Vec<_>>().join("\n")
            );
        }
        Err(TransferError::Exit {
            code: output.status.code(),
        })
    }
}

#[async_trait]
impl Remote for RcloneRemote {
    async fn probe(&self) -> Result<(), TransferError> {
        let args = vec![self.config.probe_command.clone(), self.destination.clone()];
        self.run(args, self.config.probe_timeout_secs).await
    }

    async fn transfer(&self, rel_path: &Path, scope: TransferScope) -> Result<(), TransferError> {
        let mut args = vec![
            self.config.sync_command.clone(),
            self.source_root.to_string_lossy().into_owned(),
            self.destination.clone(),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args.push("--include".to_string());
        args.push(Self::include_pattern(rel_path, scope));

        self.run(args, self.config.transfer_timeout_secs).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(program: &str) -> RcloneRemote {
        let config = TransferConfig {
            program: program.to_string(),
            ..TransferConfig::default()
        };
        RcloneRemote::new(config, "/data", "Backup:")
    }

    #[test]
    fn test_include_pattern() {
        assert_eq!(
            RcloneRemote::include_pattern(Path::new("docs/a.txt"), TransferScope::File),
            "/docs/a.txt"
        );
        assert_eq!(
            RcloneRemote::include_pattern(Path::new("old"), TransferScope::Tree),
            "/old/**"
        );
        assert_eq!(
            RcloneRemote::include_pattern(Path::new("x/[draft]*.md"), TransferScope::File),
            "/x/\\[draft\\]\\*.md"
        );
    }

    #[test]
    fn test_name() {
        assert_eq!(remote("rclone").name(), "rclone:Backup:");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_decides_outcome() {
        assert!(remote("true").probe().await.is_ok());
        assert!(remote("true")
            .transfer(Path::new("a.txt"), TransferScope::File)
            .await
            .is_ok());
        assert!(matches!(
            remote("false").transfer(Path::new("a.txt"), TransferScope::File).await,
            Err(TransferError::Exit { code: Some(1) })
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let result = remote("definitely-not-a-real-transfer-tool").probe().await;
        assert!(matches!(result, Err(TransferError::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_failure() {
        // `sleep 5 5` 总共睡 10 秒
        let config = TransferConfig {
            program: "sleep".to_string(),
            probe_command: "5".to_string(),
            probe_timeout_secs: 1,
            ..TransferConfig::default()
        };
        let remote = RcloneRemote::new(config, "/data", "5");
        assert!(matches!(
            remote.probe().await,
            Err(TransferError::Timeout { secs: 1 })
        ));
    }
}
