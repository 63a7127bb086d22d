//! 远程执行原语
//!
//! `RemoteTransport` 抽象出 ssh/scp 通道；`RemoteExecutor` 在其上叠加：
//! - 有界重试与固定退避
//! - 全局调用间隔限流
//! - 每次尝试写入操作日志（脱敏）

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::RemoteConfig;
use crate::domain::node::{NodeRecord, SshCredential};
use crate::error::{FleetError, FleetResult};

use super::command::{CommandError, CommandOutput, CommandRunner};
use super::oplog::{OperationEntry, OperationLog};
use super::retry::{RateLimiter, RetryPolicy};

/// ssh 自身出错（连接失败、认证失败）时的退出码
const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

/// 远程通道
///
/// 连接层失败返回 `Err(Connectivity)`；命令本身的退出码通过 `CommandOutput` 返回
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn run(&self, node: &NodeRecord, command: &str) -> FleetResult<CommandOutput>;

    /// 上传本地文件到节点
    async fn push(&self, node: &NodeRecord, local: &Path, remote: &str) -> FleetResult<CommandOutput>;

    /// 从节点下载文件到本地
    async fn pull(&self, node: &NodeRecord, remote: &str, local: &Path) -> FleetResult<CommandOutput>;
}

/// 单引号包裹，供远程 shell 使用
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// 基于系统 ssh/scp 的通道
pub struct SshTransport {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshTransport {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
        }
    }

    /// 公共选项，`port_flag` 区分 ssh(-p) 与 scp(-P)
    fn base_options(&self, node: &NodeRecord, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            port_flag.to_string(),
            node.ssh_port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        match &node.credential {
            SshCredential::KeyFile(path) => {
                args.extend(["-i".to_string(), path.clone()]);
                args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
            }
            SshCredential::Agent => {
                args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
            }
            SshCredential::Password(_) => {}
        }
        args
    }

    /// 组装最终程序、参数与环境变量；密码凭证经由 sshpass -e 传递
    fn build(
        &self,
        node: &NodeRecord,
        program: &str,
        args: Vec<String>,
    ) -> FleetResult<(String, Vec<String>, Vec<(String, String)>)> {
        match &node.credential {
            SshCredential::Password(var) => {
                let password = node.credential.resolve_password().ok_or_else(|| {
                    FleetError::Auth(format!(
                        "ssh password for {} not available in ${}",
                        node.name, var
                    ))
                })?;
                let mut full = vec!["-e".to_string(), program.to_string()];
                full.extend(args);
                Ok((
                    "sshpass".to_string(),
                    full,
                    vec![("SSHPASS".to_string(), password)],
                ))
            }
            _ => Ok((program.to_string(), args, Vec::new())),
        }
    }

    async fn invoke(
        &self,
        node: &NodeRecord,
        program: &str,
        args: Vec<String>,
    ) -> FleetResult<CommandOutput> {
        let (program, args, envs) = self.build(node, program, args)?;
        match CommandRunner::run_simple(&program, &args, &envs, self.command_timeout).await {
            Ok(output) if output.code == Some(SSH_TRANSPORT_EXIT_CODE) => Err(
                FleetError::connectivity(&node.name, output.stderr.trim().to_string()),
            ),
            Ok(output) => Ok(output),
            Err(CommandError::Timeout(d)) => Err(FleetError::connectivity(
                &node.name,
                format!("no response within {:?}", d),
            )),
            Err(CommandError::SpawnFailed(e)) => Err(FleetError::connectivity(
                &node.name,
                format!("failed to spawn {}: {}", program, e),
            )),
        }
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn run(&self, node: &NodeRecord, command: &str) -> FleetResult<CommandOutput> {
        let mut args = self.base_options(node, "-p");
        args.push(node.user_at_host());
        args.push(command.to_string());
        self.invoke(node, "ssh", args).await
    }

    async fn push(&self, node: &NodeRecord, local: &Path, remote: &str) -> FleetResult<CommandOutput> {
        let mut args = self.base_options(node, "-P");
        args.push(local.display().to_string());
        args.push(format!("{}:{}", node.user_at_host(), remote));
        self.invoke(node, "scp", args).await
    }

    async fn pull(&self, node: &NodeRecord, remote: &str, local: &Path) -> FleetResult<CommandOutput> {
        let mut args = self.base_options(node, "-P");
        args.push(format!("{}:{}", node.user_at_host(), remote));
        args.push(local.display().to_string());
        self.invoke(node, "scp", args).await
    }
}

/// 远程调用结果
#[derive(Debug, Clone, Serialize)]
pub struct RemoteCommandResult {
    pub success: bool,
    pub output: String,
    pub attempts: u32,
}

/// 远程执行器
pub struct RemoteExecutor {
    transport: Arc<dyn RemoteTransport>,
    policy: RetryPolicy,
    limiter: RateLimiter,
    oplog: Arc<OperationLog>,
}

enum Action<'a> {
    Run(&'a str),
    Push(&'a Path, &'a str),
    Pull(&'a str, &'a Path),
}

impl RemoteExecutor {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        policy: RetryPolicy,
        min_interval: Duration,
        oplog: Arc<OperationLog>,
    ) -> Self {
        Self {
            transport,
            policy,
            limiter: RateLimiter::new(min_interval),
            oplog,
        }
    }

    pub fn from_config(
        transport: Arc<dyn RemoteTransport>,
        config: &RemoteConfig,
        oplog: Arc<OperationLog>,
    ) -> Self {
        Self::new(
            transport,
            RetryPolicy::fixed(config.max_attempts, config.backoff),
            config.min_interval,
            oplog,
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 执行远程命令，重试耗尽后返回终态错误
    pub async fn execute(
        &self,
        node: &NodeRecord,
        command: &str,
        description: &str,
    ) -> FleetResult<RemoteCommandResult> {
        debug!(node = %node.name, command = %self.oplog.redact(command), "Remote command");
        self.with_retry(node, description, &self.policy, Action::Run(command))
            .await
    }

    /// 单次探测（轮询用），任何失败都以 success=false 返回
    pub async fn probe(&self, node: &NodeRecord, command: &str, description: &str) -> RemoteCommandResult {
        match self
            .with_retry(node, description, &RetryPolicy::once(), Action::Run(command))
            .await
        {
            Ok(result) => result,
            Err(e) => RemoteCommandResult {
                success: false,
                output: e.to_string(),
                attempts: 1,
            },
        }
    }

    /// 执行检查类命令（如配置语法校验）
    ///
    /// 只有连接失败会重试；命令以非零退出时返回 success=false 而不是错误
    pub async fn check(
        &self,
        node: &NodeRecord,
        command: &str,
        description: &str,
    ) -> FleetResult<RemoteCommandResult> {
        match self
            .attempt(node, description, &self.policy, FleetError::is_retryable, Action::Run(command))
            .await
        {
            Err(FleetError::RemoteCommand { output, attempts, .. }) => Ok(RemoteCommandResult {
                success: false,
                output,
                attempts,
            }),
            other => other,
        }
    }

    /// 上传文件，与命令共享重试策略
    pub async fn push_file(
        &self,
        node: &NodeRecord,
        local: &Path,
        remote: &str,
        description: &str,
    ) -> FleetResult<RemoteCommandResult> {
        self.with_retry(node, description, &self.policy, Action::Push(local, remote))
            .await
    }

    /// 下载文件，与命令共享重试策略
    pub async fn pull_file(
        &self,
        node: &NodeRecord,
        remote: &str,
        local: &Path,
        description: &str,
    ) -> FleetResult<RemoteCommandResult> {
        self.with_retry(node, description, &self.policy, Action::Pull(remote, local))
            .await
    }

    async fn with_retry(
        &self,
        node: &NodeRecord,
        description: &str,
        policy: &RetryPolicy,
        action: Action<'_>,
    ) -> FleetResult<RemoteCommandResult> {
        let retryable = |e: &FleetError| {
            matches!(
                e,
                FleetError::Connectivity { .. } | FleetError::RemoteCommand { .. }
            )
        };
        self.attempt(node, description, policy, retryable, action).await
    }

    async fn attempt(
        &self,
        node: &NodeRecord,
        description: &str,
        policy: &RetryPolicy,
        retryable: impl Fn(&FleetError) -> bool,
        action: Action<'_>,
    ) -> FleetResult<RemoteCommandResult> {
        let label = format!("{} on {}", description, node.name);
        let action = &action;
        let (result, attempts) = policy
            .run(&label, retryable, |attempt| async move {
                self.limiter.acquire().await;

                let outcome = match action {
                    Action::Run(command) => self.transport.run(node, command).await,
                    Action::Push(local, remote) => self.transport.push(node, local, remote).await,
                    Action::Pull(remote, local) => self.transport.pull(node, remote, local).await,
                };

                match outcome {
                    Ok(output) => {
                        let text = output.combined();
                        self.oplog
                            .append(OperationEntry {
                                node: &node.name,
                                description,
                                attempt,
                                success: output.success(),
                                output: &text,
                            })
                            .await;
                        if output.success() {
                            Ok(text)
                        } else {
                            Err(FleetError::RemoteCommand {
                                node: node.name.clone(),
                                description: description.to_string(),
                                attempts: attempt,
                                output: self.oplog.redact(&text),
                            })
                        }
                    }
                    Err(e) => {
                        self.oplog
                            .append(OperationEntry {
                                node: &node.name,
                                description,
                                attempt,
                                success: false,
                                output: &e.to_string(),
                            })
                            .await;
                        Err(e)
                    }
                }
            })
            .await;

        match result {
            Ok(output) => {
                if attempts > 1 {
                    info!(node = %node.name, operation = %description, attempts = attempts, "Remote operation succeeded after retry");
                }
                Ok(RemoteCommandResult {
                    success: true,
                    output,
                    attempts,
                })
            }
            Err(e) => {
                if policy.max_attempts > 1 {
                    error!(node = %node.name, operation = %description, attempts = attempts, error = %e, "Remote operation failed");
                }
                Err(e)
            }
        }
    }
}
