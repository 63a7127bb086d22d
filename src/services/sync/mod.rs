//! 负载均衡配置同步引擎
//!
//! 把规范 LB 配置推送到每个节点，单节点协议：
//! 1. 创建回滚检查点（失败则跳过该节点，不做任何修改）
//! 2. 按需安装 LB
//! 3. 推送配置
//! 4. 语法校验，通过后 enable + restart
//! 5. 校验或重启失败时恢复本轮检查点并重启，区分自动恢复与需人工介入
//!
//! 同一时刻只有一轮同步（含漂移重同步）在修改节点

pub mod drift;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{FleetConfig, LbSettings};
use crate::domain::node::NodeRecord;
use crate::domain::report::FleetReport;
use crate::domain::sync::{
    ConfigHash, LbConfig, NodeSyncOutcome, NodeSyncResult, RollbackCheckpoint, RollbackOutcome,
    SyncStep,
};
use crate::error::{FleetError, FleetResult};
use crate::infra::remote::{shell_quote, RemoteExecutor};
use crate::services::notify::{Alert, Notifier, Severity};
use crate::state::{CheckpointLedger, NodeRegistry};

/// 已渲染并暂存到本地的规范配置
#[derive(Debug, Clone)]
pub struct StagedConfig {
    pub rendered: String,
    pub hash: ConfigHash,
    /// 本地暂存文件，推送时使用
    pub path: PathBuf,
}

/// 配置同步引擎
pub struct ConfigSyncEngine {
    executor: Arc<RemoteExecutor>,
    registry: Arc<NodeRegistry>,
    ledger: Arc<CheckpointLedger>,
    notifier: Arc<dyn Notifier>,
    lb: LbSettings,
    backend_port: u16,
    staging_dir: PathBuf,
    concurrency: usize,
    pass_lock: Mutex<()>,
}

impl ConfigSyncEngine {
    pub fn new(
        executor: Arc<RemoteExecutor>,
        registry: Arc<NodeRegistry>,
        ledger: Arc<CheckpointLedger>,
        notifier: Arc<dyn Notifier>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            executor,
            registry,
            ledger,
            notifier,
            lb: config.lb.clone(),
            backend_port: config.node.backend_port,
            staging_dir: config.staging_dir(),
            concurrency: config.concurrency.max(1),
            pass_lock: Mutex::new(()),
        }
    }

    /// 由注册表生成规范配置
    pub async fn canonical(&self) -> FleetResult<LbConfig> {
        let header = match &self.lb.header_path {
            Some(path) => Some(fs::read_to_string(path).await?),
            None => None,
        };
        let nodes = self.registry.list().await;
        Ok(LbConfig::from_nodes(
            header,
            self.lb.listen_port,
            &nodes,
            self.backend_port,
        ))
    }

    /// 渲染并写入本地暂存目录
    pub async fn stage(&self, config: &LbConfig) -> FleetResult<StagedConfig> {
        let rendered = config.render();
        let hash = ConfigHash::of(rendered.as_bytes());

        fs::create_dir_all(&self.staging_dir).await?;
        let path = self.staging_dir.join(format!("lb-{}.cfg", hash.short()));
        fs::write(&path, &rendered).await?;

        Ok(StagedConfig {
            rendered,
            hash,
            path,
        })
    }

    /// 同步全部节点
    pub async fn sync_all(&self, cancel: &CancellationToken) -> FleetResult<FleetReport<NodeSyncResult>> {
        let nodes = self.registry.list().await;
        self.sync_nodes(nodes, "sync_all", cancel).await
    }

    /// 同步指定节点
    ///
    /// 只有渲染/暂存规范配置失败才返回错误（此时尚未触碰任何节点）；
    /// 单节点失败记录在报告中
    pub async fn sync_nodes(
        &self,
        nodes: Vec<NodeRecord>,
        operation: &str,
        cancel: &CancellationToken,
    ) -> FleetResult<FleetReport<NodeSyncResult>> {
        let _pass = self.pass_lock.lock().await;
        let started_at = Utc::now();
        let staged = self.stage(&self.canonical().await?).await?;
        info!(
            operation = %operation,
            nodes = nodes.len(),
            hash = %staged.hash.short(),
            concurrency = self.concurrency,
            "Starting config sync"
        );

        let staged_ref = &staged;
        let results: Vec<NodeSyncResult> = stream::iter(nodes)
            .map(|node| async move {
                if cancel.is_cancelled() {
                    return NodeSyncResult::new(&node.name, NodeSyncOutcome::Cancelled);
                }
                self.sync_node(&node, staged_ref).await
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let cancelled = results
            .iter()
            .any(|r| r.outcome == NodeSyncOutcome::Cancelled);
        let report = FleetReport::from_results(operation, started_at, results, cancelled);
        self.report_failures(&report).await;

        if let Err(e) = self.ledger.compact().await {
            warn!(path = %self.ledger.path().display(), error = %e, "Checkpoint ledger compaction failed");
        }

        info!(
            operation = %operation,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            "Config sync finished"
        );
        Ok(report)
    }

    /// 单节点同步协议，只在持有 `pass_lock` 时调用
    async fn sync_node(&self, node: &NodeRecord, staged: &StagedConfig) -> NodeSyncResult {
        let cfg = self.lb.config_path.as_str();

        // a. 检查点
        let checkpoint = match self.create_checkpoint(node).await {
            Ok(cp) => cp,
            Err(e) => {
                warn!(node = %node.name, error = %e, "Checkpoint failed, skipping node");
                return NodeSyncResult::new(
                    &node.name,
                    NodeSyncOutcome::SkippedNoCheckpoint {
                        error: e.to_string(),
                    },
                );
            }
        };

        // b. 按需安装
        if let Err(e) = self.ensure_lb_installed(node).await {
            error!(node = %node.name, error = %e, "Load balancer install failed");
            self.discard_checkpoint(node, &checkpoint).await;
            return NodeSyncResult::new(
                &node.name,
                NodeSyncOutcome::Failed {
                    step: SyncStep::InstallLb,
                    error: e.to_string(),
                    rollback: RollbackOutcome::NotNeeded,
                },
            );
        }

        // c. 推送
        if let Err(e) = self
            .executor
            .push_file(node, &staged.path, cfg, "Push LB config")
            .await
        {
            return self.rollback(node, &checkpoint, SyncStep::Push, e).await;
        }

        // d. 校验
        let validate = format!("{} -c -f {}", self.lb.binary, shell_quote(cfg));
        match self.executor.check(node, &validate, "Validate LB config").await {
            Ok(result) if result.success => {}
            Ok(result) => {
                let err = FleetError::validation(&node.name, result.output);
                return self.rollback(node, &checkpoint, SyncStep::Validate, err).await;
            }
            Err(e) => return self.rollback(node, &checkpoint, SyncStep::Validate, e).await,
        }

        let service = shell_quote(&self.lb.service);
        let restart = format!("systemctl enable {} && systemctl restart {}", service, service);
        if let Err(e) = self.executor.execute(node, &restart, "Restart LB").await {
            return self.rollback(node, &checkpoint, SyncStep::Restart, e).await;
        }

        self.discard_checkpoint(node, &checkpoint).await;

        let hash = match self.remote_hash(node).await {
            Ok(Some(hash)) => hash,
            Ok(None) | Err(_) => {
                warn!(node = %node.name, "Could not read back config hash, reporting canonical hash");
                staged.hash.clone()
            }
        };
        info!(node = %node.name, hash = %hash.short(), "Node config synced");
        NodeSyncResult::new(&node.name, NodeSyncOutcome::Synced { hash })
    }

    /// 节点上当前配置的哈希，文件不存在时为 None
    pub async fn remote_hash(&self, node: &NodeRecord) -> FleetResult<Option<ConfigHash>> {
        let command = format!("sha256sum {}", shell_quote(&self.lb.config_path));
        let result = self.executor.check(node, &command, "Hash LB config").await?;
        if !result.success {
            return Ok(None);
        }
        Ok(ConfigHash::parse_sha256sum(&result.output))
    }

    async fn create_checkpoint(&self, node: &NodeRecord) -> FleetResult<RollbackCheckpoint> {
        if let Ok(Some(stale)) = self.ledger.latest(&node.name).await {
            warn!(
                node = %node.name,
                snapshot = %stale.snapshot_path,
                created = %stale.timestamp,
                "Node still has an unrecovered checkpoint from an earlier pass"
            );
        }
        let cfg = self.lb.config_path.as_str();
        let checkpoint = RollbackCheckpoint::new(&node.name, cfg, Utc::now());
        let dir = Path::new(cfg)
            .parent()
            .map(|p| p.display().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        let quoted = shell_quote(cfg);
        let command = format!(
            "mkdir -p {} && {{ [ -f {} ] || touch {}; }} && cp -p {} {}",
            shell_quote(&dir),
            quoted,
            quoted,
            quoted,
            shell_quote(&checkpoint.snapshot_path)
        );
        self.executor
            .execute(node, &command, "Create rollback checkpoint")
            .await
            .map_err(|e| FleetError::checkpoint(&node.name, e.to_string()))?;
        self.ledger
            .record(&checkpoint)
            .await
            .map_err(|e| FleetError::checkpoint(&node.name, e.to_string()))?;
        Ok(checkpoint)
    }

    async fn ensure_lb_installed(&self, node: &NodeRecord) -> FleetResult<()> {
        let check = format!("command -v {} >/dev/null 2>&1", shell_quote(&self.lb.binary));
        if self.executor.probe(node, &check, "Check LB binary").await.success {
            return Ok(());
        }
        info!(node = %node.name, binary = %self.lb.binary, "Load balancer missing, installing");
        self.executor
            .execute(node, &self.lb.install_command, "Install load balancer")
            .await
            .map(|_| ())
    }

    /// 丢弃检查点（账本墓碑 + 删除远端快照）
    async fn discard_checkpoint(&self, node: &NodeRecord, checkpoint: &RollbackCheckpoint) {
        if let Err(e) = self.ledger.discard(checkpoint).await {
            warn!(node = %node.name, error = %e, "Failed to discard checkpoint in ledger");
        }
        let command = format!("rm -f {}", shell_quote(&checkpoint.snapshot_path));
        self.executor
            .probe(node, &command, "Remove checkpoint snapshot")
            .await;
    }

    /// 恢复本轮创建的检查点并重启
    async fn rollback(
        &self,
        node: &NodeRecord,
        checkpoint: &RollbackCheckpoint,
        step: SyncStep,
        cause: FleetError,
    ) -> NodeSyncResult {
        warn!(node = %node.name, step = step.as_str(), error = %cause, "Sync step failed, rolling back");

        let command = format!(
            "cp -p {} {} && systemctl restart {}",
            shell_quote(&checkpoint.snapshot_path),
            shell_quote(&self.lb.config_path),
            shell_quote(&self.lb.service)
        );
        let rollback = match self
            .executor
            .execute(node, &command, "Restore rollback checkpoint")
            .await
        {
            Ok(_) => {
                self.discard_checkpoint(node, checkpoint).await;
                info!(node = %node.name, snapshot = %checkpoint.snapshot_path, "Rollback recovered node automatically");
                RollbackOutcome::RecoveredAutomatically
            }
            Err(e) => {
                error!(node = %node.name, snapshot = %checkpoint.snapshot_path, error = %e, "Rollback failed, manual intervention required");
                RollbackOutcome::RequiresManualIntervention {
                    error: e.to_string(),
                }
            }
        };

        NodeSyncResult::new(
            &node.name,
            NodeSyncOutcome::Failed {
                step,
                error: cause.to_string(),
                rollback,
            },
        )
    }

    /// 每次批量同步最多两条汇总告警
    async fn report_failures(&self, report: &FleetReport<NodeSyncResult>) {
        let manual: Vec<String> = report
            .details
            .iter()
            .filter(|r| r.needs_manual_intervention())
            .map(|r| r.node.clone())
            .collect();
        let other: Vec<String> = report
            .details
            .iter()
            .filter(|r| {
                !r.is_success()
                    && !r.needs_manual_intervention()
                    && r.outcome != NodeSyncOutcome::Cancelled
            })
            .map(|r| r.node.clone())
            .collect();

        if !manual.is_empty() {
            self.notifier
                .notify(Alert::new(
                    Severity::Critical,
                    "LB config rollback failed",
                    manual,
                    format!("{}: nodes left with an unverified config", report.operation),
                ))
                .await;
        }
        if !other.is_empty() {
            self.notifier
                .notify(Alert::new(
                    Severity::Warning,
                    "LB config sync incomplete",
                    other,
                    format!("{}: nodes kept their previous config", report.operation),
                ))
                .await;
        }
    }
}
