//! 舰队编排入口
//!
//! 把注册表、远程执行、面板客户端与各服务组装在一起，对外暴露
//! Deploy / SyncAll / HealthCheckAll / Remove 等操作。所有操作只返回结构化结果，不直接输出。

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FleetConfig;
use crate::domain::deploy::DeployReport;
use crate::domain::health::HealthReport;
use crate::domain::node::NodeRecord;
use crate::domain::report::{FleetReport, ReconnectResult};
use crate::domain::sync::{DriftReport, NodeSyncResult};
use crate::error::{FleetError, FleetResult};
use crate::infra::oplog::{OperationLog, Redactor};
use crate::infra::panel::{PanelApi, PanelClient};
use crate::infra::remote::{RemoteExecutor, RemoteTransport, SshTransport};
use crate::infra::retry::RetryPolicy;
use crate::services::deploy::DeploymentOrchestrator;
use crate::services::health::HealthMonitor;
use crate::services::notify::{Notifier, TracingNotifier};
use crate::services::sync::drift::DriftPass;
use crate::services::sync::ConfigSyncEngine;
use crate::state::{CheckpointLedger, ImportReport, NodeRegistry};

/// 部署结果：部署报告 + 随后的全量同步
#[derive(Debug, Clone, Serialize)]
pub struct DeployResult {
    pub deploy: DeployReport,
    /// 部署失败或同步无法开始时为 None
    pub sync: Option<FleetReport<NodeSyncResult>>,
}

/// 移除结果
#[derive(Debug, Clone, Serialize)]
pub struct RemoveReport {
    pub node: String,
    pub external_id: Option<u64>,
    pub sync: Option<FleetReport<NodeSyncResult>>,
}

/// 后台循环开关
#[derive(Debug, Clone, Copy)]
pub struct DaemonOptions {
    pub health: bool,
    pub drift: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            health: true,
            drift: true,
        }
    }
}

/// 编排引擎
pub struct Fleet {
    config: FleetConfig,
    registry: Arc<NodeRegistry>,
    panel: Arc<dyn PanelApi>,
    oplog: Arc<OperationLog>,
    deployer: DeploymentOrchestrator,
    sync: ConfigSyncEngine,
    health: HealthMonitor,
}

impl Fleet {
    /// 使用 ssh/scp 与 HTTP 面板客户端构建
    pub async fn from_config(config: FleetConfig) -> FleetResult<Self> {
        let transport = Arc::new(SshTransport::new(&config.remote));
        let panel = PanelClient::new(config.panel.clone(), RetryPolicy::default())?
            .with_node_port(config.node.service_port);
        info!(panel = %panel.base_url(), data_dir = %config.data_dir.display(), "Fleet engine configured");
        Self::with_components(config, transport, Arc::new(panel), Arc::new(TracingNotifier)).await
    }

    /// 使用给定的传输层、面板与告警出口构建
    pub async fn with_components(
        config: FleetConfig,
        transport: Arc<dyn RemoteTransport>,
        panel: Arc<dyn PanelApi>,
        notifier: Arc<dyn Notifier>,
    ) -> FleetResult<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let registry = Arc::new(NodeRegistry::load(config.registry_path()).await?);

        let oplog = Arc::new(OperationLog::new(
            config.operation_log_path(),
            Redactor::new().with_secret(config.panel.password.clone()),
        ));
        remember_credentials(&oplog, &registry.list().await);
        let executor = Arc::new(RemoteExecutor::from_config(transport, &config.remote, oplog.clone()));
        let ledger = Arc::new(CheckpointLedger::new(config.ledger_path()));

        let deployer = DeploymentOrchestrator::new(
            executor.clone(),
            panel.clone(),
            registry.clone(),
            notifier.clone(),
            &config,
        );
        let sync = ConfigSyncEngine::new(
            executor.clone(),
            registry.clone(),
            ledger,
            notifier.clone(),
            &config,
        );
        let health = HealthMonitor::new(executor, panel.clone(), registry.clone(), notifier, &config);

        Ok(Self {
            config,
            registry,
            panel,
            oplog,
            deployer,
            sync,
            health,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// 部署新节点，成功后把它加入全舰队的 LB 配置
    pub async fn deploy(&self, node: NodeRecord, cancel: &CancellationToken) -> DeployResult {
        remember_credentials(&self.oplog, std::slice::from_ref(&node));
        let deploy = self.deployer.deploy(node, cancel).await;
        if !deploy.is_success() || cancel.is_cancelled() {
            return DeployResult { deploy, sync: None };
        }

        let sync = match self.sync.sync_all(cancel).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(node = %deploy.node, error = %e, "Post-deploy sync could not start");
                None
            }
        };
        DeployResult { deploy, sync }
    }

    pub async fn sync_all(&self, cancel: &CancellationToken) -> FleetResult<FleetReport<NodeSyncResult>> {
        self.sync.sync_all(cancel).await
    }

    pub async fn health_check_all(&self, cancel: &CancellationToken) -> FleetResult<HealthReport> {
        self.health.check_all(cancel).await
    }

    pub async fn reconnect(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> FleetResult<FleetReport<ReconnectResult>> {
        self.health.reconnect(names, cancel).await
    }

    pub async fn detect_drift(&self, cancel: &CancellationToken) -> FleetResult<DriftReport> {
        self.sync.detect_drift(cancel).await
    }

    pub async fn drift_pass(&self, cancel: &CancellationToken) -> FleetResult<DriftPass> {
        self.sync.drift_pass(cancel).await
    }

    /// 导入旧格式节点列表，新节点的 SSH 密码随即登记到脱敏器
    pub async fn import_legacy(&self, path: impl AsRef<Path>) -> FleetResult<ImportReport> {
        let report = self.registry.import_legacy(path).await?;
        let mut imported = Vec::with_capacity(report.imported.len());
        for name in &report.imported {
            if let Some(node) = self.registry.get(name).await {
                imported.push(node);
            }
        }
        remember_credentials(&self.oplog, &imported);
        Ok(report)
    }

    /// 移除节点：面板删除 → 注册表删除 → 全量同步
    ///
    /// 面板删除失败时注册表保持不变，可以重试
    pub async fn remove(&self, name: &str, cancel: &CancellationToken) -> FleetResult<RemoveReport> {
        let node = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| FleetError::NotFound(name.to_string()))?;

        if let Some(external_id) = node.external_id {
            let session = self.panel.authenticate().await?;
            self.panel.delete_node(&session, external_id).await?;
            info!(node = %name, external_id, "Node deleted from panel");
        } else {
            warn!(node = %name, "Node was never registered on the panel, removing locally only");
        }

        self.registry.remove(name).await?;

        let sync = match self.sync.sync_all(cancel).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(node = %name, error = %e, "Post-remove sync could not start");
                None
            }
        };

        Ok(RemoveReport {
            node: node.name,
            external_id: node.external_id,
            sync,
        })
    }

    /// 每个启用的检查各跑一轮
    pub async fn run_once(&self, options: DaemonOptions, cancel: &CancellationToken) -> FleetResult<()> {
        if options.health {
            let report = self.health.check_all(cancel).await?;
            info!(
                healthy = report.healthy_count(),
                unhealthy = report.unhealthy_count(),
                "Health pass complete"
            );
        }
        if options.drift {
            let pass = self.sync.drift_pass(cancel).await?;
            info!(
                drifted = pass.drift.drifted.len(),
                resynced = pass.resync.as_ref().map(|r| r.succeeded).unwrap_or(0),
                "Drift pass complete"
            );
        }
        Ok(())
    }

    /// 并行运行健康巡检与漂移检测循环，直到取消
    pub async fn run(&self, options: DaemonOptions, cancel: CancellationToken) {
        let health = async {
            if options.health {
                self.health
                    .run(self.config.health_interval, cancel.clone())
                    .await;
            }
        };
        let drift = async {
            if options.drift {
                self.sync
                    .run_drift_loop(self.config.drift_interval, cancel.clone())
                    .await;
            }
        };
        tokio::join!(health, drift);
    }
}

/// 把节点的 SSH 密码登记为操作日志中的秘密值
fn remember_credentials(oplog: &OperationLog, nodes: &[NodeRecord]) {
    for node in nodes {
        if let Some(password) = node.credential.resolve_password() {
            if oplog.add_secret(password) {
                debug!(node = %node.name, "SSH password registered for redaction");
            }
        }
    }
}
