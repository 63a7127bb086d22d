//! 节点健康巡检
//!
//! 周期性查询面板上每个已注册节点的状态，所有不健康节点汇总成一条告警。
//! 重连策略刻意保持简单：重启中继服务、等待、复查一次，不做原因诊断。

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::FleetConfig;
use crate::domain::health::{HealthReport, NodeHealth, ReconnectOutcome};
use crate::domain::node::NodeRecord;
use crate::domain::report::{FleetReport, ReconnectResult};
use crate::error::FleetResult;
use crate::infra::panel::{PanelApi, PanelSession};
use crate::infra::remote::{shell_quote, RemoteExecutor};
use crate::services::notify::{Alert, Notifier, Severity};
use crate::state::NodeRegistry;

/// 健康巡检服务
pub struct HealthMonitor {
    executor: Arc<RemoteExecutor>,
    panel: Arc<dyn PanelApi>,
    registry: Arc<NodeRegistry>,
    notifier: Arc<dyn Notifier>,
    relay_service: String,
    settle_delay: Duration,
    concurrency: usize,
    auto_reconnect: bool,
}

impl HealthMonitor {
    pub fn new(
        executor: Arc<RemoteExecutor>,
        panel: Arc<dyn PanelApi>,
        registry: Arc<NodeRegistry>,
        notifier: Arc<dyn Notifier>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            executor,
            panel,
            registry,
            notifier,
            relay_service: config.node.service.clone(),
            settle_delay: config.deploy.settle_delay,
            concurrency: config.concurrency.max(1),
            auto_reconnect: config.health_auto_reconnect,
        }
    }

    /// 巡检所有已注册节点
    ///
    /// 认证失败时直接返回错误（尚未查询任何节点）；单节点查询失败记为 unknown
    pub async fn check_all(&self, cancel: &CancellationToken) -> FleetResult<HealthReport> {
        let (registered, skipped): (Vec<NodeRecord>, Vec<NodeRecord>) = self
            .registry
            .list()
            .await
            .into_iter()
            .partition(NodeRecord::is_registered);
        let skipped: Vec<String> = skipped.into_iter().map(|n| n.name).collect();

        if registered.is_empty() {
            info!(skipped = skipped.len(), "No registered nodes to check");
            return Ok(HealthReport {
                checked_at: Utc::now(),
                nodes: Vec::new(),
                skipped,
                cancelled: false,
            });
        }

        let session = self.panel.authenticate().await?;
        let session = &session;

        let results: Vec<Option<NodeHealth>> = stream::iter(registered)
            .map(|node| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let external_id = node.external_id?;
                let reading = self.panel.get_node_status(session, external_id).await;
                Some(NodeHealth {
                    node: node.name,
                    external_id,
                    status: reading.status,
                    detail: reading.detail,
                })
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let cancelled = results.iter().any(Option::is_none);
        let report = HealthReport {
            checked_at: Utc::now(),
            nodes: results.into_iter().flatten().collect(),
            skipped,
            cancelled,
        };

        info!(
            healthy = report.healthy_count(),
            unhealthy = report.unhealthy_count(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "Health check finished"
        );

        let unhealthy = report.unhealthy();
        if !unhealthy.is_empty() {
            let detail = report
                .nodes
                .iter()
                .filter(|n| !n.status.is_connected())
                .map(|n| match &n.detail {
                    Some(d) => format!("{}={} ({})", n.node, n.status.as_str(), d),
                    None => format!("{}={}", n.node, n.status.as_str()),
                })
                .collect::<Vec<_>>()
                .join(", ");
            self.notifier
                .notify(Alert::new(
                    Severity::Warning,
                    format!("{} node(s) not connected", unhealthy.len()),
                    unhealthy,
                    detail,
                ))
                .await;
        }

        Ok(report)
    }

    /// 重启指定节点的中继服务并复查一次
    pub async fn reconnect(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> FleetResult<FleetReport<ReconnectResult>> {
        let started_at = Utc::now();
        let session = self.panel.authenticate().await?;
        let session = &session;

        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            targets.push((name.clone(), self.registry.get(name).await));
        }

        let results: Vec<Option<ReconnectResult>> = stream::iter(targets)
            .map(|(name, node)| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let outcome = match node {
                    Some(node) => self.reconnect_node(&node, session, cancel).await?,
                    None => ReconnectOutcome::RestartFailed {
                        error: format!("node {} is not in the registry", name),
                    },
                };
                Some(ReconnectResult { node: name, outcome })
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let cancelled = results.iter().any(Option::is_none);
        let report = FleetReport::from_results(
            "reconnect",
            started_at,
            results.into_iter().flatten().collect(),
            cancelled,
        );

        let reconnected: Vec<String> = report
            .details
            .iter()
            .filter(|r| r.outcome == ReconnectOutcome::Reconnected)
            .map(|r| r.node.clone())
            .collect();
        if !reconnected.is_empty() {
            self.notifier
                .notify(Alert::new(
                    Severity::Info,
                    "Nodes reconnected after restart",
                    reconnected,
                    "relay service restarted and panel reports connected",
                ))
                .await;
        }
        let still_failing = report.failed_nodes();
        if !still_failing.is_empty() {
            self.notifier
                .notify(Alert::new(
                    Severity::Warning,
                    "Nodes still failing after restart",
                    still_failing,
                    "restart did not restore panel connectivity",
                ))
                .await;
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            "Reconnect finished"
        );
        Ok(report)
    }

    /// 取消时返回 None
    async fn reconnect_node(
        &self,
        node: &NodeRecord,
        session: &PanelSession,
        cancel: &CancellationToken,
    ) -> Option<ReconnectOutcome> {
        let Some(external_id) = node.external_id else {
            return Some(ReconnectOutcome::RestartFailed {
                error: format!("node {} has no external id", node.name),
            });
        };

        let restart = format!("systemctl restart {}", shell_quote(&self.relay_service));
        if let Err(e) = self.executor.execute(node, &restart, "Restart relay service").await {
            warn!(node = %node.name, error = %e, "Relay restart failed");
            return Some(ReconnectOutcome::RestartFailed {
                error: e.to_string(),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(self.settle_delay) => {}
        }

        let reading = self.panel.get_node_status(session, external_id).await;
        if reading.status.is_connected() {
            info!(node = %node.name, "Node reconnected");
            Some(ReconnectOutcome::Reconnected)
        } else {
            warn!(node = %node.name, status = reading.status.as_str(), "Node still not connected after restart");
            Some(ReconnectOutcome::StillFailing {
                status: reading.status,
            })
        }
    }

    /// 巡检循环，直到取消
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = interval.as_secs(),
            auto_reconnect = self.auto_reconnect,
            "Health loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Health loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = match self.check_all(&cancel).await {
                        Ok(report) => report,
                        Err(e) => {
                            error!(error = %e, "Health check failed");
                            continue;
                        }
                    };
                    let unhealthy = report.unhealthy();
                    if self.auto_reconnect && !unhealthy.is_empty() && !cancel.is_cancelled() {
                        if let Err(e) = self.reconnect(&unhealthy, &cancel).await {
                            error!(error = %e, "Reconnect failed");
                        }
                    }
                }
            }
        }
    }
}
