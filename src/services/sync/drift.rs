//! 配置漂移检测
//!
//! 比较每个节点远端计算的配置哈希与规范哈希，不一致的节点重新走同步协议。
//! 每轮检测最多触发一次重同步，结果通过报告与告警输出。

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::report::FleetReport;
use crate::domain::sync::{DriftReport, NodeSyncResult};
use crate::error::FleetResult;
use crate::services::notify::{Alert, Severity};

use super::ConfigSyncEngine;

/// 一轮漂移检测 + 重同步
#[derive(Debug, Clone, Serialize)]
pub struct DriftPass {
    pub drift: DriftReport,
    /// 没有漂移时为 None
    pub resync: Option<FleetReport<NodeSyncResult>>,
}

impl ConfigSyncEngine {
    /// 计算每个节点的漂移情况（只读）
    pub async fn detect_drift(&self, cancel: &CancellationToken) -> FleetResult<DriftReport> {
        let canonical = self.canonical().await?.hash();
        let nodes = self.registry.list().await;

        let observed: Vec<Option<(String, FleetResult<_>)>> = stream::iter(nodes)
            .map(|node| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let hash = self.remote_hash(&node).await;
                Some((node.name, hash))
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = DriftReport {
            canonical: canonical.clone(),
            in_sync: Vec::new(),
            drifted: Vec::new(),
            unreachable: Vec::new(),
        };
        for (name, hash) in observed.into_iter().flatten() {
            match hash {
                Ok(Some(h)) if h == canonical => report.in_sync.push(name),
                Ok(other) => report.drifted.push((name, other)),
                Err(e) => report.unreachable.push((name, e.to_string())),
            }
        }

        info!(
            canonical = %canonical.short(),
            in_sync = report.in_sync.len(),
            drifted = report.drifted.len(),
            unreachable = report.unreachable.len(),
            "Drift detection finished"
        );
        Ok(report)
    }

    /// 只对漂移节点重新同步
    pub async fn resync_drifted(
        &self,
        drift: &DriftReport,
        cancel: &CancellationToken,
    ) -> FleetResult<FleetReport<NodeSyncResult>> {
        let drifted = drift.drifted_names();
        let nodes = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|n| drifted.contains(&n.name))
            .collect();
        self.sync_nodes(nodes, "drift_resync", cancel).await
    }

    /// 检测并修复一轮
    pub async fn drift_pass(&self, cancel: &CancellationToken) -> FleetResult<DriftPass> {
        let drift = self.detect_drift(cancel).await?;

        if !drift.unreachable.is_empty() {
            let nodes = drift.unreachable.iter().map(|(n, _)| n.clone()).collect();
            self.notifier
                .notify(Alert::new(
                    Severity::Warning,
                    "Config hash unavailable",
                    nodes,
                    "drift could not be checked on these nodes",
                ))
                .await;
        }

        if !drift.has_drift() || cancel.is_cancelled() {
            return Ok(DriftPass {
                drift,
                resync: None,
            });
        }

        warn!(nodes = ?drift.drifted_names(), "Config drift detected, resyncing");
        let resync = self.resync_drifted(&drift, cancel).await?;
        Ok(DriftPass {
            drift,
            resync: Some(resync),
        })
    }

    /// 周期性漂移检测，直到取消
    pub async fn run_drift_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Drift loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Drift loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.drift_pass(&cancel).await {
                        error!(error = %e, "Drift pass failed");
                    }
                }
            }
        }
    }
}
