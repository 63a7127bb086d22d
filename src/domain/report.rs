//! 批量操作的汇总报告
//!
//! 引擎只返回结构化结果，展示交给调用方

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::deploy::DeployReport;
use super::health::{NodeHealth, NodeStatus, ReconnectOutcome};
use super::sync::NodeSyncResult;

/// 可以被汇总的单节点结果
pub trait NodeOutcome {
    fn node(&self) -> &str;
    fn is_success(&self) -> bool;
}

impl NodeOutcome for NodeSyncResult {
    fn node(&self) -> &str {
        &self.node
    }

    fn is_success(&self) -> bool {
        NodeSyncResult::is_success(self)
    }
}

impl NodeOutcome for NodeHealth {
    fn node(&self) -> &str {
        &self.node
    }

    fn is_success(&self) -> bool {
        self.status == NodeStatus::Connected
    }
}

impl NodeOutcome for DeployReport {
    fn node(&self) -> &str {
        &self.node
    }

    fn is_success(&self) -> bool {
        DeployReport::is_success(self)
    }
}

/// 单节点重连结果
#[derive(Clone, Debug, Serialize)]
pub struct ReconnectResult {
    pub node: String,
    pub outcome: ReconnectOutcome,
}

impl NodeOutcome for ReconnectResult {
    fn node(&self) -> &str {
        &self.node
    }

    fn is_success(&self) -> bool {
        self.outcome == ReconnectOutcome::Reconnected
    }
}

/// 批量操作汇总
#[derive(Clone, Debug, Serialize)]
pub struct FleetReport<T> {
    pub operation: String,
    pub succeeded: usize,
    pub failed: usize,
    /// 是否在遍历完所有节点前被取消
    pub cancelled: bool,
    pub details: Vec<T>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl<T: NodeOutcome> FleetReport<T> {
    /// 从单节点结果构建汇总，计数由结果本身推导
    pub fn from_results(
        operation: impl Into<String>,
        started_at: DateTime<Utc>,
        details: Vec<T>,
        cancelled: bool,
    ) -> Self {
        let succeeded = details.iter().filter(|d| d.is_success()).count();
        let failed = details.len() - succeeded;
        Self {
            operation: operation.into(),
            succeeded,
            failed,
            cancelled,
            details,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.details.len()
    }

    pub fn is_all_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    pub fn failed_nodes(&self) -> Vec<String> {
        self.details
            .iter()
            .filter(|d| !d.is_success())
            .map(|d| d.node().to_string())
            .collect()
    }

    pub fn get(&self, node: &str) -> Option<&T> {
        self.details.iter().find(|d| d.node() == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sync::{ConfigHash, NodeSyncOutcome};

    #[test]
    fn test_counts_follow_results() {
        let details = vec![
            NodeSyncResult::new("a", NodeSyncOutcome::Synced { hash: ConfigHash::of(b"x") }),
            NodeSyncResult::new(
                "b",
                NodeSyncOutcome::SkippedNoCheckpoint { error: "disk full".into() },
            ),
        ];
        let report = FleetReport::from_results("sync_all", Utc::now(), details, false);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total(), 2);
        assert_eq!(report.failed_nodes(), vec!["b".to_string()]);
        assert!(!report.is_all_success());
        assert!(report.get("a").unwrap().is_success());
    }
}
