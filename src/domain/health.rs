//! 健康状态领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 面板报告的节点连接状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Connected,
    Disconnected,
    Unknown,
}

impl NodeStatus {
    /// 从面板的 status 字段解析，无法识别的值一律视为 Unknown
    pub fn from_panel(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "connected" => NodeStatus::Connected,
            "disconnected" | "error" | "connecting" | "disabled" => NodeStatus::Disconnected,
            _ => NodeStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Connected => "connected",
            NodeStatus::Disconnected => "disconnected",
            NodeStatus::Unknown => "unknown",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, NodeStatus::Connected)
    }
}

/// 单节点健康结果
#[derive(Clone, Debug, Serialize)]
pub struct NodeHealth {
    pub node: String,
    pub external_id: u64,
    pub status: NodeStatus,
    /// 查询失败时的说明
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// 一次健康巡检的汇总
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub nodes: Vec<NodeHealth>,
    /// 没有 external_id 因而跳过的节点
    pub skipped: Vec<String>,
    /// 是否在查询完所有节点前被取消
    pub cancelled: bool,
}

impl HealthReport {
    /// 所有非 connected 的节点名（保持注册表顺序）
    pub fn unhealthy(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| !n.status.is_connected())
            .map(|n| n.node.clone())
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.status.is_connected()).count()
    }

    pub fn unhealthy_count(&self) -> usize {
        self.nodes.len() - self.healthy_count()
    }

    pub fn is_all_healthy(&self) -> bool {
        self.nodes.iter().all(|n| n.status.is_connected())
    }
}

/// 重连尝试结果
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconnectOutcome {
    Reconnected,
    StillFailing { status: NodeStatus },
    /// 重启命令本身失败
    RestartFailed { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_panel() {
        assert_eq!(NodeStatus::from_panel("connected"), NodeStatus::Connected);
        assert_eq!(NodeStatus::from_panel("CONNECTED"), NodeStatus::Connected);
        assert_eq!(NodeStatus::from_panel("error"), NodeStatus::Disconnected);
        assert_eq!(NodeStatus::from_panel("connecting"), NodeStatus::Disconnected);
        assert_eq!(NodeStatus::from_panel("weird"), NodeStatus::Unknown);
        assert_eq!(NodeStatus::from_panel(""), NodeStatus::Unknown);
    }

    #[test]
    fn test_report_collects_unhealthy_in_order() {
        let mk = |node: &str, status| NodeHealth {
            node: node.to_string(),
            external_id: 1,
            status,
            detail: None,
        };
        let report = HealthReport {
            checked_at: Utc::now(),
            nodes: vec![
                mk("a", NodeStatus::Connected),
                mk("b", NodeStatus::Unknown),
                mk("c", NodeStatus::Disconnected),
            ],
            skipped: vec![],
            cancelled: false,
        };
        assert_eq!(report.unhealthy(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(report.healthy_count(), 1);
        assert_eq!(report.unhealthy_count(), 2);
        assert!(!report.is_all_healthy());
    }
}
