//! 告警出口
//!
//! 引擎只产出结构化的 `Alert`，具体投递（日志、IM 等）由 `Notifier` 实现决定

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

/// 告警级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    /// 需要人工介入
    Critical,
}

/// 一条告警，可以涉及多个节点
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    pub nodes: Vec<String>,
    pub detail: String,
}

impl Alert {
    pub fn new(severity: Severity, title: impl Into<String>, nodes: Vec<String>, detail: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            nodes,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: Alert);
}

/// 默认实现：以 tracing 事件输出
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, alert: Alert) {
        let nodes = alert.nodes.join(",");
        match alert.severity {
            Severity::Info => info!(title = %alert.title, nodes = %nodes, detail = %alert.detail, "Fleet alert"),
            Severity::Warning => warn!(title = %alert.title, nodes = %nodes, detail = %alert.detail, "Fleet alert"),
            Severity::Critical => error!(title = %alert.title, nodes = %nodes, detail = %alert.detail, "Fleet alert"),
        }
    }
}
