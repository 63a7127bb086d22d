//! 统一错误处理
//!
//! `FleetError` 覆盖编排引擎的全部失败分类，逐节点错误由上层汇总进报告，不会中断整个批量操作

use thiserror::Error;

/// 编排引擎错误类型
#[derive(Debug, Error)]
pub enum FleetError {
    /// 节点不可达（可重试）
    #[error("Node {node} unreachable: {detail}")]
    Connectivity { node: String, detail: String },

    /// 凭证无效（终态，不重试）
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 推送的配置未通过语法校验（触发回滚）
    #[error("Config validation failed on {node}: {detail}")]
    Validation { node: String, detail: String },

    /// 注册表内名称冲突
    #[error("Node {0} already exists")]
    AlreadyExists(String),

    /// 等待超时（终态，附带诊断信息）
    #[error("Timed out during {phase}: {detail}")]
    Timeout { phase: String, detail: String },

    /// 远程命令重试耗尽后仍然失败
    #[error("{description} failed on {node} after {attempts} attempt(s): {output}")]
    RemoteCommand {
        node: String,
        description: String,
        attempts: u32,
        output: String,
    },

    /// 面板返回了无法处理的响应
    #[error("Panel error: {0}")]
    Panel(String),

    /// 节点记录字段不合法（会破坏生成的 LB 配置或远程命令）
    #[error("Invalid node {node}: {detail}")]
    InvalidNode { node: String, detail: String },

    /// 注册表中不存在该节点
    #[error("Node {0} not found")]
    NotFound(String),

    /// 回滚检查点创建失败
    #[error("Checkpoint failed on {node}: {detail}")]
    Checkpoint { node: String, detail: String },

    /// 操作被取消
    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// 创建连接错误
    pub fn connectivity(node: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Connectivity {
            node: node.into(),
            detail: detail.into(),
        }
    }

    /// 创建校验错误
    pub fn validation(node: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Validation {
            node: node.into(),
            detail: detail.into(),
        }
    }

    /// 创建超时错误
    pub fn timeout(phase: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Timeout {
            phase: phase.into(),
            detail: detail.into(),
        }
    }

    /// 创建检查点错误
    pub fn checkpoint(node: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Checkpoint {
            node: node.into(),
            detail: detail.into(),
        }
    }

    /// 只有连接类错误值得重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Connectivity { .. })
    }

    /// 简短的错误类别标识，用于报告
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::Connectivity { .. } => "connectivity",
            FleetError::Auth(_) => "auth",
            FleetError::Validation { .. } => "validation",
            FleetError::AlreadyExists(_) => "already_exists",
            FleetError::Timeout { .. } => "timeout",
            FleetError::RemoteCommand { .. } => "remote_command",
            FleetError::Panel(_) => "panel",
            FleetError::InvalidNode { .. } => "invalid_node",
            FleetError::NotFound(_) => "not_found",
            FleetError::Checkpoint { .. } => "checkpoint",
            FleetError::Cancelled => "cancelled",
            FleetError::Io(_) => "io",
            FleetError::Json(_) => "json",
        }
    }
}

/// 便捷类型别名
pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_retryable() {
        assert!(FleetError::connectivity("a", "refused").is_retryable());
        assert!(!FleetError::Auth("bad".into()).is_retryable());
        assert!(!FleetError::validation("a", "syntax").is_retryable());
        assert!(!FleetError::timeout("waiting_for_service", "60s").is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = FleetError::RemoteCommand {
            node: "edge-1".into(),
            description: "Restart service".into(),
            attempts: 3,
            output: "exit 1".into(),
        };
        let text = err.to_string();
        assert!(text.contains("edge-1"));
        assert!(text.contains("3 attempt"));
        assert_eq!(err.kind(), "remote_command");
    }
}
