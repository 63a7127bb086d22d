//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::health::NodeStatus;

/// 部署状态机的阶段
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Provisioning,
    WaitingForService,
    Registering,
    CertificateIssued,
    Reconfiguring,
    HealthVerified,
    Failed,
}

impl DeploymentState {
    /// 正常推进顺序（不含 Failed）
    pub const PHASES: [DeploymentState; 6] = [
        DeploymentState::Provisioning,
        DeploymentState::WaitingForService,
        DeploymentState::Registering,
        DeploymentState::CertificateIssued,
        DeploymentState::Reconfiguring,
        DeploymentState::HealthVerified,
    ];

    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Provisioning => "provisioning",
            DeploymentState::WaitingForService => "waiting_for_service",
            DeploymentState::Registering => "registering",
            DeploymentState::CertificateIssued => "certificate_issued",
            DeploymentState::Reconfiguring => "reconfiguring",
            DeploymentState::HealthVerified => "health_verified",
            DeploymentState::Failed => "failed",
        }
    }

    /// 显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            DeploymentState::Provisioning => "Provisioning",
            DeploymentState::WaitingForService => "Waiting For Service",
            DeploymentState::Registering => "Registering",
            DeploymentState::CertificateIssued => "Certificate Issued",
            DeploymentState::Reconfiguring => "Reconfiguring",
            DeploymentState::HealthVerified => "Health Verified",
            DeploymentState::Failed => "Failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentState::HealthVerified | DeploymentState::Failed)
    }

    /// 下一阶段，终态返回 None
    pub fn next(&self) -> Option<DeploymentState> {
        let idx = Self::PHASES.iter().position(|p| p == self)?;
        Self::PHASES.get(idx + 1).copied()
    }
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Warning,
    Failed,
    Skipped,
}

/// 部署阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    pub phase: DeploymentState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl DeployStage {
    /// 创建新的待执行阶段
    pub fn new(phase: DeploymentState) -> Self {
        Self {
            phase,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    /// 开始执行阶段
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    /// 完成阶段
    pub fn finish(&mut self, status: StageStatus, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = status;
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// 部署最终结果
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// 全部阶段完成且面板确认已连接
    Deployed,
    /// 已注册并重配置，但健康确认未通过；运维可稍后重新确认
    DeployedUnverified { status: NodeStatus },
    /// 在某阶段失败
    Failed {
        phase: DeploymentState,
        kind: String,
        error: String,
    },
}

/// 单个节点的部署报告
#[derive(Clone, Debug, Serialize)]
pub struct DeployReport {
    pub run_id: String,
    pub node: String,
    /// 最终状态
    pub state: DeploymentState,
    pub outcome: DeployOutcome,
    pub external_id: Option<u64>,
    /// 注册表中是否已保留该节点
    pub registered: bool,
    /// 是否从已有注册记录续跑
    pub resumed: bool,
    pub stages: Vec<DeployStage>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, DeployOutcome::Failed { .. })
    }

    /// 失败阶段（如有）
    pub fn failed_phase(&self) -> Option<DeploymentState> {
        match self.outcome {
            DeployOutcome::Failed { phase, .. } => Some(phase),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_progression() {
        let mut state = DeploymentState::Provisioning;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            seen.push(next);
            state = next;
        }
        assert_eq!(seen, DeploymentState::PHASES.to_vec());
        assert!(state.is_terminal());
        assert_eq!(DeploymentState::Failed.next(), None);
        assert!(DeploymentState::Failed.is_terminal());
        assert!(!DeploymentState::Registering.is_terminal());
    }

    #[test]
    fn test_deploy_stage_lifecycle() {
        let mut stage = DeployStage::new(DeploymentState::Registering);
        assert_eq!(stage.status, StageStatus::Pending);

        stage.start();
        assert_eq!(stage.status, StageStatus::Running);
        assert!(stage.started_at.is_some());

        stage.finish(StageStatus::Success, Some("id=4".to_string()));
        assert_eq!(stage.status, StageStatus::Success);
        assert!(stage.duration_ms.is_some());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&DeploymentState::WaitingForService).unwrap();
        assert_eq!(json, "\"waiting_for_service\"");
        assert_eq!(DeploymentState::WaitingForService.as_str(), "waiting_for_service");
    }
}
