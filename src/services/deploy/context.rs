//! 部署上下文
//!
//! 单次部署的执行上下文：阶段记录、已取得的面板会话与外部 ID、取消令牌

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::deploy::{DeployOutcome, DeployReport, DeployStage, DeploymentState, StageStatus};
use crate::domain::node::NodeRecord;
use crate::error::FleetError;
use crate::infra::panel::PanelSession;

/// 部署执行上下文
pub struct DeployContext {
    pub run_id: String,
    pub node: NodeRecord,
    pub cancel_token: CancellationToken,
    pub session: Option<PanelSession>,
    /// 是否已写入注册表
    pub registered: bool,
    /// 是否从已有注册记录续跑
    pub resumed: bool,
    state: DeploymentState,
    stages: Vec<DeployStage>,
    started_at: DateTime<Utc>,
}

impl DeployContext {
    pub fn new(node: NodeRecord, cancel_token: CancellationToken) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            node,
            cancel_token,
            session: None,
            registered: false,
            resumed: false,
            state: DeploymentState::Provisioning,
            stages: DeploymentState::PHASES
                .iter()
                .map(|p| DeployStage::new(*p))
                .collect(),
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    fn stage_mut(&mut self, phase: DeploymentState) -> Option<&mut DeployStage> {
        self.stages.iter_mut().find(|s| s.phase == phase)
    }

    /// 进入阶段
    pub fn begin(&mut self, phase: DeploymentState) {
        self.state = phase;
        if let Some(stage) = self.stage_mut(phase) {
            stage.start();
        }
        info!(
            run_id = %self.run_id,
            node = %self.node.name,
            phase = phase.as_str(),
            "[{}] {}",
            phase.display_name(),
            self.node
        );
    }

    /// 当前阶段成功
    pub fn complete(&mut self, message: Option<String>) {
        let phase = self.state;
        if let Some(stage) = self.stage_mut(phase) {
            stage.finish(StageStatus::Success, message);
        }
    }

    /// 当前阶段以警告结束
    pub fn complete_with_warning(&mut self, message: String) {
        let phase = self.state;
        warn!(run_id = %self.run_id, node = %self.node.name, phase = phase.as_str(), "{}", message);
        if let Some(stage) = self.stage_mut(phase) {
            stage.finish(StageStatus::Warning, Some(message));
        }
    }

    /// 跳过阶段（续跑时）
    pub fn skip(&mut self, phase: DeploymentState, reason: &str) {
        if let Some(stage) = self.stage_mut(phase) {
            stage.skip(Some(reason.to_string()));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 当前阶段失败，生成终态报告
    pub fn fail(mut self, error: FleetError) -> DeployReport {
        let phase = self.state;
        error!(
            run_id = %self.run_id,
            node = %self.node.name,
            phase = phase.as_str(),
            registered = self.registered,
            error = %error,
            "Deployment failed"
        );
        if let Some(stage) = self.stage_mut(phase) {
            stage.finish(StageStatus::Failed, Some(error.to_string()));
        }
        let outcome = DeployOutcome::Failed {
            phase,
            kind: error.kind().to_string(),
            error: error.to_string(),
        };
        self.state = DeploymentState::Failed;
        self.into_report(outcome)
    }

    /// 生成报告
    pub fn into_report(self, outcome: DeployOutcome) -> DeployReport {
        DeployReport {
            run_id: self.run_id,
            node: self.node.name.clone(),
            state: self.state,
            outcome,
            external_id: self.node.external_id,
            registered: self.registered,
            resumed: self.resumed,
            stages: self.stages,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
