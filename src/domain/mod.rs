//! 领域模型模块
//!
//! 纯数据结构，不依赖 tokio/reqwest

pub mod deploy;
pub mod health;
pub mod node;
pub mod report;
pub mod sync;

// Re-exports for convenience
pub use deploy::{DeployOutcome, DeployReport, DeployStage, DeploymentState, StageStatus};
pub use health::{HealthReport, NodeHealth, NodeStatus, ReconnectOutcome};
pub use node::{NodeRecord, SshCredential};
pub use report::{FleetReport, NodeOutcome, ReconnectResult};
pub use sync::{
    BackendEntry, ConfigHash, DriftReport, LbConfig, NodeSyncOutcome, NodeSyncResult,
    RollbackCheckpoint, RollbackOutcome, SyncStep,
};
