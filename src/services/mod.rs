//! 服务层模块
//!
//! 部署编排、配置同步、健康巡检，以及把它们组装起来的 `Fleet`

pub mod deploy;
pub mod fleet;
pub mod health;
pub mod notify;
pub mod sync;

pub use deploy::DeploymentOrchestrator;
pub use fleet::{DaemonOptions, DeployResult, Fleet, RemoveReport};
pub use health::HealthMonitor;
pub use notify::{Alert, Notifier, Severity, TracingNotifier};
pub use sync::ConfigSyncEngine;
