//! Relay Fleet - 中继节点舰队编排
//!
//! 从一台控制机管理整个中继节点舰队：新节点端到端部署、LB 配置同步与回滚、
//! 配置漂移检测，以及节点健康巡检

pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;
pub mod state;

#[cfg(test)]
mod testing;

pub use config::FleetConfig;
pub use error::{FleetError, FleetResult};
pub use services::{DaemonOptions, Fleet};
