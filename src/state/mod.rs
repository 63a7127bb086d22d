//! 持久化状态模块
//!
//! 节点注册表与回滚检查点账本是仅有的两份共享持久化状态

pub mod checkpoint_ledger;
pub mod registry;

pub use checkpoint_ledger::CheckpointLedger;
pub use registry::{ImportReport, NodeRegistry};
