//! 基础设施模块
//!
//! 封装外部依赖（本机进程、ssh/scp、面板 HTTP client、操作日志）

pub mod command;
pub mod oplog;
pub mod panel;
pub mod remote;
pub mod retry;

pub use command::CommandRunner;
pub use oplog::{OperationLog, Redactor};
pub use panel::{PanelApi, PanelClient, PanelSession, Registration, StatusReading};
pub use remote::{shell_quote, RemoteCommandResult, RemoteExecutor, RemoteTransport, SshTransport};
pub use retry::{Backoff, RateLimiter, RetryPolicy};
