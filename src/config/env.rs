//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use self::constants::*;

/// 编排器配置
#[derive(Clone, Debug)]
pub struct FleetConfig {
    /// 数据目录（注册表、检查点账本、操作日志）
    pub data_dir: PathBuf,
    /// 面板配置
    pub panel: PanelConfig,
    /// 远程执行配置
    pub remote: RemoteConfig,
    /// 负载均衡配置
    pub lb: LbSettings,
    /// 节点侧路径与服务
    pub node: NodeSettings,
    /// 部署时序
    pub deploy: DeployTimings,
    /// 批量操作并发度
    pub concurrency: usize,
    /// 健康检查间隔
    pub health_interval: Duration,
    /// 健康检查后是否自动尝试重连
    pub health_auto_reconnect: bool,
    /// 漂移检测间隔
    pub drift_interval: Duration,
}

impl FleetConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let data_dir = env::var("FLEET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        let concurrency = env_parse("FLEET_CONCURRENCY", DEFAULT_CONCURRENCY);
        let concurrency = concurrency.clamp(1, MAX_CONCURRENCY);

        Self {
            data_dir,
            panel: PanelConfig::from_env(),
            remote: RemoteConfig::from_env(),
            lb: LbSettings::from_env(),
            node: NodeSettings::from_env(),
            deploy: DeployTimings::from_env(),
            concurrency,
            health_interval: Duration::from_secs(env_parse(
                "HEALTH_INTERVAL_SECS",
                HEALTH_INTERVAL_SECS,
            )),
            health_auto_reconnect: env_bool("HEALTH_AUTO_RECONNECT", false),
            drift_interval: Duration::from_secs(env_parse(
                "DRIFT_INTERVAL_SECS",
                DRIFT_INTERVAL_SECS,
            )),
        }
    }

    /// 节点注册表文件
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(REGISTRY_FILE_NAME)
    }

    /// 检查点账本文件
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE_NAME)
    }

    /// 操作日志文件
    pub fn operation_log_path(&self) -> PathBuf {
        self.data_dir.join(OPERATION_LOG_FILE_NAME)
    }

    /// 待推送文件的本地暂存目录
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            panel: PanelConfig::default(),
            remote: RemoteConfig::default(),
            lb: LbSettings::default(),
            node: NodeSettings::default(),
            deploy: DeployTimings::default(),
            concurrency: DEFAULT_CONCURRENCY,
            health_interval: Duration::from_secs(HEALTH_INTERVAL_SECS),
            health_auto_reconnect: false,
            drift_interval: Duration::from_secs(DRIFT_INTERVAL_SECS),
        }
    }
}

/// 面板 API 配置
#[derive(Clone, Debug)]
pub struct PanelConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// 单次请求超时
    pub timeout: Duration,
    /// 全局请求最小间隔
    pub min_interval: Duration,
}

impl PanelConfig {
    pub fn from_env() -> Self {
        let base_url = load_with_fallback("PANEL_URL", "PANEL_BASE_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());
        if env::var("PANEL_URL").is_err() && env::var("PANEL_BASE_URL").is_ok() {
            warn!("Deprecated environment variable PANEL_BASE_URL detected. Please use PANEL_URL");
        }

        let username = env::var("PANEL_USERNAME").unwrap_or_else(|_| "admin".to_string());
        let password = env::var("PANEL_PASSWORD").unwrap_or_default();
        if password.is_empty() {
            warn!("PANEL_PASSWORD is not set, panel authentication will fail");
        }

        let timeout_secs = env_parse("PANEL_TIMEOUT_SECS", PANEL_TIMEOUT_SECS)
            .clamp(PANEL_TIMEOUT_MIN_SECS, PANEL_TIMEOUT_MAX_SECS);

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            timeout: Duration::from_secs(timeout_secs),
            min_interval: Duration::from_millis(env_parse(
                "PANEL_MIN_INTERVAL_MS",
                PANEL_MIN_INTERVAL_MS,
            )),
        }
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            timeout: Duration::from_secs(PANEL_TIMEOUT_SECS),
            min_interval: Duration::from_millis(PANEL_MIN_INTERVAL_MS),
        }
    }
}

/// 远程执行配置
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// 两次远程调用之间的最小间隔
    pub min_interval: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RemoteConfig {
    pub fn from_env() -> Self {
        Self {
            connect_timeout: Duration::from_secs(env_parse(
                "SSH_CONNECT_TIMEOUT_SECS",
                SSH_CONNECT_TIMEOUT_SECS,
            )),
            command_timeout: Duration::from_secs(env_parse(
                "REMOTE_COMMAND_TIMEOUT_SECS",
                REMOTE_COMMAND_TIMEOUT_SECS,
            )),
            min_interval: Duration::from_millis(env_parse(
                "REMOTE_MIN_INTERVAL_MS",
                REMOTE_MIN_INTERVAL_MS,
            )),
            max_attempts: env_parse("REMOTE_MAX_ATTEMPTS", REMOTE_MAX_ATTEMPTS).max(1),
            backoff: Duration::from_secs(env_parse("REMOTE_BACKOFF_SECS", REMOTE_BACKOFF_SECS)),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(SSH_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(REMOTE_COMMAND_TIMEOUT_SECS),
            min_interval: Duration::from_millis(REMOTE_MIN_INTERVAL_MS),
            max_attempts: REMOTE_MAX_ATTEMPTS,
            backoff: Duration::from_secs(REMOTE_BACKOFF_SECS),
        }
    }
}

/// 负载均衡器（haproxy）配置
#[derive(Clone, Debug)]
pub struct LbSettings {
    /// 节点上的 LB 配置路径
    pub config_path: String,
    pub binary: String,
    pub service: String,
    /// 缺少 LB 二进制时执行的安装命令
    pub install_command: String,
    /// 渲染配置时 frontend 监听端口
    pub listen_port: u16,
    /// 可选的 global/defaults 段落文件（本地）
    pub header_path: Option<PathBuf>,
}

impl LbSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config_path: env::var("LB_CONFIG_PATH").unwrap_or(defaults.config_path),
            binary: env::var("LB_BINARY").unwrap_or(defaults.binary),
            service: env::var("LB_SERVICE").unwrap_or(defaults.service),
            install_command: env::var("LB_INSTALL_COMMAND").unwrap_or(defaults.install_command),
            listen_port: env_parse("LB_LISTEN_PORT", defaults.listen_port),
            header_path: env::var("LB_HEADER_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }
}

impl Default for LbSettings {
    fn default() -> Self {
        Self {
            config_path: "/etc/haproxy/haproxy.cfg".to_string(),
            binary: "haproxy".to_string(),
            service: "haproxy".to_string(),
            install_command: "apt-get update -qq && apt-get install -y -qq haproxy".to_string(),
            listen_port: 443,
            header_path: None,
        }
    }
}

/// 中继节点侧配置
#[derive(Clone, Debug)]
pub struct NodeSettings {
    pub install_dir: String,
    /// 中继 systemd 服务名
    pub service: String,
    /// WaitingForService 阶段等待监听的端口
    pub service_port: u16,
    /// LB backend 指向的中继端口
    pub backend_port: u16,
    /// 保存面板开关的 env 文件
    pub env_path: String,
    pub panel_flag: String,
    pub client_cert_path: String,
    /// 本地安装脚本
    pub installer_path: PathBuf,
}

impl NodeSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            install_dir: env::var("NODE_INSTALL_DIR").unwrap_or(defaults.install_dir),
            service: env::var("NODE_SERVICE").unwrap_or(defaults.service),
            service_port: env_parse("NODE_SERVICE_PORT", defaults.service_port),
            backend_port: env_parse("NODE_BACKEND_PORT", defaults.backend_port),
            env_path: env::var("NODE_ENV_PATH").unwrap_or(defaults.env_path),
            panel_flag: env::var("NODE_PANEL_FLAG").unwrap_or(defaults.panel_flag),
            client_cert_path: env::var("CLIENT_CERT_PATH").unwrap_or(defaults.client_cert_path),
            installer_path: env::var("INSTALLER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.installer_path),
        }
    }

    /// 安装脚本在节点上的位置
    pub fn remote_installer_path(&self) -> String {
        format!("{}/install.sh", self.install_dir.trim_end_matches('/'))
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            install_dir: "/opt/relay-node".to_string(),
            service: "relay-node".to_string(),
            service_port: 62050,
            backend_port: 8443,
            env_path: "/opt/relay-node/.env".to_string(),
            panel_flag: "PANEL_ENABLED".to_string(),
            client_cert_path: "/var/lib/relay-node/ssl_client_cert.pem".to_string(),
            installer_path: PathBuf::from("./installer/install.sh"),
        }
    }
}

/// 部署状态机时序
#[derive(Clone, Debug)]
pub struct DeployTimings {
    /// 端口探测间隔
    pub poll_interval: Duration,
    /// 等待服务就绪的总时长
    pub ready_timeout: Duration,
    /// 重启后到健康确认之间的等待
    pub settle_delay: Duration,
}

impl DeployTimings {
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_secs(env_parse("DEPLOY_POLL_SECS", DEPLOY_POLL_SECS)),
            ready_timeout: Duration::from_secs(env_parse(
                "DEPLOY_READY_TIMEOUT_SECS",
                DEPLOY_READY_TIMEOUT_SECS,
            )),
            settle_delay: Duration::from_secs(env_parse("DEPLOY_SETTLE_SECS", DEPLOY_SETTLE_SECS)),
        }
    }
}

impl Default for DeployTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEPLOY_POLL_SECS),
            ready_timeout: Duration::from_secs(DEPLOY_READY_TIMEOUT_SECS),
            settle_delay: Duration::from_secs(DEPLOY_SETTLE_SECS),
        }
    }
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// 常量
pub mod constants {
    pub const DEFAULT_DATA_DIR: &str = "/var/lib/relay-fleet";
    pub const REGISTRY_FILE_NAME: &str = "nodes.json";
    pub const LEDGER_FILE_NAME: &str = "checkpoints.jsonl";
    pub const OPERATION_LOG_FILE_NAME: &str = "operations.log";

    pub const PANEL_TIMEOUT_SECS: u64 = 15;
    pub const PANEL_TIMEOUT_MIN_SECS: u64 = 10;
    pub const PANEL_TIMEOUT_MAX_SECS: u64 = 20;
    pub const PANEL_MIN_INTERVAL_MS: u64 = 500;

    pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
    pub const REMOTE_COMMAND_TIMEOUT_SECS: u64 = 300;
    pub const REMOTE_MIN_INTERVAL_MS: u64 = 2000;
    pub const REMOTE_MAX_ATTEMPTS: u32 = 3;
    pub const REMOTE_BACKOFF_SECS: u64 = 5;

    pub const DEFAULT_CONCURRENCY: usize = 4;
    pub const MAX_CONCURRENCY: usize = 8;

    /// 健康检查间隔（秒）
    pub const HEALTH_INTERVAL_SECS: u64 = 1800; // 30 分钟
    /// 漂移检测间隔（秒）
    pub const DRIFT_INTERVAL_SECS: u64 = 3600;

    pub const DEPLOY_POLL_SECS: u64 = 5;
    pub const DEPLOY_READY_TIMEOUT_SECS: u64 = 60;
    pub const DEPLOY_SETTLE_SECS: u64 = 15;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_with_fallback() {
        env::set_var("FLEET_TEST_PRIMARY", "primary_value");
        env::set_var("FLEET_TEST_FALLBACK", "fallback_value");

        assert_eq!(
            load_with_fallback("FLEET_TEST_PRIMARY", "FLEET_TEST_FALLBACK"),
            Some("primary_value".to_string())
        );

        env::remove_var("FLEET_TEST_PRIMARY");
        assert_eq!(
            load_with_fallback("FLEET_TEST_PRIMARY", "FLEET_TEST_FALLBACK"),
            Some("fallback_value".to_string())
        );

        env::remove_var("FLEET_TEST_FALLBACK");
        assert_eq!(load_with_fallback("FLEET_TEST_PRIMARY", "FLEET_TEST_FALLBACK"), None);
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        env::set_var("FLEET_TEST_NUMBER", "not-a-number");
        assert_eq!(env_parse("FLEET_TEST_NUMBER", 7u64), 7);
        env::set_var("FLEET_TEST_NUMBER", " 12 ");
        assert_eq!(env_parse("FLEET_TEST_NUMBER", 7u64), 12);
        env::remove_var("FLEET_TEST_NUMBER");
    }

    #[test]
    fn test_defaults_match_deploy_timings() {
        let config = FleetConfig::default();
        assert_eq!(config.deploy.poll_interval, Duration::from_secs(5));
        assert_eq!(config.deploy.ready_timeout, Duration::from_secs(60));
        assert_eq!(config.deploy.settle_delay, Duration::from_secs(15));
        assert_eq!(config.remote.max_attempts, 3);
        assert!(config.registry_path().ends_with("nodes.json"));
        assert_eq!(
            config.node.remote_installer_path(),
            "/opt/relay-node/install.sh"
        );
    }
}
