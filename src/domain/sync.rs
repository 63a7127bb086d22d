//! 负载均衡配置同步相关领域模型
//!
//! LB 配置以有序的 backend 列表建模，确定性地渲染为 haproxy 文本，
//! 避免对共享配置文件做按行定位的增删。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::node::NodeRecord;

const DEFAULT_HEADER: &str = "\
global
    log /dev/log local0
    maxconn 4096
    daemon

defaults
    log global
    mode tcp
    option dontlognull
    timeout connect 5s
    timeout client 1m
    timeout server 1m
";

/// 单个 backend 条目
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEntry {
    pub name: String,
    /// SNI 匹配域名
    pub domain: String,
    pub address: String,
    pub port: u16,
}

impl BackendEntry {
    pub fn from_node(node: &NodeRecord, port: u16) -> Self {
        Self {
            name: node.name.clone(),
            domain: node.lb_domain.clone(),
            address: node.address.clone(),
            port,
        }
    }

    /// haproxy 中使用的 backend 标识
    ///
    /// 清洗后的名称可能重合（`edge.1` 与 `edge_1`），追加原始名称哈希的前 8 位
    fn section_name(&self) -> String {
        let sanitized: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let digest = ConfigHash::of(self.name.as_bytes());
        format!("be_{}_{}", sanitized, &digest.as_str()[..8])
    }

    /// server 行使用的名称，只保留 haproxy 标识符允许的字符
    fn server_name(&self) -> String {
        self.name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// 规范 LB 配置
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LbConfig {
    header: String,
    listen_port: u16,
    backends: Vec<BackendEntry>,
}

impl LbConfig {
    /// 创建空配置，header 为 None 时使用内置的 global/defaults 段
    pub fn new(header: Option<String>, listen_port: u16) -> Self {
        Self {
            header: header.unwrap_or_else(|| DEFAULT_HEADER.to_string()),
            listen_port,
            backends: Vec::new(),
        }
    }

    /// 由注册表节点生成，未配置域名的节点不参与 SNI 路由
    pub fn from_nodes(
        header: Option<String>,
        listen_port: u16,
        nodes: &[NodeRecord],
        backend_port: u16,
    ) -> Self {
        let mut config = Self::new(header, listen_port);
        for node in nodes.iter().filter(|n| !n.lb_domain.trim().is_empty()) {
            config.upsert(BackendEntry::from_node(node, backend_port));
        }
        config
    }

    /// 插入或替换同名 backend，保持原有位置
    pub fn upsert(&mut self, entry: BackendEntry) {
        match self.backends.iter_mut().find(|b| b.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.backends.push(entry),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.backends.len();
        self.backends.retain(|b| b.name != name);
        self.backends.len() < before
    }

    pub fn backends(&self) -> &[BackendEntry] {
        &self.backends
    }

    /// 渲染为 haproxy 配置文本
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(self.header.trim_end());
        out.push_str("\n\n");

        out.push_str("frontend relay_sni\n");
        out.push_str(&format!("    bind *:{}\n", self.listen_port));
        out.push_str("    mode tcp\n");
        out.push_str("    tcp-request inspect-delay 5s\n");
        out.push_str("    tcp-request content accept if { req_ssl_hello_type 1 }\n");
        for b in &self.backends {
            out.push_str(&format!(
                "    use_backend {} if {{ req_ssl_sni -i {} }}\n",
                b.section_name(),
                b.domain
            ));
        }

        for b in &self.backends {
            out.push('\n');
            out.push_str(&format!("backend {}\n", b.section_name()));
            out.push_str("    mode tcp\n");
            out.push_str(&format!(
                "    server {} {}:{} check\n",
                b.server_name(),
                b.address,
                b.port
            ));
        }

        out
    }

    pub fn hash(&self) -> ConfigHash {
        ConfigHash::of(self.render().as_bytes())
    }
}

/// 配置内容哈希（sha256 小写十六进制）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigHash(String);

impl ConfigHash {
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// 解析 `sha256sum` 的输出（取第一个字段）
    pub fn parse_sha256sum(output: &str) -> Option<Self> {
        let token = output.split_whitespace().next()?.to_lowercase();
        if token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(token))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 回滚检查点：变更前保存的节点配置副本
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackCheckpoint {
    pub node: String,
    pub timestamp: DateTime<Utc>,
    /// 节点上的快照路径
    pub snapshot_path: String,
}

impl RollbackCheckpoint {
    pub fn new(node: &str, config_path: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            node: node.to_string(),
            timestamp,
            snapshot_path: format!("{}.bak.{}", config_path, timestamp.format("%Y%m%d%H%M%S%3f")),
        }
    }
}

/// 同步协议中的步骤
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    Checkpoint,
    InstallLb,
    Push,
    Validate,
    Restart,
}

impl SyncStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStep::Checkpoint => "checkpoint",
            SyncStep::InstallLb => "install_lb",
            SyncStep::Push => "push",
            SyncStep::Validate => "validate",
            SyncStep::Restart => "restart",
        }
    }
}

/// 回滚结果
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "rollback", rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// 失败发生在修改配置之前，无需回滚
    NotNeeded,
    RecoveredAutomatically,
    /// 自动回滚失败，需要人工介入
    RequiresManualIntervention { error: String },
}

/// 单节点同步结果
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NodeSyncOutcome {
    Synced { hash: ConfigHash },
    /// 检查点创建失败，节点未被触碰
    SkippedNoCheckpoint { error: String },
    Failed {
        step: SyncStep,
        error: String,
        rollback: RollbackOutcome,
    },
    Cancelled,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeSyncResult {
    pub node: String,
    pub outcome: NodeSyncOutcome,
    pub finished_at: DateTime<Utc>,
}

impl NodeSyncResult {
    pub fn new(node: &str, outcome: NodeSyncOutcome) -> Self {
        Self {
            node: node.to_string(),
            outcome,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, NodeSyncOutcome::Synced { .. })
    }

    /// 需要人工介入的回滚失败
    pub fn needs_manual_intervention(&self) -> bool {
        matches!(
            self.outcome,
            NodeSyncOutcome::Failed {
                rollback: RollbackOutcome::RequiresManualIntervention { .. },
                ..
            }
        )
    }
}

/// 漂移检测结果
#[derive(Clone, Debug, Serialize)]
pub struct DriftReport {
    pub canonical: ConfigHash,
    pub in_sync: Vec<String>,
    /// 漂移节点及其远端哈希（配置缺失时为 None）
    pub drifted: Vec<(String, Option<ConfigHash>)>,
    /// 无法获取哈希的节点
    pub unreachable: Vec<(String, String)>,
}

impl DriftReport {
    pub fn drifted_names(&self) -> Vec<String> {
        self.drifted.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, domain: &str) -> NodeRecord {
        NodeRecord::new(name, format!("10.0.0.{}", name.len()), domain)
    }

    #[test]
    fn test_render_is_deterministic_and_ordered() {
        let nodes = vec![node("alpha", "a.example.com"), node("beta", "b.example.com")];
        let a = LbConfig::from_nodes(None, 443, &nodes, 8443);
        let b = LbConfig::from_nodes(None, 443, &nodes, 8443);
        assert_eq!(a.render(), b.render());
        assert_eq!(a.hash(), b.hash());

        let text = a.render();
        let alpha = text.find("backend be_alpha_").unwrap();
        let beta = text.find("backend be_beta_").unwrap();
        assert!(alpha < beta);
        let section = BackendEntry::from_node(&nodes[0], 8443).section_name();
        assert!(text.contains(&format!("use_backend {} if {{ req_ssl_sni -i a.example.com }}", section)));
        assert!(text.contains("bind *:443"));
    }

    #[test]
    fn test_nodes_without_domain_are_skipped() {
        let nodes = vec![node("alpha", ""), node("beta", "b.example.com")];
        let config = LbConfig::from_nodes(None, 443, &nodes, 8443);
        assert_eq!(config.backends().len(), 1);
        assert_eq!(config.backends()[0].name, "beta");
    }

    #[test]
    fn test_upsert_keeps_position_and_remove() {
        let mut config = LbConfig::new(Some("global\n".into()), 443);
        config.upsert(BackendEntry::from_node(&node("a", "a.x"), 1));
        config.upsert(BackendEntry::from_node(&node("b", "b.x"), 1));
        config.upsert(BackendEntry::from_node(&node("a", "a2.x"), 1));
        assert_eq!(config.backends()[0].domain, "a2.x");
        assert!(config.remove("a"));
        assert!(!config.remove("a"));
        assert_eq!(config.backends().len(), 1);
    }

    #[test]
    fn test_section_name_sanitized() {
        let entry = BackendEntry::from_node(&node("edge 1.eu", "e.x"), 1);
        let section = entry.section_name();
        assert!(section.starts_with("be_edge_1_eu_"));
        assert_eq!(section.len(), "be_edge_1_eu_".len() + 8);
        assert_eq!(section, entry.section_name());
        assert_eq!(entry.server_name(), "edge_1.eu");
    }

    #[test]
    fn test_similar_names_get_distinct_backends() {
        let nodes = vec![
            node("edge.1", "one.example.com"),
            node("edge_1", "two.example.com"),
            node("edge 2", "three.example.com"),
            node("edge_2", "four.example.com"),
        ];
        let config = LbConfig::from_nodes(None, 443, &nodes, 8443);
        let text = config.render();

        let sections: std::collections::HashSet<String> =
            config.backends().iter().map(|b| b.section_name()).collect();
        assert_eq!(sections.len(), 4);
        for section in &sections {
            assert_eq!(text.matches(&format!("backend {}\n", section)).count(), 1);
        }
        for b in config.backends() {
            assert!(text.contains(&format!(
                "use_backend {} if {{ req_ssl_sni -i {} }}",
                b.section_name(),
                b.domain
            )));
        }
    }

    #[test]
    fn test_hash_parse_sha256sum() {
        let hash = ConfigHash::of(b"hello");
        let output = format!("{}  /etc/haproxy/haproxy.cfg\n", hash);
        assert_eq!(ConfigHash::parse_sha256sum(&output), Some(hash));
        assert_eq!(ConfigHash::parse_sha256sum("sha256sum: no such file"), None);
        assert_eq!(ConfigHash::parse_sha256sum(""), None);
    }

    #[test]
    fn test_checkpoint_path_is_timestamped_sibling() {
        let ts = DateTime::parse_from_rfc3339("2026-03-01T12:30:45.123Z")
            .unwrap()
            .with_timezone(&Utc);
        let cp = RollbackCheckpoint::new("a", "/etc/haproxy/haproxy.cfg", ts);
        assert_eq!(cp.snapshot_path, "/etc/haproxy/haproxy.cfg.bak.20260301123045123");
    }
}
