//! 服务层测试共用的替身
//!
//! `FakeTransport` 为每个节点维护内存文件系统，并解释引擎发出的命令形态；
//! `FakePanel` 是按脚本应答的 `PanelApi`。

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::config::FleetConfig;
use crate::domain::health::NodeStatus;
use crate::domain::node::NodeRecord;
use crate::domain::sync::ConfigHash;
use crate::error::{FleetError, FleetResult};
use crate::infra::command::CommandOutput;
use crate::infra::panel::{CreateNode, PanelApi, PanelSession, StatusReading};
use crate::infra::remote::RemoteTransport;
use crate::services::notify::{Alert, Notifier};

/// `test_config` 使用的安装命令，替身看到它就把 LB 标记为已安装
pub const FAKE_LB_INSTALL: &str = "install-lb";

fn quoted_args(command: &str) -> Vec<String> {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    QUOTED
        .get_or_init(|| Regex::new(r"'([^']*)'").expect("valid regex"))
        .captures_iter(command)
        .map(|c| c[1].to_string())
        .collect()
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn exit(code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

#[derive(Default)]
struct FakeState {
    files: HashMap<String, BTreeMap<String, String>>,
    unreachable: HashSet<String>,
    connect_failures: HashMap<String, u32>,
    failing: Vec<(String, String)>,
    stalls: Vec<(String, String, Duration)>,
    outputs: Vec<(String, String, String)>,
    listening: HashSet<String>,
    listen_on_install: HashSet<String>,
    lb_installed: HashSet<String>,
    history: Vec<(String, String)>,
}

impl FakeState {
    fn node_files(&mut self, node: &str) -> &mut BTreeMap<String, String> {
        self.files.entry(node.to_string()).or_default()
    }

    fn failure_for(&self, node: &str, command: &str) -> Option<String> {
        self.failing
            .iter()
            .find(|(n, pattern)| n == node && command.contains(pattern.as_str()))
            .map(|(_, pattern)| {
                self.outputs
                    .iter()
                    .find(|(n, p, _)| n == node && p == pattern)
                    .map(|(_, _, out)| out.clone())
                    .unwrap_or_else(|| "simulated failure".to_string())
            })
    }

    fn stall_for(&self, node: &str, command: &str) -> Option<Duration> {
        self.stalls
            .iter()
            .find(|(n, pattern, _)| n == node && command.contains(pattern.as_str()))
            .map(|(_, _, d)| *d)
    }

    fn connect(&mut self, node: &str) -> FleetResult<()> {
        if self.unreachable.contains(node) {
            return Err(FleetError::connectivity(node, "Connection refused"));
        }
        if let Some(remaining) = self.connect_failures.get_mut(node) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FleetError::connectivity(node, "Connection timed out"));
            }
        }
        Ok(())
    }

    fn interpret(&mut self, node: &str, command: &str) -> CommandOutput {
        let args = quoted_args(command);

        let copy_args = command
            .split("cp -p")
            .nth(1)
            .map(|rest| quoted_args(rest.split("&&").next().unwrap_or_default()))
            .unwrap_or_default();
        if copy_args.len() >= 2 {
            let src = copy_args[0].clone();
            let dst = copy_args[1].clone();
            let files = self.node_files(node);
            if command.contains("touch") && !files.contains_key(&src) {
                files.insert(src.clone(), String::new());
            }
            return match files.get(&src).cloned() {
                Some(content) => {
                    files.insert(dst, content);
                    ok("")
                }
                None => exit(1, format!("cp: cannot stat '{}': No such file or directory", src)),
            };
        }
        if command.starts_with("sha256sum") {
            let path = args.first().cloned().unwrap_or_default();
            return match self.node_files(node).get(&path) {
                Some(content) => ok(format!("{}  {}\n", ConfigHash::of(content.as_bytes()), path)),
                None => exit(1, format!("sha256sum: {}: No such file or directory", path)),
            };
        }
        if command.starts_with("cat ") {
            let path = args.first().cloned().unwrap_or_default();
            return match self.node_files(node).get(&path) {
                Some(content) => ok(content.clone()),
                None => exit(1, "No such file or directory"),
            };
        }
        if command.starts_with("command -v") {
            return if self.lb_installed.contains(node) {
                ok("/usr/sbin/haproxy")
            } else {
                exit(1, "")
            };
        }
        if command.contains(FAKE_LB_INSTALL) {
            self.lb_installed.insert(node.to_string());
            return ok("installed");
        }
        if command.contains(" -c -f ") {
            let path = args.first().cloned().unwrap_or_default();
            return match self.node_files(node).get(&path) {
                Some(content) if content.contains("INVALID") => {
                    exit(1, "[ALERT] parsing [haproxy.cfg:1]: unknown keyword 'INVALID'")
                }
                Some(_) => ok("Configuration file is valid"),
                None => exit(1, "Cannot open configuration file"),
            };
        }
        if command.contains("ss -ltn") {
            return if self.listening.contains(node) {
                ok("LISTEN")
            } else {
                exit(1, "")
            };
        }
        if command.starts_with("bash ") {
            let path = args.first().cloned().unwrap_or_default();
            if !self.node_files(node).contains_key(&path) {
                return exit(127, format!("bash: {}: No such file or directory", path));
            }
            if self.listen_on_install.contains(node) {
                self.listening.insert(node.to_string());
            }
            return ok("install complete");
        }
        if command.starts_with("rm -f") {
            let files = self.node_files(node);
            for path in &args {
                files.remove(path);
            }
            return ok("");
        }
        if command.contains("sed -i") {
            if let (Some(path), Some(flag)) = (args.last(), command.split("'^").nth(1)) {
                let flag = flag.split('=').next().unwrap_or_default().to_string();
                let path = path.clone();
                let files = self.node_files(node);
                let current = files.get(&path).cloned().unwrap_or_default();
                let mut lines: Vec<String> = current
                    .lines()
                    .filter(|l| !l.starts_with(&format!("{}=", flag)))
                    .map(str::to_string)
                    .collect();
                lines.push(format!("{}=true", flag));
                files.insert(path, lines.join("\n") + "\n");
            }
            return ok("");
        }
        ok("")
    }
}

/// ssh/scp 通道的内存替身
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_file(&self, node: &str, path: &str, content: &str) {
        self.with_state(|s| {
            s.node_files(node).insert(path.to_string(), content.to_string());
        });
    }

    pub fn file(&self, node: &str, path: &str) -> Option<String> {
        self.with_state(|s| s.files.get(node).and_then(|f| f.get(path).cloned()))
    }

    pub fn files(&self, node: &str) -> Vec<String> {
        self.with_state(|s| {
            s.files
                .get(node)
                .map(|f| f.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn set_unreachable(&self, node: &str, unreachable: bool) {
        self.with_state(|s| {
            if unreachable {
                s.unreachable.insert(node.to_string());
            } else {
                s.unreachable.remove(node);
            }
        });
    }

    /// 接下来 `times` 次连接 `node` 都失败
    pub fn fail_connect_times(&self, node: &str, times: u32) {
        self.with_state(|s| {
            s.connect_failures.insert(node.to_string(), times);
        });
    }

    /// 包含 `pattern` 的命令（上传记为 `push <path>`）以非零退出
    pub fn fail_command(&self, node: &str, pattern: &str) {
        self.with_state(|s| s.failing.push((node.to_string(), pattern.to_string())));
    }

    /// 撤销该节点上所有 `fail_command`
    pub fn clear_failures(&self, node: &str) {
        self.with_state(|s| s.failing.retain(|(n, _)| n != node));
    }

    pub fn set_output(&self, node: &str, pattern: &str, output: &str) {
        self.with_state(|s| {
            s.outputs
                .push((node.to_string(), pattern.to_string(), output.to_string()))
        });
    }

    pub fn set_listening(&self, node: &str, listening: bool) {
        self.with_state(|s| {
            if listening {
                s.listening.insert(node.to_string());
            } else {
                s.listening.remove(node);
            }
        });
    }

    /// 在 `node` 上运行安装脚本后服务开始监听
    pub fn listen_after_install(&self, node: &str) {
        self.with_state(|s| {
            s.listen_on_install.insert(node.to_string());
        });
    }

    /// 包含 `pattern` 的命令先挂起 `duration` 再执行，模拟卡住的 ssh 会话
    pub fn stall_command(&self, node: &str, pattern: &str, duration: Duration) {
        self.with_state(|s| {
            s.stalls
                .push((node.to_string(), pattern.to_string(), duration))
        });
    }

    pub fn set_lb_installed(&self, node: &str) {
        self.with_state(|s| {
            s.lb_installed.insert(node.to_string());
        });
    }

    pub fn commands_for(&self, node: &str) -> Vec<String> {
        self.with_state(|s| {
            s.history
                .iter()
                .filter(|(n, _)| n == node)
                .map(|(_, c)| c.clone())
                .collect()
        })
    }

    pub fn count_matching(&self, node: &str, pattern: &str) -> usize {
        self.commands_for(node)
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn run(&self, node: &NodeRecord, command: &str) -> FleetResult<CommandOutput> {
        if let Some(stall) = self.with_state(|s| s.stall_for(&node.name, command)) {
            tokio::time::sleep(stall).await;
        }
        self.with_state(|s| {
            s.connect(&node.name)?;
            s.history.push((node.name.clone(), command.to_string()));
            if let Some(out) = s.failure_for(&node.name, command) {
                return Ok(exit(1, out));
            }
            Ok(s.interpret(&node.name, command))
        })
    }

    async fn push(&self, node: &NodeRecord, local: &Path, remote: &str) -> FleetResult<CommandOutput> {
        let content = std::fs::read_to_string(local)?;
        let marker = format!("push {}", remote);
        self.with_state(|s| {
            s.connect(&node.name)?;
            s.history.push((node.name.clone(), marker.clone()));
            if let Some(out) = s.failure_for(&node.name, &marker) {
                return Ok(exit(1, out));
            }
            s.node_files(&node.name).insert(remote.to_string(), content);
            Ok(ok(""))
        })
    }

    async fn pull(&self, node: &NodeRecord, remote: &str, local: &Path) -> FleetResult<CommandOutput> {
        let content = self.with_state(|s| {
            s.connect(&node.name)?;
            s.history.push((node.name.clone(), format!("pull {}", remote)));
            Ok::<_, FleetError>(s.node_files(&node.name).get(remote).cloned())
        })?;
        match content {
            Some(content) => {
                std::fs::write(local, content)?;
                Ok(ok(""))
            }
            None => Ok(exit(1, "No such file or directory")),
        }
    }
}

#[derive(Default)]
struct FakePanelState {
    reject_auth: bool,
    logins: u32,
    nodes: Vec<(u64, String)>,
    next_id: u64,
    statuses: HashMap<u64, StatusReading>,
    certificates: HashMap<u64, String>,
    fail_delete: bool,
    lookups: u32,
    deleted: Vec<u64>,
}

/// 脚本化面板，未设置状态的 ID 一律报告 `connected`
pub struct FakePanel {
    state: Mutex<FakePanelState>,
}

impl Default for FakePanel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePanel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakePanelState {
                next_id: 100,
                ..Default::default()
            }),
        }
    }

    pub fn reject_auth(&self) {
        self.state.lock().unwrap().reject_auth = true;
    }

    pub fn existing_node(&self, name: &str, id: u64) {
        self.state.lock().unwrap().nodes.push((id, name.to_string()));
    }

    pub fn set_status(&self, id: u64, status: NodeStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(id, StatusReading::of(status));
    }

    /// 查询 `id` 的状态时表现为请求超时
    pub fn set_status_timeout(&self, id: u64) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(id, StatusReading::unknown("operation timed out"));
    }

    pub fn set_certificate(&self, id: u64, cert: &str) {
        self.state
            .lock()
            .unwrap()
            .certificates
            .insert(id, cert.to_string());
    }

    pub fn fail_delete(&self, fail: bool) {
        self.state.lock().unwrap().fail_delete = fail;
    }

    pub fn logins(&self) -> u32 {
        self.state.lock().unwrap().logins
    }

    pub fn lookups(&self) -> u32 {
        self.state.lock().unwrap().lookups
    }

    pub fn deleted(&self) -> Vec<u64> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn id_of(&self, name: &str) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| *id)
    }
}

#[async_trait]
impl PanelApi for FakePanel {
    async fn authenticate(&self) -> FleetResult<PanelSession> {
        let mut s = self.state.lock().unwrap();
        if s.reject_auth {
            return Err(FleetError::Auth("panel rejected credentials for user admin".into()));
        }
        s.logins += 1;
        Ok(PanelSession::new(format!("fake-{}", s.logins)))
    }

    async fn create_node(&self, _session: &PanelSession, name: &str, _address: &str) -> FleetResult<CreateNode> {
        let mut s = self.state.lock().unwrap();
        if s.nodes.iter().any(|(_, n)| n == name) {
            return Ok(CreateNode::Conflict);
        }
        let id = s.next_id;
        s.next_id += 1;
        s.nodes.push((id, name.to_string()));
        Ok(CreateNode::Created(id))
    }

    async fn find_node_id(&self, _session: &PanelSession, name: &str) -> FleetResult<Option<u64>> {
        let mut s = self.state.lock().unwrap();
        s.lookups += 1;
        Ok(s.nodes.iter().find(|(_, n)| n == name).map(|(id, _)| *id))
    }

    async fn fetch_client_certificate(&self, _session: &PanelSession, external_id: u64) -> FleetResult<String> {
        let s = self.state.lock().unwrap();
        Ok(s.certificates.get(&external_id).cloned().unwrap_or_else(|| {
            format!(
                "-----BEGIN CERTIFICATE-----\nfake-{}\n-----END CERTIFICATE-----\n",
                external_id
            )
        }))
    }

    async fn get_node_status(&self, _session: &PanelSession, external_id: u64) -> StatusReading {
        let s = self.state.lock().unwrap();
        s.statuses
            .get(&external_id)
            .cloned()
            .unwrap_or_else(|| StatusReading::of(NodeStatus::Connected))
    }

    async fn delete_node(&self, _session: &PanelSession, external_id: u64) -> FleetResult<()> {
        let mut s = self.state.lock().unwrap();
        if s.fail_delete {
            return Err(FleetError::Panel("delete node returned 500".into()));
        }
        s.nodes.retain(|(id, _)| *id != external_id);
        s.deleted.push(external_id);
        Ok(())
    }
}

/// 收集告警而不发送
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

/// 以 `dir` 为数据目录的配置：不限速，安装脚本已写到磁盘
pub fn test_config(dir: &Path) -> FleetConfig {
    let mut config = FleetConfig {
        data_dir: dir.to_path_buf(),
        ..FleetConfig::default()
    };
    config.remote.min_interval = Duration::ZERO;
    config.panel.min_interval = Duration::ZERO;
    config.lb.install_command = FAKE_LB_INSTALL.to_string();

    let installer: PathBuf = dir.join("install.sh");
    std::fs::write(&installer, "#!/bin/bash\necho installing relay node\n").unwrap();
    config.node.installer_path = installer;
    config
}

pub fn node(name: &str) -> NodeRecord {
    NodeRecord::new(name, format!("10.0.0.{}", name.len()), format!("{}.example.com", name))
}
