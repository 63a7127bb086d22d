//! 操作日志
//!
//! 每次远程调用尝试追加一行到操作日志；写入前统一脱敏（密码、Bearer token 等）。
//! 秘密值可以在运行期追加登记（新节点带来的 SSH 密码）

use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, PoisonError, RwLock};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

const REDACTED: &str = "***";

/// 单行输出的最大长度，超出部分截断
const MAX_OUTPUT_CHARS: usize = 4000;

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)(sshpass\s+-p\s*)('[^']*'|\S+)",
            r"(?i)(SSHPASS=)('[^']*'|\S+)",
            r"(?i)(authorization:\s*(?:bearer|basic)\s+)(\S+)",
            r"(?i)(bearer\s+)([A-Za-z0-9._~+/=-]+)",
            r#"(?i)("(?:password|access_token|token)"\s*:\s*")([^"]*)"#,
            r"(?i)((?:password|passwd|access_token)=)([^&\s]+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// 脱敏器：固定模式 + 显式登记的秘密值
#[derive(Debug, Default, Clone)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个需要原样替换的秘密值（空值与过短的值忽略）
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.add_secret(secret);
        self
    }

    /// 返回是否为新登记的值
    pub fn add_secret(&mut self, secret: impl Into<String>) -> bool {
        let secret = secret.into();
        if secret.len() < 3 || self.secrets.contains(&secret) {
            return false;
        }
        self.secrets.push(secret);
        true
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            out = out.replace(secret.as_str(), REDACTED);
        }
        for re in secret_patterns() {
            out = re.replace_all(&out, format!("${{1}}{}", REDACTED)).into_owned();
        }
        out
    }
}

/// 一次尝试的记录
#[derive(Debug, Clone)]
pub struct OperationEntry<'a> {
    pub node: &'a str,
    pub description: &'a str,
    pub attempt: u32,
    pub success: bool,
    pub output: &'a str,
}

/// 追加写入的操作日志
pub struct OperationLog {
    path: Option<PathBuf>,
    redactor: RwLock<Redactor>,
    write_lock: Mutex<()>,
}

impl OperationLog {
    pub fn new(path: impl Into<PathBuf>, redactor: Redactor) -> Self {
        Self {
            path: Some(path.into()),
            redactor: RwLock::new(redactor),
            write_lock: Mutex::new(()),
        }
    }

    /// 不落盘的日志（测试或 dry-run）
    pub fn disabled() -> Self {
        Self {
            path: None,
            redactor: RwLock::new(Redactor::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 运行期登记秘密值，之后写入的日志行和错误输出都会替换掉它
    pub fn add_secret(&self, secret: impl Into<String>) -> bool {
        self.redactor
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_secret(secret)
    }

    pub fn redact(&self, text: &str) -> String {
        self.redactor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .redact(text)
    }

    /// 格式化一行（已脱敏）
    pub fn format_entry(&self, entry: &OperationEntry<'_>) -> String {
        let mut output: String = entry.output.trim().replace('\n', " | ");
        if output.chars().count() > MAX_OUTPUT_CHARS {
            output = output.chars().take(MAX_OUTPUT_CHARS).collect::<String>() + "...";
        }
        let line = format!(
            "{} node={} attempt={} status={} op=\"{}\" output=\"{}\"",
            Utc::now().to_rfc3339(),
            entry.node,
            entry.attempt,
            if entry.success { "ok" } else { "failed" },
            entry.description,
            output
        );
        self.redact(&line)
    }

    /// 追加一行；写入失败只告警，不影响远程操作本身
    pub async fn append(&self, entry: OperationEntry<'_>) {
        let Some(ref path) = self.path else {
            return;
        };
        let line = self.format_entry(&entry);

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %path.display(), error = %e, "Failed to create operation log directory");
                return;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await;
        match file {
            Ok(mut f) => {
                if let Err(e) = f.write_all(format!("{}\n", line).as_bytes()).await {
                    warn!(path = %path.display(), error = %e, "Failed to write operation log");
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open operation log");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_known_patterns() {
        let r = Redactor::new();
        assert_eq!(r.redact("sshpass -p hunter2 ssh root@x"), "sshpass -p *** ssh root@x");
        assert_eq!(
            r.redact("Authorization: Bearer eyJhbGciOi.abc"),
            "Authorization: Bearer ***"
        );
        assert_eq!(r.redact("token is Bearer abc.def"), "token is Bearer ***");
        assert_eq!(
            r.redact(r#"{"access_token": "abc123", "token_type": "bearer"}"#),
            r#"{"access_token": "***", "token_type": "bearer"}"#
        );
        assert_eq!(r.redact("username=admin&password=s3cret"), "username=admin&password=***");
        assert_eq!(r.redact("SSHPASS='x y' sshpass -e"), "SSHPASS=*** sshpass -e");
    }

    #[test]
    fn test_redacts_registered_secrets() {
        let r = Redactor::new().with_secret("PanelPass!").with_secret("");
        assert_eq!(r.redact("login with PanelPass! failed"), "login with *** failed");
    }

    #[tokio::test]
    async fn test_append_writes_redacted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops").join("operations.log");
        let log = OperationLog::new(&path, Redactor::new().with_secret("topsecret"));

        log.append(OperationEntry {
            node: "edge-1",
            description: "Install",
            attempt: 1,
            success: false,
            output: "echo topsecret\npassword=abc",
        })
        .await;
        log.append(OperationEntry {
            node: "edge-1",
            description: "Install",
            attempt: 2,
            success: true,
            output: "done",
        })
        .await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(!content.contains("topsecret"));
        assert!(!content.contains("abc"));
        assert!(lines[0].contains("attempt=1 status=failed"));
        assert!(lines[1].contains("attempt=2 status=ok"));
    }

    #[tokio::test]
    async fn test_secrets_added_at_runtime_are_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operations.log");
        let log = OperationLog::new(&path, Redactor::new());
        let entry = |output| OperationEntry {
            node: "edge-9",
            description: "Provision",
            attempt: 1,
            success: false,
            output,
        };

        log.append(entry("before: n0d3-pass")).await;
        assert!(log.add_secret("n0d3-pass"));
        assert!(!log.add_secret("n0d3-pass"));
        assert!(!log.add_secret("ab"));
        log.append(entry("after: n0d3-pass")).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].contains("n0d3-pass"));
        assert!(lines[1].contains("after: ***"));
        assert_eq!(log.redact("x n0d3-pass y"), "x *** y");
    }
}
