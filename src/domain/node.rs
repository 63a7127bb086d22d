//! 节点相关领域模型

use serde::{Deserialize, Serialize};
use std::fmt;

/// SSH 凭证引用（只保存引用，不保存明文密码）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SshCredential {
    /// 私钥文件路径
    KeyFile(String),
    /// 密码所在的环境变量名，通过 sshpass -e 传递
    Password(String),
    /// 使用本机 ssh-agent / 默认密钥
    #[default]
    Agent,
}

impl SshCredential {
    /// 解析旧格式中的凭证字段
    ///
    /// - 空字符串 -> Agent
    /// - `env:NAME` -> Password(NAME)
    /// - `key:PATH` 或以 `/`、`~` 开头 -> KeyFile
    /// - 其他 -> 视为环境变量名
    pub fn from_legacy(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            SshCredential::Agent
        } else if let Some(var) = value.strip_prefix("env:") {
            SshCredential::Password(var.to_string())
        } else if let Some(path) = value.strip_prefix("key:") {
            SshCredential::KeyFile(path.to_string())
        } else if value.starts_with('/') || value.starts_with('~') {
            SshCredential::KeyFile(value.to_string())
        } else {
            SshCredential::Password(value.to_string())
        }
    }

    /// 密码凭证对应的明文（从环境变量读取）
    pub fn resolve_password(&self) -> Option<String> {
        match self {
            SshCredential::Password(var) => std::env::var(var).ok().filter(|s| !s.is_empty()),
            _ => None,
        }
    }
}

/// 节点记录
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// 唯一名称
    pub name: String,
    pub address: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub credential: SshCredential,
    /// 该节点在 LB 中对应的 SNI 域名
    pub lb_domain: String,
    /// 面板侧节点 ID，注册成功前为空
    #[serde(default)]
    pub external_id: Option<u64>,
}

impl NodeRecord {
    /// 创建新节点（尚未注册）
    pub fn new(name: impl Into<String>, address: impl Into<String>, lb_domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            ssh_user: "root".to_string(),
            ssh_port: 22,
            credential: SshCredential::Agent,
            lb_domain: lb_domain.into(),
            external_id: None,
        }
    }

    pub fn with_ssh(mut self, user: impl Into<String>, port: u16, credential: SshCredential) -> Self {
        self.ssh_user = user.into();
        self.ssh_port = port;
        self.credential = credential;
        self
    }

    pub fn with_external_id(mut self, id: u64) -> Self {
        self.external_id = Some(id);
        self
    }

    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.ssh_user, self.address)
    }

    pub fn is_registered(&self) -> bool {
        self.external_id.is_some()
    }

    /// 校验会被写进 LB 配置或远程命令的字段
    ///
    /// 名称、地址、域名都不能含空白、引号、花括号或 `#`，
    /// 否则渲染出的配置行会被截断或注释掉
    pub fn validate(&self) -> Result<(), LegacyParseError> {
        if self.name.is_empty() {
            return Err(LegacyParseError::MissingField("name"));
        }
        if self.address.is_empty() {
            return Err(LegacyParseError::MissingField("address"));
        }
        for (field, value) in [
            ("name", &self.name),
            ("address", &self.address),
            ("lb_domain", &self.lb_domain),
            ("ssh_user", &self.ssh_user),
        ] {
            if value.chars().any(is_forbidden) {
                return Err(LegacyParseError::InvalidField(field, value.clone()));
            }
        }
        Ok(())
    }

    /// 解析旧版分号分隔的记录
    ///
    /// 字段顺序: name;address;ssh_user;ssh_port;domain;secret;external_id
    pub fn parse_legacy(line: &str) -> Result<Self, LegacyParseError> {
        let fields: Vec<&str> = line.split(';').map(str::trim).collect();
        if fields.len() != 7 {
            return Err(LegacyParseError::FieldCount(fields.len()));
        }

        let name = fields[0];
        if name.is_empty() {
            return Err(LegacyParseError::MissingField("name"));
        }
        let address = fields[1];
        if address.is_empty() {
            return Err(LegacyParseError::MissingField("address"));
        }

        let ssh_user = if fields[2].is_empty() { "root" } else { fields[2] };
        let ssh_port = if fields[3].is_empty() {
            22
        } else {
            fields[3]
                .parse()
                .map_err(|_| LegacyParseError::InvalidNumber("ssh_port", fields[3].to_string()))?
        };
        let external_id = if fields[6].is_empty() {
            None
        } else {
            Some(
                fields[6]
                    .parse()
                    .map_err(|_| LegacyParseError::InvalidNumber("external_id", fields[6].to_string()))?,
            )
        };

        let node = Self {
            name: name.to_string(),
            address: address.to_string(),
            ssh_user: ssh_user.to_string(),
            ssh_port,
            credential: SshCredential::from_legacy(fields[5]),
            lb_domain: fields[4].to_string(),
            external_id,
        };
        node.validate()?;
        Ok(node)
    }
}

fn is_forbidden(c: char) -> bool {
    c.is_whitespace() || matches!(c, '{' | '}' | '#' | '\'' | '"' | ';')
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// 节点记录解析/校验错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LegacyParseError {
    #[error("expected 7 fields, got {0}")]
    FieldCount(usize),
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("invalid {0}: {1}")]
    InvalidNumber(&'static str, String),
    #[error("{0} {1:?} contains whitespace, quotes, braces or '#'")]
    InvalidField(&'static str, String),
}
