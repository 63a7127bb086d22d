//! 面板 HTTP Client
//!
//! 封装与面板的所有 REST 交互：
//! - 认证 (authenticate)，token 存放在显式传递的 `PanelSession` 中
//! - 节点注册/查找/删除
//! - 客户端证书获取
//! - 节点状态查询（任何异常都降级为 unknown）
//!
//! 所有请求共享同一个限流器与重试策略

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::PanelConfig;
use crate::domain::health::NodeStatus;
use crate::error::{FleetError, FleetResult};

use super::retry::{RateLimiter, RetryPolicy};

/// 错误信息中使用的“节点”名
const PANEL_ENDPOINT: &str = "panel";

/// 面板会话
///
/// 克隆后共享同一个 token；401 时由客户端原地替换
#[derive(Clone)]
pub struct PanelSession {
    inner: Arc<RwLock<SessionToken>>,
}

struct SessionToken {
    value: String,
    obtained_at: DateTime<Utc>,
    refreshes: u32,
}

impl PanelSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionToken {
                value: token.into(),
                obtained_at: Utc::now(),
                refreshes: 0,
            })),
        }
    }

    pub async fn token(&self) -> String {
        self.inner.read().await.value.clone()
    }

    pub async fn obtained_at(&self) -> DateTime<Utc> {
        self.inner.read().await.obtained_at
    }

    /// 重新认证的次数
    pub async fn refreshes(&self) -> u32 {
        self.inner.read().await.refreshes
    }

    async fn replace(&self, token: String) {
        let mut guard = self.inner.write().await;
        guard.value = token;
        guard.obtained_at = Utc::now();
        guard.refreshes += 1;
    }
}

impl fmt::Debug for PanelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanelSession").finish_non_exhaustive()
    }
}

/// 创建节点的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateNode {
    Created(u64),
    /// 面板已存在同名节点
    Conflict,
}

/// 注册结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub external_id: u64,
    /// 是否通过查找恢复的已有节点
    pub existing: bool,
}

/// 状态查询结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReading {
    pub status: NodeStatus,
    pub detail: Option<String>,
}

impl StatusReading {
    pub fn of(status: NodeStatus) -> Self {
        Self {
            status,
            detail: None,
        }
    }

    pub fn unknown(detail: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Unknown,
            detail: Some(detail.into()),
        }
    }
}

/// 面板 API 边界
#[async_trait]
pub trait PanelApi: Send + Sync {
    async fn authenticate(&self) -> FleetResult<PanelSession>;

    async fn create_node(&self, session: &PanelSession, name: &str, address: &str) -> FleetResult<CreateNode>;

    async fn find_node_id(&self, session: &PanelSession, name: &str) -> FleetResult<Option<u64>>;

    async fn fetch_client_certificate(&self, session: &PanelSession, external_id: u64) -> FleetResult<String>;

    /// 查询节点状态，从不返回错误
    async fn get_node_status(&self, session: &PanelSession, external_id: u64) -> StatusReading;

    /// 删除节点，面板上已不存在时视为成功
    async fn delete_node(&self, session: &PanelSession, external_id: u64) -> FleetResult<()>;

    /// 注册节点；“已存在”时按名称查回已有 ID
    async fn register_node(
        &self,
        session: &PanelSession,
        name: &str,
        address: &str,
    ) -> FleetResult<Registration> {
        match self.create_node(session, name, address).await? {
            CreateNode::Created(id) => Ok(Registration {
                external_id: id,
                existing: false,
            }),
            CreateNode::Conflict => {
                info!(node = %name, "Node already exists on panel, looking up its id");
                match self.find_node_id(session, name).await? {
                    Some(id) => Ok(Registration {
                        external_id: id,
                        existing: true,
                    }),
                    None => Err(FleetError::Panel(format!(
                        "node {} reported as existing but not found by name",
                        name
                    ))),
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
}

#[derive(Deserialize)]
struct NodeSummary {
    id: u64,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct CertificateResponse {
    #[serde(default)]
    client_cert: String,
}

/// 基于 reqwest 的面板客户端
pub struct PanelClient {
    client: Client,
    config: PanelConfig,
    limiter: RateLimiter,
    policy: RetryPolicy,
    node_port: u16,
    api_port: u16,
}

impl PanelClient {
    /// 创建新的面板客户端
    ///
    /// # Arguments
    /// * `config` - 面板地址、凭证与超时
    /// * `policy` - 连接失败时的重试策略
    pub fn new(config: PanelConfig, policy: RetryPolicy) -> FleetResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| FleetError::Panel(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            limiter: RateLimiter::new(config.min_interval),
            config,
            policy,
            node_port: 62050,
            api_port: 62051,
        })
    }

    /// 注册节点时上报的服务端口，API 端口为其后一个
    pub fn with_node_port(mut self, port: u16) -> Self {
        self.node_port = port;
        self.api_port = port.saturating_add(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn classify(e: reqwest::Error) -> FleetError {
        FleetError::connectivity(PANEL_ENDPOINT, e.to_string())
    }

    /// 发送请求（限流 + 连接失败重试）
    async fn send<F>(&self, label: &str, build: F) -> FleetResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let build = &build;
        let (result, _) = self
            .policy
            .run(label, FleetError::is_retryable, |_| async move {
                self.limiter.acquire().await;
                build().send().await.map_err(Self::classify)
            })
            .await;
        result
    }

    /// 带 token 发送；401 时重新认证一次再重试
    async fn send_authed<F>(&self, session: &PanelSession, label: &str, build: F) -> FleetResult<Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = session.token().await;
        let resp = self.send(label, || build(&token)).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        warn!(operation = %label, "Panel session rejected, re-authenticating");
        let fresh = self.login().await?;
        session.replace(fresh.clone()).await;

        let resp = self.send(label, || build(&fresh)).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(FleetError::Auth(
                "panel rejected a freshly issued token".to_string(),
            ));
        }
        Ok(resp)
    }

    async fn login(&self) -> FleetResult<String> {
        let resp = self
            .send("panel authenticate", || {
                self.client.post(self.url("/api/admin/token")).form(&[
                    ("username", self.config.username.as_str()),
                    ("password", self.config.password.as_str()),
                ])
            })
            .await?;

        match resp.status() {
            s if s.is_success() => {
                let body: TokenResponse = resp
                    .json()
                    .await
                    .map_err(|e| FleetError::Panel(format!("malformed token response: {}", e)))?;
                if body.access_token.is_empty() {
                    return Err(FleetError::Auth("panel returned an empty token".to_string()));
                }
                Ok(body.access_token)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FleetError::Auth(format!(
                "panel rejected credentials for user {}",
                self.config.username
            ))),
            s => Err(FleetError::Panel(format!("token endpoint returned {}", s))),
        }
    }

    async fn unexpected(label: &str, resp: Response) -> FleetError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        FleetError::Panel(format!(
            "{} returned {}: {}",
            label,
            status,
            body.chars().take(200).collect::<String>()
        ))
    }
}

#[async_trait]
impl PanelApi for PanelClient {
    async fn authenticate(&self) -> FleetResult<PanelSession> {
        let token = self.login().await?;
        info!(base_url = %self.config.base_url, "Authenticated with panel");
        Ok(PanelSession::new(token))
    }

    async fn create_node(&self, session: &PanelSession, name: &str, address: &str) -> FleetResult<CreateNode> {
        let body = serde_json::json!({
            "name": name,
            "address": address,
            "port": self.node_port,
            "api_port": self.api_port,
        });
        let resp = self
            .send_authed(session, "panel create node", |token| {
                self.client
                    .post(self.url("/api/node"))
                    .bearer_auth(token)
                    .json(&body)
            })
            .await?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            return Ok(CreateNode::Conflict);
        }
        if status == StatusCode::BAD_REQUEST {
            let text = resp.text().await.unwrap_or_default();
            if text.to_lowercase().contains("already exists") {
                return Ok(CreateNode::Conflict);
            }
            return Err(FleetError::Panel(format!("create node returned 400: {}", text)));
        }
        if !status.is_success() {
            return Err(Self::unexpected("create node", resp).await);
        }

        let node: NodeSummary = resp
            .json()
            .await
            .map_err(|e| FleetError::Panel(format!("malformed create node response: {}", e)))?;
        debug!(node = %name, external_id = node.id, "Panel created node");
        Ok(CreateNode::Created(node.id))
    }

    async fn find_node_id(&self, session: &PanelSession, name: &str) -> FleetResult<Option<u64>> {
        let resp = self
            .send_authed(session, "panel list nodes", |token| {
                self.client.get(self.url("/api/nodes")).bearer_auth(token)
            })
            .await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected("list nodes", resp).await);
        }

        let nodes: Vec<NodeSummary> = resp
            .json()
            .await
            .map_err(|e| FleetError::Panel(format!("malformed node list: {}", e)))?;
        Ok(nodes.into_iter().find(|n| n.name == name).map(|n| n.id))
    }

    async fn fetch_client_certificate(&self, session: &PanelSession, external_id: u64) -> FleetResult<String> {
        let resp = self
            .send_authed(session, "panel fetch certificate", |token| {
                self.client
                    .get(self.url(&format!("/api/node/{}/certificate", external_id)))
                    .bearer_auth(token)
            })
            .await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected("fetch certificate", resp).await);
        }

        let body: CertificateResponse = resp
            .json()
            .await
            .map_err(|e| FleetError::Panel(format!("malformed certificate response: {}", e)))?;
        Ok(body.client_cert)
    }

    async fn get_node_status(&self, session: &PanelSession, external_id: u64) -> StatusReading {
        let resp = match self
            .send_authed(session, "panel node status", |token| {
                self.client
                    .get(self.url(&format!("/api/node/{}", external_id)))
                    .bearer_auth(token)
            })
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(external_id = external_id, error = %e, "Panel status query failed");
                return StatusReading::unknown(e.to_string());
            }
        };

        if !resp.status().is_success() {
            return StatusReading::unknown(format!("panel returned {}", resp.status()));
        }

        match resp.json::<serde_json::Value>().await {
            Ok(body) => match body.get("status").and_then(|s| s.as_str()) {
                Some(s) => StatusReading::of(NodeStatus::from_panel(s)),
                None => StatusReading::unknown("status field missing"),
            },
            Err(e) => StatusReading::unknown(format!("malformed status response: {}", e)),
        }
    }

    async fn delete_node(&self, session: &PanelSession, external_id: u64) -> FleetResult<()> {
        let resp = self
            .send_authed(session, "panel delete node", |token| {
                self.client
                    .delete(self.url(&format!("/api/node/{}", external_id)))
                    .bearer_auth(token)
            })
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(external_id = external_id, "Node already absent from panel");
                Ok(())
            }
            _ => Err(Self::unexpected("delete node", resp).await),
        }
    }
}
