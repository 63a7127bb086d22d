//! 节点部署编排
//!
//! 每个新节点一个状态机实例：
//! Provisioning → WaitingForService → Registering → CertificateIssued → Reconfiguring → HealthVerified
//!
//! 注册表规则：Registering 成功前不写入；成功后写入并保留，后续阶段失败也不删除，
//! 再次部署同名节点时从 CertificateIssued 续跑。

pub mod context;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{DeployTimings, FleetConfig, NodeSettings};
use crate::domain::deploy::{DeployOutcome, DeployReport, DeploymentState};
use crate::domain::node::NodeRecord;
use crate::error::{FleetError, FleetResult};
use crate::infra::panel::{PanelApi, PanelSession};
use crate::infra::remote::{shell_quote, RemoteExecutor};
use crate::services::notify::{Alert, Notifier, Severity};
use crate::state::NodeRegistry;

pub use context::DeployContext;

/// 部署编排器
pub struct DeploymentOrchestrator {
    executor: Arc<RemoteExecutor>,
    panel: Arc<dyn PanelApi>,
    registry: Arc<NodeRegistry>,
    notifier: Arc<dyn Notifier>,
    node: NodeSettings,
    timings: DeployTimings,
    staging_dir: PathBuf,
}

impl DeploymentOrchestrator {
    pub fn new(
        executor: Arc<RemoteExecutor>,
        panel: Arc<dyn PanelApi>,
        registry: Arc<NodeRegistry>,
        notifier: Arc<dyn Notifier>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            executor,
            panel,
            registry,
            notifier,
            node: config.node.clone(),
            timings: config.deploy.clone(),
            staging_dir: config.staging_dir(),
        }
    }

    /// 部署一个节点，总是返回报告（失败信息在报告中）
    pub async fn deploy(&self, node: NodeRecord, cancel: &CancellationToken) -> DeployReport {
        let mut ctx = DeployContext::new(node, cancel.clone());
        info!(run_id = %ctx.run_id, node = %ctx.node, "Starting deployment");

        let report = match self.run_phases(&mut ctx).await {
            Ok(outcome) => {
                info!(run_id = %ctx.run_id, node = %ctx.node.name, outcome = ?outcome, "Deployment finished");
                ctx.into_report(outcome)
            }
            Err(e) => ctx.fail(e),
        };

        if let DeployOutcome::Failed { phase, error, .. } = &report.outcome {
            let detail = format!(
                "failed during {}: {} (registered: {})",
                phase.as_str(),
                error,
                report.registered
            );
            self.notifier
                .notify(Alert::new(
                    Severity::Warning,
                    "Deployment failed",
                    vec![report.node.clone()],
                    detail,
                ))
                .await;
        }
        report
    }

    async fn run_phases(&self, ctx: &mut DeployContext) -> FleetResult<DeployOutcome> {
        if let Some(existing) = self.registry.get(&ctx.node.name).await {
            if !existing.is_registered() {
                return Err(FleetError::AlreadyExists(existing.name));
            }
            info!(
                node = %existing.name,
                external_id = ?existing.external_id,
                "Node already registered, resuming at certificate issue"
            );
            ctx.node = existing;
            ctx.resumed = true;
            ctx.registered = true;
            for phase in [
                DeploymentState::Provisioning,
                DeploymentState::WaitingForService,
                DeploymentState::Registering,
            ] {
                ctx.skip(phase, "resumed from registry");
            }
        } else {
            // 1. 安装
            self.enter(ctx, DeploymentState::Provisioning)?;
            self.provision(&ctx.node).await?;
            ctx.complete(None);

            // 2. 等待服务端口
            self.enter(ctx, DeploymentState::WaitingForService)?;
            let waited = self.wait_for_service(&ctx.node, &ctx.cancel_token).await?;
            ctx.complete(Some(format!("listening after {}s", waited.as_secs())));

            // 3. 注册
            self.enter(ctx, DeploymentState::Registering)?;
            let message = self.register(ctx).await?;
            ctx.complete(Some(message));
        }

        // 4. 获取证书
        self.enter(ctx, DeploymentState::CertificateIssued)?;
        let session = self.session(ctx).await?;
        let external_id = Self::external_id(&ctx.node)?;
        let cert = self
            .panel
            .fetch_client_certificate(&session, external_id)
            .await?;
        if cert.trim().is_empty() {
            return Err(FleetError::Panel(format!(
                "panel returned an empty client certificate for node {} (id {})",
                ctx.node.name, external_id
            )));
        }
        ctx.complete(None);

        // 5. 推送证书、打开面板开关、重启
        self.enter(ctx, DeploymentState::Reconfiguring)?;
        self.reconfigure(ctx, &cert).await?;
        ctx.complete(None);

        // 6. 健康确认
        self.enter(ctx, DeploymentState::HealthVerified)?;
        tokio::select! {
            _ = ctx.cancel_token.cancelled() => return Err(FleetError::Cancelled),
            _ = tokio::time::sleep(self.timings.settle_delay) => {}
        }
        let reading = self.panel.get_node_status(&session, external_id).await;
        if reading.status.is_connected() {
            ctx.complete(Some("connected".to_string()));
            return Ok(DeployOutcome::Deployed);
        }

        let detail = match &reading.detail {
            Some(d) => format!("panel reports {} ({})", reading.status.as_str(), d),
            None => format!("panel reports {}", reading.status.as_str()),
        };
        ctx.complete_with_warning(format!("{}, node kept registered for later verification", detail));
        self.notifier
            .notify(Alert::new(
                Severity::Warning,
                "Node deployed but not verified",
                vec![ctx.node.name.clone()],
                detail,
            ))
            .await;
        Ok(DeployOutcome::DeployedUnverified {
            status: reading.status,
        })
    }

    /// 阶段之间检查取消
    fn enter(&self, ctx: &mut DeployContext, phase: DeploymentState) -> FleetResult<()> {
        if ctx.is_cancelled() {
            return Err(FleetError::Cancelled);
        }
        ctx.begin(phase);
        Ok(())
    }

    async fn provision(&self, node: &NodeRecord) -> FleetResult<()> {
        let remote_installer = self.node.remote_installer_path();

        self.executor
            .execute(
                node,
                &format!("mkdir -p {}", shell_quote(&self.node.install_dir)),
                "Create install directory",
            )
            .await?;
        self.executor
            .push_file(node, &self.node.installer_path, &remote_installer, "Push installer")
            .await?;
        self.executor
            .execute(
                node,
                &format!("bash {}", shell_quote(&remote_installer)),
                "Run installer",
            )
            .await?;
        Ok(())
    }

    /// 轮询服务端口直到监听，超时为终态错误
    async fn wait_for_service(
        &self,
        node: &NodeRecord,
        cancel: &CancellationToken,
    ) -> FleetResult<std::time::Duration> {
        let port = self.node.service_port;
        let probe = format!("ss -ltn 2>/dev/null | grep -q ':{} '", port);
        let started = Instant::now();
        let deadline = started + self.timings.ready_timeout;
        let mut probes = 0u32;

        loop {
            probes += 1;
            // 单次探测同样受截止时间约束，卡住的 ssh 不能拖过上限
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FleetError::Cancelled),
                result = self.executor.probe(node, &probe, "Probe service port") => Some(result),
                _ = tokio::time::sleep_until(deadline) => None,
            };
            let last = match attempt {
                Some(result) if result.success => return Ok(started.elapsed()),
                Some(result) if result.output.is_empty() => "no output".to_string(),
                Some(result) => result.output,
                None => "port check still running at deadline".to_string(),
            };
            debug!(node = %node.name, port, probes, "Service port not listening yet");

            if Instant::now() >= deadline {
                return Err(FleetError::timeout(
                    DeploymentState::WaitingForService.as_str(),
                    format!(
                        "port {} on {} not listening after {}s ({} probes, last: {})",
                        port,
                        node.address,
                        self.timings.ready_timeout.as_secs(),
                        probes,
                        last
                    ),
                ));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(FleetError::Cancelled),
                _ = tokio::time::sleep(self.timings.poll_interval) => {}
            }
        }
    }

    /// 注册到面板并写入注册表
    async fn register(&self, ctx: &mut DeployContext) -> FleetResult<String> {
        let session = self.panel.authenticate().await?;
        let registration = self
            .panel
            .register_node(&session, &ctx.node.name, &ctx.node.address)
            .await?;
        ctx.session = Some(session);

        let record = ctx.node.clone().with_external_id(registration.external_id);
        self.registry.add(record.clone()).await?;
        ctx.node = record;
        ctx.registered = true;

        Ok(if registration.existing {
            format!("external_id={} (existing)", registration.external_id)
        } else {
            format!("external_id={}", registration.external_id)
        })
    }

    async fn session(&self, ctx: &mut DeployContext) -> FleetResult<PanelSession> {
        if let Some(session) = &ctx.session {
            return Ok(session.clone());
        }
        let session = self.panel.authenticate().await?;
        ctx.session = Some(session.clone());
        Ok(session)
    }

    fn external_id(node: &NodeRecord) -> FleetResult<u64> {
        node.external_id
            .ok_or_else(|| FleetError::Panel(format!("node {} has no external id", node.name)))
    }

    async fn reconfigure(&self, ctx: &DeployContext, cert: &str) -> FleetResult<()> {
        let node = &ctx.node;

        fs::create_dir_all(&self.staging_dir).await?;
        let local = self
            .staging_dir
            .join(format!("cert-{}-{}.pem", node.name, ctx.run_id));
        fs::write(&local, cert).await?;
        let pushed = self.push_certificate(node, &local).await;
        if let Err(e) = fs::remove_file(&local).await {
            debug!(path = %local.display(), error = %e, "Failed to remove staged certificate");
        }
        pushed?;

        let flag = &self.node.panel_flag;
        let env_path = shell_quote(&self.node.env_path);
        let set_flag = format!(
            "grep -q '^{flag}=' {env} && sed -i 's/^{flag}=.*/{flag}=true/' {env} || echo '{flag}=true' >> {env}",
            flag = flag,
            env = env_path
        );
        self.executor
            .execute(node, &set_flag, "Enable panel connectivity")
            .await?;

        self.executor
            .execute(
                node,
                &format!("systemctl restart {}", shell_quote(&self.node.service)),
                "Restart relay service",
            )
            .await?;
        Ok(())
    }

    async fn push_certificate(&self, node: &NodeRecord, local: &Path) -> FleetResult<()> {
        let target = self.node.client_cert_path.as_str();
        if let Some(dir) = Path::new(target).parent().filter(|p| !p.as_os_str().is_empty()) {
            self.executor
                .execute(
                    node,
                    &format!("mkdir -p {}", shell_quote(&dir.display().to_string())),
                    "Create certificate directory",
                )
                .await?;
        }
        self.executor
            .push_file(node, local, target, "Push client certificate")
            .await?;
        Ok(())
    }
}
