//! 节点注册表
//!
//! 有序的节点记录集合，持久化为单个 JSON 文件：
//! - 写入采用临时文件 + rename，崩溃时不会留下截断的文件
//! - 所有写操作持有写锁直到落盘完成（单写者）
//! - 先落盘再更新内存，写盘失败时内存状态不变

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::node::NodeRecord;
use crate::error::{FleetError, FleetResult};

const REGISTRY_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    saved_at: DateTime<Utc>,
    nodes: Vec<NodeRecord>,
}

/// 旧格式导入结果
#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportReport {
    pub imported: Vec<String>,
    /// 注册表中已存在而跳过的名称
    pub skipped: Vec<String>,
    /// (行号, 错误)
    pub malformed: Vec<(usize, String)>,
}

fn check_record(node: &NodeRecord) -> FleetResult<()> {
    node.validate().map_err(|e| FleetError::InvalidNode {
        node: node.name.clone(),
        detail: e.to_string(),
    })
}

/// 节点注册表
pub struct NodeRegistry {
    path: PathBuf,
    nodes: RwLock<Vec<NodeRecord>>,
}

impl NodeRegistry {
    /// 从文件加载，文件不存在时为空注册表
    pub async fn load(path: impl Into<PathBuf>) -> FleetResult<Self> {
        let path = path.into();
        let nodes = match fs::read_to_string(&path).await {
            Ok(content) => {
                let file: RegistryFile = serde_json::from_str(&content)?;
                if file.version != REGISTRY_VERSION {
                    warn!(path = %path.display(), version = file.version, "Unexpected registry version");
                }
                info!(path = %path.display(), nodes = file.nodes.len(), "Loaded node registry");
                file.nodes
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            nodes: RwLock::new(nodes),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 按插入顺序返回全部节点
    pub async fn list(&self) -> Vec<NodeRecord> {
        self.nodes.read().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.read().await.iter().find(|n| n.name == name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.nodes.read().await.iter().any(|n| n.name == name)
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// 添加节点，同名节点已存在时失败且不做任何修改
    pub async fn add(&self, node: NodeRecord) -> FleetResult<()> {
        check_record(&node)?;
        let mut guard = self.nodes.write().await;
        if guard.iter().any(|n| n.name == node.name) {
            return Err(FleetError::AlreadyExists(node.name));
        }

        let mut next = guard.clone();
        let name = node.name.clone();
        next.push(node);
        self.persist(&next).await?;
        *guard = next;

        info!(node = %name, total = guard.len(), "Node added to registry");
        Ok(())
    }

    /// 原地修改一条记录并持久化，返回修改后的记录
    pub async fn update<F>(&self, name: &str, f: F) -> FleetResult<NodeRecord>
    where
        F: FnOnce(&mut NodeRecord),
    {
        let mut guard = self.nodes.write().await;
        let idx = guard
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| FleetError::NotFound(name.to_string()))?;

        let mut next = guard.clone();
        f(&mut next[idx]);
        check_record(&next[idx])?;
        let renamed = next[idx].name.clone();
        if renamed != name && next.iter().filter(|n| n.name == renamed).count() > 1 {
            return Err(FleetError::AlreadyExists(renamed));
        }

        self.persist(&next).await?;
        let updated = next[idx].clone();
        *guard = next;
        Ok(updated)
    }

    /// 删除节点（整文件重写）
    pub async fn remove(&self, name: &str) -> FleetResult<NodeRecord> {
        let mut guard = self.nodes.write().await;
        let idx = guard
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| FleetError::NotFound(name.to_string()))?;

        let mut next = guard.clone();
        let removed = next.remove(idx);
        self.persist(&next).await?;
        *guard = next;

        info!(node = %name, total = guard.len(), "Node removed from registry");
        Ok(removed)
    }

    /// 导入旧版分号分隔格式
    ///
    /// 空行与 `#` 注释跳过；格式错误的行记入报告，不中断导入；
    /// 已存在的名称（包括文件内重复）跳过
    pub async fn import_legacy(&self, path: impl AsRef<Path>) -> FleetResult<ImportReport> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await?;
        let mut report = ImportReport::default();

        let mut guard = self.nodes.write().await;
        let mut next = guard.clone();

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match NodeRecord::parse_legacy(line) {
                Ok(node) if next.iter().any(|n| n.name == node.name) => {
                    report.skipped.push(node.name);
                }
                Ok(node) => {
                    report.imported.push(node.name.clone());
                    next.push(node);
                }
                Err(e) => {
                    warn!(path = %path.display(), line = idx + 1, error = %e, "Skipping malformed legacy record");
                    report.malformed.push((idx + 1, e.to_string()));
                }
            }
        }

        if !report.imported.is_empty() {
            self.persist(&next).await?;
            *guard = next;
        }

        info!(
            path = %path.display(),
            imported = report.imported.len(),
            skipped = report.skipped.len(),
            malformed = report.malformed.len(),
            "Legacy registry import finished"
        );
        Ok(report)
    }

    /// 原子写入（临时文件 + rename）
    async fn persist(&self, nodes: &[NodeRecord]) -> FleetResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = RegistryFile {
            version: REGISTRY_VERSION,
            saved_at: Utc::now(),
            nodes: nodes.to_vec(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}
