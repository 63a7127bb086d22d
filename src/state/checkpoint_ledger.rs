//! 回滚检查点账本
//!
//! 只追加的 JSON Lines 文件。每个检查点写一条 `created`，
//! 成功同步后写一条 `discarded` 墓碑；查询时取该节点最近一条未被丢弃的检查点。
//! 每轮同步结束后压缩一次，只保留仍有效的检查点。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::sync::RollbackCheckpoint;
use crate::error::FleetResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LedgerEntry {
    Created(RollbackCheckpoint),
    Discarded {
        node: String,
        snapshot_path: String,
        at: DateTime<Utc>,
    },
}

/// 检查点账本
pub struct CheckpointLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 记录新检查点
    pub async fn record(&self, checkpoint: &RollbackCheckpoint) -> FleetResult<()> {
        self.append(&LedgerEntry::Created(checkpoint.clone())).await?;
        debug!(node = %checkpoint.node, snapshot = %checkpoint.snapshot_path, "Checkpoint recorded");
        Ok(())
    }

    /// 标记检查点已丢弃（追加墓碑）
    pub async fn discard(&self, checkpoint: &RollbackCheckpoint) -> FleetResult<()> {
        self.append(&LedgerEntry::Discarded {
            node: checkpoint.node.clone(),
            snapshot_path: checkpoint.snapshot_path.clone(),
            at: Utc::now(),
        })
        .await
    }

    /// 节点最近一条仍有效的检查点
    pub async fn latest(&self, node: &str) -> FleetResult<Option<RollbackCheckpoint>> {
        let entries = self.read_entries().await?;
        Ok(live_checkpoints(entries)
            .into_iter()
            .filter(|c| c.node == node)
            .max_by_key(|c| c.timestamp))
    }

    /// 重写账本，丢掉已墓碑的检查点及其墓碑，返回删除的行数
    ///
    /// 持有写锁读写，压缩期间的追加会排在其后
    pub async fn compact(&self) -> FleetResult<usize> {
        let _guard = self.write_lock.lock().await;
        let entries = self.read_entries().await?;
        let before = entries.len();
        let live = live_checkpoints(entries);
        if live.len() == before {
            return Ok(0);
        }

        let mut content = String::new();
        for checkpoint in live.iter().cloned() {
            content.push_str(&serde_json::to_string(&LedgerEntry::Created(checkpoint))?);
            content.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;

        let dropped = before - live.len();
        debug!(path = %self.path.display(), dropped, live = live.len(), "Checkpoint ledger compacted");
        Ok(dropped)
    }

    async fn read_entries(&self) -> FleetResult<Vec<LedgerEntry>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(path = %self.path.display(), line = idx + 1, error = %e, "Ignoring unreadable ledger line");
                }
            }
        }
        Ok(entries)
    }

    async fn append(&self, entry: &LedgerEntry) -> FleetResult<()> {
        let line = serde_json::to_string(entry)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{}\n", line).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// 按写入顺序返回未被墓碑覆盖的检查点
fn live_checkpoints(entries: Vec<LedgerEntry>) -> Vec<RollbackCheckpoint> {
    let mut live: Vec<RollbackCheckpoint> = Vec::new();
    for entry in entries {
        match entry {
            LedgerEntry::Created(checkpoint) => live.push(checkpoint),
            LedgerEntry::Discarded {
                node,
                snapshot_path,
                ..
            } => live.retain(|c| !(c.node == node && c.snapshot_path == snapshot_path)),
        }
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn checkpoint(node: &str, offset_secs: i64) -> RollbackCheckpoint {
        let ts = Utc::now() + Duration::seconds(offset_secs);
        RollbackCheckpoint::new(node, "/etc/haproxy/haproxy.cfg", ts)
    }

    #[tokio::test]
    async fn test_latest_picks_newest_live_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CheckpointLedger::new(dir.path().join("checkpoints.jsonl"));
        assert_eq!(ledger.latest("a").await.unwrap(), None);

        let old = checkpoint("a", 0);
        let new = checkpoint("a", 10);
        let other = checkpoint("b", 20);
        ledger.record(&old).await.unwrap();
        ledger.record(&new).await.unwrap();
        ledger.record(&other).await.unwrap();

        assert_eq!(ledger.latest("a").await.unwrap(), Some(new.clone()));

        ledger.discard(&new).await.unwrap();
        assert_eq!(ledger.latest("a").await.unwrap(), Some(old.clone()));
        ledger.discard(&old).await.unwrap();
        assert_eq!(ledger.latest("a").await.unwrap(), None);
        assert_eq!(ledger.latest("b").await.unwrap(), Some(other));
    }

    #[tokio::test]
    async fn test_ledger_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CheckpointLedger::new(dir.path().join("checkpoints.jsonl"));
        let cp = checkpoint("a", 0);
        ledger.record(&cp).await.unwrap();
        ledger.discard(&cp).await.unwrap();

        let content = std::fs::read_to_string(ledger.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"event\":\"created\""));
        assert!(lines[1].contains("\"event\":\"discarded\""));
    }

    #[tokio::test]
    async fn test_compact_keeps_only_live_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CheckpointLedger::new(dir.path().join("checkpoints.jsonl"));
        assert_eq!(ledger.compact().await.unwrap(), 0);

        let done = checkpoint("a", 0);
        let kept = checkpoint("b", 5);
        ledger.record(&done).await.unwrap();
        ledger.record(&kept).await.unwrap();
        ledger.discard(&done).await.unwrap();

        assert_eq!(ledger.compact().await.unwrap(), 2);
        let content = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(!dir.path().join("checkpoints.jsonl.tmp").exists());
        assert_eq!(ledger.latest("a").await.unwrap(), None);
        assert_eq!(ledger.latest("b").await.unwrap(), Some(kept.clone()));

        // 已经紧凑时不重写
        assert_eq!(ledger.compact().await.unwrap(), 0);
        ledger.discard(&kept).await.unwrap();
        assert_eq!(ledger.compact().await.unwrap(), 2);
        assert_eq!(std::fs::read_to_string(ledger.path()).unwrap(), "");
    }
}
