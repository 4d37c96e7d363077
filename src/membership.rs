//! Cluster membership and its on-disk config store (§4.3).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;
use crate::NodeId;

/// A single member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub url: String,
}

/// Cluster membership, replicated as a `Config`-typed log entry (§3).
///
/// This is the self-describing text document persisted at `<data-dir>/config`
/// and mirrored into the log so that every node, including ones that join
/// later via streaming catch-up, learns the membership from the log itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Prevents cross-cluster confusion between independently bootstrapped clusters.
    pub cluster_id: u64,
    /// Ordered set of cluster members.
    pub nodes: Vec<NodeInfo>,
}

impl Config {
    /// Build the one-member config minted by `initialize()`.
    pub fn new_single(cluster_id: u64, id: NodeId, url: String) -> Self {
        Self {
            cluster_id,
            nodes: vec![NodeInfo { id, url }],
        }
    }

    /// Number of votes required for a majority of this membership (counting self).
    pub fn quorum_size(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    pub fn peer_ids(&self, self_id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|n| n.id).filter(move |id| *id != self_id)
    }
}

/// Loads and saves the `config` file alongside a node's log segment.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("config"),
        }
    }

    /// Load the persisted config, if any. Returns `None` when the node is uninitialized.
    pub async fn load(&self) -> Result<Option<Config>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically persist `config`, replacing whatever was there before.
    pub async fn save(&self, config: &Config) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(config)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile_dir();
        let store = ConfigStore::new(&dir);
        assert!(store.load().await.unwrap().is_none());

        let config = Config::new_single(7, 1, "http://n1:8080".into());
        store.save(&config).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn quorum_size_is_majority() {
        let config = Config {
            cluster_id: 1,
            nodes: vec![
                NodeInfo { id: 1, url: "a".into() },
                NodeInfo { id: 2, url: "b".into() },
                NodeInfo { id: 3, url: "c".into() },
            ],
        };
        assert_eq!(config.quorum_size(), 2);
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("raftlog-config-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
