//! Persistence for the two fields a Node must recover before it can safely
//! answer RPCs after a restart (§3): `current_term` and `voted_for`. Written
//! as a small self-describing document alongside `id` and `config`, rewritten
//! synchronously on every term or vote change (see DESIGN.md).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;
use crate::NodeId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

pub struct HardStateStore {
    path: PathBuf,
}

impl HardStateStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("hardstate"),
        }
    }

    pub async fn load(&self) -> Result<HardState> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HardState::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, state: &HardState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
