//! Checkpoint store
//!
//! One safetensors file per network role, named
//! `{step:06}_{tag}_{role}.safetensors`.

use candle_nn::VarMap;
use featswap_core::{NetRole, Roles};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{DebiasError, DebiasResult};

/// Which checkpoint to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSelector {
    pub step: usize,
    pub tag: String,
}

impl CheckpointSelector {
    pub fn new(step: usize, tag: impl Into<String>) -> Self {
        Self {
            step,
            tag: tag.into(),
        }
    }
}

impl fmt::Display for CheckpointSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}_{}", self.step, self.tag)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: usize, tag: &str, role: NetRole) -> PathBuf {
        self.dir
            .join(format!("{:06}_{}_{}.safetensors", step, tag, role.name()))
    }

    pub fn exists(&self, step: usize, tag: &str) -> bool {
        NetRole::ALL
            .iter()
            .all(|&role| self.path_for(step, tag, role).is_file())
    }

    pub fn save(&self, step: usize, tag: &str, varmaps: &Roles<VarMap>) -> DebiasResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| DebiasError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        for (role, map) in varmaps.iter() {
            map.save(self.path_for(step, tag, role))?;
        }
        tracing::debug!(step, tag, dir = %self.dir.display(), "checkpoint saved");
        Ok(())
    }

    /// Restore all four roles. Nothing is loaded unless every file exists.
    pub fn load(&self, step: usize, tag: &str, varmaps: &mut Roles<VarMap>) -> DebiasResult<()> {
        if let Some(missing) = NetRole::ALL
            .iter()
            .map(|&role| self.path_for(step, tag, role))
            .find(|path| !path.is_file())
        {
            return Err(DebiasError::CheckpointNotFound { path: missing });
        }
        varmaps.try_for_each_mut(|role, map| -> DebiasResult<()> {
            map.load(self.path_for(step, tag, role))?;
            Ok(())
        })
    }

    pub fn load_selected(&self, selector: &CheckpointSelector, varmaps: &mut Roles<VarMap>) -> DebiasResult<()> {
        self.load(selector.step, &selector.tag, varmaps)
    }
}
