//! Registry of open layers.
//!
//! [`SessionRegistry`] maps UUID-based [`LayerId`]s to their sessions. Backed
//! by `DashMap` so tasks can open and look up layers concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use geoedit_core::DataSet;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::EditSession;

/// Unique layer identifier (UUID v4 newtype).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId(pub Uuid);

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub id: LayerId,
    pub name: String,
    pub opened_at: Instant,
}

struct Layer {
    seq: u64,
    info: LayerInfo,
    session: EditSession,
}

pub struct SessionRegistry {
    layers: DashMap<LayerId, Layer>,
    next_seq: AtomicU64,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        SessionRegistry {
            layers: DashMap::new(),
            next_seq: AtomicU64::new(0),
            config,
        }
    }

    /// Opens an empty layer.
    pub fn open(&self, name: impl Into<String>) -> LayerId {
        self.open_with(name, DataSet::new())
    }

    /// Opens a layer over an existing store.
    pub fn open_with(&self, name: impl Into<String>, dataset: DataSet) -> LayerId {
        let id = LayerId(Uuid::new_v4());
        let info = LayerInfo {
            id,
            name: name.into(),
            opened_at: Instant::now(),
        };
        tracing::debug!(layer = %id, name = %info.name, "opened layer");
        let session = EditSession::with_dataset(self.config.clone(), dataset);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.layers.insert(id, Layer { seq, info, session });
        id
    }

    pub fn get(&self, id: &LayerId) -> Result<EditSession, SessionError> {
        self.layers
            .get(id)
            .map(|layer| layer.session.clone())
            .ok_or(SessionError::UnknownSession(*id))
    }

    /// Open layers, oldest first.
    pub fn list(&self) -> Vec<LayerInfo> {
        let mut layers: Vec<(u64, LayerInfo)> =
            self.layers.iter().map(|l| (l.seq, l.info.clone())).collect();
        layers.sort_by_key(|(seq, _)| *seq);
        layers.into_iter().map(|(_, info)| info).collect()
    }

    /// Removes the layer and drops its store, history, listeners and hooks.
    pub async fn close(&self, id: &LayerId) -> Result<(), SessionError> {
        let (_, layer) = self
            .layers
            .remove(id)
            .ok_or(SessionError::UnknownSession(*id))?;
        layer.session.shutdown().await?;
        tracing::debug!(layer = %id, "closed layer");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
