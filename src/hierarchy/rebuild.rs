//! Rebuild trigger, rebuild record and background rebuild tracking
//!
//! A knowledge base is rebuilt when it has no hierarchical index, when no
//! record of a previous rebuild exists, or when its fragment count moved by
//! at least `max(min_change, change_ratio × previous)`.

use super::builder::{flat_index_dir, HierarchicalIndex, HierarchicalIndexBuilder};
use crate::config::{Config, RebuildConfig};
use crate::embedding::{EmbeddingProvider, VectorIndex};
use crate::entities::KeywordExtractor;
use crate::error::{Result, StratumError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

pub const REBUILD_RECORD_FILE: &str = "hierarchical_rebuild_record.json";

/// State persisted after each successful rebuild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildRecord {
    pub doc_count: usize,
    /// Unix seconds
    pub last_rebuild_time: i64,
    /// RFC 3339
    pub last_rebuild_datetime: String,
    pub kb_name: String,
}

impl RebuildRecord {
    pub fn new(kb_name: &str, doc_count: usize) -> Self {
        let now = Utc::now();
        Self {
            doc_count,
            last_rebuild_time: now.timestamp(),
            last_rebuild_datetime: now.to_rfc3339(),
            kb_name: kb_name.to_string(),
        }
    }

    pub fn path(kb_root: &Path) -> PathBuf {
        kb_root.join(REBUILD_RECORD_FILE)
    }

    /// Read the record; a missing or unreadable file counts as absent
    pub fn load(kb_root: &Path) -> Option<Self> {
        let path = Self::path(kb_root);
        let data = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring unreadable rebuild record {:?}: {}", path, e);
                None
            }
        }
    }

    pub fn save(&self, kb_root: &Path) -> Result<()> {
        let path = Self::path(kb_root);
        let json = serde_json::to_vec_pretty(self).map_err(|e| StratumError::Json {
            source: e,
            context: "Failed to serialize rebuild record".to_string(),
        })?;
        std::fs::create_dir_all(kb_root).map_err(|e| StratumError::Io {
            source: e,
            context: format!("Failed to create {:?}", kb_root),
        })?;
        std::fs::write(&path, json).map_err(|e| StratumError::Io {
            source: e,
            context: format!("Failed to write {:?}", path),
        })
    }
}

/// Decide whether a rebuild is due, with the reason
pub fn needs_rebuild(
    current_count: usize,
    record: Option<&RebuildRecord>,
    hierarchical_exists: bool,
    policy: &RebuildConfig,
) -> (bool, String) {
    if !hierarchical_exists {
        return (true, "hierarchical index missing".to_string());
    }
    let Some(record) = record else {
        return (true, "no rebuild record".to_string());
    };

    let threshold = (policy.min_change as f32).max(policy.change_ratio * record.doc_count as f32);
    let change = current_count.abs_diff(record.doc_count);
    if change as f32 >= threshold {
        (
            true,
            format!(
                "fragment count changed by {} ({} -> {}), threshold {:.0}",
                change, record.doc_count, current_count, threshold
            ),
        )
    } else {
        (
            false,
            format!("fragment count change {} below threshold {:.0}", change, threshold),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildAction {
    NoRebuildNeeded,
    Rebuilt,
    RebuildFailed,
    Error,
}

impl RebuildAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildAction::NoRebuildNeeded => "no_rebuild_needed",
            RebuildAction::Rebuilt => "rebuilt",
            RebuildAction::RebuildFailed => "rebuild_failed",
            RebuildAction::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildResult {
    pub success: bool,
    pub action: RebuildAction,
    pub message: String,
    #[serde(default)]
    pub doc_count: usize,
}

impl RebuildResult {
    fn new(success: bool, action: RebuildAction, message: impl Into<String>, doc_count: usize) -> Self {
        Self {
            success,
            action,
            message: message.into(),
            doc_count,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(false, RebuildAction::Error, message, 0)
    }
}

/// Rebuild one knowledge base from its flat index when the trigger fires
///
/// `force` skips the trigger. Never returns an error: failures are reported
/// through the result's action.
pub fn rebuild_knowledge_base(
    kb_root: &Path,
    kb_name: &str,
    provider: &dyn EmbeddingProvider,
    extractor: &KeywordExtractor,
    config: &Config,
    force: bool,
) -> RebuildResult {
    let flat = match VectorIndex::load_with_backup(&flat_index_dir(kb_root), &config.indexing) {
        Ok(flat) => flat,
        Err(e) => {
            warn!("Cannot load flat index of '{}': {}", kb_name, e);
            return RebuildResult::error(format!("cannot load flat index: {}", e));
        }
    };

    let doc_count = flat.len();
    let record = RebuildRecord::load(kb_root);
    let (due, reason) = needs_rebuild(
        doc_count,
        record.as_ref(),
        HierarchicalIndex::exists(kb_root),
        &config.rebuild,
    );

    if !due && !force {
        info!("No rebuild needed for '{}': {}", kb_name, reason);
        return RebuildResult::new(true, RebuildAction::NoRebuildNeeded, reason, doc_count);
    }

    info!("Rebuilding hierarchical index for '{}': {}", kb_name, reason);
    let builder = HierarchicalIndexBuilder::new(extractor, &config.hierarchy, &config.indexing);
    let outcome = builder
        .build_from_flat(kb_name, &flat, provider)
        .and_then(|index| index.save(kb_root).map(|_| index))
        .and_then(|index| {
            RebuildRecord::new(kb_name, doc_count).save(kb_root)?;
            Ok(index)
        });

    match outcome {
        Ok(index) => RebuildResult::new(
            true,
            RebuildAction::Rebuilt,
            format!(
                "rebuilt {} summaries over {} fragments",
                index.summaries.len(),
                doc_count
            ),
            doc_count,
        ),
        Err(e) => {
            warn!("Rebuild of '{}' failed: {}", kb_name, e);
            RebuildResult::new(false, RebuildAction::RebuildFailed, e.to_string(), doc_count)
        }
    }
}

/// Progress of a knowledge base's rebuild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RebuildStatus {
    Idle,
    Running {
        job_id: Uuid,
        started_at: DateTime<Utc>,
    },
    Finished {
        job_id: Uuid,
        finished_at: DateTime<Utc>,
        result: RebuildResult,
    },
}

/// Runs rebuilds on the blocking pool and tracks their status per knowledge base
#[derive(Clone, Default)]
pub struct RebuildTracker {
    statuses: Arc<Mutex<HashMap<String, RebuildStatus>>>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl RebuildTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, kb_id: &str) -> RebuildStatus {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(kb_id)
            .cloned()
            .unwrap_or(RebuildStatus::Idle)
    }

    /// Lock a rebuild of `kb_id` holds while it reads and writes the index
    ///
    /// Background and awaited rebuilds take the same lock, so at most one of
    /// them touches a knowledge base's files at a time.
    pub fn kb_lock(&self, kb_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(kb_id.to_string()).or_default().clone()
    }

    /// Start `job` in the background and return its id immediately
    ///
    /// While a rebuild of the same knowledge base is running, its id is
    /// returned instead of starting another one.
    pub fn spawn<F>(&self, kb_id: &str, job: F) -> Result<Uuid>
    where
        F: FnOnce() -> RebuildResult + Send + 'static,
    {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| StratumError::Other(anyhow::anyhow!("no async runtime: {}", e)))?;

        let job_id = {
            let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(RebuildStatus::Running { job_id, .. }) = statuses.get(kb_id) {
                info!("Rebuild of '{}' already running ({})", kb_id, job_id);
                return Ok(*job_id);
            }
            let job_id = Uuid::new_v4();
            statuses.insert(
                kb_id.to_string(),
                RebuildStatus::Running {
                    job_id,
                    started_at: Utc::now(),
                },
            );
            job_id
        };

        let tracker = self.clone();
        let kb_id = kb_id.to_string();
        handle.spawn(async move {
            let result = tokio::task::spawn_blocking(job)
                .await
                .unwrap_or_else(|e| RebuildResult::error(format!("rebuild task failed: {}", e)));
            info!("Rebuild {} of '{}' finished: {}", job_id, kb_id, result.action.as_str());
            tracker
                .statuses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(
                    kb_id,
                    RebuildStatus::Finished {
                        job_id,
                        finished_at: Utc::now(),
                        result,
                    },
                );
        });

        Ok(job_id)
    }
}
